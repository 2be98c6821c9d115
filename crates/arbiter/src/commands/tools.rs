//! `arbiter tools` - every capability, local and remote.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::style;

use arbiter_gate::AutoDeny;
use arbiter_types::ToolDescriptor;

use super::{Context, start_pipeline, truncate};

/// Arguments for `arbiter tools`.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Only list tools from this server
    #[arg(long)]
    pub server: Option<String>,
}

/// Run `arbiter tools`.
pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let pipeline = start_pipeline(ctx, Arc::new(AutoDeny)).await?;
    let mut capabilities = pipeline.list_capabilities();
    pipeline.shutdown().await;

    if let Some(server) = &args.server {
        capabilities.retain(|d| d.server() == Some(server.as_str()));
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
        return Ok(());
    }

    if capabilities.is_empty() {
        println!("No capabilities available.");
        return Ok(());
    }

    print_table(&capabilities, ctx.verbose)?;
    Ok(())
}

fn print_table(capabilities: &[ToolDescriptor], verbose: bool) -> Result<()> {
    println!("{:<32} {:<16} {:<12} {}", "NAME", "SOURCE", "CATEGORY", "DESCRIPTION");
    println!("{}", "-".repeat(100));

    for descriptor in capabilities {
        let source = descriptor.server().unwrap_or("local");
        println!(
            "{:<32} {:<16} {:<12} {}",
            style(truncate(&descriptor.name, 32)).cyan(),
            truncate(source, 16),
            descriptor.category.to_string(),
            truncate(&descriptor.description, 60)
        );
        if verbose {
            let schema = serde_json::to_string_pretty(&descriptor.parameters)?;
            for line in schema.lines() {
                println!("    {}", style(line).dim());
            }
        }
    }
    Ok(())
}
