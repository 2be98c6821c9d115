//! `arbiter servers` - configured servers and their connection status.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::style;

use arbiter_gate::AutoDeny;
use arbiter_mcp::{ConnectionState, ServerStatus};

use super::{Context, start_pipeline, truncate};

/// Arguments for `arbiter servers`.
#[derive(Args, Debug)]
pub struct ServersArgs {
    /// Only list servers that are currently connected
    #[arg(long)]
    pub connected: bool,
}

/// Run `arbiter servers`.
pub async fn run(args: ServersArgs, ctx: &Context) -> Result<()> {
    let pipeline = start_pipeline(ctx, Arc::new(AutoDeny)).await?;
    let mut statuses = pipeline.servers();
    pipeline.shutdown().await;

    if args.connected {
        statuses.retain(|s| s.state == ConnectionState::Connected);
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        if pipeline.is_enabled() {
            println!("No tool servers configured.");
        } else {
            println!("Remote tools are disabled ([pipeline] enabled = false).");
        }
        return Ok(());
    }

    print_table(&statuses, ctx.verbose);
    Ok(())
}

fn print_table(statuses: &[ServerStatus], verbose: bool) {
    println!("{:<20} {:<14} {:<40}", "NAME", "STATE", "TARGET");
    println!("{}", "-".repeat(76));

    for status in statuses {
        let state = if !status.enabled {
            style("disabled".to_string()).dim()
        } else {
            match status.state {
                ConnectionState::Connected => style(status.state.to_string()).green(),
                ConnectionState::Failed => style(status.state.to_string()).red(),
                _ => style(status.state.to_string()).yellow(),
            }
        };
        println!(
            "{:<20} {:<14} {:<40}",
            truncate(&status.name, 20),
            state,
            truncate(&status.target, 40)
        );

        if verbose {
            if let Some(seen) = status.last_seen {
                println!("  last seen: {}", seen.to_rfc3339());
            }
            if status.consecutive_failures > 0 {
                println!("  failures:  {}", status.consecutive_failures);
            }
            if let Some(error) = &status.last_error {
                println!("  error:     {}", style(error).red());
            }
        }
    }
}
