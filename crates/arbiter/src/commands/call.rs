//! `arbiter call` - invoke a capability through the permission gate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::style;

use arbiter_tools::{ToolContext, ToolError};
use arbiter_types::{Arguments, ToolResult};

use super::{Context, start_pipeline};
use crate::approval::ConsoleApprovals;

/// Arguments for `arbiter call`.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Capability name, e.g. `fs_read_file`
    pub name: String,

    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Call timeout in seconds (overrides the server's timeout)
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Parse `--args` into an argument map.
pub fn parse_arguments(raw: &str) -> Result<Arguments> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--args is not valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {}", other),
    }
}

/// Run `arbiter call`.
pub async fn run(args: CallArgs, ctx: &Context) -> Result<()> {
    let arguments = parse_arguments(&args.args)?;
    let pipeline = start_pipeline(ctx, Arc::new(ConsoleApprovals::new())).await?;

    let mut tool_ctx = ToolContext::new();
    if let Some(secs) = args.timeout {
        tool_ctx = tool_ctx.with_timeout(Duration::from_secs(secs));
    }
    let cancel = tool_ctx.cancellation.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = pipeline.invoke_with(&args.name, arguments, &tool_ctx).await;
    interrupt.abort();
    pipeline.shutdown().await;

    let invocation = outcome.map_err(describe)?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&invocation)?);
    } else if invocation.result.is_success() {
        if ctx.verbose {
            eprintln!(
                "{} {} ({})",
                style("ran").green(),
                invocation.capability,
                invocation.tier
            );
        }
        println!("{}", invocation.result.to_text());
    }

    if let ToolResult::Error { message, .. } = &invocation.result {
        bail!("{} reported an error: {}", invocation.capability, message);
    }
    Ok(())
}

fn describe(error: ToolError) -> anyhow::Error {
    let kind = error.kind();
    anyhow::Error::new(error).context(format!("call failed ({})", kind))
}
