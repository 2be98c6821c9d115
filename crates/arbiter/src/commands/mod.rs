//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use arbiter_config::{ArbiterConfig, load_config, load_config_file};
use arbiter_gate::ApprovalHandler;
use arbiter_tools::{ToolPipeline, ToolRegistry};

pub mod call;
pub mod servers;
pub mod tools;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Loaded configuration.
    pub config: ArbiterConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Load `path` if given, otherwise discover the user and project layers.
pub fn load(path: Option<&Path>) -> Result<ArbiterConfig> {
    match path {
        Some(path) => {
            let config = load_config_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            config.validate().context("invalid configuration")?;
            Ok(config)
        }
        None => Ok(load_config(None).context("failed to load configuration")?.config),
    }
}

/// Start the pipeline with no local tools.
pub async fn start_pipeline(ctx: &Context, approvals: Arc<dyn ApprovalHandler>) -> Result<ToolPipeline> {
    ToolPipeline::start(&ctx.config, Arc::new(ToolRegistry::new()), approvals)
        .await
        .context("failed to start tool pipeline")
}

/// Truncate `s` to `max` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer description", 10), "a longe...");
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pipeline]\nenabled = false\n\n[[servers]]\nname = \"fs\"\nurl = \"ws://localhost:9000\""
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert!(!config.pipeline().enabled);
        assert!(config.server("fs").is_some());
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = load(Some(Path::new("/nonexistent/arbiter.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }
}
