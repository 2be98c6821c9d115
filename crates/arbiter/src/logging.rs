//! Tracing setup: human console output plus an optional rotating JSON file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use arbiter_config::LoggingConfig;

const VERBOSE_FILTER: &str =
    "arbiter=debug,arbiter_mcp=debug,arbiter_gate=debug,arbiter_tools=debug,arbiter_config=debug,info";
const DEFAULT_FILTER: &str = "arbiter=info,arbiter_mcp=info,arbiter_gate=info,arbiter_tools=info,warn";
const FILE_FILTER: &str =
    "arbiter=trace,arbiter_mcp=trace,arbiter_gate=trace,arbiter_tools=trace,arbiter_config=trace,info";

/// Console filter: `RUST_LOG` wins, then `--verbose`, then `[logging] filter`.
fn console_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directives = match (&config.filter, verbose) {
        (_, true) => VERBOSE_FILTER,
        (Some(filter), false) => filter.as_str(),
        (None, false) => DEFAULT_FILTER,
    };
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?}: {}", directives, e);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must outlive every
/// log call.
pub fn init(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter(config, verbose));

    let (file, guard) = if config.file {
        let log_dir = arbiter_config::xdg_config_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));
        let appender = tracing_appender::rolling::daily(&log_dir, "arbiter.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(FILE_FILTER));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}
