//! Configuration system for the arbiter tool invocation pipeline.
//!
//! Provides TOML-based configuration with:
//! - Global pipeline settings (`[pipeline]`)
//! - Risk and approval policy (`[security]`)
//! - Health monitor tuning (`[health]`)
//! - Remote tool servers (`[[servers]]`)
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, xdg_config_dir,
    xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
