//! Tool catalog and invocation pipeline.
//!
//! Callers see one flat, name-sorted list of capabilities and one `invoke`.
//! Whether a capability runs in-process or on a remote tool server is decided
//! when it is registered, never at call time.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbiter_gate::AutoDeny;
//! use arbiter_tools::{ToolPipeline, ToolRegistry};
//!
//! let config = arbiter_config::load_config(None)?.config;
//! let pipeline = ToolPipeline::start(&config, Arc::new(ToolRegistry::new()), Arc::new(AutoDeny)).await?;
//!
//! for capability in pipeline.list_capabilities() {
//!     println!("{}: {}", capability.name, capability.description);
//! }
//! let invocation = pipeline.invoke("fs_read_file", args).await?;
//! pipeline.shutdown().await;
//! ```

pub mod catalog;
pub mod error;
pub mod pipeline;
pub mod tool;

pub use catalog::{CatalogEvent, DiscoveryReport, ToolCatalog};
pub use error::{Result, ToolError};
pub use pipeline::{Invocation, ToolPipeline};
pub use tool::{LocalTools, Tool, ToolContext, ToolRegistry};
