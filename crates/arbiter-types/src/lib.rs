//! Shared capability types for the arbiter tool invocation pipeline.
//!
//! Local and remote tools are described by the same [`ToolDescriptor`] shape so
//! that the permission gate and the catalog never need to know where a
//! capability is implemented.

pub mod descriptor;
pub mod kind;
pub mod result;

pub use descriptor::{Arguments, ToolCategory, ToolDescriptor, ToolOrigin, ToolRequest, namespaced};
pub use kind::ErrorKind;
pub use result::ToolResult;
