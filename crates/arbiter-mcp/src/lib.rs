//! Client side of the remote tool server protocol.
//!
//! Connects to tool servers over WebSocket or stdio, keeps one persistent
//! connection per server, and watches their health.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConnectionPool                                             │
//! │  - one live Connection per server, shared connect attempts  │
//! │  - retry with backoff, one reconnect on a mid-call drop     │
//! │  - FIFO admission bound on in-flight calls                  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                  ▲
//!          ▼                                  │ probe
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │  Connection               │   │  HealthMonitor            │
//! │  - I/O task per transport │   │  - one loop per server    │
//! │  - pending-call table     │   │  - threshold → Failed     │
//! │  - notification stream    │   │  - recovery → Available   │
//! └───────────────────────────┘   └───────────────────────────┘
//!          │                                  │
//!          ▼                                  ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │  Transport                │   │  ServerRegistry           │
//! │  - WebSocket / stdio      │   │  - status per server      │
//! │  - in-memory for tests    │   │  - ServerEvent bus        │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbiter_mcp::{ConnectionPool, DefaultConnector, ServerDescriptor, ServerRegistry};
//!
//! let registry = Arc::new(ServerRegistry::new([
//!     ServerDescriptor::websocket("fs", "ws://localhost:8765"),
//! ]));
//! let pool = ConnectionPool::new(registry, Arc::new(DefaultConnector), 8);
//!
//! let tools = pool.list_tools("fs").await?;
//! let result = pool
//!     .call_tool("fs", "read_file", json!({"path": "a.txt"}), None)
//!     .await?;
//! ```

pub mod connection;
pub mod error;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{Connection, ConnectionState};
pub use error::{McpError, Result};
pub use health::{HealthMonitor, ProbeOutcome};
pub use pool::ConnectionPool;
pub use protocol::{CallToolResult, JsonRpcNotification, ServerInfo, ToolContent, ToolInfo};
pub use registry::{ServerEvent, ServerRegistry, ServerStatus};
pub use server::{Backoff, ServerDescriptor, Target};
pub use transport::{Connector, DefaultConnector, Transport};
