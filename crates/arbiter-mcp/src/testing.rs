//! Scripted in-memory tool servers for tests.
//!
//! Enabled with the `testing` feature.
//!
//! ```rust,ignore
//! use arbiter_mcp::testing::MockServer;
//!
//! let server = MockServer::new().with_text_tool("read_file", "hello");
//! let pool = ConnectionPool::new(registry, Arc::new(server.clone()), 4);
//! server.drop_connection_on_next_call();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{
    self, CallToolParams, CallToolResult, Frame, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, ToolInfo, methods,
};
use crate::server::ServerDescriptor;
use crate::transport::{Connector, MemoryPeer, Transport, memory_pair};

type Handler = Arc<dyn Fn(&Value) -> CallToolResult + Send + Sync>;

struct MockTool {
    info: ToolInfo,
    handler: Handler,
}

struct Live {
    token: CancellationToken,
    notify: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct MockState {
    tools: Mutex<BTreeMap<String, MockTool>>,
    refuse: AtomicBool,
    fail_pings: AtomicBool,
    drop_calls: AtomicU32,
    call_delay: Mutex<Duration>,
    list_delay: Mutex<Duration>,
    attempts: AtomicU32,
    connects: AtomicU32,
    calls: Mutex<Vec<(String, Value)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live: Mutex<Vec<Live>>,
}

/// A scripted tool server reachable through an in-memory transport.
///
/// Clones share state, so a test keeps one handle while the pool owns another.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    /// A server with no tools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool backed by `handler`.
    pub fn with_tool<F>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> CallToolResult + Send + Sync + 'static,
    {
        self.add_tool(name, description, handler);
        self
    }

    /// Add a tool that always answers with `text`.
    pub fn with_text_tool(self, name: &str, text: &str) -> Self {
        self.add_text_tool(name, text);
        self
    }

    /// Add or replace a tool at runtime.
    pub fn add_tool<F>(&self, name: &str, description: &str, handler: F)
    where
        F: Fn(&Value) -> CallToolResult + Send + Sync + 'static,
    {
        let info = ToolInfo {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: Some(json!({"type": "object"})),
        };
        self.state.tools.lock().insert(
            name.to_string(),
            MockTool {
                info,
                handler: Arc::new(handler),
            },
        );
    }

    /// Add a tool that always answers with `text`.
    pub fn add_text_tool(&self, name: &str, text: &str) {
        let text = text.to_string();
        self.add_tool(name, &format!("{} tool", name), move |_| {
            CallToolResult::text(text.clone())
        });
    }

    /// Remove a tool at runtime.
    pub fn remove_tool(&self, name: &str) {
        self.state.tools.lock().remove(name);
    }

    /// Send `notifications/tools/list_changed` on every live connection.
    pub fn notify_tools_changed(&self) {
        let Ok(frame) = protocol::encode(&JsonRpcNotification::new(methods::TOOLS_CHANGED, None))
        else {
            return;
        };
        self.state
            .live
            .lock()
            .retain(|live| live.notify.send(frame.clone()).is_ok());
    }

    /// Refuse new connections.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Answer pings with an error.
    pub fn set_fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection when the next `tools/call` arrives.
    pub fn drop_connection_on_next_call(&self) {
        self.drop_connection_on_next_calls(1);
    }

    /// Drop the connection on each of the next `count` `tools/call` requests.
    pub fn drop_connection_on_next_calls(&self, count: u32) {
        self.state.drop_calls.store(count, Ordering::SeqCst);
    }

    /// Delay every `tools/call` answer.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.state.call_delay.lock() = delay;
    }

    /// Delay every `tools/list` answer.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.state.list_delay.lock() = delay;
    }

    /// Close every live connection.
    pub fn disconnect_all(&self) {
        for live in self.state.live.lock().drain(..) {
            live.token.cancel();
        }
    }

    /// Connections accepted so far.
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connection attempts so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Tool calls received, in arrival order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().clone()
    }

    /// Highest number of tool calls being answered at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn accept(&self, server: &str) -> Transport {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (transport, peer) = memory_pair(server);
        let token = CancellationToken::new();
        let (notify, notifications) = mpsc::unbounded_channel();
        self.state.live.lock().push(Live {
            token: token.clone(),
            notify,
        });
        tokio::spawn(serve(self.state.clone(), peer, notifications, token));
        transport
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Transport> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(McpError::connection(&server.name, "connection refused"));
        }
        Ok(self.accept(&server.name))
    }
}

/// Several mock servers behind one connector, selected by server name.
#[derive(Clone, Default)]
pub struct MockCluster {
    servers: HashMap<String, MockServer>,
}

impl MockCluster {
    /// An empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `name` with `server`.
    pub fn with_server(mut self, name: &str, server: MockServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Handle for `name`.
    pub fn server(&self, name: &str) -> Option<&MockServer> {
        self.servers.get(name)
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Transport> {
        match self.servers.get(&server.name) {
            Some(mock) => mock.connect(server).await,
            None => Err(McpError::connection(&server.name, "no such host")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server loop
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(
    state: Arc<MockState>,
    mut peer: MemoryPeer,
    mut notifications: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            Some(notification) = notifications.recv() => {
                peer.send(notification);
                continue;
            }
            frame = peer.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let request = match protocol::decode(&frame) {
            Ok(Frame::Request(request)) => request,
            _ => continue,
        };

        if request.method == methods::CALL_TOOL {
            let params = request
                .params
                .clone()
                .and_then(|p| serde_json::from_value::<CallToolParams>(p).ok());
            if let Some(params) = &params {
                state
                    .calls
                    .lock()
                    .push((params.name.clone(), params.arguments.clone()));
            }
            let dropping = state
                .drop_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if dropping {
                break;
            }

            let state = state.clone();
            let outgoing = peer.outgoing.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    response = answer_call(&state, request.id, params) => {
                        if let Ok(frame) = protocol::encode(&response) {
                            let _ = outgoing.unbounded_send(frame);
                        }
                    }
                }
            });
            continue;
        }

        let list_delay = *state.list_delay.lock();
        if request.method == methods::LIST_TOOLS && !list_delay.is_zero() {
            let state = state.clone();
            let outgoing = peer.outgoing.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(list_delay) => {
                        if let Ok(frame) = protocol::encode(&answer(&state, &request)) {
                            let _ = outgoing.unbounded_send(frame);
                        }
                    }
                }
            });
            continue;
        }

        let response = answer(&state, &request);
        if let Ok(frame) = protocol::encode(&response) {
            peer.send(frame);
        }
    }
    // stop in-flight answers so the client sees end of stream
    token.cancel();
}

fn answer(state: &MockState, request: &JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        methods::INITIALIZE => JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock", "version": "0.0.0"},
            }),
        ),
        methods::LIST_TOOLS => {
            let tools: Vec<ToolInfo> = state
                .tools
                .lock()
                .values()
                .map(|t| t.info.clone())
                .collect();
            JsonRpcResponse::success(request.id, json!({ "tools": tools }))
        }
        methods::PING if state.fail_pings.load(Ordering::SeqCst) => JsonRpcResponse::failure(
            request.id,
            JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, "unhealthy"),
        ),
        methods::PING => JsonRpcResponse::success(request.id, json!({})),
        other => JsonRpcResponse::failure(
            request.id,
            JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("method '{}' not found", other),
            ),
        ),
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn answer_call(state: &MockState, id: u64, params: Option<CallToolParams>) -> JsonRpcResponse {
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    let _in_flight = InFlight(&state.in_flight);
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);

    let delay = *state.call_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let Some(params) = params else {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "missing tool call parameters"),
        );
    };
    let handler = state
        .tools
        .lock()
        .get(&params.name)
        .map(|t| t.handler.clone());
    match handler {
        Some(handler) => {
            let result = handler(&params.arguments);
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()),
                ),
            }
        }
        None => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(
                JsonRpcError::INVALID_PARAMS,
                format!("unknown tool '{}'", params.name),
            ),
        ),
    }
}
