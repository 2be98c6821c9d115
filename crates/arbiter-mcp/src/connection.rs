//! A single persistent connection to one remote tool server.
//!
//! Each [`Connection`] owns a background I/O task that is the only reader of
//! the transport. Callers enqueue encoded frames and wait on a one-shot slot in
//! the pending-call table; the I/O task fills the slot when the matching
//! response arrives. When the transport drops, every outstanding slot is
//! failed with the same error so no caller is left waiting.
//!
//! ```text
//!  call() ──► pending.register(id) ──► outbound queue ──► I/O task ──► sink
//!     ▲                                                      │
//!     └──────────── pending.resolve(id) ◄── decode ◄─────────┴──── stream
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{
    self, CallToolParams, CallToolResult, Frame, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    ServerInfo, ToolInfo, methods,
};
use crate::server::ServerDescriptor;
use crate::transport::{Connector, FrameSink, Transport};

/// Notifications buffered per subscriber before it starts lagging.
const NOTIFICATION_BUFFER: usize = 64;

/// Time allowed for the shutdown notice on close.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a connection or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live transport.
    Disconnected,
    /// Transport open, handshake in progress.
    Connecting,
    /// Handshake complete; calls are accepted.
    Connected,
    /// A lost connection is being re-established.
    Reconnecting,
    /// Retries or health probes gave up on the server.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending calls
// ─────────────────────────────────────────────────────────────────────────────

type Slot = oneshot::Sender<Result<Value>>;

/// Correlation id → single-assignment result slot.
///
/// An entry leaves the table exactly once: resolved by a response, failed by
/// [`PendingCalls::fail_all`], or removed by the caller's guard on timeout or
/// cancellation. Once the table is failed it refuses new registrations.
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    calls: HashMap<u64, Slot>,
    closed: Option<McpError>,
}

impl PendingCalls {
    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let (tx, rx) = oneshot::channel();
        let previous = inner.calls.insert(id, tx);
        debug_assert!(previous.is_none(), "correlation id {} reused", id);
        Ok(rx)
    }

    fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let slot = self.inner.lock().calls.remove(&id);
        match slot {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.inner.lock().calls.remove(&id).is_some()
    }

    fn fail_all(&self, err: McpError) -> usize {
        let drained: Vec<Slot> = {
            let mut inner = self.inner.lock();
            inner.closed.get_or_insert_with(|| err.clone());
            inner.calls.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(err.clone()));
        }
        count
    }

    fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

/// Removes a pending entry on every exit path of a call.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// One handshaken connection to a remote tool server.
///
/// Never retries on its own; reconnection belongs to the pool.
pub struct Connection {
    server: String,
    timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<PendingCalls>,
    outbound: mpsc::UnboundedSender<String>,
    state: Arc<watch::Sender<ConnectionState>>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    io_task: Mutex<Option<JoinHandle<()>>>,
    server_info: Option<ServerInfo>,
    tools: Vec<ToolInfo>,
}

impl Connection {
    /// Connect to `descriptor` and run the capability handshake.
    ///
    /// The connection is `Connected` only once `initialize` and an initial
    /// `tools/list` round trip have both succeeded.
    pub async fn open(descriptor: &ServerDescriptor, connector: &dyn Connector) -> Result<Self> {
        let name = descriptor.name.as_str();
        tracing::debug!(server = %name, target = %descriptor.target, "opening connection");

        let transport =
            match tokio::time::timeout(descriptor.timeout, connector.connect(descriptor)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(McpError::Connection { server, message })) => {
                    return Err(McpError::Connection { server, message });
                }
                Ok(Err(e)) => return Err(McpError::connection(name, e.to_string())),
                Err(_) => {
                    return Err(McpError::connection(
                        name,
                        format!("connect timed out after {:?}", descriptor.timeout),
                    ));
                }
            };

        let mut conn = Self::start(name.to_string(), descriptor.timeout, transport);
        match conn.handshake().await {
            Ok(()) => {
                conn.state.send_replace(ConnectionState::Connected);
                tracing::info!(
                    server = %name,
                    tool_count = conn.tools.len(),
                    server_name = conn.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or(""),
                    "connected"
                );
                Ok(conn)
            }
            Err(e) => {
                conn.close().await;
                Err(McpError::connection(name, format!("handshake failed: {}", e)))
            }
        }
    }

    fn start(server: String, timeout: Duration, transport: Transport) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingCalls::default());
        let state = Arc::new(watch::channel(ConnectionState::Connecting).0);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let io = IoLoop {
            server: server.clone(),
            pending: pending.clone(),
            state: state.clone(),
            notifications: notifications.clone(),
            shutdown: shutdown.clone(),
            closed: closed.clone(),
        };
        let handle = tokio::spawn(io.run(transport, outbound_rx));

        Self {
            server,
            timeout,
            next_id: AtomicU64::new(1),
            pending,
            outbound: outbound_tx,
            state,
            notifications,
            shutdown,
            closed,
            io_task: Mutex::new(Some(handle)),
            server_info: None,
            tools: Vec::new(),
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let init = self
            .request(methods::INITIALIZE, Some(params), self.timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(init)
            .map_err(|e| McpError::protocol(format!("invalid initialize result: {}", e)))?;

        self.notify(methods::INITIALIZED, None)?;

        let listed = self
            .request(methods::LIST_TOOLS, None, self.timeout)
            .await?;
        let listed: ListToolsResult = serde_json::from_value(listed)?;

        self.server_info = init.server_info;
        self.tools = listed.tools;
        Ok(())
    }

    /// Server name.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether calls are accepted.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the I/O task has stopped for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Server info reported during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Tool catalog returned during the handshake.
    pub fn handshake_tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    /// Default per-call timeout for this server.
    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with `Connection` when not connected, `Timeout` when no response
    /// arrives in time, and `ConnectionLost` when the transport drops first.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(McpError::connection(
                &self.server,
                format!("not connected (state: {})", state),
            ));
        }
        self.request(method, params, timeout).await
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = protocol::encode(&JsonRpcRequest::new(id, method, params))?;

        let rx = self.pending.register(id)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        tracing::trace!(server = %self.server, id, method = %method, "sending request");
        self.outbound
            .send(frame)
            .map_err(|_| McpError::lost(&self.server))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::lost(&self.server)),
            Err(_) => {
                tracing::debug!(server = %self.server, id, method = %method, "request timed out");
                Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = protocol::encode(&JsonRpcNotification::new(method, params))?;
        self.outbound
            .send(frame)
            .map_err(|_| McpError::lost(&self.server))
    }

    /// Liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.call(methods::PING, None, timeout).await.map(|_| ())
    }

    /// Query the server's tool catalog.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolInfo>> {
        let value = self.call(methods::LIST_TOOLS, None, timeout).await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        tracing::debug!(server = %self.server, tool_count = result.tools.len(), "listed tools");
        Ok(result.tools)
    }

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })?;
        let value = self.call(methods::CALL_TOOL, Some(params), timeout).await?;
        let result: CallToolResult = serde_json::from_value(value)?;
        tracing::debug!(
            server = %self.server,
            tool = %tool,
            is_error = result.is_error(),
            "called tool"
        );
        Ok(result)
    }

    /// Inbound notifications from this point on, ending when the connection closes.
    ///
    /// Each call starts an independent subscription.
    pub fn notifications(&self) -> impl Stream<Item = JsonRpcNotification> + Send + 'static {
        let mut rx = self.notifications.subscribe();
        let closed = self.closed.clone();
        let server = self.server.clone();
        async_stream::stream! {
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = closed.cancelled() => break,
                };
                match received {
                    Ok(notification) => yield notification,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(server = %server, skipped, "notification subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Cancel pending calls with `ConnectionClosed`, release the transport and
    /// move to `Disconnected`.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.io_task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(server = %self.server, error = %e, "connection task ended abnormally");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O task
// ─────────────────────────────────────────────────────────────────────────────

enum Exit {
    Closed,
    Lost(McpError),
}

struct IoLoop {
    server: String,
    pending: Arc<PendingCalls>,
    state: Arc<watch::Sender<ConnectionState>>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl IoLoop {
    async fn run(self, transport: Transport, mut outbound: mpsc::UnboundedReceiver<String>) {
        let (mut sink, mut stream) = transport.into_parts();

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Exit::Closed,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            break Exit::Lost(e);
                        }
                    }
                    None => break Exit::Closed,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        if let Err(e) = self.dispatch(&text, &mut sink).await {
                            break Exit::Lost(e);
                        }
                    }
                    Some(Err(McpError::Protocol(message))) => {
                        tracing::warn!(server = %self.server, error = %message, "dropping malformed frame");
                    }
                    Some(Err(e)) => break Exit::Lost(e),
                    None => break Exit::Lost(McpError::lost(&self.server)),
                },
            }
        };

        match exit {
            Exit::Closed => {
                if let Ok(frame) =
                    protocol::encode(&JsonRpcNotification::new(methods::SHUTDOWN, None))
                {
                    let _ = tokio::time::timeout(SHUTDOWN_GRACE, sink.send(frame)).await;
                }
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, sink.close()).await;
                self.state.send_replace(ConnectionState::Disconnected);
                let cancelled = self.pending.fail_all(McpError::closed(&self.server));
                tracing::debug!(server = %self.server, cancelled, "connection closed");
            }
            Exit::Lost(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                let failed = self.pending.fail_all(McpError::lost(&self.server));
                tracing::warn!(server = %self.server, error = %e, failed, "connection lost");
            }
        }
        self.closed.cancel();
    }

    async fn dispatch(&self, text: &str, sink: &mut FrameSink) -> Result<()> {
        match protocol::decode(text) {
            Ok(Frame::Response(response)) => {
                let id = response.id;
                let outcome = response.into_result().map_err(McpError::from);
                if !self.pending.resolve(id, outcome) {
                    tracing::debug!(server = %self.server, id, "dropping response for unknown id");
                }
            }
            Ok(Frame::Notification(notification)) => {
                tracing::debug!(server = %self.server, method = %notification.method, "notification");
                let _ = self.notifications.send(notification);
            }
            Ok(Frame::Request(request)) => {
                let response = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    JsonRpcResponse::failure(
                        request.id,
                        JsonRpcError::new(
                            JsonRpcError::METHOD_NOT_FOUND,
                            format!("method '{}' is not supported by this client", request.method),
                        ),
                    )
                };
                sink.send(protocol::encode(&response)?).await?;
            }
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "dropping malformed frame");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;
    use crate::transport::{MemoryPeer, memory_pair};
    use proptest::prelude::*;
    use serde_json::json;

    /// Connector that hands out one prepared transport.
    struct OneShot(Mutex<Option<Transport>>);

    #[async_trait::async_trait]
    impl Connector for OneShot {
        async fn connect(&self, server: &ServerDescriptor) -> Result<Transport> {
            self.0
                .lock()
                .take()
                .ok_or_else(|| McpError::connection(&server.name, "already used"))
        }
    }

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor::websocket("fs", "ws://unused").with_timeout(Duration::from_secs(5))
    }

    fn request_of(frame: &str) -> JsonRpcRequest {
        match protocol::decode(frame).unwrap() {
            Frame::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    /// Answer the handshake on `peer`.
    async fn serve_handshake(peer: &mut MemoryPeer) {
        let init = request_of(&peer.recv().await.unwrap());
        assert_eq!(init.method, methods::INITIALIZE);
        peer.send(
            protocol::encode(&JsonRpcResponse::success(
                init.id,
                json!({"serverInfo": {"name": "fake", "version": "1"}}),
            ))
            .unwrap(),
        );
        let initialized = peer.recv().await.unwrap();
        assert!(initialized.contains(methods::INITIALIZED));
        let list = request_of(&peer.recv().await.unwrap());
        assert_eq!(list.method, methods::LIST_TOOLS);
        peer.send(
            protocol::encode(&JsonRpcResponse::success(
                list.id,
                json!({"tools": [{"name": "read_file"}]}),
            ))
            .unwrap(),
        );
    }

    async fn open_with_peer() -> (Connection, MemoryPeer) {
        let (transport, mut peer) = memory_pair("fs");
        let connector = OneShot(Mutex::new(Some(transport)));
        let desc = descriptor();
        let (conn, ()) = tokio::join!(Connection::open(&desc, &connector), serve_handshake(&mut peer));
        (conn.unwrap(), peer)
    }

    #[tokio::test]
    async fn test_open_runs_handshake() {
        let (conn, _peer) = open_with_peer().await;
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.server_info().unwrap().name, "fake");
        assert_eq!(conn.handshake_tools()[0].name, "read_file");
    }

    #[tokio::test]
    async fn test_open_fails_when_handshake_rejected() {
        let (transport, mut peer) = memory_pair("fs");
        let connector = OneShot(Mutex::new(Some(transport)));
        let desc = descriptor();
        let reject = async {
            let init = request_of(&peer.recv().await.unwrap());
            peer.send(
                protocol::encode(&JsonRpcResponse::failure(
                    init.id,
                    JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, "boom"),
                ))
                .unwrap(),
            );
        };
        let (result, ()) = tokio::join!(Connection::open(&desc, &connector), reject);
        let err = result.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert!(err.to_string().contains("handshake failed"));
    }

    #[tokio::test]
    async fn test_open_fails_on_malformed_initialize_result() {
        let (transport, mut peer) = memory_pair("fs");
        let connector = OneShot(Mutex::new(Some(transport)));
        let desc = descriptor();
        let malformed = async {
            let init = request_of(&peer.recv().await.unwrap());
            peer.send(
                protocol::encode(&JsonRpcResponse::success(
                    init.id,
                    json!({"serverInfo": "not an object"}),
                ))
                .unwrap(),
            );
            // nothing but the end of the connection follows
            peer.recv().await
        };
        let (result, after) = tokio::join!(Connection::open(&desc, &connector), malformed);
        let err = result.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert!(err.to_string().contains("invalid initialize result"));
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn test_open_refused() {
        let server = MockServer::new();
        server.set_refuse_connections(true);
        let err = Connection::open(&descriptor(), &server).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out() {
        struct Hang;
        #[async_trait::async_trait]
        impl Connector for Hang {
            async fn connect(&self, _server: &ServerDescriptor) -> Result<Transport> {
                futures::future::pending().await
            }
        }
        let err = Connection::open(&descriptor(), &Hang).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (conn, mut peer) = open_with_peer().await;
        let call = conn.call("echo", Some(json!({"x": 1})), Duration::from_secs(1));
        let answer = async {
            let request = request_of(&peer.recv().await.unwrap());
            assert_eq!(request.params, Some(json!({"x": 1})));
            peer.send(protocol::encode(&JsonRpcResponse::success(request.id, json!("pong"))).unwrap());
        };
        let (result, ()) = tokio::join!(call, answer);
        assert_eq!(result.unwrap(), json!("pong"));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let (conn, mut peer) = open_with_peer().await;
        let call = conn.call("nope", None, Duration::from_secs(1));
        let answer = async {
            let request = request_of(&peer.recv().await.unwrap());
            peer.send(
                protocol::encode(&JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, "no such method"),
                ))
                .unwrap(),
            );
        };
        let (result, ()) = tokio::join!(call, answer);
        assert!(matches!(result.unwrap_err(), McpError::ServerError { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (conn, mut peer) = open_with_peer().await;
        let call = conn.call("echo", None, Duration::from_secs(1));
        let answer = async {
            let request = request_of(&peer.recv().await.unwrap());
            peer.send("{not json");
            peer.send(r#"{"jsonrpc":"2.0","id":9999,"result":{}}"#);
            peer.send(protocol::encode(&JsonRpcResponse::success(request.id, json!(1))).unwrap());
        };
        let (result, ()) = tokio::join!(call, answer);
        assert_eq!(result.unwrap(), json!(1));
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_removes_pending() {
        let (conn, _peer) = open_with_peer().await;
        let err = conn
            .call("slow", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(conn.pending_calls(), 0);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_connection_drop_fails_every_pending_call() {
        let (conn, mut peer) = open_with_peer().await;
        let calls = async {
            tokio::join!(
                conn.call("a", None, Duration::from_secs(5)),
                conn.call("b", None, Duration::from_secs(5)),
                conn.call("c", None, Duration::from_secs(5)),
            )
        };
        let drop_after_three = async move {
            for _ in 0..3 {
                peer.recv().await.unwrap();
            }
            drop(peer);
        };
        let ((a, b, c), ()) = tokio::join!(calls, drop_after_three);
        for result in [a, b, c] {
            assert!(matches!(result.unwrap_err(), McpError::ConnectionLost { .. }));
        }
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_rejects_without_pending() {
        let (conn, _peer) = open_with_peer().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn.call("echo", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_with_closed() {
        let (conn, mut peer) = open_with_peer().await;
        let call = conn.call("slow", None, Duration::from_secs(30));
        let close = async {
            peer.recv().await.unwrap();
            conn.close().await;
        };
        let (result, ()) = tokio::join!(call, close);
        assert!(matches!(result.unwrap_err(), McpError::ConnectionClosed { .. }));

        let shutdown = peer.recv().await.unwrap();
        assert!(shutdown.contains(methods::SHUTDOWN));
    }

    #[tokio::test]
    async fn test_cancelled_call_leaves_no_pending_entry() {
        let (conn, mut peer) = open_with_peer().await;
        {
            let call = conn.call("slow", None, Duration::from_secs(30));
            tokio::pin!(call);
            tokio::select! {
                _ = &mut call => panic!("call should still be pending"),
                frame = peer.recv() => assert!(frame.is_some()),
            }
            assert_eq!(conn.pending_calls(), 1);
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_ping_request_is_answered() {
        let (_conn, mut peer) = open_with_peer().await;
        peer.send(r#"{"jsonrpc":"2.0","id":77,"method":"ping"}"#);
        let reply = peer.recv().await.unwrap();
        match protocol::decode(&reply).unwrap() {
            Frame::Response(response) => {
                assert_eq!(response.id, 77);
                assert!(!response.is_error());
            }
            other => panic!("expected response, got {:?}", other),
        }

        peer.send(r#"{"jsonrpc":"2.0","id":78,"method":"sampling/createMessage"}"#);
        let reply = peer.recv().await.unwrap();
        assert!(reply.contains("-32601"));
    }

    #[tokio::test]
    async fn test_notifications_stream() {
        let (conn, peer) = open_with_peer().await;
        let mut first = Box::pin(conn.notifications());
        let mut second = Box::pin(conn.notifications());

        peer.send(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#);
        assert_eq!(first.next().await.unwrap().method, methods::TOOLS_CHANGED);
        assert_eq!(second.next().await.unwrap().method, methods::TOOLS_CHANGED);

        drop(peer);
        assert!(first.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (conn, mut peer) = open_with_peer().await;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let call = conn.call("echo", None, Duration::from_secs(1));
            let answer = async {
                let request = request_of(&peer.recv().await.unwrap());
                assert!(seen.insert(request.id));
                peer.send(protocol::encode(&JsonRpcResponse::success(request.id, json!(null))).unwrap());
            };
            let (result, ()) = tokio::join!(call, answer);
            result.unwrap();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Exactly-once resolution
    // ─────────────────────────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum Fate {
        /// Answer after this many milliseconds.
        Respond(u64),
        /// Never answer; the call times out.
        Ignore,
    }

    fn fate_strategy() -> impl Strategy<Value = Fate> {
        prop_oneof![(0u64..200).prop_map(Fate::Respond), Just(Fate::Ignore)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Every call finishes with exactly one outcome and leaves no entry behind,
        /// whatever the interleaving of responses, timeouts and a connection drop.
        #[test]
        fn pending_calls_resolve_exactly_once(
            fates in prop::collection::vec(fate_strategy(), 1..12),
            timeout_ms in 50u64..250,
            drop_at in prop::option::of(0u64..300),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async move {
                let (conn, mut peer) = open_with_peer().await;
                let conn = Arc::new(conn);
                let count = fates.len();

                let server = tokio::spawn(async move {
                    let started = tokio::time::Instant::now();
                    let mut index = 0;
                    let mut replies = tokio::task::JoinSet::new();
                    let outgoing = peer.outgoing.clone();
                    while index < count {
                        let frame = match drop_at {
                            Some(at) => {
                                let deadline = started + Duration::from_millis(at);
                                match tokio::time::timeout_at(deadline, peer.recv()).await {
                                    Ok(frame) => frame,
                                    Err(_) => break,
                                }
                            }
                            None => peer.recv().await,
                        };
                        let Some(frame) = frame else { break };
                        let request = request_of(&frame);
                        let position: usize = request.method.parse().unwrap();
                        if let Fate::Respond(delay) = fates[position] {
                            let outgoing = outgoing.clone();
                            replies.spawn(async move {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                let response = JsonRpcResponse::success(request.id, json!(position));
                                let _ = outgoing.unbounded_send(protocol::encode(&response).unwrap());
                            });
                        }
                        index += 1;
                    }
                    if let Some(at) = drop_at {
                        tokio::time::sleep_until(started + Duration::from_millis(at)).await;
                        replies.abort_all();
                        drop(outgoing);
                        drop(peer);
                    } else {
                        while replies.join_next().await.is_some() {}
                        // keep the transport alive until every call has finished
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        drop(peer);
                    }
                });

                let mut calls = tokio::task::JoinSet::new();
                for position in 0..count {
                    let conn = conn.clone();
                    calls.spawn(async move {
                        let outcome = conn
                            .call(&position.to_string(), None, Duration::from_millis(timeout_ms))
                            .await;
                        (position, outcome)
                    });
                }

                let mut finished = vec![0u32; count];
                while let Some(joined) = calls.join_next().await {
                    let (position, outcome) = joined.unwrap();
                    finished[position] += 1;
                    match outcome {
                        Ok(value) => assert_eq!(value, json!(position)),
                        Err(McpError::Timeout { .. }) | Err(McpError::ConnectionLost { .. }) => {}
                        Err(other) => panic!("unexpected outcome {:?}", other),
                    }
                }

                assert!(finished.iter().all(|&n| n == 1));
                assert_eq!(conn.pending_calls(), 0);
                server.abort();
            });
        }
    }

    #[test]
    fn test_pending_table_fail_all_blocks_registration() {
        let pending = PendingCalls::default();
        let mut rx = pending.register(1).unwrap();
        assert_eq!(pending.fail_all(McpError::lost("fs")), 1);
        assert!(matches!(rx.try_recv(), Ok(Err(McpError::ConnectionLost { .. }))));
        assert!(!pending.resolve(1, Ok(Value::Null)));
        assert!(matches!(pending.register(2), Err(McpError::ConnectionLost { .. })));
        assert_eq!(pending.len(), 0);
    }
}
