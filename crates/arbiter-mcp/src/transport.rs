//! Transport layer: a text frame sink plus a text frame stream.
//!
//! Two wire transports are supported:
//! - WebSocket (one JSON message per text frame)
//! - stdio child process with Content-Length framing
//!
//! An in-memory pair is available for tests and embedding.

use std::pin::Pin;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use url::Url;

use crate::error::{McpError, Result};
use crate::server::{ServerDescriptor, Target};

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = McpError> + Send>>;

/// Inbound half of a transport.
///
/// `Err(McpError::Protocol)` items are recoverable; any other error ends the
/// connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An established transport.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    /// Assemble a transport from its halves.
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    /// Split into halves.
    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Establishes transports for server descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `server`.
    async fn connect(&self, server: &ServerDescriptor) -> Result<Transport>;
}

/// Connector for the wire transports named by [`Target`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Transport> {
        match &server.target {
            Target::WebSocket { url, headers } => {
                connect_websocket(&server.name, url, headers).await
            }
            Target::Stdio { command, args, env } => {
                spawn_stdio(&server.name, command, args, env)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// Normalize a configured address to a WebSocket URL.
///
/// `http` becomes `ws`, `https` becomes `wss`, and a bare `host:port` is
/// treated as `ws://host:port`.
pub fn normalize_ws_url(address: &str) -> std::result::Result<Url, String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("empty address".to_string());
    }
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };

    let mut url =
        Url::parse(&candidate).map_err(|e| format!("invalid address '{}': {}", address, e))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(format!("unsupported URL scheme '{}'", other)),
    };
    url.set_scheme(scheme)
        .map_err(|_| format!("cannot use scheme '{}' for '{}'", scheme, address))?;

    Ok(url)
}

/// Connect to a WebSocket server.
pub async fn connect_websocket(
    server: &str,
    address: &str,
    headers: &[(String, String)],
) -> Result<Transport> {
    let url = normalize_ws_url(address).map_err(|e| McpError::connection(server, e))?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| McpError::connection(server, e.to_string()))?;
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| McpError::connection(server, format!("invalid header '{}': {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::connection(server, format!("invalid header '{}': {}", key, e)))?;
        request.headers_mut().insert(name, value);
    }

    let (ws_stream, _response) = connect_async(request)
        .await
        .map_err(|e| McpError::connection(server, e.to_string()))?;

    tracing::debug!(server = %server, url = %url, "websocket connected");

    let (ws_sink, mut ws_read) = ws_stream.split();

    let sink_server = server.to_string();
    let sink = ws_sink
        .sink_map_err(move |_| McpError::lost(&sink_server))
        .with(|text: String| async move { Ok::<_, McpError>(Message::Text(text.into())) });

    let server = server.to_string();
    let stream = async_stream::stream! {
        while let Some(message) = ws_read.next().await {
            match message {
                Ok(Message::Text(text)) => yield Ok(text.to_string()),
                Ok(Message::Binary(bytes)) => {
                    yield String::from_utf8(bytes.to_vec())
                        .map_err(|e| McpError::protocol(format!("binary frame is not UTF-8: {}", e)));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "websocket read failed");
                    yield Err(McpError::lost(&server));
                    break;
                }
            }
        }
    };

    Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
}

// ─────────────────────────────────────────────────────────────────────────────
// stdio
// ─────────────────────────────────────────────────────────────────────────────

/// Largest accepted Content-Length body.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Spawn a child process and talk Content-Length framed JSON-RPC over its stdio.
///
/// The child is killed when the inbound stream is dropped.
pub fn spawn_stdio(
    server: &str,
    command: &str,
    args: &[String],
    env: &[(String, String)],
) -> Result<Transport> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| {
        McpError::connection(server, format!("failed to spawn '{}': {}", command, e))
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::connection(server, "failed to capture stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::connection(server, "failed to capture stdout"))?;

    tracing::debug!(server = %server, command = %command, "spawned stdio server");

    let sink_server = server.to_string();
    let sink = futures::sink::unfold(stdin, move |mut stdin, json: String| {
        let server = sink_server.clone();
        async move {
            let header = format!("Content-Length: {}\r\n\r\n", json.len());
            let write = async {
                stdin.write_all(header.as_bytes()).await?;
                stdin.write_all(json.as_bytes()).await?;
                stdin.flush().await
            };
            write.await.map_err(|_| McpError::lost(&server))?;
            tracing::trace!(content_length = json.len(), json = %json, "sent frame");
            Ok::<_, McpError>(stdin)
        }
    });

    let server = server.to_string();
    let stream = async_stream::stream! {
        let _child = child;
        let mut stdout = BufReader::new(stdout);
        loop {
            match read_framed(&mut stdout).await {
                Ok(Some(body)) => yield frame_text(body),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stdio read failed");
                    yield Err(McpError::lost(&server));
                    break;
                }
            }
        }
    };

    Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
}

/// Read one Content-Length framed message body. `Ok(None)` on clean EOF.
async fn read_framed<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some((name, value)) = trimmed.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            let len = value.trim().parse::<usize>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid Content-Length: {}", e),
                )
            })?;
            content_length = Some(len);
        }
    }

    let len = content_length.unwrap_or_default();
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// A frame body as text. The frame was consumed whole, so a bad body is
/// recoverable.
fn frame_text(body: Vec<u8>) -> Result<String> {
    let len = body.len();
    let json = String::from_utf8(body)
        .map_err(|e| McpError::protocol(format!("frame is not valid UTF-8: {}", e)))?;
    tracing::trace!(content_length = len, json = %json, "received frame");
    Ok(json)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// The far end of an in-memory transport.
pub struct MemoryPeer {
    /// Frames sent by the connection.
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Frames delivered to the connection.
    pub outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next frame sent by the connection, `None` once it has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Deliver a frame to the connection. Returns false if it has gone away.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.outgoing.unbounded_send(frame.into()).is_ok()
    }
}

/// Create a connected in-memory transport and its peer.
///
/// Dropping the peer looks like a lost connection to the transport side.
pub fn memory_pair(server: &str) -> (Transport, MemoryPeer) {
    let (to_peer, incoming) = mpsc::unbounded::<String>();
    let (outgoing, from_peer) = mpsc::unbounded::<String>();

    let server = server.to_string();
    let sink = to_peer.sink_map_err(move |_| McpError::lost(&server));
    let stream = from_peer.map(Ok::<String, McpError>);

    (
        Transport::new(Box::pin(sink), Box::pin(stream)),
        MemoryPeer { incoming, outgoing },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ws_url() {
        assert_eq!(
            normalize_ws_url("http://localhost:8080/mcp").unwrap().as_str(),
            "ws://localhost:8080/mcp"
        );
        assert_eq!(
            normalize_ws_url("https://tools.example.com").unwrap().as_str(),
            "wss://tools.example.com/"
        );
        assert_eq!(
            normalize_ws_url("localhost:9000").unwrap().as_str(),
            "ws://localhost:9000/"
        );
        assert_eq!(
            normalize_ws_url("wss://a.example/x").unwrap().as_str(),
            "wss://a.example/x"
        );
    }

    #[test]
    fn test_normalize_ws_url_rejects() {
        assert!(normalize_ws_url("").is_err());
        assert!(normalize_ws_url("ftp://example.com").is_err());
    }

    #[tokio::test]
    async fn test_read_framed() {
        let data = b"Content-Length: 13\r\n\r\n{\"id\":1,\"a\":2}Content-Length: 2\r\n\r\n{}";
        // body is one byte longer than declared
        let mut reader = BufReader::new(&data[..]);
        let first = read_framed(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame_text(first).unwrap(), "{\"id\":1,\"a\":2");
    }

    #[tokio::test]
    async fn test_read_framed_sequence_and_eof() {
        let data = b"content-length: 2\r\n\r\n{}Content-Length: 7\r\nX-Other: 1\r\n\r\n{\"a\":1}";
        let mut reader = BufReader::new(&data[..]);
        assert_eq!(read_framed(&mut reader).await.unwrap().unwrap(), b"{}");
        assert_eq!(read_framed(&mut reader).await.unwrap().unwrap(), b"{\"a\":1}");
        assert!(read_framed(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_framed_bad_length() {
        let data = b"Content-Length: nope\r\n\r\n{}";
        let mut reader = BufReader::new(&data[..]);
        assert!(read_framed(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_frame_is_protocol_error() {
        let data = b"Content-Length: 4\r\n\r\n\"\xff\"}Content-Length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(&data[..]);
        let bad = read_framed(&mut reader).await.unwrap().unwrap();
        let err = frame_text(bad).unwrap_err();
        assert!(matches!(err, McpError::Protocol(ref msg) if msg.contains("UTF-8")));
        // the stream stays aligned on the next frame
        let next = read_framed(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame_text(next).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_memory_pair() {
        let (transport, mut peer) = memory_pair("mem");
        let (mut sink, mut stream) = transport.into_parts();

        sink.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        assert!(peer.send("world"));
        assert_eq!(stream.next().await.unwrap().unwrap(), "world");

        drop(peer);
        assert!(stream.next().await.is_none());
        assert!(sink.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let err = spawn_stdio("x", "nonexistent-tool-server-12345", &[], &[]).unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = connect_websocket("fs", "ws://127.0.0.1:1", &[]).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }
}
