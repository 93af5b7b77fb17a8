//! JSON-RPC transport over a child process's standard streams.
//!
//! Messages are framed as `Content-Length: <n>\r\n\r\n<body>` in both
//! directions. Inbound bytes accumulate in a rolling buffer; each complete
//! frame is dispatched to the pending-request map or the notification
//! handler. Two background tasks read the child's stdout and stderr pipes;
//! everything else runs in the caller's serialized context.

use crate::error::{LspError, LspResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, trace, warn};

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Any inbound JSON-RPC message. Variant order matters for untagged
/// deserialization: a request has both `id` and `method`, a response only
/// `id`, a notification only `method`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

type PendingSender = oneshot::Sender<LspResult<Value>>;

/// Request ids are monotonic, so key order in the map is registration order.
type PendingMap = Arc<Mutex<BTreeMap<i64, PendingSender>>>;

/// Framed message exchange with one child process.
///
/// The transport exclusively owns the process and its three pipes. Each
/// pending request resolves exactly once: by a matching response, a timeout,
/// or a disconnect, whichever happens first.
pub struct LspTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicI64,
}

impl LspTransport {
    /// Spawn the server process and start the pipe reader tasks.
    pub async fn spawn(
        command: impl AsRef<OsStr>,
        args: &[&str],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> LspResult<Arc<Self>> {
        let command = command.as_ref();
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(env)
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(command = ?command, ?args, "Starting language server");

        let mut child = cmd
            .spawn()
            .map_err(|e| LspError::launch_failed(format!("Failed to start server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::launch_failed("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::launch_failed("Failed to get stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LspError::launch_failed("Failed to get stderr"))?;

        let transport = Arc::new(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicI64::new(1),
        });

        let pending = Arc::clone(&transport.pending);
        let weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            read_frames(stdout, &pending).await;
            // The pipe is gone: no new request may be issued, and everything
            // still pending fails before anything else observes the transport.
            if let Some(transport) = weak.upgrade() {
                *transport.stdin.lock().await = None;
            }
            fail_all_pending(&pending).await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tinkerpad_lsp::server_stderr", "{line}");
            }
        });

        Ok(transport)
    }

    /// Send a request and wait for its response, a timeout, or a disconnect.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> LspResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.send(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        trace!(method, id, "Sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving: the map was torn down.
            Ok(Err(_)) => Err(LspError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(method, id, "Request timed out");
                Err(LspError::Timeout)
            }
        }
    }

    /// Fire-and-forget framed send.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        self.send(&JsonRpcNotification::new(method, params)).await
    }

    /// Serialize and write one framed message to the child's stdin.
    pub async fn send<T: Serialize>(&self, message: &T) -> LspResult<()> {
        let body = serde_json::to_string(message)?;
        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard.as_mut().ok_or(LspError::Disconnected)?;

        trace!(message = %body, "Sending message");
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

        if let Err(e) = stdin.write_all(framed.as_bytes()).await {
            warn!(error = %e, "Write to server failed");
            *stdin_guard = None;
            return Err(LspError::Disconnected);
        }
        stdin.flush().await.map_err(|_| LspError::Disconnected)?;
        Ok(())
    }

    /// Whether a process is still attached.
    pub async fn is_connected(&self) -> bool {
        self.stdin.lock().await.is_some()
    }

    /// Kill the process and fail every pending request with `Disconnected`,
    /// in registration order.
    pub async fn disconnect(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            *stdin = None;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        fail_all_pending(&self.pending).await;
        debug!("Transport disconnected");
    }
}

impl Drop for LspTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(ref mut child) = *guard {
                let _ = child.start_kill();
            }
        }
    }
}

async fn fail_all_pending(pending: &PendingMap) {
    let drained = {
        let mut map = pending.lock().await;
        std::mem::take(&mut *map)
    };
    // BTreeMap iterates in id order, which is registration order.
    for (id, tx) in drained {
        trace!(id, "Failing pending request: disconnected");
        let _ = tx.send(Err(LspError::Disconnected));
    }
}

/// Read loop for the child's stdout: fill the rolling buffer, peel off
/// complete frames, dispatch each one.
async fn read_frames(stdout: tokio::process::ChildStdout, pending: &PendingMap) {
    let mut stdout = stdout;
    let mut buffer: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                debug!("Server closed stdout");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Error reading from server");
                return;
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    match take_frame(&mut buffer) {
                        Frame::Complete(body) => dispatch(pending, &body).await,
                        Frame::Incomplete => break,
                        Frame::Malformed => {
                            // A header we cannot parse would wedge the scanner
                            // forever; drop the buffer and resynchronize on
                            // the next frame.
                            warn!(
                                buffered = buffer.len(),
                                "Unparseable frame header, resetting inbound buffer"
                            );
                            buffer.clear();
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Outcome of scanning the rolling buffer for one frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Complete(Vec<u8>),
    Incomplete,
    Malformed,
}

/// Extract exactly one framed body from the front of the buffer, if complete.
fn take_frame(buffer: &mut Vec<u8>) -> Frame {
    let Some(header_end) = find_subsequence(buffer, b"\r\n\r\n") else {
        return Frame::Incomplete;
    };
    let Some(length) = parse_content_length(&buffer[..header_end]) else {
        return Frame::Malformed;
    };
    let body_start = header_end + 4;
    if buffer.len() < body_start + length {
        return Frame::Incomplete;
    }
    let body = buffer[body_start..body_start + length].to_vec();
    buffer.drain(..body_start + length);
    Frame::Complete(body)
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    for line in text.split("\r\n") {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            return value.trim().parse().ok();
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn dispatch(pending: &PendingMap, body: &[u8]) {
    match serde_json::from_slice::<JsonRpcMessage>(body) {
        Ok(JsonRpcMessage::Response(response)) => {
            if let Some(tx) = pending.lock().await.remove(&response.id) {
                let result = match response.error {
                    Some(error) => {
                        warn!(code = error.code, message = %error.message, "Server error response");
                        Err(LspError::ServerError(error.message))
                    }
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            } else {
                // Already settled by a timeout or disconnect; this path wins
                // nothing and must stay a no-op.
                trace!(id = response.id, "Response for settled request, ignoring");
            }
        }
        Ok(JsonRpcMessage::Notification(notification)) => handle_notification(notification),
        Ok(JsonRpcMessage::Request(request)) => {
            warn!(method = %request.method, "Ignoring server-initiated request");
        }
        Err(e) => {
            warn!(error = %e, "Invalid message body, skipping");
        }
    }
}

fn handle_notification(notification: JsonRpcNotification) {
    match notification.method.as_str() {
        "window/logMessage" | "window/showMessage" => {
            let params = notification.params.unwrap_or(Value::Null);
            let level = params.get("type").and_then(Value::as_i64).unwrap_or(0);
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("(no message)");
            match level {
                1 => error!("Server: {message}"),
                2 => warn!("Server: {message}"),
                3 => debug!("Server: {message}"),
                _ => trace!("Server: {message}"),
            }
        }
        method => {
            trace!(method, "Unhandled notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame_bytes(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_take_frame_complete() {
        let mut buffer = frame_bytes(r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        match take_frame(&mut buffer) {
            Frame::Complete(body) => {
                assert_eq!(body, br#"{"jsonrpc":"2.0","id":1,"result":null}"#);
            }
            other => panic!("expected complete frame, got {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_frame_partial_stays_buffered() {
        let full = frame_bytes(r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        // Header only.
        let mut buffer = full[..20].to_vec();
        assert_eq!(take_frame(&mut buffer), Frame::Incomplete);
        assert_eq!(buffer.len(), 20);

        // Header complete, body truncated.
        let mut buffer = full[..full.len() - 5].to_vec();
        assert_eq!(take_frame(&mut buffer), Frame::Incomplete);

        // Remaining bytes arrive.
        buffer.extend_from_slice(&full[full.len() - 5..]);
        assert!(matches!(take_frame(&mut buffer), Frame::Complete(_)));
    }

    #[test]
    fn test_take_frame_two_messages_in_one_chunk() {
        let mut buffer = frame_bytes(r#"{"a":1}"#);
        buffer.extend_from_slice(&frame_bytes(r#"{"b":2}"#));

        match take_frame(&mut buffer) {
            Frame::Complete(body) => assert_eq!(body, br#"{"a":1}"#),
            other => panic!("expected first frame, got {other:?}"),
        }
        match take_frame(&mut buffer) {
            Frame::Complete(body) => assert_eq!(body, br#"{"b":2}"#),
            other => panic!("expected second frame, got {other:?}"),
        }
        assert_eq!(take_frame(&mut buffer), Frame::Incomplete);
    }

    #[test]
    fn test_take_frame_malformed_header() {
        let mut buffer = b"Content-Length: banana\r\n\r\n{}".to_vec();
        assert_eq!(take_frame(&mut buffer), Frame::Malformed);

        let mut buffer = b"X-Nonsense: 12\r\n\r\n{}".to_vec();
        assert_eq!(take_frame(&mut buffer), Frame::Malformed);
    }

    #[test]
    fn test_parse_content_length_ignores_extra_headers() {
        let header = b"Content-Type: application/json\r\nContent-Length: 42";
        assert_eq!(parse_content_length(header), Some(42));
    }

    #[test]
    fn test_message_deserialization_variants() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        assert!(matches!(
            serde_json::from_str::<JsonRpcMessage>(json).unwrap(),
            JsonRpcMessage::Request(_)
        ));

        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        assert!(matches!(
            serde_json::from_str::<JsonRpcMessage>(json).unwrap(),
            JsonRpcMessage::Response(_)
        ));

        let json = r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{}}"#;
        assert!(matches!(
            serde_json::from_str::<JsonRpcMessage>(json).unwrap(),
            JsonRpcMessage::Notification(_)
        ));
    }

    #[test]
    fn test_notification_serializes_without_id() {
        let notification = JsonRpcNotification::new("textDocument/didOpen", None);
        let json = serde_json::to_string(&notification).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("\"params\""));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = LspTransport::spawn(
            "nonexistent_language_server_12345",
            &[],
            &HashMap::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(LspError::LaunchFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_times_out_near_deadline() {
        // `sleep` holds its pipes open and never responds.
        let transport = LspTransport::spawn("sleep", &["5"], &HashMap::new(), None)
            .await
            .unwrap();

        let started = Instant::now();
        let result = transport
            .request("initialize", None, Duration::from_millis(250))
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(LspError::Timeout)));
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?}");
        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_death_fails_all_pending() {
        let transport = LspTransport::spawn(
            "bash",
            &["-c", "sleep 0.2"],
            &HashMap::new(),
            None,
        )
        .await
        .unwrap();

        let long = Duration::from_secs(10);
        let (a, b, c) = tokio::join!(
            transport.request("one", None, long),
            transport.request("two", None, long),
            transport.request("three", None, long),
        );

        assert!(matches!(a, Err(LspError::Disconnected)));
        assert!(matches!(b, Err(LspError::Disconnected)));
        assert!(matches!(c, Err(LspError::Disconnected)));
        assert!(!transport.is_connected().await);

        // No new request may be issued on the dead transport.
        let result = transport.request("four", None, long).await;
        assert!(matches!(result, Err(LspError::Disconnected)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_fails_pending_and_blocks_sends() {
        let transport = LspTransport::spawn("sleep", &["5"], &HashMap::new(), None)
            .await
            .unwrap();

        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("hang", None, Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.disconnect().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(LspError::Disconnected)));

        let result = transport.notify("textDocument/didChange", None).await;
        assert!(matches!(result, Err(LspError::Disconnected)));
    }
}
