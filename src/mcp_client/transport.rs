//! JSON-RPC transports.
//!
//! Both transports speak the same wire format: one JSON-RPC 2.0 object per
//! line. `JsonRpcChannel` does the framing and request/response matching over
//! any byte stream; `StdioTransport` wires it to a child process and
//! `TcpTransport` to a socket. Everything above this module talks to
//! `dyn Transport` and never knows which one it has.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::definition::{redact_secrets, ServerDefinition, TransportKind, TransportTarget};
use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default upper bound for a single incoming frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// How much of a server's stderr is retained for failure diagnostics.
const STDERR_TAIL_CHARS: usize = 2000;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Channel ─────────────────────────────────────────────────────────────────

/// Line-delimited JSON-RPC over an arbitrary byte stream.
///
/// Request ids are per channel, starting at 1.
pub struct JsonRpcChannel {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<BufReader<BoxedReader>>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
}

impl JsonRpcChannel {
    /// Create a channel from a writer/reader pair.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R, max_frame_bytes: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            next_id: AtomicU64::new(1),
            max_frame_bytes,
        }
    }

    /// Name of the server on the other end.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not JSON-RPC responses (server log noise, server-side
    /// requests, invalid UTF-8) and responses for other ids are skipped. An
    /// error response with a null id is taken as the answer to this request,
    /// since only one request is outstanding per channel.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        let mut frame = Vec::new();
        let mut reader = self.reader.lock().await;

        loop {
            frame.clear();
            self.read_frame(&mut reader, &mut frame).await?;

            let Ok(line) = std::str::from_utf8(&frame) else {
                tracing::debug!(server = %self.server_name, bytes = frame.len(), "skipping non-UTF-8 output");
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.method.is_some() => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = resp.method.as_deref().unwrap_or_default(),
                        "ignoring server-initiated request"
                    );
                }
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                Ok(resp) if resp.id.is_none() && resp.error.is_some() && resp.jsonrpc == "2.0" => {
                    tracing::debug!(server = %self.server_name, expected = id, "error response without id");
                    return Ok(resp);
                }
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = ?resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    // Not a response: notification or stray log output.
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let json = serde_json::to_string(&notification)
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.write_line(json).await
    }

    /// Close the outgoing half of the stream. Idempotent.
    ///
    /// The writer is dropped as well as shut down: a child's stdin only sees
    /// EOF once the pipe's fd is closed.
    pub async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_line(&self, mut json: String) -> Result<(), McpError> {
        json.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("channel is closed for writing".into()))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write message: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush message: {e}")))
    }

    /// Read one newline-terminated frame, refusing frames over the limit.
    async fn read_frame(
        &self,
        reader: &mut BufReader<BoxedReader>,
        buf: &mut Vec<u8>,
    ) -> Result<(), McpError> {
        let limit = self.max_frame_bytes as u64 + 1;
        let bytes_read = (&mut *reader)
            .take(limit)
            .read_until(b'\n', buf)
            .await
            .map_err(|e| self.transport_error(format!("failed to read message: {e}")))?;

        if bytes_read == 0 {
            return Err(self.transport_error("connection closed by server".into()));
        }
        if bytes_read > self.max_frame_bytes {
            return Err(self.transport_error(format!(
                "incoming message exceeds {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A live connection to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// The underlying JSON-RPC channel.
    fn channel(&self) -> &JsonRpcChannel;

    /// Send a request and await its response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.channel().request(method, params).await
    }

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        self.channel().notify(method, params).await
    }

    /// Recent diagnostic output from the server (already redacted).
    async fn diagnostics(&self) -> String {
        String::new()
    }

    /// Release the process or socket, waiting up to `grace` for a clean exit.
    async fn close(&mut self, grace: Duration);
}

/// Open the transport described by `definition`.
///
/// Subprocess spawn errors and refused connections map to
/// `McpError::ConnectionFailed`.
pub async fn connect(
    definition: &ServerDefinition,
    max_frame_bytes: usize,
) -> Result<Box<dyn Transport>, McpError> {
    match &definition.target {
        TransportTarget::Command { .. } => {
            let transport = StdioTransport::spawn(definition, max_frame_bytes)?;
            Ok(Box::new(transport))
        }
        TransportTarget::Endpoint { .. } => {
            let transport = TcpTransport::connect(definition, max_frame_bytes).await?;
            Ok(Box::new(transport))
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    channel: JsonRpcChannel,
    process: Child,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the server process described by `definition`.
    pub fn spawn(definition: &ServerDefinition, max_frame_bytes: usize) -> Result<Self, McpError> {
        let name = definition.name.as_str();
        let TransportTarget::Command { command, args, cwd } = &definition.target else {
            return Err(McpError::ConnectionFailed {
                server: name.to_string(),
                reason: "definition has no command to spawn".into(),
            });
        };

        let mut cmd = Command::new(command);
        cmd.args(args);

        for (key, value) in &definition.env {
            cmd.env(key, value);
        }

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            server: name.to_string(),
            reason: definition.redact(&format!("failed to spawn '{command}': {e}")),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::ConnectionFailed {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::ConnectionFailed {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let secrets: Vec<String> = definition
                .secret_values()
                .into_iter()
                .map(str::to_string)
                .collect();
            tokio::spawn(drain_stderr(
                name.to_string(),
                stderr,
                secrets,
                Arc::clone(&stderr_tail),
            ))
        });

        tracing::debug!(server = name, command = %command, pid = ?child.id(), "spawned server process");

        Ok(Self {
            channel: JsonRpcChannel::new(name, stdin, stdout, max_frame_bytes),
            process: child,
            stderr_tail,
            stderr_task,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    fn channel(&self) -> &JsonRpcChannel {
        &self.channel
    }

    async fn diagnostics(&self) -> String {
        // Give the drain task a moment to pick up output from a dying process.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.stderr_tail
            .lock()
            .map(|tail| tail.trim().to_string())
            .unwrap_or_default()
    }

    async fn close(&mut self, grace: Duration) {
        // Closing stdin is the MCP stdio shutdown signal.
        self.channel.shutdown_writer().await;

        match tokio::time::timeout(grace, self.process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.channel.server_name(), %status, "server exited");
            }
            _ => {
                let _ = self.process.kill().await;
                tracing::debug!(server = %self.channel.server_name(), "server killed after grace period");
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Keep draining stderr so a chatty server never blocks on a full pipe,
/// retaining only a redacted tail.
async fn drain_stderr(
    server: String,
    stderr: ChildStderr,
    secrets: Vec<String>,
    tail: Arc<std::sync::Mutex<String>>,
) {
    let secret_refs: Vec<&str> = secrets.iter().map(String::as_str).collect();
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = redact_secrets(&line, &secret_refs);
        tracing::trace!(server = %server, stderr = %line, "server stderr");

        if let Ok(mut buf) = tail.lock() {
            buf.push_str(&line);
            buf.push('\n');
            if buf.len() > STDERR_TAIL_CHARS {
                let mut cut = buf.len() - STDERR_TAIL_CHARS;
                while !buf.is_char_boundary(cut) {
                    cut += 1;
                }
                buf.drain(..cut);
            }
        }
    }
}

// ─── TCP ─────────────────────────────────────────────────────────────────────

/// JSON-RPC over a TCP socket.
pub struct TcpTransport {
    channel: JsonRpcChannel,
}

impl TcpTransport {
    /// Connect to the endpoint described by `definition`.
    pub async fn connect(
        definition: &ServerDefinition,
        max_frame_bytes: usize,
    ) -> Result<Self, McpError> {
        let name = definition.name.as_str();
        let TransportTarget::Endpoint { address } = &definition.target else {
            return Err(McpError::ConnectionFailed {
                server: name.to_string(),
                reason: "definition has no endpoint to connect to".into(),
            });
        };

        let stream = TcpStream::connect(address.as_str())
            .await
            .map_err(|e| McpError::ConnectionFailed {
                server: name.to_string(),
                reason: format!("failed to connect to {address}: {e}"),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(server = name, error = %e, "failed to set TCP_NODELAY");
        }

        tracing::debug!(server = name, address = %address, "connected to server");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            channel: JsonRpcChannel::new(name, write_half, read_half, max_frame_bytes),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Networked
    }

    fn channel(&self) -> &JsonRpcChannel {
        &self.channel
    }

    async fn close(&mut self, _grace: Duration) {
        self.channel.shutdown_writer().await;
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
