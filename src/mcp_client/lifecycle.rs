//! Session lifecycle management.
//!
//! A `Session` is the live connection to one server. It moves through
//! `Pending → Connecting → Ready → (InUse)* → Closed`, or to `Failed` on any
//! connection, handshake, or transport error. The `SessionManager` owns every
//! session of an aggregation run; the registry only routes to sessions by
//! server name and never opens or closes them.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::definition::{ServerDefinition, TransportKind};
use super::errors::McpError;
use super::transport::{self, extract_result, Transport, DEFAULT_MAX_FRAME_BYTES};
use super::types::{InitializeResult, JsonRpcResponse, ServerInfo, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for connect + `initialize` handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for a clean exit before force-killing.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─── State ───────────────────────────────────────────────────────────────────

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Connecting,
    Ready,
    InUse,
    Failed,
    Closed,
}

impl SessionState {
    /// Whether requests may be sent.
    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Ready | Self::InUse)
    }
}

/// Knobs shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A connection to one server.
pub struct Session {
    definition: ServerDefinition,
    options: SessionOptions,
    state: std::sync::Mutex<SessionState>,
    /// `None` until connected and again after close.
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    server_info: OnceLock<ServerInfo>,
}

impl Session {
    /// A session in the `Pending` state.
    pub fn new(definition: ServerDefinition, options: SessionOptions) -> Self {
        Self {
            definition,
            options,
            state: std::sync::Mutex::new(SessionState::Pending),
            transport: tokio::sync::Mutex::new(None),
            server_info: OnceLock::new(),
        }
    }

    /// Connect and handshake, closing the session again on failure.
    pub async fn open(
        definition: ServerDefinition,
        options: SessionOptions,
    ) -> Result<Session, McpError> {
        let session = Session::new(definition, options);
        if let Err(e) = session.connect().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Failed)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != SessionState::Closed {
                tracing::trace!(server = %self.definition.name, from = ?*state, to = ?next, "session state");
                *state = next;
            }
        }
    }

    /// `serverInfo` reported during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.get()
    }

    /// Open the transport and perform the `initialize` handshake, all within
    /// the handshake timeout.
    pub async fn connect(&self) -> Result<(), McpError> {
        let name = self.definition.name.clone();
        if self.state() != SessionState::Pending {
            return Err(McpError::ConnectionFailed {
                server: name,
                reason: format!("session is {:?}, not pending", self.state()),
            });
        }
        self.set_state(SessionState::Connecting);

        let timeout = self.options.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let timeout_error = || McpError::HandshakeTimeout {
            server: name.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let mut slot = self.transport.lock().await;

        let mut transport = match tokio::time::timeout_at(
            deadline,
            transport::connect(&self.definition, self.options.max_frame_bytes),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                self.set_state(SessionState::Failed);
                return Err(e);
            }
            Err(_) => {
                self.set_state(SessionState::Failed);
                return Err(timeout_error());
            }
        };

        let handshake =
            tokio::time::timeout_at(deadline, initialize(transport.as_ref(), &self.definition))
                .await;

        match handshake {
            Ok(Ok(info)) => {
                tracing::info!(
                    server = %name,
                    transport = ?transport.kind(),
                    remote_name = info.name.as_deref().unwrap_or("unknown"),
                    remote_version = info.version.as_deref().unwrap_or("unknown"),
                    "session ready"
                );
                let _ = self.server_info.set(info);
                *slot = Some(transport);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Ok(Err(e)) => {
                let stderr_ctx = transport.diagnostics().await;
                if !stderr_ctx.is_empty() {
                    tracing::warn!(server = %name, stderr = %stderr_ctx, "server stderr captured on failure");
                }
                transport.close(Duration::ZERO).await;
                self.set_state(SessionState::Failed);
                Err(McpError::HandshakeFailed {
                    server: name.clone(),
                    reason: self
                        .definition
                        .redact(&format!("{e}{}", format_stderr_suffix(&stderr_ctx))),
                })
            }
            Err(_) => {
                let stderr_ctx = transport.diagnostics().await;
                if !stderr_ctx.is_empty() {
                    tracing::warn!(server = %name, stderr = %stderr_ctx, "server stderr captured on timeout");
                }
                transport.close(Duration::ZERO).await;
                self.set_state(SessionState::Failed);
                Err(timeout_error())
            }
        }
    }

    /// Send a request over the session. Transport errors fail the session.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let slot = self.transport.lock().await;
        let transport = self.usable_transport(&slot)?;

        let result = transport.request(method, params).await;
        if let Err(McpError::Transport { .. }) = &result {
            self.set_state(SessionState::Failed);
        }
        result
    }

    /// Invoke `tools/call` and return the raw MCP result payload.
    ///
    /// Calls on one session are serialized. A JSON-RPC error comes back as
    /// `McpError::ServerError`; a dead connection fails the session.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let slot = self.transport.lock().await;
        let transport = self.usable_transport(&slot)?;

        self.set_state(SessionState::InUse);
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let outcome = tokio::time::timeout(timeout, transport.request("tools/call", Some(params))).await;

        match outcome {
            Err(_) => {
                self.set_state(SessionState::Ready);
                Err(McpError::CallTimeout {
                    tool: tool_name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                if matches!(e, McpError::Transport { .. }) {
                    tracing::warn!(server = %self.definition.name, error = %e, "session failed during tool call");
                    self.set_state(SessionState::Failed);
                } else {
                    self.set_state(SessionState::Ready);
                }
                Err(e)
            }
            Ok(Ok(response)) => {
                self.set_state(SessionState::Ready);
                extract_result(response)
            }
        }
    }

    fn usable_transport<'a>(
        &self,
        slot: &'a Option<Box<dyn Transport>>,
    ) -> Result<&'a dyn Transport, McpError> {
        let state = self.state();
        match slot {
            Some(transport) if state.accepts_requests() => Ok(transport.as_ref()),
            _ => Err(McpError::ServerUnavailable {
                server: self.definition.name.clone(),
                reason: format!("session is {}", format!("{state:?}").to_lowercase()),
            }),
        }
    }

    /// Release the process or socket. Only the first call does anything.
    ///
    /// Returns `true` if this call performed the close.
    pub async fn close(&self) -> bool {
        self.close_with_grace(self.options.shutdown_grace).await
    }

    /// Close without waiting for a clean exit.
    pub async fn abort(&self) -> bool {
        self.close_with_grace(Duration::ZERO).await
    }

    async fn close_with_grace(&self, grace: Duration) -> bool {
        let mut slot = self.transport.lock().await;
        if self.state() == SessionState::Closed {
            return false;
        }
        if let Some(mut transport) = slot.take() {
            transport.close(grace).await;
        }
        self.set_state(SessionState::Closed);
        tracing::debug!(server = %self.definition.name, "session closed");
        true
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(
    transport: &dyn Transport,
    definition: &ServerDefinition,
) -> Result<ServerInfo, McpError> {
    let mut params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    if transport.kind() == TransportKind::Networked && !definition.env.is_empty() {
        params["_meta"] = serde_json::json!({ "headers": definition.env });
    }

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
            server: definition.name.clone(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = &init.protocol_version {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server = %definition.name, %version, "server negotiated a different protocol version");
        }
    }

    transport.notify("notifications/initialized", None).await?;

    Ok(init.server_info.unwrap_or(ServerInfo {
        name: None,
        version: None,
    }))
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Owns every session of one aggregation run.
pub struct SessionManager {
    options: SessionOptions,
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a `Pending` session for `definition`.
    ///
    /// A session already registered under the same name is replaced; the
    /// validator guarantees names are unique within a run.
    pub fn create(&self, definition: &ServerDefinition) -> Arc<Session> {
        let session = Arc::new(Session::new(definition.clone(), self.options.clone()));
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(definition.name.clone(), Arc::clone(&session));
        }
        session
    }

    /// Create and connect a session in one step.
    pub async fn open(&self, definition: &ServerDefinition) -> Result<Arc<Session>, McpError> {
        let session = self.create(definition);
        if let Err(e) = session.connect().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().ok()?.get(name).cloned()
    }

    /// Current state of the named session.
    pub fn state(&self, name: &str) -> Option<SessionState> {
        self.get(name).map(|s| s.state())
    }

    /// Names of sessions currently accepting requests.
    pub fn ready_servers(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.state().accepts_requests())
            .map(|s| s.name().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Route a tool call to the named session.
    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let session = self.get(server).ok_or_else(|| McpError::ServerUnavailable {
            server: server.to_string(),
            reason: "no such session".into(),
        })?;
        session.call_tool(tool_name, arguments, timeout).await
    }

    /// Close the named session. Returns `false` if it was absent or already closed.
    pub async fn close(&self, name: &str) -> bool {
        match self.get(name) {
            Some(session) => session.close().await,
            None => false,
        }
    }

    /// Close every session concurrently.
    pub async fn shutdown(&self) {
        let sessions = self.snapshot();
        let closed = futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        let count = closed.into_iter().filter(|c| *c).count();
        if count > 0 {
            tracing::info!(closed = count, "sessions shut down");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{FakeBehavior, FakeServer};
    use serde_json::json;

    fn fast_options() -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(100),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    #[tokio::test]
    async fn test_open_reaches_ready() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let def = ServerDefinition::networked("fake", &server.address);

        let session = Session::open(def, fast_options()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session.server_info().and_then(|i| i.name.as_deref()),
            Some("fake-server")
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout_fails_session() {
        let behavior = FakeBehavior {
            handshake_delay: Duration::from_secs(5),
            ..FakeBehavior::with_tools(&["search"])
        };
        let server = FakeServer::start(behavior).await;
        let def = ServerDefinition::networked("slow", &server.address);

        let session = Session::new(def, fast_options());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeTimeout { timeout_ms: 500, .. }));
        assert_eq!(session.state(), SessionState::Failed);

        assert!(session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let manager = SessionManager::new(fast_options());
        let def = ServerDefinition::networked("fake", &server.address);

        manager.open(&def).await.unwrap();
        assert_eq!(manager.ready_servers(), vec!["fake"]);

        assert!(manager.close("fake").await);
        assert!(!manager.close("fake").await);
        assert!(!manager.close("never-existed").await);
        assert_eq!(manager.state("fake"), Some(SessionState::Closed));
        assert!(manager.ready_servers().is_empty());
    }

    #[tokio::test]
    async fn test_call_after_close_is_unavailable() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let manager = SessionManager::new(fast_options());
        manager
            .open(&ServerDefinition::networked("fake", &server.address))
            .await
            .unwrap();

        let ok = manager
            .call_tool("fake", "search", json!({"q": "rust"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok["isError"], false);

        manager.close("fake").await;
        let err = manager
            .call_tool("fake", "search", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));
        assert_eq!(server.tool_calls(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_session() {
        let behavior = FakeBehavior {
            hang_up_on_call: true,
            ..FakeBehavior::with_tools(&["search"])
        };
        let server = FakeServer::start(behavior).await;
        let manager = SessionManager::new(fast_options());
        manager
            .open(&ServerDefinition::networked("flaky", &server.address))
            .await
            .unwrap();

        let first = manager
            .call_tool("flaky", "search", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(first, McpError::Transport { .. }));
        assert_eq!(manager.state("flaky"), Some(SessionState::Failed));

        let second = manager
            .call_tool("flaky", "search", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(second, McpError::ServerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_networked_env_sent_as_headers() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let def = ServerDefinition::networked("remote", &server.address)
            .with_env("AUTHORIZATION", "Bearer abc");

        let _session = Session::open(def, fast_options()).await.unwrap();
        let params = server.initialize_params().unwrap();
        assert_eq!(params["_meta"]["headers"]["AUTHORIZATION"], "Bearer abc");
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let session = Session::new(
            ServerDefinition::networked("fake", &server.address),
            fast_options(),
        );
        session.connect().await.unwrap();
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_session_over_stdio() {
        let script = r#"
            read line
            echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh-server"}}}'
            read line
            read line
            echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo"}]}}'
            read line
        "#;
        let def = ServerDefinition::subprocess("sh", "sh", &["-c", script]);

        let session = Session::open(def, fast_options()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let resp = session.request("tools/list", None).await.unwrap();
        let result = extract_result(resp).unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");

        assert!(session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_binary_noise_before_handshake() {
        let script = r#"
            read line
            printf '\377\376 boot log\n'
            echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"noisy"}}}'
            while read line; do :; done
        "#;
        let def = ServerDefinition::subprocess("noisy", "sh", &["-c", script]);

        let session = Session::open(def, fast_options()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.close().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_close_does_not_wait_out_grace() {
        let script = r#"
            read line
            echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}'
            while read line; do :; done
            exit 0
        "#;
        let def = ServerDefinition::subprocess("graceful", "sh", &["-c", script]);
        let options = SessionOptions {
            shutdown_grace: Duration::from_secs(3),
            ..fast_options()
        };

        let session = Session::open(def, options).await.unwrap();
        let started = std::time::Instant::now();
        assert!(session.close().await);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "close took {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_failure_redacts_secrets() {
        let script = r#"echo "starting with token=$SECRET_TOKEN" >&2; exit 3"#;
        let def = ServerDefinition::subprocess("leaky", "sh", &["-c", script])
            .with_env("SECRET_TOKEN", "hunter2-very-secret");

        let err = Session::open(def, fast_options()).await.err().unwrap();
        assert!(matches!(err, McpError::HandshakeFailed { .. }));
        assert!(!err.to_string().contains("hunter2-very-secret"));
    }
}
