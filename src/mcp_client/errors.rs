//! MCP Client error types.
//!
//! Every variant carries plain strings so errors can be cloned into the
//! aggregation report and serialized for logging. None of them ever carries
//! a server's environment values.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during aggregation and tool invocation.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpError {
    /// The subprocess failed to start or the socket could not be opened.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// The `initialize` handshake did not finish in time.
    #[error("server '{server}' handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { server: String, timeout_ms: u64 },

    /// The `initialize` handshake was answered with garbage or an error.
    #[error("server '{server}' handshake failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// `tools/list` did not finish in time.
    #[error("server '{server}' tool discovery timed out after {timeout_ms}ms")]
    DiscoveryTimeout { server: String, timeout_ms: u64 },

    /// `tools/list` returned a malformed, oversized, or error response.
    #[error("server '{server}' tool discovery failed: {reason}")]
    DiscoveryProtocol { server: String, reason: String },

    /// The overall aggregation deadline expired while this server was in flight.
    #[error("server '{server}' did not finish before the {deadline_ms}ms aggregation deadline")]
    DeadlineExceeded { server: String, deadline_ms: u64 },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the registry.
    #[error("unknown tool: '{name}'{}", format_suggestions(.suggestions))]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The owning session failed or was closed after discovery.
    #[error("server '{server}' is unavailable: {reason}")]
    ServerUnavailable { server: String, reason: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    CallTimeout { tool: String, timeout_ms: u64 },

    /// The aggregation request itself is unusable (the only fatal error).
    #[error("invalid aggregation request: {reason}")]
    InvalidRequest { reason: String },
}

impl McpError {
    /// Name of the server this error is attributed to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { server, .. }
            | Self::HandshakeTimeout { server, .. }
            | Self::HandshakeFailed { server, .. }
            | Self::DiscoveryTimeout { server, .. }
            | Self::DiscoveryProtocol { server, .. }
            | Self::DeadlineExceeded { server, .. }
            | Self::Transport { server, .. }
            | Self::ServerUnavailable { server, .. } => Some(server),
            _ => None,
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

fn format_entry_name(name: &Option<String>) -> String {
    name.as_ref()
        .map(|n| format!(" ('{n}')"))
        .unwrap_or_default()
}

/// A raw server definition that could not be turned into a `ServerDefinition`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("server definition #{index}{}: {reason}", format_entry_name(.name))]
pub struct ValidationError {
    /// Position of the entry in the input sequence.
    pub index: usize,
    /// The entry's name, when one could be read.
    pub name: Option<String>,
    pub reason: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_lists_suggestions() {
        let err = McpError::UnknownTool {
            name: "serch".into(),
            suggestions: vec!["search".into(), "fetch".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown tool: 'serch' (did you mean: search, fetch?)"
        );

        let bare = McpError::UnknownTool {
            name: "nope".into(),
            suggestions: vec![],
        };
        assert_eq!(bare.to_string(), "unknown tool: 'nope'");
    }

    #[test]
    fn test_server_attribution() {
        let err = McpError::HandshakeTimeout {
            server: "slow".into(),
            timeout_ms: 100,
        };
        assert_eq!(err.server(), Some("slow"));
        assert_eq!(
            McpError::InvalidRequest { reason: "empty".into() }.server(),
            None
        );
    }

    #[test]
    fn test_error_serializes_with_kind_tag() {
        let err = McpError::ConnectionFailed {
            server: "github".into(),
            reason: "No such file or directory".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "connection_failed");
        assert_eq!(json["server"], "github");
    }

    #[test]
    fn test_validation_error_display() {
        let named = ValidationError {
            index: 2,
            name: Some("github".into()),
            reason: "missing 'command'".into(),
        };
        assert_eq!(
            named.to_string(),
            "server definition #2 ('github'): missing 'command'"
        );

        let anonymous = ValidationError {
            index: 0,
            name: None,
            reason: "entry is not an object".into(),
        };
        assert_eq!(
            anonymous.to_string(),
            "server definition #0: entry is not an object"
        );
    }
}
