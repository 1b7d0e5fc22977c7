//! Tool discovery: enumerate a ready session's tools via `tools/list`.
//!
//! Pages are followed through `nextCursor` until the server stops sending
//! one. A server either yields its complete, normalized tool list or an
//! error; a partial list is never returned.

use std::collections::HashSet;
use std::time::Duration;

use super::errors::McpError;
use super::lifecycle::Session;
use super::schema::normalize_schema;
use super::transport::extract_result;
use super::types::{ListToolsResult, McpToolDefinition, ToolDescriptor, ToolOwner};

/// Default cap on the number of tools a single server may publish.
pub const DEFAULT_MAX_TOOLS: usize = 1024;

/// Longest tool name accepted from a server.
const MAX_TOOL_NAME_LEN: usize = 128;

/// Enumerate every tool `session` exposes, bounded by `timeout` overall.
pub async fn list_tools(
    session: &Session,
    timeout: Duration,
    max_tools: usize,
) -> Result<Vec<ToolDescriptor>, McpError> {
    match tokio::time::timeout(timeout, fetch_all(session, max_tools)).await {
        Ok(result) => result,
        Err(_) => Err(McpError::DiscoveryTimeout {
            server: session.name().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn fetch_all(session: &Session, max_tools: usize) -> Result<Vec<ToolDescriptor>, McpError> {
    let server = session.name().to_string();
    let protocol_error = |reason: String| McpError::DiscoveryProtocol {
        server: server.clone(),
        reason: session.definition().redact(&reason),
    };

    let mut tools = Vec::new();
    let mut seen_cursors = HashSet::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));

        let response = match session.request("tools/list", params).await {
            Ok(response) => response,
            Err(e @ McpError::ServerUnavailable { .. }) => return Err(e),
            Err(e) => return Err(protocol_error(e.to_string())),
        };
        let result = extract_result(response).map_err(|e| protocol_error(e.to_string()))?;
        let page: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| protocol_error(format!("malformed tools/list result: {e}")))?;
        pages += 1;

        for raw in page.tools {
            if tools.len() == max_tools {
                return Err(protocol_error(format!(
                    "server reports more than {max_tools} tools"
                )));
            }
            tools.push(describe(&server, raw).map_err(protocol_error)?);
        }

        match page.next_cursor {
            Some(next) if !next.is_empty() => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(protocol_error(format!("cursor '{next}' was repeated")));
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    tracing::debug!(server = %server, tools = tools.len(), pages, "tools discovered");
    Ok(tools)
}

/// Normalize one reported tool into a descriptor owned by `server`.
fn describe(server: &str, raw: McpToolDefinition) -> Result<ToolDescriptor, String> {
    check_tool_name(&raw.name)?;
    let parameter_schema = normalize_schema(&raw.input_schema)
        .map_err(|e| format!("tool '{}': {e}", raw.name))?;

    Ok(ToolDescriptor {
        qualified_name: raw.name,
        owner: ToolOwner::Server(server.to_string()),
        parameter_schema,
        description: raw.description.unwrap_or_default(),
    })
}

fn check_tool_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("tool with an empty name".into());
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(format!("tool name longer than {MAX_TOOL_NAME_LEN} bytes"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("tool name '{}' contains whitespace", name.escape_debug()));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::definition::ServerDefinition;
    use crate::mcp_client::lifecycle::SessionOptions;
    use crate::mcp_client::test_support::{fake_tool, FakeBehavior, FakeServer};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn open(server: &FakeServer, name: &str) -> Session {
        Session::open(
            ServerDefinition::networked(name, &server.address),
            SessionOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_tools_are_attributed_to_server() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search", "fetch"])).await;
        let session = open(&server, "web").await;

        let tools = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["search", "fetch"]);
        assert!(tools.iter().all(|t| t.owner == ToolOwner::Server("web".into())));
        assert_eq!(tools[0].description, "search tool");
        assert_eq!(tools[0].parameter_schema["properties"]["q"]["type"], "string");
    }

    #[tokio::test]
    async fn test_follows_pagination() {
        let names: Vec<String> = (0..7).map(|i| format!("tool_{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let behavior = FakeBehavior {
            page_size: Some(3),
            ..FakeBehavior::with_tools(&refs)
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "paged").await;

        let tools = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap();
        let got: Vec<String> = tools.into_iter().map(|t| t.qualified_name).collect();
        assert_eq!(got, names);
    }

    #[tokio::test]
    async fn test_missing_schema_and_description_are_defaulted() {
        let behavior = FakeBehavior {
            list_result: Some(json!({"tools": [{"name": "bare"}]})),
            ..FakeBehavior::default()
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "bare").await;

        let tools = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap();
        assert_eq!(tools[0].description, "");
        assert_eq!(
            tools[0].parameter_schema,
            json!({"type": "object", "properties": {}})
        );
    }

    #[tokio::test]
    async fn test_malformed_result_is_protocol_error() {
        let behavior = FakeBehavior {
            list_result: Some(json!({"tools": "nope"})),
            ..FakeBehavior::default()
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "broken").await;

        let err = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap_err();
        assert!(matches!(err, McpError::DiscoveryProtocol { ref server, .. } if server == "broken"));
    }

    #[tokio::test]
    async fn test_invalid_tool_name_fails_whole_server() {
        let behavior = FakeBehavior {
            list_result: Some(json!({"tools": [fake_tool("ok"), fake_tool("has space")]})),
            ..FakeBehavior::default()
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "names").await;

        let err = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[tokio::test]
    async fn test_non_object_schema_is_protocol_error() {
        let behavior = FakeBehavior {
            list_result: Some(json!({"tools": [{"name": "odd", "inputSchema": {"type": "string"}}]})),
            ..FakeBehavior::default()
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "odd").await;

        let err = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap_err();
        assert!(matches!(err, McpError::DiscoveryProtocol { .. }));
    }

    #[tokio::test]
    async fn test_too_many_tools() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["a", "b", "c"])).await;
        let session = open(&server, "big").await;

        let err = list_tools(&session, TIMEOUT, 2).await.unwrap_err();
        assert!(err.to_string().contains("more than 2 tools"));
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_rejected() {
        let behavior = FakeBehavior {
            list_result: Some(json!({"tools": [], "nextCursor": "same"})),
            ..FakeBehavior::default()
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "loop").await;

        let err = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap_err();
        assert!(err.to_string().contains("repeated"));
    }

    #[tokio::test]
    async fn test_slow_listing_times_out() {
        let behavior = FakeBehavior {
            list_delay: Duration::from_secs(5),
            ..FakeBehavior::with_tools(&["slow"])
        };
        let server = FakeServer::start(behavior).await;
        let session = open(&server, "slow").await;

        let err = list_tools(&session, Duration::from_millis(200), DEFAULT_MAX_TOOLS)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::DiscoveryTimeout { timeout_ms: 200, .. }));
    }

    #[tokio::test]
    async fn test_closed_session_is_unavailable() {
        let server = FakeServer::start(FakeBehavior::with_tools(&["search"])).await;
        let session = open(&server, "gone").await;
        session.close().await;

        let err = list_tools(&session, TIMEOUT, DEFAULT_MAX_TOOLS).await.unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));
    }

    #[test]
    fn test_tool_name_rules() {
        assert!(check_tool_name("github.search_repos").is_ok());
        assert!(check_tool_name("").is_err());
        assert!(check_tool_name("tab\tname").is_err());
        assert!(check_tool_name(&"x".repeat(129)).is_err());
    }
}
