//! Tool registry: the merged, immutable set of callable tools.
//!
//! Provides:
//! - Deterministic merge of local and server tools (first registration wins)
//! - Lookup by qualified name, in merge order for listing
//! - Argument validation against the published schema
//! - Invocation routed to the local implementation or the owning session
//! - Serialization into OpenAI function-calling format

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::lifecycle::SessionManager;
use super::local::{self, LocalTool};
use super::schema::validate_arguments;
use super::types::{CallToolResult, ToolCallResult, ToolDescriptor, ToolOwner};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Suggestions below this similarity are not offered.
const MIN_SUGGESTION_SIMILARITY: f64 = 0.3;

/// Maximum suggestions attached to an `UnknownTool` error.
const MAX_SUGGESTIONS: usize = 3;

// ─── Handles ─────────────────────────────────────────────────────────────────

/// How to reach the implementation of a published tool.
#[derive(Clone)]
pub enum ToolHandle {
    Local(Arc<dyn LocalTool>),
    /// `tool_name` is the name the server knows, which differs from the
    /// published name when names are qualified.
    Remote { server: String, tool_name: String },
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            Self::Remote { server, tool_name } => f
                .debug_struct("Remote")
                .field("server", server)
                .field("tool_name", tool_name)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: ToolDescriptor,
    handle: ToolHandle,
}

/// A tool dropped during the merge because its name was already taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCollision {
    pub tool: String,
    pub kept_owner: ToolOwner,
    pub dropped_owner: ToolOwner,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Accumulates tools in merge order.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    collisions: Vec<ToolCollision>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local(&mut self, tool: Arc<dyn LocalTool>) {
        let descriptor = local::describe(tool.as_ref());
        self.insert(descriptor, ToolHandle::Local(tool));
    }

    /// Add one server's discovered tools. With `qualify`, names are published
    /// as `server.tool` unless they already contain a dot.
    pub fn add_server_tools(&mut self, server: &str, tools: Vec<ToolDescriptor>, qualify: bool) {
        for mut descriptor in tools {
            let tool_name = descriptor.qualified_name.clone();
            if qualify && !tool_name.contains('.') {
                descriptor.qualified_name = format!("{server}.{tool_name}");
            }
            self.insert(
                descriptor,
                ToolHandle::Remote {
                    server: server.to_string(),
                    tool_name,
                },
            );
        }
    }

    fn insert(&mut self, descriptor: ToolDescriptor, handle: ToolHandle) {
        if let Some(&existing) = self.index.get(&descriptor.qualified_name) {
            let kept_owner = self.entries[existing].descriptor.owner.clone();
            tracing::warn!(
                tool = %descriptor.qualified_name,
                kept = %kept_owner,
                dropped = %descriptor.owner,
                "tool name collision"
            );
            self.collisions.push(ToolCollision {
                tool: descriptor.qualified_name,
                kept_owner,
                dropped_owner: descriptor.owner,
            });
            return;
        }
        self.index
            .insert(descriptor.qualified_name.clone(), self.entries.len());
        self.entries.push(Entry { descriptor, handle });
    }

    /// Freeze into a registry that routes remote calls through `sessions`.
    pub fn build(
        self,
        sessions: Weak<SessionManager>,
        call_timeout: Duration,
    ) -> (ToolRegistry, Vec<ToolCollision>) {
        let registry = ToolRegistry {
            entries: self.entries,
            index: self.index,
            sessions,
            call_timeout,
        };
        (registry, self.collisions)
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Every callable tool of one aggregation run.
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    /// Sessions are owned by the aggregation; the registry only routes.
    sessions: Weak<SessionManager>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ToolRegistry {
    fn entry(&self, name: &str) -> Option<&Entry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Look up a tool by its published name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entry(name).map(|e| &e.descriptor)
    }

    pub fn handle(&self, name: &str) -> Option<&ToolHandle> {
        self.entry(name).map(|e| &e.handle)
    }

    pub fn owner_of(&self, name: &str) -> Option<&ToolOwner> {
        self.get(name).map(|d| &d.owner)
    }

    /// All descriptors in merge order.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.descriptor.qualified_name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tools published by `server`.
    pub fn tools_for_server(&self, server: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.descriptor.owner.server_name() == Some(server))
            .count()
    }

    /// Validate and execute a tool call.
    ///
    /// Steps:
    /// 1. Resolve the name (unknown names get suggestions)
    /// 2. Validate arguments against the schema; no server is contacted on failure
    /// 3. Run locally, or send `tools/call` to the owning session
    /// 4. Fold server-reported tool errors into `success: false`
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();

        let entry = self.entry(name).ok_or_else(|| McpError::UnknownTool {
            name: name.to_string(),
            suggestions: self.find_similar(name, MAX_SUGGESTIONS),
        })?;

        validate_arguments(&entry.descriptor.parameter_schema, &arguments).map_err(|reason| {
            McpError::InvalidArguments {
                tool: name.to_string(),
                reason,
            }
        })?;

        let outcome = match &entry.handle {
            ToolHandle::Local(tool) => tool.call(arguments).await,
            ToolHandle::Remote { server, tool_name } => {
                self.call_remote(server, tool_name, arguments).await?
            }
        };

        let elapsed = start.elapsed().as_millis() as u64;
        tracing::debug!(
            tool = %name,
            owner = %entry.descriptor.owner,
            success = outcome.is_ok(),
            elapsed_ms = elapsed,
            "tool invoked"
        );

        Ok(match outcome {
            Ok(result) => ToolCallResult {
                tool_name: name.to_string(),
                success: true,
                result: Some(result),
                error: None,
                execution_time_ms: elapsed,
            },
            Err(error) => ToolCallResult {
                tool_name: name.to_string(),
                success: false,
                result: None,
                error: Some(error),
                execution_time_ms: elapsed,
            },
        })
    }

    /// Outer `Err` aborts the invocation; inner `Err` is a tool-level failure.
    async fn call_remote(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Result<Value, String>, McpError> {
        let sessions = self
            .sessions
            .upgrade()
            .ok_or_else(|| McpError::ServerUnavailable {
                server: server.to_string(),
                reason: "sessions have been shut down".into(),
            })?;

        match sessions
            .call_tool(server, tool_name, arguments, self.call_timeout)
            .await
        {
            Ok(raw) => {
                let is_error = serde_json::from_value::<CallToolResult>(raw.clone())
                    .ok()
                    .filter(|r| r.is_error)
                    .map(|r| r.text());
                Ok(match is_error {
                    Some(text) if text.is_empty() => Err("tool reported an error".into()),
                    Some(text) => Err(text),
                    None => Ok(raw),
                })
            }
            Err(McpError::ServerError { code, message, .. }) => Ok(Err(format!("[{code}] {message}"))),
            Err(e) => Err(e),
        }
    }

    /// Serialize all tools into OpenAI function-calling format, in merge order.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": e.descriptor.qualified_name,
                        "description": e.descriptor.description,
                        "parameters": e.descriptor.parameter_schema,
                    }
                })
            })
            .collect()
    }

    /// Up to `max_results` published names most similar to `name`.
    ///
    /// Qualified names are compared by their part after the last dot.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(&str, f64)> = self
            .entries
            .iter()
            .map(|e| {
                let published = e.descriptor.qualified_name.as_str();
                let suffix = published.rsplit('.').next().unwrap_or(published);
                (published, similarity(query, suffix))
            })
            .filter(|(_, score)| *score > MIN_SUGGESTION_SIMILARITY)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
