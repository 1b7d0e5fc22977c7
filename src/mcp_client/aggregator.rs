//! Aggregator: turns a list of server definitions into one tool registry.
//!
//! A run validates the definitions, opens and enumerates every valid server
//! concurrently under a single deadline, then folds the results into a
//! registry in a fixed order: local tools first, then servers in the order
//! they were defined. One bad server never prevents the others from being
//! published; its failure is recorded in the report instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::definition::{validate_definitions, ServerDefinition, TransportKind};
use super::discovery::{self, DEFAULT_MAX_TOOLS};
use super::errors::{McpError, ValidationError};
use super::lifecycle::{Session, SessionManager, SessionOptions};
use super::local::{builtin_tools, LocalTool};
use super::registry::{RegistryBuilder, ToolCollision, ToolRegistry, DEFAULT_CALL_TIMEOUT};
use super::types::ToolDescriptor;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on a whole aggregation run.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Default bound on one server's `tools/list` enumeration.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Options ─────────────────────────────────────────────────────────────────

/// What happens to ready sessions once discovery is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRetention {
    /// Keep sessions open so the registry can route calls.
    #[default]
    KeepOpen,
    /// Close every session before the run returns (listing only).
    CloseAfterDiscovery,
}

#[derive(Debug, Clone)]
pub struct AggregationOptions {
    /// Overall bound on connect + handshake + discovery for every server.
    pub deadline: Duration,
    pub session: SessionOptions,
    pub discovery_timeout: Duration,
    pub call_timeout: Duration,
    pub max_tools_per_server: usize,
    /// Publish remote tools as `server.tool`.
    pub qualify_tool_names: bool,
    pub retention: SessionRetention,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            session: SessionOptions::default(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_tools_per_server: DEFAULT_MAX_TOOLS,
            qualify_tool_names: false,
            retention: SessionRetention::KeepOpen,
        }
    }
}

// ─── Report ──────────────────────────────────────────────────────────────────

/// How one server fared during the run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerOutcome {
    Ready { tool_count: usize },
    Failed { error: McpError },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub server: String,
    pub transport: TransportKind,
    pub outcome: ServerOutcome,
    pub elapsed_ms: u64,
}

/// Everything an operator needs to know about a run. Carries no env values.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub validation_failures: Vec<ValidationError>,
    /// One entry per valid definition, in input order.
    pub servers: Vec<ServerReport>,
    pub collisions: Vec<ToolCollision>,
    pub local_tool_count: usize,
    pub tool_count: usize,
}

impl AggregationReport {
    /// Whether anything was rejected, failed, or dropped.
    pub fn is_degraded(&self) -> bool {
        !self.validation_failures.is_empty()
            || !self.collisions.is_empty()
            || !self.failed_servers().is_empty()
    }

    pub fn failed_servers(&self) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|s| matches!(s.outcome, ServerOutcome::Failed { .. }))
            .map(|s| s.server.as_str())
            .collect()
    }

    pub fn ready_servers(&self) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|s| matches!(s.outcome, ServerOutcome::Ready { .. }))
            .map(|s| s.server.as_str())
            .collect()
    }

    /// Emit one line per problem plus a summary.
    pub fn log(&self) {
        for failure in &self.validation_failures {
            tracing::warn!(run_id = %self.run_id, error = %failure, "server definition rejected");
        }
        for server in &self.servers {
            if let ServerOutcome::Failed { error } = &server.outcome {
                tracing::warn!(
                    run_id = %self.run_id,
                    server = %server.server,
                    elapsed_ms = server.elapsed_ms,
                    error = %error,
                    "server unavailable"
                );
            }
        }
        tracing::info!(
            run_id = %self.run_id,
            ready = self.ready_servers().len(),
            failed = self.failed_servers().len(),
            rejected = self.validation_failures.len(),
            collisions = self.collisions.len(),
            tools = self.tool_count,
            "aggregation complete"
        );
    }
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

/// The product of a run.
pub struct Aggregation {
    pub registry: ToolRegistry,
    /// Owner of every session; the registry holds only a weak reference.
    pub sessions: Arc<SessionManager>,
    pub report: AggregationReport,
}

impl Aggregation {
    /// Close every session. Remote tools become unavailable afterwards.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

pub struct Aggregator {
    options: AggregationOptions,
    local_tools: Vec<Arc<dyn LocalTool>>,
}

impl Aggregator {
    /// An aggregator publishing the built-in local tools.
    pub fn new(options: AggregationOptions) -> Self {
        Self {
            options,
            local_tools: builtin_tools(),
        }
    }

    /// Replace the local tool set.
    pub fn with_local_tools(mut self, tools: Vec<Arc<dyn LocalTool>>) -> Self {
        self.local_tools = tools;
        self
    }

    pub fn options(&self) -> &AggregationOptions {
        &self.options
    }

    /// Run one aggregation over `raw` definitions.
    ///
    /// Only an empty request is an error; every per-server problem ends up
    /// in the report.
    pub async fn run(&self, raw: &[Value]) -> Result<Aggregation, McpError> {
        if raw.is_empty() {
            return Err(McpError::InvalidRequest {
                reason: "no server definitions supplied".into(),
            });
        }

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("aggregate", %run_id);
        self.run_inner(run_id, raw).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, raw: &[Value]) -> Result<Aggregation, McpError> {
        let started_at = Utc::now();
        let validated = validate_definitions(raw);
        tracing::info!(
            definitions = raw.len(),
            valid = validated.valid.len(),
            rejected = validated.failures.len(),
            "starting aggregation"
        );

        let sessions = Arc::new(SessionManager::new(self.options.session.clone()));
        let outcomes = self.discover_all(&sessions, &validated.valid).await;

        let mut builder = RegistryBuilder::new();
        for tool in &self.local_tools {
            builder.add_local(Arc::clone(tool));
        }

        let mut servers = Vec::with_capacity(outcomes.len());
        for (definition, (result, elapsed_ms)) in validated.valid.iter().zip(outcomes) {
            let outcome = match result {
                Ok(tools) => {
                    let tool_count = tools.len();
                    builder.add_server_tools(
                        &definition.name,
                        tools,
                        self.options.qualify_tool_names,
                    );
                    ServerOutcome::Ready { tool_count }
                }
                Err(error) => ServerOutcome::Failed { error },
            };
            servers.push(ServerReport {
                server: definition.name.clone(),
                transport: definition.transport,
                outcome,
                elapsed_ms,
            });
        }

        let (registry, collisions) =
            builder.build(Arc::downgrade(&sessions), self.options.call_timeout);

        if self.options.retention == SessionRetention::CloseAfterDiscovery {
            sessions.shutdown().await;
        }

        let report = AggregationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            validation_failures: validated.failures,
            servers,
            collisions,
            local_tool_count: self.local_tools.len(),
            tool_count: registry.len(),
        };
        report.log();

        Ok(Aggregation {
            registry,
            sessions,
            report,
        })
    }

    /// Open and enumerate every server concurrently. Results come back in
    /// the order of `definitions`, whatever order the tasks finish in.
    async fn discover_all(
        &self,
        sessions: &Arc<SessionManager>,
        definitions: &[ServerDefinition],
    ) -> Vec<(Result<Vec<ToolDescriptor>, McpError>, u64)> {
        let deadline = Instant::now() + self.options.deadline;
        let deadline_ms = self.options.deadline.as_millis() as u64;

        let tasks: Vec<_> = definitions
            .iter()
            .map(|definition| {
                let session = sessions.create(definition);
                let discovery_timeout = self.options.discovery_timeout;
                let max_tools = self.options.max_tools_per_server;
                tokio::spawn(
                    discover_server(session, deadline, deadline_ms, discovery_timeout, max_tools)
                        .in_current_span(),
                )
            })
            .collect();

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .zip(definitions)
            .map(|(joined, definition)| {
                joined.unwrap_or_else(|e| {
                    let error = McpError::Transport {
                        server: definition.name.clone(),
                        reason: format!("discovery task failed: {e}"),
                    };
                    (Err(error), 0)
                })
            })
            .collect()
    }
}

/// Connect, handshake, and enumerate one server before `deadline`.
///
/// A session that does not make it is closed before returning.
async fn discover_server(
    session: Arc<Session>,
    deadline: Instant,
    deadline_ms: u64,
    discovery_timeout: Duration,
    max_tools: usize,
) -> (Result<Vec<ToolDescriptor>, McpError>, u64) {
    let started = Instant::now();
    let work = async {
        session.connect().await?;
        discovery::list_tools(&session, discovery_timeout, max_tools).await
    };

    let result = match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(McpError::DeadlineExceeded {
            server: session.name().to_string(),
            deadline_ms,
        }),
    };

    if result.is_err() {
        session.abort().await;
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(tools) => {
            tracing::debug!(server = %session.name(), tools = tools.len(), elapsed_ms, "server ready")
        }
        Err(e) => tracing::debug!(server = %session.name(), error = %e, elapsed_ms, "server failed"),
    }
    (result, elapsed_ms)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
