//! MCP Client: aggregates tools from many MCP servers into one registry.
//!
//! This module handles:
//! - Validating declarative server definitions
//! - JSON-RPC 2.0 over subprocess stdio or TCP
//! - Session lifecycle (connect, handshake, close)
//! - Tool discovery and deterministic merging across servers
//! - Tool call validation and routing
//!
//! The registry produced by an `Aggregator` run is what an agent execution
//! loop consumes: `descriptors()` for the model, `invoke()` per call.

pub mod aggregator;
pub mod definition;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod local;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use aggregator::{
    Aggregation, AggregationOptions, AggregationReport, Aggregator, ServerOutcome, ServerReport,
    SessionRetention,
};
pub use definition::{validate_definitions, ServerDefinition, TransportKind};
pub use errors::{McpError, ValidationError};
pub use lifecycle::{SessionManager, SessionOptions, SessionState};
pub use local::LocalTool;
pub use registry::{ToolCollision, ToolRegistry};
pub use types::{ToolCallResult, ToolDescriptor, ToolOwner};
