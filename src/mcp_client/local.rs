//! Local tools: implemented in-process, registered ahead of any server.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{ToolDescriptor, ToolOwner};

/// A tool that runs inside this process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Object schema for the arguments.
    fn parameter_schema(&self) -> Value;

    /// Run the tool. `arguments` have already passed schema validation.
    async fn call(&self, arguments: Value) -> Result<Value, String>;
}

/// Descriptor published into the registry for a local tool.
pub fn describe(tool: &dyn LocalTool) -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: tool.name().to_string(),
        owner: ToolOwner::Local,
        parameter_schema: tool.parameter_schema(),
        description: tool.description().to_string(),
    }
}

/// The default set of local tools.
pub fn builtin_tools() -> Vec<Arc<dyn LocalTool>> {
    vec![Arc::new(AddTool)]
}

/// Adds two numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddTool;

#[async_trait]
impl LocalTool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers together."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number", "description": "First addend"},
                "b": {"type": "number", "description": "Second addend"}
            },
            "required": ["a", "b"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<Value, String> {
        let operand = |key: &str| {
            arguments
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("'{key}' must be a number"))
        };
        let sum = operand("a")? + operand("b")?;
        Ok(json!(sum))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
