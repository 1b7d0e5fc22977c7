//! Server definitions and their validation.
//!
//! Raw definitions arrive untyped (`serde_json::Value`, usually straight out
//! of the config file). Each entry is checked independently: a malformed
//! entry produces a `ValidationError` and the rest of the batch carries on.

use std::collections::{BTreeMap, HashMap};

use super::errors::ValidationError;

// ─── Types ───────────────────────────────────────────────────────────────────

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout.
    #[default]
    Subprocess,
    /// TCP socket speaking JSON-RPC, one message per line.
    Networked,
}

impl TransportKind {
    /// Parse the `transport` field of a raw definition.
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "stdio" | "subprocess" => Some(Self::Subprocess),
            "tcp" | "networked" => Some(Self::Networked),
            _ => None,
        }
    }
}

/// Transport-specific bootstrap target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    /// Spawn `command args…`, optionally inside `cwd`.
    Command {
        command: String,
        args: Vec<String>,
        cwd: Option<String>,
    },
    /// Connect to `host:port`.
    Endpoint { address: String },
}

/// A validated server definition.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    pub name: String,
    pub transport: TransportKind,
    pub target: TransportTarget,
    /// Injected into the process environment (subprocess) or sent as
    /// connection headers (networked). Never logged.
    pub env: BTreeMap<String, String>,
}

impl ServerDefinition {
    /// Subprocess definition with no environment.
    pub fn subprocess(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Subprocess,
            target: TransportTarget::Command {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: None,
            },
            env: BTreeMap::new(),
        }
    }

    /// Networked definition with no headers.
    pub fn networked(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Networked,
            target: TransportTarget::Endpoint {
                address: address.to_string(),
            },
            env: BTreeMap::new(),
        }
    }

    /// Add one environment entry.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Values that must never leak into logs or error text.
    pub fn secret_values(&self) -> Vec<&str> {
        self.env
            .values()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Replace every environment value occurring in `text` with `***`.
    pub fn redact(&self, text: &str) -> String {
        redact_secrets(text, &self.secret_values())
    }
}

/// Replace each secret occurring in `text` with `***`, longest first so a
/// secret that contains another is not half-masked.
pub fn redact_secrets(text: &str, secrets: &[&str]) -> String {
    let mut ordered: Vec<&str> = secrets.iter().copied().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        out = out.replace(secret, "***");
    }
    out
}

impl std::fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("target", &self.target)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of validating a batch of raw definitions.
#[derive(Debug, Clone, Default)]
pub struct ValidatedDefinitions {
    /// Valid definitions, in input order.
    pub valid: Vec<ServerDefinition>,
    /// One error per rejected entry, in input order.
    pub failures: Vec<ValidationError>,
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate an ordered batch of raw server definitions.
///
/// Entries sharing a name are all rejected; the error names every index
/// involved so the operator can find both copies.
pub fn validate_definitions(raw: &[serde_json::Value]) -> ValidatedDefinitions {
    let mut name_indices: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, entry) in raw.iter().enumerate() {
        if let Some(name) = entry_name(entry) {
            name_indices.entry(name.to_string()).or_default().push(index);
        }
    }

    let mut out = ValidatedDefinitions::default();

    for (index, entry) in raw.iter().enumerate() {
        let name = entry_name(entry).map(str::to_string);

        if let Some(indices) = name.as_ref().and_then(|n| name_indices.get(n)) {
            if indices.len() > 1 {
                let listed: Vec<String> = indices.iter().map(|i| format!("#{i}")).collect();
                out.failures.push(ValidationError {
                    index,
                    name,
                    reason: format!("duplicate server name (entries {})", listed.join(", ")),
                });
                continue;
            }
        }

        match parse_definition(entry) {
            Ok(def) => out.valid.push(def),
            Err(reason) => out.failures.push(ValidationError {
                index,
                name,
                reason,
            }),
        }
    }

    tracing::debug!(
        valid = out.valid.len(),
        rejected = out.failures.len(),
        "validated server definitions"
    );
    out
}

/// The entry's name if it is a non-empty string.
fn entry_name(entry: &serde_json::Value) -> Option<&str> {
    entry
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
}

fn parse_definition(entry: &serde_json::Value) -> Result<ServerDefinition, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;

    let name = match obj.get("name") {
        None | Some(serde_json::Value::Null) => return Err("missing 'name'".into()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
            return Err("'name' must not be empty".into())
        }
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(_) => return Err("'name' must be a string".into()),
    };

    let transport = match obj.get("transport") {
        None | Some(serde_json::Value::Null) => TransportKind::default(),
        Some(serde_json::Value::String(s)) => TransportKind::parse(s).ok_or_else(|| {
            format!("unsupported transport '{s}' (expected stdio, subprocess, tcp or networked)")
        })?,
        Some(_) => return Err("'transport' must be a string".into()),
    };

    let env = parse_env(obj.get("env"))?;

    let target = match transport {
        TransportKind::Subprocess => TransportTarget::Command {
            command: required_string(obj, "command")?,
            args: parse_args(obj.get("args"))?,
            cwd: optional_string(obj, "cwd")?,
        },
        TransportKind::Networked => {
            let address = required_string(obj, "endpoint")?;
            if !looks_like_host_port(&address) {
                return Err(format!("'endpoint' must be host:port, got '{address}'"));
            }
            TransportTarget::Endpoint { address }
        }
    };

    Ok(ServerDefinition {
        name,
        transport,
        target,
        env,
    })
}

fn required_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<String, String> {
    match obj.get(key) {
        None | Some(serde_json::Value::Null) => Err(format!("missing '{key}'")),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
            Err(format!("'{key}' must not be empty"))
        }
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(format!("'{key}' must be a string")),
    }
}

fn optional_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, String> {
    match obj.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("'{key}' must be a string")),
    }
}

fn parse_args(raw: Option<&serde_json::Value>) -> Result<Vec<String>, String> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| "'args' must be a list of strings".to_string())?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("'args[{i}]' must be a string"))
        })
        .collect()
}

/// Values are never echoed back in the reason text; only keys are.
fn parse_env(raw: Option<&serde_json::Value>) -> Result<BTreeMap<String, String>, String> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(BTreeMap::new());
    };
    let map = raw
        .as_object()
        .ok_or_else(|| "'env' must be a mapping of strings".to_string())?;

    let mut env = BTreeMap::new();
    for (key, value) in map {
        if key.is_empty() || key.contains('=') {
            return Err(format!("'env' has an invalid variable name '{key}'"));
        }
        let value = value
            .as_str()
            .ok_or_else(|| format!("'env.{key}' must be a string"))?;
        env.insert(key.clone(), value.to_string());
    }
    Ok(env)
}

fn looks_like_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
