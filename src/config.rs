//! Configuration loading.
//!
//! Reads `servers.yaml` (JSON is accepted too, being valid YAML) and resolves
//! environment variables inside server definitions. Secrets therefore live
//! in the environment, never in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::mcp_client::aggregator::AggregationOptions;
use crate::mcp_client::lifecycle::SessionOptions;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TOOLHUB_CONFIG";

/// File name looked up under the platform config directory.
const DEFAULT_CONFIG_FILE: &str = "servers.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found: pass --config, set TOOLHUB_CONFIG, or create {searched}")]
    NotFound { searched: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── HubConfig ───────────────────────────────────────────────────────────────

/// Top-level config file (mirrors `servers.yaml`).
#[derive(Clone, Deserialize)]
pub struct HubConfig {
    /// Bound on the whole aggregation run.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// How long a subprocess gets to exit after stdin closes.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_tools_per_server")]
    pub max_tools_per_server: usize,
    /// Publish remote tools as `server.tool` instead of bare names.
    #[serde(default)]
    pub qualify_tool_names: bool,
    /// Raw server definitions, validated at aggregation time.
    #[serde(default)]
    pub servers: Vec<Value>,
}

fn default_deadline_secs() -> u64 {
    60
}
fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_discovery_timeout_secs() -> u64 {
    15
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_max_tools_per_server() -> usize {
    1024
}

// Server entries carry resolved secrets, so only their count is shown.
impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("deadline_secs", &self.deadline_secs)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("discovery_timeout_secs", &self.discovery_timeout_secs)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("max_tools_per_server", &self.max_tools_per_server)
            .field("qualify_tool_names", &self.qualify_tool_names)
            .field("servers", &self.servers.len())
            .finish()
    }
}

impl HubConfig {
    /// Options for an `Aggregator` built from this config.
    pub fn aggregation_options(&self) -> AggregationOptions {
        AggregationOptions {
            deadline: Duration::from_secs(self.deadline_secs),
            session: SessionOptions {
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
                max_frame_bytes: self.max_frame_bytes,
            },
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_tools_per_server: self.max_tools_per_server,
            qualify_tool_names: self.qualify_tool_names,
            ..AggregationOptions::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zeroes = [
            ("deadline_secs", self.deadline_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("max_tools_per_server", self.max_tools_per_server as u64),
        ];
        match zeroes.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Invalid {
                reason: format!("'{field}' must be greater than zero"),
            }),
            None => Ok(()),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Order: `explicit` (from `--config`), then `TOOLHUB_CONFIG`, then
/// `<config dir>/toolhub/servers.yaml` if it exists.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(expand_tilde(path.trim())));
        }
    }

    let default = default_config_path();
    if let Some(candidate) = default.as_ref().filter(|p| p.exists()) {
        return Ok(candidate.clone());
    }
    Err(ConfigError::NotFound {
        searched: default
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("toolhub/{DEFAULT_CONFIG_FILE}")),
    })
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("toolhub").join(DEFAULT_CONFIG_FILE))
}

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<HubConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&raw).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })?;

    tracing::debug!(path = %path.display(), servers = config.servers.len(), "config loaded");
    Ok(config)
}

/// Parse config text and interpolate `${VAR}` / `${VAR:-default}` inside the
/// string values of server definitions.
///
/// Interpolation happens after parsing, so a resolved value can never break
/// the YAML structure, and parse errors never quote a resolved secret.
pub fn parse_config(text: &str) -> Result<HubConfig, ConfigError> {
    let document: Value = if text.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?
    };

    let mut config: HubConfig =
        serde_json::from_value(document).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
    config.validate()?;

    for server in &mut config.servers {
        interpolate_value(server);
    }
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Interpolate every string in a JSON tree, keys excluded.
fn interpolate_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = interpolate_env_vars(s);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(interpolate_value),
        Value::Object(map) => map.values_mut().for_each(interpolate_value),
        _ => {}
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();

        let mut expr = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            expr.push(c);
        }

        if closed {
            result.push_str(&resolve_var_expr(&expr));
        } else {
            // Unterminated: keep the text as written.
            result.push_str("${");
            result.push_str(&expr);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Only the variable name is ever logged.
fn resolve_var_expr(expr: &str) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };

    match (std::env::var(name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => expand_tilde(default),
        (Err(_), None) => {
            tracing::warn!(var = %name, "environment variable not set; using empty string");
            String::new()
        }
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply() {
        let config = parse_config("servers: []").unwrap();
        assert_eq!(config.deadline_secs, 60);
        assert_eq!(config.handshake_timeout_secs, 30);
        assert_eq!(config.discovery_timeout_secs, 15);
        assert_eq!(config.call_timeout_secs, 30);
        assert_eq!(config.shutdown_grace_secs, 5);
        assert_eq!(config.max_frame_bytes, 4 * 1024 * 1024);
        assert_eq!(config.max_tools_per_server, 1024);
        assert!(!config.qualify_tool_names);
        assert!(config.servers.is_empty());

        assert!(parse_config("").unwrap().servers.is_empty());
    }

    #[test]
    fn test_yaml_servers_keep_order() {
        let yaml = r#"
            deadline_secs: 10
            qualify_tool_names: true
            servers:
              - name: github
                command: npx
                args: ["-y", "@modelcontextprotocol/server-github"]
              - name: search
                transport: tcp
                endpoint: "127.0.0.1:9000"
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.deadline_secs, 10);
        assert!(config.qualify_tool_names);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0]["name"], "github");
        assert_eq!(config.servers[0]["args"][1], "@modelcontextprotocol/server-github");
        assert_eq!(config.servers[1]["endpoint"], "127.0.0.1:9000");
    }

    #[test]
    fn test_json_is_accepted() {
        let json = r#"{"call_timeout_secs": 3, "servers": [{"name": "a", "command": "a-server"}]}"#;
        let config = parse_config(json).unwrap();
        assert_eq!(config.call_timeout_secs, 3);
        assert_eq!(config.servers[0]["command"], "a-server");
    }

    #[test]
    fn test_env_interpolated_inside_server_values() {
        std::env::set_var("__TOOLHUB_TEST_TOKEN__", "ghp-secret-value");
        std::env::remove_var("__TOOLHUB_TEST_UNSET__");
        let yaml = r#"
            servers:
              - name: github
                command: npx
                args: ["--root", "${__TOOLHUB_TEST_UNSET__:-/srv/data}"]
                env:
                  GITHUB_TOKEN: "${__TOOLHUB_TEST_TOKEN__}"
                  EMPTY: "${__TOOLHUB_TEST_UNSET__}"
                  LITERAL: "cost: $5 {not a var}"
        "#;
        let config = parse_config(yaml).unwrap();
        let server = &config.servers[0];
        assert_eq!(server["env"]["GITHUB_TOKEN"], "ghp-secret-value");
        assert_eq!(server["env"]["EMPTY"], "");
        assert_eq!(server["env"]["LITERAL"], "cost: $5 {not a var}");
        assert_eq!(server["args"][1], "/srv/data");
        std::env::remove_var("__TOOLHUB_TEST_TOKEN__");
    }

    #[test]
    fn test_debug_hides_server_values() {
        std::env::set_var("__TOOLHUB_TEST_DEBUG__", "do-not-print-me");
        let yaml = r#"
            servers:
              - name: x
                command: x
                env: {TOKEN: "${__TOOLHUB_TEST_DEBUG__}"}
        "#;
        let config = parse_config(yaml).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("do-not-print-me"));
        assert!(debug.contains("servers: 1"));
        std::env::remove_var("__TOOLHUB_TEST_DEBUG__");
    }

    #[test]
    fn test_unterminated_reference_is_literal() {
        assert_eq!(interpolate_env_vars("abc ${OOPS"), "abc ${OOPS");
        assert_eq!(interpolate_env_vars("plain text"), "plain text");
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = parse_config("deadline_secs: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("deadline_secs"));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_config("servers: [unclosed"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            parse_config("deadline_secs: soon"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_aggregation_options_mapping() {
        let config = parse_config("deadline_secs: 9\nshutdown_grace_secs: 1\nmax_tools_per_server: 7").unwrap();
        let options = config.aggregation_options();
        assert_eq!(options.deadline, Duration::from_secs(9));
        assert_eq!(options.session.shutdown_grace, Duration::from_secs(1));
        assert_eq!(options.session.handshake_timeout, Duration::from_secs(30));
        assert_eq!(options.max_tools_per_server, 7);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers:\n  - name: fs\n    command: fs-server").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers[0]["name"], "fs");
    }

    #[test]
    fn test_load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = load_config(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("nope.yaml"));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "servers: {").unwrap();
        let err = load_config(&bad).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/tmp/explicit.yaml");
        assert_eq!(find_config_path(Some(path)).unwrap(), path);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers.yaml");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/servers.yaml"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }
}
