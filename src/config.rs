//! Gateway configuration.
//!
//! Resolved once at startup from environment variables, with timeouts
//! optionally overridden by a YAML file:
//!
//! | Variable                  | Meaning                                         |
//! |---------------------------|-------------------------------------------------|
//! | `MCP_GATEWAY_REGISTRY`    | registry file (default `mcp_registry.json`)     |
//! | `MCP_GATEWAY_ADMIN_TOKEN` | admin secret; empty or unset leaves admin open  |
//! | `MCP_GATEWAY_DEBUG`       | verbose logging unless empty, `0`, or `false`   |
//! | `MCP_GATEWAY_CONFIG`      | optional YAML file with timeout overrides       |
//!
//! String values in the YAML file may reference `${VAR}` or `${VAR:-default}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_REGISTRY: &str = "MCP_GATEWAY_REGISTRY";
pub const ENV_ADMIN_TOKEN: &str = "MCP_GATEWAY_ADMIN_TOKEN";
pub const ENV_DEBUG: &str = "MCP_GATEWAY_DEBUG";
pub const ENV_CONFIG: &str = "MCP_GATEWAY_CONFIG";

const DEFAULT_REGISTRY_FILE: &str = "mcp_registry.json";

#[derive(Debug, Error)]
#[error("config error: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Bounds on downstream operations, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Timeouts {
    /// Each connect phase: open, initialize, list.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// A whole admin registration, tighter than three connect phases.
    #[serde(default = "default_register_timeout")]
    pub register_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Grace period for a pipe server to exit after stdin closes.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_register_timeout() -> u64 {
    20
}
fn default_call_timeout() -> u64 {
    60
}
fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            register_timeout_secs: default_register_timeout(),
            call_timeout_secs: default_call_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn register(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// ─── GatewayConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub registry_path: PathBuf,
    pub admin_token: Option<String>,
    pub debug: bool,
    pub timeouts: Timeouts,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_REGISTRY_FILE),
            admin_token: None,
            debug: false,
            timeouts: Timeouts::default(),
        }
    }
}

impl GatewayConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve using `lookup` for variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = GatewayConfig::default();

        if let Some(path) = lookup(ENV_REGISTRY).filter(|p| !p.trim().is_empty()) {
            config.registry_path = PathBuf::from(path.trim());
        }
        config.admin_token = lookup(ENV_ADMIN_TOKEN).filter(|t| !t.is_empty());
        config.debug = lookup(ENV_DEBUG).is_some_and(|v| is_truthy(&v));

        if let Some(path) = lookup(ENV_CONFIG).filter(|p| !p.trim().is_empty()) {
            config.timeouts = load_timeouts(Path::new(path.trim()), &lookup)?;
        }

        Ok(config)
    }
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
}

/// Load timeout overrides from a YAML file.
pub fn load_timeouts(
    path: &Path,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Timeouts, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw, lookup);

    // An empty document means "all defaults".
    if interpolated.trim().is_empty() {
        return Ok(Timeouts::default());
    }

    let timeouts: Timeouts = serde_yaml::from_str(&interpolated).map_err(|e| ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })?;

    if timeouts.connect_timeout_secs == 0 || timeouts.register_timeout_secs == 0 || timeouts.call_timeout_secs == 0 {
        return Err(ConfigError {
            reason: "timeouts must be greater than zero".into(),
        });
    }
    Ok(timeouts)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            match expr.split_once(":-") {
                Some((name, default)) => result.push_str(&lookup(name).unwrap_or_else(|| default.to_string())),
                None => result.push_str(&lookup(&expr).unwrap_or_default()),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.registry_path, PathBuf::from("mcp_registry.json"));
        assert!(config.admin_token.is_none());
        assert!(!config.debug);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(10));
        assert_eq!(config.timeouts.register(), Duration::from_secs(20));
    }

    #[test]
    fn test_empty_token_means_unset() {
        let config =
            GatewayConfig::from_lookup(lookup_from(&[(ENV_ADMIN_TOKEN, "")])).unwrap();
        assert!(config.admin_token.is_none());

        let config =
            GatewayConfig::from_lookup(lookup_from(&[(ENV_ADMIN_TOKEN, "s3cret")])).unwrap();
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_debug_toggle() {
        for (value, expected) in [("1", true), ("yes", true), ("0", false), ("FALSE", false), ("", false)] {
            let config = GatewayConfig::from_lookup(lookup_from(&[(ENV_DEBUG, value)])).unwrap();
            assert_eq!(config.debug, expected, "value {value:?}");
        }
    }

    #[test]
    fn test_yaml_overrides_with_interpolation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "connect_timeout_secs: ${CONNECT:-3}\ncall_timeout_secs: ${CALL}\n",
        )
        .unwrap();

        let config = GatewayConfig::from_lookup(lookup_from(&[
            (ENV_CONFIG, path.to_str().unwrap()),
            ("CALL", "120"),
        ]))
        .unwrap();
        assert_eq!(config.timeouts.connect_timeout_secs, 3);
        assert_eq!(config.timeouts.call_timeout_secs, 120);
        assert_eq!(config.timeouts.shutdown_timeout_secs, 5);
    }

    #[test]
    fn test_bad_yaml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.yaml");
        std::fs::write(&path, "connect_timeout_secs: [not a number").unwrap();
        let err = GatewayConfig::from_lookup(lookup_from(&[(ENV_CONFIG, path.to_str().unwrap())]))
            .unwrap_err();
        assert!(err.reason.contains("failed to parse"));

        std::fs::write(&path, "connect_timeout_secs: 0\n").unwrap();
        assert!(GatewayConfig::from_lookup(lookup_from(&[(ENV_CONFIG, path.to_str().unwrap())])).is_err());
    }
}
