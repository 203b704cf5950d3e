use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunable timings for scanning and connection establishment.
///
/// All fields have serde defaults so a config file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// How long a scan runs before stopping on its own, in milliseconds.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Upper bound on the physical connect step, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Grace period after issuing all characteristic-discovery requests
    /// before the session is declared connected, in milliseconds.
    /// The engine does not count per-service discovery completions; it
    /// collects whatever arrives within this window.
    #[serde(default = "default_discovery_grace_ms")]
    pub discovery_grace_ms: u64,
    #[serde(default)]
    pub log: LogSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_grace_ms: default_discovery_grace_ms(),
            log: LogSettings::default(),
        }
    }
}

impl TransportConfig {
    /// Load a config from a JSON file, falling back to defaults for any
    /// missing fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default)]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: false,
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_grace_ms() -> u64 {
    500
}
fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wearlink".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let cfg: TransportConfig = serde_json::from_str(r#"{"scan_timeout_ms": 2500}"#).unwrap();
        assert_eq!(cfg.scan_timeout_ms, 2500);
        assert_eq!(cfg.discovery_grace_ms, 500);
        assert!(cfg.log.console_logging_enabled);
    }
}
