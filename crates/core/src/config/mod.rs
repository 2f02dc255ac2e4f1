use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::env::{HOOKLINE_CONFIG, HOOKLINE_CONNECTION_TIMEOUT_MS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Per-request deadline in milliseconds (0 = no deadline).
    ///
    /// When set, the in-process transport raises the timeout signal after
    /// this long and the request moves to `TimedOut`.
    #[serde(default)]
    pub connection_timeout_ms: u64,

    /// Upper bound for each `onReady` handler in milliseconds (0 = unbounded)
    #[serde(default = "default_plugin_timeout")]
    pub plugin_timeout_ms: u64,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,

    /// Header carrying a caller-supplied request id
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,

    /// Field name used for the request id in log spans
    #[serde(default = "default_request_id_log_label")]
    pub request_id_log_label: String,

    /// Skip the per-request "incoming request" / "request completed" logs
    #[serde(default)]
    pub disable_request_logging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_plugin_timeout() -> u64 {
    10_000
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_request_id_header() -> String {
    "request-id".to_string()
}
fn default_request_id_log_label() -> String {
    "req_id".to_string()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 0,
            plugin_timeout_ms: default_plugin_timeout(),
            body_limit: default_body_limit(),
            request_id_header: default_request_id_header(),
            request_id_log_label: default_request_id_log_label(),
            disable_request_logging: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    pub fn plugin_timeout(&self) -> Option<Duration> {
        (self.plugin_timeout_ms > 0).then(|| Duration::from_millis(self.plugin_timeout_ms))
    }
}

impl Config {
    /// Load config from `path`, or from `HOOKLINE_CONFIG` when no path is given.
    ///
    /// A missing file yields the defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::config_path(),
        };

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let content = fs::read_to_string(p)?;
                Self::from_toml_str(&content)?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> Option<PathBuf> {
        std::env::var_os(HOOKLINE_CONFIG).map(PathBuf::from)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(HOOKLINE_CONNECTION_TIMEOUT_MS) {
            self.server.connection_timeout_ms = raw.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {}: {}", HOOKLINE_CONNECTION_TIMEOUT_MS, e)
            })?;
        }
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "connection_timeout_ms"] => {
                Ok(self.server.connection_timeout_ms.to_string())
            }
            ["server", "plugin_timeout_ms"] => Ok(self.server.plugin_timeout_ms.to_string()),
            ["server", "body_limit"] => Ok(self.server.body_limit.to_string()),
            ["server", "request_id_header"] => Ok(self.server.request_id_header.clone()),
            ["server", "request_id_log_label"] => Ok(self.server.request_id_log_label.clone()),
            ["server", "disable_request_logging"] => {
                Ok(self.server.disable_request_logging.to_string())
            }
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "connection_timeout_ms"] => {
                self.server.connection_timeout_ms = value.parse()?
            }
            ["server", "plugin_timeout_ms"] => self.server.plugin_timeout_ms = value.parse()?,
            ["server", "body_limit"] => self.server.body_limit = value.parse()?,
            ["server", "request_id_header"] => {
                self.server.request_id_header = value.to_ascii_lowercase()
            }
            ["server", "request_id_log_label"] => {
                self.server.request_id_log_label = value.to_string()
            }
            ["server", "disable_request_logging"] => {
                self.server.disable_request_logging = value.parse()?
            }
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}
