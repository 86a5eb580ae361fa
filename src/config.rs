//! xlang-proxy configuration
//!
//! Read from `--config <path>` or the default location:
//! - Linux: ~/.config/xlang-proxy/config.toml
//! - macOS: ~/Library/Application Support/xlang-proxy/config.toml
//!
//! A missing file yields the defaults. Example:
//!
//! ```toml
//! listen = "127.0.0.1:4389"
//!
//! [sessions]
//! max_sessions = 64
//! idle_timeout_secs = 600
//!
//! [backends.go]
//! command = "go-langserver"
//! args = ["-mode=stdio"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vfs::archive::DEFAULT_URL_TEMPLATE;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address for LSP-framed client connections
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Optional address for WebSocket client connections
    #[serde(default)]
    pub websocket_listen: Option<String>,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backend command per mode
    #[serde(default)]
    pub backends: BTreeMap<String, BackendCommand>,
}

fn default_listen() -> String {
    "127.0.0.1:4389".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            websocket_listen: None,
            sessions: SessionConfig::default(),
            archive: ArchiveConfig::default(),
            logging: LoggingConfig::default(),
            backends: BTreeMap::new(),
        }
    }
}

/// Session pool limits and timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Concurrent requests allowed per session
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Sessions idle longer than this are reaped
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the reaper runs
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Grace period for a backend to exit after `shutdown`
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_max_sessions() -> usize {
    64
}

fn default_max_in_flight() -> usize {
    256
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_in_flight: default_max_in_flight(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Remote archive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// URL template with `{host}`, `{repo}` and `{rev}` placeholders
    #[serde(default = "default_url_template")]
    pub url_template: String,

    /// Bearer token sent with archive downloads
    #[serde(default)]
    pub token: Option<String>,
}

fn default_url_template() -> String {
    DEFAULT_URL_TEMPLATE.to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            token: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log errors returned to clients (invalid locations are never logged)
    #[serde(default = "default_true")]
    pub log_tracked_errors: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_tracked_errors: true,
        }
    }
}

/// How to start the backend for one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCommand {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl ProxyConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("xlang-proxy").join("config.toml"))
    }

    /// Load from the default path, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a specific path; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the proxy cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.sessions.max_sessions == 0 {
            return invalid("sessions.max_sessions must be at least 1".to_string());
        }
        if self.sessions.max_in_flight == 0 {
            return invalid("sessions.max_in_flight must be at least 1".to_string());
        }
        if self.sessions.reap_interval_secs == 0 {
            return invalid("sessions.reap_interval_secs must be at least 1".to_string());
        }
        if self.sessions.request_timeout_secs == 0 {
            return invalid("sessions.request_timeout_secs must be at least 1".to_string());
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return invalid(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }
        for (mode, backend) in &self.backends {
            if backend.command.trim().is_empty() {
                return invalid(format!("backends.{}.command is empty", mode));
            }
        }
        Ok(())
    }

    /// Render the resolved configuration as TOML
    pub fn display(&self) -> String {
        match toml::to_string_pretty(self) {
            Ok(text) => text,
            Err(e) => format!("# failed to render configuration: {}\n", e),
        }
    }
}
