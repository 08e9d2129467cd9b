//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/progvis/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/progvis/` (~/.config/progvis/)
//! - State/Logs: `$XDG_STATE_HOME/progvis/` (~/.local/state/progvis/)
//!
//! The reporter never reads the environment on its own. The bootstrap layer
//! calls [`ReporterConfig::apply_env`] once before starting a reporter.

use crate::error::{Error, Result};
use crate::scheduler::FlushWindow;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default collector endpoint
pub const DEFAULT_SERVER_URL: &str = "https://progvis.com/api/v1/progress";

/// Environment variable holding the client token
pub const TOKEN_ENV: &str = "PV_TOKEN";

/// Environment variable overriding the collector endpoint
pub const SERVER_URL_ENV: &str = "PV_API";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Reporter configuration
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Progress reporter configuration
///
/// Without a token the reporter buffers locally and never uploads.
#[derive(Debug, Deserialize, Clone)]
pub struct ReporterConfig {
    /// Client token sent as the `token` query parameter
    pub token: Option<String>,

    /// Collector endpoint
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Include argv and hostname in uploads
    #[serde(default)]
    pub collect_context: bool,

    /// Mark the session as failed when the process panics
    #[serde(default)]
    pub capture_panics: bool,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Quiet period before coalesced step/log traffic is flushed
    #[serde(default = "default_flush_wait_ms")]
    pub flush_wait_ms: u64,

    /// Longest a coalesced burst may wait
    #[serde(default = "default_flush_wait_ms")]
    pub flush_max_wait_ms: u64,

    /// Quiet period after a lifecycle transition
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Longest a lifecycle flush may wait
    #[serde(default = "default_settle_max_ms")]
    pub settle_max_ms: u64,

    /// Consecutive retryable failures before uploads stop
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            token: None,
            server_url: default_server_url(),
            collect_context: false,
            capture_panics: false,
            timeout_ms: default_timeout_ms(),
            flush_wait_ms: default_flush_wait_ms(),
            flush_max_wait_ms: default_flush_wait_ms(),
            settle_ms: default_settle_ms(),
            settle_max_ms: default_settle_max_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_flush_wait_ms() -> u64 {
    10_000
}

fn default_settle_ms() -> u64 {
    100
}

fn default_settle_max_ms() -> u64 {
    1000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl ReporterConfig {
    /// Returns true if a non-blank token is configured
    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Fill gaps from environment-style variables.
    ///
    /// `PV_TOKEN` is used only when no token is configured; `PV_API`
    /// overrides the server URL. `lookup` is normally `std::env::var(..).ok()`.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.has_token() {
            self.token = lookup(TOKEN_ENV).filter(|t| !t.trim().is_empty());
        }
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.server_url = url;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn coalesce_window(&self) -> FlushWindow {
        FlushWindow::new(
            Duration::from_millis(self.flush_wait_ms),
            Duration::from_millis(self.flush_max_wait_ms),
        )
    }

    pub fn settle_window(&self) -> FlushWindow {
        FlushWindow::new(
            Duration::from_millis(self.settle_ms),
            Duration::from_millis(self.settle_max_ms),
        )
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.server_url).map_err(|e| {
            Error::Config(format!(
                "reporter.server_url is not a valid URL ({}): {}",
                self.server_url, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(
                "reporter.server_url must use http or https".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "reporter.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.flush_max_wait_ms < self.flush_wait_ms {
            return Err(Error::Config(
                "reporter.flush_max_wait_ms must be >= reporter.flush_wait_ms".to_string(),
            ));
        }
        if self.settle_max_ms < self.settle_ms {
            return Err(Error::Config(
                "reporter.settle_max_ms must be >= reporter.settle_ms".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "reporter.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/progvis/config.toml` (~/.config/progvis/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("progvis").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/progvis/` (~/.local/state/progvis/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("progvis")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/progvis/progvis.log` (~/.local/state/progvis/progvis.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("progvis.log")
    }
}
