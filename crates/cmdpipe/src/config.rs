//! Configuration for a command pipe connection.
//!
//! Config priority: explicit path (`--config`) > user (~/.config/cmdpipe/config.toml) > defaults.
//! Every section is `#[serde(default)]`, so a partial file only overrides what it names.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

// ============================================================================
// Transport Configuration
// ============================================================================

/// Connection and teardown settings for the duplex stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
  /// Unix socket of the controller process.
  /// Default: `$XDG_RUNTIME_DIR/cmdpipe.sock`, else the temp dir
  #[serde(skip_serializing_if = "Option::is_none")]
  pub socket_path: Option<PathBuf>,

  /// How long to wait for the controller to accept the connection
  /// Default: 10000
  pub connect_timeout_ms: u64,

  /// How long `close()` waits for background loops before giving up with a warning
  /// Default: 5000
  pub close_timeout_ms: u64,

  /// Lines longer than this are discarded
  /// Default: 1 MiB
  pub max_line_length: usize,
}

impl TransportConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn close_timeout(&self) -> Duration {
    Duration::from_millis(self.close_timeout_ms)
  }

  /// The configured socket path, or the platform default
  pub fn socket_path(&self) -> PathBuf {
    self.socket_path.clone().unwrap_or_else(default_socket_path)
  }
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      socket_path: None,
      connect_timeout_ms: 10_000,
      close_timeout_ms: 5_000,
      max_line_length: 1024 * 1024,
    }
  }
}

// ============================================================================
// Dispatch Configuration
// ============================================================================

/// Tick loop and control-command settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
  /// Interval between dispatcher ticks in milliseconds
  /// Default: 20
  pub tick_interval_ms: u64,

  /// Experiments accepted by `run <name>`. Empty accepts any name.
  pub experiments: Vec<String>,
}

impl DispatchConfig {
  pub fn tick_interval(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms.max(1))
  }

  pub fn knows_experiment(&self, name: &str) -> bool {
    self.experiments.is_empty() || self.experiments.iter().any(|e| e == name)
  }
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      tick_interval_ms: 20,
      experiments: Vec::new(),
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  pub log_rotation: String,

  /// Directory for background log files. Default: the data dir
  #[serde(skip_serializing_if = "Option::is_none")]
  pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
  pub fn log_dir(&self) -> PathBuf {
    self.log_dir.clone().unwrap_or_else(default_data_dir)
  }
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
      log_dir: None,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub transport: TransportConfig,
  pub dispatch: DispatchConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load and parse a config file
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load the explicit config if given, else the user config, else defaults.
  ///
  /// An explicit path that fails to load is an error; a broken user config is
  /// logged and skipped.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit {
      return Self::load_from(path);
    }

    if let Some(user_path) = Self::user_config_path()
      && user_path.exists()
    {
      match Self::load_from(&user_path) {
        Ok(config) => return Ok(config),
        Err(e) => warn!(error = %e, "Ignoring unreadable user config"),
      }
    }

    Ok(Self::default())
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("cmdpipe").join("config.toml"));
    }
    dirs::config_dir().map(|p: PathBuf| p.join("cmdpipe").join("config.toml"))
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# cmdpipe Configuration
# Place in ~/.config/cmdpipe/config.toml or pass --config <path>

# ============================================================================
# Transport
# ============================================================================

[transport]
# Controller socket (default: $XDG_RUNTIME_DIR/cmdpipe.sock)
# socket_path = "/tmp/cmdpipe.sock"

# Milliseconds to wait for the controller to accept the connection
connect_timeout_ms = {connect}

# Milliseconds close() waits for background loops before logging a warning
close_timeout_ms = {close}

# Lines longer than this many bytes are dropped
max_line_length = {max_line}

# ============================================================================
# Dispatch
# ============================================================================

[dispatch]
# Milliseconds between ticks of the dispatch loop
tick_interval_ms = {tick}

# Experiments accepted by "run <name>" (empty accepts anything)
experiments = ["loopback"]

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace (RUST_LOG overrides)
log_level = "{level}"

# Rotation for background log files: daily, hourly, never
log_rotation = "{rotation}"

# log_dir = "/var/log/cmdpipe"
"#,
      connect = defaults.transport.connect_timeout_ms,
      close = defaults.transport.close_timeout_ms,
      max_line = defaults.transport.max_line_length,
      tick = defaults.dispatch.tick_interval_ms,
      level = defaults.logging.log_level,
      rotation = defaults.logging.log_rotation,
    )
  }
}

// ============================================================================
// Default Paths
// ============================================================================

/// Get the default socket path
pub fn default_socket_path() -> PathBuf {
  // Try XDG_RUNTIME_DIR first, fallback to the temp dir
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(runtime_dir).join("cmdpipe.sock")
  } else {
    std::env::temp_dir().join("cmdpipe.sock")
  }
}

/// Get the default data directory (log files live here)
///
/// Respects the following environment variables (in order of precedence):
/// 1. DATA_DIR - explicit data directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("cmdpipe");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("cmdpipe")
}
