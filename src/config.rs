//! Configuration for the collaboration coordinator
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (COLLAB_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::Identity;
use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Who this client is
    pub identity: IdentitySettings,

    /// Client session settings
    pub coordinator: CoordinatorSettings,

    /// Coordination server settings
    pub server: ServerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Client identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Stable user id (a random id is used per run if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Name shown to other users (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Client session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Coordination endpoint WebSocket URL
    pub url: String,

    /// Context (schedule version) to join on connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_context: Option<String>,

    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Close the connection when no pong arrives for this long (0 = never)
    pub pong_timeout_ms: u64,

    /// Number of recent changes kept
    pub change_feed_capacity: usize,

    /// Subscriber event queue size
    pub event_queue_size: usize,

    /// Outbound message queue size
    pub command_queue_size: usize,
}

/// Coordination server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address
    pub bind_addr: String,

    /// Per-connection outbound queue size
    pub outbound_queue_size: usize,

    /// Close connections silent for this long in milliseconds (0 = never)
    pub idle_timeout_ms: u64,

    /// Tokio worker threads for the whole process, `serve` and `connect`
    /// alike (0 = number of CPUs, at most 8)
    pub worker_threads: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            initial_context: None,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 0,
            change_feed_capacity: crate::feed::DEFAULT_FEED_CAPACITY,
            event_queue_size: 256,
            command_queue_size: 256,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            outbound_queue_size: 256,
            idle_timeout_ms: 90_000,
            worker_threads: 0,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl CollabConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_layered(config_path)?;
        config.validate()?;
        Ok(config)
    }

    /// File and environment layers without validation, for callers that
    /// still apply their own overrides before calling [`Self::validate`]
    pub fn load_layered(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = Self::from_toml(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::config_not_found(path))
            };
        }

        let search_paths = [
            PathBuf::from("collab.toml"),
            dirs::config_dir()
                .map(|p| p.join("collab").join("collab.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".collab").join("collab.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/collab/collab.toml"),
        ];

        for path in &search_paths {
            if path.is_file() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        env_string("COLLAB_USER_ID", |v| self.identity.user_id = Some(v));
        env_string("COLLAB_DISPLAY_NAME", |v| self.identity.display_name = Some(v));

        env_string("COLLAB_COORDINATOR_URL", |v| self.coordinator.url = v);
        env_string("COLLAB_CONTEXT", |v| self.coordinator.initial_context = Some(v));
        env_parse("COLLAB_RECONNECT_BASE_DELAY_MS", &mut self.coordinator.reconnect_base_delay_ms);
        env_parse("COLLAB_RECONNECT_MAX_DELAY_MS", &mut self.coordinator.reconnect_max_delay_ms);
        env_parse("COLLAB_CONNECT_TIMEOUT_MS", &mut self.coordinator.connect_timeout_ms);
        env_parse("COLLAB_HEARTBEAT_INTERVAL_MS", &mut self.coordinator.heartbeat_interval_ms);
        env_parse("COLLAB_PONG_TIMEOUT_MS", &mut self.coordinator.pong_timeout_ms);
        env_parse("COLLAB_CHANGE_FEED_CAPACITY", &mut self.coordinator.change_feed_capacity);

        env_string("COLLAB_BIND_ADDR", |v| self.server.bind_addr = v);
        env_parse("COLLAB_IDLE_TIMEOUT_MS", &mut self.server.idle_timeout_ms);
        env_parse("COLLAB_WORKER_THREADS", &mut self.server.worker_threads);

        env_string("COLLAB_LOG_LEVEL", |v| self.logging.level = v);
        env_string("COLLAB_LOG_FILE", |v| self.logging.file = Some(v));
        env_parse("COLLAB_LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = &self.coordinator.url;
        if url.is_empty() {
            return Err(Error::config_field_invalid(
                "coordinator.url",
                "Coordinator URL cannot be empty",
            ));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "coordinator.url",
                "Coordinator URL must start with ws:// or wss://",
            ));
        }
        crate::coordinator::parse_endpoint(url)
            .map_err(|e| Error::config_field_invalid("coordinator.url", e.to_string()))?;

        let c = &self.coordinator;
        if c.reconnect_base_delay_ms == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.reconnect_base_delay_ms",
                "reconnect_base_delay_ms must be greater than 0",
            ));
        }
        if c.reconnect_max_delay_ms < c.reconnect_base_delay_ms {
            return Err(Error::config_field_invalid(
                "coordinator.reconnect_max_delay_ms",
                "reconnect_max_delay_ms must not be less than reconnect_base_delay_ms",
            ));
        }
        if c.heartbeat_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.heartbeat_interval_ms",
                "heartbeat_interval_ms must be greater than 0",
            ));
        }
        if c.connect_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.connect_timeout_ms",
                "connect_timeout_ms must be greater than 0",
            ));
        }
        if c.change_feed_capacity == 0 || c.event_queue_size == 0 || c.command_queue_size == 0 {
            return Err(Error::config_validation(
                "change_feed_capacity, event_queue_size and command_queue_size must be greater than 0",
            ));
        }

        let s = &self.server;
        let port_ok = s
            .bind_addr
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !port_ok {
            return Err(Error::config_field_invalid(
                "server.bind_addr",
                format!("Invalid bind address '{}', expected host:port", s.bind_addr),
            ));
        }
        if s.outbound_queue_size == 0 {
            return Err(Error::config_field_invalid(
                "server.outbound_queue_size",
                "outbound_queue_size must be greater than 0",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Resolve the client identity, filling in defaults
    pub fn identity(&self) -> Identity {
        let user_id = self
            .identity
            .user_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let display_name = self
            .identity
            .display_name
            .clone()
            .unwrap_or_else(default_display_name);
        Identity::new(user_id, display_name)
    }
}

fn env_string(key: &str, apply: impl FnOnce(String)) {
    if let Ok(val) = std::env::var(key) {
        apply(val);
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => debug!(key = key, value = %val, "Ignoring unparsable environment override"),
        }
    }
}

/// Display name based on hostname
pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Anonymous".to_string())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Write a commented default configuration file and return its path
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".collab")
                .join("collab.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Collaboration Coordinator Configuration

[identity]
# Stable user id (a random id is generated per run if unset)
# user_id = "alice"

# Name shown to other users (defaults to the hostname)
# display_name = "Alice"

[coordinator]
# Coordination endpoint WebSocket URL
url = "ws://127.0.0.1:8765/ws"

# Context (schedule version) to join on connect
# initial_context = "v1"

# Reconnect backoff: min(base * 2^attempt, max)
reconnect_base_delay_ms = 1000
reconnect_max_delay_ms = 30000

# Connection timeout in milliseconds
connect_timeout_ms = 10000

# Heartbeat ping interval in milliseconds
heartbeat_interval_ms = 30000

# Force a reconnect when no pong arrives for this long (0 = never)
pong_timeout_ms = 0

# Number of recent entity changes kept
change_feed_capacity = 50

# Queue sizes
event_queue_size = 256
command_queue_size = 256

[server]
# Listen address for `serve`
bind_addr = "127.0.0.1:8765"

# Per-connection outbound queue size; messages beyond it are dropped
outbound_queue_size = 256

# Close connections silent for this long (0 = never)
idle_timeout_ms = 90000

# Runtime worker threads for every command, including `connect`
# (0 = number of CPUs, at most 8)
worker_threads = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (uncomment to enable file logging)
# file = "~/.collab/logs/collab.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logs (useful for log aggregation)
json_format = false
"#
    .to_string()
}
