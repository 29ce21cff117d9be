//! Configuration system tests
//!
//! Loading, validation and environment overrides, through both the library
//! API and `config validate`

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use collab_coordinator::config::CollabConfig;
use collab_coordinator::SessionConfig;

/// Temporary config file
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("collab.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn validate(&self) -> assert_cmd::assert::Assert {
        Command::cargo_bin("collab-coordinator")
            .unwrap()
            .args(["config", "validate", "--config", self.path()])
            .assert()
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    fixture
        .validate()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[identity]
user_id = "alice"
display_name = "Alice"

[coordinator]
url = "wss://collab.example.com/ws"
initial_context = "v3"
reconnect_base_delay_ms = 500
reconnect_max_delay_ms = 10000
connect_timeout_ms = 5000
heartbeat_interval_ms = 15000
pong_timeout_ms = 45000
change_feed_capacity = 20
event_queue_size = 64
command_queue_size = 64

[server]
bind_addr = "0.0.0.0:9000"
outbound_queue_size = 128
idle_timeout_ms = 0
worker_threads = 2

[logging]
level = "debug"
max_file_size_mb = 50
max_files = 3
json_format = true
"#,
    );

    fixture.validate().success();

    let config = CollabConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.identity.user_id.as_deref(), Some("alice"));
    assert_eq!(config.coordinator.initial_context.as_deref(), Some("v3"));
    assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
    assert!(config.logging.json_format);

    let identity = config.identity();
    assert_eq!(identity.user_id, "alice");
    assert_eq!(identity.display_name, "Alice");

    let session = SessionConfig::from(&config.coordinator);
    assert_eq!(session.reconnect_base_delay.as_millis(), 500);
    assert_eq!(session.pong_timeout.map(|d| d.as_millis()), Some(45_000));
    assert_eq!(session.change_feed_capacity, 20);
}

#[test]
fn test_partial_config_keeps_other_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
heartbeat_interval_ms = 5000
"#,
    );

    let config = CollabConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.coordinator.heartbeat_interval_ms, 5000);
    assert_eq!(config.coordinator.reconnect_base_delay_ms, 1000);
    assert_eq!(config.coordinator.reconnect_max_delay_ms, 30_000);
    assert_eq!(config.coordinator.change_feed_capacity, 50);
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_coordinator_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "http://not-websocket.example.com"
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("ws://"));
}

#[test]
fn test_backoff_cap_below_base() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
reconnect_base_delay_ms = 5000
reconnect_max_delay_ms = 1000
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("reconnect_max_delay_ms"));
}

#[test]
fn test_zero_heartbeat_interval() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
heartbeat_interval_ms = 0
"#,
    );

    fixture.validate().failure();
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "verbose"
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[coordinator\nurl = ");

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("Failed to parse configuration"));
}

#[test]
fn test_missing_explicit_file() {
    let err = CollabConfig::load(Some("/nonexistent/dir/collab.toml")).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("not found"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Overrides
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_is_validated() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    Command::cargo_bin("collab-coordinator")
        .unwrap()
        .env("COLLAB_LOG_LEVEL", "loud")
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_env_override_shows_in_effective_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "ws://file.example.com/ws"
"#,
    );

    Command::cargo_bin("collab-coordinator")
        .unwrap()
        .env("COLLAB_COORDINATOR_URL", "wss://env.example.com/ws")
        .env("COLLAB_CONTEXT", "v42")
        .args(["config", "show", "--config", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("wss://env.example.com/ws"))
        .stdout(predicate::str::contains("v42"));
}
