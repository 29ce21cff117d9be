//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use collab_coordinator::{
    CoordinationServer, Coordinator, CoordinatorEvent, Identity, ServerConfig, ServerHandle,
    SessionConfig,
};
use tokio::sync::mpsc;

/// Generous upper bound for anything that crosses the loopback
pub const WAIT: Duration = Duration::from_secs(10);

/// Start a coordination server on an ephemeral port
pub async fn start_server() -> ServerHandle {
    let server = CoordinationServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    })
    .await
    .expect("bind test server");
    let handle = server.handle();
    tokio::spawn(server.run());
    handle
}

/// Session settings with short reconnect delays
pub fn session_config(addr: SocketAddr, context: Option<&str>) -> SessionConfig {
    SessionConfig {
        url: format!("ws://{addr}/ws"),
        initial_context: context.map(str::to_string),
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(400),
        connect_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

/// Start a coordinator for `user_id` and wait until it is connected
pub async fn connect_user(
    addr: SocketAddr,
    user_id: &str,
    context: Option<&str>,
) -> (Coordinator, mpsc::Receiver<CoordinatorEvent>) {
    let identity = Identity::new(user_id, format!("{user_id} (test)"));
    let mut coordinator = Coordinator::new(session_config(addr, context), identity);
    let events = coordinator.start().expect("start coordinator");
    assert!(
        wait_until(|| coordinator.is_connected()).await,
        "{user_id} never connected"
    );
    (coordinator, events)
}

/// Poll `condition` until it holds or [`WAIT`] elapses
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for the first event matching `predicate`, discarding the rest
pub async fn next_matching(
    events: &mut mpsc::Receiver<CoordinatorEvent>,
    mut predicate: impl FnMut(&CoordinatorEvent) -> bool,
) -> Option<CoordinatorEvent> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
