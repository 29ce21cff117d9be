//! Coordination server
//!
//! The fan-out half of the protocol:
//! ```text
//! Client A ──┐                     ┌── Client A
//!            ├── context task (v1) ┤
//! Client B ──┘                     └── Client B
//! ```
//!
//! One task per WebSocket connection, one task per context. The handshake
//! query names the user and the initial context; a handshake without
//! `user_id` is rejected with HTTP 400.

mod context;

pub use context::{ConnId, ContextKey};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::protocol::{self, ClientMessage, Decoded, EntityChange, EntityRef, ServerMessage};

use context::{context_label, deliver, ContextCommand, ContextRegistry, Member};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,

    /// Per-connection outbound queue size
    pub outbound_queue_size: usize,

    /// Close connections silent for this long; `None` disables
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            outbound_queue_size: 256,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            bind_addr: settings.bind_addr.clone(),
            outbound_queue_size: settings.outbound_queue_size,
            idle_timeout: match settings.idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub active_contexts: usize,
}

// ─────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────

/// Identity and context taken from the handshake query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: String,
    pub username: String,
    pub context: ContextKey,
}

impl Handshake {
    /// `None` when `user_id` is missing or empty
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let mut user_id = None;
        let mut username = None;
        let mut context = None;

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "user_id" => user_id = Some(value.into_owned()),
                "username" => username = Some(value.into_owned()),
                "schedule_version_id" => context = Some(value.into_owned()),
                _ => {}
            }
        }

        let user_id = user_id.filter(|id| !id.is_empty())?;
        Some(Self {
            username: username
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| user_id.clone()),
            context: normalize_context(context),
            user_id,
        })
    }
}

fn normalize_context(context: Option<String>) -> ContextKey {
    context.filter(|c| !c.is_empty())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

// ─────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────

struct ServerShared {
    config: ServerConfig,
    contexts: ContextRegistry,
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    shutdown: Notify,
}

/// Cloneable handle for publishing changes and reading stats
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Broadcast `entity_changed` to every member of a context.
    ///
    /// Returns false when the context has no members.
    pub async fn publish_change(&self, context_id: Option<&str>, change: EntityChange) -> bool {
        let key = normalize_context(context_id.map(str::to_string));
        self.shared.contexts.publish(&key, change).await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_connections: self.shared.active_connections.load(Ordering::Relaxed),
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            active_contexts: self.shared.contexts.len().await,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_one();
    }
}

/// WebSocket coordination server
pub struct CoordinationServer {
    listener: TcpListener,
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
}

impl CoordinationServer {
    /// Bind the listening socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| Error::BindFailed {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(ServerShared {
                config,
                contexts: ContextRegistry::new(),
                active_connections: AtomicUsize::new(0),
                total_connections: AtomicU64::new(0),
                shutdown: Notify::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accept connections until [`ServerHandle::shutdown`]
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr, "Coordination server listening");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shared.shutdown.notified() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Incoming connection");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        match handle_connection(shared, stream, peer_addr).await {
                            Ok(()) => {}
                            Err(e) => match e.downcast_ref::<Error>() {
                                Some(rejected @ Error::HandshakeRejected { .. }) => {
                                    warn!(peer_addr = %peer_addr, error = %rejected.format_for_log(), "Handshake rejected");
                                }
                                _ => {
                                    debug!(peer_addr = %peer_addr, error = %e, "Connection ended with error");
                                }
                            },
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Coordination server stopped accepting connections");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────

/// Where a connection currently sits
struct Membership {
    conn_id: ConnId,
    handshake: Handshake,
    context: ContextKey,
    commands: mpsc::Sender<ContextCommand>,
    outbound: mpsc::Sender<String>,
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut handshake = None;
    let callback = |request: &Request, response: Response| {
        match Handshake::from_query(request.uri().query()) {
            Some(parsed) => {
                handshake = Some(parsed);
                Ok(response)
            }
            None => Err(bad_request("missing user_id")),
        }
    };

    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| Error::HandshakeRejected {
            message: e.to_string(),
        })?;
    let Some(handshake) = handshake else {
        return Err(Error::HandshakeRejected {
            message: "missing user_id".to_string(),
        }
        .into());
    };

    let conn_id = Uuid::new_v4();
    shared.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.active_connections.fetch_add(1, Ordering::Relaxed);
    info!(
        peer_addr = %peer_addr,
        conn_id = %conn_id,
        user_id = %handshake.user_id,
        context = context_label(&handshake.context),
        "Client connected"
    );

    let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_queue_size.max(1));
    let context = handshake.context.clone();
    let member = Member::new(conn_id, &handshake.user_id, &handshake.username, outbound.clone());

    let result = match shared.contexts.join(&context, member).await {
        Ok(commands) => {
            let mut membership = Membership {
                conn_id,
                handshake,
                context,
                commands,
                outbound,
            };
            let result = serve_connection(&shared, &mut membership, ws_stream, outbound_rx).await;
            shared.contexts.leave(&membership.context, conn_id).await;
            result
        }
        Err(e) => Err(e.into()),
    };

    shared.active_connections.fetch_sub(1, Ordering::Relaxed);
    info!(conn_id = %conn_id, "Client disconnected");
    result
}

async fn serve_connection(
    shared: &ServerShared,
    membership: &mut Membership,
    ws_stream: WebSocketStream<TcpStream>,
    mut outbound_rx: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let idle_timeout = shared.config.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout.unwrap_or(Duration::from_secs(3600)));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle, if idle_timeout.is_some() => {
                info!(conn_id = %membership.conn_id, "Idle timeout, closing connection");
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return Ok(());
            }

            frame = ws_rx.next() => {
                if let Some(limit) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + limit);
                }

                let decoded = match frame {
                    Some(Ok(WsMessage::Text(text))) => protocol::decode_client_message(&text),
                    Some(Ok(WsMessage::Binary(data))) => protocol::decode_bytes(&data),
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_tx.send(WsMessage::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                match decoded {
                    Ok(Decoded::Message(message)) => {
                        handle_client_message(shared, membership, message).await?;
                    }
                    Ok(Decoded::Unknown(kind)) => {
                        debug!(message_type = %kind, "Ignoring unknown message type");
                    }
                    Err(e) => {
                        warn!(conn_id = %membership.conn_id, error = %e, "Discarding malformed message");
                    }
                }
            }

            text = outbound_rx.recv() => {
                match text {
                    Some(text) => ws_tx.send(WsMessage::Text(text)).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn handle_client_message(
    shared: &ServerShared,
    membership: &mut Membership,
    message: ClientMessage,
) -> Result<()> {
    let conn_id = membership.conn_id;
    let unavailable = |context: &ContextKey| Error::ContextUnavailable {
        context: context_label(context).to_string(),
    };

    match message {
        ClientMessage::Ping => {
            let text = protocol::encode(&ServerMessage::Pong)?;
            deliver(&membership.outbound, conn_id, text);
        }

        ClientMessage::StartEditing {
            entity_type,
            entity_id,
        } => {
            let target = EntityRef::new(entity_type, entity_id);
            debug!(conn_id = %conn_id, entity = %target, "Start editing");
            membership
                .commands
                .send(ContextCommand::StartEditing { conn_id, target })
                .await
                .map_err(|_| unavailable(&membership.context))?;
        }

        ClientMessage::StopEditing => {
            membership
                .commands
                .send(ContextCommand::StopEditing { conn_id })
                .await
                .map_err(|_| unavailable(&membership.context))?;
        }

        ClientMessage::SwitchSchedule {
            schedule_version_id,
        } => {
            let next = normalize_context(schedule_version_id);
            if next == membership.context {
                membership
                    .commands
                    .send(ContextCommand::Resync { conn_id })
                    .await
                    .map_err(|_| unavailable(&membership.context))?;
                return Ok(());
            }

            info!(
                conn_id = %conn_id,
                from = context_label(&membership.context),
                to = context_label(&next),
                "Switching context"
            );
            shared.contexts.leave(&membership.context, conn_id).await;

            let member = Member::new(
                conn_id,
                &membership.handshake.user_id,
                &membership.handshake.username,
                membership.outbound.clone(),
            );
            membership.commands = shared.contexts.join(&next, member).await?;
            membership.context = next;
        }

        ClientMessage::Unknown => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_from_query() {
        let handshake =
            Handshake::from_query(Some("user_id=u1&username=Alice%20Smith&schedule_version_id=v42"))
                .unwrap();
        assert_eq!(handshake.user_id, "u1");
        assert_eq!(handshake.username, "Alice Smith");
        assert_eq!(handshake.context.as_deref(), Some("v42"));
    }

    #[test]
    fn test_handshake_defaults() {
        let handshake = Handshake::from_query(Some("user_id=u1&schedule_version_id=")).unwrap();
        assert_eq!(handshake.username, "u1");
        assert_eq!(handshake.context, None);
    }

    #[test]
    fn test_handshake_requires_user_id() {
        assert!(Handshake::from_query(None).is_none());
        assert!(Handshake::from_query(Some("username=Alice")).is_none());
        assert!(Handshake::from_query(Some("user_id=")).is_none());
    }

    #[test]
    fn test_server_config_from_settings() {
        let mut settings = ServerSettings::default();
        settings.idle_timeout_ms = 0;
        assert_eq!(ServerConfig::from(&settings).idle_timeout, None);

        settings.idle_timeout_ms = 1500;
        assert_eq!(
            ServerConfig::from(&settings).idle_timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_bad_request_status() {
        assert_eq!(bad_request("x").status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = CoordinationServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let stats = server.handle().stats().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_handshake_without_user_is_rejected() {
        let server = CoordinationServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr();
        let shared = server.shared.clone();

        let client = tokio::spawn(async move {
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws?username=Alice")).await
        });
        let (stream, peer_addr) = server.listener.accept().await.unwrap();
        let err = handle_connection(shared.clone(), stream, peer_addr)
            .await
            .unwrap_err();

        let err = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(err, Error::HandshakeRejected { .. }));
        assert!(!err.is_retryable());
        assert_eq!(shared.total_connections.load(Ordering::Relaxed), 0);

        match client.await.unwrap() {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            }
            Err(e) => panic!("expected HTTP 400, got {e}"),
            Ok(_) => panic!("handshake without user_id was accepted"),
        }
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = CoordinationServer::bind(ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
