//! Transport session
//!
//! Owns the WebSocket connection to the coordination endpoint:
//! - Handshake with identity and current context in the query string
//! - Automatic reconnection with capped exponential backoff
//! - Heartbeat pings while connected
//! - Fire-and-forget sends; nothing is queued across disconnects
//!
//! A single task runs the session, so inbound handling, heartbeat ticks and
//! outbound writes are serialized.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use super::{emit, ConnectionState, CoordinatorEvent, Identity, SharedState};
use crate::config::CoordinatorSettings;
use crate::error::{Error, Result};
use crate::feed::ChangeNotification;
use crate::presence::PresenceEvent;
use crate::protocol::{self, ClientMessage, Decoded, ServerMessage, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Runtime settings for a coordinator session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the coordination endpoint
    pub url: String,

    /// Context to join on first connect
    pub initial_context: Option<String>,

    /// First reconnect delay
    pub reconnect_base_delay: Duration,

    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,

    pub connect_timeout: Duration,

    pub heartbeat_interval: Duration,

    /// `None` never declares the peer dead
    pub pong_timeout: Option<Duration>,

    /// Change feed length
    pub change_feed_capacity: usize,

    /// Subscriber event queue size
    pub event_queue_size: usize,

    /// Outbound command queue size
    pub command_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            initial_context: None,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: None,
            change_feed_capacity: crate::feed::DEFAULT_FEED_CAPACITY,
            event_queue_size: 256,
            command_queue_size: 256,
        }
    }
}

impl From<&CoordinatorSettings> for SessionConfig {
    fn from(settings: &CoordinatorSettings) -> Self {
        Self {
            url: settings.url.clone(),
            initial_context: settings.initial_context.clone(),
            reconnect_base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            pong_timeout: match settings.pong_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            change_feed_capacity: settings.change_feed_capacity,
            event_queue_size: settings.event_queue_size,
            command_queue_size: settings.command_queue_size,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Reconnect Policy
// ─────────────────────────────────────────────────────────────────

/// Deterministic capped exponential backoff: `min(base * 2^attempt, max)`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Retries scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for ReconnectPolicy {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────

/// Parse and check the endpoint URL
pub fn parse_endpoint(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(Error::InvalidUrl {
            url: url.to_string(),
            message: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Endpoint URL with the identity and context handshake parameters
pub fn handshake_url(base: &Url, identity: &Identity, context: Option<&str>) -> Url {
    let mut url = base.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user_id", &identity.user_id);
        query.append_pair("username", &identity.display_name);
        if let Some(context) = context {
            query.append_pair("schedule_version_id", context);
        }
    }
    url
}

// ─────────────────────────────────────────────────────────────────
// Inbound Dispatch
// ─────────────────────────────────────────────────────────────────

/// Fold one inbound message into the shared state.
///
/// Returns the event to publish, if any.
pub(crate) fn apply_server_message(
    state: &mut SharedState,
    message: ServerMessage,
) -> Option<CoordinatorEvent> {
    if let Some(event) = PresenceEvent::from_message(&message) {
        state.presence.apply(&event);
        return Some(CoordinatorEvent::PresenceChanged);
    }

    match message {
        ServerMessage::EntityChanged(change) => {
            let notification = ChangeNotification::from_change(change, Utc::now());
            state.changes.push(notification.clone());
            Some(CoordinatorEvent::EntityChanged(notification))
        }
        ServerMessage::Pong => Some(CoordinatorEvent::HeartbeatAck),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────
// Session Loop
// ─────────────────────────────────────────────────────────────────

/// Everything the session task owns
pub(crate) struct Session {
    pub config: SessionConfig,
    pub identity: Identity,
    pub endpoint: Url,
    pub state: Arc<RwLock<SharedState>>,
    pub command_rx: mpsc::Receiver<ClientMessage>,
    pub event_tx: mpsc::Sender<CoordinatorEvent>,
    pub shutdown: Arc<Notify>,
}

impl Session {
    /// Connect, serve and reconnect until closed
    pub(crate) async fn run(mut self) {
        let mut policy = ReconnectPolicy::new(
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );

        'session: loop {
            if self.state.read().closed {
                break;
            }

            self.set_connection_state(ConnectionState::Connecting);

            let context = self.state.read().current_context_id.clone();
            let url = handshake_url(&self.endpoint, &self.identity, context.as_deref());

            info!(
                url = %self.endpoint,
                user_id = %self.identity.user_id,
                context = ?context,
                "Connecting to coordination endpoint"
            );

            let attempt = tokio::select! {
                result = self.connect(&url) => result,
                _ = self.shutdown.notified() => break 'session,
            };

            match attempt {
                Ok(ws_stream) => {
                    policy.reset();
                    while self.command_rx.try_recv().is_ok() {}
                    self.state.write().reconnect_attempt = 0;
                    self.set_connection_state(ConnectionState::Connected);
                    info!(context = ?context, "Connected to coordination endpoint");

                    let (write, read) = ws_stream.split();
                    match self.run_connection(write, read).await {
                        Ok(()) => break 'session,
                        Err(Error::ConnectionClosed) => {
                            info!("Connection closed by coordination endpoint");
                        }
                        Err(e) => {
                            warn!(error = %e.format_for_log(), "Connection lost");
                        }
                    }
                }
                // Both arms retry; a refused session logs at error level
                Err(e) if e.is_retryable() => {
                    warn!(error = %e.format_for_log(), "Failed to connect");
                }
                Err(e) => {
                    error!(error = %e.format_for_log(), "Coordination endpoint refused the session");
                }
            }

            self.set_connection_state(ConnectionState::Disconnected);
            if self.state.read().closed {
                break;
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(self.config.reconnect_max_delay);
            let attempt = policy.attempt();
            self.state.write().reconnect_attempt = attempt;

            emit(&self.event_tx, CoordinatorEvent::Reconnecting { attempt, delay });
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt,
                "Waiting before reconnection"
            );

            let wait = tokio::time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    _ = self.shutdown.notified() => break 'session,
                    cmd = self.command_rx.recv() => match cmd {
                        Some(message) => {
                            debug!(
                                message_type = message.type_name(),
                                "Dropping outbound message while disconnected"
                            );
                        }
                        None => break 'session,
                    },
                }
            }
        }

        self.set_connection_state(ConnectionState::Disconnected);
        info!("Session loop terminated");
    }

    async fn connect(&self, url: &Url) -> Result<WsStream> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
            Ok(Err(e)) => Err(connect_error(&self.endpoint, e)),
            Err(_) => Err(Error::ConnectionTimeout {
                url: self.endpoint.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Serve one live connection.
    ///
    /// `Ok` only on shutdown; a close by the peer is `Error::ConnectionClosed`.
    async fn run_connection<S, R>(&mut self, mut write: S, mut read: R) -> Result<()>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
        R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        // Peers drop our editing state when we disconnect
        let intent = self.state.read().intent.clone();
        if let Some(target) = intent {
            debug!(entity = %target, "Re-announcing editing intent");
            send_message(&mut write, &ClientMessage::start_editing(&target)).await?;
        }

        let mut monitor =
            HeartbeatMonitor::new(self.config.heartbeat_interval, self.config.pong_timeout);
        let mut ticker = monitor.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match monitor.on_tick(Instant::now()) {
                        HeartbeatAction::SendPing => {
                            send_message(&mut write, &ClientMessage::Ping).await?;
                            debug!("Sent heartbeat ping");
                        }
                        HeartbeatAction::PeerDead { silent_for } => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            return Err(Error::ConnectionLost {
                                message: format!("no pong for {}ms", silent_for.as_millis()),
                            });
                        }
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_decoded(protocol::decode_server_message(&text), &mut monitor);
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            self.handle_decoded(protocol::decode_bytes(&data), &mut monitor);
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(frame = ?frame, "Received close frame");
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(Error::ConnectionLost { message: e.to_string() });
                        }
                        None => return Err(Error::ConnectionClosed),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(message) => send_message(&mut write, &message).await?,
                        None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            return Ok(());
                        }
                    }
                }

                _ = self.shutdown.notified() => {
                    debug!("Closing connection on request");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn handle_decoded(&self, decoded: Result<Decoded<ServerMessage>>, monitor: &mut HeartbeatMonitor) {
        let message = match decoded {
            Ok(Decoded::Message(message)) => message,
            Ok(Decoded::Unknown(kind)) => {
                debug!(message_type = %kind, "Ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed message");
                return;
            }
        };

        if matches!(message, ServerMessage::Pong) {
            monitor.on_pong(Instant::now());
        }

        debug!(message_type = message.type_name(), "Received message");
        let event = apply_server_message(&mut self.state.write(), message);
        if let Some(event) = event {
            emit(&self.event_tx, event);
        }
    }

    fn set_connection_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.connection_state != next;
            state.connection_state = next;
            changed
        };
        if changed {
            emit(&self.event_tx, CoordinatorEvent::ConnectionChanged(next));
        }
    }
}

/// Classify a failed WebSocket connect
pub(crate) fn connect_error(endpoint: &Url, error: WsError) -> Error {
    match error {
        WsError::Http(response) => Error::HandshakeRejected {
            message: format!("{} answered HTTP {}", endpoint, response.status()),
        },
        other => Error::connection_failed(endpoint.as_str(), other.to_string()),
    }
}

/// Encode and write one message
async fn send_message<S>(write: &mut S, message: &ClientMessage) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let text = protocol::encode(message)?;
    write.send(WsMessage::Text(text)).await?;
    Ok(())
}
