//! Coordinator facade
//!
//! [`Coordinator`] is the single entry point for UI code. It owns the shared
//! session state and the handle to the session task, and exposes:
//! - Connection state and reconnect progress
//! - The presence list and editing-intent queries
//! - The recent change feed
//! - Intent and context operations that emit protocol messages
//!
//! All operations are synchronous and never block on the network. Outbound
//! messages are dropped when not connected.

mod heartbeat;
mod transport;

pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use transport::{handshake_url, parse_endpoint, ReconnectPolicy, SessionConfig};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::feed::{ChangeFeed, ChangeNotification};
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::protocol::{ClientMessage, EntityRef, WireMessage};

use transport::Session;

// ─────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────

/// Who this client is, as announced in the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Notifications for subscribers of a running coordinator
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ConnectionChanged(ConnectionState),

    /// A retry is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },

    /// The presence list changed; read it with [`Coordinator::presence_list`]
    PresenceChanged,

    EntityChanged(ChangeNotification),

    HeartbeatAck,
}

/// Publish without blocking; a full subscriber queue loses the event
pub(crate) fn emit(event_tx: &mpsc::Sender<CoordinatorEvent>, event: CoordinatorEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(event = ?event, "Event queue full, dropping event");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────

/// State shared between the facade and the session task
#[derive(Debug)]
pub(crate) struct SharedState {
    pub connection_state: ConnectionState,
    pub reconnect_attempt: u32,
    pub current_context_id: Option<String>,
    pub intent: Option<EntityRef>,
    pub presence: PresenceRegistry,
    pub changes: ChangeFeed,
    /// Set once by [`Coordinator::close`]
    pub closed: bool,
}

impl SharedState {
    pub(crate) fn new(
        local_user_id: &str,
        context: Option<String>,
        feed_capacity: usize,
    ) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            current_context_id: context,
            intent: None,
            presence: PresenceRegistry::new(local_user_id),
            changes: ChangeFeed::new(feed_capacity),
            closed: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Client-side collaboration coordinator
pub struct Coordinator {
    config: SessionConfig,
    identity: Identity,
    state: Arc<RwLock<SharedState>>,
    command_tx: Option<mpsc::Sender<ClientMessage>>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(config: SessionConfig, identity: Identity) -> Self {
        let state = SharedState::new(
            &identity.user_id,
            config.initial_context.clone(),
            config.change_feed_capacity,
        );

        Self {
            config,
            identity,
            state: Arc::new(RwLock::new(state)),
            command_tx: None,
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Spawn the session task and return the event receiver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CoordinatorEvent>> {
        if self.task.is_some() {
            return Err(Error::Internal("coordinator already started".to_string()));
        }
        if self.state.read().closed {
            return Err(Error::Internal("coordinator is closed".to_string()));
        }

        let endpoint = parse_endpoint(&self.config.url)?;
        let (event_tx, event_rx) = mpsc::channel(self.config.event_queue_size.max(1));
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_size.max(1));

        let session = Session {
            config: self.config.clone(),
            identity: self.identity.clone(),
            endpoint,
            state: self.state.clone(),
            command_rx,
            event_tx,
            shutdown: self.shutdown.clone(),
        };

        self.command_tx = Some(command_tx);
        self.task = Some(tokio::spawn(session.run()));

        info!(
            user_id = %self.identity.user_id,
            url = %self.config.url,
            "Coordinator started"
        );

        Ok(event_rx)
    }

    // ─────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────

    /// View another context; the server answers with a fresh presence list
    pub fn switch_context(&self, context_id: impl Into<String>) {
        let context_id = context_id.into();
        self.state.write().current_context_id = Some(context_id.clone());
        self.send(ClientMessage::SwitchSchedule {
            schedule_version_id: Some(context_id),
        });
    }

    /// Declare intent to edit an entity, replacing any previous intent
    pub fn start_editing(&self, entity_type: impl Into<String>, entity_id: impl Into<String>) {
        let target = EntityRef::new(entity_type, entity_id);
        let previous = self.state.write().intent.replace(target.clone());

        if previous.is_some_and(|previous| previous != target) {
            self.send(ClientMessage::StopEditing);
        }
        self.send(ClientMessage::start_editing(&target));
    }

    /// Clear the editing intent; no-op when there is none
    pub fn stop_editing(&self) {
        if self.state.write().intent.take().is_some() {
            self.send(ClientMessage::StopEditing);
        }
    }

    pub fn is_being_edited(&self, entity_type: &str, entity_id: &str) -> bool {
        self.state.read().presence.is_being_edited(entity_type, entity_id)
    }

    /// The remote user currently claiming the entity
    pub fn get_editor(&self, entity_type: &str, entity_id: &str) -> Option<PresenceEntry> {
        self.state
            .read()
            .presence
            .get_editor(entity_type, entity_id)
            .cloned()
    }

    /// Stop the session; no reconnect is attempted afterwards
    pub fn close(&self) {
        let already_closed = std::mem::replace(&mut self.state.write().closed, true);
        if !already_closed {
            debug!("Coordinator close requested");
            self.shutdown.notify_one();
        }
    }

    /// Close and wait for the session task to finish
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Read Surface
    // ─────────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Remote users in the current context, in arrival order
    pub fn presence_list(&self) -> Vec<PresenceEntry> {
        self.state.read().presence.entries().to_vec()
    }

    /// Newest first
    pub fn recent_changes(&self) -> Vec<ChangeNotification> {
        self.state.read().changes.snapshot()
    }

    pub fn current_context_id(&self) -> Option<String> {
        self.state.read().current_context_id.clone()
    }

    pub fn editing_intent(&self) -> Option<EntityRef> {
        self.state.read().intent.clone()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.state.read().reconnect_attempt
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    // ─────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────

    /// Fire-and-forget; dropped unless connected
    fn send(&self, message: ClientMessage) {
        if !self.is_connected() {
            debug!(
                message_type = message.type_name(),
                "Not connected, dropping outbound message"
            );
            return;
        }

        let Some(command_tx) = &self.command_tx else {
            return;
        };

        match command_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    message_type = message.type_name(),
                    "Outbound queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(message)) => {
                debug!(
                    message_type = message.type_name(),
                    "Session ended, dropping message"
                );
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}
