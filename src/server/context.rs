//! Coordination contexts
//!
//! Each context (schedule version) is owned by one task that holds its
//! membership and editing state and fans messages out to the members'
//! outbound queues. Contexts are created on first join and dropped when
//! the last member leaves; both happen under the registry lock.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{self, EntityChange, EntityRef, PresenceUpdate, PresenceUser, ServerMessage};

/// Context identifier; `None` is the default context
pub type ContextKey = Option<String>;

/// Connection identifier
pub type ConnId = Uuid;

const CONTEXT_QUEUE_SIZE: usize = 1024;

pub(crate) fn context_label(key: &ContextKey) -> &str {
    key.as_deref().unwrap_or("(default)")
}

// ─────────────────────────────────────────────────────────────────
// Members
// ─────────────────────────────────────────────────────────────────

/// One connection's membership in a context
#[derive(Debug)]
pub(crate) struct Member {
    pub conn_id: ConnId,
    pub user_id: String,
    pub username: String,
    pub editing: Option<EntityRef>,
    outbound: mpsc::Sender<String>,
}

impl Member {
    pub(crate) fn new(
        conn_id: ConnId,
        user_id: impl Into<String>,
        username: impl Into<String>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            username: username.into(),
            editing: None,
            outbound,
        }
    }

    /// Queue pre-encoded text; dropped if the queue is full
    fn deliver(&self, text: String) {
        deliver(&self.outbound, self.conn_id, text);
    }
}

/// Non-blocking enqueue onto a connection's outbound queue
pub(crate) fn deliver(outbound: &mpsc::Sender<String>, conn_id: ConnId, text: String) {
    match outbound.try_send(text) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn_id = %conn_id, "Outbound queue full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn_id = %conn_id, "Connection gone, dropping message");
        }
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match protocol::encode(message) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, message_type = ?message, "Failed to encode message");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Context Actor
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum ContextCommand {
    Join(Member),
    /// Replies with the number of members left
    Leave {
        conn_id: ConnId,
        reply: oneshot::Sender<usize>,
    },
    StartEditing {
        conn_id: ConnId,
        target: EntityRef,
    },
    StopEditing {
        conn_id: ConnId,
    },
    /// Re-send the presence list to one member
    Resync {
        conn_id: ConnId,
    },
    Publish(EntityChange),
}

/// Membership and editing state of one context
pub(crate) struct CoordinationContext {
    key: ContextKey,
    members: Vec<Member>,
}

impl CoordinationContext {
    pub(crate) fn new(key: ContextKey) -> Self {
        Self {
            key,
            members: Vec::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ContextCommand>) {
        debug!(context = context_label(&self.key), "Context task started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!(context = context_label(&self.key), "Context task stopped");
    }

    pub(crate) fn handle(&mut self, command: ContextCommand) {
        match command {
            ContextCommand::Join(member) => self.join(member),
            ContextCommand::Leave { conn_id, reply } => {
                let remaining = self.leave(conn_id);
                let _ = reply.send(remaining);
            }
            ContextCommand::StartEditing { conn_id, target } => {
                self.set_editing(conn_id, Some(target));
            }
            ContextCommand::StopEditing { conn_id } => self.set_editing(conn_id, None),
            ContextCommand::Resync { conn_id } => {
                if let Some(member) = self.members.iter().find(|m| m.conn_id == conn_id) {
                    let users = self.presence_snapshot(&member.user_id);
                    if let Some(text) = encode(&ServerMessage::PresenceList { users }) {
                        member.deliver(text);
                    }
                }
            }
            ContextCommand::Publish(change) => {
                debug!(
                    context = context_label(&self.key),
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    "Publishing entity change"
                );
                if let Some(text) = encode(&ServerMessage::EntityChanged(change)) {
                    for member in &self.members {
                        member.deliver(text.clone());
                    }
                }
            }
        }
    }

    fn join(&mut self, member: Member) {
        let first_connection = !self.has_user(&member.user_id);

        let users = self.presence_snapshot(&member.user_id);
        if let Some(text) = encode(&ServerMessage::PresenceList { users }) {
            member.deliver(text);
        }

        if first_connection {
            self.broadcast_except(
                &member.user_id,
                &ServerMessage::UserJoined {
                    user_id: member.user_id.clone(),
                    username: member.username.clone(),
                },
            );
            info!(
                context = context_label(&self.key),
                user_id = %member.user_id,
                "User joined context"
            );
        }

        self.members.push(member);
    }

    fn leave(&mut self, conn_id: ConnId) -> usize {
        let Some(index) = self.members.iter().position(|m| m.conn_id == conn_id) else {
            return self.members.len();
        };
        let member = self.members.remove(index);

        if !self.has_user(&member.user_id) {
            self.broadcast_except(
                &member.user_id,
                &ServerMessage::UserLeft {
                    user_id: member.user_id.clone(),
                },
            );
            info!(
                context = context_label(&self.key),
                user_id = %member.user_id,
                "User left context"
            );
        } else if member.editing.is_some() {
            self.announce_editing(&member.user_id);
        }

        self.members.len()
    }

    fn set_editing(&mut self, conn_id: ConnId, target: Option<EntityRef>) {
        let Some(member) = self.members.iter_mut().find(|m| m.conn_id == conn_id) else {
            return;
        };
        member.editing = target;
        let user_id = member.user_id.clone();
        self.announce_editing(&user_id);
    }

    /// Broadcast a user's effective editing state to everyone else
    fn announce_editing(&self, user_id: &str) {
        let update = match self.editing_of(user_id) {
            Some(target) => PresenceUpdate::started(user_id, target),
            None => PresenceUpdate::stopped(user_id),
        };
        self.broadcast_except(user_id, &ServerMessage::PresenceUpdate(update));
    }

    /// First editing target among the user's connections
    fn editing_of(&self, user_id: &str) -> Option<&EntityRef> {
        self.members
            .iter()
            .filter(|m| m.user_id == user_id)
            .find_map(|m| m.editing.as_ref())
    }

    fn has_user(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    /// One entry per user other than `exclude_user`, in join order
    fn presence_snapshot(&self, exclude_user: &str) -> Vec<PresenceUser> {
        let mut users: Vec<PresenceUser> = Vec::new();
        for member in self.members.iter().filter(|m| m.user_id != exclude_user) {
            if users.iter().any(|u| u.user_id == member.user_id) {
                continue;
            }
            users.push(match self.editing_of(&member.user_id) {
                Some(target) => PresenceUser::editing(&member.user_id, &member.username, target),
                None => PresenceUser::idle(&member.user_id, &member.username),
            });
        }
        users
    }

    fn broadcast_except(&self, user_id: &str, message: &ServerMessage) {
        let Some(text) = encode(message) else {
            return;
        };
        for member in self.members.iter().filter(|m| m.user_id != user_id) {
            member.deliver(text.clone());
        }
    }

    pub(crate) fn member_count(&self) -> usize {
        self.members.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Context Registry
// ─────────────────────────────────────────────────────────────────

/// All live contexts, keyed by context id
#[derive(Default)]
pub(crate) struct ContextRegistry {
    contexts: Mutex<HashMap<ContextKey, mpsc::Sender<ContextCommand>>>,
}

impl ContextRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the context if needed.
    ///
    /// Returns the context's command channel.
    pub(crate) async fn join(
        &self,
        key: &ContextKey,
        member: Member,
    ) -> Result<mpsc::Sender<ContextCommand>> {
        let mut contexts = self.contexts.lock().await;
        let tx = contexts
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(CONTEXT_QUEUE_SIZE);
                tokio::spawn(CoordinationContext::new(key.clone()).run(rx));
                info!(context = context_label(key), "Context created");
                tx
            })
            .clone();

        tx.send(ContextCommand::Join(member))
            .await
            .map_err(|_| Error::ContextUnavailable {
                context: context_label(key).to_string(),
            })?;
        Ok(tx)
    }

    /// Remove a member, dropping the context once it is empty
    pub(crate) async fn leave(&self, key: &ContextKey, conn_id: ConnId) {
        let mut contexts = self.contexts.lock().await;
        let Some(tx) = contexts.get(key).cloned() else {
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let remaining = match tx
            .send(ContextCommand::Leave {
                conn_id,
                reply: reply_tx,
            })
            .await
        {
            Ok(()) => reply_rx.await.unwrap_or(0),
            Err(_) => 0,
        };

        if remaining == 0 {
            contexts.remove(key);
            info!(context = context_label(key), "Context closed");
        }
    }

    /// Fan an entity change out to a context; false if it has no members
    pub(crate) async fn publish(&self, key: &ContextKey, change: EntityChange) -> bool {
        let tx = self.contexts.lock().await.get(key).cloned();
        match tx {
            Some(tx) => tx.send(ContextCommand::Publish(change)).await.is_ok(),
            None => false,
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }
}
