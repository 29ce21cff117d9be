//! Presence registry — who else is connected and what they are editing
//!
//! The registry is a pure reducer: inbound presence messages are folded into
//! a new state with [`PresenceRegistry::reduce`]. A `presence_list` snapshot
//! replaces everything, so replaying it after a reconnect is harmless.
//! The local user is never stored.

use tracing::warn;

use crate::protocol::{EntityRef, PresenceUpdate, PresenceUser, ServerMessage};

// ─────────────────────────────────────────────────────────────────
// Presence Entry
// ─────────────────────────────────────────────────────────────────

/// One remote user in the current context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: String,

    pub display_name: String,

    /// Entity the user has declared intent to edit
    pub editing: Option<EntityRef>,
}

impl PresenceEntry {
    pub fn is_editing(&self) -> bool {
        self.editing.is_some()
    }

    fn from_wire(user: &PresenceUser) -> Self {
        Self {
            user_id: user.user_id.clone(),
            display_name: user.username.clone(),
            editing: normalized_target(
                &user.user_id,
                user.is_editing,
                user.entity_type.as_deref(),
                user.entity_id.as_deref(),
            ),
        }
    }
}

/// `is_editing` without a complete entity is treated as not editing
fn normalized_target(
    user_id: &str,
    is_editing: bool,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
) -> Option<EntityRef> {
    let target = EntityRef::from_wire(is_editing, entity_type, entity_id);
    if is_editing && target.is_none() {
        warn!(
            user_id = %user_id,
            entity_type = ?entity_type,
            entity_id = ?entity_id,
            "Editing flag without a complete entity, treating as not editing"
        );
    }
    target
}

// ─────────────────────────────────────────────────────────────────
// Presence Events
// ─────────────────────────────────────────────────────────────────

/// The subset of inbound traffic that affects presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Snapshot(Vec<PresenceUser>),
    Joined { user_id: String, display_name: String },
    Left { user_id: String },
    Updated(PresenceUpdate),
}

impl PresenceEvent {
    /// Extract the presence event carried by a server message, if any
    pub fn from_message(message: &ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::PresenceList { users } => Some(Self::Snapshot(users.clone())),
            ServerMessage::UserJoined { user_id, username } => Some(Self::Joined {
                user_id: user_id.clone(),
                display_name: username.clone(),
            }),
            ServerMessage::UserLeft { user_id } => Some(Self::Left {
                user_id: user_id.clone(),
            }),
            ServerMessage::PresenceUpdate(update) => Some(Self::Updated(update.clone())),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Presence Registry
// ─────────────────────────────────────────────────────────────────

/// Ordered set of remote users, keyed by user id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRegistry {
    local_user_id: String,
    entries: Vec<PresenceEntry>,
}

impl PresenceRegistry {
    /// Create an empty registry that ignores `local_user_id`
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            entries: Vec::new(),
        }
    }

    /// Fold one event into the registry
    pub fn reduce(mut self, event: &PresenceEvent) -> Self {
        self.apply(event);
        self
    }

    /// In-place form of [`reduce`](Self::reduce)
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Snapshot(users) => {
                let mut entries: Vec<PresenceEntry> = Vec::with_capacity(users.len());
                for user in users.iter().filter(|u| u.user_id != self.local_user_id) {
                    let entry = PresenceEntry::from_wire(user);
                    match entries.iter_mut().find(|e| e.user_id == entry.user_id) {
                        Some(existing) => *existing = entry,
                        None => entries.push(entry),
                    }
                }
                self.entries = entries;
            }

            PresenceEvent::Joined {
                user_id,
                display_name,
            } => {
                if *user_id == self.local_user_id {
                    return;
                }
                match self.entry_mut(user_id) {
                    Some(entry) => entry.display_name = display_name.clone(),
                    None => self.entries.push(PresenceEntry {
                        user_id: user_id.clone(),
                        display_name: display_name.clone(),
                        editing: None,
                    }),
                }
            }

            PresenceEvent::Left { user_id } => {
                self.entries.retain(|e| e.user_id != *user_id);
            }

            PresenceEvent::Updated(update) => {
                let editing = normalized_target(
                    &update.user_id,
                    update.is_editing,
                    update.entity_type.as_deref(),
                    update.entity_id.as_deref(),
                );
                if let Some(entry) = self.entry_mut(&update.user_id) {
                    entry.editing = editing;
                }
            }
        }
    }

    fn entry_mut(&mut self, user_id: &str) -> Option<&mut PresenceEntry> {
        self.entries.iter_mut().find(|e| e.user_id == user_id)
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// True if some remote user currently claims the entity
    pub fn is_being_edited(&self, entity_type: &str, entity_id: &str) -> bool {
        self.get_editor(entity_type, entity_id).is_some()
    }

    /// The first remote user claiming the entity
    pub fn get_editor(&self, entity_type: &str, entity_id: &str) -> Option<&PresenceEntry> {
        self.entries.iter().find(|e| {
            e.editing
                .as_ref()
                .is_some_and(|target| target.matches(entity_type, entity_id))
        })
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.iter().find(|e| e.user_id == user_id)
    }

    pub fn entries(&self) -> &[PresenceEntry] {
        &self.entries
    }

    /// Users with an active editing target
    pub fn editors(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.iter().filter(|e| e.is_editing())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}
