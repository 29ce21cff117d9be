//! Protocol message definitions
//!
//! All message types exchanged with the coordination endpoint.
//! Messages are serialized as JSON objects with a `type` discriminator.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────
// Shared Types
// ─────────────────────────────────────────────────────────────────

/// A domain entity addressed by type and id (e.g. `parcel` / `P9`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Check whether this reference points at the given entity
    pub fn matches(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    /// Build a reference from the nullable wire fields.
    ///
    /// Returns `None` unless `is_editing` is set and both fields are present.
    pub fn from_wire(
        is_editing: bool,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
    ) -> Option<Self> {
        match (is_editing, entity_type, entity_id) {
            (true, Some(t), Some(id)) => Some(Self::new(t, id)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A connected user as carried in `presence_list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: String,

    /// Display name
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub entity_type: Option<String>,

    #[serde(default)]
    pub entity_id: Option<String>,

    #[serde(default)]
    pub is_editing: bool,
}

impl PresenceUser {
    /// A user that is connected but not editing anything
    pub fn idle(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            entity_type: None,
            entity_id: None,
            is_editing: false,
        }
    }

    /// A user editing the given entity
    pub fn editing(
        user_id: impl Into<String>,
        username: impl Into<String>,
        target: &EntityRef,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            entity_type: Some(target.entity_type.clone()),
            entity_id: Some(target.entity_id.clone()),
            is_editing: true,
        }
    }

    pub fn editing_target(&self) -> Option<EntityRef> {
        EntityRef::from_wire(
            self.is_editing,
            self.entity_type.as_deref(),
            self.entity_id.as_deref(),
        )
    }
}

/// Editing state change for one remote user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: String,

    #[serde(default)]
    pub entity_type: Option<String>,

    #[serde(default)]
    pub entity_id: Option<String>,

    #[serde(default)]
    pub is_editing: bool,
}

impl PresenceUpdate {
    pub fn started(user_id: impl Into<String>, target: &EntityRef) -> Self {
        Self {
            user_id: user_id.into(),
            entity_type: Some(target.entity_type.clone()),
            entity_id: Some(target.entity_id.clone()),
            is_editing: true,
        }
    }

    pub fn stopped(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            entity_type: None,
            entity_id: None,
            is_editing: false,
        }
    }

    pub fn editing_target(&self) -> Option<EntityRef> {
        EntityRef::from_wire(
            self.is_editing,
            self.entity_type.as_deref(),
            self.entity_id.as_deref(),
        )
    }

    /// `is_editing` is set but the entity is incomplete
    pub fn is_inconsistent(&self) -> bool {
        self.is_editing && (self.entity_type.is_none() || self.entity_id.is_none())
    }
}

/// An entity change as carried by `entity_changed`.
///
/// Only `entity_type` and `entity_id` are required. The optional known fields
/// are read leniently: a value of the wrong shape is left in `payload` under
/// its own key instead of failing the whole message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChange {
    pub entity_type: String,

    pub entity_id: String,

    /// What happened (created, updated, deleted, ...)
    pub change_kind: String,

    /// Author of the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl<'de> Deserialize<'de> for EntityChange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;

        let entity_type = required_string(&mut fields, "entity_type")?;
        let entity_id = required_string(&mut fields, "entity_id")?;
        let change_kind = take_lenient(&mut fields, "change_kind", as_string)
            .unwrap_or_else(|| "updated".to_string());
        let user_id = take_lenient(&mut fields, "user_id", as_string);
        let timestamp = take_lenient(&mut fields, "timestamp", parse_timestamp);

        Ok(Self {
            entity_type,
            entity_id,
            change_kind,
            user_id,
            timestamp,
            payload: fields,
        })
    }
}

fn required_string<E: de::Error>(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<String, E> {
    match fields.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(E::invalid_type(unexpected(&other), &"a string")),
        None => Err(E::missing_field(key)),
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Null => de::Unexpected::Unit,
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::Number(_) => de::Unexpected::Other("a number"),
        Value::String(s) => de::Unexpected::Str(s),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
    }
}

/// Remove `key` and convert it; a value of the wrong shape stays in `fields`
fn take_lenient<T>(
    fields: &mut Map<String, Value>,
    key: &str,
    convert: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    let parsed = fields.get(key).and_then(&convert);
    if parsed.is_some() || fields.get(key).is_some_and(Value::is_null) {
        fields.remove(key);
    }
    parsed
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// RFC 3339, ISO 8601 without offset (taken as UTC), or epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

impl EntityChange {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        change_kind: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            change_kind: change_kind.into(),
            user_id: None,
            timestamp: None,
            payload: Map::new(),
        }
    }

    pub fn with_author(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Unions)
// ─────────────────────────────────────────────────────────────────

/// Common surface of both message directions, used by the codec
pub trait WireMessage {
    /// Wire name of the message type
    fn type_name(&self) -> &'static str;

    /// Whether this is the catch-all for unrecognized types
    fn is_unknown(&self) -> bool;
}

/// Messages sent by the coordination endpoint to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full presence snapshot, sent on (re)connect and context switch
    PresenceList { users: Vec<PresenceUser> },

    /// A user connected to the context
    UserJoined {
        user_id: String,
        #[serde(default)]
        username: String,
    },

    /// A user's last connection to the context went away
    UserLeft { user_id: String },

    /// A user's editing state changed
    PresenceUpdate(PresenceUpdate),

    /// A domain entity changed
    EntityChanged(EntityChange),

    /// Heartbeat reply
    Pong,

    /// Any type this build does not know about
    #[serde(other)]
    Unknown,
}

impl WireMessage for ServerMessage {
    fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::PresenceList { .. } => "presence_list",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::PresenceUpdate(_) => "presence_update",
            ServerMessage::EntityChanged(_) => "entity_changed",
            ServerMessage::Pong => "pong",
            ServerMessage::Unknown => "unknown",
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, ServerMessage::Unknown)
    }
}

/// Messages sent by clients to the coordination endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat request
    Ping,

    /// Switch the viewed context (schedule version)
    SwitchSchedule {
        #[serde(default)]
        schedule_version_id: Option<String>,
    },

    /// Declare editing intent on an entity
    StartEditing {
        entity_type: String,
        entity_id: String,
    },

    /// Clear the previously declared intent
    StopEditing,

    /// Any type this build does not know about
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn start_editing(target: &EntityRef) -> Self {
        ClientMessage::StartEditing {
            entity_type: target.entity_type.clone(),
            entity_id: target.entity_id.clone(),
        }
    }
}

impl WireMessage for ClientMessage {
    fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::SwitchSchedule { .. } => "switch_schedule",
            ClientMessage::StartEditing { .. } => "start_editing",
            ClientMessage::StopEditing => "stop_editing",
            ClientMessage::Unknown => "unknown",
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, ClientMessage::Unknown)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
