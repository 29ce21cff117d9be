//! Presence tracking for remote users in the current context

mod registry;

pub use registry::{PresenceEntry, PresenceEvent, PresenceRegistry};
