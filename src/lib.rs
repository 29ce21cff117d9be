//! Real-time collaboration coordinator
//!
//! Client side: [`coordinator::Coordinator`] keeps a WebSocket session to a
//! coordination endpoint, tracks who is online and what they are editing,
//! and keeps a bounded feed of recent entity changes.
//!
//! Server side: [`server::CoordinationServer`] groups connections by context
//! and fans out presence, editing intent and entity changes.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod logging;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod version;

pub use coordinator::{Coordinator, CoordinatorEvent, ConnectionState, Identity, SessionConfig};
pub use error::{Error, Result};
pub use server::{CoordinationServer, ServerConfig, ServerHandle};
