//! Protocol module for coordination traffic
//!
//! Defines the message types and serialization for the client ↔ coordination
//! endpoint protocol. The protocol uses flat JSON objects over WebSocket with a
//! `type` discriminator; unknown types are tolerated for forward compatibility.

mod codec;
mod messages;

pub use codec::*;
pub use messages::*;
