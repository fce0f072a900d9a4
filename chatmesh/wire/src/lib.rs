//! Packet envelope and chat message codecs for the chatmesh protocol.
//!
//! This crate implements the two wire formats the mesh speaks: the outer
//! binary envelope carried on every transport write, and the application
//! chat-message payload carried inside MESSAGE packets. Both decoders treat
//! every malformed input as a typed error, never a panic, because they sit
//! directly on the transport's delivery path.
//!
//! ## Envelope layout (big-endian)
//!
//! ```text
//! +-------------------+----------------------------------+
//! | version (1)       | currently 1                      |
//! | type (1)          | message kind                     |
//! | ttl (1)           | hop budget                       |
//! | timestamp (8)     | ms since epoch                   |
//! | flags (1)         | recipient / signature / compress |
//! | payload len (2)   | +2 when compressed               |
//! | sender id (8)     | trailing-zero-trimmed            |
//! | recipient id (8)  | present iff flag bit0            |
//! | original size (2) | present iff flag bit2            |
//! | payload (var)     |                                  |
//! | signature (64)    | present iff flag bit1            |
//! +-------------------+----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod packet;

pub use error::WireError;
pub use message::{ChatMessage, MIN_MESSAGE_SIZE};
pub use packet::{
    DedupKey, Flags, MessageKind, Packet, PeerId, ANNOUNCE_TTL, HEADER_SIZE, MAX_TTL,
    PEER_ID_SIZE, PROTOCOL_VERSION, SIGNATURE_SIZE,
};
