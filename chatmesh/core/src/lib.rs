//! Mesh orchestration for the chatmesh protocol.
//!
//! This crate coordinates the protocol core: it owns the peer table, the
//! dedup cache, the fragment reassembler, the relay engine, and the
//! delivery tracker, and runs them all on one sequential dispatch path fed
//! by transport events. The transport itself (discovery, connections, raw
//! byte delivery) and the presentation layer both live outside, behind the
//! narrow [`Transport`] and [`MeshDelegate`] contracts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dedup;
pub mod delegate;
pub mod delivery;
pub mod error;
pub mod orchestrator;
pub mod peers;
pub mod relay;
pub mod transport;

pub use config::{MeshConfig, DEFAULT_DEDUP_CAPACITY};
pub use dedup::DedupCache;
pub use delegate::MeshDelegate;
pub use delivery::{DeliveryRecord, DeliveryState, DeliveryTracker};
pub use error::MeshError;
pub use orchestrator::MeshService;
pub use peers::{validate_announce, PeerRecord, PeerState, PeerTable, MAX_ANNOUNCE_LEN};
pub use relay::{DropReason, RelayDecision, RelayEngine};
pub use transport::{LinkId, Transport, TransportError, TransportEvent};
