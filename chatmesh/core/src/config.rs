//! Mesh service configuration.

use chatmesh_fragment::{DEFAULT_WRITE_CAPACITY, MAX_BUFFERED_BYTES, MAX_SESSIONS, SESSION_TIMEOUT};
use chatmesh_wire::{PeerId, ANNOUNCE_TTL, MAX_TTL};
use std::time::Duration;

/// Default dedup cache capacity, in keys
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Configuration for a mesh service
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// This node's peer id
    pub peer_id: PeerId,
    /// Display name announced to peers
    pub nickname: String,
    /// Hop budget for locally originated chat packets
    pub max_ttl: u8,
    /// Hop budget for announce packets
    pub announce_ttl: u8,
    /// Probability of relaying an eligible packet
    pub relay_probability: f64,
    /// Lower bound of the relay jitter window
    pub relay_jitter_min: Duration,
    /// Upper bound of the relay jitter window
    pub relay_jitter_max: Duration,
    /// Age at which incomplete fragment sessions expire
    pub fragment_timeout: Duration,
    /// Interval of the periodic fragment/delivery sweep
    pub sweep_interval: Duration,
    /// Concurrent fragment session cap
    pub max_fragment_sessions: usize,
    /// Global budget for buffered fragment bytes
    pub fragment_byte_budget: usize,
    /// Payload capacity of a single transport write
    pub write_capacity: usize,
    /// Bounded dedup cache capacity
    pub dedup_capacity: usize,
    /// How long delivery records are retained after completion
    pub delivery_retention: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::from_bytes(&rand::random::<[u8; 8]>()),
            nickname: "anonymous".to_string(),
            max_ttl: MAX_TTL,
            announce_ttl: ANNOUNCE_TTL,
            relay_probability: 1.0,
            relay_jitter_min: Duration::from_millis(50),
            relay_jitter_max: Duration::from_millis(150),
            fragment_timeout: SESSION_TIMEOUT,
            sweep_interval: Duration::from_secs(30),
            max_fragment_sessions: MAX_SESSIONS,
            fragment_byte_budget: MAX_BUFFERED_BYTES,
            write_capacity: DEFAULT_WRITE_CAPACITY,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            delivery_retention: Duration::from_secs(300),
        }
    }
}
