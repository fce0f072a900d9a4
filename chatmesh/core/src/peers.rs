//! Known-peer registry.
//!
//! Tracks every peer observed on the mesh: identifier, display name learned
//! from ANNOUNCE, the link it was last heard on, and a liveness timestamp.
//! The table is mutated only from the orchestrator task, so it needs no
//! interior locking.

use chatmesh_wire::PeerId;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::transport::LinkId;

/// Longest accepted announce payload, in bytes
pub const MAX_ANNOUNCE_LEN: usize = 100;

/// Lifecycle of a peer as seen by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heard of via relayed traffic, no direct link
    Discovered,
    /// Reachable over a direct link, nickname unknown
    Connected,
    /// Announced its display name
    Announced,
    /// Announced and actively sending
    Active,
}

/// One known peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's identifier
    pub peer_id: PeerId,
    /// Display name from its last valid ANNOUNCE
    pub nickname: Option<String>,
    /// Link the peer was last heard on, when directly connected
    pub link: Option<LinkId>,
    /// Lifecycle state
    pub state: PeerState,
    /// When the peer was last heard from
    pub last_seen: Instant,
}

/// Validate an ANNOUNCE payload.
///
/// Rejected when longer than [`MAX_ANNOUNCE_LEN`] or containing any byte
/// outside printable ASCII (which also excludes NUL). Invalid announces must
/// not mutate peer state.
pub fn validate_announce(payload: &[u8]) -> bool {
    payload.len() <= MAX_ANNOUNCE_LEN && payload.iter().all(|&b| (0x20..=0x7E).contains(&b))
}

/// Registry of known peers, keyed by peer id
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from a peer, creating it on first sight.
    ///
    /// Returns `true` when this is a previously unknown peer. A known peer
    /// has its `last_seen` refreshed, learns its link if one was missing,
    /// and progresses `Announced -> Active` on continued traffic.
    pub fn observe(&mut self, peer: PeerId, link: Option<LinkId>, now: Instant) -> bool {
        match self.peers.get_mut(&peer) {
            Some(record) => {
                record.last_seen = now;
                if record.link.is_none() {
                    record.link = link;
                    if record.state == PeerState::Discovered {
                        record.state = PeerState::Connected;
                    }
                }
                if record.state == PeerState::Announced {
                    record.state = PeerState::Active;
                }
                false
            }
            None => {
                let state = if link.is_some() {
                    PeerState::Connected
                } else {
                    PeerState::Discovered
                };
                debug!(peer = %peer, ?state, "new peer observed");
                self.peers.insert(
                    peer,
                    PeerRecord {
                        peer_id: peer,
                        nickname: None,
                        link,
                        state,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Record a validated ANNOUNCE from a peer.
    ///
    /// Returns `true` when the peer's nickname was set or changed. The
    /// caller is expected to have run [`validate_announce`] already.
    pub fn apply_announce(
        &mut self,
        peer: PeerId,
        nickname: String,
        link: Option<LinkId>,
        now: Instant,
    ) -> bool {
        self.observe(peer, link, now);
        let record = self
            .peers
            .get_mut(&peer)
            .expect("observe inserted the record");

        if record.state == PeerState::Connected || record.state == PeerState::Discovered {
            record.state = PeerState::Announced;
        }

        let changed = record.nickname.as_deref() != Some(nickname.as_str());
        if changed {
            info!(peer = %peer, nickname = %nickname, "peer announced");
            record.nickname = Some(nickname);
        }
        changed
    }

    /// Remove a peer (LEAVE received or link lost)
    pub fn remove(&mut self, peer: PeerId) -> Option<PeerRecord> {
        let removed = self.peers.remove(&peer);
        if removed.is_some() {
            debug!(peer = %peer, "peer removed");
        }
        removed
    }

    /// Remove every peer bound to a link, returning their ids
    pub fn remove_by_link(&mut self, link: LinkId) -> Vec<PeerId> {
        let gone: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| record.link == Some(link))
            .map(|record| record.peer_id)
            .collect();
        for peer in &gone {
            self.peers.remove(peer);
        }
        gone
    }

    /// Look up a peer
    pub fn get(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&peer)
    }

    /// The display name of a peer, if announced
    pub fn nickname(&self, peer: PeerId) -> Option<&str> {
        self.peers.get(&peer).and_then(|r| r.nickname.as_deref())
    }

    /// Snapshot of every known peer
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every peer
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(b: u8) -> PeerId {
        PeerId::from_bytes(&[b])
    }

    #[test]
    fn test_announce_validation() {
        assert!(validate_announce(b"alice"));
        assert!(validate_announce(&[b'x'; MAX_ANNOUNCE_LEN]));

        // 101 printable bytes
        assert!(!validate_announce(&[b'x'; MAX_ANNOUNCE_LEN + 1]));

        // NUL at offset 50
        let mut with_nul = vec![b'a'; 50];
        with_nul.push(0);
        with_nul.extend_from_slice(&[b'b'; 10]);
        assert!(!validate_announce(&with_nul));

        // Non-printable control byte
        assert!(!validate_announce(b"al\x07ce"));
        assert!(!validate_announce(&[0xC3, 0xA9])); // non-ASCII
    }

    #[test]
    fn test_state_progression() {
        let mut table = PeerTable::new();
        let now = Instant::now();

        assert!(table.observe(pid(1), None, now));
        assert_eq!(table.get(pid(1)).unwrap().state, PeerState::Discovered);

        // Link learned
        assert!(!table.observe(pid(1), Some(9), now));
        assert_eq!(table.get(pid(1)).unwrap().state, PeerState::Connected);

        assert!(table.apply_announce(pid(1), "alice".into(), Some(9), now));
        assert_eq!(table.get(pid(1)).unwrap().state, PeerState::Announced);
        assert_eq!(table.nickname(pid(1)), Some("alice"));

        // Traffic after announce
        table.observe(pid(1), Some(9), now);
        assert_eq!(table.get(pid(1)).unwrap().state, PeerState::Active);
    }

    #[test]
    fn test_announce_overwrites_nickname() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.apply_announce(pid(2), "old".into(), None, now);
        assert!(table.apply_announce(pid(2), "new".into(), None, now));
        assert!(!table.apply_announce(pid(2), "new".into(), None, now));
        assert_eq!(table.nickname(pid(2)), Some("new"));
    }

    #[test]
    fn test_remove_by_link() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.observe(pid(1), Some(7), now);
        table.observe(pid(2), Some(7), now);
        table.observe(pid(3), Some(8), now);

        let mut gone = table.remove_by_link(7);
        gone.sort();
        assert_eq!(gone, vec![pid(1), pid(2)]);
        assert_eq!(table.len(), 1);
        assert!(table.get(pid(3)).is_some());
    }
}
