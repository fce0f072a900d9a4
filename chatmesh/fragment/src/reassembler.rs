//! Bounded reassembly of fragmented payloads.
//!
//! Sessions are keyed by the 8-byte fragment id and owned exclusively by the
//! reassembler. Three bounds keep memory finite under adversarial or lossy
//! input: a concurrent-session cap, a per-session timeout, and a global
//! budget on buffered chunk bytes.

use bytes::Bytes;
use chatmesh_wire::{ChatMessage, MessageKind, Packet, PeerId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::fragmenter::concat_chunks;
use crate::header::{FragmentHeader, FragmentId};
use crate::FragmentError;

/// Maximum concurrent reassembly sessions
pub const MAX_SESSIONS: usize = 50;

/// Age at which an incomplete session expires
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Global budget for buffered chunk bytes across all sessions
pub const MAX_BUFFERED_BYTES: usize = 10 * 1024 * 1024;

/// Reassembly state for one fragmented payload
#[derive(Debug)]
struct FragmentSession {
    original_kind: MessageKind,
    sender: PeerId,
    total: u16,
    chunks: HashMap<u16, Bytes>,
    buffered: usize,
    created: Instant,
}

impl FragmentSession {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn payload_size(&self) -> usize {
        self.buffered
    }
}

/// Payload salvaged from an expired session.
///
/// The lossy reference transport frequently drops continuation fragments,
/// so a single buffered "fragment" is sometimes the entire message. Expiry
/// tries each chunk once as a complete packet and once as a bare message
/// payload before discarding the session.
#[derive(Debug)]
pub enum Recovered {
    /// A chunk decoded as a complete packet
    Packet(Packet),
    /// A chunk decoded as a bare chat message payload
    Message {
        /// Peer the expired session was attributed to
        sender: PeerId,
        /// The salvaged message
        message: ChatMessage,
    },
}

/// Collects fragments into sessions and yields reassembled packets
#[derive(Debug)]
pub struct Reassembler {
    sessions: HashMap<FragmentId, FragmentSession>,
    /// Session ids in creation order, oldest first
    order: VecDeque<FragmentId>,
    buffered_total: usize,
    max_sessions: usize,
    timeout: Duration,
    byte_budget: usize,
}

impl Reassembler {
    /// Create a reassembler with the default bounds
    pub fn new() -> Self {
        Self::with_limits(MAX_SESSIONS, SESSION_TIMEOUT, MAX_BUFFERED_BYTES)
    }

    /// Create a reassembler with explicit bounds
    pub fn with_limits(max_sessions: usize, timeout: Duration, byte_budget: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: VecDeque::new(),
            buffered_total: 0,
            max_sessions,
            timeout,
            byte_budget,
        }
    }

    /// Number of live sessions
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Total buffered chunk bytes
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_total
    }

    /// Accept one fragment packet.
    ///
    /// Returns `Ok(Some(packet))` when this fragment completed its session
    /// and the reassembled buffer decoded as a packet; `Ok(None)` while the
    /// session is still filling.
    pub fn accept(&mut self, packet: &Packet, now: Instant) -> Result<Option<Packet>, FragmentError> {
        let (header, chunk) = FragmentHeader::parse(&packet.payload)?;

        if !self.sessions.contains_key(&header.id) {
            self.admit_session(&header, packet.sender, now);
        }

        let session = match self.sessions.get_mut(&header.id) {
            Some(session) => session,
            // Admission can refuse under pathological limits (cap of zero)
            None => return Ok(None),
        };

        if session.total != header.total || session.original_kind != header.original_kind {
            return Err(FragmentError::SessionMismatch);
        }

        // Duplicate indices are ignored so retransmits cannot inflate the budget
        if !session.chunks.contains_key(&header.index) {
            session.buffered += chunk.len();
            self.buffered_total += chunk.len();
            session.chunks.insert(header.index, chunk);
        }

        debug!(
            id = ?header.id,
            index = header.index,
            total = header.total,
            buffered = self.buffered_total,
            "stored fragment"
        );

        if self.sessions[&header.id].is_complete() {
            return self.finish_session(header.id).map(Some);
        }

        self.enforce_byte_budget();
        Ok(None)
    }

    /// Sweep expired sessions, attempting best-effort recovery on each.
    ///
    /// Intended to be driven by the owner's periodic timer (and called
    /// opportunistically before evicting for capacity).
    pub fn sweep(&mut self, now: Instant) -> Vec<Recovered> {
        let timeout = self.timeout;
        let expired: Vec<FragmentId> = self
            .order
            .iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .map(|s| now.duration_since(s.created) >= timeout)
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        let mut recovered = Vec::new();
        for id in expired {
            if let Some(session) = self.remove_session(id) {
                debug!(id = ?id, total = session.total, have = session.chunks.len(), "fragment session expired");
                if let Some(salvaged) = try_recover(&session) {
                    warn!(id = ?id, "recovered payload from expired fragment session");
                    recovered.push(salvaged);
                }
            }
        }
        recovered
    }

    /// Drop all sessions and buffered chunks
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.order.clear();
        self.buffered_total = 0;
    }

    fn admit_session(&mut self, header: &FragmentHeader, sender: PeerId, now: Instant) {
        if self.sessions.len() >= self.max_sessions {
            // Expired sessions go first; only then is a live one sacrificed.
            self.sweep(now);
        }
        while self.sessions.len() >= self.max_sessions {
            match self.evict_oldest() {
                Some(id) => warn!(evicted = ?id, "fragment session cap reached, evicting oldest"),
                None => return,
            }
        }

        self.sessions.insert(
            header.id,
            FragmentSession {
                original_kind: header.original_kind,
                sender,
                total: header.total,
                chunks: HashMap::new(),
                buffered: 0,
                created: now,
            },
        );
        self.order.push_back(header.id);
    }

    fn finish_session(&mut self, id: FragmentId) -> Result<Packet, FragmentError> {
        let session = self
            .remove_session(id)
            .expect("completed session must exist");

        let mut indices: Vec<u16> = session.chunks.keys().copied().collect();
        indices.sort_unstable();
        let buffer = concat_chunks(
            indices.iter().map(|i| &session.chunks[i]),
            session.payload_size(),
        );

        debug!(id = ?id, bytes = buffer.len(), "fragment session complete");
        Ok(Packet::decode(&buffer)?)
    }

    fn enforce_byte_budget(&mut self) {
        while self.buffered_total > self.byte_budget {
            match self.evict_oldest() {
                Some(id) => warn!(evicted = ?id, buffered = self.buffered_total, "fragment byte budget exceeded"),
                None => break,
            }
        }
    }

    fn evict_oldest(&mut self) -> Option<FragmentId> {
        let id = self.order.front().copied()?;
        self.remove_session(id);
        Some(id)
    }

    fn remove_session(&mut self, id: FragmentId) -> Option<FragmentSession> {
        let session = self.sessions.remove(&id)?;
        self.buffered_total -= session.buffered;
        self.order.retain(|other| *other != id);
        Some(session)
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

fn try_recover(session: &FragmentSession) -> Option<Recovered> {
    let mut indices: Vec<u16> = session.chunks.keys().copied().collect();
    indices.sort_unstable();

    for index in indices {
        let chunk = &session.chunks[&index];
        if let Ok(packet) = Packet::decode(chunk) {
            return Some(Recovered::Packet(packet));
        }
        if session.original_kind == MessageKind::Message {
            if let Ok(message) = ChatMessage::decode(chunk) {
                return Some(Recovered::Message {
                    sender: session.sender,
                    message,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragmenter::Fragmenter;

    fn fragments_for(payload_len: usize, capacity: usize) -> (Packet, Vec<Packet>) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 247) as u8).collect();
        let original = Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[1, 2, 3]),
            5000,
            Bytes::from(payload),
        );
        let fragments = Fragmenter::new(capacity).split(original.clone()).unwrap();
        (original, fragments)
    }

    #[test]
    fn test_out_of_order_reassembly_is_byte_identical() {
        let original = Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[9]),
            1234,
            Bytes::from(vec![0x61; 2000]),
        );
        let mut fragments = Fragmenter::new(300).split(original.clone()).unwrap();
        assert!(fragments.len() > 2);

        // Deliver in reversed order
        fragments.reverse();

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut completed = None;
        for fragment in &fragments {
            if let Some(packet) = reassembler.accept(fragment, now).unwrap() {
                completed = Some(packet);
            }
        }

        let packet = completed.expect("all fragments delivered");
        assert_eq!(packet, original);
        assert_eq!(reassembler.live_sessions(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    #[test]
    fn test_short_fragment_rejected() {
        let mut reassembler = Reassembler::new();
        let runt = Packet::broadcast(
            MessageKind::FragmentStart,
            PeerId::from_bytes(&[1]),
            0,
            Bytes::from_static(&[0u8; 12]),
        );
        assert!(matches!(
            reassembler.accept(&runt, Instant::now()),
            Err(FragmentError::Truncated)
        ));
    }

    #[test]
    fn test_incomplete_session_expires_without_delivery() {
        let (_, fragments) = fragments_for(2000, 300);
        let mut reassembler = Reassembler::new();
        let start = Instant::now();

        // Withhold the final fragment
        for fragment in &fragments[..fragments.len() - 1] {
            assert!(reassembler.accept(fragment, start).unwrap().is_none());
        }
        assert_eq!(reassembler.live_sessions(), 1);

        // Raw random-ish chunks decode as neither packets nor messages
        let recovered = reassembler.sweep(start + SESSION_TIMEOUT + Duration::from_secs(1));
        assert!(recovered.is_empty());
        assert_eq!(reassembler.live_sessions(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    #[test]
    fn test_session_cap_evicts_oldest() {
        let mut reassembler = Reassembler::new();
        let start = Instant::now();

        let mut first_id = None;
        for i in 0..(MAX_SESSIONS + 1) {
            let header = FragmentHeader {
                id: FragmentId::from_bytes([i as u8, (i >> 8) as u8, 0xA, 0xB, 0xC, 0xD, 0xE, 0xF]),
                index: 0,
                total: 2,
                original_kind: MessageKind::Message,
            };
            if first_id.is_none() {
                first_id = Some(header.id);
            }
            let fragment = Packet::broadcast(
                MessageKind::FragmentStart,
                PeerId::from_bytes(&[1]),
                i as u64,
                header.encode(b"partial"),
            );
            reassembler.accept(&fragment, start).unwrap();
        }

        assert_eq!(reassembler.live_sessions(), MAX_SESSIONS);
        // The oldest session made way for the newest
        assert!(!reassembler.sessions.contains_key(&first_id.unwrap()));
    }

    #[test]
    fn test_byte_budget_evicts_oldest() {
        let mut reassembler = Reassembler::with_limits(50, SESSION_TIMEOUT, 1024);
        let start = Instant::now();

        for i in 0..4u8 {
            let header = FragmentHeader {
                id: FragmentId::from_bytes([i, 0, 0, 0, 0, 0, 0, 1]),
                index: 0,
                total: 2,
                original_kind: MessageKind::Message,
            };
            let fragment = Packet::broadcast(
                MessageKind::FragmentStart,
                PeerId::from_bytes(&[1]),
                i as u64,
                header.encode(&[0u8; 400]),
            );
            reassembler.accept(&fragment, start).unwrap();
        }

        assert!(reassembler.buffered_bytes() <= 1024);
        assert!(reassembler.live_sessions() < 4);
    }

    #[test]
    fn test_expiry_recovers_single_chunk_packet() {
        // A lossy link delivered "fragment 0 of 2" whose chunk is in fact a
        // complete encoded packet.
        let whole = Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[0xAB]),
            777,
            Bytes::from_static(b"whole message"),
        );
        let header = FragmentHeader {
            id: FragmentId::from_bytes([9; 8]),
            index: 0,
            total: 2,
            original_kind: MessageKind::Message,
        };
        let fragment = Packet::broadcast(
            MessageKind::FragmentStart,
            PeerId::from_bytes(&[0xAB]),
            778,
            header.encode(&whole.encode().unwrap()),
        );

        let mut reassembler = Reassembler::new();
        let start = Instant::now();
        assert!(reassembler.accept(&fragment, start).unwrap().is_none());

        let recovered = reassembler.sweep(start + SESSION_TIMEOUT);
        assert_eq!(recovered.len(), 1);
        match &recovered[0] {
            Recovered::Packet(packet) => assert_eq!(*packet, whole),
            other => panic!("expected packet recovery, got {:?}", other),
        }
    }

    #[test]
    fn test_expiry_recovers_single_chunk_message() {
        let message = ChatMessage {
            id: "m1".into(),
            sender: "alice".into(),
            content: "survived the lossy link".into(),
            timestamp: 99,
            ..Default::default()
        };
        let header = FragmentHeader {
            id: FragmentId::from_bytes([7; 8]),
            index: 0,
            total: 2,
            original_kind: MessageKind::Message,
        };
        let sender = PeerId::from_bytes(&[0xCD]);
        let fragment = Packet::broadcast(
            MessageKind::FragmentStart,
            sender,
            1,
            header.encode(&message.encode().unwrap()),
        );

        let mut reassembler = Reassembler::new();
        let start = Instant::now();
        reassembler.accept(&fragment, start).unwrap();

        let recovered = reassembler.sweep(start + SESSION_TIMEOUT);
        assert_eq!(recovered.len(), 1);
        match &recovered[0] {
            Recovered::Message { sender: s, message: m } => {
                assert_eq!(*s, sender);
                assert_eq!(m, &message);
            }
            other => panic!("expected message recovery, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_fragment_does_not_double_count() {
        let (_, fragments) = fragments_for(600, 300);
        let mut reassembler = Reassembler::new();
        let now = Instant::now();

        reassembler.accept(&fragments[0], now).unwrap();
        let buffered = reassembler.buffered_bytes();
        reassembler.accept(&fragments[0], now).unwrap();
        assert_eq!(reassembler.buffered_bytes(), buffered);
    }
}
