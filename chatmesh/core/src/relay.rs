//! Relay flood-control decisions.
//!
//! The engine is a pure decision component: given an accepted packet it
//! answers whether to rebroadcast and after what jitter delay. Execution of
//! the delayed re-injection belongs to the orchestrator, which owns every
//! scheduled task and can cancel them as a group on shutdown.

use chatmesh_wire::Packet;
use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Why a packet was not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Hop budget already spent on arrival
    Expired,
    /// Last hop: the packet is processed locally but travels no further
    Exhausted,
    /// Lost the relay probability draw
    Probability,
}

/// Outcome of a relay decision
#[derive(Debug)]
pub enum RelayDecision {
    /// Do not rebroadcast
    Drop(DropReason),
    /// Rebroadcast `packet` after `delay`
    Relay {
        /// The packet with its hop budget decremented by one
        packet: Packet,
        /// Jitter inserted to de-collide simultaneous relayers
        delay: Duration,
    },
}

/// Decides whether and when to rebroadcast accepted packets
#[derive(Debug, Clone)]
pub struct RelayEngine {
    probability: f64,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl RelayEngine {
    /// Create an engine with the given relay probability and jitter window
    pub fn new(probability: f64, jitter_min: Duration, jitter_max: Duration) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            jitter_min: jitter_min.min(jitter_max),
            jitter_max: jitter_max.max(jitter_min),
        }
    }

    /// Decide the fate of an accepted packet.
    ///
    /// A packet with `ttl == 1` is processed locally but never relayed; a
    /// relayed packet carries exactly one less hop than the original.
    pub fn decide(&self, packet: &Packet) -> RelayDecision {
        match packet.ttl {
            0 => return RelayDecision::Drop(DropReason::Expired),
            1 => return RelayDecision::Drop(DropReason::Exhausted),
            _ => {}
        }

        let mut rng = rand::thread_rng();
        if self.probability < 1.0 && rng.gen::<f64>() >= self.probability {
            trace!(ttl = packet.ttl, "relay suppressed by probability");
            return RelayDecision::Drop(DropReason::Probability);
        }

        let delay = if self.jitter_max > self.jitter_min {
            let span = (self.jitter_max - self.jitter_min).as_millis() as u64;
            self.jitter_min + Duration::from_millis(rng.gen_range(0..=span))
        } else {
            self.jitter_min
        };

        RelayDecision::Relay {
            packet: packet.clone().with_ttl(packet.ttl - 1),
            delay,
        }
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(
            1.0,
            Duration::from_millis(50),
            Duration::from_millis(150),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chatmesh_wire::{MessageKind, PeerId};

    fn packet_with_ttl(ttl: u8) -> Packet {
        Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[1]),
            100,
            Bytes::from_static(b"x"),
        )
        .with_ttl(ttl)
    }

    #[test]
    fn test_last_hop_is_not_relayed() {
        let engine = RelayEngine::default();
        assert!(matches!(
            engine.decide(&packet_with_ttl(1)),
            RelayDecision::Drop(DropReason::Exhausted)
        ));
        assert!(matches!(
            engine.decide(&packet_with_ttl(0)),
            RelayDecision::Drop(DropReason::Expired)
        ));
    }

    #[test]
    fn test_relay_decrements_ttl_once() {
        let engine = RelayEngine::default();
        match engine.decide(&packet_with_ttl(7)) {
            RelayDecision::Relay { packet, delay } => {
                assert_eq!(packet.ttl, 6);
                assert!(delay >= Duration::from_millis(50));
                assert!(delay <= Duration::from_millis(150));
            }
            other => panic!("expected relay, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_probability_never_relays() {
        let engine = RelayEngine::new(0.0, Duration::ZERO, Duration::ZERO);
        for _ in 0..20 {
            assert!(matches!(
                engine.decide(&packet_with_ttl(7)),
                RelayDecision::Drop(DropReason::Probability)
            ));
        }
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let engine = RelayEngine::new(
            1.0,
            Duration::from_millis(50),
            Duration::from_millis(150),
        );
        for _ in 0..50 {
            if let RelayDecision::Relay { delay, .. } = engine.decide(&packet_with_ttl(3)) {
                assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
            }
        }
    }
}
