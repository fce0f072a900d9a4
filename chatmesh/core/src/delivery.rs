//! Outbound delivery status tracking.
//!
//! An explicit collaborator owned by the orchestrator, never process-global.
//! Records live in a `DashMap` so the service handle can query a message's
//! status without a round trip through the orchestrator task. Completed
//! records are reaped by the orchestrator's periodic sweep.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delivery lifecycle of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryState {
    /// Handed to the transport; nothing heard back
    Sent,
    /// A DELIVERY_ACK named this message
    Delivered,
    /// A READ_RECEIPT named this message
    Read,
}

/// One tracked outbound message
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// The message id the acks refer to
    pub message_id: String,
    /// Current lifecycle state
    pub state: DeliveryState,
    /// Wall-clock milliseconds of the last state change
    pub updated_at: u64,
    created: Instant,
}

/// Tracks the delivery state of outbound messages
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    records: DashMap<String, DeliveryRecord>,
}

impl DeliveryTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly sent message
    pub fn track(&self, message_id: String, timestamp: u64) {
        debug!(message_id = %message_id, "tracking outbound message");
        self.records.insert(
            message_id.clone(),
            DeliveryRecord {
                message_id,
                state: DeliveryState::Sent,
                updated_at: timestamp,
                created: Instant::now(),
            },
        );
    }

    /// Apply a DELIVERY_ACK. Returns `false` for unknown message ids.
    pub fn mark_delivered(&self, message_id: &str, timestamp: u64) -> bool {
        self.advance(message_id, DeliveryState::Delivered, timestamp)
    }

    /// Apply a READ_RECEIPT. Returns `false` for unknown message ids.
    pub fn mark_read(&self, message_id: &str, timestamp: u64) -> bool {
        self.advance(message_id, DeliveryState::Read, timestamp)
    }

    // State only moves forward: a late DELIVERY_ACK never demotes Read.
    fn advance(&self, message_id: &str, state: DeliveryState, timestamp: u64) -> bool {
        match self.records.get_mut(message_id) {
            Some(mut record) => {
                if state > record.state {
                    record.state = state;
                    record.updated_at = timestamp;
                    debug!(message_id = %message_id, ?state, "delivery state advanced");
                }
                true
            }
            None => {
                warn!(message_id = %message_id, "ack for unknown message");
                false
            }
        }
    }

    /// Current state of a tracked message
    pub fn status(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.records.get(message_id).map(|entry| entry.value().clone())
    }

    /// Drop completed records older than `retention`.
    ///
    /// Driven by the orchestrator's periodic sweep so all timers stay owned
    /// in one place.
    pub fn sweep(&self, retention: Duration) {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.state == DeliveryState::Sent || record.created.elapsed() < retention);
        let reaped = before - self.records.len();
        if reaped > 0 {
            debug!(reaped, "reaped completed delivery records");
        }
    }

    /// Number of tracked messages
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.clear();
    }
}
