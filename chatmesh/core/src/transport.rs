//! Transport contract consumed by the mesh core.
//!
//! The physical transport (device discovery, connection establishment, raw
//! byte delivery) lives outside this crate. It hands the orchestrator a
//! stream of [`TransportEvent`]s over an mpsc channel and accepts writes
//! through the [`Transport`] trait. The core never blocks the transport's
//! delivery path beyond a single dispatch pass.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Opaque handle identifying one transport link
pub type LinkId = u64;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is gone
    #[error("link closed")]
    Closed,

    /// A write failed
    #[error("write failed: {0}")]
    Write(String),
}

/// Events delivered by the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// A link came up
    Connected {
        /// The new link
        link: LinkId,
    },
    /// Bytes arrived on a link; one event per transport read
    BytesReceived {
        /// Originating link
        link: LinkId,
        /// Raw packet bytes
        bytes: Bytes,
    },
    /// A link went down
    Disconnected {
        /// The closed link
        link: LinkId,
    },
}

/// Write-side contract implemented by the transport layer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one packet's bytes to a link
    async fn write(&self, link: LinkId, bytes: Bytes) -> Result<(), TransportError>;

    /// Tear down a link
    async fn disconnect(&self, link: LinkId);
}
