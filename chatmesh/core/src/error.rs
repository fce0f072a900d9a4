//! Mesh core error types.

use chatmesh_fragment::FragmentError;
use chatmesh_wire::WireError;
use thiserror::Error;

use crate::transport::TransportError;

/// Mesh orchestration errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// The service has been stopped or never started
    #[error("mesh service not running")]
    NotRunning,

    /// No connected links to write to
    #[error("no connected links")]
    NoLinks,

    /// Codec failure on an outbound payload
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Fragmentation failure on an outbound payload
    #[error("fragment: {0}")]
    Fragment(#[from] FragmentError),

    /// Transport-level failure, recoverable by the caller
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
