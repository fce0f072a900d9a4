//! Fragmentation error types.

use chatmesh_wire::WireError;
use thiserror::Error;

/// Fragmentation and reassembly errors
#[derive(Error, Debug)]
pub enum FragmentError {
    /// Fragment payload shorter than the 13-byte sub-header
    #[error("fragment payload too short")]
    Truncated,

    /// Fragment sub-header fields inconsistent (zero total, index out of range)
    #[error("invalid fragment header")]
    Header,

    /// Fragment disagrees with the session it claims to belong to
    #[error("fragment does not match session")]
    SessionMismatch,

    /// Payload too large to split within the fragment count limit
    #[error("payload too large to fragment: {0} bytes")]
    TooLarge(usize),

    /// Reassembled buffer failed to decode as a packet
    #[error("reassembled buffer invalid: {0}")]
    Decode(#[from] WireError),
}
