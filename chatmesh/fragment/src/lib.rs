//! Fragmentation and reassembly for the chatmesh protocol.
//!
//! Payloads that exceed a single transport write are split into
//! FRAGMENT_START / FRAGMENT_CONTINUE / FRAGMENT_END packets, each carrying
//! a 13-byte sub-header (fragment id, index, total, original type) ahead of
//! its chunk. The reassembler collects chunks per fragment id and re-decodes
//! the concatenated buffer as a packet, under three hard bounds: at most 50
//! concurrent sessions, a 30 second session timeout, and 10 MiB of buffered
//! chunk bytes overall.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fragmenter;
pub mod header;
pub mod reassembler;

pub use error::FragmentError;
pub use fragmenter::{Fragmenter, DEFAULT_WRITE_CAPACITY};
pub use header::{FragmentHeader, FragmentId, FRAGMENT_HEADER_SIZE};
pub use reassembler::{
    Reassembler, Recovered, MAX_BUFFERED_BYTES, MAX_SESSIONS, SESSION_TIMEOUT,
};
