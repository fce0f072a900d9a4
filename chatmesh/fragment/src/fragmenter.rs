//! Splitting oversized payloads into fragment packets.

use bytes::Bytes;
use chatmesh_wire::{MessageKind, Packet};
use tracing::debug;

use crate::header::{FragmentHeader, FragmentId, FRAGMENT_HEADER_SIZE};
use crate::FragmentError;

/// Default capacity of a single transport write, in payload bytes
pub const DEFAULT_WRITE_CAPACITY: usize = 512;

/// Splits packets whose payload exceeds the transport write capacity
#[derive(Debug, Clone)]
pub struct Fragmenter {
    capacity: usize,
}

impl Fragmenter {
    /// Create a fragmenter for the given per-write payload capacity
    pub fn new(capacity: usize) -> Self {
        // Each fragment must fit its sub-header plus at least one chunk byte.
        Self {
            capacity: capacity.max(FRAGMENT_HEADER_SIZE + 1),
        }
    }

    /// Whether an encoded packet of this size requires splitting
    pub fn needs_split(&self, encoded_len: usize) -> bool {
        encoded_len > self.capacity
    }

    /// Split a packet into fragment packets.
    ///
    /// Returns the packet unchanged (as a single element) when its encoding
    /// already fits one write. Otherwise the fully-encoded packet bytes are
    /// chunked, so reassembly decodes the concatenation straight back into
    /// the original packet. Fragments inherit the original's addressing and
    /// hop budget; each carries a distinct timestamp so fragments of one
    /// payload never collide in the dedup cache.
    pub fn split(&self, packet: Packet) -> Result<Vec<Packet>, FragmentError> {
        let encoded = packet.encode()?;
        if !self.needs_split(encoded.len()) {
            return Ok(vec![packet]);
        }

        let chunk_size = self.capacity - FRAGMENT_HEADER_SIZE;
        let total_chunks = encoded.len().div_ceil(chunk_size);
        if total_chunks > u16::MAX as usize {
            return Err(FragmentError::TooLarge(encoded.len()));
        }

        let id = FragmentId::random();
        let total = total_chunks as u16;
        let mut fragments = Vec::with_capacity(total_chunks);

        for (index, chunk) in encoded.chunks(chunk_size).enumerate() {
            let index = index as u16;
            let kind = if index == 0 {
                MessageKind::FragmentStart
            } else if index == total - 1 {
                MessageKind::FragmentEnd
            } else {
                MessageKind::FragmentContinue
            };

            let header = FragmentHeader {
                id,
                index,
                total,
                original_kind: packet.kind,
            };

            fragments.push(Packet {
                version: packet.version,
                kind,
                ttl: packet.ttl,
                timestamp: packet.timestamp + index as u64,
                sender: packet.sender,
                recipient: packet.recipient,
                payload: header.encode(chunk),
                signature: None,
            });
        }

        debug!(
            id = ?id,
            total,
            original = ?packet.kind,
            "split payload into fragments"
        );
        Ok(fragments)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_CAPACITY)
    }
}

/// Reassemble chunk bytes in index order into one payload
pub(crate) fn concat_chunks<'a>(chunks: impl Iterator<Item = &'a Bytes>, size: usize) -> Bytes {
    let mut out = Vec::with_capacity(size);
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    Bytes::from(out)
}
