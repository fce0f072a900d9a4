//! Fragment sub-header.
//!
//! Every fragment payload starts with a 13-byte sub-header: an 8-byte
//! fragment id, a 2-byte big-endian index, a 2-byte big-endian total count,
//! and the original message type being reassembled. The remaining bytes are
//! the chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chatmesh_wire::MessageKind;
use std::fmt;

use crate::FragmentError;

/// Fragment sub-header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// 8-byte identifier tying fragments of one payload together
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId([u8; 8]);

impl FragmentId {
    /// Generate a random fragment id
    pub fn random() -> Self {
        FragmentId(rand::random())
    }

    /// Build from raw bytes
    pub fn from_bytes(raw: [u8; 8]) -> Self {
        FragmentId(raw)
    }

    /// The raw id bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentId(")?;
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}

/// Parsed fragment sub-header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Reassembly session id
    pub id: FragmentId,
    /// 0-based fragment index
    pub index: u16,
    /// Total fragment count
    pub total: u16,
    /// Message type of the payload being reassembled
    pub original_kind: MessageKind,
}

impl FragmentHeader {
    /// Parse a fragment payload into its sub-header and chunk
    pub fn parse(payload: &[u8]) -> Result<(FragmentHeader, Bytes), FragmentError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::Truncated);
        }

        let mut buf = Bytes::copy_from_slice(payload);
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf.split_to(8));
        let index = buf.get_u16();
        let total = buf.get_u16();
        let original_kind =
            MessageKind::from_wire(buf.get_u8()).map_err(|_| FragmentError::Header)?;

        if total == 0 || index >= total {
            return Err(FragmentError::Header);
        }

        Ok((
            FragmentHeader {
                id: FragmentId(id),
                index,
                total,
                original_kind,
            },
            buf,
        ))
    }

    /// Prepend this sub-header to a chunk
    pub fn encode(&self, chunk: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        buf.put_slice(&self.id.0);
        buf.put_u16(self.index);
        buf.put_u16(self.total);
        buf.put_u8(self.original_kind.to_wire());
        buf.put_slice(chunk);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FragmentHeader {
            id: FragmentId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            index: 3,
            total: 9,
            original_kind: MessageKind::Message,
        };
        let payload = header.encode(b"chunk bytes");
        let (parsed, chunk) = FragmentHeader::parse(&payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(chunk.as_ref(), b"chunk bytes");
    }

    #[test]
    fn test_parse_rejects_short_payload() {
        assert!(matches!(
            FragmentHeader::parse(&[0u8; FRAGMENT_HEADER_SIZE - 1]),
            Err(FragmentError::Truncated)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_counts() {
        let zero_total = FragmentHeader {
            id: FragmentId::from_bytes([0; 8]),
            index: 0,
            total: 1,
            original_kind: MessageKind::Message,
        };
        let mut bytes = zero_total.encode(b"x").to_vec();
        // total = 0
        bytes[10] = 0;
        bytes[11] = 0;
        assert!(matches!(
            FragmentHeader::parse(&bytes),
            Err(FragmentError::Header)
        ));

        // index >= total
        let mut bytes = zero_total.encode(b"x").to_vec();
        bytes[8] = 0;
        bytes[9] = 5;
        assert!(matches!(
            FragmentHeader::parse(&bytes),
            Err(FragmentError::Header)
        ));
    }
}
