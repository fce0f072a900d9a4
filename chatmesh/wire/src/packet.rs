//! Packet envelope codec.
//!
//! This module defines the outer binary envelope carried on every transport
//! write: a fixed header, addressing, the opaque payload, and an optional
//! signature. All multi-byte integers are big-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::WireError;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size: version + type + ttl + timestamp + flags + payload length
pub const HEADER_SIZE: usize = 14;

/// Peer identifier size in bytes
pub const PEER_ID_SIZE: usize = 8;

/// Signature size in bytes (format-reserved, carried opaquely)
pub const SIGNATURE_SIZE: usize = 64;

/// Hop budget assigned to locally originated chat packets
pub const MAX_TTL: u8 = 7;

/// Hop budget assigned to announce packets
pub const ANNOUNCE_TTL: u8 = 3;

/// An 8-byte peer identifier.
///
/// Stored zero-padded; bytes after the first zero are not significant and
/// are normalized away on decode, so equality and hashing see one canonical
/// form per peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// The broadcast address: eight 0xFF bytes
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);

    /// Build a peer id from up to 8 raw bytes, zero-padding the tail
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        let n = raw.len().min(PEER_ID_SIZE);
        id[..n].copy_from_slice(&raw[..n]);
        PeerId(id).normalized()
    }

    /// Parse an uppercase/lowercase hex peer id of up to 16 digits
    pub fn parse_hex(s: &str) -> Result<Self, WireError> {
        if s.is_empty() || s.len() > PEER_ID_SIZE * 2 || s.len() % 2 != 0 {
            return Err(WireError::Length);
        }
        let mut id = [0u8; PEER_ID_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).ok_or(WireError::Length)?;
            let lo = (chunk[1] as char).to_digit(16).ok_or(WireError::Length)?;
            id[i] = ((hi << 4) | lo) as u8;
        }
        Ok(PeerId(id).normalized())
    }

    /// The full zero-padded 8 bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// The significant prefix, trimmed at the first zero byte
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(PEER_ID_SIZE);
        &self.0[..end]
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    // Zero out everything after the first zero byte so padded and trimmed
    // encodings of the same peer compare equal.
    fn normalized(mut self) -> Self {
        if let Some(pos) = self.0.iter().position(|&b| b == 0) {
            for b in &mut self.0[pos..] {
                *b = 0;
            }
        }
        self
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.trimmed() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Message types carried in the envelope's type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Peer presence announcement carrying a display name
    Announce,
    /// Peer departure notification
    Leave,
    /// Chat message payload
    Message,
    /// First fragment of a large payload
    FragmentStart,
    /// Middle fragment
    FragmentContinue,
    /// Final fragment
    FragmentEnd,
    /// Channel advertisement
    ChannelAnnounce,
    /// Delivery acknowledgment for a message id
    DeliveryAck,
    /// Read receipt for a message id
    ReadReceipt,
    /// Reserved handshake/identity/encrypted types (0x10-0x17); relayed, not processed
    Reserved(u8),
}

impl MessageKind {
    /// Decode a type byte
    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(MessageKind::Announce),
            0x03 => Ok(MessageKind::Leave),
            0x04 => Ok(MessageKind::Message),
            0x05 => Ok(MessageKind::FragmentStart),
            0x06 => Ok(MessageKind::FragmentContinue),
            0x07 => Ok(MessageKind::FragmentEnd),
            0x08 => Ok(MessageKind::ChannelAnnounce),
            0x0A => Ok(MessageKind::DeliveryAck),
            0x0C => Ok(MessageKind::ReadReceipt),
            0x10..=0x17 => Ok(MessageKind::Reserved(value)),
            _ => Err(WireError::Kind(value)),
        }
    }

    /// The wire value of this type
    pub fn to_wire(self) -> u8 {
        match self {
            MessageKind::Announce => 0x01,
            MessageKind::Leave => 0x03,
            MessageKind::Message => 0x04,
            MessageKind::FragmentStart => 0x05,
            MessageKind::FragmentContinue => 0x06,
            MessageKind::FragmentEnd => 0x07,
            MessageKind::ChannelAnnounce => 0x08,
            MessageKind::DeliveryAck => 0x0A,
            MessageKind::ReadReceipt => 0x0C,
            MessageKind::Reserved(v) => v,
        }
    }

    /// Whether this is one of the three fragment types
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            MessageKind::FragmentStart | MessageKind::FragmentContinue | MessageKind::FragmentEnd
        )
    }

    /// Whether this type belongs to the reserved handshake range
    pub fn is_reserved(self) -> bool {
        matches!(self, MessageKind::Reserved(_))
    }
}

bitflags! {
    /// Envelope flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// Recipient id field present (directed packet)
        const HAS_RECIPIENT = 1 << 0;
        /// Signature field present
        const HAS_SIGNATURE = 1 << 1;
        /// Payload is compressed; a 2-byte original-size field precedes it
        const COMPRESSED = 1 << 2;
    }
}

/// Key identifying one logical transmission regardless of relay path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    sender: [u8; PEER_ID_SIZE],
    timestamp: u64,
    payload_head: [u8; 8],
}

/// The wire envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Message type
    pub kind: MessageKind,
    /// Hop budget, decremented once per relay
    pub ttl: u8,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Originating peer
    pub sender: PeerId,
    /// Target peer; `None` means broadcast
    pub recipient: Option<PeerId>,
    /// Opaque payload
    pub payload: Bytes,
    /// Optional signature (format-reserved, carried opaquely)
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Create a broadcast packet with the default hop budget
    pub fn broadcast(kind: MessageKind, sender: PeerId, timestamp: u64, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            ttl: MAX_TTL,
            timestamp,
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    /// Create a directed packet with the default hop budget
    pub fn private(
        kind: MessageKind,
        sender: PeerId,
        recipient: PeerId,
        timestamp: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            ttl: MAX_TTL,
            timestamp,
            sender,
            recipient: Some(recipient),
            payload,
            signature: None,
        }
    }

    /// Set the hop budget
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether this packet targets every peer
    pub fn is_broadcast(&self) -> bool {
        match self.recipient {
            None => true,
            Some(r) => r.is_broadcast(),
        }
    }

    /// Whether `local` should process this packet's payload
    pub fn addressed_to(&self, local: PeerId) -> bool {
        self.is_broadcast() || self.recipient == Some(local)
    }

    /// The dedup key of this transmission
    pub fn dedup_key(&self) -> DedupKey {
        let mut head = [0u8; 8];
        let n = self.payload.len().min(8);
        head[..n].copy_from_slice(&self.payload[..n]);
        DedupKey {
            sender: *self.sender.as_bytes(),
            timestamp: self.timestamp,
            payload_head: head,
        }
    }

    /// Encode the envelope to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        // Compression is a reserved capability: the hook never compresses,
        // but the flag and original-size field stay in the format so a
        // future compressor interoperates with this decoder.
        let compressed: Option<u16> = None;

        let mut flags = Flags::empty();
        if self.recipient.is_some() {
            flags |= Flags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= Flags::HAS_SIGNATURE;
        }
        if compressed.is_some() {
            flags |= Flags::COMPRESSED;
        }

        let payload_len = self.payload.len() + if compressed.is_some() { 2 } else { 0 };
        if payload_len > u16::MAX as usize {
            return Err(WireError::Size(payload_len));
        }

        let total = HEADER_SIZE
            + PEER_ID_SIZE
            + if self.recipient.is_some() { PEER_ID_SIZE } else { 0 }
            + payload_len
            + if self.signature.is_some() { SIGNATURE_SIZE } else { 0 };

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.version);
        buf.put_u8(self.kind.to_wire());
        buf.put_u8(self.ttl);
        buf.put_u64(self.timestamp);
        buf.put_u8(flags.bits());
        buf.put_u16(payload_len as u16);
        buf.put_slice(self.sender.as_bytes());

        if let Some(recipient) = self.recipient {
            buf.put_slice(recipient.as_bytes());
        }
        if let Some(original) = compressed {
            buf.put_u16(original);
        }
        buf.put_slice(&self.payload);

        if let Some(signature) = &self.signature {
            buf.put_slice(signature);
        }

        Ok(buf.freeze())
    }

    /// Decode an envelope from wire bytes.
    ///
    /// All malformed input yields a `WireError`; decode never panics.
    pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
        if data.len() < HEADER_SIZE + PEER_ID_SIZE {
            return Err(WireError::Truncated);
        }

        let mut buf = Bytes::copy_from_slice(data);

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::Version(version));
        }

        let kind = MessageKind::from_wire(buf.get_u8())?;
        let ttl = buf.get_u8();
        let timestamp = buf.get_u64();
        // Unknown future flag bits are ignored rather than rejected.
        let flags = Flags::from_bits_truncate(buf.get_u8());
        let payload_len = buf.get_u16() as usize;

        let sender = PeerId::from_bytes(&buf.split_to(PEER_ID_SIZE));

        let recipient = if flags.contains(Flags::HAS_RECIPIENT) {
            if buf.len() < PEER_ID_SIZE {
                return Err(WireError::Truncated);
            }
            Some(PeerId::from_bytes(&buf.split_to(PEER_ID_SIZE)))
        } else {
            None
        };

        if buf.len() < payload_len {
            return Err(WireError::Length);
        }

        let payload = if flags.contains(Flags::COMPRESSED) {
            if payload_len < 2 {
                return Err(WireError::Length);
            }
            // No compressor in this core: consume the original-size field
            // and surface the payload bytes unchanged.
            let original = buf.get_u16();
            tracing::debug!(original, "skipping reserved compression header");
            buf.split_to(payload_len - 2)
        } else {
            buf.split_to(payload_len)
        };

        let signature = if flags.contains(Flags::HAS_SIGNATURE) {
            if buf.len() < SIGNATURE_SIZE {
                return Err(WireError::Truncated);
            }
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(&buf.split_to(SIGNATURE_SIZE));
            Some(sig)
        } else {
            None
        };

        Ok(Packet {
            version,
            kind,
            ttl,
            timestamp,
            sender,
            recipient,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::broadcast(
            MessageKind::Message,
            PeerId::from_bytes(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]),
            1_700_000_000_123,
            Bytes::from_static(b"hello mesh"),
        )
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(MessageKind::from_wire(0x01).unwrap(), MessageKind::Announce);
        assert_eq!(MessageKind::from_wire(0x0C).unwrap(), MessageKind::ReadReceipt);
        assert_eq!(
            MessageKind::from_wire(0x12).unwrap(),
            MessageKind::Reserved(0x12)
        );
        assert!(MessageKind::from_wire(0x12).unwrap().is_reserved());
        assert!(MessageKind::from_wire(0xFE).is_err());
        assert_eq!(MessageKind::Reserved(0x15).to_wire(), 0x15);
    }

    #[test]
    fn test_peer_id_trimming() {
        let padded = PeerId::from_bytes(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let short = PeerId::from_bytes(&[0x12, 0x34]);
        assert_eq!(padded, short);
        assert_eq!(padded.trimmed(), &[0x12, 0x34]);
        assert_eq!(padded.to_string(), "1234");

        // Bytes after an embedded zero are not significant
        let noisy = PeerId::from_bytes(&[0x12, 0x34, 0x00, 0x99, 0x99, 0x99, 0x99, 0x99]);
        assert_eq!(noisy, short);
    }

    #[test]
    fn test_peer_id_hex() {
        let id = PeerId::parse_hex("AABBCCDD11223344").unwrap();
        assert_eq!(id.to_string(), "AABBCCDD11223344");
        assert!(PeerId::parse_hex("xyz").is_err());
        assert!(PeerId::parse_hex("AABBCCDD112233445566").is_err());
    }

    #[test]
    fn test_broadcast_address() {
        assert!(PeerId::BROADCAST.is_broadcast());
        let p = sample_packet();
        assert!(p.is_broadcast());
        assert!(p.addressed_to(PeerId::from_bytes(&[1])));

        let directed = Packet::private(
            MessageKind::Message,
            PeerId::from_bytes(&[1]),
            PeerId::from_bytes(&[2]),
            0,
            Bytes::new(),
        );
        assert!(!directed.is_broadcast());
        assert!(directed.addressed_to(PeerId::from_bytes(&[2])));
        assert!(!directed.addressed_to(PeerId::from_bytes(&[3])));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_roundtrip_with_recipient_and_signature() {
        let mut packet = Packet::private(
            MessageKind::Message,
            PeerId::from_bytes(&[1, 2, 3]),
            PeerId::from_bytes(&[9, 8, 7]),
            42,
            Bytes::from_static(b"private"),
        );
        packet.signature = Some([0x5A; SIGNATURE_SIZE]);

        let bytes = packet.encode().unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_decode_rejects_short_buffers() {
        assert!(matches!(Packet::decode(&[]), Err(WireError::Truncated)));
        assert!(matches!(
            Packet::decode(&[1u8; HEADER_SIZE + PEER_ID_SIZE - 1]),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn test_decode_rejects_length_overrun() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        // Truncate mid-payload: the declared length now overruns the buffer
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(Packet::decode(cut), Err(WireError::Length)));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = sample_packet().encode().unwrap().to_vec();
        bytes[0] = 9;
        assert!(matches!(Packet::decode(&bytes), Err(WireError::Version(9))));
    }

    #[test]
    fn test_decode_skips_compressed_original_size() {
        // Hand-build a compressed packet: flags bit2, payload length includes
        // the 2-byte original-size field.
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(0x04);
        buf.put_u8(3);
        buf.put_u64(1234);
        buf.put_u8(Flags::COMPRESSED.bits());
        buf.put_u16(2 + 5);
        buf.put_slice(&[0xAB, 0, 0, 0, 0, 0, 0, 0]);
        buf.put_u16(999); // claimed original size
        buf.put_slice(b"stuff");

        let decoded = Packet::decode(&buf).unwrap();
        assert_eq!(decoded.payload.as_ref(), b"stuff");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut packet = sample_packet();
        packet.payload = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
        assert!(matches!(packet.encode(), Err(WireError::Size(_))));
    }

    #[test]
    fn test_dedup_key_ignores_ttl_and_route() {
        let packet = sample_packet();
        let mut relayed = packet.clone();
        relayed.ttl -= 1;
        assert_eq!(packet.dedup_key(), relayed.dedup_key());

        let mut other = packet.clone();
        other.timestamp += 1;
        assert_ne!(packet.dedup_key(), other.dedup_key());
    }
}
