//! Chat message payload codec.
//!
//! Two formats coexist on the wire. Encoding always produces the compact
//! binary format: an optional-field bitfield, an 8-byte big-endian
//! millisecond timestamp, then length-prefixed fields. Decoding tries the
//! compact format first and falls back to a JSON rendition of the same
//! fields, which older peers produced before the compact fields existed.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::WireError;

/// Minimum compact encoding: flags + timestamp + id length + sender length
/// + content length
pub const MIN_MESSAGE_SIZE: usize = 13;

bitflags! {
    /// Optional-field bitfield leading the compact format
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MsgFlags: u8 {
        const IS_RELAY = 1 << 0;
        const IS_PRIVATE = 1 << 1;
        const HAS_ORIGINAL_SENDER = 1 << 2;
        const HAS_RECIPIENT_NICKNAME = 1 << 3;
        const HAS_SENDER_PEER_ID = 1 << 4;
        const HAS_MENTIONS = 1 << 5;
        const HAS_CHANNEL = 1 << 6;
        const IS_ENCRYPTED = 1 << 7;
    }
}

/// Application-level chat message carried inside a MESSAGE packet.
///
/// When `is_encrypted` is set, `content` carries no plaintext and
/// `encrypted_content` holds the ciphertext; the codec enforces that the
/// two are never conflated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessage {
    /// Unique message id
    pub id: String,
    /// Sender display name
    pub sender: String,
    /// Plaintext content; empty when encrypted
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Whether this copy arrived via relay
    pub is_relay: bool,
    /// Whether this is a directed message
    pub is_private: bool,
    /// Whether the content is ciphertext
    pub is_encrypted: bool,
    /// Display name of the original sender when relayed
    pub original_sender: Option<String>,
    /// Display name of the recipient for private messages
    pub recipient_nickname: Option<String>,
    /// Originating peer id, attributed on receipt
    #[serde(rename = "senderPeerID")]
    pub sender_peer_id: Option<String>,
    /// Mentioned display names
    pub mentions: Option<Vec<String>>,
    /// Channel name, if channel-scoped
    pub channel: Option<String>,
    /// Ciphertext; present iff `is_encrypted`
    pub encrypted_content: Option<Vec<u8>>,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            id: String::new(),
            sender: String::new(),
            content: String::new(),
            timestamp: 0,
            is_relay: false,
            is_private: false,
            is_encrypted: false,
            original_sender: None,
            recipient_nickname: None,
            sender_peer_id: None,
            mentions: None,
            channel: None,
            encrypted_content: None,
        }
    }
}

impl ChatMessage {
    /// Encode to the compact binary format
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.is_encrypted != self.encrypted_content.is_some() {
            return Err(WireError::Encryption);
        }

        let mut flags = MsgFlags::empty();
        flags.set(MsgFlags::IS_RELAY, self.is_relay);
        flags.set(MsgFlags::IS_PRIVATE, self.is_private);
        flags.set(MsgFlags::IS_ENCRYPTED, self.is_encrypted);
        flags.set(MsgFlags::HAS_ORIGINAL_SENDER, self.original_sender.is_some());
        flags.set(
            MsgFlags::HAS_RECIPIENT_NICKNAME,
            self.recipient_nickname.is_some(),
        );
        flags.set(MsgFlags::HAS_SENDER_PEER_ID, self.sender_peer_id.is_some());
        flags.set(MsgFlags::HAS_MENTIONS, self.mentions.is_some());
        flags.set(MsgFlags::HAS_CHANNEL, self.channel.is_some());

        let mut buf = BytesMut::with_capacity(64 + self.content.len());
        buf.put_u8(flags.bits());
        buf.put_u64(self.timestamp);
        put_str8(&mut buf, &self.id)?;
        put_str8(&mut buf, &self.sender)?;

        let body: &[u8] = match &self.encrypted_content {
            Some(cipher) => cipher,
            None => self.content.as_bytes(),
        };
        if body.len() > u16::MAX as usize {
            return Err(WireError::Size(body.len()));
        }
        buf.put_u16(body.len() as u16);
        buf.put_slice(body);

        if let Some(original) = &self.original_sender {
            put_str8(&mut buf, original)?;
        }
        if let Some(nickname) = &self.recipient_nickname {
            put_str8(&mut buf, nickname)?;
        }
        if let Some(peer) = &self.sender_peer_id {
            put_str8(&mut buf, peer)?;
        }
        if let Some(mentions) = &self.mentions {
            if mentions.len() > u8::MAX as usize {
                return Err(WireError::Size(mentions.len()));
            }
            buf.put_u8(mentions.len() as u8);
            for mention in mentions {
                put_str8(&mut buf, mention)?;
            }
        }
        if let Some(channel) = &self.channel {
            put_str8(&mut buf, channel)?;
        }

        Ok(buf.freeze())
    }

    /// Decode from either wire format.
    ///
    /// Tries the compact format first; any inconsistency falls through to
    /// the JSON fallback. Returns `WireError::Message` when neither format
    /// matches.
    pub fn decode(data: &[u8]) -> Result<ChatMessage, WireError> {
        match Self::decode_compact(data) {
            Ok(message) => Ok(message),
            Err(compact_err) => {
                trace!(%compact_err, "compact decode failed, trying json fallback");
                Self::decode_json(data).map_err(|_| WireError::Message)
            }
        }
    }

    fn decode_compact(data: &[u8]) -> Result<ChatMessage, WireError> {
        if data.len() < MIN_MESSAGE_SIZE {
            return Err(WireError::Truncated);
        }

        let mut buf = Bytes::copy_from_slice(data);
        let flags = MsgFlags::from_bits(buf.get_u8()).ok_or(WireError::Length)?;
        let timestamp = buf.get_u64();

        let id = read_str8(&mut buf)?;
        let sender = read_str8(&mut buf)?;

        if buf.len() < 2 {
            return Err(WireError::Truncated);
        }
        let body_len = buf.get_u16() as usize;
        if buf.len() < body_len {
            return Err(WireError::Length);
        }
        let body = buf.split_to(body_len);

        let (content, encrypted_content) = if flags.contains(MsgFlags::IS_ENCRYPTED) {
            (String::new(), Some(body.to_vec()))
        } else {
            (
                String::from_utf8(body.to_vec()).map_err(|_| WireError::Utf8)?,
                None,
            )
        };

        let original_sender = if flags.contains(MsgFlags::HAS_ORIGINAL_SENDER) {
            Some(read_str8(&mut buf)?)
        } else {
            None
        };
        let recipient_nickname = if flags.contains(MsgFlags::HAS_RECIPIENT_NICKNAME) {
            Some(read_str8(&mut buf)?)
        } else {
            None
        };
        let sender_peer_id = if flags.contains(MsgFlags::HAS_SENDER_PEER_ID) {
            Some(read_str8(&mut buf)?)
        } else {
            None
        };
        let mentions = if flags.contains(MsgFlags::HAS_MENTIONS) {
            if buf.is_empty() {
                return Err(WireError::Truncated);
            }
            let count = buf.get_u8() as usize;
            let mut entries = Vec::with_capacity(count.min(32));
            for _ in 0..count {
                entries.push(read_str8(&mut buf)?);
            }
            Some(entries)
        } else {
            None
        };
        let channel = if flags.contains(MsgFlags::HAS_CHANNEL) {
            Some(read_str8(&mut buf)?)
        } else {
            None
        };

        Ok(ChatMessage {
            id,
            sender,
            content,
            timestamp,
            is_relay: flags.contains(MsgFlags::IS_RELAY),
            is_private: flags.contains(MsgFlags::IS_PRIVATE),
            is_encrypted: flags.contains(MsgFlags::IS_ENCRYPTED),
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
            channel,
            encrypted_content,
        })
    }

    fn decode_json(data: &[u8]) -> Result<ChatMessage, serde_json::Error> {
        let mut message: ChatMessage = serde_json::from_slice(data)?;
        // Normalize the encrypted invariant for payloads predating it.
        if !message.is_encrypted {
            message.encrypted_content = None;
        } else {
            message.content.clear();
        }
        Ok(message)
    }
}

fn put_str8(buf: &mut BytesMut, value: &str) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(WireError::Size(bytes.len()));
    }
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
    Ok(())
}

fn read_str8(buf: &mut Bytes) -> Result<String, WireError> {
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return Err(WireError::Length);
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| WireError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_message() -> ChatMessage {
        ChatMessage {
            id: "b3c1a2d4".into(),
            sender: "alice".into(),
            content: "lunch at noon?".into(),
            timestamp: 1_700_000_000_000,
            is_relay: true,
            is_private: false,
            is_encrypted: false,
            original_sender: Some("bob".into()),
            recipient_nickname: None,
            sender_peer_id: Some("AABB0011".into()),
            mentions: Some(vec!["carol".into(), "dave".into()]),
            channel: Some("#general".into()),
            encrypted_content: None,
        }
    }

    #[test]
    fn test_roundtrip_full() {
        let message = full_message();
        let bytes = message.encode().unwrap();
        assert_eq!(ChatMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_roundtrip_minimal() {
        let message = ChatMessage {
            id: "1".into(),
            sender: "a".into(),
            content: String::new(),
            timestamp: 7,
            ..Default::default()
        };
        let bytes = message.encode().unwrap();
        assert_eq!(ChatMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_encrypted_content_is_exclusive() {
        let message = ChatMessage {
            id: "x".into(),
            sender: "mallory".into(),
            timestamp: 1,
            is_encrypted: true,
            encrypted_content: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            ..Default::default()
        };
        let bytes = message.encode().unwrap();
        let decoded = ChatMessage::decode(&bytes).unwrap();
        assert!(decoded.is_encrypted);
        assert!(decoded.content.is_empty());
        assert_eq!(decoded.encrypted_content, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn test_encode_rejects_inconsistent_encryption() {
        let message = ChatMessage {
            id: "x".into(),
            sender: "y".into(),
            is_encrypted: true,
            encrypted_content: None,
            ..Default::default()
        };
        assert!(matches!(message.encode(), Err(WireError::Encryption)));
    }

    #[test]
    fn test_length_overrun_fails_both_formats() {
        let mut bytes = full_message().encode().unwrap().to_vec();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            ChatMessage::decode(&bytes),
            Err(WireError::Message)
        ));
    }

    #[test]
    fn test_json_fallback() {
        let json = br#"{
            "id": "legacy-1",
            "sender": "eve",
            "content": "hi from an old peer",
            "timestamp": 123456,
            "isRelay": false,
            "isPrivate": true,
            "recipientNickname": "alice",
            "senderPeerID": "CC00DD11"
        }"#;
        let decoded = ChatMessage::decode(json).unwrap();
        assert_eq!(decoded.id, "legacy-1");
        assert!(decoded.is_private);
        assert_eq!(decoded.recipient_nickname.as_deref(), Some("alice"));
        assert_eq!(decoded.sender_peer_id.as_deref(), Some("CC00DD11"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ChatMessage::decode(b"\xFF\xFE\x00").is_err());
        assert!(ChatMessage::decode(b"").is_err());
    }
}
