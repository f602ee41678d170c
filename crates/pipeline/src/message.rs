//! Message metadata and the parsed message passed through the pipeline.
//!
//! [`MsgMetadata`] holds the envelope facts modifiers and delivery targets
//! need (message id, original sender, quarantine verdict), while
//! [`Message`] bundles metadata with the parsed [`HeaderSet`] and the
//! body [`MemoryBuffer`].

use uuid::Uuid;

use crate::{HeaderSet, MemoryBuffer};

/// Per-message facts collected while the message was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMetadata {
    /// Unique message identifier used in logs.
    pub id: String,

    /// Envelope sender as received, before any rewriting.
    pub original_from: String,

    /// Whether a check decided the message should land in the junk mailbox.
    pub quarantine: bool,
}

impl MsgMetadata {
    pub fn new(original_from: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_from: original_from.into(),
            quarantine: false,
        }
    }
}

/// A received message split into header and body.
#[derive(Debug, Clone)]
pub struct Message {
    pub meta: MsgMetadata,
    pub header: HeaderSet,
    pub body: MemoryBuffer,
}

impl Message {
    /// Parses a raw message received from `from`.
    pub fn from_raw(from: &str, raw: &[u8]) -> Self {
        let (header, offset) = HeaderSet::parse(raw);
        Self {
            meta: MsgMetadata::new(from),
            header,
            body: MemoryBuffer::new(&raw[offset..]),
        }
    }

    /// Serializes the message back into its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.header.to_bytes();
        raw.extend_from_slice(self.body.as_bytes());
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_metadata_new() {
        let meta = MsgMetadata::new("alice@example.org");
        assert_eq!(meta.original_from, "alice@example.org");
        assert!(!meta.quarantine);
    }

    #[test]
    fn test_msg_metadata_unique_ids() {
        let first = MsgMetadata::new("alice");
        let second = MsgMetadata::new("alice");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_message_from_raw() {
        let message = Message::from_raw(
            "sender@example.com",
            b"Subject: Hello\r\nTo: rcpt@example.com\r\n\r\nBody text",
        );

        assert_eq!(message.header.get("Subject").as_deref(), Some("Hello"));
        assert_eq!(message.body.as_bytes(), b"Body text");
        assert_eq!(message.meta.original_from, "sender@example.com");
    }

    #[test]
    fn test_message_to_bytes_round_trip() {
        let raw = b"Subject: Test\r\n\r\nBody";
        let mut message = Message::from_raw("from@test.com", raw);
        assert_eq!(message.to_bytes(), raw.to_vec());

        message.header.add("X-Custom", "value");
        let rebuilt = message.to_bytes();
        assert!(rebuilt.starts_with(b"X-Custom: value\r\n"));
        assert!(rebuilt.ends_with(b"\r\n\r\nBody"));
    }

    #[test]
    fn test_eight_bit_header_round_trip() {
        let raw = b"Subject: caf\xe9\r\nFrom: J\xc3\xb6rg <j@example.org>\r\n\r\nbody\r\n";
        let message = Message::from_raw("j@example.org", raw);
        assert_eq!(message.header.len(), 2);
        assert_eq!(message.to_bytes(), raw.to_vec());
    }
}
