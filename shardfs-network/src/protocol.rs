//! shardfs control messages
//!
//! Every control message names the node it concerns and the hashed object
//! key. Messages travel bincode-encoded inside a control frame (see
//! [`crate::frame`]); object bodies never do.

use crate::frame::encode_message_frame;
use serde::{Deserialize, Serialize};
use shardfs_core::error::Result;

/// Wire protocol version exchanged by [`crate::handshake::VersionHandshake`]
pub const PROTOCOL_VERSION: u8 = 1;

/// Replication control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The sender is about to stream `size` bytes of ciphertext for `key_hash`
    StoreFile {
        node_id: String,
        key_hash: String,
        size: u64,
    },

    /// Stream back whatever is held for `key_hash` of `node_id`
    GetFile { node_id: String, key_hash: String },

    /// Drop the replica `node_id` placed for `key_hash`
    DeleteFile { node_id: String, key_hash: String },
}

impl Message {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Serialize and wrap in a control frame, ready to put on a connection
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload = self.to_bytes()?;
        Ok(encode_message_frame(&payload)?)
    }

    /// Node the message concerns
    pub fn node_id(&self) -> &str {
        match self {
            Message::StoreFile { node_id, .. }
            | Message::GetFile { node_id, .. }
            | Message::DeleteFile { node_id, .. } => node_id,
        }
    }

    /// Hashed object key
    pub fn key_hash(&self) -> &str {
        match self {
            Message::StoreFile { key_hash, .. }
            | Message::GetFile { key_hash, .. }
            | Message::DeleteFile { key_hash, .. } => key_hash,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StoreFile { .. } => "store_file",
            Message::GetFile { .. } => "get_file",
            Message::DeleteFile { .. } => "delete_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, MESSAGE_TAG};

    fn store_msg() -> Message {
        Message::StoreFile {
            node_id: "a".repeat(64),
            key_hash: "0a4e6b0c1f4d3d1e9a8d7b4f6a0e7c1d".to_string(),
            size: 26,
        }
    }

    #[test]
    fn test_message_serialization() {
        let messages = [
            store_msg(),
            Message::GetFile {
                node_id: "node".into(),
                key_hash: "hash".into(),
            },
            Message::DeleteFile {
                node_id: "node".into(),
                key_hash: "hash".into(),
            },
        ];

        for msg in messages {
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_accessors() {
        let msg = store_msg();
        assert_eq!(msg.node_id(), "a".repeat(64));
        assert_eq!(msg.key_hash(), "0a4e6b0c1f4d3d1e9a8d7b4f6a0e7c1d");
        assert_eq!(msg.kind(), "store_file");

        let get = Message::GetFile {
            node_id: "n".into(),
            key_hash: "k".into(),
        };
        assert_eq!(get.kind(), "get_file");
        assert_eq!(get.key_hash(), "k");
    }

    #[test]
    fn test_unknown_variant_is_rejected() {
        // Variant index 7 does not exist
        let bytes = 7u32.to_le_bytes();
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_to_frame() {
        let msg = store_msg();
        let frame_bytes = msg.to_frame().unwrap();
        assert_eq!(frame_bytes[0], MESSAGE_TAG);

        let frame = read_frame(&mut frame_bytes.as_slice()).await.unwrap();
        assert!(!frame.is_stream);
        assert_eq!(Message::from_bytes(&frame.payload).unwrap(), msg);
    }
}
