//! shardfs Core Library
//!
//! Core abstractions shared by every shardfs crate:
//! - AES-256-CTR streaming cipher codec with an IV prefix
//! - Key hashing and node identifiers
//! - Common error handling

pub mod crypto;
pub mod error;

pub use crypto::{
    copy_decrypt, copy_encrypt, generate_id, hash_key, EncryptionKey, IV_SIZE, KEY_SIZE,
};
pub use error::{Result, ShardFsError};
