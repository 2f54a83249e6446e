//! Cryptographic primitives for shardfs
//!
//! Provides:
//! - AES-256-CTR streaming encryption with a random IV prefixed to the ciphertext
//! - MD5 key hashing for the identifiers exchanged between peers
//! - Random node identifiers

use crate::error::{Result, ShardFsError};
use aes::cipher::{typenum::Unsigned, BlockSizeUser, KeyIvInit, StreamCipher};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES-256 key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// IV length prefixed to every ciphertext: one AES block
pub const IV_SIZE: usize = <<Aes256 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

/// Random bytes in a node identifier (hex-encoded to twice this length)
pub const NODE_ID_SIZE: usize = 32;

/// Size of the buffer used to pump bytes through the cipher
const CHUNK_SIZE: usize = 32 * 1024;

/// AES-256 encryption key shared by every object a node writes or reads
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random key, re-rolling until it contains no zero byte
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        loop {
            OsRng.fill_bytes(&mut key);
            if !key.contains(&0) {
                return Self(key);
            }
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(ShardFsError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ShardFsError::Configuration(format!("Invalid key hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

fn new_cipher(key: &EncryptionKey, iv: &[u8; IV_SIZE]) -> Result<Aes256Ctr> {
    Aes256Ctr::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| ShardFsError::Encryption(e.to_string()))
}

/// Run the keystream over `src` until EOF, writing every chunk to `dst`.
/// Short reads are fine: CTR keeps its position across calls.
async fn apply_stream<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

/// Encrypt `src` into `dst`: a random IV first, then the CTR ciphertext.
///
/// Returns the total number of bytes written including the IV, which is
/// always `plaintext_len + IV_SIZE`.
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv).await?;
    let body = apply_stream(&mut cipher, &mut src, &mut dst).await?;
    Ok(IV_SIZE as u64 + body)
}

/// Decrypt `src` into `dst`, reading the IV from the first block of `src`.
///
/// Returns the number of bytes consumed from `src`: the IV plus the plaintext
/// written to `dst`.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ShardFsError::Encryption("Stream ended before the IV".to_string())
        } else {
            ShardFsError::Io(e)
        }
    })?;
    let mut cipher = new_cipher(key, &iv)?;

    let body = apply_stream(&mut cipher, &mut src, &mut dst).await?;
    Ok(IV_SIZE as u64 + body)
}

/// Hash an object key into the identifier sent over the wire (MD5, hex)
pub fn hash_key(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// Generate a random node identifier (32 bytes, hex)
pub fn generate_id() -> String {
    let mut buf = [0u8; NODE_ID_SIZE];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
