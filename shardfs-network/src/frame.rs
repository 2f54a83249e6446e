//! Dual-mode framing.
//!
//! Every unit on a connection starts with a one-byte tag:
//! - `0x01` control frame: 4 bytes LE length + bincode payload
//! - `0x02` stream marker: raw object bytes follow, owned by whoever claims
//!   the stream; the decoder must not read past the marker

use bytes::Bytes;
use shardfs_core::error::ShardFsError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Tag of a length-prefixed control frame
pub const MESSAGE_TAG: u8 = 0x01;
/// Tag announcing a raw byte stream
pub const STREAM_TAG: u8 = 0x02;

const LEN_SIZE: usize = 4;
/// Largest control payload accepted from a peer
pub const MAX_MESSAGE_LEN: u32 = 1024 * 1024; // 1 MiB

/// One decoded unit from a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Remote address of the connection it arrived on
    pub from: String,
    /// Control payload; empty for stream markers
    pub payload: Bytes,
    /// Raw stream bytes follow this frame on the connection
    pub is_stream: bool,
}

impl Frame {
    fn message(payload: Bytes) -> Self {
        Self {
            from: String::new(),
            payload,
            is_stream: false,
        }
    }

    fn stream() -> Self {
        Self {
            from: String::new(),
            payload: Bytes::new(),
            is_stream: true,
        }
    }
}

/// Error reading a frame off a connection
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control frame of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for ShardFsError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ShardFsError::Io(e),
            FrameError::Closed => ShardFsError::Network("connection closed".to_string()),
            other => ShardFsError::Protocol(other.to_string()),
        }
    }
}

/// Wrap a control payload: tag + 4 bytes LE length + payload
pub fn encode_message_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = payload.len() as u32;
    if payload.len() > MAX_MESSAGE_LEN as usize {
        return Err(FrameError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(1 + LEN_SIZE + payload.len());
    out.push(MESSAGE_TAG);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read exactly one unit from `reader`.
///
/// A stream marker returns immediately without consuming any following
/// bytes. End of input before a tag is [`FrameError::Closed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };

    match tag {
        STREAM_TAG => Ok(Frame::stream()),
        MESSAGE_TAG => {
            let len = reader.read_u32_le().await?;
            if len > MAX_MESSAGE_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            Ok(Frame::message(Bytes::from(payload)))
        }
        other => Err(FrameError::UnknownTag(other)),
    }
}
