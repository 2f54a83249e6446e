//! Connection handshakes.
//!
//! A handshake runs once per connection, right after it is established and
//! before any frame is decoded. Failing it drops the connection.

use crate::peer::Peer;
use crate::protocol::PROTOCOL_VERSION;
use shardfs_core::error::{Result, ShardFsError};
use std::future::Future;
use std::pin::Pin;

/// Handshake run on every new connection
pub trait Handshake: Send + Sync {
    fn handshake<'a>(
        &'a self,
        peer: &'a Peer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Accept every connection as is
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

impl Handshake for NopHandshake {
    fn handshake<'a>(
        &'a self,
        _peer: &'a Peer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Both sides send one version byte and require the other's to match
#[derive(Debug, Clone, Copy)]
pub struct VersionHandshake {
    version: u8,
}

impl VersionHandshake {
    pub fn new(version: u8) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

impl Handshake for VersionHandshake {
    fn handshake<'a>(
        &'a self,
        peer: &'a Peer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            peer.send(&[self.version]).await?;

            let mut theirs = [0u8; 1];
            peer.recv_exact(&mut theirs).await?;
            if theirs[0] != self.version {
                return Err(ShardFsError::Handshake(format!(
                    "{} speaks protocol version {}, expected {}",
                    peer.addr(),
                    theirs[0],
                    self.version
                )));
            }
            Ok(())
        })
    }
}
