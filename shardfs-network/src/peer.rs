//! Connected peers and stream hand-off.
//!
//! A connection carries both control frames and raw object streams. The
//! connection's decode loop owns the read half between units. When it sees a
//! stream marker it announces the stream on the peer's [`StreamGate`] and
//! parks until a consumer has claimed the stream with [`Peer::open_stream`]
//! and handed it back with [`StreamGuard::finish`].
//!
//! A consumer that gives up partway leaves unread stream bytes on the wire,
//! which the decode loop must never see. Dropping an unfinished guard
//! therefore aborts the whole connection.

use crate::deadline::{surface_timeout, Deadline, TimedIo};
use shardfs_core::error::{Result, ShardFsError};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{AcquireError, Mutex, MutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Write half of a peer connection, with per-operation deadlines
pub type PeerWriter = TimedIo<OwnedWriteHalf>;

type PeerReader = BufReader<OwnedReadHalf>;

/// Announce / claim / release handshake between a decode loop and the
/// consumer of a raw stream.
#[derive(Debug)]
pub struct StreamGate {
    announced: Semaphore,
    claimed: Semaphore,
    released: Semaphore,
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamGate {
    pub fn new() -> Self {
        Self {
            announced: Semaphore::new(0),
            claimed: Semaphore::new(0),
            released: Semaphore::new(0),
        }
    }

    /// Decode loop: a stream marker was read
    pub fn announce(&self) {
        self.announced.add_permits(1);
    }

    /// Consumer: wait for an announced stream and take it
    pub async fn claim(&self) -> std::result::Result<(), AcquireError> {
        self.announced.acquire().await?.forget();
        self.claimed.add_permits(1);
        Ok(())
    }

    /// Decode loop: wait until the announced stream has been claimed
    pub async fn wait_claimed(&self) -> std::result::Result<(), AcquireError> {
        self.claimed.acquire().await?.forget();
        Ok(())
    }

    /// Consumer: done with the stream
    pub fn release(&self) {
        self.released.add_permits(1);
    }

    /// Decode loop: wait until the consumer is done
    pub async fn wait_released(&self) -> std::result::Result<(), AcquireError> {
        self.released.acquire().await?.forget();
        Ok(())
    }

    /// Fail every current and future wait; the connection is gone
    pub fn close(&self) {
        self.announced.close();
        self.claimed.close();
        self.released.close();
    }

    pub fn is_closed(&self) -> bool {
        self.announced.is_closed()
    }
}

/// A live connection to another node
pub struct Peer {
    addr: String,
    outbound: bool,
    io_timeout: Duration,
    reader: Mutex<PeerReader>,
    writer: Mutex<PeerWriter>,
    gate: StreamGate,
    aborted: CancellationToken,
}

impl Peer {
    /// Split a connected socket into a peer. Must run inside a tokio runtime.
    pub(crate) fn new(stream: TcpStream, outbound: bool, io_timeout: Duration) -> io::Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            addr,
            outbound,
            io_timeout,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(TimedIo::new(write_half, io_timeout)),
            gate: StreamGate::new(),
            aborted: CancellationToken::new(),
        })
    }

    /// Remote address, also the peer's registry key
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether this side dialed the connection
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Deadline applied to each read and write on this connection
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Write `bytes` to the peer and flush.
    ///
    /// A failed write may have left part of a unit on the wire, so it aborts
    /// the connection.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let result: Result<()> = async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            self.abort();
        }
        result.map_err(|e| surface_timeout(e, &self.addr))
    }

    /// Exclusive access to the write half.
    ///
    /// Hold the guard across a stream marker and its body so no other unit
    /// can interleave with the raw bytes. If writing the body fails partway,
    /// call [`abort`](Self::abort): the remote decode loop is out of step.
    pub async fn lock_writer(&self) -> MutexGuard<'_, PeerWriter> {
        self.writer.lock().await
    }

    /// Read exactly `buf.len()` bytes straight off the connection.
    ///
    /// Only for handshakes, which run before the decode loop starts.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut timed = TimedIo::new(&mut *reader, self.io_timeout);
        timed
            .read_exact(buf)
            .await
            .map_err(|e| surface_timeout(e.into(), &self.addr))?;
        Ok(())
    }

    /// Claim the next raw stream announced on this connection.
    ///
    /// Waits at most `io_timeout` for the announcement. The returned guard
    /// reads the stream bytes; [`StreamGuard::finish`] hands the connection
    /// back to the decode loop.
    ///
    /// The gate does not know which unit a stream answers. A node fetching
    /// from this peer while the peer pushes it a replica can claim the
    /// replica stream instead of the answer and read the IV as a size. The
    /// mismatch then fails the read and the connection is aborted.
    pub async fn open_stream(&self) -> Result<StreamGuard<'_>> {
        match tokio::time::timeout(self.io_timeout, self.gate.claim()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ShardFsError::Network(format!(
                    "peer {} disconnected",
                    self.addr
                )))
            }
            Err(_) => {
                return Err(ShardFsError::Timeout {
                    peer: self.addr.clone(),
                })
            }
        }

        let reader = self.reader.lock().await;
        debug!(peer = %self.addr, "Claimed stream");
        Ok(StreamGuard {
            peer: self,
            reader,
            deadline: Deadline::new(self.io_timeout),
            read: 0,
            finished: false,
        })
    }

    /// Tear the connection down: the gate closes, the decode loop stops and
    /// the peer is deregistered. Used whenever either direction of the wire
    /// has lost unit boundaries.
    pub fn abort(&self) {
        if !self.aborted.is_cancelled() {
            debug!(peer = %self.addr, "Aborting connection");
        }
        self.aborted.cancel();
        self.gate.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    /// Resolves once [`abort`](Self::abort) has been called
    pub(crate) async fn aborted(&self) {
        self.aborted.cancelled().await
    }

    pub(crate) async fn lock_reader(&self) -> MutexGuard<'_, PeerReader> {
        self.reader.lock().await
    }

    pub(crate) fn gate(&self) -> &StreamGate {
        &self.gate
    }

    /// Shut down the write half; the remote side sees end of input
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.addr, error = %e, "Error shutting down connection");
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Exclusive read access to one claimed raw stream.
///
/// Reads are bounded by the peer's I/O deadline. Only
/// [`finish`](Self::finish) resumes the decode loop; dropping the guard any
/// other way aborts the connection.
pub struct StreamGuard<'a> {
    peer: &'a Peer,
    reader: MutexGuard<'a, PeerReader>,
    deadline: Deadline,
    read: u64,
    finished: bool,
}

impl StreamGuard<'_> {
    /// Address of the peer the stream comes from
    pub fn peer_addr(&self) -> &str {
        &self.peer.addr
    }

    /// Hand the connection back to the decode loop.
    ///
    /// `expected` is the full length of the stream unit. If fewer or more
    /// bytes were read, the decode loop would start mid-unit, so the
    /// connection is aborted and a `Protocol` error returned.
    pub fn finish(mut self, expected: u64) -> Result<()> {
        if self.read != expected {
            return Err(ShardFsError::Protocol(format!(
                "stream from {} stopped after {} of {} bytes",
                self.peer.addr, self.read, expected
            )));
        }
        self.finished = true;
        Ok(())
    }
}

impl AsyncRead for StreamGuard<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let res = Pin::new(&mut *this.reader).poll_read(cx, buf);
        let res = this.deadline.poll_io(cx, res);
        if let Poll::Ready(Ok(())) = res {
            this.read += (buf.filled().len() - before) as u64;
        }
        res
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            self.peer.gate.release();
            debug!(peer = %self.peer.addr, bytes = self.read, "Released stream");
        } else {
            warn!(peer = %self.peer.addr, bytes = self.read, "Stream abandoned midway, dropping connection");
            self.peer.abort();
        }
    }
}
