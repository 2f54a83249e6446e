//! I/O deadlines for peer connections.
//!
//! A deadline bounds how long a single read or write may sit without making
//! progress, so a stalled peer fails the transfer instead of hanging it. Long
//! transfers that keep moving are never cut off.

use shardfs_core::error::ShardFsError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Turn an expired I/O deadline into [`ShardFsError::Timeout`] for `peer`
pub fn surface_timeout(err: ShardFsError, peer: &str) -> ShardFsError {
    match err {
        ShardFsError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ShardFsError::Timeout {
            peer: peer.to_string(),
        },
        other => other,
    }
}

/// Idle timer shared by the read and write halves of [`TimedIo`]
pub(crate) struct Deadline {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Deadline {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            armed: false,
        }
    }

    /// Pass a ready result through; on `Pending`, arm the timer and fail
    /// with `TimedOut` once it fires.
    pub(crate) fn poll_io<T>(
        &mut self,
        cx: &mut Context<'_>,
        res: Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match res {
            Poll::Ready(r) => {
                self.armed = false;
                Poll::Ready(r)
            }
            Poll::Pending => {
                if !self.armed {
                    self.sleep.as_mut().reset(Instant::now() + self.timeout);
                    self.armed = true;
                }
                match self.sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        self.armed = false;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer I/O deadline exceeded",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

/// Reader/writer wrapper applying an idle deadline to every operation
pub struct TimedIo<S> {
    inner: S,
    read: Deadline,
    write: Deadline,
}

impl<S> TimedIo<S> {
    /// Must be called from within a tokio runtime
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            read: Deadline::new(timeout),
            write: Deadline::new(timeout),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.read.poll_io(cx, res)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedIo<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.write.poll_io(cx, res)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_flush(cx);
        this.write.poll_io(cx, res)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.write.poll_io(cx, res)
    }
}
