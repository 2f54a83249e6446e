//! TCP transport: accepts and dials connections, runs the handshake, and
//! decodes each connection's units into a shared inbound channel.

use crate::frame::{read_frame, Frame, FrameError};
use crate::handshake::{Handshake, NopHandshake};
use crate::peer::Peer;
use parking_lot::Mutex;
use shardfs_core::error::{Result, ShardFsError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called once a connection has passed its handshake; an error drops it
pub type PeerHook = Arc<dyn Fn(Arc<Peer>) -> Result<()> + Send + Sync>;

/// Called once when an established connection ends
pub type DisconnectHook = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to listen on, e.g. "0.0.0.0:3000"
    pub listen_addr: String,
    /// Deadline for establishing an outbound connection
    pub dial_timeout: Duration,
    /// How long an announced stream may wait to be claimed, and how long a
    /// single read or write may stall
    pub stream_timeout: Duration,
    /// Capacity of the inbound control frame channel
    pub inbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            dial_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(30),
            inbound_buffer: 1024,
        }
    }
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }
}

/// Connection lifecycle callbacks
#[derive(Clone)]
pub struct TransportHooks {
    pub handshake: Arc<dyn Handshake>,
    pub on_peer: Option<PeerHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

impl Default for TransportHooks {
    fn default() -> Self {
        Self {
            handshake: Arc::new(NopHandshake),
            on_peer: None,
            on_disconnect: None,
        }
    }
}

impl TransportHooks {
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = handshake;
        self
    }
}

struct Shared {
    config: TransportConfig,
    hooks: TransportHooks,
    inbound_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

/// TCP transport
pub struct TcpTransport {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig, hooks: TransportHooks) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                hooks,
                inbound_tx,
                shutdown: CancellationToken::new(),
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the listener and start accepting in the background
    pub async fn listen_and_accept(&self) -> Result<SocketAddr> {
        let listen_addr = &self.shared.config.listen_addr;
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            ShardFsError::Network(format!("Failed to listen on {}: {}", listen_addr, e))
        })?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        info!(addr = %addr, "Transport listening");
        tokio::spawn(self.shared.clone().accept_loop(listener));
        Ok(addr)
    }

    /// Connect to `addr` and run the connection in the background.
    ///
    /// Returns once the TCP connection is up; the handshake runs afterwards.
    pub async fn dial(&self, addr: &str) -> Result<()> {
        let stream = tokio::time::timeout(self.shared.config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShardFsError::Timeout {
                peer: addr.to_string(),
            })?
            .map_err(|e| ShardFsError::Network(format!("Failed to dial {}: {}", addr, e)))?;

        debug!(peer = %addr, "Dialed peer");
        tokio::spawn(self.shared.clone().handle_conn(stream, true));
        Ok(())
    }

    /// Take the inbound control frame channel. Only the first call gets it.
    pub fn consume(&self) -> Option<mpsc::Receiver<Frame>> {
        self.inbound_rx.lock().take()
    }

    /// Stop accepting and end every connection loop
    pub fn close(&self) {
        info!("Closing transport");
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Accept loop stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(peer = %remote, "Accepted connection");
                        tokio::spawn(self.clone().handle_conn(stream, false));
                    }
                    Err(e) => warn!(error = %e, "TCP accept error"),
                },
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let peer = match Peer::new(stream, outbound, self.config.stream_timeout) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                warn!(error = %e, "Dropping connection without a peer address");
                return;
            }
        };

        let handshake = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = self.hooks.handshake.handshake(&peer) => result,
        };
        if let Err(e) = handshake {
            warn!(peer = %peer.addr(), error = %e, "Handshake failed, dropping connection");
            peer.close().await;
            return;
        }

        if let Some(on_peer) = &self.hooks.on_peer {
            if let Err(e) = on_peer(peer.clone()) {
                warn!(peer = %peer.addr(), error = %e, "Peer rejected, dropping connection");
                peer.close().await;
                return;
            }
        }

        match self.read_loop(&peer).await {
            Ok(()) => info!(peer = %peer.addr(), "Peer disconnected"),
            Err(e) => warn!(peer = %peer.addr(), error = %e, "Dropping peer connection"),
        }

        peer.abort();
        if let Some(on_disconnect) = &self.hooks.on_disconnect {
            on_disconnect(&peer);
        }
        peer.close().await;
    }

    /// Decode units until the connection ends or the transport closes
    async fn read_loop(&self, peer: &Peer) -> Result<()> {
        loop {
            let next = {
                let mut reader = peer.lock_reader().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    _ = peer.aborted() => return Err(aborted_error(peer)),
                    frame = read_frame(&mut *reader) => frame,
                }
            };

            let mut frame = match next {
                Ok(frame) => frame,
                Err(FrameError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if frame.is_stream {
                self.hand_off_stream(peer).await?;
                if self.shutdown.is_cancelled() {
                    return Ok(());
                }
                continue;
            }

            frame.from = peer.addr().to_string();
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = peer.aborted() => return Err(aborted_error(peer)),
                sent = self.inbound_tx.send(frame) => {
                    if sent.is_err() {
                        debug!("Inbound channel closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Park the decode loop while a consumer reads the announced stream.
    ///
    /// Only a consumer that read the whole unit resumes decoding; one that
    /// gave up closes the gate and the connection is dropped.
    async fn hand_off_stream(&self, peer: &Peer) -> Result<()> {
        let gate = peer.gate();
        debug!(peer = %peer.addr(), "Stream announced, pausing decode loop");
        gate.announce();

        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            claimed = tokio::time::timeout(self.config.stream_timeout, gate.wait_claimed()) => {
                match claimed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return Err(ShardFsError::Network("stream gate closed".to_string()))
                    }
                    Err(_) => {
                        return Err(ShardFsError::Timeout {
                            peer: peer.addr().to_string(),
                        })
                    }
                }
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            released = gate.wait_released() => match released {
                Ok(()) => {
                    debug!(peer = %peer.addr(), "Stream released, resuming decode loop");
                    Ok(())
                }
                Err(_) => Err(ShardFsError::Network(format!(
                    "stream from {} was not read to the end",
                    peer.addr()
                ))),
            },
        }
    }
}

fn aborted_error(peer: &Peer) -> ShardFsError {
    ShardFsError::Network(format!("connection to {} aborted", peer.addr()))
}
