//! File server: turns local store/get/delete calls into network-wide
//! operations.
//!
//! Own objects are kept as plaintext under this node's id. Replicas pushed by
//! other nodes are kept exactly as received (IV-prefixed ciphertext) under the
//! sender's id. Every object is stored under the MD5 hash of its key, so a
//! peer can locate it from a control message alone.

use crate::config::{ConfigError, NodeConfig};
use shardfs_core::crypto::{copy_encrypt, generate_id, hash_key, EncryptionKey, IV_SIZE};
use shardfs_core::error::{Result, ShardFsError};
use shardfs_network::{
    surface_timeout, Frame, Handshake, Message, Peer, PeerRegistry, TcpTransport,
    TransportConfig, VersionHandshake, STREAM_TAG,
};
use shardfs_storage::{DiskStore, StorageConfig};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable identity and secret of a node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: String,
    pub encryption_key: EncryptionKey,
}

impl NodeSettings {
    pub fn new(node_id: impl Into<String>, encryption_key: EncryptionKey) -> Self {
        Self {
            node_id: node_id.into(),
            encryption_key,
        }
    }

    /// Random id, random key
    pub fn generate() -> Self {
        Self::new(generate_id(), EncryptionKey::generate())
    }
}

/// Everything needed to build a [`FileServer`]
pub struct FileServerOpts {
    pub settings: NodeSettings,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    /// Peers dialed by [`FileServer::bind`]; empty entries are skipped
    pub bootstrap_nodes: Vec<String>,
    /// Connection handshake; none accepts every connection
    pub handshake: Option<Arc<dyn Handshake>>,
}

impl FileServerOpts {
    pub fn new(settings: NodeSettings, storage: StorageConfig, transport: TransportConfig) -> Self {
        Self {
            settings,
            storage,
            transport,
            bootstrap_nodes: Vec::new(),
            handshake: None,
        }
    }

    pub fn with_bootstrap_nodes(mut self, nodes: Vec<String>) -> Self {
        self.bootstrap_nodes = nodes;
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Daemon options: configured identity and key, version handshake
    pub fn from_config(config: &NodeConfig) -> std::result::Result<Self, ConfigError> {
        let settings = NodeSettings::new(config.node.id.clone(), config.security.key()?);
        Ok(Self::new(
            settings,
            config.storage.to_storage_config(),
            config.network.to_transport_config(),
        )
        .with_bootstrap_nodes(config.network.bootstrap_peers.clone())
        .with_handshake(Arc::new(VersionHandshake::default())))
    }
}

/// Replication orchestrator for one node
pub struct FileServer {
    settings: NodeSettings,
    store: DiskStore,
    peers: Arc<PeerRegistry>,
    transport: Arc<TcpTransport>,
    bootstrap_nodes: Vec<String>,
    /// Held while this node writes a stream marker and its body, so two of
    /// its own streams never interleave on a connection
    outbound_streams: Mutex<()>,
    quit: CancellationToken,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let peers = Arc::new(PeerRegistry::new());
        let mut hooks = peers.transport_hooks();
        if let Some(handshake) = opts.handshake {
            hooks = hooks.with_handshake(handshake);
        }

        info!(node_id = %opts.settings.node_id, "Creating file server");
        Self {
            settings: opts.settings,
            store: DiskStore::new(opts.storage),
            peers,
            transport: Arc::new(TcpTransport::new(opts.transport, hooks)),
            bootstrap_nodes: opts.bootstrap_nodes,
            outbound_streams: Mutex::new(()),
            quit: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Local object store
    pub fn storage(&self) -> &DiskStore {
        &self.store
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Bound listen address, once [`bind`](Self::bind) has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Start listening and dial the bootstrap nodes in the background
    pub async fn bind(&self) -> Result<SocketAddr> {
        let addr = self.transport.listen_and_accept().await?;
        self.bootstrap_network();
        Ok(addr)
    }

    fn bootstrap_network(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.dial(&addr).await {
                    warn!(peer = %addr, error = %e, "Failed to dial bootstrap node");
                }
            });
        }
    }

    /// Handle inbound messages until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<()> {
        let mut inbound = self
            .transport
            .consume()
            .ok_or_else(|| ShardFsError::Internal("event loop already started".to_string()))?;

        info!(node_id = %self.settings.node_id, "File server running");
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
            }
        }

        info!(node_id = %self.settings.node_id, "File server stopped");
        self.transport.close();
        Ok(())
    }

    /// [`bind`](Self::bind), then [`run`](Self::run)
    pub async fn start(&self) -> Result<()> {
        self.bind().await?;
        self.run().await
    }

    pub fn stop(&self) {
        self.quit.cancel();
    }

    /// Store `reader` locally and replicate it, encrypted, to every peer
    pub async fn store<R>(&self, key: &str, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let key_hash = hash_key(key);
        let mut tee = TeeReader::new(reader);
        let size = self
            .store
            .write(&self.settings.node_id, &key_hash, &mut tee)
            .await?;
        let plaintext = tee.into_captured();
        info!(key = %key, key_hash = %key_hash, bytes = size, "Stored object locally");

        let _unit = self.outbound_streams.lock().await;
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            debug!(key_hash = %key_hash, "No peers to replicate to");
            return Ok(());
        }

        let msg = Message::StoreFile {
            node_id: self.settings.node_id.clone(),
            key_hash: key_hash.clone(),
            size: size + IV_SIZE as u64,
        };
        self.broadcast_to(&peers, &msg).await?;

        for peer in &peers {
            let sent = match self.stream_encrypted(peer, &plaintext).await {
                Ok(sent) => sent,
                Err(e) => {
                    // The peer is now partway through a stream it will never finish
                    peer.abort();
                    return Err(surface_timeout(e, peer.addr()));
                }
            };
            debug!(peer = %peer.addr(), key_hash = %key_hash, bytes = sent, "Streamed replica");
        }

        info!(key_hash = %key_hash, peers = peers.len(), "Replicated object");
        Ok(())
    }

    async fn stream_encrypted(&self, peer: &Peer, plaintext: &[u8]) -> Result<u64> {
        let mut writer = peer.lock_writer().await;
        writer.write_u8(STREAM_TAG).await?;
        copy_encrypt(&self.settings.encryption_key, plaintext, &mut *writer).await
    }

    /// Open the object for `key`, fetching it from the network if it is not
    /// held locally.
    pub async fn get(&self, key: &str) -> Result<File> {
        let key_hash = hash_key(key);
        let node_id = &self.settings.node_id;

        if self.store.has(node_id, &key_hash).await {
            info!(key = %key, "Serving object from local disk");
            let (_, file) = self.store.read(node_id, &key_hash).await?;
            return Ok(file);
        }

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Err(ShardFsError::NotFound(key.to_string()));
        }

        info!(key = %key, peers = peers.len(), "Object not held locally, fetching from the network");
        let msg = Message::GetFile {
            node_id: node_id.clone(),
            key_hash: key_hash.clone(),
        };
        self.broadcast_to(&peers, &msg).await?;

        let mut delivered = false;
        let mut failures = 0;
        for peer in &peers {
            match self.receive_object(peer, &key_hash, delivered).await {
                Ok(Some(bytes)) => {
                    if !delivered {
                        info!(peer = %peer.addr(), key_hash = %key_hash, bytes, "Received object over the network");
                    }
                    delivered = true;
                }
                Ok(None) => debug!(peer = %peer.addr(), key_hash = %key_hash, "Peer does not hold object"),
                Err(e) => {
                    warn!(peer = %peer.addr(), key_hash = %key_hash, error = %e, "Failed to fetch object from peer");
                    failures += 1;
                }
            }
        }

        if !delivered {
            return Err(if failures == peers.len() {
                ShardFsError::Network(format!("no peer delivered {}", key))
            } else {
                ShardFsError::NotFound(key.to_string())
            });
        }

        let (_, file) = self.store.read(node_id, &key_hash).await?;
        Ok(file)
    }

    /// Read one sized answer from `peer`. Returns `None` for "absent".
    ///
    /// With `drain` set the bytes are read and discarded. Any failure before
    /// the whole answer is read aborts the connection.
    async fn receive_object(&self, peer: &Peer, key_hash: &str, drain: bool) -> Result<Option<u64>> {
        let node_id = &self.settings.node_id;
        let result: Result<Option<u64>> = async {
            let mut stream = peer.open_stream().await?;
            let size = stream.read_u64_le().await?;
            if size == 0 {
                stream.finish(SIZE_HEADER_LEN)?;
                return Ok(None);
            }

            let mut body = (&mut stream).take(size);
            let consumed = if drain {
                tokio::io::copy(&mut body, &mut tokio::io::sink()).await?
            } else {
                self.store
                    .write_decrypt(&self.settings.encryption_key, node_id, key_hash, body)
                    .await?
            };
            if consumed != size {
                return Err(ShardFsError::Protocol(format!(
                    "{} announced {} bytes but sent {}",
                    stream.peer_addr(),
                    size,
                    consumed
                )));
            }
            stream.finish(SIZE_HEADER_LEN + size)?;
            Ok(Some(consumed))
        }
        .await;

        if result.is_err() && !drain {
            // Never leave a partial object where a later get would serve it
            if let Err(e) = tokio::fs::remove_file(self.store.object_path(node_id, key_hash)).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(key_hash = %key_hash, error = %e, "Failed to remove partial object");
                }
            }
        }
        result.map_err(|e| surface_timeout(e, peer.addr()))
    }

    /// Delete the object locally and ask every peer to drop its replica
    pub async fn delete(&self, key: &str) -> Result<()> {
        let key_hash = hash_key(key);
        let node_id = &self.settings.node_id;

        if !self.store.has(node_id, &key_hash).await {
            return Err(ShardFsError::NotFound(key.to_string()));
        }

        self.broadcast(&Message::DeleteFile {
            node_id: node_id.clone(),
            key_hash: key_hash.clone(),
        })
        .await?;
        self.store.delete(node_id, &key_hash).await?;

        info!(key = %key, key_hash = %key_hash, "Deleted object");
        Ok(())
    }

    /// Send `msg` to every connected peer; the first failure aborts
    pub async fn broadcast(&self, msg: &Message) -> Result<()> {
        let peers = self.peers.snapshot();
        self.broadcast_to(&peers, msg).await
    }

    async fn broadcast_to(&self, peers: &[Arc<Peer>], msg: &Message) -> Result<()> {
        let frame = msg.to_frame()?;
        for peer in peers {
            peer.send(&frame).await?;
        }
        debug!(kind = msg.kind(), key_hash = %msg.key_hash(), peers = peers.len(), "Broadcast message");
        Ok(())
    }

    async fn handle_frame(&self, frame: Frame) {
        let msg = match Message::from_bytes(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %frame.from, error = %e, "Dropping undecodable message");
                return;
            }
        };

        debug!(peer = %frame.from, kind = msg.kind(), key_hash = %msg.key_hash(), "Handling message");
        let kind = msg.kind();
        if let Err(e) = self.handle_message(&frame.from, msg).await {
            warn!(peer = %frame.from, kind, error = %e, "Failed to handle message");
        }
    }

    async fn handle_message(&self, from: &str, msg: Message) -> Result<()> {
        match msg {
            Message::StoreFile {
                node_id,
                key_hash,
                size,
            } => self.handle_store_file(from, &node_id, &key_hash, size).await,
            Message::GetFile { node_id, key_hash } => {
                self.handle_get_file(from, &node_id, &key_hash).await
            }
            Message::DeleteFile { node_id, key_hash } => {
                self.handle_delete_file(&node_id, &key_hash).await
            }
        }
    }

    fn peer(&self, addr: &str) -> Result<Arc<Peer>> {
        self.peers
            .get(addr)
            .ok_or_else(|| ShardFsError::PeerNotFound(addr.to_string()))
    }

    async fn handle_store_file(
        &self,
        from: &str,
        node_id: &str,
        key_hash: &str,
        size: u64,
    ) -> Result<()> {
        let peer = self.peer(from)?;
        let result: Result<u64> = async {
            let mut stream = peer.open_stream().await?;
            let written = self
                .store
                .write_exact(node_id, key_hash, (&mut stream).take(size), size)
                .await?;
            stream.finish(size)?;
            Ok(written)
        }
        .await;
        let written = result.map_err(|e| surface_timeout(e, from))?;

        info!(peer = %from, node_id = %node_id, key_hash = %key_hash, bytes = written, "Stored replica");
        Ok(())
    }

    async fn handle_get_file(&self, from: &str, node_id: &str, key_hash: &str) -> Result<()> {
        let peer = self.peer(from)?;

        let (size, source) = if self.store.has(node_id, key_hash).await {
            let (size, file) = self.store.read(node_id, key_hash).await?;
            (size, Some(Outgoing::Stored(file.take(size))))
        } else if self.store.has(&self.settings.node_id, key_hash).await {
            let (plain, file) = self.store.read(&self.settings.node_id, key_hash).await?;
            (plain + IV_SIZE as u64, Some(Outgoing::Encrypt(file.take(plain))))
        } else {
            (0, None)
        };

        let _unit = self.outbound_streams.lock().await;
        let mut writer = peer.lock_writer().await;
        let result: Result<u64> = async {
            writer.write_u8(STREAM_TAG).await?;
            writer.write_u64_le(size).await?;
            let sent = match source {
                Some(Outgoing::Stored(mut file)) => tokio::io::copy(&mut file, &mut *writer).await?,
                Some(Outgoing::Encrypt(file)) => {
                    copy_encrypt(&self.settings.encryption_key, file, &mut *writer).await?
                }
                None => 0,
            };
            writer.flush().await?;
            Ok(sent)
        }
        .await;
        drop(writer);

        let sent = match result {
            Ok(sent) if sent == size => sent,
            Ok(sent) => {
                peer.abort();
                return Err(ShardFsError::Internal(format!(
                    "announced {} bytes for {} but sent {}",
                    size, key_hash, sent
                )));
            }
            Err(e) => {
                peer.abort();
                return Err(surface_timeout(e, from));
            }
        };

        if size == 0 {
            debug!(peer = %from, key_hash = %key_hash, "Answered get for absent object");
        } else {
            info!(peer = %from, key_hash = %key_hash, bytes = sent, "Served object to peer");
        }
        Ok(())
    }

    async fn handle_delete_file(&self, node_id: &str, key_hash: &str) -> Result<()> {
        if !self.store.has(node_id, key_hash).await {
            debug!(node_id = %node_id, key_hash = %key_hash, "No replica to delete");
            return Ok(());
        }

        self.store.delete(node_id, key_hash).await?;
        info!(node_id = %node_id, key_hash = %key_hash, "Deleted replica");
        Ok(())
    }
}

/// Length of the size header that opens every get answer
const SIZE_HEADER_LEN: u64 = std::mem::size_of::<u64>() as u64;

/// Body of a get answer
enum Outgoing {
    /// Replica, already ciphertext
    Stored(tokio::io::Take<File>),
    /// Own plaintext, encrypted while sending
    Encrypt(tokio::io::Take<File>),
}

/// Reader that keeps a copy of everything read through it
struct TeeReader<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_server() -> (FileServer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let opts = FileServerOpts::new(
            NodeSettings::generate(),
            StorageConfig::new(temp_dir.path()),
            TransportConfig::new("127.0.0.1:0"),
        );
        (FileServer::new(opts), temp_dir)
    }

    #[tokio::test]
    async fn test_tee_reader_captures_everything() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut tee = TeeReader::new(data.as_slice());

        let mut out = Vec::new();
        tokio::io::copy(&mut tee, &mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(tee.into_captured(), data);
    }

    #[tokio::test]
    async fn test_store_and_get_without_peers() {
        let (server, _dir) = test_server();

        server.store("photo.jpg", &b"jpeg bytes"[..]).await.unwrap();
        assert!(
            server
                .storage()
                .has(server.node_id(), &hash_key("photo.jpg"))
                .await
        );

        let mut file = server.get("photo.jpg").await.unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_own_objects_are_plaintext_under_hashed_key() {
        let (server, _dir) = test_server();
        server.store("notes.txt", &b"plain"[..]).await.unwrap();

        let path = server
            .storage()
            .object_path(server.node_id(), &hash_key("notes.txt"));
        assert_eq!(std::fs::read(path).unwrap(), b"plain");
    }

    #[tokio::test]
    async fn test_get_missing_without_peers_is_not_found() {
        let (server, _dir) = test_server();
        assert!(matches!(
            server.get("absent").await,
            Err(ShardFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let (server, _dir) = test_server();

        assert!(matches!(
            server.delete("absent").await,
            Err(ShardFsError::NotFound(_))
        ));

        server.store("k", &b"v"[..]).await.unwrap();
        server.delete("k").await.unwrap();
        assert!(!server.storage().has(server.node_id(), &hash_key("k")).await);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);

        let first = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            server.run().await,
            Err(ShardFsError::Internal(_))
        ));

        server.stop();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_store_from_unregistered_sender_is_rejected() {
        let (server, _dir) = test_server();
        let msg = Message::StoreFile {
            node_id: "stranger".to_string(),
            key_hash: "cafe".to_string(),
            size: 16,
        };

        assert!(matches!(
            server.handle_message("10.0.0.9:4000", msg).await,
            Err(ShardFsError::PeerNotFound(_))
        ));
        assert!(!server.storage().has("stranger", "cafe").await);
    }

    #[tokio::test]
    async fn test_get_from_unregistered_sender_is_rejected() {
        let (server, _dir) = test_server();
        server.store("k", &b"v"[..]).await.unwrap();
        let msg = Message::GetFile {
            node_id: "stranger".to_string(),
            key_hash: hash_key("k"),
        };

        assert!(matches!(
            server.handle_message("10.0.0.9:4000", msg).await,
            Err(ShardFsError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_run_returns() {
        let (server, _dir) = test_server();
        server.bind().await.unwrap();
        assert!(server.local_addr().is_some());

        server.stop();
        server.run().await.unwrap();
    }
}
