//! Integration tests for the TCP transport
//!
//! Two transports on loopback: control delivery, raw stream hand-off,
//! handshakes, and connection teardown.

use shardfs_network::{
    Handshake, Message, PeerRegistry, TcpTransport, TransportConfig, VersionHandshake,
    STREAM_TAG,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;

struct Endpoint {
    transport: TcpTransport,
    registry: Arc<PeerRegistry>,
    addr: String,
}

impl Endpoint {
    async fn start(config: TransportConfig, handshake: Option<Arc<dyn Handshake>>) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        let mut hooks = registry.transport_hooks();
        if let Some(handshake) = handshake {
            hooks = hooks.with_handshake(handshake);
        }
        let transport = TcpTransport::new(config, hooks);
        let addr = transport.listen_and_accept().await.unwrap().to_string();
        Endpoint {
            transport,
            registry,
            addr,
        }
    }

    async fn default() -> Self {
        Self::start(TransportConfig::new("127.0.0.1:0"), None).await
    }
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn connect(a: &Endpoint, b: &Endpoint) {
    b.transport.dial(&a.addr).await.unwrap();
    wait_for("registration", || a.registry.len() == 1 && b.registry.len() == 1).await;
}

fn get_msg(key_hash: &str) -> Message {
    Message::GetFile {
        node_id: "node-b".to_string(),
        key_hash: key_hash.to_string(),
    }
}

#[tokio::test]
async fn test_control_message_delivery() {
    let a = Endpoint::default().await;
    let b = Endpoint::default().await;
    let mut inbound = a.transport.consume().unwrap();
    assert!(a.transport.consume().is_none());

    connect(&a, &b).await;

    let to_a = b.registry.get(&a.addr).unwrap();
    assert!(to_a.is_outbound());
    to_a.send(&get_msg("abc").to_frame().unwrap()).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!frame.is_stream);
    assert_eq!(Message::from_bytes(&frame.payload).unwrap(), get_msg("abc"));

    // `from` is the registry key of the sending connection
    let from_b = a.registry.get(&frame.from).unwrap();
    assert!(!from_b.is_outbound());
}

#[tokio::test]
async fn test_stream_bytes_bypass_decoder() {
    let a = Endpoint::default().await;
    let b = Endpoint::default().await;
    let mut inbound = a.transport.consume().unwrap();
    connect(&a, &b).await;

    // Body full of bytes that would look like frame tags to the decoder
    let body: Vec<u8> = (0..100_000u32)
        .map(|i| [0x01, 0x02, 0xff][i as usize % 3])
        .collect();

    let mut wire = get_msg("before").to_frame().unwrap();
    wire.push(STREAM_TAG);
    wire.extend_from_slice(&body);
    wire.extend(get_msg("after").to_frame().unwrap());

    let to_a = b.registry.get(&a.addr).unwrap();
    let sender = tokio::spawn(async move { to_a.send(&wire).await });

    let first = inbound.recv().await.unwrap();
    assert_eq!(Message::from_bytes(&first.payload).unwrap(), get_msg("before"));

    let from_b = a.registry.get(&first.from).unwrap();
    let mut stream = from_b.open_stream().await.unwrap();
    let mut received = vec![0u8; body.len()];
    stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received, body);
    stream.finish(body.len() as u64).unwrap();

    let second = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Message::from_bytes(&second.payload).unwrap(), get_msg("after"));
    sender.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_deregisters_peer() {
    let a = Endpoint::default().await;
    let b = Endpoint::default().await;
    connect(&a, &b).await;

    b.transport.close();
    assert!(b.transport.is_closed());

    wait_for("a to drop b", || a.registry.is_empty()).await;
    wait_for("b to drop a", || b.registry.is_empty()).await;
}

#[tokio::test]
async fn test_closed_transport_stops_accepting() {
    let a = Endpoint::default().await;
    a.transport.close();
    sleep(Duration::from_millis(100)).await;

    let b = Endpoint::default().await;
    let dialed = b.transport.dial(&a.addr).await;
    sleep(Duration::from_millis(100)).await;
    assert!(dialed.is_err() || b.registry.is_empty());
    assert!(a.registry.is_empty());
}

#[tokio::test]
async fn test_version_handshake_match() {
    let handshake: Arc<dyn Handshake> = Arc::new(VersionHandshake::default());
    let a = Endpoint::start(TransportConfig::new("127.0.0.1:0"), Some(handshake.clone())).await;
    let b = Endpoint::start(TransportConfig::new("127.0.0.1:0"), Some(handshake)).await;

    connect(&a, &b).await;
}

#[tokio::test]
async fn test_version_handshake_mismatch_drops_connection() {
    let a = Endpoint::start(
        TransportConfig::new("127.0.0.1:0"),
        Some(Arc::new(VersionHandshake::new(1))),
    )
    .await;
    let b = Endpoint::start(
        TransportConfig::new("127.0.0.1:0"),
        Some(Arc::new(VersionHandshake::new(2))),
    )
    .await;

    b.transport.dial(&a.addr).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert!(a.registry.is_empty());
    assert!(b.registry.is_empty());
}

#[tokio::test]
async fn test_unclaimed_stream_tears_down_connection() {
    let mut config = TransportConfig::new("127.0.0.1:0");
    config.stream_timeout = Duration::from_millis(200);
    let a = Endpoint::start(config, None).await;
    let b = Endpoint::default().await;
    connect(&a, &b).await;

    let to_a = b.registry.get(&a.addr).unwrap();
    to_a.send(&[STREAM_TAG]).await.unwrap();

    wait_for("a to give up on the stream", || a.registry.is_empty()).await;
    wait_for("b to see the connection end", || b.registry.is_empty()).await;
}

#[tokio::test]
async fn test_abandoned_stream_is_never_decoded() {
    let a = Endpoint::default().await;
    let b = Endpoint::default().await;
    let mut inbound = a.transport.consume().unwrap();
    connect(&a, &b).await;

    // The stream body is itself a valid control frame
    let mut wire = get_msg("before").to_frame().unwrap();
    wire.push(STREAM_TAG);
    wire.extend(get_msg("inside stream").to_frame().unwrap());

    let to_a = b.registry.get(&a.addr).unwrap();
    to_a.send(&wire).await.unwrap();

    let first = inbound.recv().await.unwrap();
    assert_eq!(Message::from_bytes(&first.payload).unwrap(), get_msg("before"));

    // Consumer gives up after two bytes
    let from_b = a.registry.get(&first.from).unwrap();
    {
        let mut stream = from_b.open_stream().await.unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
    }
    assert!(from_b.is_aborted());

    wait_for("a to drop the connection", || a.registry.is_empty()).await;
    wait_for("b to see the connection end", || b.registry.is_empty()).await;
    let leaked = tokio::time::timeout(Duration::from_millis(200), inbound.recv()).await;
    assert!(
        !matches!(leaked, Ok(Some(_))),
        "stream bytes were decoded as a frame"
    );
}

#[tokio::test]
async fn test_unknown_tag_drops_connection() {
    let a = Endpoint::default().await;
    let b = Endpoint::default().await;
    connect(&a, &b).await;

    let to_a = b.registry.get(&a.addr).unwrap();
    to_a.send(&[0x7f, 0x00]).await.unwrap();

    wait_for("a to drop the connection", || a.registry.is_empty()).await;
}

#[tokio::test]
async fn test_dial_unreachable_fails() {
    let b = Endpoint::default().await;
    // Reserve a port, then free it so nothing listens there
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    assert!(b.transport.dial(&addr).await.is_err());
}
