//! shardfs Network Layer
//!
//! Peer-to-peer TCP transport for shardfs nodes. A single connection carries
//! two kinds of traffic:
//! - **Control frames**: small bincode-encoded [`Message`]s, decoded by the
//!   connection's loop and delivered on one shared inbound channel
//! - **Raw streams**: object bodies of arbitrary size, handed directly to
//!   whoever claims them with [`Peer::open_stream`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      TcpTransport                         │
//! │                                                           │
//! │  accept loop ──┐                  ┌── dial(addr)          │
//! │                ▼                  ▼                       │
//! │          ┌─────────────────────────────┐                  │
//! │          │ per connection:             │                  │
//! │          │  handshake → on_peer        │──► PeerRegistry  │
//! │          │  decode loop                │                  │
//! │          │   0x01 → inbound channel    │──► consume()     │
//! │          │   0x02 → StreamGate ⇄ guard │──► open_stream() │
//! │          │  on_disconnect              │──► PeerRegistry  │
//! │          └─────────────────────────────┘                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shardfs_network::{PeerRegistry, TcpTransport, TransportConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(PeerRegistry::new());
//! let transport = TcpTransport::new(
//!     TransportConfig::new("127.0.0.1:3000"),
//!     registry.transport_hooks(),
//! );
//! transport.listen_and_accept().await?;
//! let mut inbound = transport.consume().expect("inbound channel");
//! while let Some(frame) = inbound.recv().await {
//!     // ...
//! }
//! ```

pub mod deadline;
pub mod frame;
pub mod handshake;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-exports
pub use deadline::{surface_timeout, TimedIo};
pub use frame::{Frame, FrameError, MAX_MESSAGE_LEN, MESSAGE_TAG, STREAM_TAG};
pub use handshake::{Handshake, NopHandshake, VersionHandshake};
pub use peer::{Peer, PeerWriter, StreamGate, StreamGuard};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use registry::PeerRegistry;
pub use transport::{DisconnectHook, PeerHook, TcpTransport, TransportConfig, TransportHooks};
