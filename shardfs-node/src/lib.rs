//! shardfs Node Library
//!
//! Provides the components of a shardfs storage node:
//! - Configuration management
//! - `FileServer`, the replication orchestrator tying the local store to the
//!   peer transport

pub mod config;
pub mod server;

pub use config::{
    ConfigError, NetworkSettings, NodeConfig, NodeIdentity, SecuritySettings, StorageSettings,
};
pub use server::{FileServer, FileServerOpts, NodeSettings};
