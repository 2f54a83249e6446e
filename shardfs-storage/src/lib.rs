//! shardfs Storage Backend
//!
//! Provides the node-local half of shardfs:
//! - `KeyPath` and pluggable key -> path transforms (`sharded_path`, `flat_path`)
//! - `DiskStore`, a filesystem object store with per-tenant namespaces

pub mod disk;
pub mod path;

pub use disk::DiskStore;
pub use path::{flat_path, sharded_path, KeyPath, PathTransform};

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory every tenant namespace lives under
    pub root: std::path::PathBuf,

    /// Key -> on-disk path function
    pub path_transform: PathTransform,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: std::path::PathBuf::from("./shardfs_data"),
            path_transform: sharded_path,
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given root
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the key -> path function
    pub fn with_path_transform(mut self, transform: PathTransform) -> Self {
        self.path_transform = transform;
        self
    }
}
