//! Key to on-disk path derivation
//!
//! An object key is hashed with SHA-1 and the hex digest is cut into
//! fixed-width segments that become nested directories:
//!
//! ```text
//! "randomKey" -> 1d7db/dcda1/992ee/24e72/32d2f/cbe8d/49f28/ca22c/1d7dbdcda1992ee24e7232d2fcbe8d49f28ca22c
//! ```

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Width of each directory segment in a sharded path
pub const SEGMENT_LEN: usize = 5;

/// Pluggable key -> path function
pub type PathTransform = fn(&str) -> KeyPath;

/// Location of an object relative to a storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    /// File name of the object
    pub leaf: String,
    /// `/`-separated directories between the root and the file
    pub relative: String,
}

impl KeyPath {
    fn segments(&self) -> impl Iterator<Item = &str> {
        self.relative.split('/').filter(|s| !s.is_empty())
    }

    /// Directory holding the object: `root/relative`
    pub fn dir_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.segments());
        path
    }

    /// Object file: `root/relative/leaf`
    pub fn full_path(&self, root: &Path) -> PathBuf {
        self.dir_path(root).join(&self.leaf)
    }

    /// First directory under `root` on the way to the object.
    ///
    /// Removing this path removes the object together with every other key
    /// that shares the same first segment.
    pub fn root_path(&self, root: &Path) -> PathBuf {
        match self.segments().next() {
            Some(first) => root.join(first),
            None => root.join(&self.leaf),
        }
    }
}

/// SHA-1 the key and split the hex digest into `SEGMENT_LEN` directories
pub fn sharded_path(key: &str) -> KeyPath {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let relative = (0..hash.len() / SEGMENT_LEN)
        .map(|i| &hash[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN])
        .collect::<Vec<_>>()
        .join("/");

    KeyPath {
        leaf: hash,
        relative,
    }
}

/// Store the key as a file directly under the root, without sharding
pub fn flat_path(key: &str) -> KeyPath {
    KeyPath {
        leaf: key.to_string(),
        relative: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharded_path() {
        let key_path = sharded_path("randomKey");

        assert_eq!(key_path.leaf, "1d7dbdcda1992ee24e7232d2fcbe8d49f28ca22c");
        assert_eq!(
            key_path.relative,
            "1d7db/dcda1/992ee/24e72/32d2f/cbe8d/49f28/ca22c"
        );
    }

    #[test]
    fn test_sharded_path_is_deterministic() {
        assert_eq!(sharded_path("some key"), sharded_path("some key"));
        assert_ne!(sharded_path("some key"), sharded_path("other key"));
    }

    #[test]
    fn test_derived_paths() {
        let root = Path::new("/srv/store/tenant");
        let key_path = sharded_path("randomKey");

        assert_eq!(
            key_path.dir_path(root),
            PathBuf::from("/srv/store/tenant/1d7db/dcda1/992ee/24e72/32d2f/cbe8d/49f28/ca22c")
        );
        assert_eq!(
            key_path.full_path(root),
            PathBuf::from(
                "/srv/store/tenant/1d7db/dcda1/992ee/24e72/32d2f/cbe8d/49f28/ca22c/1d7dbdcda1992ee24e7232d2fcbe8d49f28ca22c"
            )
        );
        assert_eq!(
            key_path.root_path(root),
            PathBuf::from("/srv/store/tenant/1d7db")
        );
    }

    #[test]
    fn test_root_path_prefixes_full_path() {
        let root = Path::new("data");
        for key in ["a", "cool.txt", "randomKey", "photos/2024/beach.jpg"] {
            let key_path = sharded_path(key);
            assert!(key_path.full_path(root).starts_with(key_path.root_path(root)));
            assert!(key_path.full_path(root).starts_with(key_path.dir_path(root)));
        }
    }

    #[test]
    fn test_flat_path() {
        let root = Path::new("data");
        let key_path = flat_path("abc");
        assert_eq!(key_path.dir_path(root), PathBuf::from("data"));
        assert_eq!(key_path.full_path(root), PathBuf::from("data/abc"));
        assert_eq!(key_path.root_path(root), PathBuf::from("data/abc"));
    }
}
