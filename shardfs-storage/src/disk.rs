//! Filesystem object store
//!
//! Objects live at `{root}/{tenant}/{key path}`, one file per object. There is
//! no index: an object exists exactly when its file exists. Writes land in a
//! staging file next to the object and are renamed into place once complete.

use crate::path::KeyPath;
use crate::StorageConfig;
use shardfs_core::crypto::{copy_decrypt, EncryptionKey};
use shardfs_core::error::{Result, ShardFsError};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Appended to an object's file name while it is being written
const STAGING_SUFFIX: &str = ".partial";

/// An object being written, not yet visible under its final path
struct Staged {
    path: PathBuf,
    staging: PathBuf,
    file: File,
}

/// Content-addressed store rooted at a local directory
#[derive(Debug, Clone)]
pub struct DiskStore {
    config: StorageConfig,
}

impl DiskStore {
    /// Create a store; nothing touches the disk until the first write
    pub fn new(config: StorageConfig) -> Self {
        info!(root = ?config.root, "Opening disk store");
        Self { config }
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn tenant_root(&self, tenant: &str) -> PathBuf {
        if tenant.is_empty() {
            self.config.root.clone()
        } else {
            self.config.root.join(tenant)
        }
    }

    fn key_path(&self, key: &str) -> KeyPath {
        (self.config.path_transform)(key)
    }

    /// Full path of the file holding `key` for `tenant`
    pub fn object_path(&self, tenant: &str, key: &str) -> PathBuf {
        self.key_path(key).full_path(&self.tenant_root(tenant))
    }

    async fn create(&self, tenant: &str, key: &str) -> Result<Staged> {
        let base = self.tenant_root(tenant);
        let key_path = self.key_path(key);

        fs::create_dir_all(key_path.dir_path(&base)).await?;

        let path = key_path.full_path(&base);
        let staging = path.with_file_name(format!("{}{}", key_path.leaf, STAGING_SUFFIX));
        let file = File::create(&staging).await?;
        Ok(Staged {
            path,
            staging,
            file,
        })
    }

    /// Move a fully written object into place, or throw the staging file away
    /// when `copied` failed. A failed write never touches the committed object.
    async fn commit(&self, staged: Staged, copied: Result<u64>) -> Result<u64> {
        let Staged {
            path,
            staging,
            mut file,
        } = staged;

        let outcome = match copied {
            Ok(n) => file.flush().await.map(|()| n).map_err(ShardFsError::from),
            Err(e) => Err(e),
        };
        drop(file);

        let outcome = match outcome {
            Ok(n) => fs::rename(&staging, &path)
                .await
                .map(|()| n)
                .map_err(ShardFsError::from),
            Err(e) => Err(e),
        };

        if outcome.is_err() {
            if let Err(e) = fs::remove_file(&staging).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?staging, error = %e, "Failed to remove staging file");
                }
            }
        }
        outcome
    }

    /// Stream `reader` into the object file, returning the bytes written
    pub async fn write<R>(&self, tenant: &str, key: &str, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.write_staged(tenant, key, reader, None).await
    }

    /// Like [`write`](Self::write), but the object is only committed when
    /// `reader` yields exactly `expected` bytes. Anything else is a
    /// `Protocol` error and leaves a previously stored copy untouched.
    pub async fn write_exact<R>(&self, tenant: &str, key: &str, reader: R, expected: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.write_staged(tenant, key, reader, Some(expected)).await
    }

    async fn write_staged<R>(
        &self,
        tenant: &str,
        key: &str,
        mut reader: R,
        expected: Option<u64>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.create(tenant, key).await?;
        let copied = match tokio::io::copy(&mut reader, &mut staged.file).await {
            Ok(n) if expected.map_or(true, |want| want == n) => Ok(n),
            Ok(n) => Err(ShardFsError::Protocol(format!(
                "{}/{}: expected {} bytes, got {}",
                tenant,
                key,
                expected.unwrap_or_default(),
                n
            ))),
            Err(e) => Err(e.into()),
        };

        let written = self.commit(staged, copied).await?;
        debug!(tenant = %tenant, key = %key, bytes = written, "Wrote object to disk");
        Ok(written)
    }

    /// Stream an IV-prefixed ciphertext from `reader`, storing the plaintext.
    ///
    /// Returns the bytes consumed from `reader` (IV included), which matches
    /// the size the sender announced.
    pub async fn write_decrypt<R>(
        &self,
        cipher_key: &EncryptionKey,
        tenant: &str,
        key: &str,
        reader: R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.create(tenant, key).await?;
        let copied = copy_decrypt(cipher_key, reader, &mut staged.file).await;

        let consumed = self.commit(staged, copied).await?;
        debug!(tenant = %tenant, key = %key, bytes = consumed, "Wrote decrypted object to disk");
        Ok(consumed)
    }

    /// Open an object, returning its size and a readable handle
    pub async fn read(&self, tenant: &str, key: &str) -> Result<(u64, File)> {
        let path = self.object_path(tenant, key);
        let file = File::open(&path)
            .await
            .map_err(|e| ShardFsError::from_io(e, format!("{}/{}", tenant, key)))?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Whether the object file exists
    pub async fn has(&self, tenant: &str, key: &str) -> bool {
        fs::try_exists(self.object_path(tenant, key))
            .await
            .unwrap_or(false)
    }

    /// Remove the object along with the whole shard-root directory it lives under
    pub async fn delete(&self, tenant: &str, key: &str) -> Result<()> {
        let base = self.tenant_root(tenant);
        let key_path = self.key_path(key);
        let not_found = || ShardFsError::NotFound(format!("{}/{}", tenant, key));

        if !fs::try_exists(key_path.full_path(&base)).await? {
            return Err(not_found());
        }

        let shard_root = key_path.root_path(&base);
        let metadata = fs::metadata(&shard_root)
            .await
            .map_err(|e| ShardFsError::from_io(e, format!("{}/{}", tenant, key)))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&shard_root).await?;
        } else {
            fs::remove_file(&shard_root).await?;
        }

        debug!(path = ?shard_root, "Deleted object from disk");
        Ok(())
    }

    /// Remove every object of every tenant
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.config.root).await {
            Ok(()) => {
                info!(root = ?self.config.root, "Cleared disk store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
