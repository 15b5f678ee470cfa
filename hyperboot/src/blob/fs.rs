//! Directory-backed blob store.
//!
//! Objects are plain files named by their key directly under the store root.
//! Uploading is done by external tooling; this side only reads.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::BlobStore;
use crate::errors::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the object stored under `key`.
    ///
    /// Keys are opaque but must name a single file below the root.
    pub fn object_path(&self, key: &str) -> ProvisionResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(ProvisionError::InvalidArgument(format!(
                "invalid blob key: {:?}",
                key
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch(
        &self,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ProvisionResult<u64> {
        let path = self.object_path(key)?;

        let mut object = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProvisionError::ObjectNotFound(key.to_string()));
            }
            Err(e) => {
                return Err(ProvisionError::TransientStoreError(format!(
                    "Failed to open object {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let copied = tokio::io::copy(&mut object, dest).await.map_err(|e| {
            ProvisionError::TransientStoreError(format!("Failed to read object {}: {}", key, e))
        })?;

        tracing::trace!(key = %key, bytes = copied, "Fetched object");
        Ok(copied)
    }
}
