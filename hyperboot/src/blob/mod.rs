//! Blob store client for disk images.
//!
//! A [`BlobStore`] resolves an opaque key to an immutable object and copies it
//! into a writer. [`materialize`] is the pipeline's entry point: it streams an
//! object into a file, makes it durable, and reports its digest.

mod digest;
mod fs;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::{ProvisionError, ProvisionResult, local_io};

pub use digest::DigestWriter;
pub use fs::FsBlobStore;

/// Key-value object store holding disk images.
///
/// Implementations hold no per-call state.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy the full object stored under `key` into `dest`.
    ///
    /// # Errors
    ///
    /// - `ObjectNotFound` if `key` is absent
    /// - `TransientStoreError` on connectivity or I/O failure
    async fn fetch(
        &self,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ProvisionResult<u64>;
}

/// Result of writing an object to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReceipt {
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the written bytes.
    pub sha256: String,
}

/// Fetch `key` into `dest_path`, bounded by `deadline`.
///
/// Bytes land in `<dest_path>.partial` first and are renamed into place only
/// after an fsync, so a reader never sees a truncated image under the final
/// name. Exceeding the deadline surfaces as `TransientStoreError`.
pub async fn materialize(
    store: &dyn BlobStore,
    key: &str,
    dest_path: &Path,
    deadline: Duration,
) -> ProvisionResult<BlobReceipt> {
    let partial = partial_path(dest_path);

    let result = tokio::time::timeout(deadline, write_partial(store, key, &partial))
        .await
        .unwrap_or_else(|_| {
            Err(ProvisionError::TransientStoreError(format!(
                "fetching {} exceeded {:?}",
                key, deadline
            )))
        });

    let (bytes, sha256) = match result {
        Ok(done) => done,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };

    tokio::fs::rename(&partial, dest_path)
        .await
        .map_err(|e| local_io("rename into place", dest_path, e))?;

    tracing::debug!(
        key = %key,
        path = %dest_path.display(),
        bytes,
        sha256 = %sha256,
        "Materialized blob"
    );

    Ok(BlobReceipt {
        path: dest_path.to_path_buf(),
        bytes,
        sha256,
    })
}

async fn write_partial(
    store: &dyn BlobStore,
    key: &str,
    partial: &Path,
) -> ProvisionResult<(u64, String)> {
    let file = tokio::fs::File::create(partial)
        .await
        .map_err(|e| local_io("create", partial, e))?;
    let mut writer = DigestWriter::new(file);

    store.fetch(key, &mut writer).await?;
    writer
        .flush()
        .await
        .map_err(|e| local_io("flush", partial, e))?;

    let (file, bytes, sha256) = writer.finish();
    file.sync_all()
        .await
        .map_err(|e| local_io("sync", partial, e))?;
    Ok((bytes, sha256))
}

fn partial_path(dest_path: &Path) -> PathBuf {
    let mut name = dest_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
