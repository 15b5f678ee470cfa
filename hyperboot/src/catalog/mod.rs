//! Resource catalog client.
//!
//! Reads flavors and image metadata, and owns the network address pool
//! invariant: an address is handed to at most one live instance. Every call
//! runs in its own scoped transaction (commit on success, rollback on drop).
//!
//! The schema is owned elsewhere. [`Catalog::open`] only checks that the
//! columns this crate reads and writes are present.

mod records;
mod resources;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};

use crate::errors::{ProvisionError, ProvisionResult};

pub use records::{Flavor, ImageMetadata, Instance, InstanceState, NetworkAddress};

#[cfg(test)]
pub(crate) use schema::test_fixtures;

/// Helper macro to convert rusqlite errors to ProvisionError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err($crate::catalog::sqlite_error)
    };
}

pub(crate) use db_err;

/// Lock contention surfaces as a transient failure; everything else is a
/// catalog fault.
pub(crate) fn sqlite_error(e: rusqlite::Error) -> ProvisionError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            ProvisionError::TransientStoreError(format!("catalog busy: {}", e))
        }
        other => ProvisionError::Catalog(other.to_string()),
    }
}

/// Handle to the relational catalog.
///
/// Opened once at process start and shared by reference (cheap `Clone`).
/// The connection closes when the last clone is dropped. Thread-safe via
/// `parking_lot::Mutex`; callers on an async runtime should invoke it from
/// `spawn_blocking`.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    lock_timeout: Duration,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("path", &self.path).finish()
    }
}

impl Catalog {
    /// Open an existing catalog and validate its schema.
    ///
    /// `busy_timeout` bounds how long a call waits for another writer (in
    /// this or another process) before failing with `TransientStoreError`.
    /// Waiting for the shared connection within this process is bounded by
    /// the same value.
    pub fn open(path: &Path, busy_timeout: Duration) -> ProvisionResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            ProvisionError::Catalog(format!(
                "Failed to open catalog at {}: {}",
                path.display(),
                e
            ))
        })?;

        db_err!(conn.busy_timeout(busy_timeout))?;

        // - WAL mode: readers don't block the allocating writer
        // - FULL sync: a committed reservation survives power loss
        // - Foreign keys: instance.mac_addr must reference a pool row
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            "
        ))?;

        schema::validate(&conn)?;

        tracing::info!(path = %path.display(), "Opened resource catalog");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            lock_timeout: busy_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> ProvisionResult<MutexGuard<'_, Connection>> {
        self.conn.try_lock_for(self.lock_timeout).ok_or_else(|| {
            ProvisionError::TransientStoreError(format!(
                "catalog connection busy for {:?}",
                self.lock_timeout
            ))
        })
    }

    /// Run `f` inside one transaction.
    ///
    /// `Immediate` takes the database write lock up front, which serializes
    /// read-modify-write sequences across processes sharing the file.
    pub(crate) fn with_transaction<T>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Transaction<'_>) -> ProvisionResult<T>,
    ) -> ProvisionResult<T> {
        let mut conn = self.conn()?;
        let tx = db_err!(conn.transaction_with_behavior(behavior))?;
        let value = f(&tx)?;
        db_err!(tx.commit())?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_catalog_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = test_fixtures::create_catalog(temp_dir.path());
        let catalog = Catalog::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(catalog.path(), path.as_path());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = Catalog::open(&temp_dir.path().join("absent.db"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Catalog(_)));
        assert!(!temp_dir.path().join("absent.db").exists());
    }

    #[test]
    fn test_busy_maps_to_transient() {
        let err = sqlite_error(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_connection_wait_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let path = test_fixtures::create_catalog(temp_dir.path());
        let catalog = Catalog::open(&path, Duration::from_millis(100)).unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = {
            let catalog = catalog.clone();
            std::thread::spawn(move || {
                catalog.with_transaction(TransactionBehavior::Deferred, |_| {
                    held_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(())
                })
            })
        };
        held_rx.recv().unwrap();

        let err = catalog.get_flavor(1).unwrap_err();
        assert!(matches!(err, ProvisionError::TransientStoreError(_)));
        assert!(err.is_retriable());

        holder.join().unwrap().unwrap();
        assert_eq!(catalog.get_flavor(1).unwrap().id, 1);
    }
}
