//! Error types shared by every hyperboot component.
//!
//! `ProvisionError` carries the failure taxonomy of a single component call.
//! `BootError` wraps the first failure of a `boot` run together with the step
//! it happened in and any compensation that could not be completed.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::provision::BootStep;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} matched {count} rows, expected exactly one")]
    AmbiguousResult {
        entity: &'static str,
        id: String,
        count: usize,
    },

    #[error("no free network address left in the pool")]
    ResourcePoolExhausted,

    #[error("object {0} not found in blob store")]
    ObjectNotFound(String),

    #[error("transient store error: {0}")]
    TransientStoreError(String),

    #[error("domain template is malformed: {0}")]
    TemplateMalformed(String),

    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    #[error("hypervisor rejected domain definition: {0}")]
    DomainDefinitionRejected(String),

    #[error("workspace path exists and is not a directory: {}", .0.display())]
    WorkspaceConflict(PathBuf),

    #[error("instance {0} is already booting or running")]
    InstanceBusy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("catalog schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy, independent of the payload a variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AmbiguousResult,
    ResourcePoolExhausted,
    ObjectNotFound,
    TransientStoreError,
    TemplateMalformed,
    HypervisorUnavailable,
    DomainDefinitionRejected,
    WorkspaceConflict,
    InstanceBusy,
    InvalidArgument,
    SchemaMismatch,
    Catalog,
    Internal,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::NotFound { .. } => ErrorKind::NotFound,
            ProvisionError::AmbiguousResult { .. } => ErrorKind::AmbiguousResult,
            ProvisionError::ResourcePoolExhausted => ErrorKind::ResourcePoolExhausted,
            ProvisionError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            ProvisionError::TransientStoreError(_) => ErrorKind::TransientStoreError,
            ProvisionError::TemplateMalformed(_) => ErrorKind::TemplateMalformed,
            ProvisionError::HypervisorUnavailable(_) => ErrorKind::HypervisorUnavailable,
            ProvisionError::DomainDefinitionRejected(_) => ErrorKind::DomainDefinitionRejected,
            ProvisionError::WorkspaceConflict(_) => ErrorKind::WorkspaceConflict,
            ProvisionError::InstanceBusy(_) => ErrorKind::InstanceBusy,
            ProvisionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ProvisionError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            ProvisionError::Catalog(_) => ErrorKind::Catalog,
            ProvisionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same call may succeed later without operator action.
    ///
    /// Pool exhaustion is retriable once capacity frees up; nothing here
    /// retries on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientStoreError
                | ErrorKind::HypervisorUnavailable
                | ErrorKind::ResourcePoolExhausted
        )
    }
}

/// Failure of a local filesystem operation on `path`.
///
/// Workspace writes are not blob store traffic and never retriable.
pub(crate) fn local_io(action: &str, path: &Path, e: std::io::Error) -> ProvisionError {
    ProvisionError::Internal(format!("Failed to {} {}: {}", action, path.display(), e))
}

/// A compensating action that did not complete after a failed boot.
///
/// Each variant leaves something an operator has to reconcile by hand.
#[derive(Debug)]
pub enum CompensationFailure {
    /// The address stays marked non-free with no instance bound to it.
    LeakedReservation {
        address_id: i64,
        address: String,
        error: ProvisionError,
    },
    /// The domain may still be running with no catalog record. `domain_id`
    /// is unknown when the start itself did not report back.
    OrphanedDomain {
        domain_name: String,
        domain_id: Option<String>,
        error: ProvisionError,
    },
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensationFailure::LeakedReservation {
                address_id,
                address,
                error,
            } => write!(
                f,
                "leaked reservation of address {} (id {}): {}",
                address, address_id, error
            ),
            CompensationFailure::OrphanedDomain {
                domain_name,
                domain_id,
                error,
            } => write!(
                f,
                "orphaned domain {} ({}): {}",
                domain_name,
                domain_id.as_deref().unwrap_or("id unknown"),
                error
            ),
        }
    }
}

/// First failure of a `boot` run.
#[derive(Debug, Error)]
pub struct BootError {
    pub instance_name: String,
    pub step: BootStep,
    #[source]
    pub source: ProvisionError,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl BootError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// True when the failed boot left state behind that needs manual cleanup.
    pub fn needs_reconciliation(&self) -> bool {
        !self.compensation_failures.is_empty()
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "boot of {} failed at {}: {}",
            self.instance_name, self.step, self.source
        )?;
        for failure in &self.compensation_failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}
