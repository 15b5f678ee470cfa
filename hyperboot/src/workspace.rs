//! Per-instance workspace directories.
//!
//! ```text
//! <projects_root>/
//! └── <instance_name>/
//!     ├── <instance_name>.xml    (domain descriptor)
//!     └── <image_name>.img       (disk image)
//! ```
//!
//! Workspaces are never removed automatically.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::{ProvisionError, ProvisionResult};
use crate::runtime::constants::filenames;

#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
}

impl Workspaces {
    /// Create the projects root if needed and resolve it to an absolute path.
    pub fn new(root: &Path) -> ProvisionResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            ProvisionError::Internal(format!(
                "Failed to create projects root {}: {}",
                root.display(),
                e
            ))
        })?;
        let root = root.canonicalize().map_err(|e| {
            ProvisionError::Internal(format!(
                "Failed to resolve projects root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the workspace of `instance_name`, creating it if absent.
    ///
    /// Idempotent. Fails with `WorkspaceConflict` only when the path exists
    /// as something other than a directory.
    pub fn ensure(&self, instance_name: &str) -> ProvisionResult<PathBuf> {
        validate_path_component("instance name", instance_name)?;
        let path = self.root.join(instance_name);

        match std::fs::create_dir(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Created workspace");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if path.is_dir() {
                    Ok(path)
                } else {
                    Err(ProvisionError::WorkspaceConflict(path))
                }
            }
            Err(e) => Err(ProvisionError::Internal(format!(
                "Failed to create workspace {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn descriptor_path(&self, instance_name: &str) -> PathBuf {
        filenames::descriptor_path(&self.root.join(instance_name), instance_name)
    }

    /// Image names come from the catalog and are checked like instance names.
    pub fn disk_image_path(&self, instance_name: &str, image_name: &str) -> ProvisionResult<PathBuf> {
        validate_path_component("image name", image_name)?;
        Ok(filenames::disk_image_path(
            &self.root.join(instance_name),
            image_name,
        ))
    }
}

/// Names that become a single directory or file name.
fn validate_path_component(what: &str, name: &str) -> ProvisionResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidArgument(format!(
            "invalid {}: {:?}",
            what, name
        )))
    }
}
