//! Configuration for a provisioner instance.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ProvisionError, ProvisionResult};
use crate::runtime::constants::{defaults, envs};

/// Options used to construct a [`Provisioner`](crate::Provisioner).
///
/// Only `home_dir` is required; every other path defaults to a location
/// under it (see [`FilesystemLayout`](crate::runtime::layout::FilesystemLayout)).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerOptions {
    /// Root for logs and every defaulted path. Must be absolute.
    pub home_dir: PathBuf,
    /// Directory holding one workspace per instance.
    pub projects_root: Option<PathBuf>,
    /// SQLite catalog file.
    pub catalog_path: Option<PathBuf>,
    /// Root of the directory-backed blob store.
    pub blob_store_root: Option<PathBuf>,
    /// Domain descriptor template.
    pub descriptor_template: Option<PathBuf>,
    /// libvirt connection URI handed to `virsh -c`.
    pub hypervisor_uri: String,
    pub timeouts: Timeouts,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            projects_root: None,
            catalog_path: None,
            blob_store_root: None,
            descriptor_template: None,
            hypervisor_uri: defaults::HYPERVISOR_URI.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ProvisionerOptions {
    /// Validate options before any filesystem or catalog work happens.
    pub fn sanitize(&self) -> ProvisionResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(ProvisionError::InvalidArgument(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }

        let overrides = [
            ("projects_root", &self.projects_root),
            ("catalog_path", &self.catalog_path),
            ("blob_store_root", &self.blob_store_root),
            ("descriptor_template", &self.descriptor_template),
        ];
        for (field, path) in overrides {
            if let Some(path) = path
                && !path.is_absolute()
            {
                return Err(ProvisionError::InvalidArgument(format!(
                    "{} must be absolute path, got: {}",
                    field,
                    path.display()
                )));
            }
        }

        if self.hypervisor_uri.trim().is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "hypervisor_uri must not be empty".into(),
            ));
        }

        self.timeouts.sanitize()
    }
}

/// Deadlines applied to each external call of a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Upper bound on waiting for the catalog write lock.
    pub catalog_ms: u64,
    pub blob_store_ms: u64,
    pub hypervisor_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            catalog_ms: defaults::CATALOG_TIMEOUT_MS,
            blob_store_ms: defaults::BLOB_STORE_TIMEOUT_MS,
            hypervisor_ms: defaults::HYPERVISOR_TIMEOUT_MS,
        }
    }
}

impl Timeouts {
    pub fn catalog(&self) -> Duration {
        Duration::from_millis(self.catalog_ms)
    }

    pub fn blob_store(&self) -> Duration {
        Duration::from_millis(self.blob_store_ms)
    }

    pub fn hypervisor(&self) -> Duration {
        Duration::from_millis(self.hypervisor_ms)
    }

    fn sanitize(&self) -> ProvisionResult<()> {
        if self.catalog_ms == 0 || self.blob_store_ms == 0 || self.hypervisor_ms == 0 {
            return Err(ProvisionError::InvalidArgument(format!(
                "timeouts must be non-zero, got: {:?}",
                self
            )));
        }
        Ok(())
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(envs::HYPERBOOT_HOME)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }

    dirs::home_dir()
        .map(|home| home.join(defaults::HOME_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join(defaults::HOME_DIR_NAME))
}
