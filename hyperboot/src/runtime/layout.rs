//! Resolved on-disk locations for a provisioner.

use std::path::{Path, PathBuf};

use crate::errors::{ProvisionError, ProvisionResult};
use crate::runtime::constants::{filenames, subdirs};
use crate::runtime::options::ProvisionerOptions;

/// Every path the provisioner touches, with option overrides applied.
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
    projects_root: PathBuf,
    catalog_path: PathBuf,
    blob_store_root: PathBuf,
    descriptor_template: PathBuf,
}

impl FilesystemLayout {
    pub fn from_options(options: &ProvisionerOptions) -> Self {
        let home_dir = options.home_dir.clone();
        Self {
            projects_root: options
                .projects_root
                .clone()
                .unwrap_or_else(|| home_dir.join(subdirs::PROJECTS)),
            catalog_path: options
                .catalog_path
                .clone()
                .unwrap_or_else(|| home_dir.join(filenames::CATALOG)),
            blob_store_root: options
                .blob_store_root
                .clone()
                .unwrap_or_else(|| home_dir.join(subdirs::BLOBS)),
            descriptor_template: options
                .descriptor_template
                .clone()
                .unwrap_or_else(|| home_dir.join(filenames::DESCRIPTOR_TEMPLATE)),
            home_dir,
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(subdirs::LOGS)
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    pub fn blob_store_root(&self) -> &Path {
        &self.blob_store_root
    }

    pub fn descriptor_template(&self) -> &Path {
        &self.descriptor_template
    }

    /// Create the directories the provisioner writes into.
    ///
    /// The blob store root and the template are inputs and must already exist.
    pub fn prepare(&self) -> ProvisionResult<()> {
        for dir in [&self.home_dir, &self.projects_root, &self.logs_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ProvisionError::Internal(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_live_under_home() {
        let options = ProvisionerOptions {
            home_dir: PathBuf::from("/srv/hyperboot"),
            ..Default::default()
        };
        let layout = FilesystemLayout::from_options(&options);

        assert_eq!(layout.projects_root(), Path::new("/srv/hyperboot/projects"));
        assert_eq!(layout.catalog_path(), Path::new("/srv/hyperboot/catalog.db"));
        assert_eq!(layout.blob_store_root(), Path::new("/srv/hyperboot/blobs"));
        assert_eq!(
            layout.descriptor_template(),
            Path::new("/srv/hyperboot/domain_template.xml")
        );
    }

    #[test]
    fn test_overrides_win() {
        let options = ProvisionerOptions {
            home_dir: PathBuf::from("/srv/hyperboot"),
            projects_root: Some(PathBuf::from("/data/projects")),
            ..Default::default()
        };
        let layout = FilesystemLayout::from_options(&options);
        assert_eq!(layout.projects_root(), Path::new("/data/projects"));
    }

    #[test]
    fn test_prepare_creates_writable_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let options = ProvisionerOptions {
            home_dir: temp_dir.path().join("home"),
            ..Default::default()
        };
        let layout = FilesystemLayout::from_options(&options);
        layout.prepare().unwrap();

        assert!(layout.projects_root().is_dir());
        assert!(layout.logs_dir().is_dir());
    }
}
