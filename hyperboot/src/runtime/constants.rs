pub mod envs {
    pub const HYPERBOOT_HOME: &str = "HYPERBOOT_HOME";
}

pub mod defaults {
    pub const HOME_DIR_NAME: &str = ".hyperboot";
    pub const HYPERVISOR_URI: &str = "qemu:///system";

    pub const CATALOG_TIMEOUT_MS: u64 = 30_000;
    pub const BLOB_STORE_TIMEOUT_MS: u64 = 600_000;
    pub const HYPERVISOR_TIMEOUT_MS: u64 = 60_000;
}

pub mod subdirs {
    pub const PROJECTS: &str = "projects";
    pub const BLOBS: &str = "blobs";
    pub const LOGS: &str = "logs";
}

pub mod filenames {
    use std::path::{Path, PathBuf};

    pub const CATALOG: &str = "catalog.db";
    pub const DESCRIPTOR_TEMPLATE: &str = "domain_template.xml";
    pub const LOG_PREFIX: &str = "hyperboot.log";

    /// `<workspace>/<instance_name>.xml`
    pub fn descriptor_path(workspace: &Path, instance_name: &str) -> PathBuf {
        workspace.join(format!("{}.xml", instance_name))
    }

    /// `<workspace>/<image_name>.img`
    pub fn disk_image_path(workspace: &Path, image_name: &str) -> PathBuf {
        workspace.join(format!("{}.img", image_name))
    }
}
