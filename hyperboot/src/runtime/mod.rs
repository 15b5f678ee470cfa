//! Provisioner configuration and filesystem layout.

pub mod constants;
pub mod layout;
pub mod options;

pub use layout::FilesystemLayout;
pub use options::{ProvisionerOptions, Timeouts};
