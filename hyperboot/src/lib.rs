//! hyperboot: boots libvirt domains from catalog flavors and blob-stored
//! disk images.
//!
//! A [`Provisioner`] ties together the resource catalog, the blob store, the
//! per-instance workspaces, the descriptor builder and the hypervisor client.
//! [`Provisioner::boot`] runs one instance through the whole sequence and
//! undoes what it acquired if a later step fails.

pub mod blob;
pub mod catalog;
pub mod descriptor;
pub mod errors;
pub mod hypervisor;
pub mod logging;
pub mod pipeline;
pub mod provision;
pub mod runtime;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use blob::{BlobReceipt, BlobStore, FsBlobStore};
pub use catalog::{Catalog, Flavor, ImageMetadata, Instance, InstanceState, NetworkAddress};
pub use descriptor::{DescriptorBuilder, DescriptorParams, DomainDescriptor};
pub use errors::{BootError, CompensationFailure, ErrorKind, ProvisionError, ProvisionResult};
pub use hypervisor::{
    DestroyOutcome, DomainHandle, HypervisorBackend, HypervisorClient, VirshBackend,
};
pub use logging::init_logging_for;
pub use provision::{
    BootMetrics, BootOutcome, BootRequest, BootState, BootStep, Provisioner, ProvisionerParts,
};
pub use runtime::{FilesystemLayout, ProvisionerOptions, Timeouts};
pub use workspace::Workspaces;

// Provisioner is shared across tasks and threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Provisioner>();
    assert_send_sync::<Catalog>();
    assert_send_sync::<HypervisorClient>();
};
