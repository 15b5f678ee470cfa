//! Type definitions for the boot pipeline.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::compensation::compensate;
use super::metrics::BootMetrics;
use crate::blob::{BlobReceipt, BlobStore};
use crate::catalog::{Catalog, Flavor, ImageMetadata, Instance, NetworkAddress};
use crate::descriptor::{DescriptorBuilder, DomainDescriptor};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::hypervisor::{DomainHandle, HypervisorClient};
use crate::runtime::Timeouts;
use crate::workspace::Workspaces;

/// Input to [`Provisioner::boot`](super::Provisioner::boot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRequest {
    pub instance_name: String,
    pub image_id: String,
    pub flavor_id: i64,
}

impl BootRequest {
    pub fn new(
        instance_name: impl Into<String>,
        image_id: impl Into<String>,
        flavor_id: i64,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            image_id: image_id.into(),
            flavor_id,
        }
    }
}

/// Result of a successful boot.
#[derive(Debug, Clone)]
pub struct BootOutcome {
    pub instance_name: String,
    /// Hypervisor-assigned UUID, also the catalog instance id.
    pub domain_id: String,
    pub address: String,
    pub workspace: PathBuf,
    /// Hex SHA-256 of the fetched disk image.
    pub image_sha256: String,
    pub image_bytes: u64,
    pub booted_at: DateTime<Utc>,
    pub metrics: BootMetrics,
}

/// Boot step, used to attribute a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootStep {
    EnsureWorkspace,
    ResolveFlavor,
    ResolveImage,
    AllocateAddress,
    RenderDescriptor,
    FetchImage,
    StartDomain,
    RecordInstance,
}

impl BootStep {
    pub const ALL: [BootStep; 8] = [
        BootStep::EnsureWorkspace,
        BootStep::ResolveFlavor,
        BootStep::ResolveImage,
        BootStep::AllocateAddress,
        BootStep::RenderDescriptor,
        BootStep::FetchImage,
        BootStep::StartDomain,
        BootStep::RecordInstance,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            BootStep::EnsureWorkspace => "ensure_workspace",
            BootStep::ResolveFlavor => "resolve_flavor",
            BootStep::ResolveImage => "resolve_image",
            BootStep::AllocateAddress => "allocate_address",
            BootStep::RenderDescriptor => "render_descriptor",
            BootStep::FetchImage => "fetch_image",
            BootStep::StartDomain => "start_domain",
            BootStep::RecordInstance => "record_instance",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == name)
    }
}

impl fmt::Display for BootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one boot run.
///
/// ```text
/// Start → WorkspaceReady → ResourcesResolved → AddressAllocated
///       → DescriptorWritten → ImageFetched → DomainStarted
///       → InstanceRecorded → Done
/// ```
///
/// `Failed` is reachable from every state before `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootState {
    Start,
    WorkspaceReady,
    ResourcesResolved,
    AddressAllocated,
    DescriptorWritten,
    ImageFetched,
    DomainStarted,
    InstanceRecorded,
    Done,
    Failed,
}

/// Everything a boot run talks to. Shared by all runs of a provisioner.
pub(crate) struct BootServices {
    pub catalog: Catalog,
    pub blob_store: Arc<dyn BlobStore>,
    pub hypervisor: HypervisorClient,
    pub descriptors: DescriptorBuilder,
    pub workspaces: Workspaces,
    pub timeouts: Timeouts,
    /// Instance names with a boot in flight.
    pub booting: Arc<Mutex<HashSet<String>>>,
}

impl BootServices {
    /// Run a blocking catalog call on the blocking pool.
    pub async fn catalog_call<T, F>(&self, f: F) -> ProvisionResult<T>
    where
        F: FnOnce(&Catalog) -> ProvisionResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || f(&catalog))
            .await
            .map_err(|e| ProvisionError::Internal(format!("catalog worker failed: {}", e)))?
    }

    /// Reserve `instance_name` for one boot run.
    ///
    /// Fails with `InstanceBusy` while another run holds the name or the
    /// hypervisor client still tracks a domain under it.
    pub fn claim(&self, instance_name: &str) -> ProvisionResult<NameClaim> {
        let mut booting = self.booting.lock();
        if booting.contains(instance_name) || self.hypervisor.is_managed(instance_name) {
            return Err(ProvisionError::InstanceBusy(instance_name.to_string()));
        }
        booting.insert(instance_name.to_string());
        Ok(NameClaim {
            booting: Arc::clone(&self.booting),
            name: instance_name.to_string(),
        })
    }
}

/// Exclusive use of an instance name. Released on drop.
#[derive(Debug)]
pub(crate) struct NameClaim {
    booting: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        self.booting.lock().remove(&self.name);
    }
}

/// A domain this boot asked the hypervisor to start.
///
/// `id` is `None` until the start reports back; the domain may be running
/// either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StartedDomain {
    pub name: String,
    pub id: Option<String>,
}

impl From<DomainHandle> for StartedDomain {
    fn from(handle: DomainHandle) -> Self {
        Self {
            name: handle.name,
            id: Some(handle.id),
        }
    }
}

#[derive(Default)]
struct Reservations {
    address: Option<NetworkAddress>,
    domain: Option<StartedDomain>,
    claim: Option<NameClaim>,
    disarmed: bool,
}

impl Reservations {
    fn holds_resources(&self) -> bool {
        self.address.is_some() || self.domain.is_some()
    }
}

/// Tracks what a boot run has acquired so it can be undone.
///
/// Registration and disarming are synchronous, so a task can record a
/// reservation in the same poll that produced it. If the guard is dropped
/// while still armed (the boot future was cancelled), compensation is
/// spawned on the current runtime and the name claim is released only
/// after it finishes.
pub(crate) struct BootGuard {
    services: Arc<BootServices>,
    instance_name: String,
    reservations: Mutex<Reservations>,
}

impl BootGuard {
    pub fn new(services: Arc<BootServices>, instance_name: &str) -> Self {
        Self {
            services,
            instance_name: instance_name.to_string(),
            reservations: Mutex::new(Reservations::default()),
        }
    }

    pub fn hold_claim(&self, claim: NameClaim) {
        self.reservations.lock().claim = Some(claim);
    }

    pub fn set_address(&self, address: NetworkAddress) {
        self.reservations.lock().address = Some(address);
    }

    /// Record a start about to be attempted.
    pub fn set_domain_pending(&self, name: &str) {
        self.reservations.lock().domain = Some(StartedDomain {
            name: name.to_string(),
            id: None,
        });
    }

    pub fn set_domain(&self, domain: DomainHandle) {
        self.reservations.lock().domain = Some(domain.into());
    }

    /// The start was refused; nothing is running.
    pub fn clear_domain(&self) {
        self.reservations.lock().domain = None;
    }

    /// Current reservations, without disarming.
    pub fn reserved(&self) -> (Option<NetworkAddress>, Option<StartedDomain>) {
        let reservations = self.reservations.lock();
        (reservations.address.clone(), reservations.domain.clone())
    }

    /// After this, dropping the guard only releases the name claim.
    pub fn disarm(&self) {
        self.reservations.lock().disarmed = true;
    }
}

impl Drop for BootGuard {
    fn drop(&mut self) {
        let mut reservations = std::mem::take(self.reservations.get_mut());
        if reservations.disarmed || !reservations.holds_resources() {
            return;
        }

        tracing::warn!(
            instance = %self.instance_name,
            "Boot abandoned after acquiring resources, compensating"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                instance = %self.instance_name,
                address = ?reservations.address.as_ref().map(|a| &a.address),
                domain = ?reservations.domain.as_ref().map(|d| &d.name),
                "No runtime to compensate on, resources leaked"
            );
            return;
        };

        let services = Arc::clone(&self.services);
        let instance_name = std::mem::take(&mut self.instance_name);
        let claim = reservations.claim.take();
        handle.spawn(async move {
            let failures = compensate(
                &services,
                &instance_name,
                reservations.address,
                reservations.domain,
            )
            .await;
            for failure in failures {
                tracing::error!(instance = %instance_name, "Compensation incomplete: {}", failure);
            }
            drop(claim);
        });
    }
}

/// Shared boot pipeline context.
///
/// Each task reads what earlier tasks stored and stores its own output.
pub(crate) struct BootPipelineContext {
    pub request: BootRequest,
    pub services: Arc<BootServices>,
    pub guard: Arc<BootGuard>,
    pub state: BootState,
    pub workspace: Option<PathBuf>,
    pub flavor: Option<Flavor>,
    pub image: Option<ImageMetadata>,
    pub address: Option<NetworkAddress>,
    pub descriptor: Option<DomainDescriptor>,
    pub blob: Option<BlobReceipt>,
    pub domain: Option<DomainHandle>,
    pub instance: Option<Instance>,
}

impl BootPipelineContext {
    pub fn new(request: BootRequest, services: Arc<BootServices>, guard: Arc<BootGuard>) -> Self {
        Self {
            request,
            services,
            guard,
            state: BootState::Start,
            workspace: None,
            flavor: None,
            image: None,
            address: None,
            descriptor: None,
            blob: None,
            domain: None,
            instance: None,
        }
    }

    pub fn advance(&mut self, next: BootState) {
        tracing::debug!(
            instance = %self.request.instance_name,
            from = ?self.state,
            to = ?next,
            "Boot state transition"
        );
        self.state = next;
    }
}
