//! Provisioning orchestration.
//!
//! ## Architecture
//!
//! A boot is a fixed execution plan over a shared context:
//!
//! ```text
//! 1. EnsureWorkspace        (claim the name, create <projects_root>/<instance>)
//! 2. ResolveFlavor    ─┬─   (catalog lookups, read-only)
//!    ResolveImage     ─┘
//! 3. AllocateAddress        (atomic reservation in the catalog)
//! 4. RenderDescriptor       (<instance>.xml in the workspace)
//! 5. FetchImage             (<image>.img in the workspace)
//! 6. StartDomain            (define + start through the hypervisor)
//! 7. RecordInstance         (bind domain id to the address)
//! ```
//!
//! A failure after step 3 destroys a started domain and releases the
//! address before the error is returned. `BootGuard` does the same when a
//! boot future is dropped mid-flight.

mod compensation;
mod metrics;
mod tasks;
mod types;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::blob::{BlobStore, FsBlobStore};
use crate::catalog::{Catalog, Flavor, ImageMetadata, Instance};
use crate::descriptor::DescriptorBuilder;
use crate::errors::{BootError, ProvisionError, ProvisionResult};
use crate::hypervisor::{DestroyOutcome, HypervisorBackend, HypervisorClient, VirshBackend};
use crate::logging::init_logging_for;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, Stage};
use crate::runtime::{FilesystemLayout, ProvisionerOptions, Timeouts};
use crate::workspace::Workspaces;

pub use metrics::BootMetrics;
pub use types::{BootOutcome, BootRequest, BootState, BootStep};

use compensation::compensate;
use tasks::{
    AllocateAddressTask, BootCtx, EnsureWorkspaceTask, FetchImageTask, RecordInstanceTask,
    RenderDescriptorTask, ResolveFlavorTask, ResolveImageTask, StartDomainTask,
};
use types::{BootGuard, BootPipelineContext, BootServices};

fn boot_plan() -> ExecutionPlan<BootCtx> {
    let stages: Vec<Stage<BoxedTask<BootCtx>>> = vec![
        Stage::sequential(vec![Box::new(EnsureWorkspaceTask)]),
        // Independent lookups
        Stage::parallel(vec![Box::new(ResolveFlavorTask), Box::new(ResolveImageTask)]),
        Stage::sequential(vec![
            Box::new(AllocateAddressTask),
            Box::new(RenderDescriptorTask),
            Box::new(FetchImageTask),
            Box::new(StartDomainTask),
            Box::new(RecordInstanceTask),
        ]),
    ];
    ExecutionPlan::new(stages)
}

/// Components a [`Provisioner`] is assembled from.
///
/// [`Provisioner::new`] builds these from options; embedders with their own
/// blob store or hypervisor backend use [`Provisioner::from_parts`].
pub struct ProvisionerParts {
    pub catalog: Catalog,
    pub blob_store: Arc<dyn BlobStore>,
    pub hypervisor: Arc<dyn HypervisorBackend>,
    pub descriptors: DescriptorBuilder,
    pub workspaces: Workspaces,
    pub timeouts: Timeouts,
}

/// Boots domains from catalog flavors and blob-stored images.
///
/// Cheap to clone; clones share the catalog handle and the domain registry.
///
/// # Example
///
/// ```ignore
/// let provisioner = Provisioner::new(ProvisionerOptions::default())?;
/// let outcome = provisioner
///     .boot(BootRequest::new("test_instance", "522700a8a063d875c192d818", 1))
///     .await?;
/// println!("{} is {}", outcome.instance_name, outcome.domain_id);
/// ```
#[derive(Clone)]
pub struct Provisioner {
    services: Arc<BootServices>,
}

impl Provisioner {
    /// Open the catalog, load the template and connect the default backends.
    ///
    /// Fails if the options are invalid, the catalog schema does not match
    /// or the template is malformed.
    pub fn new(options: ProvisionerOptions) -> ProvisionResult<Self> {
        options.sanitize()?;

        let layout = FilesystemLayout::from_options(&options);
        layout.prepare()?;
        init_logging_for(&layout)?;

        let catalog = Catalog::open(layout.catalog_path(), options.timeouts.catalog())?;
        let descriptors = DescriptorBuilder::from_file(layout.descriptor_template())?;
        let workspaces = Workspaces::new(layout.projects_root())?;

        tracing::info!(
            home_dir = %layout.home_dir().display(),
            catalog = %layout.catalog_path().display(),
            hypervisor_uri = %options.hypervisor_uri,
            "Provisioner ready"
        );

        Ok(Self::from_parts(ProvisionerParts {
            catalog,
            blob_store: Arc::new(FsBlobStore::new(layout.blob_store_root())),
            hypervisor: Arc::new(VirshBackend::new(options.hypervisor_uri.clone())),
            descriptors,
            workspaces,
            timeouts: options.timeouts,
        }))
    }

    pub fn from_parts(parts: ProvisionerParts) -> Self {
        let ProvisionerParts {
            catalog,
            blob_store,
            hypervisor,
            descriptors,
            workspaces,
            timeouts,
        } = parts;

        Self {
            services: Arc::new(BootServices {
                catalog,
                blob_store,
                hypervisor: HypervisorClient::new(hypervisor, timeouts.hypervisor()),
                descriptors,
                workspaces,
                timeouts,
                booting: Arc::default(),
            }),
        }
    }

    /// Boot one instance.
    ///
    /// On failure the error names the step that failed and lists any
    /// compensation that could not be completed. Nothing is retried.
    pub async fn boot(&self, request: BootRequest) -> Result<BootOutcome, BootError> {
        let instance_name = request.instance_name.clone();
        tracing::info!(
            instance = %instance_name,
            image_id = %request.image_id,
            flavor_id = request.flavor_id,
            "Booting instance"
        );

        let guard = Arc::new(BootGuard::new(Arc::clone(&self.services), &instance_name));
        let ctx = Arc::new(Mutex::new(BootPipelineContext::new(
            request,
            Arc::clone(&self.services),
            Arc::clone(&guard),
        )));

        let executed = PipelineExecutor::execute(boot_plan(), Arc::clone(&ctx)).await;
        let pipeline_metrics = match executed {
            Ok(metrics) => metrics,
            Err(failure) => {
                // Every boot task is named after its step.
                let step =
                    BootStep::from_task_name(failure.task).unwrap_or(BootStep::EnsureWorkspace);
                let reached = {
                    let mut ctx = ctx.lock().await;
                    let reached = ctx.state;
                    ctx.advance(BootState::Failed);
                    reached
                };

                let completed = failure.completed.completed_tasks();
                let (address, domain) = guard.reserved();
                let compensation_failures =
                    compensate(&self.services, &instance_name, address, domain).await;
                guard.disarm();

                let error = BootError {
                    instance_name,
                    step,
                    source: failure.source,
                    compensation_failures,
                };
                tracing::error!(
                    instance = %error.instance_name,
                    step = %step,
                    reached = ?reached,
                    completed = ?completed,
                    needs_reconciliation = error.needs_reconciliation(),
                    "Boot failed: {}",
                    error
                );
                return Err(error);
            }
        };

        guard.disarm();
        let mut ctx = ctx.lock().await;
        let outcome = match (&ctx.instance, &ctx.address, &ctx.workspace, &ctx.blob) {
            (Some(instance), Some(address), Some(workspace), Some(blob)) => BootOutcome {
                instance_name: instance_name.clone(),
                domain_id: instance.id.clone(),
                address: address.address.clone(),
                workspace: workspace.clone(),
                image_sha256: blob.sha256.clone(),
                image_bytes: blob.bytes,
                booted_at: Utc::now(),
                metrics: BootMetrics::from_pipeline(&pipeline_metrics),
            },
            _ => {
                return Err(BootError {
                    instance_name,
                    step: BootStep::RecordInstance,
                    source: ProvisionError::Internal("boot finished without an instance".into()),
                    compensation_failures: Vec::new(),
                });
            }
        };
        ctx.advance(BootState::Done);

        outcome.metrics.log_stages(&outcome.instance_name);
        tracing::info!(
            instance = %outcome.instance_name,
            domain_id = %outcome.domain_id,
            address = %outcome.address,
            image_sha256 = %outcome.image_sha256,
            "Instance booted"
        );
        Ok(outcome)
    }

    /// Hard-stop a domain booted by this provisioner.
    ///
    /// The instance row and its address reservation are kept.
    pub async fn destroy_domain(&self, instance_name: &str) -> ProvisionResult<DestroyOutcome> {
        self.services.hypervisor.destroy(instance_name).await
    }

    pub async fn flavors(&self) -> ProvisionResult<Vec<Flavor>> {
        self.services
            .catalog_call(|catalog| catalog.list_flavors())
            .await
    }

    pub async fn images(&self) -> ProvisionResult<Vec<ImageMetadata>> {
        self.services
            .catalog_call(|catalog| catalog.list_images())
            .await
    }

    pub async fn instance(&self, domain_id: &str) -> ProvisionResult<Instance> {
        let domain_id = domain_id.to_string();
        self.services
            .catalog_call(move |catalog| catalog.get_instance(&domain_id))
            .await
    }

    pub fn catalog(&self) -> &Catalog {
        &self.services.catalog
    }

    pub fn hypervisor(&self) -> &HypervisorClient {
        &self.services.hypervisor
    }

    pub fn workspaces(&self) -> &Workspaces {
        &self.services.workspaces
    }
}
