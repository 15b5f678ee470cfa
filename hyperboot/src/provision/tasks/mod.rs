//! Boot pipeline tasks, one per [`BootStep`](super::BootStep).

mod address;
mod descriptor;
mod domain;
mod image;
mod record;
mod resources;
mod workspace;

use std::sync::Arc;

use tokio::sync::Mutex;

use super::types::BootPipelineContext;
use crate::errors::ProvisionError;

pub(crate) use address::AllocateAddressTask;
pub(crate) use descriptor::RenderDescriptorTask;
pub(crate) use domain::StartDomainTask;
pub(crate) use image::FetchImageTask;
pub(crate) use record::RecordInstanceTask;
pub(crate) use resources::{ResolveFlavorTask, ResolveImageTask};
pub(crate) use workspace::EnsureWorkspaceTask;

pub(crate) type BootCtx = Arc<Mutex<BootPipelineContext>>;

/// Log the task start and return the instance name for later logging.
async fn task_start(ctx: &BootCtx, task_name: &str) -> String {
    let instance_name = ctx.lock().await.request.instance_name.clone();
    tracing::debug!(instance = %instance_name, task = task_name, "Boot task starting");
    instance_name
}

fn log_task_error(instance_name: &str, task_name: &str, error: &ProvisionError) {
    tracing::error!(
        instance = %instance_name,
        task = task_name,
        kind = ?error.kind(),
        "Boot task failed: {}",
        error
    );
}

/// Output of an earlier task that the current one depends on.
fn missing(what: &str) -> ProvisionError {
    ProvisionError::Internal(format!("{} task must run first", what))
}
