//! Task: claim the instance name and ensure its workspace directory.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, task_start};
use crate::errors::ProvisionResult;
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootState, BootStep};

pub(crate) struct EnsureWorkspaceTask;

#[async_trait]
impl PipelineTask<BootCtx> for EnsureWorkspaceTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, guard) = {
            let ctx = ctx.lock().await;
            (ctx.services.clone(), ctx.guard.clone())
        };
        let claim = services
            .claim(&instance_name)
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;
        guard.hold_claim(claim);

        let path = services
            .workspaces
            .ensure(&instance_name)
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.workspace = Some(path);
        ctx.advance(BootState::WorkspaceReady);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::EnsureWorkspace.as_str()
    }
}
