//! Task: define and start the domain.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, missing, task_start};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootState, BootStep};

pub(crate) struct StartDomainTask;

#[async_trait]
impl PipelineTask<BootCtx> for StartDomainTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, guard, descriptor) = {
            let ctx = ctx.lock().await;
            (
                ctx.services.clone(),
                ctx.guard.clone(),
                ctx.descriptor
                    .clone()
                    .ok_or_else(|| missing("render_descriptor"))?,
            )
        };

        // Recorded before the call: a failed or cancelled start may still
        // leave the domain running.
        guard.set_domain_pending(&descriptor.name);
        let handle = match services.hypervisor.define_and_start(&descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                if matches!(e, ProvisionError::DomainDefinitionRejected(_)) {
                    guard.clear_domain();
                }
                log_task_error(&instance_name, task_name, &e);
                return Err(e);
            }
        };
        guard.set_domain(handle.clone());

        let mut ctx = ctx.lock().await;
        ctx.domain = Some(handle);
        ctx.advance(BootState::DomainStarted);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::StartDomain.as_str()
    }
}
