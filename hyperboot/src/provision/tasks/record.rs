//! Task: record the instance row binding the domain to its address.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, missing, task_start};
use crate::catalog::{Instance, InstanceState};
use crate::errors::ProvisionResult;
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootState, BootStep};

pub(crate) struct RecordInstanceTask;

#[async_trait]
impl PipelineTask<BootCtx> for RecordInstanceTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, guard, instance) = {
            let ctx = ctx.lock().await;
            let domain = ctx.domain.as_ref().ok_or_else(|| missing("start_domain"))?;
            let address = ctx
                .address
                .as_ref()
                .ok_or_else(|| missing("allocate_address"))?;
            (
                ctx.services.clone(),
                ctx.guard.clone(),
                Instance {
                    id: domain.id.clone(),
                    domain_name: domain.name.clone(),
                    state: InstanceState::Running,
                    address_id: address.id,
                },
            )
        };

        let row = instance.clone();
        services
            .catalog_call(move |catalog| catalog.record_instance(&row))
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;
        // The row is durable; nothing may be undone from here on.
        guard.disarm();

        let mut ctx = ctx.lock().await;
        ctx.instance = Some(instance);
        ctx.advance(BootState::InstanceRecorded);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::RecordInstance.as_str()
    }
}
