//! Tasks: resolve flavor and image metadata.
//!
//! Both are read-only catalog lookups and run in the same parallel stage.
//! Whichever finishes second moves the run to `ResourcesResolved`.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, task_start};
use crate::errors::ProvisionResult;
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootPipelineContext, BootState, BootStep};

pub(crate) struct ResolveFlavorTask;

#[async_trait]
impl PipelineTask<BootCtx> for ResolveFlavorTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, flavor_id) = {
            let ctx = ctx.lock().await;
            (ctx.services.clone(), ctx.request.flavor_id)
        };

        let flavor = services
            .catalog_call(move |catalog| catalog.get_flavor(flavor_id))
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;

        tracing::debug!(
            instance = %instance_name,
            flavor = %flavor.name,
            vcpu = flavor.vcpu,
            memory_kib = flavor.memory_kib,
            "Resolved flavor"
        );

        let mut ctx = ctx.lock().await;
        ctx.flavor = Some(flavor);
        mark_resolved(&mut ctx);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::ResolveFlavor.as_str()
    }
}

pub(crate) struct ResolveImageTask;

#[async_trait]
impl PipelineTask<BootCtx> for ResolveImageTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, image_id) = {
            let ctx = ctx.lock().await;
            (ctx.services.clone(), ctx.request.image_id.clone())
        };

        let image = services
            .catalog_call(move |catalog| catalog.get_image(&image_id))
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;

        tracing::debug!(
            instance = %instance_name,
            image = %image.name,
            format = %image.format,
            "Resolved image"
        );

        let mut ctx = ctx.lock().await;
        ctx.image = Some(image);
        mark_resolved(&mut ctx);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::ResolveImage.as_str()
    }
}

fn mark_resolved(ctx: &mut BootPipelineContext) {
    if ctx.flavor.is_some() && ctx.image.is_some() {
        ctx.advance(BootState::ResourcesResolved);
    }
}
