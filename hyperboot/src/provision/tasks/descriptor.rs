//! Task: render the domain descriptor into the workspace.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, missing, task_start};
use crate::catalog::{Flavor, ImageMetadata, NetworkAddress};
use crate::descriptor::{DescriptorParams, DomainDescriptor};
use crate::errors::ProvisionResult;
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootServices, BootState, BootStep};

pub(crate) struct RenderDescriptorTask;

#[async_trait]
impl PipelineTask<BootCtx> for RenderDescriptorTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, flavor, image, address) = {
            let ctx = ctx.lock().await;
            (
                ctx.services.clone(),
                ctx.flavor.clone().ok_or_else(|| missing("resolve_flavor"))?,
                ctx.image.clone().ok_or_else(|| missing("resolve_image"))?,
                ctx.address.clone().ok_or_else(|| missing("allocate_address"))?,
            )
        };

        let descriptor = render(&services, &instance_name, &flavor, &image, &address)
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.descriptor = Some(descriptor);
        ctx.advance(BootState::DescriptorWritten);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::RenderDescriptor.as_str()
    }
}

async fn render(
    services: &BootServices,
    instance_name: &str,
    flavor: &Flavor,
    image: &ImageMetadata,
    address: &NetworkAddress,
) -> ProvisionResult<DomainDescriptor> {
    let disk_path = services
        .workspaces
        .disk_image_path(instance_name, &image.name)?;
    let dest = services.workspaces.descriptor_path(instance_name);

    services
        .descriptors
        .render(
            &DescriptorParams {
                instance_name,
                memory_kib: flavor.memory_kib,
                vcpu: flavor.vcpu,
                disk_path: &disk_path,
                mac_address: &address.address,
            },
            &dest,
        )
        .await
}
