//! Task: fetch the disk image from the blob store into the workspace.

use async_trait::async_trait;

use super::{BootCtx, log_task_error, missing, task_start};
use crate::blob::{BlobReceipt, materialize};
use crate::catalog::ImageMetadata;
use crate::errors::ProvisionResult;
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootServices, BootState, BootStep};

pub(crate) struct FetchImageTask;

#[async_trait]
impl PipelineTask<BootCtx> for FetchImageTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, image) = {
            let ctx = ctx.lock().await;
            (
                ctx.services.clone(),
                ctx.image.clone().ok_or_else(|| missing("resolve_image"))?,
            )
        };

        let receipt = fetch(&services, &instance_name, &image)
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;

        if receipt.bytes != image.size {
            // Not fatal: the fetched object is what boots.
            tracing::warn!(
                instance = %instance_name,
                image = %image.name,
                catalog_size = image.size,
                fetched = receipt.bytes,
                "Image size differs from catalog"
            );
        }

        let mut ctx = ctx.lock().await;
        ctx.blob = Some(receipt);
        ctx.advance(BootState::ImageFetched);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::FetchImage.as_str()
    }
}

async fn fetch(
    services: &BootServices,
    instance_name: &str,
    image: &ImageMetadata,
) -> ProvisionResult<BlobReceipt> {
    let dest = services
        .workspaces
        .disk_image_path(instance_name, &image.name)?;
    materialize(
        services.blob_store.as_ref(),
        image.storage_key(),
        &dest,
        services.timeouts.blob_store(),
    )
    .await
}
