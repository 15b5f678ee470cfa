//! Task: reserve a network address.
//!
//! The allocation runs on the blocking pool and reports back over a oneshot
//! channel. If the boot was cancelled while the allocation was in flight,
//! the receiver is gone and the worker releases the address itself.

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{BootCtx, log_task_error, task_start};
use crate::catalog::NetworkAddress;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::pipeline::PipelineTask;
use crate::provision::types::{BootServices, BootState, BootStep};

pub(crate) struct AllocateAddressTask;

#[async_trait]
impl PipelineTask<BootCtx> for AllocateAddressTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> ProvisionResult<()> {
        let task_name = self.name();
        let instance_name = task_start(&ctx, task_name).await;

        let (services, guard) = {
            let ctx = ctx.lock().await;
            (ctx.services.clone(), ctx.guard.clone())
        };

        let address = allocate(&services, &instance_name)
            .await
            .inspect_err(|e| log_task_error(&instance_name, task_name, e))?;
        // Registered before the next await so cancellation cannot lose it.
        guard.set_address(address.clone());

        tracing::info!(
            instance = %instance_name,
            address = %address.address,
            address_id = address.id,
            "Allocated network address"
        );

        let mut ctx = ctx.lock().await;
        ctx.address = Some(address);
        ctx.advance(BootState::AddressAllocated);
        Ok(())
    }

    fn name(&self) -> &'static str {
        BootStep::AllocateAddress.as_str()
    }
}

async fn allocate(services: &BootServices, instance_name: &str) -> ProvisionResult<NetworkAddress> {
    let (tx, rx) = oneshot::channel();
    let catalog = services.catalog.clone();
    let instance_name = instance_name.to_string();

    tokio::task::spawn_blocking(move || {
        let result = catalog.allocate_free_address();
        if let Err(Ok(address)) = tx.send(result) {
            tracing::warn!(
                instance = %instance_name,
                address = %address.address,
                "Boot cancelled during allocation, releasing address"
            );
            if let Err(e) = catalog.release_address(address.id) {
                tracing::error!(
                    instance = %instance_name,
                    address = %address.address,
                    "Failed to release address of cancelled boot: {}",
                    e
                );
            }
        }
    });

    rx.await
        .map_err(|_| ProvisionError::Internal("allocation worker exited without a result".into()))?
}
