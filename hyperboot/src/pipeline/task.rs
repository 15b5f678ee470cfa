//! Task trait for pipeline execution.

use async_trait::async_trait;

use crate::errors::ProvisionResult;

/// A unit of work run by the pipeline executor.
///
/// Tasks receive the shared context by value; use a cloneable handle
/// (`Arc<Mutex<..>>`) for anything a later task needs to read.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> ProvisionResult<()>;

    /// Stable task name, used in metrics and failure reports.
    fn name(&self) -> &'static str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
