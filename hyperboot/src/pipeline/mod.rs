//! Table-driven staged execution.
//!
//! ```text
//! ExecutionPlan → Stages → Tasks
//!
//! - Plan: ordered stages, run one after another
//! - Stage: tasks with an execution mode (parallel/sequential)
//! - Task: atomic unit of work over a shared context
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let plan = ExecutionPlan::new(vec![
//!     Stage::sequential(vec![Box::new(TaskA)]),
//!     Stage::parallel(vec![Box::new(TaskB), Box::new(TaskC)]),
//! ]);
//!
//! let ctx = Arc::new(Mutex::new(Context::default()));
//! let metrics = PipelineExecutor::execute(plan, Arc::clone(&ctx)).await?;
//! println!("pipeline took {:?}", metrics.elapsed);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, PipelineExecutor, TaskError};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
