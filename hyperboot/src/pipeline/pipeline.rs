//! Staged executor.

use std::fmt;
use std::time::Instant;

use futures::future::try_join_all;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;
use crate::errors::ProvisionError;

/// Ordered list of stages to run against one context.
pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    /// Task names in execution order.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter().map(|task| task.name()))
            .collect()
    }
}

/// The first failing task of a run.
#[derive(Debug)]
pub struct TaskError {
    pub task: &'static str,
    pub source: ProvisionError,
    /// Metrics of the stages that completed before the failure.
    pub completed: PipelineMetrics,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {}", self.task, self.source)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage of `plan` in order.
    ///
    /// Stops at the first failing task. In a parallel stage the remaining
    /// tasks of that stage are dropped.
    pub async fn execute<Ctx>(
        plan: ExecutionPlan<Ctx>,
        ctx: Ctx,
    ) -> Result<PipelineMetrics, TaskError>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut metrics = PipelineMetrics::default();

        for (index, stage) in plan.stages.into_iter().enumerate() {
            let Stage { mode, tasks } = stage;
            tracing::debug!(stage = index, mode = %mode, tasks = tasks.len(), "Running stage");
            let stage_start = Instant::now();

            let outcome = match mode {
                ExecutionMode::Parallel => {
                    let futures = tasks
                        .into_iter()
                        .map(|task| run_task(task, ctx.clone()));
                    try_join_all(futures).await
                }
                ExecutionMode::Sequential => {
                    let mut finished = Vec::with_capacity(tasks.len());
                    let mut failed = None;
                    for task in tasks {
                        match run_task(task, ctx.clone()).await {
                            Ok(task_metrics) => finished.push(task_metrics),
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        }
                    }
                    match failed {
                        Some(e) => Err(e),
                        None => Ok(finished),
                    }
                }
            };

            let tasks = match outcome {
                Ok(tasks) => tasks,
                Err((task, source)) => {
                    metrics.elapsed = total_start.elapsed();
                    return Err(TaskError {
                        task,
                        source,
                        completed: metrics,
                    });
                }
            };

            metrics.stages.push(StageMetrics {
                index,
                mode,
                elapsed: stage_start.elapsed(),
                tasks,
            });
        }

        metrics.elapsed = total_start.elapsed();
        Ok(metrics)
    }
}

async fn run_task<Ctx>(
    task: BoxedTask<Ctx>,
    ctx: Ctx,
) -> Result<TaskMetrics, (&'static str, ProvisionError)> {
    let name = task.name();
    let start = Instant::now();
    task.run(ctx).await.map_err(|e| (name, e))?;
    Ok(TaskMetrics {
        name,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProvisionResult;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Record {
        name: &'static str,
        delay_ms: u64,
        fail: bool,
    }

    impl Record {
        fn ok(name: &'static str, delay_ms: u64) -> BoxedTask<Log> {
            Box::new(Self {
                name,
                delay_ms,
                fail: false,
            })
        }

        fn failing(name: &'static str) -> BoxedTask<Log> {
            Box::new(Self {
                name,
                delay_ms: 0,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> ProvisionResult<()> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(ProvisionError::Internal(format!("{} broke", self.name)));
            }
            ctx.lock().await.push(self.name);
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log: Log = Arc::default();
        let plan = ExecutionPlan::new(vec![
            Stage::sequential(vec![Record::ok("first", 0)]),
            Stage::parallel(vec![Record::ok("slow", 30), Record::ok("fast", 0)]),
            Stage::sequential(vec![Record::ok("last", 0)]),
        ]);
        assert_eq!(plan.task_names(), vec!["first", "slow", "fast", "last"]);

        let metrics = PipelineExecutor::execute(plan, Arc::clone(&log))
            .await
            .unwrap();

        assert_eq!(*log.lock().await, vec!["first", "fast", "slow", "last"]);
        assert_eq!(metrics.stages.len(), 3);
        assert_eq!(metrics.stages[1].mode, ExecutionMode::Parallel);
        assert!(metrics.task_elapsed("slow").unwrap() >= Duration::from_millis(30));
        assert!(metrics.task_elapsed("missing").is_none());
    }

    #[tokio::test]
    async fn test_failure_names_task_and_stops() {
        let log: Log = Arc::default();
        let plan = ExecutionPlan::new(vec![
            Stage::sequential(vec![Record::ok("first", 0)]),
            Stage::sequential(vec![Record::failing("second"), Record::ok("skipped", 0)]),
            Stage::sequential(vec![Record::ok("never", 0)]),
        ]);

        let err = PipelineExecutor::execute(plan, Arc::clone(&log))
            .await
            .unwrap_err();

        assert_eq!(err.task, "second");
        assert!(err.to_string().contains("second broke"));
        assert_eq!(err.completed.completed_tasks(), vec!["first"]);
        assert_eq!(*log.lock().await, vec!["first"]);
    }

    #[tokio::test]
    async fn test_parallel_failure_reported() {
        let log: Log = Arc::default();
        let plan = ExecutionPlan::new(vec![Stage::parallel(vec![
            Record::ok("sibling", 0),
            Record::failing("broken"),
        ])]);

        let err = PipelineExecutor::execute(plan, log).await.unwrap_err();
        assert_eq!(err.task, "broken");
    }
}
