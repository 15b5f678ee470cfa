//! Timings recorded by the executor.

use std::time::Duration;

use super::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMetrics {
    pub name: &'static str,
    pub elapsed: Duration,
}

/// A completed stage. Tasks are listed in declaration order, also for
/// parallel stages.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub mode: ExecutionMode,
    pub elapsed: Duration,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub elapsed: Duration,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }

    pub fn task_elapsed(&self, name: &str) -> Option<Duration> {
        self.tasks()
            .find(|task| task.name == name)
            .map(|task| task.elapsed)
    }

    /// Names of every task that finished, in execution order.
    pub fn completed_tasks(&self) -> Vec<&'static str> {
        self.tasks().map(|task| task.name).collect()
    }
}
