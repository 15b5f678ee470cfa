//! Stage: tasks plus the mode they run in.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Polled together on the calling task. The first failure wins and the
    /// rest of the stage is dropped.
    Parallel,
    /// In declaration order. A failure skips the rest of the stage.
    Sequential,
}

impl ExecutionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Sequential => "sequential",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage starts only after every task of the previous stage completed.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub(super) mode: ExecutionMode,
    pub(super) tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(mode: ExecutionMode, tasks: Vec<T>) -> Self {
        Self { mode, tasks }
    }

    pub fn parallel(tasks: Vec<T>) -> Self {
        Self::new(ExecutionMode::Parallel, tasks)
    }

    pub fn sequential(tasks: Vec<T>) -> Self {
        Self::new(ExecutionMode::Sequential, tasks)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_mode() {
        let stage = Stage::parallel(vec!["a", "b"]);
        assert_eq!(stage.mode(), ExecutionMode::Parallel);
        assert_eq!(stage.len(), 2);

        let stage: Stage<&str> = Stage::sequential(Vec::new());
        assert_eq!(stage.mode(), ExecutionMode::Sequential);
        assert!(stage.is_empty());
        assert_eq!(ExecutionMode::Sequential.to_string(), "sequential");
    }
}
