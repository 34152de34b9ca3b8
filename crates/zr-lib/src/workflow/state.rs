use std::{collections::HashMap, sync::Mutex};

use crate::task_graph::Outcome;

/// What a later condition may ask about an already-run task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub outcome: Outcome,
    /// The promoted view: an `allow_failure` task that failed is a
    /// success here while `outcome` keeps the original result.
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRecord {
    pub success: bool,
}

#[derive(Debug, Default)]
struct RuntimeStateInner {
    tasks: HashMap<String, TaskRecord>,
    stages: HashMap<String, StageRecord>,
}

/// Per-run execution state shared between the scheduler and condition
/// evaluation in later stages. Writes are linearized by the lock, so a
/// successor reading a predecessor's record observes its final values.
#[derive(Debug, Default)]
pub struct RuntimeState {
    inner: Mutex<RuntimeStateInner>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task(
        &self,
        name: &str,
        outcome: Outcome,
        allow_failure: bool,
        duration_ms: u64,
    ) {
        let record = TaskRecord {
            outcome,
            success: outcome.unblocks_dependents(allow_failure),
            duration_ms,
        };
        self.inner
            .lock()
            .expect("runtime state lock poisoned")
            .tasks
            .insert(name.to_string(), record);
    }

    pub fn record_stage(&self, name: &str, success: bool) {
        self.inner
            .lock()
            .expect("runtime state lock poisoned")
            .stages
            .insert(name.to_string(), StageRecord { success });
    }

    pub fn task(&self, name: &str) -> Option<TaskRecord> {
        self.inner
            .lock()
            .expect("runtime state lock poisoned")
            .tasks
            .get(name)
            .copied()
    }

    pub fn stage_success(&self, name: &str) -> Option<bool> {
        self.inner
            .lock()
            .expect("runtime state lock poisoned")
            .stages
            .get(name)
            .map(|record| record.success)
    }

    /// Snapshot of every task record, sorted by task name.
    pub fn task_records(&self) -> Vec<(String, TaskRecord)> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .expect("runtime state lock poisoned")
            .tasks
            .iter()
            .map(|(name, record)| (name.clone(), *record))
            .collect();
        records.sort_by(|(a, _), (b, _)| a.cmp(b));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_failure_promotion_keeps_original_outcome() {
        let state = RuntimeState::new();
        let failure = Outcome::Failure { exit_code: Some(2) };
        state.record_task("flaky", failure, true, 30);

        let record = state.task("flaky").unwrap();
        assert!(record.success);
        assert_eq!(record.outcome, failure);
    }

    #[test]
    fn test_stage_records() {
        let state = RuntimeState::new();
        state.record_stage("verify", true);
        assert_eq!(state.stage_success("verify"), Some(true));
        assert_eq!(state.stage_success("missing"), None);
    }

    #[test]
    fn test_rerecording_overwrites() {
        let state = RuntimeState::new();
        state.record_task("t", Outcome::Failure { exit_code: Some(1) }, false, 5);
        state.record_task("t", Outcome::Success, false, 9);
        let record = state.task("t").unwrap();
        assert!(record.success);
        assert_eq!(record.duration_ms, 9);
    }
}
