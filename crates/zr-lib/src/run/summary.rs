use std::{fmt, time::Duration};

use crate::{
    task_graph::Outcome,
    workflow::{RuntimeState, TaskRecord},
};

/// End-of-run report: one line per task plus outcome counts.
#[derive(Debug)]
pub struct RunSummary {
    records: Vec<(String, TaskRecord)>,
    elapsed: Duration,
}

impl RunSummary {
    pub fn new(runtime: &RuntimeState, elapsed: Duration) -> Self {
        Self {
            records: runtime.task_records(),
            elapsed,
        }
    }

    fn count(&self, matches: impl Fn(Outcome) -> bool) -> usize {
        self.records
            .iter()
            .filter(|(_, record)| matches(record.outcome))
            .count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, record) in &self.records {
            writeln!(
                f,
                "  {name}: {} ({}ms)",
                record.outcome.label(),
                record.duration_ms
            )?;
        }

        let successful = self.count(|outcome| matches!(outcome, Outcome::Success));
        let cached = self.count(|outcome| matches!(outcome, Outcome::CachedHit));
        let skipped = self.count(|outcome| matches!(outcome, Outcome::Skipped));
        let failed =
            self.count(|outcome| matches!(outcome, Outcome::Failure { .. } | Outcome::TimedOut));
        let cancelled = self.count(|outcome| matches!(outcome, Outcome::Cancelled));

        write!(
            f,
            "{} tasks: {successful} successful, {cached} cached, {skipped} skipped, {failed} \
             failed, {cancelled} cancelled in {:.2}s",
            self.records.len(),
            self.elapsed.as_secs_f64()
        )
    }
}
