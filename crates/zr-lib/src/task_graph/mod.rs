//! The normalized task table and the execution visitor.

mod visitor;

use std::time::Duration;

pub use visitor::{Error as VisitorError, Visitor, VisitorOptions};

/// A fully normalized task: templates, matrix dimensions, and profiles
/// have all been applied. Immutable for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    pub cmd: String,
    pub description: Option<String>,
    pub cwd: Option<String>,
    /// Key/value pairs in their resolved order; later layers already won
    /// at normalization time so keys are unique.
    pub env: Vec<(String, String)>,
    /// Unordered predecessors; satisfied deps may have run in parallel.
    pub deps: Vec<String>,
    /// Ordered predecessors; each must fully finish before the next starts.
    pub deps_serial: Vec<String>,
    /// `None` means no timeout.
    pub timeout: Option<Duration>,
    pub allow_failure: bool,
    pub retry: RetryPolicy,
    pub condition: Option<String>,
    /// Maximum concurrently running instances of this task; 0 = unlimited.
    pub max_concurrent: u32,
    pub cache: bool,
    pub max_cpu: Option<u32>,
    pub max_memory: Option<u64>,
    pub toolchain: Vec<String>,
    /// Files whose content participates in the fingerprint.
    pub inputs: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of re-runs after the initial attempt; 0 = run exactly once.
    pub max: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.delay,
            Backoff::Exponential => self.delay * 2u32.saturating_pow(retry.saturating_sub(1)),
        }
    }
}

/// Terminal status of a task. Execution failures are data, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { exit_code: Option<i32> },
    /// Condition evaluated to false; successors treat this as success.
    Skipped,
    /// A cache marker satisfied the task without spawning a process.
    CachedHit,
    TimedOut,
    Cancelled,
}

impl Outcome {
    /// Whether successors may proceed past this task.
    pub fn unblocks_dependents(&self, allow_failure: bool) -> bool {
        match self {
            Outcome::Success | Outcome::Skipped | Outcome::CachedHit => true,
            Outcome::Failure { .. } | Outcome::TimedOut => allow_failure,
            Outcome::Cancelled => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure { .. } => "failed",
            Outcome::Skipped => "skipped",
            Outcome::CachedHit => "cached",
            Outcome::TimedOut => "timed out",
            Outcome::Cancelled => "cancelled",
        }
    }
}
