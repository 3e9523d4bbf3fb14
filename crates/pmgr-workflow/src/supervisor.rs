//! Interpretation of patch job outcomes and out-of-memory recovery.

use std::collections::HashSet;

use pmgr_jobs::{JobOutputs, JobState};
use tracing::info;

use crate::{prefs::Preferences, worker::WorkerFailure};

/// Amount the memory budget drops after an out-of-memory failure.
pub const MEMORY_ADJUSTMENT_MB: u32 = 200;
/// The budget never drops below this.
pub const MIN_LIMIT_MB: u32 = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Queued, blocked or running.
    Pending,
    Succeeded,
    Failed(WorkerFailure),
    Cancelled,
}

pub fn outcome_for(state: JobState, outputs: &JobOutputs) -> WorkerOutcome {
    match state {
        JobState::Queued | JobState::Blocked | JobState::Running => WorkerOutcome::Pending,
        JobState::Success => WorkerOutcome::Succeeded,
        JobState::Failed => WorkerOutcome::Failed(WorkerFailure::from_outputs(outputs)),
        JobState::Cancelled => WorkerOutcome::Cancelled,
    }
}

/// Outcome of lowering the memory budget, shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAdjustment {
    pub previous_limit: u32,
    /// Equals `previous_limit` when nothing changed.
    pub new_limit: u32,
    pub adjusted: bool,
}

/// `reported` is the limit the failed run used; it wins over the stored
/// preference when positive.
pub fn memory_adjustment(reported: Option<u32>, preference: u32) -> MemoryAdjustment {
    let previous_limit = reported.filter(|limit| *limit > 0).unwrap_or(preference);
    let lowered = previous_limit
        .saturating_sub(MEMORY_ADJUSTMENT_MB)
        .max(MIN_LIMIT_MB);
    let adjusted = lowered < previous_limit;
    MemoryAdjustment {
        previous_limit,
        new_limit: if adjusted { lowered } else { previous_limit },
        adjusted,
    }
}

/// Lowers and persists the memory budget for an out-of-memory failure.
/// Returns `None` when the failure is not eligible for recovery.
pub fn recover_from_failure(
    prefs: &Preferences,
    failure: &WorkerFailure,
) -> Option<MemoryAdjustment> {
    if !failure.is_memory_failure() || !prefs.use_process_runtime() {
        return None;
    }
    let adjustment = memory_adjustment(failure.previous_limit_mb, prefs.process_memory_limit_mb());
    if adjustment.adjusted {
        prefs.set_process_memory_limit(adjustment.new_limit);
    } else {
        info!(
            "memory limit already at floor ({} MB); not adjusted",
            adjustment.previous_limit
        );
    }
    Some(adjustment)
}

/// Job ids whose failure has been processed.
#[derive(Debug, Default)]
pub struct HandledFailures {
    ids: HashSet<String>,
}

impl HandledFailures {
    /// True the first time `job_id` is seen.
    pub fn first_time(&mut self, job_id: &str) -> bool {
        self.ids.insert(job_id.to_string())
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}
