//! Contract between the workflow and whatever executes a patch run.
//!
//! A worker reports back over one ordered event stream (the job's progress
//! channel) and finishes with [`JobOutputs`]: empty on success, or a
//! [`WorkerFailure`] encoded with the keys below.

use std::path::PathBuf;

use futures_util::future::BoxFuture;
use pmgr_jobs::{JobContext, JobOutputs};
use serde::{Deserialize, Serialize};

use crate::{
    model::{Options, PatchSelection, SelectedApp},
    steps::StepState,
};

pub const PROCESS_EXIT_CODE_KEY: &str = "process_exit_code";
pub const PROCESS_PREVIOUS_LIMIT_KEY: &str = "process_previous_limit";
pub const PROCESS_FAILURE_MESSAGE_KEY: &str = "process_failure_message";

/// Exit code of a patcher process that ran out of heap.
pub const OOM_EXIT_CODE: i32 = 134;
/// Exit code of a patcher process killed by the kernel, usually for memory.
pub const SIGKILL_EXIT_CODE: i32 = 137;

pub fn is_memory_exit_code(code: i32) -> bool {
    code == OOM_EXIT_CODE || code == SIGKILL_EXIT_CODE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Update of the current step; a completed state advances the cursor.
    Progress {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        state: Option<StepState>,
        #[serde(default)]
        message: Option<String>,
    },
    /// The concrete input file is known.
    InputResolved {
        file: PathBuf,
        needs_split: bool,
        #[serde(default)]
        merged: bool,
    },
    PatchCompleted {
        #[serde(default)]
        name: Option<String>,
    },
    DownloadProgress {
        downloaded: u64,
        #[serde(default)]
        total: Option<u64>,
    },
}

impl WorkerEvent {
    pub fn step_state(state: StepState) -> Self {
        WorkerEvent::Progress {
            name: None,
            state: Some(state),
            message: None,
        }
    }
}

/// Everything a worker needs for one run.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub input: SelectedApp,
    pub output: PathBuf,
    pub package_name: String,
    pub selection: PatchSelection,
    pub options: Options,
    /// Scratch directory for resolved inputs.
    pub work_dir: PathBuf,
}

impl WorkerArgs {
    pub fn patch_count(&self) -> usize {
        crate::selection::count_patches(&self.selection)
    }
}

/// Structured failure reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerFailure {
    pub exit_code: Option<i32>,
    /// Memory limit in effect when the run failed.
    pub previous_limit_mb: Option<u32>,
    pub message: Option<String>,
}

impl WorkerFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_memory_failure(&self) -> bool {
        self.exit_code.is_some_and(is_memory_exit_code)
    }

    pub fn to_outputs(&self) -> JobOutputs {
        let mut outputs = JobOutputs::new();
        if let Some(code) = self.exit_code {
            outputs.insert(PROCESS_EXIT_CODE_KEY.into(), code.to_string());
        }
        if let Some(limit) = self.previous_limit_mb {
            outputs.insert(PROCESS_PREVIOUS_LIMIT_KEY.into(), limit.to_string());
        }
        if let Some(message) = &self.message {
            outputs.insert(PROCESS_FAILURE_MESSAGE_KEY.into(), message.clone());
        }
        outputs
    }

    pub fn from_outputs(outputs: &JobOutputs) -> Self {
        Self {
            exit_code: outputs
                .get(PROCESS_EXIT_CODE_KEY)
                .and_then(|code| code.parse().ok()),
            previous_limit_mb: outputs
                .get(PROCESS_PREVIOUS_LIMIT_KEY)
                .and_then(|limit| limit.parse().ok()),
            message: outputs.get(PROCESS_FAILURE_MESSAGE_KEY).cloned(),
        }
    }
}

/// Executes one patch run inside a job.
pub trait PatchWorker: Send + Sync + 'static {
    fn run(
        &self,
        args: WorkerArgs,
        ctx: JobContext<WorkerEvent>,
    ) -> BoxFuture<'static, Result<JobOutputs, JobOutputs>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_survives_job_outputs() {
        let failure = WorkerFailure {
            exit_code: Some(OOM_EXIT_CODE),
            previous_limit_mb: Some(700),
            message: Some("Process exited with code 134".into()),
        };
        let outputs = failure.to_outputs();
        assert_eq!(outputs[PROCESS_EXIT_CODE_KEY], "134");
        assert_eq!(WorkerFailure::from_outputs(&outputs), failure);
        assert!(failure.is_memory_failure());
        assert!(!WorkerFailure::message("boom").is_memory_failure());
    }

    #[test]
    fn events_parse_from_line_protocol_json() {
        let event: WorkerEvent =
            serde_json::from_str(r#"{"event":"progress","state":"completed"}"#).unwrap();
        assert_eq!(event, WorkerEvent::step_state(StepState::Completed));

        let event: WorkerEvent =
            serde_json::from_str(r#"{"event":"patch_completed","name":"Theme"}"#).unwrap();
        assert!(matches!(event, WorkerEvent::PatchCompleted { name: Some(n) } if n == "Theme"));
    }
}
