use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use pmgr_util::{now_millis, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

const ATTEMPTS_FILE_NAME: &str = "attempts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// The job's outcome has not been handled yet.
    Running,
    /// The failure was handled; only the kept input remains of interest.
    Failed,
}

/// Durable record of the job serving a workflow, so a recreated workflow
/// re-attaches instead of launching again. Removed once a success is
/// finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAttempt {
    pub job_id: String,
    pub package_name: String,
    pub state: AttemptState,
    /// Keep a temporary local input for a retry after memory recovery.
    #[serde(default)]
    pub keep_local_input: bool,
    /// Input copy owned by this attempt.
    #[serde(default)]
    pub input_file: Option<PathBuf>,
    pub updated_at: i64,
}

impl WorkflowAttempt {
    pub fn new(job_id: String, package_name: String) -> Self {
        Self {
            job_id,
            package_name,
            state: AttemptState::Running,
            keep_local_input: false,
            input_file: None,
            updated_at: now_millis(),
        }
    }
}

/// Attempts keyed by package name, one live attempt per package.
pub struct AttemptStore {
    path: Option<PathBuf>,
    attempts: Mutex<BTreeMap<String, WorkflowAttempt>>,
}

impl AttemptStore {
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join(ATTEMPTS_FILE_NAME);
        let attempts = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|err| {
                warn!("Failed to parse {}: {err}", path.display());
                BTreeMap::new()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            attempts: Mutex::new(attempts),
        }
    }

    pub fn open_default() -> Self {
        Self::open(&pmgr_util::state_dir())
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, package_name: &str) -> Option<WorkflowAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(package_name)
            .cloned()
    }

    pub fn save(&self, mut attempt: WorkflowAttempt) -> Result<(), StoreError> {
        attempt.updated_at = now_millis();
        self.mutate(|attempts| {
            attempts.insert(attempt.package_name.clone(), attempt);
        })
    }

    pub fn remove(&self, package_name: &str) -> Result<(), StoreError> {
        self.mutate(|attempts| {
            attempts.remove(package_name);
        })
    }

    fn mutate(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, WorkflowAttempt>),
    ) -> Result<(), StoreError> {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut attempts);
        if let Some(path) = &self.path {
            write_json_atomic(path, &*attempts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AttemptStore::open(dir.path());
            let mut attempt = WorkflowAttempt::new("job-1".into(), "com.example".into());
            attempt.keep_local_input = true;
            store.save(attempt).unwrap();
            store
                .save(WorkflowAttempt::new("job-2".into(), "com.other".into()))
                .unwrap();
            store.remove("com.other").unwrap();
        }

        let store = AttemptStore::open(dir.path());
        let attempt = store.get("com.example").unwrap();
        assert_eq!(attempt.job_id, "job-1");
        assert!(attempt.keep_local_input);
        assert!(store.get("com.other").is_none());
    }
}
