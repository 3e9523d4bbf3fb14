use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Jobs(#[from] pmgr_jobs::JobError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("no stored original APK for {0}")]
    NoOriginalApk(String),
    #[error("no installed app record for {0}")]
    UnknownApp(String),
    #[error("no patches available for {0}")]
    NoPatches(String),
    #[error("default patch bundle is missing or disabled")]
    DefaultBundleDisabled,
    #[error("operation not allowed while {0:?}")]
    InvalidState(crate::workflow::WorkflowState),
}
