//! Patch workflow of the manager: selection sanitizing, preflight checks,
//! the step sequence of a patch run, worker supervision with out-of-memory
//! recovery, and persistence of the patched result.

pub mod attempt;
pub mod error;
pub mod export;
pub mod finalizer;
pub mod inspect;
pub mod installer;
pub mod model;
pub mod paths;
pub mod preflight;
pub mod prefs;
pub mod process_worker;
pub mod repatch;
pub mod repo;
pub mod selection;
pub mod split;
pub mod start;
pub mod steps;
pub mod store;
pub mod supervisor;
pub mod worker;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use error::{StoreError, WorkflowError};
pub use model::{InstallType, Options, PatchSelection, SelectedApp};
pub use prefs::Preferences;
pub use workflow::{PatchWorkflow, WorkflowDeps, WorkflowRequest, WorkflowSnapshot, WorkflowState};
