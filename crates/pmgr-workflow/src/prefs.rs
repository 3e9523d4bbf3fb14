use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
};

use pmgr_util::write_json_atomic;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::Options;

const PREFS_FILE_NAME: &str = "prefs.json";

pub const PROCESS_MEMORY_DEFAULT_MB: u32 = 512;
pub const PROCESS_MEMORY_MAX_MB: u32 = 1536;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceValues {
    pub use_expert_mode: bool,
    pub use_process_runtime: bool,
    pub process_memory_limit_mb: u32,
    pub strip_unused_native_libs: bool,
    pub disable_patch_version_compat_check: bool,
    pub use_mount_install: bool,
    pub export_name_template: Option<String>,
    /// Simple-mode option values per package name.
    pub default_options: BTreeMap<String, Options>,
}

impl Default for PreferenceValues {
    fn default() -> Self {
        Self {
            use_expert_mode: false,
            use_process_runtime: true,
            process_memory_limit_mb: PROCESS_MEMORY_DEFAULT_MB,
            strip_unused_native_libs: false,
            disable_patch_version_compat_check: false,
            use_mount_install: false,
            export_name_template: None,
            default_options: BTreeMap::new(),
        }
    }
}

/// Process-wide preference store, loaded once and shared by handle.
#[derive(Debug)]
pub struct Preferences {
    path: Option<PathBuf>,
    values: RwLock<PreferenceValues>,
}

impl Preferences {
    pub fn default_path() -> PathBuf {
        pmgr_util::state_file_path(PREFS_FILE_NAME)
    }

    pub fn load(path: &Path) -> Self {
        let values = match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PreferenceValues>(&data) {
                Ok(values) => values,
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    PreferenceValues::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                PreferenceValues::default()
            }
        };
        Self {
            path: Some(path.to_path_buf()),
            values: RwLock::new(values),
        }
    }

    /// A store that is never written to disk.
    pub fn in_memory(values: PreferenceValues) -> Self {
        Self {
            path: None,
            values: RwLock::new(values),
        }
    }

    pub fn snapshot(&self) -> PreferenceValues {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn use_expert_mode(&self) -> bool {
        self.snapshot().use_expert_mode
    }

    pub fn use_process_runtime(&self) -> bool {
        self.snapshot().use_process_runtime
    }

    pub fn use_mount_install(&self) -> bool {
        self.snapshot().use_mount_install
    }

    pub fn process_memory_limit_mb(&self) -> u32 {
        self.snapshot().process_memory_limit_mb
    }

    pub fn set_process_memory_limit(&self, limit_mb: u32) {
        let limit_mb = limit_mb.min(PROCESS_MEMORY_MAX_MB);
        info!("process memory limit set to {limit_mb} MB");
        self.update(|values| values.process_memory_limit_mb = limit_mb);
    }

    /// Option values simple mode applies to `package_name`.
    pub fn exported_default_options(&self, package_name: &str) -> Options {
        self.snapshot()
            .default_options
            .get(package_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies `f` and persists the result; write failures are logged.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PreferenceValues),
    {
        let snapshot = {
            let mut values = self
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut values);
            values.clone()
        };
        if let Some(path) = &self.path {
            if let Err(err) = write_json_atomic(path, &snapshot) {
                warn!("Failed to persist {}: {err}", path.display());
            }
        }
    }
}
