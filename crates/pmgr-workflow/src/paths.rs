use std::{
    fs, io,
    path::{Path, PathBuf},
};

use pmgr_util::sanitize_filename;

/// Directory layout under the data root.
#[derive(Debug, Clone)]
pub struct Filesystem {
    /// Scratch space, emptied every time the store is opened.
    pub temp_dir: PathBuf,
    /// Scratch space that survives restarts; safe to record in attempts.
    pub ui_temp_dir: PathBuf,
    pub patched_apps_dir: PathBuf,
    pub original_apks_dir: PathBuf,
}

impl Filesystem {
    pub fn open(root: &Path) -> io::Result<Self> {
        let temp_dir = root.join("ephemeral");
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        fs::create_dir_all(&temp_dir)?;

        let layout = Self {
            temp_dir,
            ui_temp_dir: root.join("ui_ephemeral"),
            patched_apps_dir: root.join("patched-apps"),
            original_apks_dir: root.join("original-apks"),
        };
        fs::create_dir_all(&layout.ui_temp_dir)?;
        fs::create_dir_all(&layout.patched_apps_dir)?;
        fs::create_dir_all(&layout.original_apks_dir)?;
        Ok(layout)
    }

    pub fn open_default() -> io::Result<Self> {
        Self::open(&pmgr_util::data_dir())
    }

    /// Durable location of the patched APK for `package_name`/`version`.
    pub fn patched_app_file(&self, package_name: &str, version: &str) -> PathBuf {
        self.patched_apps_dir
            .join(format!("{}_{}.apk", sanitize_filename(package_name), safe_version(version)))
    }

    pub fn original_apk_file(&self, package_name: &str, version: &str) -> PathBuf {
        self.original_apks_dir.join(format!(
            "{}_{}_original.apk",
            sanitize_filename(package_name),
            safe_version(version)
        ))
    }
}

fn safe_version(version: &str) -> String {
    if version.trim().is_empty() {
        sanitize_filename("unspecified")
    } else {
        sanitize_filename(version)
    }
}
