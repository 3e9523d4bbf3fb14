use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use pmgr_util::{now_millis, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    model::{BundleId, BundleInfo, InstalledApp, OriginalApk, Options, PatchSelection, ScopedBundle, ScopedBundles},
    paths::Filesystem,
    repo::{
        BundleRepository, InstalledAppRepository, OriginalApkRepository, PatchOptionsRepository,
        PatchSelectionRepository,
    },
};

const LIBRARY_FILE_NAME: &str = "library.json";
const BUNDLES_FILE_NAME: &str = "bundles.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedLibrary {
    installed_apps: BTreeMap<String, InstalledApp>,
    original_apks: BTreeMap<String, OriginalApk>,
    selections: BTreeMap<String, PatchSelection>,
    options: BTreeMap<String, Options>,
}

fn read_json<T>(path: &Path) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<T>(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                T::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), err);
            }
            T::default()
        }
    }
}

/// JSON-file backed implementation of every app-side repository.
pub struct JsonStore {
    path: PathBuf,
    fs: Filesystem,
    state: Mutex<PersistedLibrary>,
}

impl JsonStore {
    pub fn open(state_dir: &Path, fs: Filesystem) -> Self {
        let path = state_dir.join(LIBRARY_FILE_NAME);
        let state = read_json::<PersistedLibrary>(&path);
        Self {
            path,
            fs,
            state: Mutex::new(state),
        }
    }

    pub fn open_default(fs: Filesystem) -> Self {
        Self::open(&pmgr_util::state_dir(), fs)
    }

    fn read<R>(&self, f: impl FnOnce(&PersistedLibrary) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut PersistedLibrary) -> R) -> Result<R, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let out = f(&mut state);
        write_json_atomic(&self.path, &*state)?;
        Ok(out)
    }
}

impl OriginalApkRepository for JsonStore {
    fn get(&self, package_name: &str) -> Result<Option<OriginalApk>, StoreError> {
        Ok(self.read(|state| state.original_apks.get(package_name).cloned()))
    }

    fn save_original_apk(
        &self,
        package_name: &str,
        version: &str,
        source: &Path,
    ) -> Result<PathBuf, StoreError> {
        if let Some(existing) = OriginalApkRepository::get(self, package_name)? {
            if existing.file_path.exists() && existing.file_path != source {
                fs::remove_file(&existing.file_path)?;
                debug!("Deleted old original APK for {package_name}");
            }
        }

        let target = self.fs.original_apk_file(package_name, version);
        if target != source {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &target)?;
        }
        let file_size = fs::metadata(&target)?.len();

        let record = OriginalApk {
            package_name: package_name.to_string(),
            version: version.to_string(),
            file_path: target.clone(),
            last_used: now_millis(),
            file_size,
        };
        self.write(|state| {
            state
                .original_apks
                .insert(package_name.to_string(), record);
        })?;
        debug!("Saved original APK for {package_name} v{version}");
        Ok(target)
    }

    fn mark_used(&self, package_name: &str) -> Result<(), StoreError> {
        self.write(|state| {
            if let Some(apk) = state.original_apks.get_mut(package_name) {
                apk.last_used = now_millis();
            }
        })
    }

    fn delete(&self, package_name: &str) -> Result<(), StoreError> {
        let removed = self.write(|state| state.original_apks.remove(package_name))?;
        if let Some(apk) = removed {
            if apk.file_path.exists() {
                fs::remove_file(&apk.file_path)?;
            }
        }
        Ok(())
    }
}

impl InstalledAppRepository for JsonStore {
    fn get(&self, current_package_name: &str) -> Result<Option<InstalledApp>, StoreError> {
        Ok(self.read(|state| state.installed_apps.get(current_package_name).cloned()))
    }

    fn all(&self) -> Result<Vec<InstalledApp>, StoreError> {
        Ok(self.read(|state| state.installed_apps.values().cloned().collect()))
    }

    fn add_or_update(&self, app: InstalledApp) -> Result<(), StoreError> {
        self.write(|state| {
            state
                .installed_apps
                .insert(app.current_package_name.clone(), app);
        })
    }

    fn delete(&self, current_package_name: &str) -> Result<(), StoreError> {
        self.write(|state| {
            state.installed_apps.remove(current_package_name);
        })
    }
}

impl PatchSelectionRepository for JsonStore {
    fn get_selection(&self, package_name: &str) -> Result<PatchSelection, StoreError> {
        Ok(self.read(|state| state.selections.get(package_name).cloned().unwrap_or_default()))
    }

    fn update_selection(
        &self,
        package_name: &str,
        selection: &PatchSelection,
    ) -> Result<(), StoreError> {
        let mut selection = selection.clone();
        crate::selection::prune_selection(&mut selection);
        self.write(|state| {
            state.selections.insert(package_name.to_string(), selection);
        })
    }

    fn reset(&self, package_name: &str) -> Result<(), StoreError> {
        self.write(|state| {
            state.selections.remove(package_name);
        })
    }
}

impl PatchOptionsRepository for JsonStore {
    fn get_options(&self, package_name: &str) -> Result<Options, StoreError> {
        Ok(self.read(|state| state.options.get(package_name).cloned().unwrap_or_default()))
    }

    fn save_options(&self, package_name: &str, options: &Options) -> Result<(), StoreError> {
        let mut options = options.clone();
        crate::selection::prune_options(&mut options);
        self.write(|state| {
            state.options.insert(package_name.to_string(), options);
        })
    }
}

/// Patch bundles read from `bundles.json`.
pub struct BundleCatalog {
    bundles: BTreeMap<BundleId, BundleInfo>,
}

impl BundleCatalog {
    pub fn new(bundles: Vec<BundleInfo>) -> Self {
        Self {
            bundles: bundles.into_iter().map(|b| (b.uid, b)).collect(),
        }
    }

    pub fn default_path() -> PathBuf {
        pmgr_util::data_dir().join(BUNDLES_FILE_NAME)
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let data = fs::read_to_string(path)?;
        let bundles: Vec<BundleInfo> = serde_json::from_str(&data)?;
        Ok(Self::new(bundles))
    }
}

impl BundleRepository for BundleCatalog {
    fn scoped_bundles(
        &self,
        package_name: &str,
        _version: Option<&str>,
    ) -> Result<ScopedBundles, StoreError> {
        Ok(self
            .bundles
            .values()
            .map(|info| {
                let mut scoped = ScopedBundle::from(info);
                scoped.patches.retain(|patch| match &patch.compatible_packages {
                    None => true,
                    Some(packages) => packages.iter().any(|p| p.package_name == package_name),
                });
                (info.uid, scoped)
            })
            .collect())
    }

    fn bundle_info(&self) -> Result<BTreeMap<BundleId, BundleInfo>, StoreError> {
        Ok(self.bundles.clone())
    }
}
