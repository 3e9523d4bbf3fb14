//! Storage collaborators of the workflow. Implementations are synchronous;
//! the workflow calls them from blocking tasks.

use std::{collections::BTreeMap, path::Path, path::PathBuf, sync::Arc};

use crate::{
    error::{StoreError, WorkflowError},
    model::{
        BundleId, BundleInfo, BundleSelection, InstalledApp, OriginalApk, Options, PatchSelection,
        ScopedBundles, SelectionPayload,
    },
};

pub trait BundleRepository: Send + Sync {
    /// Bundles narrowed to patches that apply to `package_name`.
    fn scoped_bundles(
        &self,
        package_name: &str,
        version: Option<&str>,
    ) -> Result<ScopedBundles, StoreError>;

    fn bundle_info(&self) -> Result<BTreeMap<BundleId, BundleInfo>, StoreError>;

    fn snapshot_selection(&self, selection: &PatchSelection) -> SelectionPayload {
        SelectionPayload {
            bundles: selection
                .iter()
                .map(|(uid, patches)| BundleSelection {
                    bundle_uid: *uid,
                    patches: patches.iter().cloned().collect(),
                    options: BTreeMap::new(),
                })
                .collect(),
        }
    }
}

pub trait OriginalApkRepository: Send + Sync {
    fn get(&self, package_name: &str) -> Result<Option<OriginalApk>, StoreError>;

    /// Copies `source` into durable storage, replacing any older original of
    /// the package, and returns the stored path.
    fn save_original_apk(
        &self,
        package_name: &str,
        version: &str,
        source: &Path,
    ) -> Result<PathBuf, StoreError>;

    fn mark_used(&self, package_name: &str) -> Result<(), StoreError>;

    fn delete(&self, package_name: &str) -> Result<(), StoreError>;
}

pub trait InstalledAppRepository: Send + Sync {
    fn get(&self, current_package_name: &str) -> Result<Option<InstalledApp>, StoreError>;

    fn all(&self) -> Result<Vec<InstalledApp>, StoreError>;

    fn applied_patches(&self, current_package_name: &str) -> Result<PatchSelection, StoreError> {
        Ok(self
            .get(current_package_name)?
            .map(|app| app.selection)
            .unwrap_or_default())
    }

    fn bundle_versions(
        &self,
        current_package_name: &str,
    ) -> Result<BTreeMap<BundleId, String>, StoreError> {
        Ok(self
            .get(current_package_name)?
            .map(|app| app.bundle_versions)
            .unwrap_or_default())
    }

    fn add_or_update(&self, app: InstalledApp) -> Result<(), StoreError>;

    fn delete(&self, current_package_name: &str) -> Result<(), StoreError>;
}

pub trait PatchSelectionRepository: Send + Sync {
    fn get_selection(&self, package_name: &str) -> Result<PatchSelection, StoreError>;

    fn update_selection(
        &self,
        package_name: &str,
        selection: &PatchSelection,
    ) -> Result<(), StoreError>;

    fn reset(&self, package_name: &str) -> Result<(), StoreError>;
}

pub trait PatchOptionsRepository: Send + Sync {
    fn get_options(&self, package_name: &str) -> Result<Options, StoreError>;

    fn save_options(&self, package_name: &str, options: &Options) -> Result<(), StoreError>;
}

/// The repositories a workflow reads and writes, shared by handle.
#[derive(Clone)]
pub struct Repositories {
    pub bundles: Arc<dyn BundleRepository>,
    pub originals: Arc<dyn OriginalApkRepository>,
    pub installed: Arc<dyn InstalledAppRepository>,
    pub selections: Arc<dyn PatchSelectionRepository>,
    pub options: Arc<dyn PatchOptionsRepository>,
}

impl Repositories {
    /// Every app-side repository served by one store.
    pub fn from_store<S>(store: Arc<S>, bundles: Arc<dyn BundleRepository>) -> Self
    where
        S: OriginalApkRepository
            + InstalledAppRepository
            + PatchSelectionRepository
            + PatchOptionsRepository
            + 'static,
    {
        Self {
            bundles,
            originals: store.clone(),
            installed: store.clone(),
            selections: store.clone(),
            options: store,
        }
    }
}

/// Runs a repository call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, WorkflowError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
