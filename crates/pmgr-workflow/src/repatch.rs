//! Patching an installed app again from its stored original APK.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use tracing::{info, warn};

use crate::{
    error::WorkflowError,
    model::{BundleId, BundleInfo, InstalledApp, OptionValue, Options, PatchSelection, ScopedBundles, SelectedApp},
    prefs::Preferences,
    repo::{blocking, Repositories},
    selection::{count_patches, prune_options},
    workflow::WorkflowRequest,
};

/// Everything needed to rebuild an installed app.
#[derive(Debug, Clone, PartialEq)]
pub struct RepatchPlan {
    pub current_package_name: String,
    pub original_package_name: String,
    pub original_version: String,
    pub original_file: PathBuf,
    pub selection: PatchSelection,
    pub options: Options,
    /// Saved patch names dropped because no current bundle provides them.
    pub removed_patches: usize,
}

impl RepatchPlan {
    pub fn request(&self, selection: PatchSelection, options: Options) -> WorkflowRequest {
        WorkflowRequest {
            selected_app: SelectedApp::Local {
                package_name: self.original_package_name.clone(),
                version: Some(self.original_version.clone()),
                file: self.original_file.clone(),
                temporary: false,
                resolved: true,
            },
            selection,
            options,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RepatchStart {
    /// Expert mode: review against the bundles the app was built with.
    Review { plan: RepatchPlan, bundles: ScopedBundles },
    Ready(WorkflowRequest),
}

/// Keeps bundles that still exist and, inside them, patches they still
/// provide. Bundles left empty are dropped.
pub fn validate_selection(saved: &PatchSelection, bundles: &BTreeMap<BundleId, BundleInfo>) -> PatchSelection {
    let mut out = PatchSelection::new();
    for (uid, names) in saved {
        let Some(bundle) = bundles.get(uid) else {
            continue;
        };
        let kept: BTreeSet<String> = names
            .iter()
            .filter(|name| bundle.patches.iter().any(|patch| &patch.name == *name))
            .cloned()
            .collect();
        if !kept.is_empty() {
            out.insert(*uid, kept);
        }
    }
    out
}

/// Keeps values whose bundle, patch and declared key still exist and whose
/// type matches the declaration.
pub fn validate_options(saved: &Options, bundles: &BTreeMap<BundleId, BundleInfo>) -> Options {
    let mut out = Options::new();
    for (uid, patch_options) in saved {
        let Some(bundle) = bundles.get(uid) else {
            continue;
        };
        let mut kept_patches = BTreeMap::new();
        for (patch_name, values) in patch_options {
            let Some(patch) = bundle.patches.iter().find(|patch| &patch.name == patch_name) else {
                continue;
            };
            let kept: BTreeMap<String, OptionValue> = values
                .iter()
                .filter(|(key, value)| {
                    patch
                        .option_schema(key)
                        .is_some_and(|schema| value.matches(schema.kind))
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            kept_patches.insert(patch_name.clone(), kept);
        }
        out.insert(*uid, kept_patches);
    }
    prune_options(&mut out);
    out
}

pub struct Repatcher {
    repos: Repositories,
}

impl Repatcher {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Validates the app's saved selection and options against the current
    /// bundles, persisting the cleaned data when anything was dropped.
    pub async fn plan(&self, current_package_name: &str) -> Result<RepatchPlan, WorkflowError> {
        let repos = self.repos.clone();
        let current = current_package_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<RepatchPlan, WorkflowError> {
            let app = repos
                .installed
                .get(&current)?
                .ok_or_else(|| WorkflowError::UnknownApp(current.clone()))?;
            let original = repos
                .originals
                .get(&app.original_package_name)?
                .filter(|original| original.file_path.exists())
                .ok_or_else(|| WorkflowError::NoOriginalApk(app.original_package_name.clone()))?;

            let bundles = repos.bundles.bundle_info()?;
            let saved = applied_selection(&repos, &app, &bundles)?;
            let saved_options = repos.options.get_options(&app.original_package_name)?;
            let selection = validate_selection(&saved, &bundles);
            let options = validate_options(&saved_options, &bundles);

            let removed_patches = count_patches(&saved) - count_patches(&selection);
            if removed_patches > 0 {
                warn!("dropped {removed_patches} unavailable patches from the saved selection of {current}");
                repos.installed.add_or_update(InstalledApp {
                    selection: selection.clone(),
                    ..app.clone()
                })?;
                repos.options.save_options(&app.original_package_name, &options)?;
            }

            Ok(RepatchPlan {
                current_package_name: current,
                original_package_name: app.original_package_name,
                original_version: original.version,
                original_file: original.file_path,
                selection,
                options,
                removed_patches,
            })
        })
        .await?
    }

    /// Expert mode reviews the plan first; simple mode starts right away.
    pub async fn start(&self, prefs: &Preferences, current_package_name: &str) -> Result<RepatchStart, WorkflowError> {
        let plan = self.plan(current_package_name).await?;
        if prefs.use_expert_mode() {
            let bundles = {
                let repos = self.repos.clone();
                let package_name = plan.original_package_name.clone();
                let version = plan.original_version.clone();
                blocking(move || repos.bundles.scoped_bundles(&package_name, Some(&version))).await?
            };
            let bundles = bundles
                .into_iter()
                .filter(|(uid, _)| plan.selection.contains_key(uid))
                .collect();
            return Ok(RepatchStart::Review { plan, bundles });
        }
        self.mark_used(&plan).await?;
        let request = plan.request(plan.selection.clone(), plan.options.clone());
        Ok(RepatchStart::Ready(request))
    }

    /// Continues a reviewed plan with the edited selection and options.
    pub async fn proceed(
        &self,
        plan: &RepatchPlan,
        selection: PatchSelection,
        options: Options,
    ) -> Result<WorkflowRequest, WorkflowError> {
        let exists = {
            let path = plan.original_file.clone();
            tokio::task::spawn_blocking(move || path.exists()).await?
        };
        if !exists {
            return Err(WorkflowError::NoOriginalApk(plan.original_package_name.clone()));
        }
        self.mark_used(plan).await?;
        let repos = self.repos.clone();
        let package_name = plan.original_package_name.clone();
        let saved = options.clone();
        blocking(move || repos.options.save_options(&package_name, &saved)).await?;
        Ok(plan.request(selection, options))
    }

    async fn mark_used(&self, plan: &RepatchPlan) -> Result<(), WorkflowError> {
        let repos = self.repos.clone();
        let package_name = plan.original_package_name.clone();
        blocking(move || repos.originals.mark_used(&package_name)).await?;
        info!("repatching {} from its stored original", plan.current_package_name);
        Ok(())
    }
}

/// The installed record's selection, else its payload remapped onto the
/// bundles that still exist.
fn applied_selection(
    repos: &Repositories,
    app: &InstalledApp,
    bundles: &BTreeMap<BundleId, BundleInfo>,
) -> Result<PatchSelection, crate::error::StoreError> {
    let selection = repos.installed.applied_patches(&app.current_package_name)?;
    if !selection.is_empty() {
        return Ok(selection);
    }
    let Some(payload) = &app.selection_payload else {
        return Ok(PatchSelection::new());
    };
    let known: BTreeSet<BundleId> = bundles.keys().copied().collect();
    let (remapped_payload, remapped) = payload.remap(&known);
    if remapped.is_empty() {
        return Ok(payload.to_selection());
    }
    repos.installed.add_or_update(InstalledApp {
        selection: remapped.clone(),
        selection_payload: Some(remapped_payload),
        ..app.clone()
    })?;
    Ok(remapped)
}
