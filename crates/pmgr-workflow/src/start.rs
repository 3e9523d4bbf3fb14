//! Building the request for a fresh patch run of a selected app.

use tracing::{debug, info};

use crate::{
    error::WorkflowError,
    model::{BundleId, Options, PatchInfo, PatchSelection, ScopedBundles, SelectedApp, DEFAULT_SOURCE_UID},
    prefs::Preferences,
    repo::{blocking, Repositories},
    selection::{default_patch_filter, default_selection, prune_selection, sanitize_options},
    workflow::WorkflowRequest,
};

/// Packages that simple mode patches with the default bundle only.
pub const MAIN_APP_PACKAGES: [&str; 3] = [
    "com.google.android.youtube",
    "com.google.android.apps.youtube.music",
    "com.reddit.frontpage",
];

#[derive(Debug, Clone)]
pub enum StartPlan {
    /// Expert mode: the selection and options are offered for editing first.
    Review {
        request: WorkflowRequest,
        bundles: ScopedBundles,
    },
    Ready(WorkflowRequest),
}

impl StartPlan {
    pub fn request(&self) -> &WorkflowRequest {
        match self {
            StartPlan::Review { request, .. } | StartPlan::Ready(request) => request,
        }
    }
}

pub async fn prepare_request(
    repos: &Repositories,
    prefs: &Preferences,
    selected_app: SelectedApp,
    allow_incompatible: bool,
) -> Result<StartPlan, WorkflowError> {
    let package_name = selected_app.package_name().to_string();
    let bundles = {
        let bundles = repos.bundles.clone();
        let package_name = package_name.clone();
        let version = selected_app.version().map(str::to_string);
        blocking(move || bundles.scoped_bundles(&package_name, version.as_deref())).await?
    };
    if bundles.is_empty() {
        return Err(WorkflowError::NoPatches(package_name));
    }
    let filter = default_patch_filter(prefs.use_mount_install());

    if prefs.use_expert_mode() {
        let saved = saved_selection(repos, &package_name).await?;
        let selection = if saved.is_empty() {
            default_selection(&bundles, &package_name, selected_app.version(), true, &filter)
        } else {
            validate_saved(&saved, &bundles, &filter)
        };
        let stored_options = {
            let options = repos.options.clone();
            let package_name = package_name.clone();
            blocking(move || options.get_options(&package_name)).await?
        };
        let (options, dropped) = sanitize_options(&stored_options, &bundles);
        if dropped > 0 {
            debug!("ignored {dropped} stored option values for {package_name}");
        }
        return Ok(StartPlan::Review {
            request: WorkflowRequest {
                selected_app,
                selection,
                options,
            },
            bundles,
        });
    }

    let selection = if MAIN_APP_PACKAGES.contains(&package_name.as_str()) {
        let default_bundle = bundles
            .get(&DEFAULT_SOURCE_UID)
            .filter(|bundle| bundle.enabled)
            .ok_or(WorkflowError::DefaultBundleDisabled)?;
        let only_default = ScopedBundles::from([(DEFAULT_SOURCE_UID, default_bundle.clone())]);
        default_selection(
            &only_default,
            &package_name,
            selected_app.version(),
            allow_incompatible,
            &filter,
        )
    } else {
        default_selection(
            &bundles,
            &package_name,
            selected_app.version(),
            allow_incompatible,
            &filter,
        )
    };
    if selection.is_empty() {
        return Err(WorkflowError::NoPatches(package_name));
    }
    info!(
        "prepared {} patches from {} bundles for {package_name}",
        crate::selection::count_patches(&selection),
        selection.len()
    );
    Ok(StartPlan::Ready(WorkflowRequest {
        selected_app,
        selection,
        options: Options::new(),
    }))
}

/// Saved selection of the package, else of the patched app built from it.
async fn saved_selection(repos: &Repositories, package_name: &str) -> Result<PatchSelection, WorkflowError> {
    let selections = repos.selections.clone();
    let installed = repos.installed.clone();
    let package_name = package_name.to_string();
    blocking(move || {
        let selection = selections.get_selection(&package_name)?;
        if !selection.is_empty() {
            return Ok(selection);
        }
        let patched = installed
            .all()?
            .into_iter()
            .find(|app| app.original_package_name == package_name)
            .map(|app| app.current_package_name)
            .filter(|current| *current != package_name);
        match patched {
            Some(current) => selections.get_selection(&current),
            None => Ok(selection),
        }
    })
    .await
}

/// Keeps saved names that exist in an available bundle and pass `filter`.
fn validate_saved<F>(saved: &PatchSelection, bundles: &ScopedBundles, filter: F) -> PatchSelection
where
    F: Fn(BundleId, &PatchInfo) -> bool,
{
    let mut selection = PatchSelection::new();
    for (uid, names) in saved {
        let Some(bundle) = bundles.get(uid) else {
            continue;
        };
        let kept = names
            .iter()
            .filter(|name| bundle.patch(name).is_some_and(|patch| filter(*uid, patch)))
            .cloned()
            .collect();
        selection.insert(*uid, kept);
    }
    prune_selection(&mut selection);
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{BundleInfo, InstallType, InstalledApp, OptionValue},
        repo::{InstalledAppRepository, PatchOptionsRepository, PatchSelectionRepository},
        selection::set_option,
        test_support::{patch, TestEnv},
    };
    use std::collections::{BTreeMap, BTreeSet};

    fn bundle_info(uid: BundleId, enabled: bool, patches: Vec<PatchInfo>) -> BundleInfo {
        BundleInfo {
            uid,
            name: format!("bundle-{uid}"),
            version: Some("1.0.0".into()),
            display_name: None,
            enabled,
            patches,
        }
    }

    fn env(default_enabled: bool) -> TestEnv {
        let mut excluded = patch("Debugging");
        excluded.include = false;
        TestEnv::with_bundles(vec![
            bundle_info(0, default_enabled, vec![patch("Theme"), excluded, patch("GmsCore support")]),
            bundle_info(5, true, vec![patch("Extra")]),
        ])
    }

    fn app(package_name: &str) -> SelectedApp {
        SelectedApp::Installed {
            package_name: package_name.into(),
            version: None,
        }
    }

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn main_apps_use_only_the_default_bundle() {
        let env = env(true);
        let plan = prepare_request(&env.repos(), &env.prefs, app(MAIN_APP_PACKAGES[0]), false)
            .await
            .unwrap();
        let StartPlan::Ready(request) = plan else {
            panic!("simple mode starts right away");
        };
        assert_eq!(
            request.selection,
            PatchSelection::from([(0, names(&["GmsCore support", "Theme"]))])
        );

        env.prefs.update(|values| values.use_mount_install = true);
        let plan = prepare_request(&env.repos(), &env.prefs, app(MAIN_APP_PACKAGES[0]), false)
            .await
            .unwrap();
        assert_eq!(plan.request().selection[&0], names(&["Theme"]));
    }

    #[tokio::test]
    async fn main_apps_need_the_default_bundle_enabled() {
        let env = env(false);
        let err = prepare_request(&env.repos(), &env.prefs, app(MAIN_APP_PACKAGES[1]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DefaultBundleDisabled));

        let plan = prepare_request(&env.repos(), &env.prefs, app("org.other"), false)
            .await
            .unwrap();
        assert_eq!(
            plan.request().selection,
            PatchSelection::from([(5, names(&["Extra"]))])
        );
    }

    #[tokio::test]
    async fn nothing_to_apply_is_an_error() {
        let env = TestEnv::with_bundles(Vec::new());
        let err = prepare_request(&env.repos(), &env.prefs, app("org.other"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoPatches(pkg) if pkg == "org.other"));
    }

    #[tokio::test]
    async fn expert_mode_prefers_the_saved_selection_of_the_patched_app() {
        let env = env(true);
        env.prefs.update(|values| values.use_expert_mode = true);
        env.store
            .add_or_update(InstalledApp {
                current_package_name: "app.patched".into(),
                original_package_name: "org.other".into(),
                version: "1.0".into(),
                install_type: InstallType::Default,
                selection: PatchSelection::new(),
                selection_payload: None,
                bundle_versions: BTreeMap::new(),
                patched_at: None,
            })
            .unwrap();
        env.store
            .update_selection(
                "app.patched",
                &PatchSelection::from([(0, names(&["Theme", "Removed"])), (9, names(&["Gone"]))]),
            )
            .unwrap();
        let mut options = Options::new();
        set_option(&mut options, 0, "Theme", "undeclared", Some(OptionValue::Bool(true)));
        env.store.save_options("org.other", &options).unwrap();

        let plan = prepare_request(&env.repos(), &env.prefs, app("org.other"), false)
            .await
            .unwrap();
        let StartPlan::Review { request, bundles } = plan else {
            panic!("expert mode reviews first");
        };
        assert_eq!(request.selection, PatchSelection::from([(0, names(&["Theme"]))]));
        assert!(request.options.is_empty());
        assert_eq!(bundles.len(), 2);
    }

    #[tokio::test]
    async fn expert_mode_without_saved_selection_uses_defaults() {
        let env = env(true);
        env.prefs.update(|values| values.use_expert_mode = true);
        let plan = prepare_request(&env.repos(), &env.prefs, app("org.other"), false)
            .await
            .unwrap();
        assert_eq!(
            plan.request().selection,
            PatchSelection::from([(0, names(&["GmsCore support", "Theme"])), (5, names(&["Extra"]))])
        );
    }
}
