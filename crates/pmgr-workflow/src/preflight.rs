//! Checks that run before a patch job is launched.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    model::{BundleId, OptionKind, OptionValue, Options, PatchSelection, ScopedBundles},
    prefs::Preferences,
    selection::{missing_patches, sanitize_selection},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidationFailure {
    Missing {
        bundle_uid: BundleId,
        patch_name: String,
        key: String,
        path: PathBuf,
    },
    NotReadable {
        bundle_uid: BundleId,
        patch_name: String,
        key: String,
        path: PathBuf,
    },
}

impl PathValidationFailure {
    pub fn patch_name(&self) -> &str {
        match self {
            PathValidationFailure::Missing { patch_name, .. }
            | PathValidationFailure::NotReadable { patch_name, .. } => patch_name,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            PathValidationFailure::Missing { path, .. }
            | PathValidationFailure::NotReadable { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreflightOutcome {
    MissingPatches(Vec<String>),
    InaccessiblePaths(Vec<PathValidationFailure>),
    /// The path check itself did not complete.
    CheckFailed(String),
    Ready { options: Options },
}

/// Requested patches that the current bundles no longer provide.
pub fn check_missing_patches(requested: &PatchSelection, bundles: &ScopedBundles) -> Vec<String> {
    let sanitized = sanitize_selection(requested, bundles);
    missing_patches(requested, &sanitized)
}

/// Explicit options in expert mode, the package's stored defaults otherwise.
pub fn effective_options(prefs: &Preferences, package_name: &str, explicit: &Options) -> Options {
    if prefs.use_expert_mode() {
        explicit.clone()
    } else {
        prefs.exported_default_options(package_name)
    }
}

/// Every path-valued option that cannot be read. Blocking.
pub fn validate_option_paths(options: &Options, bundles: &ScopedBundles) -> Vec<PathValidationFailure> {
    let mut failures = Vec::new();
    for (uid, patches) in options {
        for (patch_name, values) in patches {
            for (key, value) in values {
                let declared_path = bundles
                    .get(uid)
                    .and_then(|bundle| bundle.patch(patch_name))
                    .and_then(|patch| patch.option_schema(key))
                    .is_some_and(|schema| schema.kind == OptionKind::Path);
                let path = match value {
                    OptionValue::Path(path) => path.clone(),
                    OptionValue::String(raw) if declared_path && !raw.trim().is_empty() => {
                        pmgr_util::expand_user(raw.trim())
                    }
                    _ => continue,
                };
                if let Some(failure) = check_path(*uid, patch_name, key, path) {
                    failures.push(failure);
                }
            }
        }
    }
    failures
}

fn check_path(
    bundle_uid: BundleId,
    patch_name: &str,
    key: &str,
    path: PathBuf,
) -> Option<PathValidationFailure> {
    if !path.exists() {
        return Some(PathValidationFailure::Missing {
            bundle_uid,
            patch_name: patch_name.to_string(),
            key: key.to_string(),
            path,
        });
    }
    let readable = if path.is_dir() {
        fs::read_dir(&path).is_ok()
    } else {
        fs::File::open(&path).is_ok()
    };
    if readable {
        debug!("option path ok: {}", path.display());
        return None;
    }
    Some(PathValidationFailure::NotReadable {
        bundle_uid,
        patch_name: patch_name.to_string(),
        key: key.to_string(),
        path,
    })
}

/// Full preflight: missing patches first, then option paths.
pub async fn run_preflight(
    requested: &PatchSelection,
    options: Options,
    bundles: &ScopedBundles,
) -> PreflightOutcome {
    let missing = check_missing_patches(requested, bundles);
    if !missing.is_empty() {
        warn!("{} requested patches are unavailable", missing.len());
        return PreflightOutcome::MissingPatches(missing);
    }
    check_paths(options, bundles).await
}

/// Path step on its own, off the async executor.
pub async fn check_paths(options: Options, bundles: &ScopedBundles) -> PreflightOutcome {
    check_paths_with(options, bundles, validate_option_paths).await
}

async fn check_paths_with<F>(options: Options, bundles: &ScopedBundles, validate: F) -> PreflightOutcome
where
    F: FnOnce(&Options, &ScopedBundles) -> Vec<PathValidationFailure> + Send + 'static,
{
    let scoped = bundles.clone();
    let checked = options.clone();
    let failures = match tokio::task::spawn_blocking(move || validate(&checked, &scoped)).await {
        Ok(failures) => failures,
        Err(err) => {
            warn!("option path validation did not finish: {err}");
            return PreflightOutcome::CheckFailed(format!("Option paths could not be checked: {err}"));
        }
    };
    if failures.is_empty() {
        PreflightOutcome::Ready { options }
    } else {
        PreflightOutcome::InaccessiblePaths(failures)
    }
}
