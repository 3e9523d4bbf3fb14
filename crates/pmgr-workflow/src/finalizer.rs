//! Persistence after a successful patch run: the original input, the
//! patched artifact, and the selection it was built from.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use pmgr_util::now_millis;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    error::WorkflowError,
    export::PatchedAppExportData,
    inspect::PackageInspector,
    model::{InstallType, InstalledApp, Options, PackageInfo, PatchSelection, SelectedApp},
    paths::Filesystem,
    repo::{blocking, Repositories},
    selection::{sanitize_options, sanitize_selection},
    split::is_split_archive,
};

/// What the finalizer needs to know about a finished run.
#[derive(Debug, Clone)]
pub struct FinalizeInput {
    pub package_name: String,
    pub selected_app: SelectedApp,
    /// Concrete input the worker patched, when known.
    pub input_file: Option<PathBuf>,
    pub output_file: PathBuf,
    pub selection: PatchSelection,
    pub options: Options,
}

impl FinalizeInput {
    fn selected_version(&self) -> Option<&str> {
        self.selected_app
            .version()
            .map(str::trim)
            .filter(|version| !version.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub current_package_name: String,
    pub version: String,
    pub selection: PatchSelection,
    pub options: Options,
    pub export: PatchedAppExportData,
    /// A durable copy of the patched artifact exists.
    pub saved_copy: bool,
}

pub struct Finalizer {
    repos: Repositories,
    inspector: Arc<dyn PackageInspector>,
    fs: Filesystem,
    save_lock: Mutex<()>,
}

impl Finalizer {
    pub fn new(repos: Repositories, inspector: Arc<dyn PackageInspector>, fs: Filesystem) -> Self {
        Self {
            repos,
            inspector,
            fs,
            save_lock: Mutex::new(()),
        }
    }

    /// Stores the pre-patch input so the app can be repatched later.
    ///
    /// Best effort: returns false when nothing was stored, including when an
    /// original of the same version already exists.
    pub async fn save_original_apk_if_needed(&self, input: &FinalizeInput) -> bool {
        let _guard = self.save_lock.lock().await;

        let Some(source) = original_source(input).await else {
            debug!("no original input to keep for {}", input.package_name);
            return false;
        };

        let version = match self.inspector.inspect_file(&input.output_file).await {
            Ok(info) => info.version().map(str::to_string),
            Err(err) => {
                debug!("could not read {}: {err}", input.output_file.display());
                None
            }
        }
        .or_else(|| input.selected_version().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

        let originals = self.repos.originals.clone();
        let package_name = input.package_name.clone();
        let result = blocking(move || {
            if let Some(existing) = originals.get(&package_name)? {
                if existing.version == version && existing.file_path.exists() {
                    return Ok(None);
                }
            }
            originals
                .save_original_apk(&package_name, &version, &source)
                .map(Some)
        })
        .await;

        match result {
            Ok(Some(path)) => {
                info!("saved original APK of {} to {}", input.package_name, path.display());
                true
            }
            Ok(None) => {
                debug!("original APK of {} already stored", input.package_name);
                false
            }
            Err(err) => {
                warn!("failed to save original APK of {}: {err}", input.package_name);
                false
            }
        }
    }

    /// Records the patched app after an install or a save.
    ///
    /// `None` means the app could not be recorded: its package info is
    /// unknown, the record could not be written, or `install_type` is
    /// [`InstallType::Saved`] and the durable copy failed.
    pub async fn persist_patched_app(
        &self,
        input: &FinalizeInput,
        current_package_name: Option<&str>,
        install_type: InstallType,
    ) -> Option<PersistOutcome> {
        let info = match self.inspector.inspect_file(&input.output_file).await {
            Ok(info) => info,
            Err(err) => {
                debug!("could not read {}: {err}", input.output_file.display());
                let lookup = current_package_name.unwrap_or(&input.package_name);
                match self.inspector.inspect_installed(lookup).await {
                    Ok(Some(info)) => info,
                    Ok(None) => {
                        error!("no package info for {lookup}");
                        return None;
                    }
                    Err(err) => {
                        error!("no package info for {lookup}: {err}");
                        return None;
                    }
                }
            }
        };

        self.save_original_apk_if_needed(input).await;

        let final_package = current_package_name
            .map(str::to_string)
            .unwrap_or_else(|| info.package_name.clone());
        let final_version = info
            .version()
            .or_else(|| input.selected_version())
            .unwrap_or("unspecified")
            .to_string();

        let saved_copy = self.fs.patched_app_file(&final_package, &final_version);
        let stale = match self.existing_record(&final_package).await {
            Some(existing) if existing.version != final_version => {
                Some(self.fs.patched_app_file(&final_package, &existing.version))
            }
            _ => None,
        };
        if let Err(err) = replace_copy(stale, input.output_file.clone(), saved_copy.clone()).await {
            if install_type == InstallType::Saved {
                error!("failed to save patched app to {}: {err}", saved_copy.display());
                return None;
            }
            warn!("failed to keep a copy of the patched app: {err}");
        }

        let (selection, options) = match self.sanitized(input).await {
            Ok(clean) => clean,
            Err(err) => {
                warn!("could not load bundles for {}: {err}", input.package_name);
                (input.selection.clone(), input.options.clone())
            }
        };
        let export = self.export_metadata(Some(&info), input, &selection).await;

        let repos = self.repos.clone();
        let original_package = input.package_name.clone();
        let record = {
            let selection = selection.clone();
            let options = options.clone();
            let final_package = final_package.clone();
            let final_version = final_version.clone();
            blocking(move || {
                let payload = repos.bundles.snapshot_selection(&selection);
                let bundle_versions = repos
                    .bundles
                    .bundle_info()?
                    .into_iter()
                    .filter(|(uid, _)| selection.contains_key(uid))
                    .filter_map(|(uid, info)| {
                        info.version
                            .filter(|version| !version.trim().is_empty())
                            .map(|version| (uid, version))
                    })
                    .collect();
                repos.installed.add_or_update(InstalledApp {
                    current_package_name: final_package,
                    original_package_name: original_package.clone(),
                    version: final_version,
                    install_type,
                    selection: selection.clone(),
                    selection_payload: Some(payload),
                    bundle_versions,
                    patched_at: Some(now_millis()),
                })?;
                repos.selections.update_selection(&original_package, &selection)?;
                repos.options.save_options(&original_package, &options)
            })
            .await
        };
        if let Err(err) = record {
            error!("failed to record patched app {final_package}: {err}");
            return None;
        }

        info!("recorded {final_package} {final_version} ({install_type:?})");
        Some(PersistOutcome {
            current_package_name: final_package,
            version: final_version,
            selection,
            options,
            export,
            saved_copy: install_type == InstallType::Saved || saved_copy.is_file(),
        })
    }

    /// Copies the output artifact to `destination` and records the app as
    /// saved. Fails only when the copy fails.
    pub async fn export(
        &self,
        input: &FinalizeInput,
        destination: &Path,
    ) -> Result<Option<PersistOutcome>, WorkflowError> {
        let source = input.output_file.clone();
        let dest = destination.to_path_buf();
        tokio::task::spawn_blocking(move || copy_file(&source, &dest)).await??;
        info!("exported patched app to {}", destination.display());
        Ok(self.persist_patched_app(input, None, InstallType::Saved).await)
    }

    /// Rebuilds export metadata from the output artifact.
    pub async fn refresh_export_metadata(&self, input: &FinalizeInput) -> PatchedAppExportData {
        let info = match self.inspector.inspect_file(&input.output_file).await {
            Ok(info) => Some(info),
            Err(err) => {
                debug!("could not read {}: {err}", input.output_file.display());
                None
            }
        };
        let selection = match self.sanitized(input).await {
            Ok((selection, _)) => selection,
            Err(_) => input.selection.clone(),
        };
        self.export_metadata(info.as_ref(), input, &selection).await
    }

    /// Names and versions of the bundles that contributed to `selection`.
    pub async fn export_metadata(
        &self,
        info: Option<&PackageInfo>,
        input: &FinalizeInput,
        selection: &PatchSelection,
    ) -> PatchedAppExportData {
        let mut data = PatchedAppExportData::new(
            info.map(|info| info.package_name.clone())
                .unwrap_or_else(|| input.package_name.clone()),
        );
        data.app_name = info.and_then(|info| info.label.clone());
        data.app_version = Some(
            info.and_then(PackageInfo::version)
                .or_else(|| input.selected_version())
                .unwrap_or("unspecified")
                .to_string(),
        );

        let repos = self.repos.clone();
        let package_name = input.package_name.clone();
        let version = input.selected_version().map(str::to_string);
        let uids: Vec<_> = selection.keys().copied().collect();
        let bundles = blocking(move || {
            let global = repos.bundles.bundle_info()?;
            let scoped = repos.bundles.scoped_bundles(&package_name, version.as_deref())?;
            Ok((global, scoped))
        })
        .await;

        match bundles {
            Ok((global, scoped)) => {
                let mut names = BTreeSet::new();
                for uid in &uids {
                    let name = global
                        .get(uid)
                        .map(|info| info.title().to_string())
                        .or_else(|| scoped.get(uid).map(|bundle| bundle.name.clone()));
                    if let Some(name) = name.filter(|name| !name.trim().is_empty()) {
                        if names.insert(name.clone()) {
                            data.bundle_names.push(name);
                        }
                    }
                }
                let mut versions = BTreeSet::new();
                for uid in &uids {
                    let version = global.get(uid).and_then(|info| info.version.clone());
                    if let Some(version) = version.filter(|v| !v.trim().is_empty()) {
                        if versions.insert(version.clone()) {
                            data.bundle_versions.push(version);
                        }
                    }
                }
            }
            Err(err) => warn!("export metadata without bundle info: {err}"),
        }
        data
    }

    async fn existing_record(&self, current_package_name: &str) -> Option<InstalledApp> {
        let installed = self.repos.installed.clone();
        let package = current_package_name.to_string();
        match blocking(move || installed.get(&package)).await {
            Ok(record) => record,
            Err(err) => {
                warn!("could not read installed app {current_package_name}: {err}");
                None
            }
        }
    }

    async fn sanitized(&self, input: &FinalizeInput) -> Result<(PatchSelection, Options), WorkflowError> {
        let bundles = self.repos.bundles.clone();
        let package_name = input.package_name.clone();
        let version = input.selected_version().map(str::to_string);
        let scoped = blocking(move || bundles.scoped_bundles(&package_name, version.as_deref())).await?;
        let selection = sanitize_selection(&input.selection, &scoped);
        let (options, rejected) = sanitize_options(&input.options, &scoped);
        if rejected > 0 {
            debug!("dropped {rejected} stale option values for {}", input.package_name);
        }
        Ok((selection, options))
    }
}

/// File to keep as the original: a split archive as picked by the user,
/// otherwise the input the worker resolved.
async fn original_source(input: &FinalizeInput) -> Option<PathBuf> {
    let candidate = match &input.selected_app {
        SelectedApp::Local { file, .. } => {
            let archive = file.clone();
            let split = tokio::task::spawn_blocking(move || is_split_archive(&archive))
                .await
                .unwrap_or(false);
            if split {
                file.clone()
            } else {
                input.input_file.clone().unwrap_or_else(|| file.clone())
            }
        }
        _ => input.input_file.clone()?,
    };
    candidate.exists().then_some(candidate)
}

async fn replace_copy(stale: Option<PathBuf>, source: PathBuf, target: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if let Some(stale) = stale.filter(|stale| *stale != target) {
            if let Err(err) = fs::remove_file(&stale) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to delete {}: {err}", stale.display());
                }
            }
        }
        copy_file(&source, &target)
    })
    .await
    .map_err(io::Error::other)?
}

fn copy_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::OriginalApk,
        repo::OriginalApkRepository,
        test_support::{package_info, TestEnv},
    };
    use std::collections::BTreeSet;

    fn input(env: &TestEnv, output: PathBuf) -> FinalizeInput {
        let file = env.dir.path().join("input.apk");
        fs::write(&file, b"original").unwrap();
        FinalizeInput {
            package_name: "com.example".into(),
            selected_app: SelectedApp::Local {
                package_name: "com.example".into(),
                version: Some("1.0".into()),
                file: file.clone(),
                temporary: false,
                resolved: true,
            },
            input_file: Some(file),
            output_file: output,
            selection: PatchSelection::from([(0, BTreeSet::from(["Theme".to_string(), "Gone".to_string()]))]),
            options: Options::new(),
        }
    }

    fn output(env: &TestEnv) -> PathBuf {
        let out = env.dir.path().join("out.apk");
        fs::write(&out, b"patched").unwrap();
        env.inspector.set_file(&out, package_info("com.example", "1.0"));
        out
    }

    #[tokio::test]
    async fn persists_record_copy_and_original() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let input = input(&env, output(&env));

        let outcome = finalizer
            .persist_patched_app(&input, None, InstallType::Default)
            .await
            .unwrap();
        assert!(outcome.saved_copy);
        assert_eq!(outcome.version, "1.0");
        assert_eq!(outcome.selection[&0], BTreeSet::from(["Theme".to_string()]));
        assert_eq!(outcome.export.bundle_names, vec!["Default patches".to_string()]);
        assert_eq!(outcome.export.bundle_versions, vec!["1.2.0".to_string()]);

        let record = env.installed("com.example").unwrap();
        assert_eq!(record.install_type, InstallType::Default);
        assert_eq!(record.bundle_versions[&0], "1.2.0");
        assert!(record.selection_payload.is_some());
        assert!(env.fs.patched_app_file("com.example", "1.0").exists());
        let original = OriginalApkRepository::get(env.store.as_ref(), "com.example").unwrap().unwrap();
        assert_eq!(original.version, "1.0");
    }

    #[tokio::test]
    async fn saved_install_fails_when_copy_fails() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let input = input(&env, output(&env));
        let target = env.fs.patched_app_file("com.example", "1.0");
        // A directory where the copy should go makes the copy fail.
        fs::create_dir_all(target.join("blocked")).unwrap();

        assert!(finalizer
            .persist_patched_app(&input, None, InstallType::Saved)
            .await
            .is_none());
        let outcome = finalizer
            .persist_patched_app(&input, None, InstallType::Default)
            .await
            .unwrap();
        assert!(!outcome.saved_copy);
        assert!(env.installed("com.example").is_some());
    }

    #[tokio::test]
    async fn falls_back_to_installed_package_info() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let out = env.dir.path().join("unreadable.apk");
        fs::write(&out, b"x").unwrap();
        let input = input(&env, out);

        assert!(finalizer
            .persist_patched_app(&input, Some("app.patched"), InstallType::Mount)
            .await
            .is_none());

        env.inspector
            .set_installed("app.patched", Some(package_info("app.patched", "2.0")));
        let outcome = finalizer
            .persist_patched_app(&input, Some("app.patched"), InstallType::Mount)
            .await
            .unwrap();
        assert_eq!(outcome.current_package_name, "app.patched");
        assert_eq!(outcome.version, "2.0");
    }

    #[tokio::test]
    async fn new_version_replaces_old_patched_copy() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let out = output(&env);
        let input = input(&env, out.clone());
        finalizer
            .persist_patched_app(&input, None, InstallType::Default)
            .await
            .unwrap();

        env.inspector.set_file(&out, package_info("com.example", "1.1"));
        finalizer
            .persist_patched_app(&input, None, InstallType::Default)
            .await
            .unwrap();
        assert!(!env.fs.patched_app_file("com.example", "1.0").exists());
        assert!(env.fs.patched_app_file("com.example", "1.1").exists());
    }

    #[tokio::test]
    async fn original_of_same_version_is_saved_once() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let input = input(&env, output(&env));

        let (first, second) = tokio::join!(
            finalizer.save_original_apk_if_needed(&input),
            finalizer.save_original_apk_if_needed(&input)
        );
        assert!(first ^ second);
        let stored: OriginalApk = OriginalApkRepository::get(env.store.as_ref(), "com.example")
            .unwrap()
            .unwrap();
        assert!(stored.file_path.exists());
    }

    #[tokio::test]
    async fn export_copies_then_records_as_saved() {
        let env = TestEnv::new();
        let finalizer = env.finalizer();
        let input = input(&env, output(&env));
        let dest = env.dir.path().join("exports/YouTube.apk");

        let outcome = finalizer.export(&input, &dest).await.unwrap().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"patched");
        assert!(outcome.saved_copy);
        assert_eq!(
            env.installed("com.example").unwrap().install_type,
            InstallType::Saved
        );

        let missing = FinalizeInput {
            output_file: env.dir.path().join("nope.apk"),
            ..input
        };
        assert!(finalizer.export(&missing, &dest).await.is_err());
    }
}
