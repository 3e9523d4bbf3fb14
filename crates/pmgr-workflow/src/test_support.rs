//! Fakes and fixtures shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt};
use pmgr_jobs::{JobContext, JobOutputs, JobService, LogLevel};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
    attempt::AttemptStore,
    finalizer::Finalizer,
    inspect::{InspectError, PackageInspector},
    model::{
        BundleId, BundleInfo, InstalledApp, OptionKind, OptionSchema, PackageInfo, PatchInfo,
        ScopedBundle, ScopedBundles,
    },
    paths::Filesystem,
    prefs::{PreferenceValues, Preferences},
    repo::{InstalledAppRepository, Repositories},
    store::{BundleCatalog, JsonStore},
    worker::{PatchWorker, WorkerArgs, WorkerEvent},
    workflow::WorkflowDeps,
};

pub fn patch(name: &str) -> PatchInfo {
    PatchInfo {
        name: name.to_string(),
        description: None,
        include: true,
        compatible_packages: None,
        options: None,
    }
}

pub fn patch_with_options(name: &str, options: &[(&str, OptionKind)]) -> PatchInfo {
    PatchInfo {
        options: Some(
            options
                .iter()
                .map(|(key, kind)| OptionSchema {
                    key: key.to_string(),
                    kind: *kind,
                    title: None,
                    required: false,
                })
                .collect(),
        ),
        ..patch(name)
    }
}

pub fn bundle(uid: BundleId, patches: Vec<PatchInfo>) -> ScopedBundle {
    ScopedBundle {
        uid,
        name: format!("bundle-{uid}"),
        version: Some("1.0.0".into()),
        enabled: true,
        patches,
    }
}

pub fn scoped(bundles: Vec<ScopedBundle>) -> ScopedBundles {
    bundles.into_iter().map(|bundle| (bundle.uid, bundle)).collect()
}

pub fn package_info(package_name: &str, version: &str) -> PackageInfo {
    PackageInfo {
        package_name: package_name.to_string(),
        version_name: Some(version.to_string()),
        version_code: Some(1),
        label: None,
        last_update: None,
    }
}

/// Answers from tables filled in by the test.
#[derive(Default)]
pub struct FakeInspector {
    files: Mutex<HashMap<PathBuf, PackageInfo>>,
    installed: Mutex<HashMap<String, PackageInfo>>,
    failing_installed_reads: Mutex<usize>,
    file_delay: Mutex<Option<Duration>>,
}

impl FakeInspector {
    pub fn set_file(&self, path: &Path, info: PackageInfo) {
        self.files.lock().unwrap().insert(path.to_path_buf(), info);
    }

    pub fn set_installed(&self, package_name: &str, info: Option<PackageInfo>) {
        let mut installed = self.installed.lock().unwrap();
        match info {
            Some(info) => installed.insert(package_name.to_string(), info),
            None => installed.remove(package_name),
        };
    }

    /// Every file inspection takes `delay` first.
    pub fn set_file_delay(&self, delay: Duration) {
        *self.file_delay.lock().unwrap() = Some(delay);
    }

    /// The next `count` installed-package reads fail.
    pub fn fail_installed_reads(&self, count: usize) {
        *self.failing_installed_reads.lock().unwrap() = count;
    }
}

impl PackageInspector for FakeInspector {
    fn inspect_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<PackageInfo, InspectError>> {
        let found = self.files.lock().unwrap().get(path).cloned();
        let delay = *self.file_delay.lock().unwrap();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            found.ok_or(InspectError::Parse("aapt2"))
        }
        .boxed()
    }

    fn inspect_installed<'a>(
        &'a self,
        package_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<PackageInfo>, InspectError>> {
        {
            let mut failing = self.failing_installed_reads.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return async { Err(InspectError::Parse("dumpsys")) }.boxed();
            }
        }
        let found = self.installed.lock().unwrap().get(package_name).cloned();
        async move { Ok(found) }.boxed()
    }

    fn pull_installed<'a>(
        &'a self,
        package_name: &'a str,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, InspectError>> {
        async move {
            fs::create_dir_all(dest_dir)?;
            let dest = dest_dir.join(format!("{package_name}.apk"));
            fs::write(&dest, b"base apk")?;
            Ok(dest)
        }
        .boxed()
    }
}

/// Scripted worker: emits the configured events, then finishes with the
/// next queued result (success when the queue is empty).
#[derive(Default)]
pub struct FakeWorker {
    events: Mutex<Vec<WorkerEvent>>,
    results: Mutex<VecDeque<Result<JobOutputs, JobOutputs>>>,
    calls: Mutex<Vec<WorkerArgs>>,
    gate: Mutex<Option<Arc<Notify>>>,
    log_lines: Mutex<usize>,
}

impl FakeWorker {
    pub fn with_events(events: Vec<WorkerEvent>) -> Self {
        let worker = Self::default();
        *worker.events.lock().unwrap() = events;
        worker
    }

    /// Each run also logs `count` patcher lines after its events.
    pub fn set_log_lines(&self, count: usize) {
        *self.log_lines.lock().unwrap() = count;
    }

    pub fn push_result(&self, result: Result<JobOutputs, JobOutputs>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// Runs block after their events until the returned handle is notified.
    pub fn gate(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn calls(&self) -> Vec<WorkerArgs> {
        self.calls.lock().unwrap().clone()
    }
}

impl PatchWorker for FakeWorker {
    fn run(
        &self,
        args: WorkerArgs,
        ctx: JobContext<WorkerEvent>,
    ) -> BoxFuture<'static, Result<JobOutputs, JobOutputs>> {
        self.calls.lock().unwrap().push(args.clone());
        let events = self.events.lock().unwrap().clone();
        let result = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(JobOutputs::new()));
        let gate = self.gate.lock().unwrap().clone();
        let log_lines = *self.log_lines.lock().unwrap();
        async move {
            for event in events {
                ctx.progress(event).await;
            }
            for line in 0..log_lines {
                ctx.log(LogLevel::Info, format!("patcher line {line}")).await;
            }
            ctx.log(LogLevel::Info, "fake worker ran").await;
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if result.is_ok() {
                if let Some(parent) = args.output.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(&args.output, b"patched").unwrap();
            }
            result
        }
        .boxed()
    }
}

/// Stores, preferences and fakes rooted in one temporary directory. The
/// catalog holds bundle 0 ("Default patches" 1.2.0) with a "Theme" patch.
pub struct TestEnv {
    pub dir: TempDir,
    pub fs: Filesystem,
    pub store: Arc<JsonStore>,
    pub catalog: Arc<BundleCatalog>,
    pub inspector: Arc<FakeInspector>,
    pub prefs: Arc<Preferences>,
    pub attempts: Arc<AttemptStore>,
    pub jobs: JobService<crate::worker::WorkerEvent>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_bundles(vec![BundleInfo {
            uid: 0,
            name: "default".into(),
            version: Some("1.2.0".into()),
            display_name: Some("Default patches".into()),
            enabled: true,
            patches: vec![patch("Theme")],
        }])
    }

    pub fn with_bundles(bundles: Vec<BundleInfo>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::open(&dir.path().join("data")).unwrap();
        let store = Arc::new(JsonStore::open(&dir.path().join("state"), fs.clone()));
        Self {
            fs,
            store,
            catalog: Arc::new(BundleCatalog::new(bundles)),
            inspector: Arc::new(FakeInspector::default()),
            prefs: Arc::new(Preferences::in_memory(PreferenceValues::default())),
            attempts: Arc::new(AttemptStore::in_memory()),
            jobs: JobService::new(2),
            dir,
        }
    }

    pub fn repos(&self) -> Repositories {
        Repositories::from_store(self.store.clone(), self.catalog.clone())
    }

    pub fn finalizer(&self) -> Finalizer {
        Finalizer::new(self.repos(), self.inspector.clone(), self.fs.clone())
    }

    pub fn installed(&self, current_package_name: &str) -> Option<InstalledApp> {
        InstalledAppRepository::get(self.store.as_ref(), current_package_name).unwrap()
    }

    pub fn deps(&self, worker: Arc<FakeWorker>) -> WorkflowDeps {
        WorkflowDeps {
            jobs: self.jobs.clone(),
            worker,
            prefs: self.prefs.clone(),
            repos: self.repos(),
            inspector: self.inspector.clone(),
            fs: self.fs.clone(),
            attempts: self.attempts.clone(),
        }
    }
}
