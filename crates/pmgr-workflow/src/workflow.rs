//! The patch workflow: preflight, one supervised job per attempt, recovery
//! and finalization, observed through a snapshot channel.

use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use pmgr_jobs::{JobEvent, JobPayload, JobService, JobState, LogLevel};
use pmgr_util::{now_millis, sanitize_filename};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    attempt::{AttemptState, AttemptStore, WorkflowAttempt},
    error::WorkflowError,
    export::{ExportNameFormatter, PatchedAppExportData},
    finalizer::{FinalizeInput, Finalizer, PersistOutcome},
    inspect::PackageInspector,
    installer::{ExternalInstallWatch, InstallOutcome, EXTERNAL_INSTALL_POLL, EXTERNAL_INSTALL_TIMEOUT},
    model::{InstallType, Options, PatchSelection, ScopedBundles, SelectedApp},
    paths::Filesystem,
    preflight::{check_missing_patches, check_paths, effective_options, PathValidationFailure, PreflightOutcome},
    prefs::Preferences,
    repo::{blocking, Repositories},
    selection::{count_patches, prune_selection, sanitize_options, sanitize_selection},
    split::is_split_archive,
    steps::{Step, StepList, StepState},
    supervisor::{recover_from_failure, HandledFailures, MemoryAdjustment},
    worker::{PatchWorker, WorkerArgs, WorkerEvent, WorkerFailure},
};

pub const PATCH_JOB_TYPE: &str = "patch";
const LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    PreflightPending,
    MissingPatchesWarning,
    InaccessiblePathsWarning,
    WorkerRunning,
    Succeeded,
    Finalizing,
    Done,
    Failed,
    OomRecoveryOffered,
}

/// Collaborators of a workflow. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub jobs: JobService<WorkerEvent>,
    pub worker: Arc<dyn PatchWorker>,
    pub prefs: Arc<Preferences>,
    pub repos: Repositories,
    pub inspector: Arc<dyn PackageInspector>,
    pub fs: Filesystem,
    pub attempts: Arc<AttemptStore>,
}

/// Input, patches and options of one patch run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub selected_app: SelectedApp,
    pub selection: PatchSelection,
    pub options: Options,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Everything a front end displays.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub state: WorkflowState,
    pub steps: Vec<Step>,
    pub current_step: usize,
    pub progress: f64,
    pub completed_patches: usize,
    pub total_patches: usize,
    pub missing_patches: Vec<String>,
    pub path_failures: Vec<PathValidationFailure>,
    pub memory_adjustment: Option<MemoryAdjustment>,
    pub failure: Option<WorkerFailure>,
    pub job_id: Option<String>,
    /// Bytes downloaded and total, when the input is fetched.
    pub download: Option<(u64, Option<u64>)>,
    pub input_file: Option<PathBuf>,
    pub export: Option<PatchedAppExportData>,
    pub saved_patched_app: bool,
    pub installed_package: Option<String>,
}

struct Inner {
    request: WorkflowRequest,
    state: WorkflowState,
    steps: StepList,
    completed_patches: usize,
    total_patches: usize,
    missing_patches: Vec<String>,
    path_failures: Vec<PathValidationFailure>,
    memory_adjustment: Option<MemoryAdjustment>,
    failure: Option<WorkerFailure>,
    job_id: Option<String>,
    /// Options the current job was launched with.
    options: Options,
    input_file: Option<PathBuf>,
    keep_local_input: bool,
    handled: HandledFailures,
    logs: VecDeque<LogEntry>,
    download: Option<(u64, Option<u64>)>,
    export: Option<PatchedAppExportData>,
    saved_patched_app: bool,
    installed_package: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            state: self.state,
            steps: self.steps.steps().to_vec(),
            current_step: self.steps.current_index(),
            progress: self.steps.progress(self.completed_patches, self.total_patches),
            completed_patches: self.completed_patches,
            total_patches: self.total_patches,
            missing_patches: self.missing_patches.clone(),
            path_failures: self.path_failures.clone(),
            memory_adjustment: self.memory_adjustment,
            failure: self.failure.clone(),
            job_id: self.job_id.clone(),
            download: self.download,
            input_file: self.input_file.clone(),
            export: self.export.clone(),
            saved_patched_app: self.saved_patched_app,
            installed_package: self.installed_package.clone(),
        }
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if level == LogLevel::Trace {
            return;
        }
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry { level, message });
    }

    fn reset_for_run(&mut self) {
        let requires_split = self.steps.requires_split();
        self.steps = StepList::build(&self.request.selected_app, requires_split);
        self.completed_patches = 0;
        self.download = None;
        self.failure = None;
        self.memory_adjustment = None;
    }

    /// The input handed to the worker: a local file already copied for
    /// this workflow is reused, and is not temporary while it is kept.
    fn worker_input(&self) -> SelectedApp {
        match &self.request.selected_app {
            SelectedApp::Local {
                package_name,
                version,
                file,
                temporary,
                resolved,
            } => SelectedApp::Local {
                package_name: package_name.clone(),
                version: version.clone(),
                file: self.input_file.clone().unwrap_or_else(|| file.clone()),
                temporary: *temporary && !self.keep_local_input,
                resolved: *resolved,
            },
            other => other.clone(),
        }
    }
}

struct Shared {
    deps: WorkflowDeps,
    finalizer: Finalizer,
    package_name: String,
    output_file: PathBuf,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<WorkflowSnapshot>,
    observer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// One patch workflow for one selected app.
///
/// Dropping the workflow stops observing its job but leaves the job
/// running; opening a workflow for the same package re-attaches to it.
/// [`PatchWorkflow::close`] ends the workflow for good.
pub struct PatchWorkflow {
    shared: Arc<Shared>,
}

impl PatchWorkflow {
    /// Re-attaches to the package's in-flight job, or runs preflight and
    /// launches a new one.
    pub async fn open(deps: WorkflowDeps, request: WorkflowRequest) -> Result<Self, WorkflowError> {
        let package_name = request.selected_app.package_name().to_string();
        let requires_split = match &request.selected_app {
            SelectedApp::Local { file, .. } => {
                let archive = file.clone();
                tokio::task::spawn_blocking(move || is_split_archive(&archive)).await?
            }
            _ => false,
        };
        let steps = StepList::build(&request.selected_app, requires_split);
        let total_patches = count_patches(&request.selection);
        let output_file = deps
            .fs
            .temp_dir
            .join(format!("{}-patched.apk", sanitize_filename(&package_name)));

        let inner = Inner {
            options: request.options.clone(),
            request,
            state: WorkflowState::Idle,
            steps,
            completed_patches: 0,
            total_patches,
            missing_patches: Vec::new(),
            path_failures: Vec::new(),
            memory_adjustment: None,
            failure: None,
            job_id: None,
            input_file: None,
            keep_local_input: false,
            handled: HandledFailures::default(),
            logs: VecDeque::new(),
            download: None,
            export: None,
            saved_patched_app: false,
            installed_package: None,
        };
        let (snapshot_tx, _) = watch::channel(inner.snapshot());
        let finalizer = Finalizer::new(deps.repos.clone(), deps.inspector.clone(), deps.fs.clone());
        let shared = Arc::new(Shared {
            deps,
            finalizer,
            package_name,
            output_file,
            inner: Mutex::new(inner),
            snapshot_tx,
            observer: std::sync::Mutex::new(None),
        });

        {
            let mut inner = shared.inner.lock().await;
            if matches!(inner.request.selected_app, SelectedApp::Installed { .. }) {
                inner.input_file = shared.stored_original().await;
            }
            if !shared.reattach(&mut inner).await {
                shared.preflight(&mut inner).await;
            }
        }
        Ok(Self { shared })
    }

    pub fn package_name(&self) -> &str {
        &self.shared.package_name
    }

    /// Path the worker writes the patched artifact to.
    pub fn output_file(&self) -> &Path {
        &self.shared.output_file
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Worker log lines, oldest first. Trace lines are not kept.
    pub async fn logs(&self) -> Vec<LogEntry> {
        self.shared.inner.lock().await.logs.iter().cloned().collect()
    }

    /// Waits until the workflow reaches a state accepted by `done`.
    pub async fn wait_until<F>(&self, done: F) -> WorkflowSnapshot
    where
        F: Fn(WorkflowState) -> bool,
    {
        let mut rx = self.subscribe();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if done(snapshot.state) {
                    return snapshot.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    pub async fn dismiss_missing_patches(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.expect_state(WorkflowState::MissingPatchesWarning).await?;
        inner.missing_patches.clear();
        inner.state = WorkflowState::Idle;
        self.shared.publish(&inner);
        Ok(())
    }

    /// Runs with the requested patches although some are unavailable. The
    /// option path check still applies.
    pub async fn proceed_after_missing_patches(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.expect_state(WorkflowState::MissingPatchesWarning).await?;
        inner.missing_patches.clear();
        match self.shared.scoped_bundles(&inner.request).await {
            Ok(scoped) => self.shared.check_paths_then_launch(&mut inner, &scoped).await,
            Err(err) => self.shared.fail_before_launch(&mut inner, &err),
        }
        Ok(())
    }

    /// Drops the unavailable patches and their options, then runs.
    pub async fn remove_missing_patches_and_start(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.expect_state(WorkflowState::MissingPatchesWarning).await?;
        inner.missing_patches.clear();
        let scoped = match self.shared.scoped_bundles(&inner.request).await {
            Ok(scoped) => scoped,
            Err(err) => {
                self.shared.fail_before_launch(&mut inner, &err);
                return Ok(());
            }
        };
        let mut selection = sanitize_selection(&inner.request.selection, &scoped);
        for (uid, patches) in selection.iter_mut() {
            if let Some(bundle) = scoped.get(uid) {
                patches.retain(|name| bundle.patch(name).is_some());
            }
        }
        prune_selection(&mut selection);
        let (options, _) = sanitize_options(&inner.request.options, &scoped);
        inner.request.selection = selection;
        inner.request.options = options;
        inner.total_patches = count_patches(&inner.request.selection);
        self.shared.check_paths_then_launch(&mut inner, &scoped).await;
        Ok(())
    }

    pub async fn dismiss_inaccessible_paths(&self) -> Result<(), WorkflowError> {
        let mut inner = self
            .shared
            .expect_state(WorkflowState::InaccessiblePathsWarning)
            .await?;
        inner.path_failures.clear();
        inner.state = WorkflowState::Idle;
        self.shared.publish(&inner);
        Ok(())
    }

    /// Re-runs the whole preflight once access may have been granted.
    pub async fn retry_after_permission(&self) -> Result<(), WorkflowError> {
        let mut inner = self
            .shared
            .expect_state(WorkflowState::InaccessiblePathsWarning)
            .await?;
        inner.path_failures.clear();
        self.shared.preflight(&mut inner).await;
        Ok(())
    }

    /// Declines the retry offered after an out-of-memory failure. The local
    /// input is no longer kept.
    pub async fn dismiss_memory_adjustment(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.expect_state(WorkflowState::OomRecoveryOffered).await?;
        inner.memory_adjustment = None;
        inner.keep_local_input = false;
        inner.state = WorkflowState::Idle;
        self.shared.update_attempt(&inner, |attempt| attempt.keep_local_input = false);
        self.shared.publish(&inner);
        Ok(())
    }

    /// Relaunches with the lowered memory limit, skipping preflight.
    pub async fn retry_after_memory_adjustment(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.expect_state(WorkflowState::OomRecoveryOffered).await?;
        inner.handled.clear();
        if let Some(job_id) = inner.job_id.take() {
            self.shared.deps.jobs.cancel_job(&job_id).await;
        }
        inner.reset_for_run();
        self.shared.launch(&mut inner).await;
        Ok(())
    }

    /// Starts over from preflight after a failure or a dismissed warning.
    pub async fn retry(&self) -> Result<(), WorkflowError> {
        let mut inner = self.shared.inner.lock().await;
        if !matches!(inner.state, WorkflowState::Idle | WorkflowState::Failed) {
            return Err(WorkflowError::InvalidState(inner.state));
        }
        inner.handled.clear();
        inner.job_id = None;
        inner.reset_for_run();
        self.shared.preflight(&mut inner).await;
        Ok(())
    }

    /// Records the patched app after it was installed as
    /// `current_package_name` (or saved). Returns false when nothing could
    /// be recorded.
    pub async fn persist_patched_app(
        &self,
        current_package_name: Option<&str>,
        install_type: InstallType,
    ) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let input = self.shared.finalize_input(&inner);
        let outcome = self
            .shared
            .finalizer
            .persist_patched_app(&input, current_package_name, install_type)
            .await;
        self.shared.apply_persist(&mut inner, install_type, outcome)
    }

    /// Copies the patched artifact to `destination` and records it as
    /// saved. False when the copy failed.
    pub async fn export(&self, destination: &Path) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != WorkflowState::Done {
            warn!("export requested while {:?}", inner.state);
            return false;
        }
        let input = self.shared.finalize_input(&inner);
        if inner.export.is_none() {
            inner.export = Some(self.shared.finalizer.refresh_export_metadata(&input).await);
        }
        match self.shared.finalizer.export(&input, destination).await {
            Ok(outcome) => {
                if !self.shared.apply_persist(&mut inner, InstallType::Saved, outcome) {
                    warn!("exported {} but could not record it", destination.display());
                }
                true
            }
            Err(err) => {
                warn!("export to {} failed: {err}", destination.display());
                false
            }
        }
    }

    /// Suggested file name for [`PatchWorkflow::export`].
    pub async fn export_file_name(&self) -> String {
        let mut inner = self.shared.inner.lock().await;
        if inner.export.is_none() {
            let input = self.shared.finalize_input(&inner);
            inner.export = Some(self.shared.finalizer.refresh_export_metadata(&input).await);
        }
        let template = self.shared.deps.prefs.snapshot().export_name_template;
        match &inner.export {
            Some(data) => ExportNameFormatter::format(template.as_deref(), data),
            None => ExportNameFormatter::format(
                template.as_deref(),
                &PatchedAppExportData::new(self.shared.package_name.clone()),
            ),
        }
    }

    /// Waits for an install handed to an external installer and records
    /// it. False when the installer did not finish in time.
    pub async fn track_external_install(&self, install_type: InstallType) -> bool {
        self.track_external_install_with(install_type, EXTERNAL_INSTALL_TIMEOUT, EXTERNAL_INSTALL_POLL)
            .await
    }

    pub async fn track_external_install_with(
        &self,
        install_type: InstallType,
        timeout: Duration,
        poll: Duration,
    ) -> bool {
        let target = {
            let inner = self.shared.inner.lock().await;
            match self
                .shared
                .deps
                .inspector
                .inspect_file(&self.shared.output_file)
                .await
            {
                Ok(info) => info.package_name,
                Err(_) => inner.request.selected_app.package_name().to_string(),
            }
        };
        let watch = ExternalInstallWatch::begin(self.shared.deps.inspector.clone(), &target).await;
        match watch.wait(timeout, poll).await {
            InstallOutcome::Installed(info) => {
                let install_type = match install_type {
                    InstallType::Default | InstallType::Custom => install_type,
                    _ => InstallType::Default,
                };
                self.persist_patched_app(Some(&info.package_name), install_type)
                    .await
            }
            InstallOutcome::TimedOut => {
                let mut inner = self.shared.inner.lock().await;
                inner.push_log(
                    LogLevel::Error,
                    format!("Installation of {target} did not finish in time"),
                );
                self.shared.publish(&inner);
                false
            }
        }
    }

    /// Ends the workflow: cancels its job and removes a temporary input.
    pub async fn close(self) {
        // Event handling runs under the lock, so a finalization in progress
        // completes before the observer stops.
        let mut inner = self.shared.inner.lock().await;
        if let Some(handle) = self.shared.take_observer() {
            handle.abort();
        }
        if let Some(job_id) = inner.job_id.clone() {
            if self.shared.deps.jobs.cancel_job(&job_id).await {
                info!("cancelled patch job {job_id}");
            }
        }
        if inner.request.selected_app.is_temporary_local() {
            if let Some(file) = inner.input_file.take() {
                remove_file_logged(file).await;
            }
            inner.steps.update_split_requirement(false, false);
        }
        inner.keep_local_input = false;
        if let Err(err) = self.shared.deps.attempts.remove(&self.shared.package_name) {
            warn!("failed to remove workflow attempt: {err}");
        }
        self.shared.publish(&inner);
    }
}

impl Drop for PatchWorkflow {
    fn drop(&mut self) {
        let Some(handle) = self.shared.take_observer() else {
            return;
        };
        if let Ok(_idle) = self.shared.inner.try_lock() {
            handle.abort();
            return;
        }
        // An event is being handled; stop observing once it is done.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = self.shared.clone();
                runtime.spawn(async move {
                    let _idle = shared.inner.lock().await;
                    handle.abort();
                });
            }
            Err(_) => handle.abort(),
        }
    }
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    fn take_observer(&self) -> Option<JoinHandle<()>> {
        self.observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn expect_state(&self, state: WorkflowState) -> Result<MutexGuard<'_, Inner>, WorkflowError> {
        let inner = self.inner.lock().await;
        if inner.state != state {
            return Err(WorkflowError::InvalidState(inner.state));
        }
        Ok(inner)
    }

    async fn stored_original(&self) -> Option<PathBuf> {
        let originals = self.deps.repos.originals.clone();
        let package_name = self.package_name.clone();
        match blocking(move || originals.get(&package_name)).await {
            Ok(Some(apk)) if apk.file_path.exists() => Some(apk.file_path),
            Ok(_) => None,
            Err(err) => {
                warn!("could not look up original APK of {}: {err}", self.package_name);
                None
            }
        }
    }

    async fn scoped_bundles(&self, request: &WorkflowRequest) -> Result<ScopedBundles, WorkflowError> {
        let bundles = self.deps.repos.bundles.clone();
        let package_name = request.selected_app.package_name().to_string();
        let version = request.selected_app.version().map(str::to_string);
        blocking(move || bundles.scoped_bundles(&package_name, version.as_deref())).await
    }

    /// Picks up the job recorded for this package while its outcome is
    /// still unhandled. False when a new job has to be launched.
    async fn reattach(self: &Arc<Self>, inner: &mut Inner) -> bool {
        let Some(attempt) = self.deps.attempts.get(&self.package_name) else {
            return false;
        };
        let job = match self.deps.jobs.get_job(&attempt.job_id).await {
            Ok(job) => job,
            Err(_) => {
                debug!("attempt job {} is gone; starting over", attempt.job_id);
                self.discard_attempt(&attempt).await;
                return false;
            }
        };
        if job.state.is_terminal() && attempt.state != AttemptState::Running {
            debug!("attempt job {} was already handled; starting over", attempt.job_id);
            self.discard_attempt(&attempt).await;
            return false;
        }

        info!("re-attaching to patch job {}", attempt.job_id);
        inner.keep_local_input = attempt.keep_local_input;
        if attempt.input_file.is_some() {
            inner.input_file = attempt.input_file.clone();
        }
        inner.job_id = Some(attempt.job_id.clone());
        inner.state = WorkflowState::WorkerRunning;
        self.publish(inner);
        self.observe(attempt.job_id);
        true
    }

    /// Forgets an attempt that will not be resumed, with the input copy it
    /// owned.
    async fn discard_attempt(&self, attempt: &WorkflowAttempt) {
        if let Err(err) = self.deps.attempts.remove(&self.package_name) {
            warn!("failed to remove stale workflow attempt: {err}");
        }
        if let Some(file) = &attempt.input_file {
            if file.starts_with(&self.deps.fs.ui_temp_dir) {
                remove_file_logged(file.clone()).await;
            }
        }
    }

    async fn preflight(self: &Arc<Self>, inner: &mut Inner) {
        inner.state = WorkflowState::PreflightPending;
        inner.missing_patches.clear();
        inner.path_failures.clear();
        self.publish(inner);

        let scoped = match self.scoped_bundles(&inner.request).await {
            Ok(scoped) => scoped,
            Err(err) => return self.fail_before_launch(inner, &err),
        };
        let missing = check_missing_patches(&inner.request.selection, &scoped);
        if !missing.is_empty() {
            warn!("{} selected patches are unavailable", missing.len());
            self.apply_preflight(inner, PreflightOutcome::MissingPatches(missing))
                .await;
            return;
        }
        self.check_paths_then_launch(inner, &scoped).await;
    }

    async fn check_paths_then_launch(self: &Arc<Self>, inner: &mut Inner, scoped: &ScopedBundles) {
        let options = effective_options(&self.deps.prefs, &self.package_name, &inner.request.options);
        let outcome = check_paths(options, scoped).await;
        self.apply_preflight(inner, outcome).await;
    }

    async fn apply_preflight(self: &Arc<Self>, inner: &mut Inner, outcome: PreflightOutcome) {
        match outcome {
            PreflightOutcome::MissingPatches(missing) => {
                inner.missing_patches = missing;
                inner.state = WorkflowState::MissingPatchesWarning;
                self.publish(inner);
            }
            PreflightOutcome::InaccessiblePaths(failures) => {
                warn!("{} option paths are not readable", failures.len());
                inner.path_failures = failures;
                inner.state = WorkflowState::InaccessiblePathsWarning;
                self.publish(inner);
            }
            PreflightOutcome::CheckFailed(message) => {
                inner.failure = Some(WorkerFailure::message(message));
                inner.state = WorkflowState::Failed;
                self.publish(inner);
            }
            PreflightOutcome::Ready { options } => {
                inner.options = options;
                self.launch(inner).await;
            }
        }
    }

    fn fail_before_launch(&self, inner: &mut Inner, err: &WorkflowError) {
        warn!("could not prepare patching of {}: {err}", self.package_name);
        inner.failure = Some(WorkerFailure::message(format!("Could not load patch bundles: {err}")));
        inner.state = WorkflowState::Failed;
        self.publish(inner);
    }

    async fn launch(self: &Arc<Self>, inner: &mut Inner) {
        let args = WorkerArgs {
            input: inner.worker_input(),
            output: self.output_file.clone(),
            package_name: self.package_name.clone(),
            selection: inner.request.selection.clone(),
            options: inner.options.clone(),
            work_dir: self.deps.fs.temp_dir.clone(),
        };
        inner.total_patches = args.patch_count();
        inner.completed_patches = 0;

        let worker = self.deps.worker.clone();
        let job_id = self
            .deps
            .jobs
            .start_job(
                PATCH_JOB_TYPE,
                &format!("Patch {}", self.package_name),
                move |ctx| worker.run(args, ctx),
            )
            .await;
        info!("launched patch job {job_id} for {}", self.package_name);

        let mut attempt = WorkflowAttempt::new(job_id.clone(), self.package_name.clone());
        attempt.keep_local_input = inner.keep_local_input;
        attempt.input_file = inner.input_file.clone();
        if let Err(err) = self.deps.attempts.save(attempt) {
            warn!("failed to record workflow attempt: {err}");
        }

        inner.job_id = Some(job_id.clone());
        inner.state = WorkflowState::WorkerRunning;
        self.publish(inner);
        self.observe(job_id);
    }

    fn observe(self: &Arc<Self>, job_id: String) {
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            let mut rx = match shared.deps.jobs.stream_job_events(&job_id, true).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!("cannot observe patch job: {err}");
                    return;
                }
            };
            while let Some(event) = rx.recv().await {
                shared.on_job_event(event).await;
            }
        });
        let previous = self
            .observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn on_job_event(&self, event: JobEvent<WorkerEvent>) {
        let mut inner = self.inner.lock().await;
        if inner.job_id.as_deref() != Some(event.job_id.as_str()) {
            return;
        }
        match event.payload {
            JobPayload::StateChanged(JobState::Cancelled) => {
                inner.steps.mark_failed(Some("Cancelled".to_string()));
                inner.state = WorkflowState::Idle;
                if let Err(err) = self.deps.attempts.remove(&self.package_name) {
                    warn!("failed to remove workflow attempt: {err}");
                }
            }
            JobPayload::StateChanged(_) => {}
            JobPayload::Progress(worker_event) => self.on_worker_event(&mut inner, worker_event).await,
            JobPayload::Log { level, message } => inner.push_log(level, message),
            JobPayload::Completed(_) => self.on_success(&mut inner).await,
            JobPayload::Failed(outputs) => {
                self.on_failure(&mut inner, &event.job_id, WorkerFailure::from_outputs(&outputs))
            }
        }
        self.publish(&inner);
    }

    async fn on_worker_event(&self, inner: &mut Inner, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress { name, state, message } => {
                inner.steps.apply_progress(name, state, message);
            }
            WorkerEvent::InputResolved {
                file,
                needs_split,
                merged,
            } => self.on_input_resolved(inner, file, needs_split, merged).await,
            WorkerEvent::PatchCompleted { name } => {
                inner.completed_patches += 1;
                if let Some(name) = name {
                    debug!("patch applied: {name}");
                }
            }
            WorkerEvent::DownloadProgress { downloaded, total } => {
                inner.download = Some((downloaded, total));
            }
        }
    }

    /// Records the concrete input. A temporary or kept local input is
    /// copied once so it outlives the worker.
    async fn on_input_resolved(&self, inner: &mut Inner, file: PathBuf, needs_split: bool, merged: bool) {
        let preserve = matches!(
            inner.request.selected_app,
            SelectedApp::Local { temporary, .. } if temporary || inner.keep_local_input
        );
        let stored = if preserve {
            match inner.input_file.clone().filter(|existing| existing.exists()) {
                Some(existing) => existing,
                None => {
                    let destination = self
                        .deps
                        .fs
                        .ui_temp_dir
                        .join(format!("input-{}.apk", now_millis()));
                    match copy_logged(file.clone(), destination).await {
                        Some(copy) => copy,
                        None => file,
                    }
                }
            }
        } else {
            file
        };
        inner.input_file = Some(stored.clone());
        inner.steps.update_split_requirement(needs_split, merged);
        self.update_attempt(inner, |attempt| attempt.input_file = Some(stored));
    }

    async fn on_success(&self, inner: &mut Inner) {
        inner.state = WorkflowState::Succeeded;
        inner.keep_local_input = false;
        self.publish(inner);

        inner.state = WorkflowState::Finalizing;
        self.publish(inner);
        let input = self.finalize_input(inner);
        self.finalizer.save_original_apk_if_needed(&input).await;
        if inner.request.selected_app.is_temporary_local() {
            if let Some(file) = inner.input_file.take() {
                remove_file_logged(file).await;
            }
            inner.steps.update_split_requirement(false, false);
        }
        inner.export = Some(self.finalizer.refresh_export_metadata(&input).await);
        self.remove_attempt(inner);
        inner.state = WorkflowState::Done;
        info!("patching of {} finished", self.package_name);
    }

    fn on_failure(&self, inner: &mut Inner, job_id: &str, failure: WorkerFailure) {
        if inner
            .steps
            .current()
            .is_some_and(|step| step.state != StepState::Failed)
        {
            inner.steps.mark_failed(failure.message.clone());
        }
        inner.failure = Some(failure.clone());
        inner.state = WorkflowState::Failed;

        if !inner.handled.first_time(job_id) {
            return;
        }
        warn!("patch job {job_id} failed: {}", failure.message.as_deref().unwrap_or("no message"));
        let adjustment = recover_from_failure(&self.deps.prefs, &failure);
        if let Some(adjustment) = adjustment {
            inner.keep_local_input = true;
            inner.memory_adjustment = Some(adjustment);
            inner.state = WorkflowState::OomRecoveryOffered;
        }
        let keep = inner.keep_local_input;
        self.update_attempt(inner, |attempt| {
            attempt.state = AttemptState::Failed;
            attempt.keep_local_input = keep;
        });
    }

    fn finalize_input(&self, inner: &Inner) -> FinalizeInput {
        FinalizeInput {
            package_name: self.package_name.clone(),
            selected_app: inner.request.selected_app.clone(),
            input_file: inner.input_file.clone(),
            output_file: self.output_file.clone(),
            selection: inner.request.selection.clone(),
            options: inner.options.clone(),
        }
    }

    fn apply_persist(
        &self,
        inner: &mut Inner,
        install_type: InstallType,
        outcome: Option<PersistOutcome>,
    ) -> bool {
        let Some(outcome) = outcome else {
            return false;
        };
        inner.request.selection = outcome.selection;
        inner.options = outcome.options;
        inner.export = Some(outcome.export);
        inner.saved_patched_app |= outcome.saved_copy || install_type == InstallType::Saved;
        if install_type != InstallType::Saved {
            inner.installed_package = Some(outcome.current_package_name);
        }
        self.publish(inner);
        true
    }

    /// Drops the record of the current job's attempt.
    fn remove_attempt(&self, inner: &Inner) {
        let current = self
            .deps
            .attempts
            .get(&self.package_name)
            .is_some_and(|attempt| inner.job_id.as_deref() == Some(attempt.job_id.as_str()));
        if current {
            if let Err(err) = self.deps.attempts.remove(&self.package_name) {
                warn!("failed to remove workflow attempt: {err}");
            }
        }
    }

    fn update_attempt<F>(&self, inner: &Inner, f: F)
    where
        F: FnOnce(&mut WorkflowAttempt),
    {
        let Some(job_id) = inner.job_id.as_deref() else {
            return;
        };
        let Some(mut attempt) = self
            .deps
            .attempts
            .get(&self.package_name)
            .filter(|attempt| attempt.job_id == job_id)
        else {
            return;
        };
        f(&mut attempt);
        if let Err(err) = self.deps.attempts.save(attempt) {
            warn!("failed to update workflow attempt: {err}");
        }
    }
}

async fn copy_logged(source: PathBuf, destination: PathBuf) -> Option<PathBuf> {
    let result = tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &destination)?;
        Ok(destination)
    })
    .await;
    match result {
        Ok(Ok(copy)) => Some(copy),
        Ok(Err(err)) => {
            warn!("failed to keep a copy of the input: {err}");
            None
        }
        Err(err) => {
            warn!("input copy did not finish: {err}");
            None
        }
    }
}

async fn remove_file_logged(file: PathBuf) {
    let shown = file.display().to_string();
    let result = tokio::task::spawn_blocking(move || fs::remove_file(&file)).await;
    match result {
        Ok(Ok(())) => debug!("deleted temporary input {shown}"),
        Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Ok(Err(err)) => warn!("failed to delete {shown}: {err}"),
        Err(err) => warn!("delete of {shown} did not finish: {err}"),
    }
}
