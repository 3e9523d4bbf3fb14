use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Instant,
};

use futures_util::future::{BoxFuture, FutureExt};
use pmgr_jobs::{JobContext, JobOutputs, LogLevel};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    inspect::PackageInspector,
    model::SelectedApp,
    prefs::{Preferences, PROCESS_MEMORY_DEFAULT_MB},
    split::is_split_archive,
    steps::StepState,
    worker::{is_memory_exit_code, PatchWorker, WorkerArgs, WorkerEvent, WorkerFailure},
};

pub const PATCHER_CMD_ENV: &str = "PMGR_PATCHER_CMD";
const DEFAULT_PATCHER_CMD: &str = "pmgr-patcher";

/// Prefix of stdout lines that carry a JSON encoded [`WorkerEvent`].
pub const EVENT_LINE_PREFIX: &str = "PMGR:";

const MIN_MEMORY_LIMIT_MB: u32 = 200;
const MEMORY_RETRY_STEP_MB: u32 = 128;
const LINE_CHANNEL_CAPACITY: usize = 256;
const RECENT_STDERR_LIMIT: usize = 40;

#[derive(Debug)]
enum RunError {
    Exit { code: i32, out_of_memory: bool },
    Io(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct LogLine {
    stream: Stream,
    line: String,
}

/// Runs patches through an external patcher command.
///
/// The command receives `-Xmx<limit>m` (when the process runtime is on),
/// `--input`, `--output`, `--package`, `--selection <json>`,
/// `--options <json>` and optionally `--strip-native-libs`. Stdout lines
/// prefixed with `PMGR:` are events, everything else is logged.
#[derive(Clone)]
pub struct ProcessWorker {
    program: PathBuf,
    base_args: Vec<String>,
    prefs: Arc<Preferences>,
    inspector: Arc<dyn PackageInspector>,
}

impl ProcessWorker {
    pub fn new(
        program: impl Into<PathBuf>,
        base_args: Vec<String>,
        prefs: Arc<Preferences>,
        inspector: Arc<dyn PackageInspector>,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            prefs,
            inspector,
        }
    }

    /// Reads the command line from `PMGR_PATCHER_CMD`.
    pub fn from_env(prefs: Arc<Preferences>, inspector: Arc<dyn PackageInspector>) -> Self {
        let raw = pmgr_util::env_or(PATCHER_CMD_ENV, DEFAULT_PATCHER_CMD);
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| DEFAULT_PATCHER_CMD.to_string());
        Self::new(program, parts.collect(), prefs, inspector)
    }

    async fn run_patcher(
        self,
        args: WorkerArgs,
        ctx: JobContext<WorkerEvent>,
    ) -> Result<JobOutputs, JobOutputs> {
        let started = Instant::now();
        let input = match self.resolve_input(&args, &ctx).await {
            Ok(input) => input,
            Err(message) => return Err(fail(&ctx, WorkerFailure::message(message)).await),
        };

        let prefs = self.prefs.snapshot();
        ctx.log(
            LogLevel::Info,
            format!(
                "Patching started pkg={} version={} input={} patches={}",
                args.package_name,
                args.input.version().unwrap_or("unknown"),
                input.display(),
                args.patch_count()
            ),
        )
        .await;

        let result = if prefs.use_process_runtime {
            ctx.log(
                LogLevel::Info,
                format!("runtime=process memory_limit={}", prefs.process_memory_limit_mb),
            )
            .await;
            self.run_with_memory_retry(&args, &input, prefs.strip_unused_native_libs, &ctx)
                .await
        } else {
            ctx.log(LogLevel::Info, "runtime=inline").await;
            self.spawn_patcher(&args, &input, None, prefs.strip_unused_native_libs, &ctx)
                .await
        };

        match result {
            Ok(()) => {
                // Signing is the last step the patcher performs.
                ctx.progress(WorkerEvent::step_state(StepState::Completed)).await;
                ctx.log(
                    LogLevel::Info,
                    format!(
                        "Patching succeeded output={} elapsed={}ms",
                        args.output.display(),
                        started.elapsed().as_millis()
                    ),
                )
                .await;
                Ok(JobOutputs::new())
            }
            Err(RunError::Exit { code, .. }) => {
                warn!("patcher process exited with code {code}");
                let failure = WorkerFailure {
                    exit_code: Some(code),
                    previous_limit_mb: Some(self.prefs.process_memory_limit_mb()),
                    message: Some(format!("Patcher process exited with code {code}")),
                };
                Err(fail(&ctx, failure).await)
            }
            Err(RunError::Io(message)) => Err(fail(&ctx, WorkerFailure::message(message)).await),
            Err(RunError::Cancelled) => Err(WorkerFailure::message("cancelled").to_outputs()),
        }
    }

    async fn resolve_input(
        &self,
        args: &WorkerArgs,
        ctx: &JobContext<WorkerEvent>,
    ) -> Result<PathBuf, String> {
        match &args.input {
            SelectedApp::Download { .. } | SelectedApp::Search { .. } => {
                Err("Download inputs are not supported by the process worker".to_string())
            }
            SelectedApp::Local { file, .. } => {
                let archive = file.clone();
                let needs_split = tokio::task::spawn_blocking(move || is_split_archive(&archive))
                    .await
                    .unwrap_or(false);
                ctx.progress(WorkerEvent::InputResolved {
                    file: file.clone(),
                    needs_split,
                    merged: false,
                })
                .await;
                Ok(file.clone())
            }
            SelectedApp::Installed { package_name, .. } => {
                let file = self
                    .inspector
                    .pull_installed(package_name, &args.work_dir)
                    .await
                    .map_err(|err| format!("failed to read installed {package_name}: {err}"))?;
                ctx.progress(WorkerEvent::InputResolved {
                    file: file.clone(),
                    needs_split: false,
                    merged: false,
                })
                .await;
                Ok(file)
            }
        }
    }

    /// Runs the patcher, lowering the heap limit after every memory failure
    /// until it fits or the floor is reached.
    async fn run_with_memory_retry(
        &self,
        args: &WorkerArgs,
        input: &Path,
        strip_native_libs: bool,
        ctx: &JobContext<WorkerEvent>,
    ) -> Result<(), RunError> {
        let mut memory_mb = MIN_MEMORY_LIMIT_MB.max(self.prefs.process_memory_limit_mb());
        let mut retried = false;

        loop {
            match self
                .spawn_patcher(args, input, Some(memory_mb), strip_native_libs, ctx)
                .await
            {
                Ok(()) => {
                    if retried && self.prefs.process_memory_limit_mb() != memory_mb {
                        // Never store less than the default so the next run
                        // starts from it again.
                        let saved = memory_mb.max(PROCESS_MEMORY_DEFAULT_MB);
                        info!("updating process memory limit to {saved} MB");
                        self.prefs.set_process_memory_limit(saved);
                    }
                    return Ok(());
                }
                Err(RunError::Exit {
                    out_of_memory: true,
                    ..
                }) if memory_mb > MIN_MEMORY_LIMIT_MB => {
                    retried = true;
                    memory_mb = memory_mb
                        .saturating_sub(MEMORY_RETRY_STEP_MB)
                        .max(MIN_MEMORY_LIMIT_MB);
                    ctx.log(
                        LogLevel::Warn,
                        format!("Process memory limit failed, retrying with: {memory_mb}"),
                    )
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn command(
        &self,
        args: &WorkerArgs,
        input: &Path,
        memory_mb: Option<u32>,
        strip_native_libs: bool,
    ) -> Result<Command, RunError> {
        let selection = serde_json::to_string(&args.selection)
            .map_err(|err| RunError::Io(format!("failed to encode selection: {err}")))?;
        let options = serde_json::to_string(&args.options)
            .map_err(|err| RunError::Io(format!("failed to encode options: {err}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        if let Some(limit) = memory_mb {
            cmd.arg(format!("-Xmx{limit}m"));
        }
        cmd.arg("--input")
            .arg(input)
            .arg("--output")
            .arg(&args.output)
            .arg("--package")
            .arg(&args.package_name)
            .arg("--selection")
            .arg(selection)
            .arg("--options")
            .arg(options);
        if strip_native_libs {
            cmd.arg("--strip-native-libs");
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn spawn_patcher(
        &self,
        args: &WorkerArgs,
        input: &Path,
        memory_mb: Option<u32>,
        strip_native_libs: bool,
        ctx: &JobContext<WorkerEvent>,
    ) -> Result<(), RunError> {
        let mut child = self
            .command(args, input, memory_mb, strip_native_libs)?
            .spawn()
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    RunError::Io(format!(
                        "patcher not found: {} (set {PATCHER_CMD_ENV})",
                        self.program.display()
                    ))
                } else {
                    RunError::Io(format!("failed to start patcher: {err}"))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Io("patcher stdout pipe missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Io("patcher stderr pipe missing".into()))?;

        let (line_tx, mut line_rx) = mpsc::channel::<LogLine>(LINE_CHANNEL_CAPACITY);
        tokio::spawn(read_lines(stdout, Stream::Stdout, line_tx.clone()));
        tokio::spawn(read_lines(stderr, Stream::Stderr, line_tx));

        let mut cancel_rx = ctx.cancel_receiver();
        let mut recent_stderr = VecDeque::with_capacity(RECENT_STDERR_LIMIT);
        let mut status: Option<io::Result<ExitStatus>> = None;
        let mut lines_done = false;

        while !(lines_done && status.is_some()) {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        return Err(RunError::Cancelled);
                    }
                }
                line = line_rx.recv(), if !lines_done => match line {
                    Some(line) => handle_line(line, ctx, &mut recent_stderr).await,
                    None => lines_done = true,
                },
                result = child.wait(), if status.is_none() => {
                    status = Some(result);
                }
            }
        }

        let status = match status {
            Some(Ok(status)) => status,
            Some(Err(err)) => return Err(RunError::Io(format!("patcher process failed: {err}"))),
            None => return Err(RunError::Io("patcher exit status missing".into())),
        };
        if status.success() {
            return Ok(());
        }
        let code = exit_code(status);
        let remote_oom = recent_stderr
            .iter()
            .any(|line: &String| line.to_ascii_lowercase().contains("outofmemoryerror"));
        Err(RunError::Exit {
            code,
            out_of_memory: is_memory_exit_code(code) || remote_oom,
        })
    }
}

impl PatchWorker for ProcessWorker {
    fn run(
        &self,
        args: WorkerArgs,
        ctx: JobContext<WorkerEvent>,
    ) -> BoxFuture<'static, Result<JobOutputs, JobOutputs>> {
        self.clone().run_patcher(args, ctx).boxed()
    }
}

async fn fail(ctx: &JobContext<WorkerEvent>, failure: WorkerFailure) -> JobOutputs {
    ctx.progress(WorkerEvent::Progress {
        name: None,
        state: Some(StepState::Failed),
        message: failure.message.clone(),
    })
    .await;
    failure.to_outputs()
}

async fn handle_line(
    line: LogLine,
    ctx: &JobContext<WorkerEvent>,
    recent_stderr: &mut VecDeque<String>,
) {
    match line.stream {
        Stream::Stdout => match line.line.strip_prefix(EVENT_LINE_PREFIX) {
            Some(payload) => match serde_json::from_str::<WorkerEvent>(payload.trim()) {
                Ok(event) => ctx.progress(event).await,
                Err(err) => {
                    ctx.log(LogLevel::Warn, format!("unreadable patcher event: {err}"))
                        .await
                }
            },
            None => ctx.log(LogLevel::Info, line.line).await,
        },
        Stream::Stderr => {
            if recent_stderr.len() >= RECENT_STDERR_LIMIT {
                recent_stderr.pop_front();
            }
            recent_stderr.push_back(line.line.clone());
            ctx.log(LogLevel::Warn, line.line).await;
        }
    }
}

async fn read_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<LogLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(LogLine { stream, line }).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        model::PatchSelection,
        prefs::PreferenceValues,
        test_support::FakeInspector,
        worker::{PROCESS_EXIT_CODE_KEY, PROCESS_PREVIOUS_LIMIT_KEY},
    };
    use pmgr_jobs::{JobPayload, JobService};
    use std::collections::BTreeSet;

    fn worker(script: &str, prefs: Arc<Preferences>) -> ProcessWorker {
        ProcessWorker::new(
            "sh",
            vec!["-c".into(), script.into(), "patcher".into()],
            prefs,
            Arc::new(FakeInspector::default()),
        )
    }

    fn prefs(limit: u32) -> Arc<Preferences> {
        Arc::new(Preferences::in_memory(PreferenceValues {
            process_memory_limit_mb: limit,
            ..PreferenceValues::default()
        }))
    }

    async fn run(
        worker: ProcessWorker,
        dir: &Path,
    ) -> (Vec<JobPayload<WorkerEvent>>, Option<JobOutputs>) {
        let input = dir.join("input.apk");
        std::fs::write(&input, b"not a zip").unwrap();
        let args = WorkerArgs {
            input: SelectedApp::Local {
                package_name: "com.example".into(),
                version: Some("1.0".into()),
                file: input,
                temporary: false,
                resolved: true,
            },
            output: dir.join("out.apk"),
            package_name: "com.example".into(),
            selection: PatchSelection::from([(0, BTreeSet::from(["Theme".to_string()]))]),
            options: Default::default(),
            work_dir: dir.to_path_buf(),
        };

        let svc = JobService::<WorkerEvent>::new(1);
        let job_id = svc
            .start_job("patch", "Patch", move |ctx| worker.run(args, ctx))
            .await;
        let mut rx = svc.stream_job_events(&job_id, true).await.unwrap();
        let mut events = Vec::new();
        while let Some(evt) = rx.recv().await {
            events.push(evt.payload);
        }
        let failure = events.iter().find_map(|p| match p {
            JobPayload::Failed(out) => Some(out.clone()),
            _ => None,
        });
        (events, failure)
    }

    #[tokio::test]
    async fn forwards_events_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo 'PMGR:{"event":"patch_completed","name":"Theme"}'; echo hello; echo oops >&2"#;
        let (events, failure) = run(worker(script, prefs(512)), dir.path()).await;

        assert!(failure.is_none());
        assert!(events.iter().any(|p| matches!(
            p,
            JobPayload::Progress(WorkerEvent::InputResolved { needs_split: false, .. })
        )));
        assert!(events
            .iter()
            .any(|p| matches!(p, JobPayload::Progress(WorkerEvent::PatchCompleted { .. }))));
        assert!(events.iter().any(
            |p| matches!(p, JobPayload::Log { level: LogLevel::Info, message } if message == "hello")
        ));
        assert!(events.iter().any(
            |p| matches!(p, JobPayload::Log { level: LogLevel::Warn, message } if message == "oops")
        ));
        assert!(matches!(events.last(), Some(JobPayload::Completed(_))));
    }

    #[tokio::test]
    async fn retries_with_less_memory_and_remembers_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = prefs(1000);
        let script = r#"case "$1" in -Xmx1000m|-Xmx872m) exit 134;; esac; exit 0"#;
        let (_, failure) = run(worker(script, prefs.clone()), dir.path()).await;

        assert!(failure.is_none());
        assert_eq!(prefs.process_memory_limit_mb(), 744);
    }

    #[tokio::test]
    async fn reports_exit_code_and_limit_when_memory_never_fits() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = prefs(700);
        let (_, failure) = run(worker("exit 134", prefs.clone()), dir.path()).await;

        let failure = failure.unwrap();
        assert_eq!(failure[PROCESS_EXIT_CODE_KEY], "134");
        assert_eq!(failure[PROCESS_PREVIOUS_LIMIT_KEY], "700");
        assert_eq!(prefs.process_memory_limit_mb(), 700);
    }

    #[tokio::test]
    async fn download_inputs_fail_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker("exit 0", prefs(512));
        let args = WorkerArgs {
            input: SelectedApp::Download {
                package_name: "com.example".into(),
                version: None,
                url: "https://example.invalid/app.apk".into(),
            },
            output: dir.path().join("out.apk"),
            package_name: "com.example".into(),
            selection: PatchSelection::new(),
            options: Default::default(),
            work_dir: dir.path().to_path_buf(),
        };
        let svc = JobService::<WorkerEvent>::new(1);
        let job_id = svc
            .start_job("patch", "Patch", move |ctx| worker.run(args, ctx))
            .await;
        let mut rx = svc.stream_job_events(&job_id, true).await.unwrap();
        let mut last = None;
        while let Some(evt) = rx.recv().await {
            last = Some(evt.payload);
        }
        assert!(matches!(last, Some(JobPayload::Failed(out)) if !out.contains_key(PROCESS_EXIT_CODE_KEY)));
    }
}
