use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    sync::Arc,
};

use pmgr_util::now_millis;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 1024;
/// Log events kept per job. State, progress and result events are never
/// evicted, so a replay always rebuilds the job's progress.
const LOG_HISTORY_CAPACITY: usize = 2048;
const STREAM_CAPACITY: usize = 1024;

pub const MAX_CONCURRENT_JOBS_ENV: &str = "PMGR_MAX_CONCURRENT_JOBS";

/// Structured key/value data attached to a finished job.
pub type JobOutputs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Blocked,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub display_name: String,
    pub state: JobState,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub outputs: JobOutputs,
}

#[derive(Debug, Clone)]
pub enum JobPayload<E> {
    StateChanged(JobState),
    Progress(E),
    Log { level: LogLevel, message: String },
    Completed(JobOutputs),
    Failed(JobOutputs),
}

#[derive(Debug, Clone)]
pub struct JobEvent<E> {
    /// Position in the job's event sequence, starting at 0.
    pub seq: u64,
    pub at: i64,
    pub job_id: String,
    pub payload: JobPayload<E>,
}

impl<E> JobEvent<E> {
    /// True for the last event a job ever publishes.
    pub fn is_log(&self) -> bool {
        matches!(self.payload, JobPayload::Log { .. })
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.payload,
            JobPayload::Completed(_)
                | JobPayload::Failed(_)
                | JobPayload::StateChanged(JobState::Cancelled)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),
}

fn mk_event<E>(job_id: &str, seq: u64, payload: JobPayload<E>) -> JobEvent<E> {
    JobEvent {
        seq,
        at: now_millis(),
        job_id: job_id.to_string(),
        payload,
    }
}

struct JobRecordInner<E> {
    job: Job,
    broadcaster: broadcast::Sender<JobEvent<E>>,
    history: VecDeque<JobEvent<E>>,
    logs_in_history: usize,
    next_seq: u64,
    cancel_tx: watch::Sender<bool>,
}

struct JobStore<E> {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<JobRecordInner<E>>>>>>,
}

impl<E> Clone for JobStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> JobStore<E> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn insert(&self, job_id: &str, rec: JobRecordInner<E>) {
        self.inner
            .lock()
            .await
            .insert(job_id.to_string(), Arc::new(Mutex::new(rec)));
    }

    async fn get(&self, job_id: &str) -> Option<Arc<Mutex<JobRecordInner<E>>>> {
        self.inner.lock().await.get(job_id).cloned()
    }
}

/// In-process background job service.
///
/// Jobs outlive whoever started them: any holder of a clone can look a job up
/// by id, replay its event history and follow it live. At most
/// `max_concurrent` jobs run at once; the rest wait in `Blocked`.
pub struct JobService<E> {
    store: JobStore<E>,
    permits: Arc<Semaphore>,
}

impl<E> Clone for JobService<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> JobService<E> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            store: JobStore::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn from_env() -> Self {
        Self::new(pmgr_util::env_usize(MAX_CONCURRENT_JOBS_ENV, 1))
    }

    async fn publish(&self, job_id: &str, payload: JobPayload<E>) {
        if let Some(rec) = self.store.get(job_id).await {
            let mut inner = rec.lock().await;
            let evt = mk_event(job_id, inner.next_seq, payload);
            inner.next_seq += 1;

            if evt.is_log() {
                if inner.logs_in_history >= LOG_HISTORY_CAPACITY {
                    if let Some(oldest) = inner.history.iter().position(JobEvent::is_log) {
                        inner.history.remove(oldest);
                    }
                } else {
                    inner.logs_in_history += 1;
                }
            }
            inner.history.push_back(evt.clone());

            // No listeners is fine.
            let _ = inner.broadcaster.send(evt);
        }
    }

    /// Moves a job to `state`. Returns false when the job is unknown or
    /// already terminal; terminal states are never overwritten.
    async fn set_state(&self, job_id: &str, state: JobState) -> bool {
        let Some(rec) = self.store.get(job_id).await else {
            return false;
        };
        {
            let mut inner = rec.lock().await;
            if inner.job.state.is_terminal() {
                return false;
            }
            inner.job.state = state;
            match state {
                JobState::Running => inner.job.started_at = Some(now_millis()),
                JobState::Success | JobState::Failed | JobState::Cancelled => {
                    inner.job.finished_at = Some(now_millis())
                }
                _ => {}
            }
        }
        self.publish(job_id, JobPayload::StateChanged(state)).await;
        true
    }

    async fn finish(&self, job_id: &str, result: Result<JobOutputs, JobOutputs>) {
        let (state, outputs) = match &result {
            Ok(outputs) => (JobState::Success, outputs.clone()),
            Err(outputs) => (JobState::Failed, outputs.clone()),
        };
        if let Some(rec) = self.store.get(job_id).await {
            let inner = rec.lock().await;
            if inner.job.state.is_terminal() {
                debug!("job {job_id} already finished; dropping result");
                return;
            }
        }
        if let Some(rec) = self.store.get(job_id).await {
            rec.lock().await.job.outputs = outputs;
        }
        if !self.set_state(job_id, state).await {
            return;
        }
        match result {
            Ok(outputs) => {
                info!("job {job_id} succeeded");
                self.publish(job_id, JobPayload::Completed(outputs)).await;
            }
            Err(outputs) => {
                warn!("job {job_id} failed: {outputs:?}");
                self.publish(job_id, JobPayload::Failed(outputs)).await;
            }
        }
    }

    /// Registers a job and spawns `run` once a concurrency permit is free.
    ///
    /// `run` resolves to `Ok(outputs)` on success and `Err(outputs)` on
    /// failure. Cancelling the job drops the future.
    pub async fn start_job<F, Fut>(&self, job_type: &str, display_name: &str, run: F) -> String
    where
        F: FnOnce(JobContext<E>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutputs, JobOutputs>> + Send + 'static,
    {
        let job_id = Uuid::new_v4().to_string();
        let (btx, _brx) = broadcast::channel::<JobEvent<E>>(BROADCAST_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let job = Job {
            job_id: job_id.clone(),
            job_type: job_type.to_string(),
            display_name: display_name.to_string(),
            state: JobState::Queued,
            created_at: now_millis(),
            started_at: None,
            finished_at: None,
            outputs: JobOutputs::new(),
        };

        let rec = JobRecordInner {
            job,
            broadcaster: btx,
            history: VecDeque::with_capacity(64),
            logs_in_history: 0,
            next_seq: 0,
            cancel_tx,
        };
        self.store.insert(&job_id, rec).await;
        self.publish(&job_id, JobPayload::StateChanged(JobState::Queued))
            .await;
        info!("job {job_id} queued ({job_type})");

        let svc = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            svc.drive(id, cancel_rx, run).await;
        });

        job_id
    }

    async fn drive<F, Fut>(&self, job_id: String, mut cancel_rx: watch::Receiver<bool>, run: F)
    where
        F: FnOnce(JobContext<E>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutputs, JobOutputs>> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.set_state(&job_id, JobState::Blocked).await;
                tokio::select! {
                    acquired = self.permits.clone().acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.finish(&job_id, Err(JobOutputs::from([(
                                "error".to_string(),
                                "job service shut down".to_string(),
                            )])))
                            .await;
                            return;
                        }
                    },
                    _ = wait_cancelled(cancel_rx.clone()) => {
                        debug!("job {job_id} cancelled while blocked");
                        return;
                    }
                }
            }
        };

        if !self.set_state(&job_id, JobState::Running).await {
            return;
        }

        let ctx = JobContext {
            job_id: job_id.clone(),
            svc: self.clone(),
            cancel_rx: cancel_rx.clone(),
        };
        let fut = run(ctx);
        tokio::select! {
            result = fut => self.finish(&job_id, result).await,
            _ = wait_cancelled(cancel_rx.clone()) => {
                info!("job {job_id} cancelled");
            }
        }
        // Mark seen so a late cancel of a finished job is a no-op.
        let _ = cancel_rx.borrow_and_update();
        drop(permit);
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, JobError> {
        let rec = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let inner = rec.lock().await;
        Ok(inner.job.clone())
    }

    /// Requests cancellation. Returns false for unknown or finished jobs.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let rec = match self.store.get(job_id).await {
            Some(r) => r,
            None => return false,
        };

        {
            let inner = rec.lock().await;
            if inner.job.state.is_terminal() {
                return false;
            }
            let _ = inner.cancel_tx.send(true);
        }

        self.set_state(job_id, JobState::Cancelled).await
    }

    pub async fn job_history(&self, job_id: &str) -> Result<Vec<JobEvent<E>>, JobError> {
        let rec = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let inner = rec.lock().await;
        Ok(inner.history.iter().cloned().collect())
    }

    /// Streams a job's events, optionally replaying its history first. The
    /// stream closes after the job's final event.
    pub async fn stream_job_events(
        &self,
        job_id: &str,
        include_history: bool,
    ) -> Result<mpsc::Receiver<JobEvent<E>>, JobError> {
        let rec = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        // Snapshot history and subscribe under the same lock so nothing is
        // missed or duplicated between the two.
        let (history, finished, mut rx) = {
            let inner = rec.lock().await;
            let hist = if include_history {
                inner.history.iter().cloned().collect::<Vec<_>>()
            } else {
                vec![]
            };
            let finished = inner.history.iter().any(JobEvent::is_final);
            (hist, finished, inner.broadcaster.subscribe())
        };

        let (tx, out_rx) = mpsc::channel::<JobEvent<E>>(STREAM_CAPACITY);

        let job_id = job_id.to_string();
        tokio::spawn(async move {
            // Highest sequence number forwarded so far.
            let mut sent: Option<u64> = None;
            for evt in history {
                sent = Some(evt.seq);
                if tx.send(evt).await.is_err() {
                    return;
                }
            }
            if finished {
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        if sent.is_some_and(|seq| evt.seq <= seq) {
                            continue;
                        }
                        sent = Some(evt.seq);
                        let last = evt.is_final();
                        if tx.send(evt).await.is_err() || last {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Refill what was skipped from the history; only log
                        // lines can be lost there.
                        let missed: Vec<JobEvent<E>> = {
                            let inner = rec.lock().await;
                            inner
                                .history
                                .iter()
                                .filter(|evt| sent.map_or(true, |seq| evt.seq > seq))
                                .cloned()
                                .collect()
                        };
                        let notice_seq = sent.unwrap_or_default();
                        let notice = mk_event(
                            &job_id,
                            notice_seq,
                            JobPayload::Log {
                                level: LogLevel::Warn,
                                message: format!("subscriber lagged; resynced after {skipped} events"),
                            },
                        );
                        if tx.send(notice).await.is_err() {
                            return;
                        }
                        for evt in missed {
                            sent = Some(evt.seq);
                            let last = evt.is_final();
                            if tx.send(evt).await.is_err() || last {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return;
                    }
                }
            }
        });

        Ok(out_rx)
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle given to a running job for reporting back to the service.
pub struct JobContext<E> {
    job_id: String,
    svc: JobService<E>,
    cancel_rx: watch::Receiver<bool>,
}

impl<E: Clone + Send + 'static> JobContext<E> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn progress(&self, event: E) {
        self.svc
            .publish(&self.job_id, JobPayload::Progress(event))
            .await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.svc
            .publish(
                &self.job_id,
                JobPayload::Log {
                    level,
                    message: message.into(),
                },
            )
            .await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}
