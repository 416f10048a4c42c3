//! The job runtime: intake, dispatcher task, worker execution.
//!
//! One dispatcher task owns the [`JobStore`] and all scheduling state. It
//! selects on a command channel (enqueue / stats / shutdown), a poll timer
//! that leases due jobs, and a completion channel fed by worker tasks.
//! At most `concurrency` handler invocations are in flight at any instant;
//! each runs under its own timeout and reports back to the dispatcher, which
//! applies the retry / dead-letter policy.

use crate::job::{EnqueueOptions, Job, JobContext, JobError, JobHandler};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, StoreError};
use bk_protocol::JobStatsSnapshot;
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// SQLite path of the durable queue. `None` selects no-op mode.
    pub queue_path: Option<PathBuf>,
    /// Max concurrently running handler invocations.
    pub concurrency: usize,
    /// Priority tiers and their weighted round-robin shares, in declaration
    /// order, e.g. `critical:6, default:3, low:1`.
    pub queues: Vec<(String, u32)>,
    /// How often the dispatcher looks for newly due jobs.
    pub poll_interval: Duration,
    pub default_max_retries: u32,
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            queue_path: None,
            concurrency: 10,
            queues: vec![
                ("critical".to_owned(), 6),
                ("default".to_owned(), 3),
                ("low".to_owned(), 1),
            ],
            poll_interval: Duration::from_millis(250),
            default_max_retries: 3,
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The named priority tier is not configured.
    UnknownQueue(String),
    /// The runtime is draining; no new work is accepted.
    ShuttingDown,
    /// The queue backend rejected the write.
    Backend(String),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::UnknownQueue(q) => write!(f, "unknown queue '{}'", q),
            EnqueueError::ShuttingDown => write!(f, "job runtime is shutting down"),
            EnqueueError::Backend(s) => write!(f, "queue backend error: {}", s),
        }
    }
}

impl std::error::Error for EnqueueError {}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

type HandlerMap = Arc<RwLock<HashMap<String, JobHandler>>>;

enum Mode {
    /// Dispatcher task running against a durable queue.
    Durable { cmd_tx: mpsc::Sender<Command> },
    /// No backend configured: enqueues log and discard.
    Noop,
}

/// Cloneable handle to the runtime.
#[derive(Clone)]
pub struct JobRuntime {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: JobsConfig,
    handlers: HandlerMap,
    mode: Mode,
    /// Queue store held between `new` and `start`; the dispatcher takes it.
    parked_store: Mutex<Option<JobStore>>,
}

impl JobRuntime {
    /// Open the queue backend (surfacing a bad path synchronously) and set
    /// up the runtime. Workers do not run until [`JobRuntime::start`].
    pub fn new(cfg: JobsConfig) -> Result<Self, StoreError> {
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        match &cfg.queue_path {
            Some(path) => {
                let store = JobStore::open(path)?;
                let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
                let runtime = JobRuntime {
                    inner: Arc::new(Inner {
                        cfg,
                        handlers,
                        mode: Mode::Durable { cmd_tx },
                        parked_store: Mutex::new(Some(store)),
                    }),
                };
                runtime.spawn_dispatcher(cmd_rx);
                Ok(runtime)
            }
            None => {
                info!("no queue backend configured, job runtime in no-op mode");
                Ok(JobRuntime {
                    inner: Arc::new(Inner {
                        cfg,
                        handlers,
                        mode: Mode::Noop,
                        parked_store: Mutex::new(None),
                    }),
                })
            }
        }
    }

    /// Convenience for tests: a durable runtime over an in-memory queue.
    pub fn in_memory(mut cfg: JobsConfig) -> Result<Self, StoreError> {
        cfg.queue_path = None;
        let store = JobStore::open_in_memory()?;
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let runtime = JobRuntime {
            inner: Arc::new(Inner {
                cfg,
                handlers,
                mode: Mode::Durable { cmd_tx },
                parked_store: Mutex::new(Some(store)),
            }),
        };
        runtime.spawn_dispatcher(cmd_rx);
        Ok(runtime)
    }

    fn spawn_dispatcher(&self, cmd_rx: mpsc::Receiver<Command>) {
        let store = self
            .inner
            .parked_store
            .lock()
            .expect("parked store lock poisoned")
            .take()
            .expect("dispatcher spawned twice");
        let dispatcher = Dispatcher::new(
            self.inner.cfg.clone(),
            store,
            Arc::clone(&self.inner.handlers),
            cmd_rx,
        );
        tokio::spawn(dispatcher.run());
    }

    /// Register the handler for a job type. Registrations are accepted in
    /// no-op mode too, so wiring code is identical across setups.
    pub fn handle(&self, job_type: &str, handler: JobHandler) {
        let replaced = self
            .inner
            .handlers
            .write()
            .expect("handler map lock poisoned")
            .insert(job_type.to_owned(), handler);
        if replaced.is_some() {
            warn!(job_type, "replacing previously registered job handler");
        }
    }

    /// Submit typed work. Returns the assigned job id.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<String, EnqueueError> {
        let queue = opts
            .queue
            .clone()
            .unwrap_or_else(|| crate::job::DEFAULT_QUEUE.to_owned());
        if !self.inner.cfg.queues.iter().any(|(name, _)| *name == queue) {
            return Err(EnqueueError::UnknownQueue(queue));
        }

        let now = Utc::now();
        let run_at = opts
            .process_at
            .or_else(|| {
                opts.process_in.map(|d| {
                    now + chrono::TimeDelta::from_std(d).unwrap_or_else(|_| chrono::TimeDelta::zero())
                })
            })
            .unwrap_or(now);
        let singleton_key = opts.singleton_key;
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_owned(),
            queue,
            payload,
            run_at,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(self.inner.cfg.default_max_retries),
            timeout: opts.timeout.unwrap_or(self.inner.cfg.default_timeout),
            created_at: now,
            last_error: None,
        };

        match &self.inner.mode {
            Mode::Noop => {
                info!(job_type, job_id = %job.id, "queue backend absent, discarding job");
                Ok(job.id)
            }
            Mode::Durable { cmd_tx } => {
                let (reply, rx) = oneshot::channel();
                let cmd = Command::Enqueue {
                    job,
                    singleton_key,
                    reply,
                };
                if cmd_tx.send(cmd).await.is_err() {
                    return Err(EnqueueError::ShuttingDown);
                }
                rx.await.unwrap_or(Err(EnqueueError::ShuttingDown))
            }
        }
    }

    /// Spin up the worker pool. No-op when no backend is configured.
    pub async fn start(&self) {
        if let Mode::Durable { cmd_tx } = &self.inner.mode {
            let _ = cmd_tx.send(Command::Start).await;
        }
    }

    /// Stop accepting work, wait for in-flight jobs to finish (each bounded
    /// by its own timeout), then return. Idempotent.
    pub async fn shutdown(&self) {
        if let Mode::Durable { cmd_tx } = &self.inner.mode {
            let (reply, rx) = oneshot::channel();
            if cmd_tx.send(Command::Shutdown { reply }).await.is_err() {
                return;
            }
            let _ = rx.await;
        }
    }

    /// Queue depths and lifetime counters for the operator surface.
    pub async fn stats(&self) -> JobStatsSnapshot {
        match &self.inner.mode {
            Mode::Noop => JobStatsSnapshot::default(),
            Mode::Durable { cmd_tx } => {
                let (reply, rx) = oneshot::channel();
                if cmd_tx.send(Command::Stats { reply }).await.is_err() {
                    return JobStatsSnapshot::default();
                }
                rx.await.unwrap_or_default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher task
// ---------------------------------------------------------------------------

enum Command {
    Enqueue {
        job: Job,
        singleton_key: Option<String>,
        reply: oneshot::Sender<Result<String, EnqueueError>>,
    },
    Start,
    Stats {
        reply: oneshot::Sender<JobStatsSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Outcome {
    job: Job,
    result: Result<(), JobError>,
}

struct Dispatcher {
    cfg: JobsConfig,
    store: JobStore,
    handlers: HandlerMap,
    cmd_rx: mpsc::Receiver<Command>,
    completion_tx: mpsc::Sender<Outcome>,
    completion_rx: mpsc::Receiver<Outcome>,
    /// Expanded weighted round-robin schedule over queue names.
    schedule: Vec<String>,
    cursor: usize,
    in_flight: usize,
    completed: u64,
    started: bool,
    drain_reply: Option<oneshot::Sender<()>>,
}

impl Dispatcher {
    fn new(
        cfg: JobsConfig,
        store: JobStore,
        handlers: HandlerMap,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(cfg.concurrency.max(1));
        let schedule = build_schedule(&cfg.queues);
        Dispatcher {
            cfg,
            store,
            handlers,
            cmd_rx,
            completion_tx,
            completion_rx,
            schedule,
            cursor: 0,
            in_flight: 0,
            completed: 0,
            started: false,
            drain_reply: None,
        }
    }

    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => break,
                    Some(cmd) => {
                        if self.handle(cmd) {
                            break;
                        }
                    }
                },
                _ = poll.tick(), if self.started && self.drain_reply.is_none() => {
                    self.dispatch();
                }
                Some(outcome) = self.completion_rx.recv(), if self.in_flight > 0 => {
                    self.on_outcome(outcome);
                    if self.in_flight == 0 {
                        if let Some(reply) = self.drain_reply.take() {
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }
        debug!("job dispatcher stopped");
    }

    /// Returns true when the dispatcher should exit.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Enqueue {
                job,
                singleton_key,
                reply,
            } => {
                let result = if self.drain_reply.is_some() {
                    Err(EnqueueError::ShuttingDown)
                } else {
                    match self.store.insert(&job, singleton_key.as_deref()) {
                        Ok(true) => Ok(job.id),
                        Ok(false) => {
                            debug!(job_id = %job.id, "singleton already pending, enqueue ignored");
                            Ok(job.id)
                        }
                        Err(e) => Err(EnqueueError::Backend(e.to_string())),
                    }
                };
                let _ = reply.send(result);
                false
            }
            Command::Start => {
                if !self.started {
                    self.started = true;
                    info!(
                        concurrency = self.cfg.concurrency,
                        queues = ?self.cfg.queues,
                        "job workers started"
                    );
                }
                false
            }
            Command::Stats { reply } => {
                let mut snapshot = self.store.counts(Utc::now()).unwrap_or_default();
                snapshot.running = self.in_flight as u64;
                snapshot.completed = self.completed;
                let _ = reply.send(snapshot);
                false
            }
            Command::Shutdown { reply } => {
                if self.in_flight == 0 {
                    let _ = reply.send(());
                    true
                } else {
                    info!(in_flight = self.in_flight, "job runtime draining");
                    self.drain_reply = Some(reply);
                    false
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Leasing and execution
    // -----------------------------------------------------------------------

    fn dispatch(&mut self) {
        while self.in_flight < self.cfg.concurrency {
            let Some(job) = self.next_job() else { break };
            self.execute(job);
        }
    }

    /// Walk the weighted schedule at most one full turn and lease the first
    /// due job found.
    fn next_job(&mut self) -> Option<Job> {
        if self.schedule.is_empty() {
            return None;
        }
        let now = Utc::now();
        for _ in 0..self.schedule.len() {
            let queue = self.schedule[self.cursor].clone();
            self.cursor = (self.cursor + 1) % self.schedule.len();
            match self.store.next_due(&queue, now) {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %queue, error = %e, "failed to lease job");
                    return None;
                }
            }
        }
        None
    }

    fn execute(&mut self, job: Job) {
        let Some(handler) = self
            .handlers
            .read()
            .expect("handler map lock poisoned")
            .get(&job.job_type)
            .cloned()
        else {
            // Retrying cannot conjure a handler; dead-letter immediately.
            error!(job_type = %job.job_type, job_id = %job.id, "no handler registered");
            if let Err(e) = self.store.dead_letter(&job, "no handler registered") {
                error!(error = %e, "failed to dead-letter job");
            }
            return;
        };

        self.in_flight += 1;
        let ctx = JobContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            attempt: job.retry_count + 1,
        };
        let payload = job.payload.clone();
        let timeout = job.timeout;
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let invocation = AssertUnwindSafe(handler(ctx, payload)).catch_unwind();
            let result = match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(result)) => result,
                Ok(Err(_panic)) => Err(JobError::Fatal("handler panicked".to_owned())),
                Err(_elapsed) => Err(JobError::Timeout),
            };
            let _ = completion_tx.send(Outcome { job, result }).await;
        });
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        self.in_flight -= 1;
        let job = outcome.job;
        match outcome.result {
            Ok(()) => {
                self.completed += 1;
                debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                if let Err(e) = self.store.complete(&job.id) {
                    error!(error = %e, job_id = %job.id, "failed to remove completed job");
                }
            }
            Err(err) => {
                let exhausted = job.retry_count >= job.max_retries;
                if err.is_fatal() || exhausted {
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = job.retry_count + 1,
                        error = %err,
                        "job dead-lettered"
                    );
                    if let Err(e) = self.store.dead_letter(&job, &err.to_string()) {
                        error!(error = %e, job_id = %job.id, "failed to dead-letter job");
                    }
                } else {
                    let delay = self.cfg.retry.backoff(job.retry_count);
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt = job.retry_count + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "job failed, retrying"
                    );
                    let run_at = Utc::now()
                        + chrono::TimeDelta::from_std(delay)
                            .unwrap_or_else(|_| chrono::TimeDelta::zero());
                    if let Err(e) = self.store.schedule_retry(&job.id, run_at, &err.to_string()) {
                        error!(error = %e, job_id = %job.id, "failed to schedule retry");
                    }
                }
            }
        }
    }
}

/// Expand `{critical:6, default:3, low:1}` into an interleaved service
/// order: `c d l c d c d c c c`.
fn build_schedule(queues: &[(String, u32)]) -> Vec<String> {
    let mut remaining: Vec<(&str, u32)> =
        queues.iter().map(|(n, w)| (n.as_str(), *w)).collect();
    let mut schedule = Vec::with_capacity(queues.iter().map(|(_, w)| *w as usize).sum());
    while remaining.iter().any(|(_, w)| *w > 0) {
        for entry in &mut remaining {
            if entry.1 > 0 {
                schedule.push(entry.0.to_owned());
                entry.1 -= 1;
            }
        }
    }
    schedule
}
