//! Job values and handler plumbing.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Queue tier used when an enqueue names none.
pub const DEFAULT_QUEUE: &str = "default";

/// One unit of background work as stored on the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    /// Dotted type name, e.g. `"email:welcome"` or `"cleanup:sessions"`.
    pub job_type: String,
    pub queue: String,
    /// Opaque payload, conventionally JSON.
    pub payload: Vec<u8>,
    /// Earliest wall-clock time the job may run.
    pub run_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Caller-supplied knobs for one enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority tier; `DEFAULT_QUEUE` when absent.
    pub queue: Option<String>,
    /// Run no earlier than now + this delay.
    pub process_in: Option<Duration>,
    /// Run no earlier than this instant; wins over `process_in`.
    pub process_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    /// When set, the key becomes the job id and an enqueue is a no-op while
    /// a pending job with the same key exists. Used by self-rescheduling
    /// maintenance producers so restarts do not multiply their chains.
    pub singleton_key: Option<String>,
}

/// Handler outcome. The runtime decides policy from the variant: retryable
/// failures climb the backoff ladder, fatal ones dead-letter immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    Retryable(String),
    Fatal(String),
    /// The per-invocation context expired; treated as retryable.
    Timeout,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Retryable(s) => write!(f, "retryable: {}", s),
            JobError::Fatal(s) => write!(f, "fatal: {}", s),
            JobError::Timeout => write!(f, "handler timed out"),
        }
    }
}

impl std::error::Error for JobError {}

impl JobError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }
}

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: String,
    /// 1 on the first invocation, `retry_count + 1` on retries.
    pub attempt: u32,
}

pub type HandlerResult = Result<(), JobError>;

/// A registered handler: owned, shareable, invoked on worker tasks.
pub type JobHandler =
    Arc<dyn Fn(JobContext, Vec<u8>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async fn (or closure returning a future) as a [`JobHandler`].
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, payload| Box::pin(f(ctx, payload)))
}
