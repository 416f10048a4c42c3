//! Scheduled maintenance producers and the auth-owned job handlers.
//!
//! Maintenance is ordinary background work: each handler does one bounded
//! batch against the auth store and then re-enqueues itself with a delay,
//! using the runtime's own scheduling instead of a separate timer loop.
//! Singleton keys keep re-wiring after a restart from multiplying the
//! chains. Handlers never touch broker state.

use crate::store::{AuthStore, Mailer};
use bk_jobs::{EnqueueError, EnqueueOptions, JobError, JobRuntime, handler};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const CLEANUP_SESSIONS: &str = "cleanup:sessions";
pub const ACCOUNTS_UNLOCK: &str = "accounts:unlock";
pub const EMAIL_WELCOME: &str = "email:welcome";

/// Rows touched per maintenance run. Keeps each job short even when a large
/// backlog accumulated.
const MAINTENANCE_BATCH: usize = 500;

#[derive(Debug, Deserialize)]
struct WelcomePayload {
    user_id: String,
    email: String,
}

/// Register the auth-owned handlers on the runtime.
pub fn register_handlers(
    jobs: &JobRuntime,
    auth: Arc<AuthStore>,
    mailer: Arc<dyn Mailer>,
    maintenance_interval: Duration,
) {
    let cleanup_auth = Arc::clone(&auth);
    let cleanup_jobs = jobs.clone();
    jobs.handle(
        CLEANUP_SESSIONS,
        handler(move |_ctx, _payload| {
            let auth = Arc::clone(&cleanup_auth);
            let jobs = cleanup_jobs.clone();
            async move {
                let purged = auth.purge_expired_sessions(MAINTENANCE_BATCH);
                if purged > 0 {
                    info!(purged, "expired auth sessions removed");
                }
                reschedule(&jobs, CLEANUP_SESSIONS, maintenance_interval).await;
                Ok(())
            }
        }),
    );

    let unlock_jobs = jobs.clone();
    jobs.handle(
        ACCOUNTS_UNLOCK,
        handler(move |_ctx, _payload| {
            let auth = Arc::clone(&auth);
            let jobs = unlock_jobs.clone();
            async move {
                let unlocked = auth.unlock_due_accounts(MAINTENANCE_BATCH);
                if unlocked > 0 {
                    info!(unlocked, "locked accounts released");
                }
                reschedule(&jobs, ACCOUNTS_UNLOCK, maintenance_interval).await;
                Ok(())
            }
        }),
    );

    jobs.handle(
        EMAIL_WELCOME,
        handler(move |_ctx, payload| {
            let mailer = Arc::clone(&mailer);
            async move {
                let payload: WelcomePayload = serde_json::from_slice(&payload)
                    .map_err(|e| JobError::Fatal(format!("bad welcome payload: {e}")))?;
                mailer
                    .send(
                        &payload.email,
                        "Welcome!",
                        &format!("Your account {} is ready.", payload.user_id),
                    )
                    .map_err(|e| JobError::Retryable(e.to_string()))?;
                Ok(())
            }
        }),
    );
}

/// Kick off both maintenance chains. Safe to call on every start: the
/// singleton keys make duplicate bootstraps no-ops while a chain is pending.
pub async fn bootstrap_maintenance(
    jobs: &JobRuntime,
    maintenance_interval: Duration,
) -> Result<(), EnqueueError> {
    for job_type in [CLEANUP_SESSIONS, ACCOUNTS_UNLOCK] {
        jobs.enqueue(
            job_type,
            Vec::new(),
            EnqueueOptions {
                process_in: Some(maintenance_interval),
                singleton_key: Some(format!("maintenance:{job_type}")),
                ..EnqueueOptions::default()
            },
        )
        .await?;
    }
    Ok(())
}

async fn reschedule(jobs: &JobRuntime, job_type: &str, interval: Duration) {
    let result = jobs
        .enqueue(
            job_type,
            Vec::new(),
            EnqueueOptions {
                process_in: Some(interval),
                singleton_key: Some(format!("maintenance:{job_type}")),
                ..EnqueueOptions::default()
            },
        )
        .await;
    if let Err(e) = result {
        // Expected while draining; the chain restarts on next wire.
        debug!(job_type, error = %e, "maintenance reschedule skipped");
    }
}

/// Create an account and enqueue its welcome mail.
pub async fn signup(
    auth: &AuthStore,
    jobs: &JobRuntime,
    email: &str,
    password_hash: &str,
) -> Result<crate::store::Account, crate::store::SignupError> {
    let account = auth.create_account(email, password_hash)?;
    let payload = serde_json::json!({ "user_id": account.id, "email": account.email });
    if let Err(e) = jobs
        .enqueue(
            EMAIL_WELCOME,
            payload.to_string().into_bytes(),
            EnqueueOptions::default(),
        )
        .await
    {
        // The account exists either way; mail is best-effort.
        debug!(email, error = %e, "welcome mail enqueue failed");
    }
    Ok(account)
}
