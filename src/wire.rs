//! The single composition step.
//!
//! `wire` constructs the broker hub, the job runtime, the component
//! registry, and the auth store; registers the auth-owned job handlers;
//! starts the workers; bootstraps the maintenance chains; and assembles the
//! HTTP router with the component rewrite filter. Collaborators the kit
//! cannot own (password hashing, mail delivery) come in through
//! [`Dependencies`].

use crate::config::{Config, ConfigError};
use bk_auth::{AuthStore, Mailer, PasswordVerifier};
use bk_broker::BrokerHandle;
use bk_components::ComponentRegistry;
use bk_jobs::{JobRuntime, StoreError};
use server::AppState;
use std::sync::Arc;
use tracing::{info, warn};

/// External collaborators injected at wiring time -- never globals.
pub struct Dependencies {
    pub mailer: Arc<dyn Mailer>,
    pub verifier: Box<dyn PasswordVerifier>,
}

impl Default for Dependencies {
    fn default() -> Self {
        Dependencies {
            mailer: Arc::new(bk_auth::LogMailer),
            verifier: Box::new(bk_auth::PlaintextVerifier),
        }
    }
}

/// Fatal start-up failures.
#[derive(Debug)]
pub enum WireError {
    Config(ConfigError),
    /// The durable job queue could not be opened.
    QueueBackend(StoreError),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Config(e) => write!(f, "configuration error: {}", e),
            WireError::QueueBackend(e) => write!(f, "queue backend error: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<ConfigError> for WireError {
    fn from(e: ConfigError) -> Self {
        WireError::Config(e)
    }
}

/// Everything the wiring produced: the handles the application composes
/// against, and the router assembly.
pub struct Kit {
    pub broker: BrokerHandle,
    pub jobs: JobRuntime,
    pub components: Arc<ComponentRegistry>,
    pub auth: Arc<AuthStore>,
    state: AppState,
}

impl std::fmt::Debug for Kit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kit").finish_non_exhaustive()
    }
}

impl Kit {
    /// The kit endpoints merged with the application's routes, all behind
    /// the component rewrite filter. Pass `Router::new()` for a bare kit.
    pub fn router(&self, app: axum::Router) -> axum::Router {
        server::build_router(self.state.clone(), app)
    }

    /// Stop the broker (closing every subscriber), then drain the job
    /// runtime. Idempotent.
    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
        self.jobs.shutdown().await;
    }
}

pub async fn wire(config: Config, deps: Dependencies) -> Result<Kit, WireError> {
    config.validate()?;

    let broker = bk_broker::hub::spawn(config.broker_config());
    let jobs = JobRuntime::new(config.jobs_config()).map_err(WireError::QueueBackend)?;
    let components = Arc::new(ComponentRegistry::new());
    let auth = Arc::new(AuthStore::new(config.auth_config(), deps.verifier));

    let maintenance = config.maintenance_interval();
    bk_auth::register_handlers(&jobs, Arc::clone(&auth), deps.mailer, maintenance);
    jobs.start().await;
    if let Err(e) = bk_auth::bootstrap_maintenance(&jobs, maintenance).await {
        // Only reachable when the freshly opened backend rejects writes.
        warn!(error = %e, "maintenance bootstrap failed");
    }

    let state = AppState {
        broker: broker.clone(),
        jobs: jobs.clone(),
        components: Arc::clone(&components),
        auth: Arc::clone(&auth),
        dev_mode: config.dev_mode,
        secure_cookies: config.secure_cookies,
    };

    info!(
        dev_mode = config.dev_mode,
        durable_jobs = config.jobs.queue_path.is_some(),
        "kit wired"
    );
    Ok(Kit {
        broker,
        jobs,
        components,
        auth,
        state,
    })
}
