use bk_auth::AuthStore;
use bk_broker::BrokerHandle;
use bk_components::ComponentRegistry;
use bk_jobs::JobRuntime;
use std::sync::Arc;

/// Shared state behind every handler. Cheap to clone; all heavy parts are
/// handles or `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub jobs: JobRuntime,
    pub components: Arc<ComponentRegistry>,
    pub auth: Arc<AuthStore>,
    /// Enables the broadcast test endpoint, expansion boundary comments,
    /// and verbose error bodies.
    pub dev_mode: bool,
    /// Adds `Secure` to the session cookie; set when serving over TLS.
    pub secure_cookies: bool,
}
