//! In-memory auth storage: accounts, sessions, and login throttling.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub session_ttl: Duration,
    /// Consecutive failed logins before the account locks.
    pub lockout_threshold: u32,
    pub lockout_duration: Duration,
    /// Sliding window for the per-account login rate limit.
    pub rate_limit_window: Duration,
    /// Max login attempts per window, successful or not.
    pub rate_limit_max: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            session_ttl: Duration::from_secs(86_400),
            lockout_threshold: 5,
            lockout_duration: Duration::from_secs(900),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Password verification seam. Hashing is an external collaborator; the kit
/// only ever compares through this trait.
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, password_hash: &str, candidate: &str) -> bool;
}

/// Development-only verifier: plain equality. Real deployments inject a
/// hashing implementation.
#[derive(Debug, Default)]
pub struct PlaintextVerifier;

impl PasswordVerifier for PlaintextVerifier {
    fn verify(&self, password_hash: &str, candidate: &str) -> bool {
        password_hash == candidate
    }
}

#[derive(Debug, Clone)]
pub struct MailError(pub String);

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mail delivery failed: {}", self.0)
    }
}

impl std::error::Error for MailError {}

/// Mail delivery seam. SMTP is an external collaborator.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Default mailer: logs the message instead of delivering it.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        info!(to, subject, "mail delivery skipped (log mailer)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// Too many attempts inside the rate-limit window.
    RateLimited,
    Locked { until: DateTime<Utc> },
    InvalidCredentials,
}

impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginError::RateLimited => write!(f, "too many login attempts"),
            LoginError::Locked { until } => write!(f, "account locked until {}", until),
            LoginError::InvalidCredentials => write!(f, "invalid credentials"),
        }
    }
}

impl std::error::Error for LoginError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupError {
    EmailTaken,
}

impl std::fmt::Display for SignupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignupError::EmailTaken => write!(f, "email already registered"),
        }
    }
}

impl std::error::Error for SignupError {}

// ---------------------------------------------------------------------------
// AuthStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    /// Keyed by email.
    accounts: HashMap<String, Account>,
    /// Keyed by opaque session token.
    sessions: HashMap<String, AuthSession>,
    /// Login attempt timestamps per email, pruned to the rate-limit window.
    attempts: HashMap<String, VecDeque<DateTime<Utc>>>,
}

/// All auth state behind one lock. Maintenance jobs mutate this store and
/// nothing else -- broker state is never touched from job handlers.
pub struct AuthStore {
    cfg: AuthConfig,
    verifier: Box<dyn PasswordVerifier>,
    inner: RwLock<Inner>,
}

impl AuthStore {
    pub fn new(cfg: AuthConfig, verifier: Box<dyn PasswordVerifier>) -> Self {
        AuthStore {
            cfg,
            verifier,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn create_account(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<Account, SignupError> {
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        if inner.accounts.contains_key(email) {
            return Err(SignupError::EmailTaken);
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.to_owned(),
            password_hash: password_hash.to_owned(),
            failed_attempts: 0,
            locked_until: None,
            created_at: Utc::now(),
        };
        inner.accounts.insert(email.to_owned(), account.clone());
        info!(email, user_id = %account.id, "account created");
        Ok(account)
    }

    /// Attempt a login. Order of checks: rate limit, lock, credentials.
    pub fn login(&self, email: &str, candidate: &str) -> Result<AuthSession, LoginError> {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("auth store lock poisoned");

        // Sliding-window rate limit, counted per email whether or not the
        // account exists, so probing is throttled too.
        let window = TimeDelta::from_std(self.cfg.rate_limit_window).unwrap_or(TimeDelta::MAX);
        let attempts = inner.attempts.entry(email.to_owned()).or_default();
        while attempts.front().is_some_and(|t| now - *t > window) {
            attempts.pop_front();
        }
        if attempts.len() >= self.cfg.rate_limit_max {
            warn!(email, "login rate limit hit");
            return Err(LoginError::RateLimited);
        }
        attempts.push_back(now);

        let threshold = self.cfg.lockout_threshold;
        let lockout =
            TimeDelta::from_std(self.cfg.lockout_duration).unwrap_or(TimeDelta::MAX);
        let Some(account) = inner.accounts.get_mut(email) else {
            return Err(LoginError::InvalidCredentials);
        };

        if let Some(until) = account.locked_until {
            // A lock whose deadline passed no longer blocks logins; the
            // unlock job clears the flag itself.
            if until > now {
                return Err(LoginError::Locked { until });
            }
        }

        if !self.verifier.verify(&account.password_hash, candidate) {
            account.failed_attempts += 1;
            if account.failed_attempts >= threshold {
                let until = now + lockout;
                account.locked_until = Some(until);
                warn!(email, %until, "account locked after repeated failures");
            }
            return Err(LoginError::InvalidCredentials);
        }

        account.failed_attempts = 0;
        let user_id = account.id.clone();
        let session = AuthSession {
            token: Uuid::new_v4().to_string(),
            user_id,
            created_at: now,
            expires_at: now
                + TimeDelta::from_std(self.cfg.session_ttl).unwrap_or(TimeDelta::MAX),
        };
        inner.sessions.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    /// Resolve a session token to its user id, if still valid.
    pub fn validate_session(&self, token: &str) -> Option<String> {
        let inner = self.inner.read().expect("auth store lock poisoned");
        let session = inner.sessions.get(token)?;
        if session.expires_at <= Utc::now() {
            return None;
        }
        Some(session.user_id.clone())
    }

    pub fn logout(&self, token: &str) {
        self.inner
            .write()
            .expect("auth store lock poisoned")
            .sessions
            .remove(token);
    }

    pub fn account(&self, email: &str) -> Option<Account> {
        self.inner
            .read()
            .expect("auth store lock poisoned")
            .accounts
            .get(email)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .read()
            .expect("auth store lock poisoned")
            .sessions
            .len()
    }

    // -----------------------------------------------------------------------
    // Maintenance operations (invoked from job handlers)
    // -----------------------------------------------------------------------

    /// Drop up to `limit` expired sessions and stale attempt windows.
    /// Idempotent; a second run right after the first removes nothing.
    pub fn purge_expired_sessions(&self, limit: usize) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .take(limit)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            inner.sessions.remove(token);
        }
        let window = TimeDelta::from_std(self.cfg.rate_limit_window).unwrap_or(TimeDelta::MAX);
        inner
            .attempts
            .retain(|_, a| a.back().is_some_and(|t| now - *t <= window));
        expired.len()
    }

    /// Clear lock flags whose deadline has passed, at most `limit` per call.
    pub fn unlock_due_accounts(&self, limit: usize) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        let mut unlocked = 0;
        for account in inner.accounts.values_mut() {
            if unlocked >= limit {
                break;
            }
            if account.locked_until.is_some_and(|until| until <= now) {
                account.locked_until = None;
                account.failed_attempts = 0;
                unlocked += 1;
            }
        }
        unlocked
    }
}
