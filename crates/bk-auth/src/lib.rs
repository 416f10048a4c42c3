//! Session authentication core.
//!
//! In scope here are the semantics that bleed into the rest of the kit:
//! login attempt tracking with lockout and rate limiting, session tokens
//! with expiry, the welcome-mail job the signup path enqueues, and the
//! periodic maintenance producers that ride the job runtime. Password
//! hashing and SMTP delivery stay behind the [`PasswordVerifier`] and
//! [`Mailer`] seams; they are external collaborators.

pub mod maintenance;
pub mod store;

pub use maintenance::{
    ACCOUNTS_UNLOCK, CLEANUP_SESSIONS, EMAIL_WELCOME, bootstrap_maintenance, register_handlers,
    signup,
};
pub use store::{
    Account, AuthConfig, AuthSession, AuthStore, LogMailer, LoginError, MailError, Mailer,
    PasswordVerifier, PlaintextVerifier, SignupError,
};
