//! basekit: a server-side kit gluing four concurrent subsystems behind one
//! wiring step: a real-time SSE fan-out broker with reconnect/replay, a
//! typed background job runtime over a durable queue, a session auth core
//! with scheduled maintenance, and a server-side `<bk-*>` component
//! expander that rewrites outbound HTML.
//!
//! Call [`wire`] with a [`Config`] and [`Dependencies`]; serve the returned
//! router; broadcast through the broker handle; enqueue through the job
//! runtime; register components on the registry.

pub mod config;
pub mod wire;

pub use config::{Config, ConfigError, load_config_from_path, load_config_from_str};
pub use wire::{Dependencies, Kit, WireError, wire};

// The subsystem handles an application composes against.
pub use bk_auth::{AuthStore, Mailer, PasswordVerifier};
pub use bk_broker::BrokerHandle;
pub use bk_components::{ComponentRegistry, RenderError};
pub use bk_jobs::{EnqueueOptions, JobError, JobRuntime, handler as job_handler};
pub use bk_protocol::{Event, EventId, event_names};
