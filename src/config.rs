//! Kit configuration loading.
//!
//! TOML is the config source; every field has a default so an empty file
//! (or no file at all) yields a working development setup: in-memory
//! broker, no-op job runtime, dev mode off.
//!
//! # Shape
//! ```toml
//! dev_mode = true
//!
//! [broker]
//! buffer_size = 1000
//! buffer_ttl_secs = 30
//!
//! [jobs]
//! queue_path = "/var/lib/basekit/queue.sqlite3"
//!
//! [[jobs.queues]]
//! name = "critical"
//! weight = 6
//! ```

use bk_auth::AuthConfig;
use bk_broker::BrokerConfig;
use bk_jobs::JobsConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerSettings,
    pub jobs: JobsSettings,
    pub auth: AuthSettings,
    /// Enables the broadcast test endpoint, expansion boundary comments,
    /// and verbose error bodies.
    pub dev_mode: bool,
    /// Adds `Secure` to cookies; set when serving over TLS.
    pub secure_cookies: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub buffer_size: usize,
    pub buffer_ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub subscriber_queue_depth: usize,
    pub enable_reconnection: bool,
    pub cleanup_secs: u64,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    /// SQLite path of the durable queue; absent means no-op mode.
    pub queue_path: Option<PathBuf>,
    pub concurrency: usize,
    /// Priority tiers in service order with their round-robin weights.
    pub queues: Vec<QueueTier>,
    pub poll_ms: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct QueueTier {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub session_ttl_secs: u64,
    pub lockout_threshold: u32,
    pub lockout_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: usize,
    /// Period of the self-rescheduling maintenance jobs.
    pub maintenance_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            broker: BrokerSettings {
                buffer_size: 1000,
                buffer_ttl_secs: 30,
                heartbeat_secs: 25,
                subscriber_queue_depth: 16,
                enable_reconnection: true,
                cleanup_secs: 30,
            },
            jobs: JobsSettings {
                queue_path: None,
                concurrency: 10,
                queues: vec![
                    QueueTier {
                        name: "critical".to_owned(),
                        weight: 6,
                    },
                    QueueTier {
                        name: "default".to_owned(),
                        weight: 3,
                    },
                    QueueTier {
                        name: "low".to_owned(),
                        weight: 1,
                    },
                ],
                poll_ms: 250,
                max_retries: 3,
                timeout_secs: 30,
            },
            auth: AuthSettings {
                session_ttl_secs: 86_400,
                lockout_threshold: 5,
                lockout_secs: 900,
                rate_limit_window_secs: 60,
                rate_limit_max: 10,
                maintenance_secs: 60,
            },
            dev_mode: false,
            secure_cookies: false,
        }
    }
}

impl Config {
    /// Wiring preconditions. Violations are fatal at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.enable_reconnection && self.broker.buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "broker.buffer_size must be > 0 while reconnection is enabled".to_owned(),
            ));
        }
        if self.broker.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "broker.heartbeat_secs must be > 0".to_owned(),
            ));
        }
        if self.broker.subscriber_queue_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "broker.subscriber_queue_depth must be > 0".to_owned(),
            ));
        }
        if self.jobs.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "jobs.concurrency must be > 0".to_owned(),
            ));
        }
        if self.jobs.queues.is_empty() {
            return Err(ConfigError::MissingField("jobs.queues".to_owned()));
        }
        if !self.jobs.queues.iter().any(|q| q.name == "default") {
            return Err(ConfigError::InvalidValue(
                "jobs.queues must include the 'default' tier".to_owned(),
            ));
        }
        if let Some(tier) = self.jobs.queues.iter().find(|q| q.weight == 0) {
            return Err(ConfigError::InvalidValue(format!(
                "jobs.queues['{}'].weight must be > 0",
                tier.name
            )));
        }
        if self.auth.maintenance_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "auth.maintenance_secs must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            buffer_size: self.broker.buffer_size,
            buffer_ttl: Duration::from_secs(self.broker.buffer_ttl_secs),
            heartbeat_interval: Duration::from_secs(self.broker.heartbeat_secs),
            subscriber_queue_depth: self.broker.subscriber_queue_depth,
            enable_reconnection: self.broker.enable_reconnection,
            cleanup_interval: Duration::from_secs(self.broker.cleanup_secs),
        }
    }

    pub fn jobs_config(&self) -> JobsConfig {
        JobsConfig {
            queue_path: self.jobs.queue_path.clone(),
            concurrency: self.jobs.concurrency,
            queues: self
                .jobs
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.weight))
                .collect(),
            poll_interval: Duration::from_millis(self.jobs.poll_ms),
            default_max_retries: self.jobs.max_retries,
            default_timeout: Duration::from_secs(self.jobs.timeout_secs),
            retry: bk_jobs::RetryPolicy::default(),
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            session_ttl: Duration::from_secs(self.auth.session_ttl_secs),
            lockout_threshold: self.auth.lockout_threshold,
            lockout_duration: Duration::from_secs(self.auth.lockout_secs),
            rate_limit_window: Duration::from_secs(self.auth.rate_limit_window_secs),
            rate_limit_max: self.auth.rate_limit_max,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.auth.maintenance_secs)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every optional field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    broker: Option<RawBroker>,
    jobs: Option<RawJobs>,
    auth: Option<RawAuth>,
    dev_mode: Option<bool>,
    secure_cookies: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    buffer_size: Option<usize>,
    buffer_ttl_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    subscriber_queue_depth: Option<usize>,
    enable_reconnection: Option<bool>,
    cleanup_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawJobs {
    queue_path: Option<String>,
    concurrency: Option<usize>,
    queues: Option<Vec<RawQueueTier>>,
    poll_ms: Option<u64>,
    max_retries: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawQueueTier {
    name: Option<String>,
    weight: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    session_ttl_secs: Option<u64>,
    lockout_threshold: Option<u32>,
    lockout_secs: Option<u64>,
    rate_limit_window_secs: Option<u64>,
    rate_limit_max: Option<usize>,
    maintenance_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = Config::default();

    let broker = match raw.broker {
        Some(b) => BrokerSettings {
            buffer_size: b.buffer_size.unwrap_or(defaults.broker.buffer_size),
            buffer_ttl_secs: b.buffer_ttl_secs.unwrap_or(defaults.broker.buffer_ttl_secs),
            heartbeat_secs: b.heartbeat_secs.unwrap_or(defaults.broker.heartbeat_secs),
            subscriber_queue_depth: b
                .subscriber_queue_depth
                .unwrap_or(defaults.broker.subscriber_queue_depth),
            enable_reconnection: b
                .enable_reconnection
                .unwrap_or(defaults.broker.enable_reconnection),
            cleanup_secs: b.cleanup_secs.unwrap_or(defaults.broker.cleanup_secs),
        },
        None => defaults.broker.clone(),
    };

    let jobs = match raw.jobs {
        Some(j) => {
            let queues = match j.queues {
                None => defaults.jobs.queues.clone(),
                Some(raw_tiers) => {
                    let mut tiers = Vec::with_capacity(raw_tiers.len());
                    for (i, tier) in raw_tiers.into_iter().enumerate() {
                        let name = tier.name.ok_or_else(|| {
                            ConfigError::MissingField(format!("jobs.queues[{i}].name"))
                        })?;
                        tiers.push(QueueTier {
                            name,
                            weight: tier.weight.unwrap_or(1),
                        });
                    }
                    tiers
                }
            };
            JobsSettings {
                queue_path: j.queue_path.map(PathBuf::from),
                concurrency: j.concurrency.unwrap_or(defaults.jobs.concurrency),
                queues,
                poll_ms: j.poll_ms.unwrap_or(defaults.jobs.poll_ms),
                max_retries: j.max_retries.unwrap_or(defaults.jobs.max_retries),
                timeout_secs: j.timeout_secs.unwrap_or(defaults.jobs.timeout_secs),
            }
        }
        None => defaults.jobs.clone(),
    };

    let auth = match raw.auth {
        Some(a) => AuthSettings {
            session_ttl_secs: a.session_ttl_secs.unwrap_or(defaults.auth.session_ttl_secs),
            lockout_threshold: a
                .lockout_threshold
                .unwrap_or(defaults.auth.lockout_threshold),
            lockout_secs: a.lockout_secs.unwrap_or(defaults.auth.lockout_secs),
            rate_limit_window_secs: a
                .rate_limit_window_secs
                .unwrap_or(defaults.auth.rate_limit_window_secs),
            rate_limit_max: a.rate_limit_max.unwrap_or(defaults.auth.rate_limit_max),
            maintenance_secs: a.maintenance_secs.unwrap_or(defaults.auth.maintenance_secs),
        },
        None => defaults.auth.clone(),
    };

    let config = Config {
        broker,
        jobs,
        auth,
        dev_mode: raw.dev_mode.unwrap_or(false),
        secure_cookies: raw.secure_cookies.unwrap_or(false),
    };
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
