//! The broker hub: one task owning every session.
//!
//! All mutation of session and buffer state happens on the hub task; the
//! outside world talks to it through [`BrokerHandle`] over an mpsc command
//! channel. The hub selects on commands plus two timers (heartbeat and
//! eviction) and never blocks on an outbound send -- slow subscribers are
//! dropped and recover via reconnect-with-cursor.

use crate::buffer::Replay;
use crate::session::{DeliveryResult, Session, Subscriber};
use bk_protocol::{BrokerStatsSnapshot, Event, EventId, event_names};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Max events retained per session buffer.
    pub buffer_size: usize,
    /// Retention window after disconnect; also the session lifetime without
    /// an attached subscriber.
    pub buffer_ttl: Duration,
    /// Period of the `heartbeat` broadcast.
    pub heartbeat_interval: Duration,
    /// Capacity of each subscriber's fan-out channel.
    pub subscriber_queue_depth: usize,
    /// When false, sessions carry no buffers and clients only see live events.
    pub enable_reconnection: bool,
    /// Period of the stale-session eviction scan.
    pub cleanup_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            buffer_size: 1000,
            buffer_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            subscriber_queue_depth: 16,
            enable_reconnection: true,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Why a register was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The session id is currently held by a live subscriber; the second
    /// client is refused and the existing connection stays.
    SessionConflict,
    /// The hub is no longer accepting work.
    ShuttingDown,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::SessionConflict => write!(f, "session already has a live subscriber"),
            RegisterError::ShuttingDown => write!(f, "broker is shutting down"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Everything a successful register hands the endpoint.
#[derive(Debug)]
pub struct Registration {
    /// The assigned session id (freshly minted when the supplied one was
    /// unknown or absent).
    pub session_id: String,
    /// Live feed; closed by the hub on shutdown or slow-subscriber drop.
    pub events: mpsc::Receiver<Event>,
    /// Buffered events to write before the live feed, oldest first. When
    /// `dropped` is set the first entry is the synthetic `buffer-overflow`
    /// event.
    pub replay: Vec<Event>,
    pub dropped: bool,
}

/// Cloneable handle to the hub task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Attach a subscriber, minting or reviving a session.
    pub async fn register(
        &self,
        session_id: Option<String>,
        last_event_id: Option<EventId>,
        metadata: HashMap<String, String>,
    ) -> Result<Registration, RegisterError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Register {
            session_id,
            last_event_id,
            metadata,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return Err(RegisterError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(RegisterError::ShuttingDown))
    }

    /// Detach a session's subscriber. Safe to call from `Drop` impls.
    pub fn unregister(&self, session_id: &str) {
        let _ = self.cmd_tx.try_send(Command::Unregister {
            session_id: session_id.to_owned(),
        });
    }

    /// Fire-and-forget broadcast to every live session.
    pub fn broadcast(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        let cmd = Command::Broadcast {
            name: name.into(),
            data: data.into(),
        };
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("broker command queue full, broadcast dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("broadcast after broker shutdown ignored");
            }
        }
    }

    /// Current operator counters, or `None` after shutdown.
    pub async fn stats(&self) -> Option<BrokerStatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Stop the hub: close every subscriber and drop all sessions.
    /// Idempotent -- later calls return once the hub is already gone.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    Register {
        session_id: Option<String>,
        last_event_id: Option<EventId>,
        metadata: HashMap<String, String>,
        reply: oneshot::Sender<Result<Registration, RegisterError>>,
    },
    Unregister {
        session_id: String,
    },
    Broadcast {
        name: String,
        data: Vec<u8>,
    },
    Stats {
        reply: oneshot::Sender<BrokerStatsSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Spawn the hub task and return its handle.
pub fn spawn(config: BrokerConfig) -> BrokerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let hub = Hub::new(config, cmd_rx);
    tokio::spawn(hub.run());
    BrokerHandle { cmd_tx }
}

// ---------------------------------------------------------------------------
// Hub task
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    reconnects: u64,
    events_broadcast: u64,
    slow_subscriber_drops: u64,
}

struct Hub {
    cfg: BrokerConfig,
    cmd_rx: mpsc::Receiver<Command>,
    /// Per-instance entropy; the high half of every event id.
    boot: u64,
    next_seq: u64,
    sessions: HashMap<String, Session>,
    counters: Counters,
}

impl Hub {
    fn new(cfg: BrokerConfig, cmd_rx: mpsc::Receiver<Command>) -> Self {
        Hub {
            cfg,
            cmd_rx,
            boot: rand::thread_rng().r#gen(),
            next_seq: 0,
            sessions: HashMap::new(),
            counters: Counters::default(),
        }
    }

    async fn run(mut self) {
        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.cfg.heartbeat_interval,
            self.cfg.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = interval_at(start + self.cfg.cleanup_interval, self.cfg.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(boot = format_args!("{:016x}", self.boot), "broker hub started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Shutdown { reply }) => {
                        self.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = cleanup.tick() => self.evict_stale(Utc::now()),
            }
        }
        info!("broker hub stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                session_id,
                last_event_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.register(session_id, last_event_id, metadata));
            }
            Command::Unregister { session_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.detach(Utc::now());
                    debug!(session_id = %session_id, "subscriber detached");
                }
            }
            Command::Broadcast { name, data } => self.broadcast(&name, data),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    // -----------------------------------------------------------------------
    // Register / replay
    // -----------------------------------------------------------------------

    fn register(
        &mut self,
        supplied_id: Option<String>,
        last_event_id: Option<EventId>,
        metadata: HashMap<String, String>,
    ) -> Result<Registration, RegisterError> {
        let now = Utc::now();
        let known = supplied_id
            .as_deref()
            .is_some_and(|sid| self.sessions.contains_key(sid));

        if known {
            let sid = supplied_id.expect("known implies supplied");
            let session = self
                .sessions
                .get_mut(&sid)
                .expect("session existence checked above");
            if session.has_live_subscriber() {
                // A second client is racing the legitimate one. Refuse it and
                // leave the existing connection untouched.
                warn!(session_id = %sid, "register refused: session already attached");
                return Err(RegisterError::SessionConflict);
            }

            let Replay { mut events, dropped } = session.buffer.replay(last_event_id, now);
            let (subscriber, events_rx) = Subscriber::channel(self.cfg.subscriber_queue_depth);
            session.subscriber = Some(subscriber);
            session.last_seen_at = now;
            session.reconnect_count += 1;
            self.counters.reconnects += 1;

            if dropped {
                events.insert(0, self.overflow_event(&events));
            }
            info!(
                session_id = %sid,
                replayed = events.len(),
                dropped,
                "session resumed"
            );
            return Ok(Registration {
                session_id: sid,
                events: events_rx,
                replay: events,
                dropped,
            });
        }

        // Unknown or absent id: mint a fresh session.
        let sid = Uuid::new_v4().to_string();
        let capacity = if self.cfg.enable_reconnection {
            self.cfg.buffer_size
        } else {
            0
        };
        let mut session = Session::new(sid.clone(), capacity, self.cfg.buffer_ttl, metadata, now);
        let (subscriber, events_rx) = Subscriber::channel(self.cfg.subscriber_queue_depth);
        session.subscriber = Some(subscriber);
        self.sessions.insert(sid.clone(), session);
        info!(session_id = %sid, "session created");
        Ok(Registration {
            session_id: sid,
            events: events_rx,
            replay: Vec::new(),
            dropped: false,
        })
    }

    /// Synthetic marker delivered ahead of a lossy replay. Its sequence
    /// number sits just below the first replayed event so the per-subscriber
    /// id order holds across the marker.
    fn overflow_event(&self, replay: &[Event]) -> Event {
        let seq = replay.first().map_or(0, |e| e.id.seq.saturating_sub(1));
        Event {
            id: EventId::new(self.boot, seq),
            name: event_names::BUFFER_OVERFLOW.to_owned(),
            data: br#"{"message":"events were dropped while disconnected"}"#.to_vec(),
            timestamp: Utc::now(),
            replayed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast / heartbeat
    // -----------------------------------------------------------------------

    fn mint(&mut self, name: &str, data: Vec<u8>) -> Event {
        self.next_seq += 1;
        Event {
            id: EventId::new(self.boot, self.next_seq),
            name: name.to_owned(),
            data,
            timestamp: Utc::now(),
            replayed: false,
        }
    }

    fn broadcast(&mut self, name: &str, data: Vec<u8>) {
        let event = self.mint(name, data);
        self.counters.events_broadcast += 1;
        let now = event.timestamp;

        let mut detached: Vec<String> = Vec::new();
        for (sid, session) in &mut self.sessions {
            session.buffer.push(event.clone());
            let Some(subscriber) = &session.subscriber else {
                continue;
            };
            match subscriber.deliver(event.clone()) {
                DeliveryResult::Delivered => session.last_seen_at = now,
                DeliveryResult::Full => {
                    warn!(session_id = %sid, "subscriber too slow, dropping");
                    self.counters.slow_subscriber_drops += 1;
                    detached.push(sid.clone());
                }
                DeliveryResult::Closed => detached.push(sid.clone()),
            }
        }
        for sid in detached {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.detach(now);
            }
        }
    }

    fn heartbeat(&mut self) {
        let body = serde_json::json!({ "ts": Utc::now().to_rfc3339() });
        self.broadcast(event_names::HEARTBEAT, body.to_string().into_bytes());
    }

    // -----------------------------------------------------------------------
    // Eviction / shutdown / stats
    // -----------------------------------------------------------------------

    fn evict_stale(&mut self, now: DateTime<Utc>) {
        // Endpoints that vanished without an unregister show up as closed
        // subscriber channels; treat them as detached so TTL starts counting.
        for session in self.sessions.values_mut() {
            if session.subscriber.is_some() && !session.has_live_subscriber() {
                session.detach(now);
            }
        }
        let ttl = chrono::TimeDelta::from_std(self.cfg.buffer_ttl)
            .unwrap_or(chrono::TimeDelta::MAX);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.subscriber.is_some() || now - s.last_seen_at <= ttl);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "stale sessions evicted");
        }
    }

    fn close_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.subscriber = None;
        }
        self.sessions.clear();
    }

    fn stats(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            sessions: self.sessions.len(),
            attached_subscribers: self
                .sessions
                .values()
                .filter(|s| s.has_live_subscriber())
                .count(),
            reconnects: self.counters.reconnects,
            events_broadcast: self.counters.events_broadcast,
            slow_subscriber_drops: self.counters.slow_subscriber_drops,
        }
    }
}
