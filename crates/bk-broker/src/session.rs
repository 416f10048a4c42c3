//! Session and subscriber types owned by the hub task.

use crate::buffer::ReplayBuffer;
use bk_protocol::Event;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result of one non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// The subscriber's queue is full; the hub drops it rather than block.
    Full,
    /// The receiving endpoint is gone.
    Closed,
}

/// The transient binding between a connected client and its session.
///
/// Holds the sending half of a bounded channel; the SSE endpoint drains the
/// receiving half. Dropping the subscriber closes the channel, which the
/// endpoint observes as end-of-stream.
#[derive(Debug)]
pub struct Subscriber {
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    /// Create a subscriber with the given fan-out queue depth and return the
    /// draining half for the endpoint.
    pub fn channel(depth: usize) -> (Subscriber, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Subscriber { tx }, rx)
    }

    /// Deliver without blocking. The hub never waits on a slow client.
    pub fn deliver(&self, event: Event) -> DeliveryResult {
        match self.tx.try_send(event) {
            Ok(()) => DeliveryResult::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryResult::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryResult::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A durable identity for one logical client across reconnects.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub buffer: ReplayBuffer,
    pub subscriber: Option<Subscriber>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub reconnect_count: u32,
    /// Free-form key/value pairs established at first connect.
    pub metadata: HashMap<String, String>,
}

impl Session {
    pub fn new(
        id: String,
        buffer_capacity: usize,
        buffer_ttl: Duration,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Session {
            id,
            buffer: ReplayBuffer::new(buffer_capacity, buffer_ttl),
            subscriber: None,
            created_at: now,
            last_seen_at: now,
            reconnect_count: 0,
            metadata,
        }
    }

    /// True while a live endpoint is draining this session.
    pub fn has_live_subscriber(&self) -> bool {
        self.subscriber.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Drop the attached subscriber, closing its channel.
    pub fn detach(&mut self, now: DateTime<Utc>) {
        self.subscriber = None;
        self.last_seen_at = now;
    }
}
