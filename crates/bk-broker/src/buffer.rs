//! Per-session replay buffer.
//!
//! A bounded, TTL-governed log of recent events. Two policies apply:
//! - Capacity: appending beyond `capacity` drops the oldest entry and
//!   latches the `overflowed` flag.
//! - TTL: reads skip entries older than the retention window; expired
//!   entries are treated as absent.

use bk_protocol::{Event, EventId};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of a replay computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Buffered events to re-deliver, oldest first, `replayed` set on each.
    pub events: Vec<Event>,
    /// True when the buffer can no longer prove the client missed nothing;
    /// the caller must deliver a synthetic `buffer-overflow` event first.
    pub dropped: bool,
}

impl Replay {
    fn empty() -> Self {
        Replay {
            events: Vec::new(),
            dropped: false,
        }
    }
}

/// Fixed-capacity ordered container of events for one session.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<Event>,
    capacity: usize,
    ttl: TimeDelta,
    overflowed: bool,
}

impl ReplayBuffer {
    /// A `capacity` of zero disables buffering entirely (reconnection off).
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ReplayBuffer {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            overflowed: false,
        }
    }

    /// Append one event, evicting the oldest entry on overflow.
    pub fn push(&mut self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(event);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.overflowed = true;
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the events to re-deliver for a reconnect at `now`.
    ///
    /// `last` is the client's `Last-Event-ID` cursor; a cursor from another
    /// broker instance (different boot half) is treated as absent. Heartbeat
    /// events are never replayed, but they do count for the adjacency check:
    /// a gap consisting only of heartbeats is not data loss.
    pub fn replay(&self, last: Option<EventId>, now: DateTime<Utc>) -> Replay {
        let live: Vec<&Event> = self
            .entries
            .iter()
            .filter(|e| now - e.timestamp <= self.ttl)
            .collect();
        let Some(first_live) = live.first() else {
            return Replay::empty();
        };

        let last = last.filter(|cursor| cursor.same_boot(&first_live.id));

        let selected: Vec<&&Event> = live
            .iter()
            .filter(|e| !e.is_heartbeat())
            .filter(|e| last.is_none_or(|cursor| e.id.seq > cursor.seq))
            .collect();
        if selected.is_empty() {
            return Replay::empty();
        }

        // The client can only be certain it missed nothing if some remembered
        // event sits at or before cursor + 1.
        let dropped = self.overflowed
            && match last {
                None => false,
                Some(cursor) => first_live.id.seq > cursor.seq.saturating_add(1),
            };

        let events = if dropped {
            // Contiguity is lost; re-deliver everything that is remembered.
            live.iter()
                .filter(|e| !e.is_heartbeat())
                .map(|e| mark_replayed((**e).clone()))
                .collect()
        } else {
            selected.into_iter().map(|e| mark_replayed((**e).clone())).collect()
        };

        Replay { events, dropped }
    }
}

fn mark_replayed(mut event: Event) -> Event {
    event.replayed = true;
    event
}
