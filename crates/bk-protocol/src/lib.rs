// bk-protocol: shared value types for the basekit wire surfaces.
//
// Everything a client can observe crosses this crate: broadcast events and
// their ids, the SSE connect acknowledgement, the operator stats snapshot,
// and the JSON error envelope used by all non-2xx API responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Event ids
// ---------------------------------------------------------------------------

/// Identifier of one broadcast event.
///
/// `boot` is 64-bit entropy drawn once per broker instance; `seq` is a
/// strictly increasing counter. Rendered as `"{boot:016x}-{seq:016x}"`, so
/// lexicographic order equals numeric order within one instance. A cursor
/// whose boot half does not match the running instance refers to events the
/// instance never produced and is treated as absent by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub boot: u64,
    pub seq: u64,
}

impl EventId {
    pub fn new(boot: u64, seq: u64) -> Self {
        EventId { boot, seq }
    }

    /// True when both ids come from the same broker instance.
    pub fn same_boot(&self, other: &EventId) -> bool {
        self.boot == other.boot
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.boot, self.seq)
    }
}

/// Error parsing an [`EventId`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventIdError;

impl fmt::Display for ParseEventIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed event id")
    }
}

impl std::error::Error for ParseEventIdError {}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (boot, seq) = s.split_once('-').ok_or(ParseEventIdError)?;
        if boot.len() != 16 || seq.len() != 16 {
            return Err(ParseEventIdError);
        }
        let boot = u64::from_str_radix(boot, 16).map_err(|_| ParseEventIdError)?;
        let seq = u64::from_str_radix(seq, 16).map_err(|_| ParseEventIdError)?;
        Ok(EventId { boot, seq })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Well-known event names.
pub mod event_names {
    /// Broker keep-alive tick; buffered but never replayed.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Synthetic marker: the replay buffer lost events the client needed.
    pub const BUFFER_OVERFLOW: &str = "buffer-overflow";
    /// First frame on every SSE connection, carrying the assigned session id.
    pub const CONNECTED: &str = "connected";
    /// Appended to the wire `event:` field of replayed frames.
    pub const REPLAYED_SUFFIX: &str = "-replayed";
}

/// One broadcast unit. Immutable once minted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    /// Opaque payload, typically UTF-8 HTML or JSON.
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// True only on events re-emitted from a buffer after reconnection.
    pub replayed: bool,
}

impl Event {
    /// The `event:` field value for the SSE frame.
    ///
    /// Replayed events keep their original id and payload; the replay is
    /// signalled purely through the `-replayed` name suffix.
    pub fn wire_name(&self) -> Cow<'_, str> {
        if self.replayed {
            Cow::Owned(format!("{}{}", self.name, event_names::REPLAYED_SUFFIX))
        } else {
            Cow::Borrowed(&self.name)
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.name == event_names::HEARTBEAT
    }
}

// ---------------------------------------------------------------------------
// SSE connect acknowledgement
// ---------------------------------------------------------------------------

/// Payload of the `connected` frame sent before any replay or live events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAck {
    pub session_id: String,
    /// Number of buffered events about to be replayed on this connection.
    pub replayed: usize,
    /// True when the buffer overflowed while the client was away and the
    /// replay is therefore preceded by a `buffer-overflow` frame.
    pub dropped: bool,
}

// ---------------------------------------------------------------------------
// Operator stats
// ---------------------------------------------------------------------------

/// Broker half of the `/stats` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatsSnapshot {
    pub sessions: usize,
    pub attached_subscribers: usize,
    pub reconnects: u64,
    pub events_broadcast: u64,
    pub slow_subscriber_drops: u64,
}

/// Job runtime half of the `/stats` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatsSnapshot {
    pub queued: u64,
    pub scheduled: u64,
    pub running: u64,
    pub completed: u64,
    pub dead: u64,
}

/// Everything `GET /stats` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub broker: BrokerStatsSnapshot,
    pub jobs: JobStatsSnapshot,
    pub generated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// JSON body of every non-2xx API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Stable `code` values for [`HttpErrorEnvelope`].
pub mod error_codes {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// A second client presented a session id with a live subscriber.
    pub const SESSION_CONFLICT: &str = "SESSION_CONFLICT";
    pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
}
