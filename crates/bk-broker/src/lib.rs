//! In-process fan-out broker for server-sent events.
//!
//! A single hub task owns every session and its replay buffer; all external
//! interaction goes through [`BrokerHandle`] over channels. Clients that
//! disconnect keep their session alive for the buffer TTL and can resume with
//! a `Last-Event-ID` cursor; events they missed are replayed before the live
//! feed continues.

pub mod buffer;
pub mod hub;
pub mod session;

pub use buffer::ReplayBuffer;
pub use hub::{BrokerConfig, BrokerHandle, RegisterError, Registration};
pub use session::{DeliveryResult, Session, Subscriber};
