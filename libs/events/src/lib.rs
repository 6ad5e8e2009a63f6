//! # kiln-events
//!
//! Event definitions and the in-process event bus.
//!
//! ## Design Principles
//!
//! - Envelopes are immutable once published
//! - Producers never block on consumers: each subscriber owns a bounded
//!   buffer that drops its oldest entry when full and reports the gap
//! - Ordering is per subscriber, in publish order; nothing is promised
//!   across topics
//!
//! ## Topics
//!
//! - Intents, produced by the command layer: `vm.created`, `vm.updated`,
//!   `vm.deleted`
//! - Status, produced by the reconciler: `vm.status.updated`,
//!   `vm.status.failed`, `vm.status.deleted`
//!
//! Topic names are otherwise free-form; a subscription filter ending in
//! `.*` matches every topic under that prefix.

mod bus;
mod envelope;
mod error;
mod event;

pub use bus::{EventBus, Subscription, TopicFilter, DEFAULT_SUBSCRIBER_CAPACITY};
pub use envelope::EventEnvelope;
pub use error::{BusError, EventError};
pub use event::{topics, Event, StatusSnapshot};
