use thiserror::Error;

/// Rejected publish.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Empty, or a wildcard pattern where a concrete topic is needed.
    #[error("cannot publish on topic '{0}'")]
    InvalidTopic(String),
}

/// Delivery problems surfaced to a subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The subscriber fell behind and the oldest events were dropped.
    #[error("subscriber lagged, {skipped} events dropped")]
    Lagged { skipped: u64 },

    /// The bus has been shut down.
    #[error("event bus closed")]
    Closed,
}
