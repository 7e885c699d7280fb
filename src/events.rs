//! Read-only contract over the appointment store, consumed by the recovery scanner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The status the recovery scanner sweeps for.
pub const CONFIRMED: &str = "confirmed";

/// The fields of an appointment the scheduler reads.
#[derive(Debug, Clone)]
pub struct EventSummary {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Failure querying the event store.
#[derive(Debug, Error)]
#[error("event store unavailable: {message}")]
pub struct EventStoreError {
    pub message: String,
}

impl EventStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Query contract over the appointment store.
///
/// The core never writes through this interface; the appointment record belongs to the
/// embedding service.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events with the given status whose time falls within `[start, end)`.
    async fn events_in_window(
        &self,
        status: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventSummary>, EventStoreError>;
}
