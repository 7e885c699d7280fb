//! The core job types held by the [`crate::store::JobStore`].

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Caller-supplied identity of a job.
///
/// At most one live ([`JobState::Pending`] or [`JobState::Firing`]) job exists per key:
/// enqueuing under a key that is already live replaces the previous job rather than creating
/// a duplicate. Keys are also the handle for cancellation and status queries.
///
/// Keys must be non-empty.
///
/// # Example
///
/// ```
/// use remindq::job::JobKey;
///
/// let key = JobKey::new("reminder-42").unwrap();
/// assert_eq!(key.as_str(), "reminder-42");
/// assert!(JobKey::new("").is_err());
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JobKey(String);

impl JobKey {
    /// Creates a key, rejecting empty or whitespace-only input.
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidKey> {
        let key = key.into();
        if key.trim().is_empty() {
            Err(InvalidKey)
        } else {
            Ok(Self(key))
        }
    }

    // For keys built from a non-empty literal prefix, where validation cannot fail.
    pub(crate) fn from_raw(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when constructing a [`JobKey`] from an empty string.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("job keys must be non-empty")]
pub struct InvalidKey;

/// Store-assigned identity of one incarnation of a job record.
///
/// A key keeps its identity across replacement, an id does not: replacing a job installs a
/// fresh id under the same key. Completion and failure reports carry the id of the attempt
/// they belong to, so a report from a superseded incarnation is detected and discarded
/// instead of clobbering the replacement.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    /// Waiting for its fire time. The only state from which a job can be cancelled.
    Pending,
    /// The delivery handler is running. Runs to completion regardless of concurrent
    /// cancellation requests.
    Firing,
    /// The handler succeeded. Records in this state may be pruned.
    Completed,
    /// Every attempt failed. Retained for inspection, never pruned automatically.
    Failed,
    /// Cancelled before firing.
    Cancelled,
}

impl JobState {
    /// Whether a job in this state still occupies its key for deduplication purposes.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Firing)
    }
}

/// What went wrong during a single delivery attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureKind {
    /// The delivery channel reported a failure.
    Delivery,
    /// The handler did not finish within the configured timeout.
    Timeout,
    /// The handler panicked.
    Panic,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivery => write!(f, "delivery"),
            Self::Timeout => write!(f, "timeout"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

/// The error record of one failed attempt.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub attempt: u16,
    pub kind: FailureKind,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

/// A job record as held by the store.
#[derive(Debug, Clone)]
pub struct ReminderJob {
    pub key: JobKey,
    pub id: JobId,
    pub state: JobState,
    /// Absolute instant the handler should run. Set at enqueue time; caller-driven
    /// rescheduling replaces the record rather than mutating this in place. The retry path
    /// re-arms the record with `now + backoff(attempts)`.
    pub fire_at: DateTime<Utc>,
    /// Opaque data handed to the delivery channel.
    pub payload: Value,
    /// Attempts started so far. Incremented when an attempt is claimed, so it is 1 while the
    /// first attempt is firing.
    pub attempts: u16,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    /// One entry per failed attempt, oldest first.
    pub errors: Vec<AttemptError>,
    pub inserted_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl ReminderJob {
    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// The instant this record reached a terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.cancelled_at).or(self.failed_at)
    }
}

/// A job to be enqueued.
///
/// # Example
///
/// ```
/// use chrono::{TimeDelta, Utc};
/// use remindq::backoff::BackoffPolicy;
/// use remindq::job::{JobKey, NewJob};
///
/// let job = NewJob::new(
///     JobKey::new("reminder-42").unwrap(),
///     Utc::now() + TimeDelta::hours(6),
/// )
/// .with_payload(serde_json::json!({ "entity_id": "42" }))
/// .with_max_attempts(3)
/// .with_backoff(BackoffPolicy::exponential(TimeDelta::seconds(60)));
///
/// assert_eq!(job.max_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct NewJob {
    pub key: JobKey,
    pub fire_at: DateTime<Utc>,
    pub payload: Value,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
}

impl NewJob {
    const DEFAULT_MAX_ATTEMPTS: u16 = 3;
    const DEFAULT_BACKOFF: BackoffPolicy =
        BackoffPolicy::exponential(chrono::TimeDelta::seconds(60))
            .with_max(chrono::TimeDelta::hours(1));

    pub fn new(key: JobKey, fire_at: DateTime<Utc>) -> Self {
        Self {
            key,
            fire_at,
            payload: Value::Null,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }

    pub fn with_payload(self, payload: Value) -> Self {
        Self { payload, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_backoff(self, backoff: BackoffPolicy) -> Self {
        Self { backoff, ..self }
    }

    /// Turns this into a fresh [`JobState::Pending`] record under the given incarnation id.
    pub fn into_record(self, id: JobId, now: DateTime<Utc>) -> ReminderJob {
        ReminderJob {
            key: self.key,
            id,
            state: JobState::Pending,
            fire_at: self.fire_at,
            payload: self.payload,
            attempts: 0,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            errors: vec![],
            inserted_at: now,
            attempted_at: None,
            completed_at: None,
            cancelled_at: None,
            failed_at: None,
        }
    }
}
