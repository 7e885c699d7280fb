//! The job store abstraction.
//!
//! The store is the only shared mutable resource in the system; every component reaches it
//! through [`crate::queue::DelayedJobQueue`]'s operations. The provided
//! [`memory::InMemoryStore`] keeps jobs in process memory — it relies on the recovery
//! scanner to repopulate state after a restart. A persistent implementation (database,
//! durable queue) plugs in behind the same trait and keeps `Pending`/`Failed` records
//! across restarts.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;

use crate::job::{AttemptError, JobId, JobKey, JobState, NewJob, ReminderJob};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be read or written. Propagated to callers of enqueue/cancel;
    /// counted per-event inside recovery sweeps.
    #[error("job store in a bad state")]
    BadState,
    #[error("no job found for {0}")]
    NotFound(JobKey),
    /// An attempt reported a result for an incarnation that has since been replaced.
    #[error("stale report for {key}: incarnation {id} has been superseded")]
    Stale { key: JobKey, id: JobId },
}

/// How an [`JobStore::upsert`] resolved, carrying the id of the installed incarnation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Upserted {
    /// No live job held the key.
    Inserted(JobId),
    /// A live job held the key and was replaced.
    Replaced(JobId),
}

/// Storage contract backing the delayed job queue.
///
/// Implementations must serialize all operations touching a single key; the reference
/// implementation holds one lock over the whole job table.
#[async_trait]
pub trait JobStore: Clone {
    /// Installs `job` under its key as a fresh `Pending` incarnation.
    ///
    /// If a live (`Pending`/`Firing`) job already holds the key it is replaced — attempts
    /// reset, new fire time, new id. Terminal records are simply superseded.
    async fn upsert(&self, job: NewJob) -> Result<Upserted, StoreError>;

    /// Cancels the `Pending` job under `key`, returning the cancelled record.
    ///
    /// Absent keys and jobs in any other state return `Ok(None)`: a `Firing` job runs its
    /// current attempt to completion regardless.
    async fn cancel(&self, key: &JobKey) -> Result<Option<ReminderJob>, StoreError>;

    async fn get(&self, key: &JobKey) -> Result<Option<ReminderJob>, StoreError>;

    /// An endless stream of jobs whose fire time has elapsed, earliest first.
    ///
    /// Yielding a job claims it: the record transitions `Pending -> Firing` and its attempt
    /// counter is incremented atomically with the read. The stream suspends until the
    /// earliest pending fire time and must re-evaluate early whenever an enqueue installs a
    /// nearer deadline.
    async fn due_jobs(&self) -> Pin<Box<dyn Stream<Item = Result<ReminderJob, StoreError>> + Send>>;

    /// Marks the `Firing` incarnation `id` as `Completed`.
    async fn mark_completed(&self, key: &JobKey, id: JobId) -> Result<(), StoreError>;

    /// Re-arms the `Firing` incarnation `id` as `Pending` at `fire_at`, recording the error
    /// of the attempt that just failed.
    async fn re_arm(
        &self,
        key: &JobKey,
        id: JobId,
        fire_at: DateTime<Utc>,
        error: AttemptError,
    ) -> Result<(), StoreError>;

    /// Marks the `Firing` incarnation `id` as terminally `Failed`.
    async fn mark_failed(
        &self,
        key: &JobKey,
        id: JobId,
        error: AttemptError,
    ) -> Result<(), StoreError>;

    /// Removes records in `state` that reached it before `cutoff`, returning how many were
    /// removed.
    async fn prune(&self, state: JobState, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}
