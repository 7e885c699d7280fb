//! In-process implementation of [`JobStore`].
//!
//! Jobs live in a map keyed by [`JobKey`] next to a fire-time-ordered index, so waiting for
//! the next due job is a lookup of the first index entry rather than a scan of the table.
//! State does not survive a restart; the recovery scanner repopulates it.

use std::{
    collections::{BTreeSet, HashMap},
    ops::Sub,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use crate::job::{AttemptError, JobId, JobKey, JobState, NewJob, ReminderJob};

use super::{JobStore, StoreError, Upserted};

type WakeSender = mpsc::UnboundedSender<DateTime<Utc>>;

// A claim may run slightly ahead of the wall clock so a wake-up that lands a moment early
// does not loop through an extra sleep.
const CLAIM_TOLERANCE: TimeDelta = TimeDelta::milliseconds(100);

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, ReminderJob>,
    /// Pending deadlines; the first element is the next fire time across the whole store.
    schedule: BTreeSet<(DateTime<Utc>, JobId, JobKey)>,
}

/// An in-memory [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    id_counter: Arc<AtomicI64>,
    wakers: Arc<RwLock<Vec<WakeSender>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the store in paused mode: due-job streams are not woken when jobs are inserted
    /// or re-armed. Useful in tests that want to inspect queue state before anything fires;
    /// call [`InMemoryStore::wake_all`] to continue execution.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wakes every due-job stream subscriber.
    pub fn wake_all(&self) {
        let now = Utc::now();
        if let Ok(wakers) = self.wakers.read() {
            for waker in wakers.iter() {
                let _ = waker.send(now);
            }
        }
    }

    fn notify_wakers(&self, fire_at: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.paused.load(Ordering::Relaxed) {
            let wakers = self.wakers.read().map_err(|_| StoreError::BadState)?;
            for waker in wakers.iter() {
                let _ = waker.send(fire_at);
            }
        }
        Ok(())
    }

    fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
        Ok(inner.schedule.first().map(|(fire_at, _, _)| *fire_at))
    }

    /// Claims the earliest due pending job, transitioning it to `Firing`.
    fn claim_due(&self) -> Result<Option<ReminderJob>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let entry = match inner.schedule.first() {
            Some(entry) if entry.0 - now < CLAIM_TOLERANCE => entry.clone(),
            _ => return Ok(None),
        };
        inner.schedule.remove(&entry);
        let (_, _, key) = entry;
        let job = inner.jobs.get_mut(&key).ok_or(StoreError::BadState)?;
        job.state = JobState::Firing;
        job.attempts += 1;
        job.attempted_at = Some(now);
        Ok(Some(job.clone()))
    }

    /// Looks up the record for `key` and verifies the caller still holds its incarnation.
    fn live_record<'a>(
        inner: &'a mut Inner,
        key: &JobKey,
        id: JobId,
    ) -> Result<&'a mut ReminderJob, StoreError> {
        let job = inner
            .jobs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if job.id != id {
            return Err(StoreError::Stale {
                key: key.clone(),
                id,
            });
        }
        Ok(job)
    }
}

struct DueJobStream {
    store: InMemoryStore,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl DueJobStream {
    const IDLE_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<ReminderJob, StoreError> {
        loop {
            let delay = match self.store.next_fire_at()? {
                Some(fire_at) => fire_at
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::IDLE_DELAY),
                None => Self::IDLE_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(job) = self.store.claim_due()? {
                    return Ok(job);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn upsert(&self, job: NewJob) -> Result<Upserted, StoreError> {
        let now = Utc::now();
        let fire_at = job.fire_at;
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst));
        let outcome = {
            let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
            let existing = inner
                .jobs
                .get(&job.key)
                .map(|job| (job.state, job.fire_at, job.id, job.key.clone()));
            let outcome = match existing {
                Some((state, stale_fire_at, stale_id, stale_key)) if state.is_live() => {
                    if state == JobState::Pending {
                        inner.schedule.remove(&(stale_fire_at, stale_id, stale_key));
                    }
                    Upserted::Replaced(id)
                }
                _ => Upserted::Inserted(id),
            };
            let record = job.into_record(id, now);
            inner
                .schedule
                .insert((record.fire_at, id, record.key.clone()));
            inner.jobs.insert(record.key.clone(), record);
            outcome
        };
        self.notify_wakers(fire_at)?;
        Ok(outcome)
    }

    async fn cancel(&self, key: &JobKey) -> Result<Option<ReminderJob>, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let entry = match inner.jobs.get(key) {
            Some(job) if job.state == JobState::Pending => (job.fire_at, job.id, job.key.clone()),
            _ => return Ok(None),
        };
        inner.schedule.remove(&entry);
        let job = inner.jobs.get_mut(key).ok_or(StoreError::BadState)?;
        job.state = JobState::Cancelled;
        job.cancelled_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn get(&self, key: &JobKey) -> Result<Option<ReminderJob>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
        Ok(inner.jobs.get(key).cloned())
    }

    async fn due_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<ReminderJob, StoreError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut wakers) = self.wakers.write() {
            wakers.push(sender);
        }
        let mut stream = DueJobStream {
            store: self.clone(),
            receiver,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn mark_completed(&self, key: &JobKey, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let job = Self::live_record(&mut inner, key, id)?;
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn re_arm(
        &self,
        key: &JobKey,
        id: JobId,
        fire_at: DateTime<Utc>,
        error: AttemptError,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
            let job = Self::live_record(&mut inner, key, id)?;
            job.state = JobState::Pending;
            job.fire_at = fire_at;
            job.errors.push(error);
            inner.schedule.insert((fire_at, id, key.clone()));
        }
        self.notify_wakers(fire_at)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &JobKey,
        id: JobId,
        error: AttemptError,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let job = Self::live_record(&mut inner, key, id)?;
        job.state = JobState::Failed;
        job.failed_at = Some(Utc::now());
        job.errors.push(error);
        Ok(())
    }

    async fn prune(&self, state: JobState, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            job.state != state || job.finished_at().map_or(true, |at| at >= cutoff)
        });
        Ok(before - inner.jobs.len())
    }
}
