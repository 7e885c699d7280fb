//! Domain logic translating "this appointment needs a reminder" into queue operations.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    backoff::BackoffPolicy,
    job::{JobKey, NewJob},
    queue::{DelayedJobQueue, EnqueueOutcome},
    store::{JobStore, StoreError},
};

/// Fixed interval between a reminder firing and the appointment it precedes.
pub const REMINDER_LEAD: TimeDelta = TimeDelta::hours(24);

const REMINDER_MAX_ATTEMPTS: u16 = 3;
const REMINDER_BACKOFF: BackoffPolicy =
    BackoffPolicy::exponential(TimeDelta::seconds(60)).with_max(TimeDelta::hours(1));

/// What the delivery channel receives when a reminder fires.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub entity_id: String,
}

impl ReminderPayload {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// How a scheduling request resolved.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// A reminder was already scheduled for this appointment and has been replaced.
    Replaced,
    /// The reminder point lies in the past; nothing was scheduled. A policy outcome, not an
    /// error.
    LeadElapsed,
}

/// Schedules, cancels, and reschedules appointment reminders.
///
/// Enforces at most one outstanding reminder per appointment through key construction:
/// every operation for an appointment addresses the job `reminder-{entity_id}`, and the
/// queue's replace-on-duplicate-key semantics make repeated scheduling idempotent.
pub struct ReminderScheduler<S: JobStore> {
    queue: DelayedJobQueue<S>,
}

impl<S: JobStore> Clone for ReminderScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<S> ReminderScheduler<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub fn new(queue: DelayedJobQueue<S>) -> Self {
        Self { queue }
    }

    fn reminder_key(entity_id: &str) -> JobKey {
        JobKey::from_raw(format!("reminder-{entity_id}"))
    }

    /// Ensures exactly one reminder is scheduled for the appointment, firing
    /// [`REMINDER_LEAD`] before `event_time`.
    ///
    /// Store failures propagate; the caller decides whether to retry, and the recovery
    /// sweep re-derives the reminder either way.
    pub async fn schedule_reminder(
        &self,
        entity_id: &str,
        event_time: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, StoreError> {
        let fire_at = event_time - REMINDER_LEAD;
        if fire_at <= Utc::now() {
            tracing::info!(
                entity_id,
                %event_time,
                "reminder point already passed, nothing to schedule",
            );
            return Ok(ScheduleOutcome::LeadElapsed);
        }
        let payload = serde_json::json!({ "entity_id": entity_id });
        let job = NewJob::new(Self::reminder_key(entity_id), fire_at)
            .with_payload(payload)
            .with_max_attempts(REMINDER_MAX_ATTEMPTS)
            .with_backoff(REMINDER_BACKOFF);
        match self.queue.enqueue(job).await? {
            EnqueueOutcome::Scheduled => Ok(ScheduleOutcome::Scheduled),
            EnqueueOutcome::Replaced => Ok(ScheduleOutcome::Replaced),
            // raced past the deadline between the check above and the insert
            EnqueueOutcome::PastDeadline => Ok(ScheduleOutcome::LeadElapsed),
        }
    }

    /// Cancels the appointment's pending reminder, reporting whether one existed.
    pub async fn cancel_reminder(&self, entity_id: &str) -> Result<bool, StoreError> {
        let cancelled = self.queue.cancel(&Self::reminder_key(entity_id)).await?;
        if !cancelled {
            tracing::debug!(entity_id, "no pending reminder to cancel");
        }
        Ok(cancelled)
    }

    /// Moves the appointment's reminder to match a new appointment time.
    ///
    /// The cancel settles before the new schedule call begins, so no window exists where
    /// reminders for both times are pending; the queue's keyed replacement covers any
    /// enqueue racing this call.
    pub async fn reschedule_reminder(
        &self,
        entity_id: &str,
        new_event_time: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, StoreError> {
        self.cancel_reminder(entity_id).await?;
        self.schedule_reminder(entity_id, new_event_time).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        delivery::test::RecordingChannel,
        job::JobState,
        queue::QueueConfig,
        store::memory::InMemoryStore,
    };

    use super::*;

    fn scheduler() -> (ReminderScheduler<InMemoryStore>, InMemoryStore) {
        // paused so nothing fires while tests inspect queue state
        let store = InMemoryStore::new().paused();
        let queue = DelayedJobQueue::new(
            store.clone(),
            Arc::new(RecordingChannel::new()),
            QueueConfig::default(),
        );
        (ReminderScheduler::new(queue), store)
    }

    async fn reminder_job(
        store: &InMemoryStore,
        entity_id: &str,
    ) -> Option<crate::job::ReminderJob> {
        store
            .get(&JobKey::new(format!("reminder-{entity_id}")).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn schedules_reminder_at_lead_before_the_event() {
        let (scheduler, store) = scheduler();
        let event_time = Utc::now() + TimeDelta::hours(30);

        let outcome = scheduler.schedule_reminder("e1", event_time).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        let job = reminder_job(&store, "e1").await.unwrap();
        assert_eq!(job.fire_at, event_time - REMINDER_LEAD);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(
            ReminderPayload::from_value(&job.payload).unwrap(),
            ReminderPayload {
                entity_id: "e1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn scheduling_twice_keeps_a_single_job() {
        let (scheduler, store) = scheduler();
        let event_time = Utc::now() + TimeDelta::hours(30);

        scheduler.schedule_reminder("e1", event_time).await.unwrap();
        let outcome = scheduler.schedule_reminder("e1", event_time).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::Replaced);
        let job = reminder_job(&store, "e1").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.fire_at, event_time - REMINDER_LEAD);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn past_reminder_point_schedules_nothing() {
        let (scheduler, store) = scheduler();
        // the event is upcoming but its reminder point has already passed
        let event_time = Utc::now() + TimeDelta::hours(23);

        let outcome = scheduler.schedule_reminder("e1", event_time).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::LeadElapsed);
        assert!(reminder_job(&store, "e1").await.is_none());
    }

    #[tokio::test]
    async fn cancel_reports_absence_without_error() {
        let (scheduler, _store) = scheduler();
        let event_time = Utc::now() + TimeDelta::hours(30);

        assert!(!scheduler.cancel_reminder("e1").await.unwrap());
        scheduler.schedule_reminder("e1", event_time).await.unwrap();
        assert!(scheduler.cancel_reminder("e1").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_then_reschedule_leaves_one_job_at_the_new_time() {
        let (scheduler, store) = scheduler();
        let original = Utc::now() + TimeDelta::hours(30);
        let moved = Utc::now() + TimeDelta::hours(48);

        scheduler.schedule_reminder("e1", original).await.unwrap();
        scheduler.cancel_reminder("e1").await.unwrap();
        let outcome = scheduler.schedule_reminder("e1", moved).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        let job = reminder_job(&store, "e1").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.fire_at, moved - REMINDER_LEAD);
    }

    #[tokio::test]
    async fn reschedule_moves_the_reminder() {
        let (scheduler, store) = scheduler();
        let original = Utc::now() + TimeDelta::hours(30);
        let moved = Utc::now() + TimeDelta::hours(40);

        scheduler.schedule_reminder("e1", original).await.unwrap();
        let outcome = scheduler
            .reschedule_reminder("e1", moved)
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        let job = reminder_job(&store, "e1").await.unwrap();
        assert_eq!(job.fire_at, moved - REMINDER_LEAD);
    }

    #[tokio::test]
    async fn reschedule_to_a_past_reminder_point_cancels_only() {
        let (scheduler, store) = scheduler();
        let original = Utc::now() + TimeDelta::hours(30);

        scheduler.schedule_reminder("e1", original).await.unwrap();
        let outcome = scheduler
            .reschedule_reminder("e1", Utc::now() + TimeDelta::hours(1))
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::LeadElapsed);
        let job = reminder_job(&store, "e1").await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }
}
