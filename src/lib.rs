//! Delayed reminder scheduling.
//!
//! `remindq` makes sure a notification goes out at a precise instant before an appointment,
//! and keeps that promise across restarts, duplicate triggers, and appointment changes.
//! Three pieces compose top-down:
//!
//! - [`queue::DelayedJobQueue`] — an at-least-once delayed task queue with keyed
//!   deduplication (replace on conflict), retry with backoff, and explicit cancellation.
//! - [`scheduler::ReminderScheduler`] — computes when a reminder must fire (24 hours before
//!   the appointment) and drives the queue idempotently, one job per appointment.
//! - [`scanner::RecoveryScanner`] — a periodic sweep re-deriving the expected reminders
//!   from the event store, repairing anything lost to downtime.
//!
//! The event store and the delivery channel are traits implemented by the embedding
//! service; everything is dependency-injected, so tests run against an in-memory store and
//! recording channels.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use chrono::{DateTime, TimeDelta, Utc};
//! use remindq::prelude::*;
//!
//! struct EmailChannel;
//!
//! #[async_trait]
//! impl DeliveryChannel for EmailChannel {
//!     async fn deliver(&self, _payload: &serde_json::Value) -> Result<(), DeliveryError> {
//!         // hand the payload to the mailer
//!         Ok(())
//!     }
//! }
//!
//! struct AppointmentDb;
//!
//! #[async_trait]
//! impl EventStore for AppointmentDb {
//!     async fn events_in_window(
//!         &self,
//!         _status: &str,
//!         _start: DateTime<Utc>,
//!         _end: DateTime<Utc>,
//!     ) -> Result<Vec<EventSummary>, EventStoreError> {
//!         Ok(vec![])
//!     }
//! }
//!
//! # async fn example() {
//! let service = Remindq::start(
//!     InMemoryStore::new(),
//!     Arc::new(EmailChannel),
//!     Arc::new(AppointmentDb),
//!     RemindqConfig::default(),
//! );
//!
//! let scheduler = service.scheduler();
//! scheduler
//!     .schedule_reminder("appointment-42", Utc::now() + TimeDelta::hours(30))
//!     .await
//!     .unwrap();
//!
//! service.graceful_shutdown().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

pub mod backoff;
pub mod delivery;
pub mod events;
pub mod job;
pub mod observer;
pub mod prelude;
pub mod pruner;
pub mod queue;
pub mod scanner;
pub mod scheduler;
pub mod store;

use delivery::DeliveryChannel;
use events::EventStore;
use pruner::{PrunerConfig, PrunerRunner};
use queue::{DelayedJobQueue, QueueConfig};
use scanner::{RecoveryScanner, ScannerConfig, SweepReport};
use scheduler::ReminderScheduler;
use store::JobStore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the assembled service.
#[derive(Default)]
pub struct RemindqConfig {
    pub queue: QueueConfig,
    pub scanner: ScannerConfig,
    /// Retention of finished records; [`None`] keeps everything.
    pub pruner: Option<PrunerConfig>,
}

/// The assembled reminder service: queue runner, recovery scanner, and (optionally) the
/// pruner, wired together over one store and running as background tasks.
pub struct Remindq<S: JobStore> {
    queue: DelayedJobQueue<S>,
    scheduler: ReminderScheduler<S>,
    scanner: RecoveryScanner<S>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<S> Remindq<S>
where
    S: JobStore + Send + Sync + 'static,
{
    /// Constructs the components and spawns their background tasks.
    pub fn start(
        store: S,
        delivery: Arc<dyn DeliveryChannel>,
        events: Arc<dyn EventStore>,
        config: RemindqConfig,
    ) -> Self {
        let queue = DelayedJobQueue::new(store.clone(), delivery, config.queue);
        let scheduler = ReminderScheduler::new(queue.clone());
        let scanner = RecoveryScanner::new(scheduler.clone(), events, config.scanner);
        let token = CancellationToken::new();
        let mut handles = vec![
            queue.spawn(token.child_token()),
            scanner.spawn(token.child_token()),
        ];
        if let Some(pruner) = config.pruner {
            handles.push(PrunerRunner::new(store, pruner).spawn(token.child_token()));
        }
        Self {
            queue,
            scheduler,
            scanner,
            token,
            handles,
        }
    }

    /// A handle for scheduling reminders; cheap to clone into request handlers.
    pub fn scheduler(&self) -> ReminderScheduler<S> {
        self.scheduler.clone()
    }

    /// Direct queue access for status queries and ad-hoc jobs.
    pub fn queue(&self) -> DelayedJobQueue<S> {
        self.queue.clone()
    }

    /// Runs a recovery sweep now; `None` when one is already in flight.
    pub async fn trigger_sweep(&self) -> Option<SweepReport> {
        self.scanner.sweep().await
    }

    /// Stops all background tasks and waits for them to finish.
    pub async fn graceful_shutdown(self) -> Result<(), ShutdownError> {
        tracing::debug!("shutting down reminder service tasks");
        self.token.cancel();
        for handle in self.handles {
            handle.await.map_err(|_| ShutdownError)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("failed to shut down cleanly")]
pub struct ShutdownError;

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use crate::{
        delivery::test::RecordingChannel,
        events::test::FixedEventStore,
        job::{JobKey, JobState},
        store::memory::InMemoryStore,
    };

    use super::*;

    #[tokio::test]
    async fn started_service_schedules_and_shuts_down() {
        let service = Remindq::start(
            InMemoryStore::new().paused(),
            Arc::new(RecordingChannel::new()),
            Arc::new(FixedEventStore::default()),
            RemindqConfig::default(),
        );

        service
            .scheduler()
            .schedule_reminder("e1", Utc::now() + TimeDelta::hours(30))
            .await
            .unwrap();
        assert_eq!(
            service
                .queue()
                .status(&JobKey::new("reminder-e1").unwrap())
                .await
                .unwrap(),
            Some(JobState::Pending)
        );

        service.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn manual_sweep_runs_through_the_service() {
        use crate::events::EventSummary;

        let events = FixedEventStore::with_events(vec![EventSummary {
            id: "e1".to_owned(),
            scheduled_at: Utc::now() + TimeDelta::hours(24) + TimeDelta::minutes(30),
        }]);
        let service = Remindq::start(
            InMemoryStore::new().paused(),
            Arc::new(RecordingChannel::new()),
            Arc::new(events),
            RemindqConfig::default(),
        );

        let report = service.trigger_sweep().await.unwrap();
        assert_eq!(report.scheduled, 1);

        service.graceful_shutdown().await.unwrap();
    }
}
