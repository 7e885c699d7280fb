//! Periodic reconciliation of queue state against the event store.
//!
//! Queue contents can go missing — the process restarted with an in-memory store, an
//! enqueue call was never made, a store lost data. The scanner repairs this by re-deriving
//! the expected reminders from the source of truth on a schedule: every confirmed event
//! whose reminder should currently be pending gets a fresh `schedule_reminder` call.
//! Because scheduling is idempotent (keyed replacement, past reminder points skipped),
//! re-deriving an already-correct reminder is safe and cheap, so the sweep needs no
//! diffing logic.

use std::{
    ops::Sub,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventStore, CONFIRMED},
    scheduler::{ReminderScheduler, ScheduleOutcome, REMINDER_LEAD},
    store::JobStore,
};

/// Tunables for the recovery scanner.
pub struct ScannerConfig {
    schedule: cron::Schedule,
    window_buffer: TimeDelta,
}

impl ScannerConfig {
    /// Sweeps on the given cron schedule.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            window_buffer: TimeDelta::hours(1),
        }
    }

    /// Widens the scanned window beyond the reminder lead.
    ///
    /// The buffer must cover the sweep interval so every event is re-examined at least once
    /// before its reminder point passes; one hour matches the default hourly schedule.
    pub fn with_window_buffer(self, window_buffer: TimeDelta) -> Self {
        Self {
            window_buffer,
            ..self
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self::new(cron::Schedule::from_str("0 0 * * * *").expect("hourly schedule parses"))
    }
}

/// Counts from one recovery sweep.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct SweepReport {
    /// Confirmed events found inside the window.
    pub examined: usize,
    pub scheduled: usize,
    pub replaced: usize,
    /// Events whose reminder point already passed; examined but nothing to schedule.
    pub lead_elapsed: usize,
    pub failed: usize,
}

/// The periodic sweep driver.
pub struct RecoveryScanner<S: JobStore> {
    scheduler: ReminderScheduler<S>,
    events: Arc<dyn EventStore>,
    config: ScannerConfig,
    scanning: Arc<AtomicBool>,
}

impl<S: JobStore> Clone for RecoveryScanner<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            events: Arc::clone(&self.events),
            config: ScannerConfig {
                schedule: self.config.schedule.clone(),
                window_buffer: self.config.window_buffer,
            },
            scanning: Arc::clone(&self.scanning),
        }
    }
}

// Resets the in-flight flag even if a sweep future is dropped mid-run.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S> RecoveryScanner<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub fn new(
        scheduler: ReminderScheduler<S>,
        events: Arc<dyn EventStore>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            scheduler,
            events,
            config,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the scheduled sweep loop.
    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<()> {
        let scanner = self.clone();
        tokio::spawn(async move {
            loop {
                let next = scanner
                    .config
                    .schedule
                    .upcoming(Utc)
                    .next()
                    .expect("no upcoming tick for the recovery scanner schedule");
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        scanner.sweep().await;
                        let delay = next - Utc::now();
                        if delay > TimeDelta::zero() {
                            tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::debug!("shutting down the recovery scanner");
                        break;
                    }
                }
            }
        })
    }

    /// Runs one sweep now; also the manual trigger hook.
    ///
    /// Returns `None` when a sweep is already in flight — concurrent sweeps would be
    /// redundant, so later ones are skipped rather than queued.
    pub async fn sweep(&self) -> Option<SweepReport> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            tracing::debug!("recovery sweep already in flight, skipping");
            return None;
        }
        let _guard = ScanGuard(&self.scanning);
        Some(self.run_sweep().await)
    }

    async fn run_sweep(&self) -> SweepReport {
        let now = Utc::now();
        let until = now + REMINDER_LEAD + self.config.window_buffer;
        let events = match self.events.events_in_window(CONFIRMED, now, until).await {
            Ok(events) => events,
            Err(error) => {
                tracing::error!(?error, "recovery sweep could not query the event store: {error}");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            examined: events.len(),
            ..Default::default()
        };
        // each event is handled independently; one failure never aborts the rest
        for event in events {
            match self
                .scheduler
                .schedule_reminder(&event.id, event.scheduled_at)
                .await
            {
                Ok(ScheduleOutcome::Scheduled) => report.scheduled += 1,
                Ok(ScheduleOutcome::Replaced) => report.replaced += 1,
                Ok(ScheduleOutcome::LeadElapsed) => report.lead_elapsed += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        ?error,
                        event_id = %event.id,
                        "could not schedule reminder during sweep: {error}",
                    );
                }
            }
        }
        tracing::info!(
            examined = report.examined,
            scheduled = report.scheduled,
            replaced = report.replaced,
            lead_elapsed = report.lead_elapsed,
            failed = report.failed,
            "recovery sweep finished",
        );
        report
    }
}
