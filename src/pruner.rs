//! Retention of finished job records.
//!
//! Completed and cancelled records only matter for a while; this pruner removes them on a
//! cron schedule once they are old enough. Failed records are deliberately out of reach —
//! they are the inspection trail for reminders that were never delivered.

use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{job::JobState, store::JobStore};

/// One retention rule: how long records in a state are kept.
///
/// Only terminal, non-failed states can be pruned, which the constructors enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    state: JobState,
    max_age: TimeDelta,
}

impl Retention {
    /// Keep completed records for `max_age` after completion.
    pub const fn completed(max_age: TimeDelta) -> Self {
        Self {
            state: JobState::Completed,
            max_age,
        }
    }

    /// Keep cancelled records for `max_age` after cancellation.
    pub const fn cancelled(max_age: TimeDelta) -> Self {
        Self {
            state: JobState::Cancelled,
            max_age,
        }
    }
}

/// When and what to prune.
///
/// # Example
///
/// ```
/// use std::str::FromStr;
/// use chrono::TimeDelta;
/// use remindq::pruner::{PrunerConfig, Retention};
///
/// let config = PrunerConfig::new(cron::Schedule::from_str("0 30 3 * * *").unwrap())
///     .with_retention(Retention::completed(TimeDelta::days(7)))
///     .with_retention(Retention::cancelled(TimeDelta::days(1)));
/// ```
pub struct PrunerConfig {
    schedule: cron::Schedule,
    retentions: Vec<Retention>,
}

impl PrunerConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            retentions: Vec::new(),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retentions.push(retention);
        self
    }
}

pub(crate) struct PrunerRunner<S: JobStore> {
    store: S,
    config: PrunerConfig,
}

impl<S> PrunerRunner<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub(crate) fn new(store: S, config: PrunerConfig) -> Self {
        Self { store, config }
    }

    pub(crate) fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = self
                    .config
                    .schedule
                    .upcoming(Utc)
                    .next()
                    .expect("no upcoming tick for the pruner schedule");
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.prune().await;
                        let delay = next - Utc::now();
                        if delay > TimeDelta::zero() {
                            tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::debug!("shutting down the job pruner");
                        break;
                    }
                }
            }
        })
    }

    async fn prune(&self) {
        for retention in &self.config.retentions {
            let cutoff = Utc::now() - retention.max_age;
            match self.store.prune(retention.state, cutoff).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(state = ?retention.state, removed, "pruned finished jobs")
                }
                Err(error) => {
                    tracing::error!(?error, state = ?retention.state, "failed to prune jobs: {error}")
                }
            }
        }
    }
}
