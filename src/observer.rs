//! Channel-based notification of job state transitions.
//!
//! The queue emits a [`JobTransition`] after every state change it drives. Observers
//! subscribe through [`crate::queue::DelayedJobQueue::subscribe_transitions`] and consume
//! the stream however they like; [`log_transitions`] is a ready-made collaborator that
//! turns the stream into structured log events.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::job::{JobKey, JobState};

/// A single state change of a job record.
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub key: JobKey,
    /// The state the job just entered.
    pub state: JobState,
    /// Attempts started at the time of the transition; 0 for a record that has not fired.
    pub attempt: u16,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub(crate) struct TransitionHub {
    senders: Arc<RwLock<Vec<mpsc::UnboundedSender<JobTransition>>>>,
}

impl TransitionHub {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<JobTransition> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub(crate) fn emit(&self, key: &JobKey, state: JobState, attempt: u16) {
        let transition = JobTransition {
            key: key.clone(),
            state,
            attempt,
            at: Utc::now(),
        };
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|sender| sender.send(transition.clone()).is_ok());
    }
}

/// Drains a transition channel into `tracing` events until the queue is dropped.
pub async fn log_transitions(mut receiver: mpsc::UnboundedReceiver<JobTransition>) {
    while let Some(transition) = receiver.recv().await {
        tracing::info!(
            key = %transition.key,
            state = ?transition.state,
            attempt = transition.attempt,
            "job transition",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let hub = TransitionHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let key = JobKey::new("a").unwrap();

        hub.emit(&key, JobState::Pending, 0);

        for receiver in [&mut first, &mut second] {
            let transition = receiver.recv().await.unwrap();
            assert_eq!(transition.key, key);
            assert_eq!(transition.state, JobState::Pending);
            assert_eq!(transition.attempt, 0);
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_forgotten() {
        let hub = TransitionHub::default();
        let receiver = hub.subscribe();
        drop(receiver);
        let key = JobKey::new("a").unwrap();

        hub.emit(&key, JobState::Pending, 0);

        assert!(hub
            .senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }
}
