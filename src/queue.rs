//! The delayed job queue: at-least-once execution of a delivery handler at a future
//! instant, with keyed deduplication, retry with backoff, and explicit cancellation.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;

use crate::{
    delivery::DeliveryChannel,
    job::{AttemptError, FailureKind, JobId, JobKey, JobState, NewJob, ReminderJob},
    observer::{JobTransition, TransitionHub},
    store::{JobStore, StoreError, Upserted},
};

/// Tunables for the queue runner.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    handler_timeout: Duration,
}

impl QueueConfig {
    /// Bounds a single delivery attempt; a handler that exceeds this is a failed attempt of
    /// kind [`FailureKind::Timeout`].
    pub fn with_handler_timeout(self, handler_timeout: Duration) -> Self {
        Self { handler_timeout }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// How an enqueue resolved.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnqueueOutcome {
    /// A fresh job was installed.
    Scheduled,
    /// A live job already held the key and was replaced with this one.
    Replaced,
    /// The fire time was not strictly in the future; nothing was installed. A policy
    /// outcome, not an error.
    PastDeadline,
}

/// A durable-contract delayed task queue.
///
/// Cloning is cheap and every clone drives the same store; construct one per store and pass
/// clones to whoever schedules work.
pub struct DelayedJobQueue<S: JobStore> {
    store: S,
    delivery: Arc<dyn DeliveryChannel>,
    config: QueueConfig,
    transitions: TransitionHub,
}

impl<S: JobStore> Clone for DelayedJobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            delivery: Arc::clone(&self.delivery),
            config: self.config,
            transitions: self.transitions.clone(),
        }
    }
}

impl<S> DelayedJobQueue<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub fn new(store: S, delivery: Arc<dyn DeliveryChannel>, config: QueueConfig) -> Self {
        Self {
            store,
            delivery,
            config,
            transitions: TransitionHub::default(),
        }
    }

    /// Installs a job, replacing any live job under the same key.
    ///
    /// A fire time that has already passed is reported as
    /// [`EnqueueOutcome::PastDeadline`] and installs nothing: a job guaranteed to misfire
    /// is worse than no job, and the recovery sweep would only re-derive it.
    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        if job.fire_at <= Utc::now() {
            tracing::info!(
                key = %job.key,
                fire_at = %job.fire_at,
                "fire time already passed, skipping enqueue",
            );
            return Ok(EnqueueOutcome::PastDeadline);
        }
        let key = job.key.clone();
        let fire_at = job.fire_at;
        let outcome = match self.store.upsert(job).await? {
            Upserted::Inserted(id) => {
                tracing::debug!(%key, %id, %fire_at, "job scheduled");
                EnqueueOutcome::Scheduled
            }
            Upserted::Replaced(id) => {
                tracing::debug!(%key, %id, %fire_at, "live job replaced");
                EnqueueOutcome::Replaced
            }
        };
        self.transitions.emit(&key, JobState::Pending, 0);
        Ok(outcome)
    }

    /// Cancels the `Pending` job under `key`, reporting whether one was removed.
    ///
    /// A job that is already firing runs its current attempt to completion; cancelling it,
    /// a finished job, or an unknown key returns `false`.
    pub async fn cancel(&self, key: &JobKey) -> Result<bool, StoreError> {
        match self.store.cancel(key).await? {
            Some(job) => {
                tracing::debug!(%key, "job cancelled");
                self.transitions.emit(key, JobState::Cancelled, job.attempts);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read-only state lookup by key.
    pub async fn status(&self, key: &JobKey) -> Result<Option<JobState>, StoreError> {
        Ok(self.store.get(key).await?.map(|job| job.state))
    }

    /// Subscribes to every state transition the queue drives.
    pub fn subscribe_transitions(&self) -> mpsc::UnboundedReceiver<JobTransition> {
        self.transitions.subscribe()
    }

    /// Spawns the background runner that waits for fire times and executes attempts.
    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let stream = queue.store.due_jobs().await;
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(job)) => queue.run_attempt(job).await,
                        Some(Err(error)) => {
                            tracing::error!(?error, "failed to pull due job: {error}")
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("delayed job queue runner shut down");
        })
    }

    async fn run_attempt(&self, job: ReminderJob) {
        let key = job.key.clone();
        let id = job.id;
        let attempt = job.attempts;
        let final_attempt = job.is_final_attempt();
        let backoff = job.backoff;
        let timeout = self.config.handler_timeout;

        self.transitions.emit(&key, JobState::Firing, attempt);
        tracing::debug!(%key, %id, attempt, "running delivery attempt");

        // The attempt runs in its own task so a panicking handler is contained.
        let delivery = Arc::clone(&self.delivery);
        let payload = job.payload;
        let result = tokio::spawn(async move {
            tokio::time::timeout(timeout, delivery.deliver(&payload)).await
        })
        .await;

        match result {
            Ok(Ok(Ok(()))) => self.handle_success(&key, id, attempt).await,
            Ok(Ok(Err(error))) => {
                self.handle_failure(
                    &key,
                    id,
                    attempt,
                    final_attempt,
                    backoff,
                    FailureKind::Delivery,
                    error.to_string(),
                )
                .await
            }
            Ok(Err(_elapsed)) => {
                self.handle_failure(
                    &key,
                    id,
                    attempt,
                    final_attempt,
                    backoff,
                    FailureKind::Timeout,
                    format!("delivery did not finish within {timeout:?}"),
                )
                .await
            }
            Err(join_error) => {
                self.handle_failure(
                    &key,
                    id,
                    attempt,
                    final_attempt,
                    backoff,
                    FailureKind::Panic,
                    panic_message(join_error),
                )
                .await
            }
        }
    }

    async fn handle_success(&self, key: &JobKey, id: JobId, attempt: u16) {
        match self.store.mark_completed(key, id).await {
            Ok(()) => {
                tracing::debug!(%key, attempt, "delivery succeeded");
                self.transitions.emit(key, JobState::Completed, attempt);
            }
            Err(StoreError::Stale { .. }) => {
                tracing::debug!(%key, "attempt finished for a superseded job, ignoring")
            }
            Err(error) => {
                tracing::error!(?error, %key, "failed to mark job complete: {error}")
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        key: &JobKey,
        id: JobId,
        attempt: u16,
        final_attempt: bool,
        backoff: crate::backoff::BackoffPolicy,
        kind: FailureKind,
        details: String,
    ) {
        let error = AttemptError {
            attempt,
            kind,
            details: details.clone(),
            recorded_at: Utc::now(),
        };
        if final_attempt {
            tracing::error!(
                %key,
                attempt,
                %kind,
                "delivery failed permanently after exhausting retries: {details}",
            );
            match self.store.mark_failed(key, id, error).await {
                Ok(()) => self.transitions.emit(key, JobState::Failed, attempt),
                Err(StoreError::Stale { .. }) => {
                    tracing::debug!(%key, "attempt failed for a superseded job, ignoring")
                }
                Err(error) => {
                    tracing::error!(?error, %key, "failed to mark job failed: {error}")
                }
            }
        } else {
            let delay = backoff.delay(attempt);
            tracing::warn!(
                %key,
                attempt,
                %kind,
                "delivery failed, retrying in {delay}: {details}",
            );
            match self.store.re_arm(key, id, Utc::now() + delay, error).await {
                Ok(()) => self.transitions.emit(key, JobState::Pending, attempt),
                Err(StoreError::Stale { .. }) => {
                    tracing::debug!(%key, "attempt failed for a superseded job, ignoring")
                }
                Err(error) => {
                    tracing::error!(?error, %key, "failed to re-arm job for retry: {error}")
                }
            }
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let fallback = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use crate::{
        backoff::BackoffPolicy, delivery::test::RecordingChannel, store::memory::InMemoryStore,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn key(name: &str) -> JobKey {
        JobKey::new(name).unwrap()
    }

    fn queue_with(channel: RecordingChannel) -> DelayedJobQueue<InMemoryStore> {
        DelayedJobQueue::new(
            InMemoryStore::new(),
            Arc::new(channel),
            QueueConfig::default(),
        )
    }

    fn due_in(name: &str, delta: TimeDelta) -> NewJob {
        NewJob::new(key(name), Utc::now() + delta)
            .with_backoff(BackoffPolicy::constant(TimeDelta::milliseconds(10)))
    }

    async fn wait_for_state(
        receiver: &mut mpsc::UnboundedReceiver<JobTransition>,
        key: &JobKey,
        state: JobState,
    ) {
        tokio::time::timeout(WAIT, async {
            while let Some(transition) = receiver.recv().await {
                if &transition.key == key && transition.state == state {
                    return;
                }
            }
            panic!("transition channel closed before reaching {state:?}");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
    }

    #[tokio::test]
    async fn enqueue_past_fire_time_is_a_noop() {
        let queue = queue_with(RecordingChannel::new());

        let outcome = queue
            .enqueue(due_in("a", TimeDelta::seconds(-1)))
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::PastDeadline);
        assert_eq!(queue.status(&key("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn enqueue_replaces_live_job_under_same_key() {
        let queue = queue_with(RecordingChannel::new());
        queue
            .enqueue(due_in("a", TimeDelta::hours(1)))
            .await
            .unwrap();

        let outcome = queue
            .enqueue(due_in("a", TimeDelta::hours(2)))
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Replaced);
        assert_eq!(
            queue.status(&key("a")).await.unwrap(),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn cancel_reports_whether_a_job_was_removed() {
        let queue = queue_with(RecordingChannel::new());
        queue
            .enqueue(due_in("a", TimeDelta::hours(1)))
            .await
            .unwrap();

        assert!(queue.cancel(&key("a")).await.unwrap());
        assert!(!queue.cancel(&key("a")).await.unwrap());
        assert!(!queue.cancel(&key("missing")).await.unwrap());
        assert_eq!(
            queue.status(&key("a")).await.unwrap(),
            Some(JobState::Cancelled)
        );
    }

    #[tokio::test]
    async fn delivers_when_the_fire_time_elapses() {
        let channel = RecordingChannel::new();
        let queue = queue_with(channel.clone());
        let mut transitions = queue.subscribe_transitions();
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(
                due_in("a", TimeDelta::milliseconds(30))
                    .with_payload(serde_json::json!({ "entity_id": "a" })),
            )
            .await
            .unwrap();
        wait_for_state(&mut transitions, &key("a"), JobState::Completed).await;

        assert_eq!(channel.delivery_count(), 1);
        assert_eq!(
            channel.deliveries(),
            vec![serde_json::json!({ "entity_id": "a" })]
        );
        assert_eq!(
            queue.status(&key("a")).await.unwrap(),
            Some(JobState::Completed)
        );
        token.cancel();
    }

    #[tokio::test]
    async fn jobs_fire_in_fire_time_order() {
        let channel = RecordingChannel::new();
        let queue = queue_with(channel.clone());
        let mut transitions = queue.subscribe_transitions();
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(
                due_in("second", TimeDelta::milliseconds(80))
                    .with_payload(serde_json::json!("second")),
            )
            .await
            .unwrap();
        queue
            .enqueue(
                due_in("first", TimeDelta::milliseconds(20))
                    .with_payload(serde_json::json!("first")),
            )
            .await
            .unwrap();
        wait_for_state(&mut transitions, &key("second"), JobState::Completed).await;

        assert_eq!(
            channel.deliveries(),
            vec![serde_json::json!("first"), serde_json::json!("second")]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn failed_attempts_are_retried_until_success() {
        let channel = RecordingChannel::failing_first(2);
        let queue = queue_with(channel.clone());
        let mut transitions = queue.subscribe_transitions();
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(due_in("a", TimeDelta::milliseconds(10)).with_max_attempts(3))
            .await
            .unwrap();
        wait_for_state(&mut transitions, &key("a"), JobState::Completed).await;

        assert_eq!(channel.delivery_count(), 3);
        let job = queue.store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.errors.len(), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn exhausted_retries_leave_the_job_failed() {
        let channel = RecordingChannel::always_failing();
        let queue = queue_with(channel.clone());
        let mut transitions = queue.subscribe_transitions();
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(due_in("a", TimeDelta::milliseconds(10)).with_max_attempts(3))
            .await
            .unwrap();
        wait_for_state(&mut transitions, &key("a"), JobState::Failed).await;

        assert_eq!(channel.delivery_count(), 3);
        assert_eq!(
            queue.status(&key("a")).await.unwrap(),
            Some(JobState::Failed)
        );

        // a failed job is never picked up again
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.delivery_count(), 3);
        let job = queue.store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(job.errors.len(), 3);
        token.cancel();
    }

    #[tokio::test]
    async fn cancelled_job_never_fires() {
        let channel = RecordingChannel::new();
        let queue = queue_with(channel.clone());
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(due_in("a", TimeDelta::milliseconds(60)))
            .await
            .unwrap();
        assert!(queue.cancel(&key("a")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(channel.delivery_count(), 0);
        assert_eq!(
            queue.status(&key("a")).await.unwrap(),
            Some(JobState::Cancelled)
        );
        token.cancel();
    }

    #[tokio::test]
    async fn timed_out_handler_counts_as_a_failed_attempt() {
        struct StuckChannel;

        #[async_trait::async_trait]
        impl DeliveryChannel for StuckChannel {
            async fn deliver(
                &self,
                _payload: &serde_json::Value,
            ) -> Result<(), crate::delivery::DeliveryError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let queue = DelayedJobQueue::new(
            InMemoryStore::new(),
            Arc::new(StuckChannel),
            QueueConfig::default().with_handler_timeout(Duration::from_millis(20)),
        );
        let mut transitions = queue.subscribe_transitions();
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(due_in("a", TimeDelta::milliseconds(10)).with_max_attempts(1))
            .await
            .unwrap();
        wait_for_state(&mut transitions, &key("a"), JobState::Failed).await;

        let job = queue.store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].kind, FailureKind::Timeout);
        token.cancel();
    }

    #[tokio::test]
    async fn transitions_cover_the_full_lifecycle() {
        use tokio_stream::wrappers::UnboundedReceiverStream;

        let queue = queue_with(RecordingChannel::new());
        let transitions = UnboundedReceiverStream::new(queue.subscribe_transitions());
        let token = CancellationToken::new();
        let _runner = queue.spawn(token.clone());

        queue
            .enqueue(due_in("a", TimeDelta::milliseconds(20)))
            .await
            .unwrap();

        let seen: Vec<JobState> = tokio::time::timeout(
            WAIT,
            transitions
                .map(|transition| transition.state)
                .take(3)
                .collect(),
        )
        .await
        .expect("lifecycle should complete");

        assert_eq!(
            seen,
            vec![JobState::Pending, JobState::Firing, JobState::Completed]
        );
        token.cancel();
    }
}
