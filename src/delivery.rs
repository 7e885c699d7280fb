//! The outbound contract invoked when a job fires.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a delivery channel.
///
/// Distinguishable from success so the queue can drive its retry state machine; the message
/// is recorded on the job's error list.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub message: String,
}

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The notification sender invoked at fire time.
///
/// Implemented by the embedding service (email, SMS, push, ...). The queue does not care
/// what delivery means, only whether it succeeded.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, payload: &Value) -> Result<(), DeliveryError>;
}
