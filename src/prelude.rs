//! One import for the commonly used types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use remindq::prelude::*;
//! ```

pub use crate::backoff::{BackoffPolicy, Jitter};
pub use crate::delivery::{DeliveryChannel, DeliveryError};
pub use crate::events::{EventStore, EventStoreError, EventSummary};
pub use crate::job::{JobKey, JobState, NewJob, ReminderJob};
pub use crate::observer::JobTransition;
pub use crate::pruner::{PrunerConfig, Retention};
pub use crate::queue::{DelayedJobQueue, EnqueueOutcome, QueueConfig};
pub use crate::scanner::{RecoveryScanner, ScannerConfig, SweepReport};
pub use crate::scheduler::{ReminderPayload, ReminderScheduler, ScheduleOutcome};
pub use crate::store::memory::InMemoryStore;
pub use crate::store::{JobStore, StoreError};
pub use crate::{Remindq, RemindqConfig};
