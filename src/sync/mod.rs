//! Sync Module - Offline Action Queue & Background Sync
//!
//! Captures state-changing operations while the network is unavailable and
//! replays them to the remote API once connectivity returns.
//!
//! Architecture:
//! - Outbox: every action is persisted before the caller gets its id
//! - Single-flight: at most one sync pass runs at a time
//! - Ordering: priority tier first, then enqueue time
//! - Retry: configurable backoff, idempotency key on every attempt

pub mod api;
pub mod events;
pub mod manager;
pub mod models;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod wake;


// Re-export commonly used types
pub use models::{
    ActionFilter, ActionKind, ActionPayload, ActionPriority, ActionStatus, ActionTarget,
    HttpMethod, NewAction, OfflineAction, QueueStatus,
};

pub use api::{ActionTransport, DispatchError, DispatchResponse, HttpTransport, IDEMPOTENCY_HEADER};
pub use events::{EventBus, FailureReason, Subscription, SyncEvent, SyncTopic};
pub use manager::{SkipReason, SyncManager, SyncManagerError, SyncOutcome, SyncReport};
pub use queue::{ActionStore, CorruptAction, PutOutcome, SqliteActionStore, StoreError, StoreStats};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use signal::{ConnectivityProbe, NetworkSignal, SyncTrigger};
pub use wake::{BackgroundWake, BackgroundWakeRegistrar, PeriodicWake, UnsupportedWake, WakeError};
