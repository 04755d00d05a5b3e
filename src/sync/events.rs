//! Sync Event Bus
//!
//! Typed in-process publish/subscribe for queue lifecycle events.
//! Delivery is synchronous, in subscription order, on the task that raised
//! the event. A panicking subscriber is contained and logged; the remaining
//! subscribers still receive the event.

use super::models::{ActionKind, ActionPriority};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Topic names observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTopic {
    Queued,
    SyncStarted,
    ActionSynced,
    ActionRetried,
    ActionFailed,
    SyncCompleted,
}

impl SyncTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::SyncStarted => "sync-started",
            Self::ActionSynced => "action-synced",
            Self::ActionRetried => "action-retried",
            Self::ActionFailed => "action-failed",
            Self::SyncCompleted => "sync-completed",
        }
    }
}

/// Why an action left the queue without being delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Every attempt failed; carries the last error
    RetriesExhausted { last_error: String },
    /// Permanent client error, abandoned without further attempts
    Rejected { last_error: String },
    /// Removed by the capacity policy to make room
    Evicted,
    /// Older than the configured maximum queue age
    Expired,
    /// Stored row could no longer be decoded and was dropped
    Corrupt { details: String },
}

/// Lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Queued {
        id: String,
        kind: ActionKind,
        entity: String,
        priority: ActionPriority,
    },
    SyncStarted {
        pass: u64,
    },
    ActionSynced {
        id: String,
        entity: String,
        attempts: u32,
        status: u16,
    },
    ActionRetried {
        id: String,
        entity: String,
        attempts: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    ActionFailed {
        id: String,
        entity: String,
        attempts: u32,
        reason: FailureReason,
    },
    SyncCompleted {
        pass: u64,
        succeeded: usize,
        retried: usize,
        failed: usize,
    },
}

impl SyncEvent {
    pub fn topic(&self) -> SyncTopic {
        match self {
            Self::Queued { .. } => SyncTopic::Queued,
            Self::SyncStarted { .. } => SyncTopic::SyncStarted,
            Self::ActionSynced { .. } => SyncTopic::ActionSynced,
            Self::ActionRetried { .. } => SyncTopic::ActionRetried,
            Self::ActionFailed { .. } => SyncTopic::ActionFailed,
            Self::SyncCompleted { .. } => SyncTopic::SyncCompleted,
        }
    }
}

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;
type HandlerMap = HashMap<SyncTopic, Vec<(u64, Handler)>>;

/// Publish/subscribe hub, cheap to clone
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HandlerMap>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Dropping the returned handle keeps the
    /// subscription alive; call `unsubscribe` to remove it.
    pub fn on<F>(&self, topic: SyncTopic, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            topic,
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Deliver `event` to every subscriber of its topic
    pub fn emit(&self, event: SyncEvent) {
        let topic = event.topic();

        // Snapshot so handlers may subscribe/unsubscribe while being called
        let snapshot: Vec<(u64, Handler)> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (id, handler) in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                log::error!(
                    "Subscriber {} panicked while handling '{}' event",
                    id,
                    topic.as_str()
                );
            }
        }
    }

    /// Number of subscribers for `topic`
    pub fn subscriber_count(&self, topic: SyncTopic) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&topic).map_or(0, Vec::len)
    }
}

/// Handle returned by `EventBus::on`
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    topic: SyncTopic,
    id: u64,
    handlers: Weak<RwLock<HandlerMap>>,
}

impl Subscription {
    pub fn topic(&self) -> SyncTopic {
        self.topic
    }

    /// Remove the handler. Returns `false` if the bus is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(handlers) = self.handlers.upgrade() else {
            return false;
        };

        let mut handlers = handlers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = handlers.get_mut(&self.topic) {
            let before = list.len();
            list.retain(|(id, _)| *id != self.id);
            return list.len() != before;
        }
        false
    }
}
