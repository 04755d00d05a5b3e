//! Sync Manager - Orchestrates delivery of queued offline actions
//!
//! Coordinates the persistent queue, the transport and the retry policy.
//! Handles:
//! - Producer API (enqueue, status, force sync, clear, subscribe)
//! - Single-flight sync passes
//! - Priority ordering and batched dispatch
//! - Retry/abandon bookkeeping and lifecycle events

use super::api::{parse_header, ActionTransport, DispatchError};
use super::events::{EventBus, FailureReason, Subscription, SyncEvent, SyncTopic};
use super::models::{
    sort_for_dispatch, ActionFilter, ActionStatus, ActionTarget, NewAction, OfflineAction,
    QueueStatus,
};
use super::queue::{ActionStore, CorruptAction, StoreError};
use super::retry::{RetryDecision, RetryPolicy};
use super::signal::NetworkSignal;
use super::wake::BackgroundWakeRegistrar;
use crate::config::EngineConfig;
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// Result of a `sync()` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A pass ran
    Completed(SyncReport),
    /// Guard tripped; nothing was dispatched
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    EmptyQueue,
}

/// Counts for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pass: u64,
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Removed for exceeding the maximum queue age
    pub expired: usize,
    /// Undecodable rows dropped before dispatch
    pub corrupt: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Synced => self.succeeded += 1,
            DispatchOutcome::Retried => self.retried += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Skipped => return,
        }
        self.processed += 1;
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Synced,
    Retried,
    Failed,
    /// Not claimable, removed, or unwritable before its outcome could be applied
    Skipped,
}

/// Single-flight state. `generation` lets `force_sync` release the guard
/// without a stale pass clearing the flag of the pass that replaced it.
#[derive(Debug, Default)]
struct FlightState {
    syncing: bool,
    generation: u64,
}

struct FlightGuard {
    flight: Arc<StdMutex<FlightState>>,
    generation: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation == self.generation {
            state.syncing = false;
        }
    }
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    store: Arc<dyn ActionStore>,
    transport: Arc<dyn ActionTransport>,
    retry: Arc<RetryPolicy>,
    config: Arc<EngineConfig>,
    events: EventBus,
    signal: NetworkSignal,
    wake: BackgroundWakeRegistrar,
    flight: Arc<StdMutex<FlightState>>,
    passes: Arc<AtomicU64>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn ActionStore>,
        transport: Arc<dyn ActionTransport>,
        signal: NetworkSignal,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            retry: Arc::new(config.retry.clone()),
            config: Arc::new(config),
            events: EventBus::new(),
            signal,
            wake: BackgroundWakeRegistrar::unsupported(),
            flight: Arc::new(StdMutex::new(FlightState::default())),
            passes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Use a real background-wake backend instead of the unsupported default
    pub fn with_wake(mut self, wake: BackgroundWakeRegistrar) -> Self {
        self.wake = wake;
        self
    }

    pub fn signal(&self) -> &NetworkSignal {
        &self.signal
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Persist a new action and return its id.
    ///
    /// The action is durable when this returns. If online, a pass is started
    /// in the background.
    pub async fn enqueue_action(&self, request: NewAction) -> Result<String, SyncManagerError> {
        if request.entity.trim().is_empty() {
            return Err(SyncManagerError::InvalidAction("entity must not be empty".to_string()));
        }
        validate_target_url(&request.target.url)?;
        validate_target_headers(&request.target)?;

        let action = OfflineAction::new(request, self.config.default_max_attempts);
        let outcome = self.store.put(&action).await?;

        for evicted in outcome.evicted {
            self.events.emit(SyncEvent::ActionFailed {
                id: evicted.id,
                entity: evicted.entity,
                attempts: evicted.attempts,
                reason: FailureReason::Evicted,
            });
        }
        self.report_corrupt(outcome.corrupt);

        log::info!(
            "Queued {} {} action {} ({} priority)",
            action.kind.as_str(),
            action.entity,
            action.id,
            action.priority.as_str()
        );
        self.events.emit(SyncEvent::Queued {
            id: action.id.clone(),
            kind: action.kind,
            entity: action.entity.clone(),
            priority: action.priority,
        });

        self.wake.request_once();

        if self.signal.is_online() {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.sync().await {
                    log::error!("Sync after enqueue failed: {}", e);
                }
            });
        }

        Ok(action.id)
    }

    /// Snapshot for "N changes pending" indicators
    pub async fn get_queue_status(&self) -> Result<QueueStatus, SyncManagerError> {
        let stats = self.store.stats().await?;

        Ok(QueueStatus {
            total: stats.total,
            pending: stats.queued,
            in_flight: stats.syncing,
            by_priority: stats.by_priority,
            by_entity: stats.by_entity,
            oldest_enqueued_at: stats.oldest_enqueued_at,
            syncing: self.is_syncing(),
            online: self.signal.is_online(),
        })
    }

    /// Release the single-flight guard, make every queued action eligible
    /// now, and run a pass. Requests already in flight are not cancelled;
    /// their results are applied when they arrive.
    pub async fn force_sync(&self) -> Result<SyncOutcome, SyncManagerError> {
        self.release_guard();
        let rescheduled = self.store.reschedule_all().await?;
        log::info!("Forced sync requested ({} actions rescheduled)", rescheduled);

        self.sync().await
    }

    /// Drop every queued action
    pub async fn clear_queue(&self) -> Result<usize, SyncManagerError> {
        Ok(self.store.clear().await?)
    }

    pub fn on<F>(&self, topic: SyncTopic, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.on(topic, handler)
    }

    /// Return actions left mid-dispatch by a previous process to the queue
    pub async fn recover_interrupted(&self) -> Result<usize, SyncManagerError> {
        Ok(self.store.reset_in_flight().await?)
    }

    pub fn is_syncing(&self) -> bool {
        self.flight.lock().unwrap_or_else(|e| e.into_inner()).syncing
    }

    // ========================================================================
    // Sync Pass
    // ========================================================================

    /// Run one pass over the ready actions.
    ///
    /// Returns immediately when offline, when another pass holds the guard,
    /// or when the queue is empty.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncManagerError> {
        if !self.signal.is_online() {
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }

        let Some(_guard) = self.begin_pass() else {
            log::debug!("Sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadySyncing));
        };

        if self.store.count().await? == 0 {
            return Ok(SyncOutcome::Skipped(SkipReason::EmptyQueue));
        }

        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = SyncReport {
            pass,
            ..SyncReport::default()
        };

        log::info!("Sync pass {} started", pass);
        self.events.emit(SyncEvent::SyncStarted { pass });

        let result = self.run_pass(&mut report).await;

        log::info!(
            "Sync pass {} completed: succeeded={}, retried={}, failed={}, expired={}, corrupt={}",
            pass,
            report.succeeded,
            report.retried,
            report.failed,
            report.expired,
            report.corrupt
        );
        self.events.emit(SyncEvent::SyncCompleted {
            pass,
            succeeded: report.succeeded,
            retried: report.retried,
            failed: report.failed,
        });

        result.map(|()| SyncOutcome::Completed(report))
    }

    async fn run_pass(&self, report: &mut SyncReport) -> Result<(), SyncManagerError> {
        report.corrupt = self.drop_corrupt().await;
        report.expired = self.expire_stale().await;

        let mut candidates = self.store.get_all(&ActionFilter::ready(Utc::now())).await?;
        sort_for_dispatch(&mut candidates);

        if candidates.is_empty() {
            log::debug!("No actions ready for dispatch");
            return Ok(());
        }

        if self.config.batching_enabled {
            let mut batches = candidates.chunks(self.config.batch_size.max(1)).peekable();

            while let Some(batch) = batches.next() {
                let outcomes = join_all(batch.iter().map(|a| self.dispatch_one(a.clone()))).await;
                for outcome in outcomes {
                    report.record(outcome);
                }

                if batches.peek().is_some() && !self.config.batch_delay.is_zero() {
                    tokio::time::sleep(self.config.batch_delay).await;
                }
            }
        } else {
            for action in candidates {
                let outcome = self.dispatch_one(action).await;
                report.record(outcome);
            }
        }

        Ok(())
    }

    /// Claim one candidate, dispatch the stored copy and apply the outcome.
    ///
    /// The candidate may be stale; only the claimed row is dispatched.
    async fn dispatch_one(&self, candidate: OfflineAction) -> DispatchOutcome {
        let mut action = match self.store.claim(&candidate.id, Utc::now()).await {
            Ok(Some(action)) => action,
            Ok(None) => {
                log::debug!("Action {} no longer claimable, skipping", candidate.id);
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                log::error!("Failed to mark action {} in flight: {}", candidate.id, e);
                return DispatchOutcome::Skipped;
            }
        };

        let timeout = self.config.dispatch_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.dispatch(&action)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };

        action.attempts += 1;
        action.updated_at = Utc::now();

        match result {
            Ok(response) => {
                if let Err(e) = self.store.delete(&action.id).await {
                    log::error!("Action {} delivered but could not be removed: {}", action.id, e);
                }

                log::info!(
                    "Action {} ({}) synced with HTTP {}",
                    action.id,
                    action.entity,
                    response.status
                );
                self.events.emit(SyncEvent::ActionSynced {
                    id: action.id,
                    entity: action.entity,
                    attempts: action.attempts,
                    status: response.status,
                });
                DispatchOutcome::Synced
            }
            Err(error) => self.handle_failure(action, error).await,
        }
    }

    async fn handle_failure(&self, mut action: OfflineAction, error: DispatchError) -> DispatchOutcome {
        action.last_error = Some(error.to_string());

        match self.retry.decide_for(&action, &error) {
            RetryDecision::Retry { delay } => {
                action.status = ActionStatus::Queued;
                action.next_attempt_at = Some(
                    action.updated_at
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                );

                match self.store.update(&action).await {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!("Action {} removed while in flight, dropping retry", action.id);
                        return DispatchOutcome::Skipped;
                    }
                    Err(e) => {
                        log::error!("Failed to persist retry for action {}: {}", action.id, e);
                        return DispatchOutcome::Skipped;
                    }
                }

                log::warn!(
                    "Action {} ({}) failed, attempt {}/{}, retrying in {:?}: {}",
                    action.id,
                    action.entity,
                    action.attempts,
                    action.max_attempts,
                    delay,
                    error
                );
                self.events.emit(SyncEvent::ActionRetried {
                    id: action.id,
                    entity: action.entity,
                    attempts: action.attempts,
                    max_attempts: action.max_attempts,
                    delay,
                    error: error.to_string(),
                });
                DispatchOutcome::Retried
            }
            RetryDecision::Abandon => {
                match self.store.delete(&action.id).await {
                    Ok(true) => {}
                    Ok(false) => return DispatchOutcome::Skipped,
                    Err(e) => {
                        log::error!("Failed to remove abandoned action {}: {}", action.id, e);
                    }
                }

                let last_error = error.to_string();
                let reason = if self.retry.abandon_client_errors && error.is_permanent() {
                    FailureReason::Rejected { last_error }
                } else {
                    FailureReason::RetriesExhausted { last_error }
                };

                log::error!(
                    "Action {} ({}) abandoned after {} attempts: {}",
                    action.id,
                    action.entity,
                    action.attempts,
                    error
                );
                self.events.emit(SyncEvent::ActionFailed {
                    id: action.id,
                    entity: action.entity,
                    attempts: action.attempts,
                    reason,
                });
                DispatchOutcome::Failed
            }
        }
    }

    /// Remove rows that no longer decode so they cannot block healthy work
    async fn drop_corrupt(&self) -> usize {
        match self.store.remove_corrupt().await {
            Ok(removed) => {
                let count = removed.len();
                self.report_corrupt(removed);
                count
            }
            Err(e) => {
                log::error!("Failed to check queue for corrupted actions: {}", e);
                0
            }
        }
    }

    fn report_corrupt(&self, removed: Vec<CorruptAction>) {
        for bad in removed {
            self.events.emit(SyncEvent::ActionFailed {
                id: bad.id,
                entity: bad.entity,
                attempts: 0,
                reason: FailureReason::Corrupt { details: bad.details },
            });
        }
    }

    /// Remove actions older than the configured maximum age
    async fn expire_stale(&self) -> usize {
        let Some(max_age) = self.config.max_queue_age else {
            return 0;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };

        let expired = match self.store.purge_older_than(Utc::now() - max_age).await {
            Ok(expired) => expired,
            Err(e) => {
                log::error!("Failed to purge expired actions: {}", e);
                return 0;
            }
        };

        let count = expired.len();
        for action in expired {
            log::warn!(
                "Action {} ({}) expired after waiting since {}",
                action.id,
                action.entity,
                action.enqueued_at.to_rfc3339()
            );
            self.events.emit(SyncEvent::ActionFailed {
                id: action.id,
                entity: action.entity,
                attempts: action.attempts,
                reason: FailureReason::Expired,
            });
        }
        count
    }

    // ========================================================================
    // Single-flight guard
    // ========================================================================

    fn begin_pass(&self) -> Option<FlightGuard> {
        let mut state = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        if state.syncing {
            return None;
        }

        state.syncing = true;
        state.generation += 1;
        Some(FlightGuard {
            flight: self.flight.clone(),
            generation: state.generation,
        })
    }

    fn release_guard(&self) {
        let mut state = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        if state.syncing {
            log::warn!("Releasing sync guard held by pass generation {}", state.generation);
        }
        state.syncing = false;
    }
}

fn validate_target_url(raw: &str) -> Result<(), SyncManagerError> {
    let url = url::Url::parse(raw).map_err(|e| SyncManagerError::InvalidTarget {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SyncManagerError::InvalidTarget {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn validate_target_headers(target: &ActionTarget) -> Result<(), SyncManagerError> {
    for (name, value) in &target.headers {
        parse_header(name, value).map_err(|e| SyncManagerError::InvalidTarget {
            url: target.url.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Sync manager errors
#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Queue storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_validation() {
        assert!(validate_target_url("https://desk.example.com/api/tickets").is_ok());
        assert!(validate_target_url("http://localhost:8080/api").is_ok());
        assert!(matches!(
            validate_target_url("ftp://desk.example.com/file"),
            Err(SyncManagerError::InvalidTarget { .. })
        ));
        assert!(matches!(
            validate_target_url("/api/tickets"),
            Err(SyncManagerError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_target_header_validation() {
        let target = ActionTarget::post("https://desk.example.com/api/tickets")
            .with_header("X-Tenant-Id", "acme");
        assert!(validate_target_headers(&target).is_ok());

        let bad_name = target.clone().with_header("Bad Header", "x");
        assert!(matches!(
            validate_target_headers(&bad_name),
            Err(SyncManagerError::InvalidTarget { .. })
        ));

        let bad_value = target.with_header("X-Note", "line\nbreak");
        assert!(matches!(
            validate_target_headers(&bad_value),
            Err(SyncManagerError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_report_ignores_skipped() {
        let mut report = SyncReport::default();
        report.record(DispatchOutcome::Synced);
        report.record(DispatchOutcome::Retried);
        report.record(DispatchOutcome::Failed);
        report.record(DispatchOutcome::Skipped);

        assert_eq!(report.processed, 3);
        assert_eq!((report.succeeded, report.retried, report.failed), (1, 1, 1));
    }

    #[test]
    fn test_stale_guard_does_not_clear_newer_pass() {
        let flight = Arc::new(StdMutex::new(FlightState::default()));

        let stale = {
            let mut state = flight.lock().unwrap();
            state.syncing = true;
            state.generation += 1;
            FlightGuard {
                flight: flight.clone(),
                generation: state.generation,
            }
        };

        // Forced release followed by a new pass
        {
            let mut state = flight.lock().unwrap();
            state.syncing = true;
            state.generation += 1;
        }

        drop(stale);
        assert!(flight.lock().unwrap().syncing);
    }
}
