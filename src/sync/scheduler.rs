//! Background Sync Scheduler
//!
//! Feeds the orchestrator's `sync()` from two independent sources: a periodic
//! safety-net timer and the network signal's trigger stream (online,
//! visible, background wake, manual). Uses a Tokio task for non-blocking
//! background execution.

use super::manager::{SyncManager, SyncOutcome};
use super::signal::SyncTrigger;
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Settings key holding the persisted scheduler configuration
const CONFIG_KEY: &str = "sync_scheduler";

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} seconds, got {}",
            MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_secs
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_config(db, SchedulerConfig::default())
    }

    /// Create with an initial configuration (overridden by `load_config`
    /// when one is persisted)
    pub fn with_config(db: Arc<Database>, config: SchedulerConfig) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let stored: Option<SchedulerConfig> = self
            .db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        if let Some(config) = stored {
            *self.config.write().await = config;
        }
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self, manager: SyncManager) -> Result<(), SchedulerError> {
        let interval_secs = self.config.read().await.interval_secs;
        validate_interval(interval_secs)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        // Subscribe before spawning so no trigger raised after start() is missed
        let triggers = manager.signal().subscribe();

        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.db.clone(),
            self.config.clone(),
            manager,
            triggers,
            Duration::from_secs(interval_secs),
        ));

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {} seconds)", interval_secs);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration, persist it, and restart the scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_secs: u64,
        manager: SyncManager,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_secs)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_secs = interval_secs;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start(manager).await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} seconds",
            enabled,
            interval_secs
        );
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager: SyncManager,
        mut triggers: broadcast::Receiver<SyncTrigger>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        // First tick fires immediately: one pass at startup
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Scheduler loop started (interval: {:?})", period);

        loop {
            let reason = tokio::select! {
                _ = interval.tick() => "timer".to_string(),
                trigger = triggers.recv() => match trigger {
                    Ok(trigger) => format!("{:?}", trigger),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Scheduler lagged behind {} triggers", skipped);
                        "lagged".to_string()
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::info!("Trigger channel closed");
                        break;
                    }
                },
            };

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Sync triggered by {}", reason);

            match manager.sync().await {
                Ok(SyncOutcome::Completed(report)) => {
                    if report.failed > 0 {
                        log::warn!("Scheduled sync abandoned {} actions", report.failed);
                    }

                    let mut cfg = config.write().await;
                    cfg.last_run = Some(Utc::now().to_rfc3339());
                    let snapshot = cfg.clone();
                    drop(cfg);

                    if let Err(e) = db.set_setting(CONFIG_KEY, &snapshot) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                Ok(SyncOutcome::Skipped(skip)) => {
                    log::debug!("Scheduled sync skipped: {:?}", skip);
                }
                Err(e) => {
                    log::error!("Scheduled sync failed: {}", e);
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
