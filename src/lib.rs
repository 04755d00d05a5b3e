//! # ServiceDesk Offline
//!
//! Durable offline action queue and background sync engine for the
//! ServiceDesk client. State-changing operations made without connectivity
//! are persisted locally and replayed to the API once the network returns.

pub mod config;
pub mod db;
pub mod sync;

use config::EngineConfig;
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use sync::{
    ActionTransport, BackgroundScheduler, BackgroundWakeRegistrar, ConnectivityProbe,
    HttpTransport, NetworkSignal, PeriodicWake, SchedulerConfig, SqliteActionStore, SyncManager,
};

/// Database file inside the data directory
pub const DB_FILE_NAME: &str = "offline_queue.db";

// ============================================================================
// Application State
// ============================================================================

/// Engine components wired together once by the composition root and handed
/// to consumers by reference
pub struct AppState {
    pub db: Arc<Database>,
    pub manager: SyncManager,
    pub scheduler: Arc<BackgroundScheduler>,
    pub signal: NetworkSignal,
}

impl AppState {
    /// Wire the engine with the HTTP transport
    pub fn new(db: Database, config: EngineConfig) -> Result<Self, sync::DispatchError> {
        let transport = HttpTransport::with_timeout(config.dispatch_timeout)?;
        Ok(Self::with_transport(db, config, Arc::new(transport)))
    }

    /// Wire the engine around a caller-provided transport
    pub fn with_transport(db: Database, config: EngineConfig, transport: Arc<dyn ActionTransport>) -> Self {
        let db = Arc::new(db);
        // Without a probe nothing would ever report "online"
        let signal = NetworkSignal::new(config.probe_url.is_none(), config.network_debounce);

        let store = Arc::new(SqliteActionStore::with_capacity(db.clone(), config.max_queue_size));
        let wake = BackgroundWakeRegistrar::new(
            Arc::new(PeriodicWake::new(signal.clone())),
            config.wake_interval,
        );
        let scheduler = Arc::new(BackgroundScheduler::with_config(
            db.clone(),
            SchedulerConfig {
                enabled: true,
                interval_secs: config.sync_interval.as_secs().max(1),
                last_run: None,
            },
        ));

        let manager = SyncManager::new(store, transport, signal.clone(), config).with_wake(wake);

        Self {
            db,
            manager,
            scheduler,
            signal,
        }
    }
}

// ============================================================================
// Application Entry Point
// ============================================================================

fn resolve_data_dir(config: &EngineConfig) -> Option<PathBuf> {
    if let Some(dir) = &config.data_dir {
        return Some(dir.clone());
    }

    directories::ProjectDirs::from("com", "servicedesk", "servicedesk-offline")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

fn fatal(message: &str) -> ! {
    log::error!("{}", message);
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Run the sync daemon until Ctrl-C
pub async fn run() {
    // Load .env file for engine settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => fatal(&format!("Invalid configuration: {}", e)),
    };

    let data_dir = match resolve_data_dir(&config) {
        Some(dir) => dir,
        None => fatal("Failed to get app directories. Please ensure HOME environment variable is set."),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        fatal(&format!("Failed to create data directory at {:?}: {}", data_dir, e));
    }

    let db_path = data_dir.join(DB_FILE_NAME);
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => db,
        Err(e) => fatal(&format!("Database initialization failed: {}", e)),
    };
    log::info!("Database initialized successfully");

    let probe = match &config.probe_url {
        Some(url) => match ConnectivityProbe::new(url.clone(), config.probe_interval, config.dispatch_timeout) {
            Ok(probe) => Some(probe),
            Err(e) => fatal(&format!("Invalid connectivity probe: {}", e)),
        },
        None => None,
    };

    let state = match AppState::new(db, config) {
        Ok(state) => state,
        Err(e) => fatal(&format!("Failed to create HTTP transport: {}", e)),
    };

    match state.manager.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => log::info!("Returned {} interrupted actions to the queue", n),
        Err(e) => log::error!("Failed to recover interrupted actions: {}", e),
    }

    let probe_handle = probe.map(|probe| probe.start(state.signal.clone()));

    if let Err(e) = state.scheduler.load_config().await {
        log::warn!("Failed to load scheduler config, using defaults: {}", e);
    }

    if state.scheduler.get_config().await.enabled {
        if let Err(e) = state.scheduler.start(state.manager.clone()).await {
            log::error!("Failed to start background scheduler: {}", e);
        }
    } else {
        log::info!("Background scheduler disabled by config");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down");

    if state.scheduler.is_running() {
        if let Err(e) = state.scheduler.stop().await {
            log::warn!("Failed to stop scheduler: {}", e);
        }
    }
    if let Some(handle) = probe_handle {
        handle.abort();
    }

    match state.manager.get_queue_status().await {
        Ok(status) if status.total > 0 => {
            log::info!("{} actions remain queued for the next run", status.total)
        }
        Ok(_) => {}
        Err(e) => log::warn!("Failed to read queue status: {}", e),
    }
}
