//! Background Wake Registration
//!
//! Best-effort hookup with a host facility that can wake the engine while the
//! application is not in the foreground. Registration is requested once,
//! after the first successful enqueue; failures are logged and ignored since
//! the periodic timer and explicit triggers remain in place.

use super::signal::NetworkSignal;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tag the engine registers under
pub const WAKE_TAG: &str = "servicedesk-offline-sync";

#[derive(Debug, Clone, thiserror::Error)]
pub enum WakeError {
    #[error("Background wake is not supported on this platform")]
    Unsupported,

    #[error("Background wake permission denied")]
    Denied,

    #[error("Background wake registration failed: {0}")]
    Failed(String),
}

/// Host background-sync facility
#[async_trait]
pub trait BackgroundWake: Send + Sync {
    async fn register(&self, tag: &str, min_interval: Duration) -> Result<(), WakeError>;
}

/// Platform without a background-sync facility
pub struct UnsupportedWake;

#[async_trait]
impl BackgroundWake for UnsupportedWake {
    async fn register(&self, _tag: &str, _min_interval: Duration) -> Result<(), WakeError> {
        Err(WakeError::Unsupported)
    }
}

/// In-process periodic wake: raises `SyncTrigger::BackgroundWake` on the
/// signal every `min_interval` once registered
pub struct PeriodicWake {
    signal: NetworkSignal,
}

impl PeriodicWake {
    pub fn new(signal: NetworkSignal) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl BackgroundWake for PeriodicWake {
    async fn register(&self, tag: &str, min_interval: Duration) -> Result<(), WakeError> {
        if min_interval.is_zero() {
            return Err(WakeError::Failed("interval must be non-zero".to_string()));
        }

        let signal = self.signal.clone();
        let tag = tag.to_string();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(min_interval);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                log::debug!("Periodic wake '{}' fired", tag);
                signal.background_wake();
            }
        });

        Ok(())
    }
}

/// Requests registration at most once per process
#[derive(Clone)]
pub struct BackgroundWakeRegistrar {
    backend: Arc<dyn BackgroundWake>,
    min_interval: Duration,
    requested: Arc<AtomicBool>,
}

impl BackgroundWakeRegistrar {
    pub fn new(backend: Arc<dyn BackgroundWake>, min_interval: Duration) -> Self {
        Self {
            backend,
            min_interval,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registrar for platforms without the facility
    pub fn unsupported() -> Self {
        Self::new(Arc::new(UnsupportedWake), Duration::from_secs(60))
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Register in the background on first call; later calls are no-ops.
    /// Returns whether this call started the registration.
    pub fn request_once(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        let backend = self.backend.clone();
        let min_interval = self.min_interval;
        tokio::spawn(async move {
            match backend.register(WAKE_TAG, min_interval).await {
                Ok(()) => log::info!("Background wake registered (every {:?})", min_interval),
                Err(e) => log::warn!("Background wake unavailable: {}", e),
            }
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::signal::SyncTrigger;
    use std::sync::atomic::AtomicUsize;

    struct CountingWake {
        calls: Arc<AtomicUsize>,
        result: Result<(), WakeError>,
    }

    #[async_trait]
    impl BackgroundWake for CountingWake {
        async fn register(&self, _tag: &str, _min_interval: Duration) -> Result<(), WakeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_request_once_registers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registrar = BackgroundWakeRegistrar::new(
            Arc::new(CountingWake {
                calls: calls.clone(),
                result: Ok(()),
            }),
            Duration::from_secs(60),
        );

        assert!(registrar.request_once());
        assert!(!registrar.request_once());
        assert!(registrar.is_requested());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registrar = BackgroundWakeRegistrar::new(
            Arc::new(CountingWake {
                calls: calls.clone(),
                result: Err(WakeError::Denied),
            }),
            Duration::from_secs(60),
        );

        assert!(registrar.request_once());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_backend() {
        let result = UnsupportedWake.register(WAKE_TAG, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(WakeError::Unsupported)));
    }

    #[tokio::test]
    async fn test_periodic_wake_raises_trigger() {
        let signal = NetworkSignal::new(true, Duration::ZERO);
        let mut rx = signal.subscribe();

        PeriodicWake::new(signal.clone())
            .register(WAKE_TAG, Duration::from_millis(20))
            .await
            .unwrap();

        let trigger = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger, SyncTrigger::BackgroundWake);
    }
}
