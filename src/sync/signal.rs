//! Network Signal
//!
//! Folds connectivity, visibility and background-wake notifications into a
//! single trigger stream for the scheduler. Online transitions are debounced
//! so a flapping link produces one trigger, not one per flap.

use super::api::DispatchError;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TRIGGER_CHANNEL_CAPACITY: usize = 32;

/// Why a sync pass was requested. Triggers carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Offline to online transition (after debounce)
    Online,
    /// Application became visible while online
    Visible,
    /// Host background-sync facility woke us
    BackgroundWake,
    /// Explicit request from the application
    Manual,
}

/// Shared connectivity state and trigger source, cheap to clone
#[derive(Clone)]
pub struct NetworkSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    online: AtomicBool,
    debounce: Duration,
    pending: StdMutex<Option<JoinHandle<()>>>,
    triggers: broadcast::Sender<SyncTrigger>,
}

impl NetworkSignal {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (triggers, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SignalInner {
                online: AtomicBool::new(initially_online),
                debounce,
                pending: StdMutex::new(None),
                triggers,
            }),
        }
    }

    /// Debounced connectivity state
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Report a connectivity observation.
    ///
    /// Going offline takes effect immediately and cancels a pending online
    /// transition. Going online takes effect once the link has stayed up for
    /// the debounce window, then raises `SyncTrigger::Online`.
    pub fn set_online(&self, online: bool) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        if !online {
            if self.inner.online.swap(false, Ordering::SeqCst) {
                log::info!("Network: offline");
            }
            return;
        }

        if self.is_online() {
            return;
        }

        if self.inner.debounce.is_zero() {
            self.inner.go_online();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                *pending = Some(runtime.spawn(async move {
                    tokio::time::sleep(inner.debounce).await;
                    inner.go_online();
                }));
            }
            Err(_) => self.inner.go_online(),
        }
    }

    /// Report a visibility change; becoming visible while online triggers a pass
    pub fn set_visible(&self, visible: bool) {
        if visible && self.is_online() {
            self.inner.send(SyncTrigger::Visible);
        }
    }

    /// Raised by a background-wake backend
    pub fn background_wake(&self) {
        self.inner.send(SyncTrigger::BackgroundWake);
    }

    pub fn request_sync(&self) {
        self.inner.send(SyncTrigger::Manual);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncTrigger> {
        self.inner.triggers.subscribe()
    }
}

impl SignalInner {
    fn go_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            log::info!("Network: online");
            self.send(SyncTrigger::Online);
        }
    }

    fn send(&self, trigger: SyncTrigger) {
        // No receivers just means nobody is scheduling yet
        let _ = self.triggers.send(trigger);
    }
}

// ============================================================================
// Connectivity Probe
// ============================================================================

/// Periodic HTTP reachability check feeding `NetworkSignal::set_online`.
///
/// Any HTTP response counts as reachable; only transport failures (DNS,
/// refused connection, timeout) count as offline.
pub struct ConnectivityProbe {
    client: Client,
    url: String,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> Result<Self, DispatchError> {
        let url = url.into();
        url::Url::parse(&url)
            .map_err(|e| DispatchError::InvalidRequest(format!("probe url {}: {}", url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::InvalidRequest(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            interval,
        })
    }

    /// Single reachability check
    pub async fn probe_once(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Connectivity probe to {} failed: {}", self.url, e);
                false
            }
        }
    }

    /// Probe forever at the configured interval
    pub fn start(self, signal: NetworkSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            log::info!(
                "Connectivity probe started ({} every {:?})",
                self.url,
                self.interval
            );

            loop {
                interval.tick().await;
                let online = self.probe_once().await;
                signal.set_online(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_online_without_debounce_triggers_once() {
        let signal = NetworkSignal::new(false, Duration::ZERO);
        let mut rx = signal.subscribe();

        signal.set_online(true);
        signal.set_online(true);

        assert!(signal.is_online());
        assert_eq!(rx.try_recv().unwrap(), SyncTrigger::Online);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_is_immediate_and_silent() {
        let signal = NetworkSignal::new(true, Duration::from_millis(50));
        let mut rx = signal.subscribe();

        signal.set_online(false);

        assert!(!signal.is_online());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_online_is_debounced() {
        let signal = NetworkSignal::new(false, Duration::from_millis(30));
        let mut rx = signal.subscribe();

        signal.set_online(true);
        assert!(!signal.is_online());

        let trigger = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger, SyncTrigger::Online);
        assert!(signal.is_online());
    }

    #[tokio::test]
    async fn test_flapping_is_suppressed() {
        let signal = NetworkSignal::new(false, Duration::from_millis(40));
        let mut rx = signal.subscribe();

        signal.set_online(true);
        signal.set_online(false);
        signal.set_online(true);
        signal.set_online(false);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!signal.is_online());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_visibility_only_triggers_when_online() {
        let signal = NetworkSignal::new(false, Duration::ZERO);
        let mut rx = signal.subscribe();

        signal.set_visible(true);
        assert!(rx.try_recv().is_err());

        signal.set_online(true);
        assert_eq!(rx.try_recv().unwrap(), SyncTrigger::Online);

        signal.set_visible(false);
        signal.set_visible(true);
        assert_eq!(rx.try_recv().unwrap(), SyncTrigger::Visible);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_reachable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/health")
            .with_status(503)
            .create_async()
            .await;

        let probe = ConnectivityProbe::new(
            format!("{}/health", server.url()),
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(probe.probe_once().await);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let probe = ConnectivityProbe::new(
            "http://127.0.0.1:1/health",
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(!probe.probe_once().await);
    }

    #[test]
    fn test_probe_rejects_invalid_url() {
        let result = ConnectivityProbe::new("::not a url::", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
    }
}
