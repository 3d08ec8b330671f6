//! Bridges process termination signals to `Fleet::stop`.

use crate::fleet::Fleet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    fleet: Arc<Fleet>,
    requested: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self {
            fleet,
            requested: AtomicBool::new(false),
        }
    }

    /// Records a termination request. Only the first call returns `true`.
    pub fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Stops the fleet and returns once every session is closed.
    pub async fn shutdown(&self) {
        if self.request() {
            info!("Stop requested, draining {} sessions", self.fleet.active_devices().len());
        }
        self.fleet.stop().await;
    }

    /// Waits for the first signal, then drains the fleet. Signals that
    /// arrive while draining are acknowledged but change nothing.
    pub async fn run<F, Fut>(&self, mut next_signal: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        next_signal().await;

        let shutdown = self.shutdown();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = next_signal() => {
                    warn!("Shutdown already in progress, waiting for sessions to close");
                }
            }
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Device, FleetConfig, FleetOptions};
    use crate::credential::ConnectionString;
    use crate::transport::memory::MemoryEndpoint;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config() -> FleetConfig {
        let devices = ["device_A", "device_B"]
            .iter()
            .map(|id| Device {
                id: id.to_string(),
                location: "NAC".to_string(),
                credential: format!("HostName=h;DeviceId={};SharedAccessKey=c2VjcmV0", id)
                    .parse::<ConnectionString>()
                    .unwrap(),
            })
            .collect();
        FleetConfig {
            devices,
            options: FleetOptions::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_is_exactly_once() {
        let endpoint = MemoryEndpoint::new();
        let fleet = Arc::new(Fleet::start(config(), &endpoint).await.unwrap());
        let coordinator = ShutdownCoordinator::new(fleet);

        assert!(!coordinator.is_requested());
        assert!(coordinator.request());
        assert!(!coordinator.request());
        assert!(coordinator.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_signals_drain_once() {
        let endpoint = MemoryEndpoint::new();
        let fleet = Arc::new(Fleet::start(config(), &endpoint).await.unwrap());
        let coordinator = ShutdownCoordinator::new(Arc::clone(&fleet));

        let signal = Arc::new(Notify::new());
        let raiser = Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            raiser.notify_one();
            raiser.notify_one();
        });

        coordinator
            .run(|| {
                let signal = Arc::clone(&signal);
                async move { signal.notified().await }
            })
            .await;

        assert!(fleet.is_stopped());
        assert_eq!(endpoint.received_for("device_A").len(), 1);
        assert_eq!(endpoint.disconnect_count("device_A"), 1);
        assert_eq!(endpoint.disconnect_count("device_B"), 1);

        // A late call after draining is a no-op
        coordinator.shutdown().await;
        assert_eq!(endpoint.disconnect_count("device_A"), 1);
    }
}
