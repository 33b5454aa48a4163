//! Debounced restarts of the managed proxy
//!
//! Mutations call [`RestartCoordinator::signal_change`], which only sets a
//! dirty flag. A single background task calls [`RestartCoordinator::tick`] on
//! a fixed period; each tick test-and-resets the flag and restarts the proxy
//! at most once, however many changes arrived in between.

use crate::config::RestartConfig;
use crate::error::RestartError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// The proxy process whose live configuration tracks the store
#[async_trait]
pub trait ManagedProxy: Send + Sync {
    /// Reload the configuration from the store and restart
    async fn restart(&self) -> anyhow::Result<()>;
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing changed since the last tick
    Idle,
    /// The proxy was restarted
    Restarted,
    /// A restart was attempted and failed
    Failed,
}

/// Snapshot of the coordinator's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartStats {
    pub dirty: bool,
    pub restarts: u64,
    pub failures: u64,
}

pub struct RestartCoordinator {
    dirty: AtomicBool,
    proxy: Arc<dyn ManagedProxy>,
    interval: Duration,
    restart_timeout: Duration,
    rearm_on_failure: bool,
    restarts: AtomicU64,
    failures: AtomicU64,
}

impl RestartCoordinator {
    /// Create a coordinator. Returns `Arc<Self>` since request handlers
    /// and the tick task share it.
    pub fn new(proxy: Arc<dyn ManagedProxy>, config: &RestartConfig) -> Arc<Self> {
        Arc::new(Self {
            dirty: AtomicBool::new(false),
            proxy,
            interval: config.interval(),
            restart_timeout: config.timeout(),
            rearm_on_failure: config.rearm_on_failure,
            restarts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Record that the configuration changed. Idempotent until the next tick.
    pub fn signal_change(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> RestartStats {
        RestartStats {
            dirty: self.is_dirty(),
            restarts: self.restarts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Restart the proxy if anything changed since the previous tick
    pub async fn tick(&self) -> TickOutcome {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            trace!("No configuration changes since last tick");
            return TickOutcome::Idle;
        }

        info!("Configuration changed, restarting managed proxy");

        match self.restart_bounded().await {
            Ok(()) => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                info!("Managed proxy restarted");
                TickOutcome::Restarted
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to restart managed proxy");
                if self.rearm_on_failure {
                    // Changes made during the failed restart are kept either way
                    self.signal_change();
                    warn!("Restart will be retried on the next tick");
                }
                TickOutcome::Failed
            }
        }
    }

    async fn restart_bounded(&self) -> Result<(), RestartError> {
        match tokio::time::timeout(self.restart_timeout, self.proxy.restart()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RestartError::Failed(e)),
            Err(_) => Err(RestartError::TimedOut(self.restart_timeout)),
        }
    }

    /// Tick on the configured interval until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        debug!(interval_secs = self.interval.as_secs_f64(), "Restart coordinator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Restart coordinator stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts restarts and optionally fails or stalls them
    #[derive(Default)]
    pub(crate) struct RecordingProxy {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        pub delay: Option<Duration>,
    }

    impl RecordingProxy {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManagedProxy for RecordingProxy {
        async fn restart(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("xray exited with status 23");
            }
            Ok(())
        }
    }

    fn coordinator(proxy: Arc<RecordingProxy>, config: RestartConfig) -> Arc<RestartCoordinator> {
        RestartCoordinator::new(proxy, &config)
    }

    #[tokio::test]
    async fn test_no_change_no_restart() {
        let proxy = Arc::new(RecordingProxy::default());
        let coordinator = coordinator(Arc::clone(&proxy), RestartConfig::default());

        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(proxy.calls(), 0);
    }

    #[tokio::test]
    async fn test_many_signals_collapse_into_one_restart() {
        let proxy = Arc::new(RecordingProxy::default());
        let coordinator = coordinator(Arc::clone(&proxy), RestartConfig::default());

        for _ in 0..25 {
            coordinator.signal_change();
        }
        assert!(coordinator.is_dirty());

        assert_eq!(coordinator.tick().await, TickOutcome::Restarted);
        assert_eq!(proxy.calls(), 1);
        assert!(!coordinator.is_dirty());

        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(proxy.calls(), 1);
        assert_eq!(coordinator.stats().restarts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_signals_collapse() {
        let proxy = Arc::new(RecordingProxy::default());
        let coordinator = coordinator(Arc::clone(&proxy), RestartConfig::default());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        c.signal_change();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(coordinator.tick().await, TickOutcome::Restarted);
        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(proxy.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_not_rearmed() {
        let proxy = Arc::new(RecordingProxy::default());
        proxy.fail.store(true, Ordering::SeqCst);
        let coordinator = coordinator(Arc::clone(&proxy), RestartConfig::default());

        coordinator.signal_change();
        assert_eq!(coordinator.tick().await, TickOutcome::Failed);
        assert!(!coordinator.is_dirty());

        assert_eq!(coordinator.tick().await, TickOutcome::Idle);
        assert_eq!(proxy.calls(), 1);

        let stats = coordinator.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.restarts, 0);

        // A later change triggers a fresh attempt
        proxy.fail.store(false, Ordering::SeqCst);
        coordinator.signal_change();
        assert_eq!(coordinator.tick().await, TickOutcome::Restarted);
        assert_eq!(proxy.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_restart_rearmed_when_configured() {
        let proxy = Arc::new(RecordingProxy::default());
        proxy.fail.store(true, Ordering::SeqCst);
        let config = RestartConfig {
            rearm_on_failure: true,
            ..RestartConfig::default()
        };
        let coordinator = coordinator(Arc::clone(&proxy), config);

        coordinator.signal_change();
        assert_eq!(coordinator.tick().await, TickOutcome::Failed);
        assert!(coordinator.is_dirty());

        proxy.fail.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.tick().await, TickOutcome::Restarted);
        assert_eq!(proxy.calls(), 2);
    }

    #[tokio::test]
    async fn test_restart_timeout_counts_as_failure() {
        let proxy = Arc::new(RecordingProxy {
            delay: Some(Duration::from_secs(3)),
            ..RecordingProxy::default()
        });
        let config = RestartConfig {
            timeout_secs: 1,
            ..RestartConfig::default()
        };
        let coordinator = coordinator(Arc::clone(&proxy), config);

        coordinator.signal_change();
        assert_eq!(coordinator.tick().await, TickOutcome::Failed);
        assert_eq!(coordinator.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_run_loop_restarts_and_stops() {
        let proxy = Arc::new(RecordingProxy::default());
        let config = RestartConfig {
            interval_secs: 1,
            ..RestartConfig::default()
        };
        let coordinator = coordinator(Arc::clone(&proxy), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&coordinator).run(shutdown_rx));

        coordinator.signal_change();
        coordinator.signal_change();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(proxy.calls(), 1);
        assert!(!coordinator.is_dirty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("coordinator stops on shutdown")
            .unwrap();
    }
}
