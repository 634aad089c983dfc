//! Scheduled background work
//!
//! Two interval loops per router:
//!
//! - cache cleanup (expired entries)
//! - metrics analysis (alerts, bottleneck pruning, auto-optimization)
//!
//! Both stop on a `watch` shutdown signal. [`BackgroundTasks::shutdown`]
//! joins them, so start and stop are deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::router::{QueryRouter, RouterError};

/// Shortest accepted interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Intervals of the background loops
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Expired-entry sweep interval
    pub cleanup_interval: Duration,
    /// Pattern and bottleneck analysis interval
    pub analysis_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            analysis_interval: Duration::from_secs(60),
        }
    }
}

/// Handles of a router's running background loops
pub struct BackgroundTasks {
    router: Arc<QueryRouter>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start the cleanup and analysis loops for `router`
    ///
    /// # Errors
    ///
    /// [`RouterError::AlreadyRunning`] if the router already has loops running.
    pub fn spawn(router: Arc<QueryRouter>, config: SchedulerConfig) -> Result<Self, RouterError> {
        if !router.claim_background() {
            return Err(RouterError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cleanup = {
            let router = Arc::clone(&router);
            let mut shutdown = shutdown_rx.clone();
            let period = config.cleanup_interval.max(MIN_INTERVAL);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            router.cleanup();
                        }
                    }
                }
                tracing::debug!("Cache cleanup loop stopped");
            })
        };

        let analysis = {
            let router = Arc::clone(&router);
            let mut shutdown = shutdown_rx;
            let period = config.analysis_interval.max(MIN_INTERVAL);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Some(outcome) = router.run_analysis().await {
                                tracing::debug!(
                                    capacity = outcome.adjusted_capacity,
                                    "Scheduled optimization ran"
                                );
                            }
                        }
                    }
                }
                tracing::debug!("Metrics analysis loop stopped");
            })
        };

        tracing::info!(
            cleanup_secs = config.cleanup_interval.as_secs_f64(),
            analysis_secs = config.analysis_interval.as_secs_f64(),
            "Background tasks started"
        );

        Ok(Self {
            router,
            shutdown_tx,
            handles: vec![cleanup, analysis],
        })
    }

    /// Whether every loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }

    /// Stop both loops and wait for them to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.router.release_background();
        tracing::info!("Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.shutdown_tx.send(true);
            self.router.release_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complexity::EngineFamily;
    use crate::config::RouterSettings;
    use crate::engine::{Engine, ScriptedEngine};
    use crate::types::{CacheTier, QueryRequest};

    fn router(settings: RouterSettings) -> Arc<QueryRouter> {
        let engine: Arc<dyn Engine> = Arc::new(ScriptedEngine::new("local-fast", EngineFamily::LocalFast));
        Arc::new(
            QueryRouter::builder()
                .engine(engine)
                .settings(settings)
                .build()
                .unwrap(),
        )
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            cleanup_interval: Duration::from_millis(10),
            analysis_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let router = router(RouterSettings::default());
        let tasks = tokio_test::assert_ok!(BackgroundTasks::spawn(Arc::clone(&router), fast_config()));
        assert!(tasks.is_running());

        let second = BackgroundTasks::spawn(Arc::clone(&router), fast_config());
        assert!(matches!(second, Err(RouterError::AlreadyRunning)));

        tasks.shutdown().await;
        let again = tokio_test::assert_ok!(BackgroundTasks::spawn(Arc::clone(&router), fast_config()));
        again.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_entries() {
        let mut settings = RouterSettings::default();
        settings.cache.exact.ttl = Duration::from_millis(5);
        settings.cache.predictive.ttl = Duration::from_millis(5);
        settings.cache.pattern.ttl = Duration::from_millis(5);
        settings.cache.similarity.ttl = Duration::from_millis(5);
        let router = router(settings);

        router.route(QueryRequest::new("cpu usage")).await;
        assert_eq!(router.cache().len(CacheTier::Exact), 1);

        let tasks = BackgroundTasks::spawn(Arc::clone(&router), fast_config()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tasks.shutdown().await;

        assert_eq!(router.cache().len(CacheTier::Exact), 0);
    }

    #[tokio::test]
    async fn test_analysis_runs_optimizer() {
        let router = router(RouterSettings::default());
        // Uncached traffic keeps the hit rate at zero
        for _ in 0..25 {
            router
                .route(QueryRequest::new("cpu usage").with_cache(false))
                .await;
        }

        let tasks = BackgroundTasks::spawn(Arc::clone(&router), fast_config()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tasks.shutdown().await;

        assert_eq!(router.optimizer().outcomes().len(), 1);
    }
}
