//! Sync Scheduler
//!
//! Runs `sync_files` for every capture thread on a fixed interval, one task
//! per thread, until shutdown is broadcast. The first cycle runs immediately.

use crate::health::HealthManager;
use crate::shutdown::ShutdownCoordinator;
use crate::tracker::CaptureThread;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic sync driver
pub struct SyncScheduler {
    threads: Vec<Arc<CaptureThread>>,
    sync_interval: Duration,
    health: Option<Arc<HealthManager>>,
    cycles: Arc<AtomicU64>,
}

impl SyncScheduler {
    pub fn new(threads: Vec<Arc<CaptureThread>>, sync_interval: Duration) -> Self {
        Self {
            threads,
            sync_interval,
            health: None,
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report every sync outcome to the health manager
    pub fn set_health_manager(&mut self, health: Arc<HealthManager>) {
        self.health = Some(health);
    }

    /// Completed sync cycles across all threads
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Sync one thread and pass the outcome on
    async fn run_cycle(
        thread: &CaptureThread,
        health: Option<&HealthManager>,
        cycles: &AtomicU64,
    ) {
        let started = Instant::now();
        let report = thread.sync_files().await;
        cycles.fetch_add(1, Ordering::Relaxed);

        if report.is_clean() {
            debug!(
                "Thread {} sync finished in {:?}: {} new, {} evicted",
                thread.id(),
                started.elapsed(),
                report.discovered.len(),
                report.evicted.len()
            );
        } else {
            warn!(
                "Thread {} sync finished with errors in {:?}: {} new, {} evicted, {} unopenable",
                thread.id(),
                started.elapsed(),
                report.discovered.len(),
                report.evicted.len(),
                report.discovery_errors.len()
            );
        }

        if let Some(health) = health {
            health.record_sync(thread.id(), &report).await;
        }
    }

    /// Spawn one sync loop per thread and register them for shutdown
    pub async fn start(&self, coordinator: &ShutdownCoordinator) {
        for thread in &self.threads {
            let thread = thread.clone();
            let health = self.health.clone();
            let cycles = self.cycles.clone();
            let sync_interval = self.sync_interval;
            let mut shutdown = coordinator.signal();
            let task_name = format!("sync loop {}", thread.id());

            let handle = tokio::spawn(async move {
                info!(
                    "Starting sync loop for thread {} every {:?}",
                    thread.id(),
                    sync_interval
                );
                let mut ticker = interval(sync_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            Self::run_cycle(&thread, health.as_deref(), &cycles).await;
                        }
                        _ = shutdown.wait_for_shutdown() => {
                            info!("Sync loop for thread {} shutting down", thread.id());
                            break;
                        }
                    }
                }
            });
            coordinator.register_task(task_name, handle).await;
        }
    }
}
