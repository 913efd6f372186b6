use capture_tracker::{
    config::Config,
    debug_server::DebugServer,
    disk::FsDiskUsage,
    health::HealthManager,
    logging::LoggerManager,
    pcap_blockfile::PcapBlockfileOpener,
    scheduler::SyncScheduler,
    shutdown::ShutdownCoordinator,
    tracker, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let logger = LoggerManager::new(
        config.logging.clone(),
        gethostname::gethostname().to_string_lossy().to_string(),
    );
    logger.initialize()?;

    info!(
        "Starting capture tracker v{} (built: {})",
        env!("BUILD_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    std::fs::create_dir_all(&config.base_dir).map_err(|e| {
        capture_tracker::TrackerError::SetupError(format!(
            "could not create base dir {}: {}",
            config.base_dir.display(),
            e
        ))
    })?;

    let threads = tracker::threads(
        &config.threads,
        &config.base_dir,
        &config.tracker_options(),
        Arc::new(PcapBlockfileOpener),
        Arc::new(FsDiskUsage),
    )?;
    for thread in &threads {
        info!(
            "Thread {}: packets {}, index {}, evict at or below {}% free",
            thread.id(),
            thread.config().packets_directory.display(),
            thread.config().index_directory.display(),
            thread.config().disk_free_percentage
        );
    }

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    let health = Arc::new(HealthManager::new(threads.clone(), config.sync.stale_after));

    let mut scheduler = SyncScheduler::new(threads.clone(), config.sync.interval);
    scheduler.set_health_manager(health.clone());
    scheduler.start(&shutdown_coordinator).await;

    if config.debug.enabled {
        let mut debug_server = DebugServer::new(Arc::new(config.debug.clone()), threads.clone());
        debug_server.set_health_manager(health.clone());
        let debug_shutdown = shutdown_coordinator.signal();
        let handle = tokio::spawn(async move {
            if let Err(e) = debug_server.start(debug_shutdown).await {
                error!("Debug server failed: {}", e);
            }
        });
        shutdown_coordinator.register_task("debug server", handle).await;
    } else {
        info!("Debug server disabled");
    }

    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
    }

    info!("Capture tracker shutdown complete");
    Ok(())
}
