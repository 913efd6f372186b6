//! Graceful Shutdown Module
//!
//! Handles SIGINT/SIGTERM, broadcasts shutdown to the sync scheduler and the
//! debug listener, and waits (bounded) for their tasks to finish.

use crate::{Result, TrackerError};
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            shutdown_sender,
            shutdown_timeout,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Same as `subscribe`, wrapped
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Track a component task so shutdown waits for it
    pub async fn register_task(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.into(), handle));
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                TrackerError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                TrackerError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Broadcast shutdown and wait for registered tasks
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        let tasks: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock().await);
        match timeout(self.shutdown_timeout, wait_for_tasks(tasks)).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(TrackerError::SystemError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }
}

async fn wait_for_tasks(tasks: Vec<(String, JoinHandle<()>)>) {
    for (name, handle) in tasks {
        match handle.await {
            Ok(()) => debug!("{} stopped", name),
            Err(e) => warn!("{} ended abnormally: {}", name, e),
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Wait for shutdown signal. A closed or lagged channel counts as one.
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
    }
}
