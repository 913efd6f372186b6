//! Health Check Module
//!
//! Per-thread status derived from discovery recency and the outcome of the
//! last sync cycle, served as JSON on the debug listener.

use crate::tracker::{CaptureThread, SyncReport};
use crate::{Result, TrackerError};
use chrono::{DateTime, Utc};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one capture thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadHealth {
    pub id: usize,
    pub status: HealthStatus,
    pub tracked_files: usize,
    pub last_file_seen: DateTime<Utc>,
    pub seconds_since_last_file: u64,
    pub message: Option<String>,
}

/// Overall system health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub threads: Vec<ThreadHealth>,
    pub uptime_seconds: u64,
}

/// What the last sync cycle of a thread left behind
#[derive(Debug, Clone, Default)]
struct LastSync {
    error: Option<TrackerError>,
    free_percentage: Option<u8>,
}

/// Health check manager
pub struct HealthManager {
    start_time: SystemTime,
    threads: Vec<Arc<CaptureThread>>,
    stale_after: Duration,
    last_sync: RwLock<HashMap<usize, LastSync>>,
}

impl HealthManager {
    pub fn new(threads: Vec<Arc<CaptureThread>>, stale_after: Duration) -> Self {
        Self {
            start_time: SystemTime::now(),
            threads,
            stale_after,
            last_sync: RwLock::new(HashMap::new()),
        }
    }

    /// Remember the outcome of a sync cycle
    pub async fn record_sync(&self, id: usize, report: &SyncReport) {
        let error = report
            .eviction_error
            .clone()
            .or_else(|| report.scan_error.clone());
        self.last_sync.write().await.insert(
            id,
            LastSync {
                error,
                free_percentage: report.free_percentage,
            },
        );
    }

    pub async fn check_health(&self) -> SystemHealth {
        let now = SystemTime::now();
        // Snapshot so a tracker lock held below never blocks record_sync.
        let last_sync = self.last_sync.read().await.clone();

        let mut threads = Vec::with_capacity(self.threads.len());
        for thread in &self.threads {
            let (tracked_files, last_seen) = thread.status().await;
            let idle = now.duration_since(last_seen).unwrap_or(Duration::ZERO);
            let sync = last_sync.get(&thread.id()).cloned().unwrap_or_default();
            threads.push(self.thread_health(thread.id(), tracked_files, last_seen, idle, &sync));
        }

        SystemHealth {
            status: determine_overall_status(&threads),
            timestamp: DateTime::<Utc>::from(now),
            threads,
            uptime_seconds: self
                .start_time
                .elapsed()
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        }
    }

    fn thread_health(
        &self,
        id: usize,
        tracked_files: usize,
        last_seen: SystemTime,
        idle: Duration,
        sync: &LastSync,
    ) -> ThreadHealth {
        let (status, message) = if let Some(e) = &sync.error {
            (HealthStatus::Unhealthy, Some(e.to_string()))
        } else if idle > self.stale_after {
            (
                HealthStatus::Degraded,
                Some(format!("no new blockfile for {}s", idle.as_secs())),
            )
        } else {
            (
                HealthStatus::Healthy,
                sync.free_percentage.map(|df| format!("{}% free", df)),
            )
        };

        ThreadHealth {
            id,
            status,
            tracked_files,
            last_file_seen: DateTime::<Utc>::from(last_seen),
            seconds_since_last_file: idle.as_secs(),
            message,
        }
    }

    /// Build the `/healthz` response
    pub async fn health_response(&self) -> Result<Response<String>> {
        let health = self.check_health().await;

        let status_code = match health.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::to_string_pretty(&health)?;

        Response::builder()
            .status(status_code)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| TrackerError::HttpError(format!("Failed to build health response: {}", e)))
    }
}

fn determine_overall_status(threads: &[ThreadHealth]) -> HealthStatus {
    threads
        .iter()
        .map(|t| t.status)
        .max_by_key(|status| match status {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        })
        .unwrap_or(HealthStatus::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> HealthManager {
        HealthManager::new(Vec::new(), Duration::from_secs(60))
    }

    #[test]
    fn test_thread_health_rules() {
        let manager = manager();

        let healthy = manager.thread_health(
            0,
            3,
            SystemTime::now(),
            Duration::from_secs(5),
            &LastSync {
                error: None,
                free_percentage: Some(40),
            },
        );
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert_eq!(healthy.message.as_deref(), Some("40% free"));

        let stale = manager.thread_health(
            0,
            3,
            SystemTime::now(),
            Duration::from_secs(61),
            &LastSync::default(),
        );
        assert_eq!(stale.status, HealthStatus::Degraded);

        let stuck = manager.thread_health(
            0,
            0,
            SystemTime::now(),
            Duration::from_secs(1),
            &LastSync {
                error: Some(TrackerError::StuckError("nothing left".to_string())),
                free_percentage: Some(2),
            },
        );
        assert_eq!(stuck.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_overall_status_is_worst() {
        let mk = |status| ThreadHealth {
            id: 0,
            status,
            tracked_files: 0,
            last_file_seen: Utc::now(),
            seconds_since_last_file: 0,
            message: None,
        };
        assert_eq!(determine_overall_status(&[]), HealthStatus::Healthy);
        assert_eq!(
            determine_overall_status(&[mk(HealthStatus::Healthy), mk(HealthStatus::Degraded)]),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_overall_status(&[mk(HealthStatus::Unhealthy), mk(HealthStatus::Degraded)]),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_record_sync_marks_thread_unhealthy() {
        let manager = manager();
        let report = SyncReport {
            eviction_error: Some(TrackerError::MeasurementError("statvfs".to_string())),
            ..Default::default()
        };
        manager.record_sync(0, &report).await;
        let sync = manager.last_sync.read().await.get(&0).cloned().unwrap();
        assert!(matches!(sync.error, Some(TrackerError::MeasurementError(_))));
    }

    #[tokio::test]
    async fn test_empty_health_response_is_ok() {
        let response = manager().health_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().contains("\"status\": \"Healthy\""));
    }
}
