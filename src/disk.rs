//! Disk Usage Module
//!
//! Free-space measurement consumed by the eviction loop.

use crate::{Result, TrackerError};
use std::path::Path;

/// Reports how much of a filesystem is still free
pub trait DiskUsage: Send + Sync + 'static {
    /// Free space of the filesystem holding `path`, as a whole percentage 0-100
    fn free_percentage(&self, path: &Path) -> Result<u8>;
}

/// Measures the real filesystem through `statvfs`
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiskUsage;

impl DiskUsage for FsDiskUsage {
    fn free_percentage(&self, path: &Path) -> Result<u8> {
        let available = fs2::available_space(path).map_err(|e| {
            TrackerError::MeasurementError(format!(
                "could not read available space for {}: {}",
                path.display(),
                e
            ))
        })?;
        let total = fs2::total_space(path).map_err(|e| {
            TrackerError::MeasurementError(format!(
                "could not read total space for {}: {}",
                path.display(),
                e
            ))
        })?;
        free_percentage_of(available, total).ok_or_else(|| {
            TrackerError::MeasurementError(format!(
                "filesystem for {} reports zero total space",
                path.display()
            ))
        })
    }
}

/// `available / total` as a whole percentage, rounded down
pub fn free_percentage_of(available: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (available.min(total) as u128 * 100) / total as u128;
    Some(pct as u8)
}
