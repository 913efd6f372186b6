//! Capture Thread Tracker Module
//!
//! A `CaptureThread` watches the directories of a single capture worker. It
//! discovers blockfiles as the writer finishes them, answers queries by
//! fanning them out over every tracked blockfile, and deletes the oldest
//! blockfiles while the packet filesystem is short on free space.
//!
//! All three share one reader/writer lock over the tracked file set:
//!
//! - `sync_files` (discovery followed by eviction) holds the write guard for
//!   its whole duration.
//! - `lookup` takes an owned read guard and keeps it until the merged stream
//!   it returned is done and every per-file query has returned. A blockfile
//!   is therefore only ever closed when no query can still reach it.
//!
//! Blockfile names sort in creation order, so name order is used both for
//! oldest-first eviction and for chronological merging.

use crate::blockfile::{Blockfile, BlockfileOpener};
use crate::config::ThreadConfig;
use crate::disk::DiskUsage;
use crate::layout::{list_blockfile_names, ThreadLayout};
use crate::merge::{concat_packet_streams, MergedPacketStream};
use crate::packet::{packet_channel, DEFAULT_PACKET_BUFFER};
use crate::query::Query;
use crate::{Result, TrackerError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of per-file queries admitted ahead of the merge
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 10;

/// Default pause between an eviction and the next free-space measurement
pub const DEFAULT_EVICTION_PAUSE: Duration = Duration::from_millis(100);

/// Runtime knobs shared by every capture thread
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Pause after each deletion so free-space accounting can catch up
    pub eviction_pause: Duration,
    /// Capacity of the per-lookup admission queue
    pub lookup_concurrency: usize,
    /// Capacity of each per-file packet channel and of the merged output
    pub packet_buffer: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            eviction_pause: DEFAULT_EVICTION_PAUSE,
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
            packet_buffer: DEFAULT_PACKET_BUFFER,
        }
    }
}

/// State guarded by the tracker lock
struct TrackerState {
    files: HashMap<String, Arc<dyn Blockfile>>,
    file_last_seen: SystemTime,
}

/// Outcome of one `sync_files` cycle
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Names that started being tracked, in name order
    pub discovered: Vec<String>,
    /// Candidates that could not be opened
    pub discovery_errors: Vec<(String, TrackerError)>,
    /// Failure to list the index directory at all
    pub scan_error: Option<TrackerError>,
    /// Names deleted by eviction, in deletion order
    pub evicted: Vec<String>,
    /// Why eviction stopped early, if it did
    pub eviction_error: Option<TrackerError>,
    /// Last free-space measurement taken
    pub free_percentage: Option<u8>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.discovery_errors.is_empty()
            && self.scan_error.is_none()
            && self.eviction_error.is_none()
    }
}

/// A tracked blockfile together with a read lease on the tracker.
///
/// Eviction cannot proceed while any lease is alive.
pub struct FileLease {
    file: Arc<dyn Blockfile>,
    _lease: OwnedRwLockReadGuard<TrackerState>,
}

impl FileLease {
    pub fn file(&self) -> &Arc<dyn Blockfile> {
        &self.file
    }
}

/// Watches the blockfiles of a single capture worker
pub struct CaptureThread {
    id: usize,
    conf: ThreadConfig,
    layout: ThreadLayout,
    options: TrackerOptions,
    opener: Arc<dyn BlockfileOpener>,
    disk: Arc<dyn DiskUsage>,
    state: Arc<RwLock<TrackerState>>,
}

impl std::fmt::Debug for CaptureThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureThread")
            .field("id", &self.id)
            .field("packet_path", &self.layout.packet_path)
            .field("index_path", &self.layout.index_path)
            .finish()
    }
}

/// Create one tracker per thread configuration, ids assigned by position
pub fn threads(
    configs: &[ThreadConfig],
    base_dir: &Path,
    options: &TrackerOptions,
    opener: Arc<dyn BlockfileOpener>,
    disk: Arc<dyn DiskUsage>,
) -> Result<Vec<Arc<CaptureThread>>> {
    configs
        .iter()
        .enumerate()
        .map(|(id, conf)| {
            CaptureThread::new(
                id,
                conf.clone(),
                base_dir,
                options.clone(),
                opener.clone(),
                disk.clone(),
            )
            .map(Arc::new)
        })
        .collect()
}

impl CaptureThread {
    /// Create a tracker and link its logical directories under `base_dir`
    pub fn new(
        id: usize,
        conf: ThreadConfig,
        base_dir: &Path,
        options: TrackerOptions,
        opener: Arc<dyn BlockfileOpener>,
        disk: Arc<dyn DiskUsage>,
    ) -> Result<Self> {
        let layout = ThreadLayout::for_thread(base_dir, id);
        layout.create_links(id, &conf)?;

        Ok(Self {
            id,
            conf,
            layout,
            options,
            opener,
            disk,
            state: Arc::new(RwLock::new(TrackerState {
                files: HashMap::new(),
                file_last_seen: SystemTime::now(),
            })),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.conf
    }

    pub fn packet_path(&self) -> &Path {
        &self.layout.packet_path
    }

    pub fn index_path(&self) -> &Path {
        &self.layout.index_path
    }

    fn packet_file_path(&self, name: &str) -> PathBuf {
        self.layout.packet_file(name)
    }

    fn index_file_path(&self, name: &str) -> PathBuf {
        self.layout.index_file(name)
    }

    /// Check the disk for new blockfiles, then delete old ones while free
    /// space is at or below the configured threshold
    pub async fn sync_files(&self) -> SyncReport {
        let mut state = self.state.write().await;
        let mut report = SyncReport::default();
        self.sync_files_with_disk(&mut state, &mut report).await;
        self.clean_up_on_low_disk_space(&mut state, &mut report).await;
        report
    }

    /// When the last new blockfile was found
    pub async fn file_last_seen(&self) -> SystemTime {
        self.state.read().await.file_last_seen
    }

    /// Tracked blockfile names in creation order
    pub async fn tracked_files(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of tracked blockfiles and when the last one was found
    pub async fn status(&self) -> (usize, SystemTime) {
        let state = self.state.read().await;
        (state.files.len(), state.file_last_seen)
    }

    /// Lease a single tracked blockfile
    pub async fn file_lease(&self, name: &str) -> Option<FileLease> {
        let lease = self.state.clone().read_owned().await;
        let file = lease.files.get(name)?.clone();
        Some(FileLease {
            file,
            _lease: lease,
        })
    }

    /// Look up packets matching `query` across every tracked blockfile.
    ///
    /// Returns as soon as the fan-out is set up. The packets of an older file
    /// are always emitted before those of a newer one. The read lease taken
    /// here is held until the returned stream is done, which happens when it
    /// is drained, dropped, or `cancel` fires.
    pub async fn lookup(
        &self,
        query: Arc<dyn Query>,
        cancel: CancellationToken,
    ) -> MergedPacketStream {
        let lease = self.state.clone().read_owned().await;
        let files = sorted_files(&lease);

        let (inputs_tx, inputs_rx) = mpsc::channel(self.options.lookup_concurrency.max(1));
        let merged = concat_packet_streams(cancel.clone(), inputs_rx, self.options.packet_buffer);
        let done = merged.done();

        let id = self.id;
        let packet_buffer = self.options.packet_buffer;
        debug!("Thread {} lookup over {} blockfiles: {:?}", id, files.len(), query);

        tokio::spawn(async move {
            let mut per_file = JoinSet::new();
            for (name, file) in files {
                let (tx, stream) = packet_channel(packet_buffer);
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Thread {} lookup cancelled before {}", id, name);
                        break;
                    }
                    permit = inputs_tx.reserve() => permit,
                };
                let Ok(permit) = permit else {
                    // Merge already finished; nobody will read further files.
                    break;
                };
                permit.send(stream);
                per_file.spawn(file.lookup(query.clone(), cancel.clone(), tx));
            }
            drop(inputs_tx);

            done.wait().await;
            while let Some(joined) = per_file.join_next().await {
                if let Err(e) = joined {
                    error!("Thread {} per-file lookup task failed: {}", id, e);
                }
            }
            drop(lease);
            debug!("Thread {} lookup done, read lease released", id);
        });

        merged
    }

    // Requires the write guard.
    async fn sync_files_with_disk(&self, state: &mut TrackerState, report: &mut SyncReport) {
        let index_path = self.layout.index_path.clone();
        let listed = tokio::task::spawn_blocking(move || list_blockfile_names(&index_path))
            .await
            .unwrap_or_else(|e| {
                Err(TrackerError::DiscoveryError(format!("directory listing task failed: {}", e)))
            });
        let names = match listed {
            Ok(names) => names,
            Err(e) => {
                error!(
                    "Thread {} could not read dir {}: {}",
                    self.id,
                    self.layout.index_path.display(),
                    e
                );
                report.scan_error = Some(e);
                return;
            }
        };

        for name in names {
            if state.files.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.track_new_file(state, &name).await {
                warn!("Thread {} error tracking {:?}: {}", self.id, name, e);
                report.discovery_errors.push((name, e));
                continue;
            }
            state.file_last_seen = SystemTime::now();
            report.discovered.push(name);
        }

        if !report.discovered.is_empty() {
            info!(
                "Thread {} found {} new blockfiles",
                self.id,
                report.discovered.len()
            );
        }
    }

    // Requires the write guard.
    async fn track_new_file(&self, state: &mut TrackerState, name: &str) -> Result<()> {
        let packet_path = self.packet_file_path(name);
        let opener = self.opener.clone();
        let opened = {
            let name = name.to_string();
            let packet_path = packet_path.clone();
            let index_path = self.index_file_path(&name);
            tokio::task::spawn_blocking(move || opener.open(&name, &packet_path, &index_path))
                .await
                .unwrap_or_else(|e| {
                    Err(TrackerError::DiscoveryError(format!("open task failed: {}", e)))
                })
        };
        let file = opened.map_err(|e| {
            TrackerError::DiscoveryError(format!(
                "could not open blockfile {}: {}",
                packet_path.display(),
                e
            ))
        })?;
        debug!("Thread {} new blockfile {}", self.id, packet_path.display());
        state.files.insert(name.to_string(), file);
        Ok(())
    }

    // Requires the write guard.
    async fn clean_up_on_low_disk_space(&self, state: &mut TrackerState, report: &mut SyncReport) {
        loop {
            let df = match self.measure_free_percentage().await {
                Ok(df) => df,
                Err(e) => {
                    error!(
                        "Thread {} could not get the free disk percentage for {}: {}",
                        self.id,
                        self.layout.packet_path.display(),
                        e
                    );
                    report.eviction_error = Some(e);
                    return;
                }
            };
            report.free_percentage = Some(df);

            if df > self.conf.disk_free_percentage {
                debug!(
                    "Thread {} disk space is sufficient: {}% > {}%",
                    self.id, df, self.conf.disk_free_percentage
                );
                return;
            }
            info!(
                "Thread {} disk usage is high (packet path={}): {}% free",
                self.id,
                self.layout.packet_path.display(),
                df
            );

            if state.files.is_empty() {
                let e = TrackerError::StuckError(format!(
                    "thread {} is at {}% free with no files left to delete",
                    self.id, df
                ));
                error!("Thread {} could not free up space: {}", self.id, e);
                report.eviction_error = Some(e);
                return;
            }

            match self.delete_oldest_thread_file(state).await {
                Ok(name) => report.evicted.push(name),
                Err(e) => {
                    error!(
                        "Thread {} could not free up space by deleting old files: {}",
                        self.id, e
                    );
                    report.eviction_error = Some(e);
                    return;
                }
            }

            // Free-space figures lag behind deletions; measuring again right
            // away would delete far more than needed.
            tokio::time::sleep(self.options.eviction_pause).await;
        }
    }

    /// Delete the oldest tracked blockfile. The caller has checked that at
    /// least one file is tracked.
    async fn delete_oldest_thread_file(&self, state: &mut TrackerState) -> Result<String> {
        let oldest = state
            .files
            .keys()
            .min()
            .cloned()
            .ok_or_else(|| {
                TrackerError::StuckError(format!("thread {} has no files to delete", self.id))
            })?;
        debug!("Thread {} removing {:?}", self.id, oldest);

        remove_artifact(&self.packet_file_path(&oldest)).await?;
        remove_artifact(&self.index_file_path(&oldest)).await?;
        self.untrack_file(state, &oldest)?;
        Ok(oldest)
    }

    /// Free space of the packet filesystem, measured on the blocking pool
    async fn measure_free_percentage(&self) -> Result<u8> {
        let disk = self.disk.clone();
        let packet_path = self.layout.packet_path.clone();
        tokio::task::spawn_blocking(move || disk.free_percentage(&packet_path))
            .await
            .unwrap_or_else(|e| {
                Err(TrackerError::MeasurementError(format!("measurement task failed: {}", e)))
            })
    }

    // Requires the write guard. Removal from the set and close happen together.
    fn untrack_file(&self, state: &mut TrackerState, name: &str) -> Result<()> {
        debug!("Thread {} untracking {:?}", self.id, name);
        let Some(file) = state.files.remove(name) else {
            let e = TrackerError::UntrackError(format!(
                "trying to untrack file {} for thread {}, but that file is not monitored",
                self.packet_file_path(name).display(),
                self.id
            ));
            error!("{}", e);
            return Err(e);
        };
        debug!("Thread {} old blockfile {}", self.id, file.name());
        file.close();
        Ok(())
    }
}

fn sorted_files(state: &TrackerState) -> Vec<(String, Arc<dyn Blockfile>)> {
    let mut files: Vec<(String, Arc<dyn Blockfile>)> = state
        .files
        .iter()
        .map(|(name, file)| (name.clone(), file.clone()))
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

/// Delete one artifact. One that is already gone counts as deleted, so a
/// half-finished eviction can complete on the next cycle.
async fn remove_artifact(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("Artifact {} was already removed", path.display());
            Ok(())
        }
        Err(e) => Err(TrackerError::EvictionError(format!(
            "could not remove {}: {}",
            path.display(),
            e
        ))),
    }
}
