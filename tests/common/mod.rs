//! Shared fixtures for tracker integration tests: an in-memory blockfile that
//! counts any use after close, openers that can be told to fail, and disk
//! models whose free space follows the files actually on disk.

#![allow(dead_code)]

use bytes::Bytes;
use capture_tracker::blockfile::{Blockfile, BlockfileOpener, Positions};
use capture_tracker::config::ThreadConfig;
use capture_tracker::disk::DiskUsage;
use capture_tracker::packet::{packet_channel, Packet, PacketSender, PacketStream};
use capture_tracker::query::Query;
use capture_tracker::tracker::{CaptureThread, TrackerOptions};
use capture_tracker::{Result, TrackerError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Packets of a fake blockfile: timestamps `base*1000 + i`, offsets `i`
pub fn fake_packets(name: &str, count: usize) -> Vec<Packet> {
    let base: i64 = name.parse().unwrap_or(0);
    (0..count)
        .map(|i| {
            Packet::new(
                base * 1000 + i as i64,
                i as u64,
                Bytes::from(format!("{}:{}", name, i)),
            )
        })
        .collect()
}

pub struct FakeBlockfile {
    name: String,
    packets: Vec<Packet>,
    closed: AtomicBool,
    step_delay: Duration,
    violations: Arc<AtomicUsize>,
}

impl FakeBlockfile {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            self.violations.fetch_add(1, Ordering::SeqCst);
            return Err(TrackerError::QueryError(format!("{} used after close", self.name)));
        }
        Ok(())
    }
}

impl Blockfile for FakeBlockfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(
        self: Arc<Self>,
        query: Arc<dyn Query>,
        cancel: CancellationToken,
        out: PacketSender,
    ) -> BoxFuture<'static, ()> {
        async move {
            for packet in &self.packets {
                if cancel.is_cancelled() || out.is_closed() {
                    return;
                }
                if !self.step_delay.is_zero() {
                    tokio::time::sleep(self.step_delay).await;
                }
                if let Err(e) = self.check_open() {
                    out.send_error(e).await;
                    return;
                }
                if !query.matches(packet) {
                    continue;
                }
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = out.send(packet.clone()) => sent,
                };
                if !sent {
                    return;
                }
            }
        }
        .boxed()
    }

    fn positions(&self, query: &dyn Query) -> Result<Positions> {
        self.check_open()?;
        if query.matches_all() {
            return Ok(Positions::All);
        }
        Ok(Positions::Offsets(
            self.packets
                .iter()
                .filter(|p| query.matches(p))
                .map(|p| p.offset as u32)
                .collect(),
        ))
    }

    fn dump_index(
        &self,
        out: &mut dyn std::io::Write,
        _start: Option<&[u8]>,
        _finish: Option<&[u8]>,
    ) -> Result<()> {
        self.check_open()?;
        writeln!(out, "{}", self.name)?;
        Ok(())
    }

    fn all_packets(self: Arc<Self>) -> PacketStream {
        let (tx, rx) = packet_channel(8);
        tokio::spawn(async move {
            for packet in &self.packets {
                if !tx.send(packet.clone()).await {
                    return;
                }
            }
        });
        rx
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Closing twice is a misuse too.
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Opens `FakeBlockfile`s and remembers every handle it handed out
pub struct FakeOpener {
    packets_per_file: usize,
    packet_counts: Mutex<HashMap<String, usize>>,
    step_delays: Mutex<HashMap<String, Duration>>,
    open_delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    opened: Mutex<HashMap<String, Arc<FakeBlockfile>>>,
    pub violations: Arc<AtomicUsize>,
}

impl FakeOpener {
    pub fn new(packets_per_file: usize) -> Self {
        Self {
            packets_per_file,
            packet_counts: Mutex::new(HashMap::new()),
            step_delays: Mutex::new(HashMap::new()),
            open_delays: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            opened: Mutex::new(HashMap::new()),
            violations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Give `name` its own packet count
    pub fn packets(&self, name: &str, count: usize) {
        self.packet_counts
            .lock()
            .unwrap()
            .insert(name.to_string(), count);
    }

    /// Make lookups over `name` sleep before each packet
    pub fn slow(&self, name: &str, delay: Duration) {
        self.step_delays
            .lock()
            .unwrap()
            .insert(name.to_string(), delay);
    }

    /// Make opening `name` block the calling thread, like a slow disk
    pub fn blocking_open(&self, name: &str, delay: Duration) {
        self.open_delays
            .lock()
            .unwrap()
            .insert(name.to_string(), delay);
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn handle(&self, name: &str) -> Option<Arc<FakeBlockfile>> {
        self.opened.lock().unwrap().get(name).cloned()
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

impl BlockfileOpener for FakeOpener {
    fn open(
        &self,
        name: &str,
        packet_path: &Path,
        index_path: &Path,
    ) -> Result<Arc<dyn Blockfile>> {
        let open_delay = self.open_delays.lock().unwrap().get(name).copied();
        if let Some(delay) = open_delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().unwrap().contains(name) {
            return Err(TrackerError::IoError(format!("{} is corrupt", name)));
        }
        assert!(index_path.exists(), "opened {:?} without its index", index_path);
        assert!(packet_path.exists(), "opened {:?} without its packets", packet_path);

        let file = Arc::new(FakeBlockfile {
            name: name.to_string(),
            packets: fake_packets(
                name,
                self.packet_counts
                    .lock()
                    .unwrap()
                    .get(name)
                    .copied()
                    .unwrap_or(self.packets_per_file),
            ),
            closed: AtomicBool::new(false),
            step_delay: self
                .step_delays
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .unwrap_or_default(),
            violations: self.violations.clone(),
        });
        self.opened
            .lock()
            .unwrap()
            .insert(name.to_string(), file.clone());
        Ok(file)
    }
}

/// Free space shrinks by `pct_per_file` for every packet file present
pub struct FilesDisk {
    pub pct_per_file: u8,
    pub measurements: AtomicUsize,
}

impl FilesDisk {
    pub fn new(pct_per_file: u8) -> Self {
        Self {
            pct_per_file,
            measurements: AtomicUsize::new(0),
        }
    }

    pub fn free_for(pct_per_file: u8, files: usize) -> u8 {
        100u32.saturating_sub(files as u32 * pct_per_file as u32) as u8
    }
}

impl DiskUsage for FilesDisk {
    fn free_percentage(&self, path: &Path) -> Result<u8> {
        self.measurements.fetch_add(1, Ordering::SeqCst);
        let files = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .count();
        Ok(Self::free_for(self.pct_per_file, files))
    }
}

/// Replays scripted readings, then repeats `fallback`
pub struct ScriptedDisk {
    readings: Mutex<VecDeque<Result<u8>>>,
    fallback: Result<u8>,
}

impl ScriptedDisk {
    pub fn new(readings: Vec<Result<u8>>, fallback: Result<u8>) -> Self {
        Self {
            readings: Mutex::new(readings.into()),
            fallback,
        }
    }

    pub fn always(pct: u8) -> Self {
        Self::new(Vec::new(), Ok(pct))
    }
}

impl DiskUsage for ScriptedDisk {
    fn free_percentage(&self, _path: &Path) -> Result<u8> {
        self.readings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A tracker over fresh temporary directories
pub struct Fixture {
    pub root: TempDir,
    pub conf: ThreadConfig,
    pub opener: Arc<FakeOpener>,
    pub thread: Arc<CaptureThread>,
}

pub fn test_options() -> TrackerOptions {
    TrackerOptions {
        eviction_pause: Duration::from_millis(1),
        ..TrackerOptions::default()
    }
}

impl Fixture {
    pub fn new(threshold: u8, opener: FakeOpener, disk: Arc<dyn DiskUsage>) -> Self {
        Self::with_options(threshold, opener, disk, test_options())
    }

    pub fn with_options(
        threshold: u8,
        opener: FakeOpener,
        disk: Arc<dyn DiskUsage>,
        options: TrackerOptions,
    ) -> Self {
        let root = TempDir::new().unwrap();
        let conf = ThreadConfig {
            packets_directory: root.path().join("disk/packets"),
            index_directory: root.path().join("disk/index"),
            disk_free_percentage: threshold,
        };
        let opener = Arc::new(opener);
        let thread = Arc::new(
            CaptureThread::new(0, conf.clone(), root.path(), options, opener.clone(), disk)
                .unwrap(),
        );
        Self {
            root,
            conf,
            opener,
            thread,
        }
    }

    pub fn packet_artifact(&self, name: &str) -> PathBuf {
        self.conf.packets_directory.join(name)
    }

    pub fn index_artifact(&self, name: &str) -> PathBuf {
        self.conf.index_directory.join(name)
    }

    /// Write both artifacts of a finished blockfile
    pub fn write_blockfile(&self, name: &str) {
        std::fs::write(self.packet_artifact(name), name.as_bytes()).unwrap();
        std::fs::write(self.index_artifact(name), name.as_bytes()).unwrap();
    }
}
