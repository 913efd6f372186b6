//! Pcap Blockfile Module
//!
//! Reference `Blockfile` over a classic pcap packet artifact. Opening scans
//! the packet file once with `pcap_parser` and keeps only an index of record
//! offsets keyed by their 8-byte big-endian capture timestamp; packet data is
//! read back from disk on the blocking pool whenever a query needs it. The
//! index artifact must exist (its presence is what marks a blockfile as
//! complete) but its contents belong to the external indexer.
//!
//! Also provides the pcap writer used to stream packets out of the debug
//! routes.

use crate::blockfile::{Blockfile, BlockfileOpener, Positions};
use crate::packet::{packet_channel, Packet, PacketSender, PacketStream, DEFAULT_PACKET_BUFFER};
use crate::query::{MatchAll, Query};
use crate::{Result, TrackerError};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Buffer size for the pcap_parser reader (64KB)
const READER_BUFFER_SIZE: usize = 65536;

/// Packets read ahead of the consumer during a lookup
const SCAN_BUFFER: usize = 16;

const PCAP_MAGIC_MICROS: u32 = 0xa1b2c3d4;
const PCAP_HEADER_LEN: usize = 24;
const PCAP_RECORD_HEADER_LEN: usize = 16;
const LINKTYPE_ETHERNET: u32 = 1;
const DEFAULT_SNAPLEN: u32 = 65535;

/// Latest capture time a pcap record header can carry
const MAX_PCAP_TIMESTAMP_US: i64 = u32::MAX as i64 * 1_000_000 + 999_999;

/// Index of an open file
#[derive(Debug)]
struct PcapIndex {
    offsets: BTreeMap<[u8; 8], Vec<u64>>,
    packet_count: usize,
}

/// A blockfile whose packet artifact is a classic pcap file
#[derive(Debug)]
pub struct PcapBlockfile {
    name: String,
    packet_path: PathBuf,
    index: Mutex<Option<Arc<PcapIndex>>>,
}

impl PcapBlockfile {
    /// Open a packet/index pair. Fails if either artifact is missing or the
    /// packet artifact is not a readable pcap file.
    pub fn open(name: &str, packet_path: &Path, index_path: &Path) -> Result<Self> {
        std::fs::metadata(index_path).map_err(|e| {
            TrackerError::IoError(format!(
                "index artifact {} unavailable: {}",
                index_path.display(),
                e
            ))
        })?;

        let mut offsets: BTreeMap<[u8; 8], Vec<u64>> = BTreeMap::new();
        let mut packet_count = 0;
        scan_pcap(packet_path, |record| {
            offsets
                .entry(record.timestamp_us.to_be_bytes())
                .or_default()
                .push(record.offset);
            packet_count += 1;
            true
        })?;

        debug!(
            "Opened pcap blockfile {} ({} packets)",
            packet_path.display(),
            packet_count
        );

        Ok(Self {
            name: name.to_string(),
            packet_path: packet_path.to_path_buf(),
            index: Mutex::new(Some(Arc::new(PcapIndex {
                offsets,
                packet_count,
            }))),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.index
            .lock()
            .map(|index| index.is_none())
            .unwrap_or(true)
    }

    /// Number of packet records found at open time
    pub fn packet_count(&self) -> Result<usize> {
        Ok(self.index()?.packet_count)
    }

    fn index(&self) -> Result<Arc<PcapIndex>> {
        let guard = self
            .index
            .lock()
            .map_err(|e| TrackerError::SystemError(format!("blockfile lock poisoned: {}", e)))?;
        guard.clone().ok_or_else(|| {
            TrackerError::QueryError(format!("blockfile {} is closed", self.name))
        })
    }

    /// Read the packet artifact and send every packet matching `query` to
    /// `tx`. Runs on a blocking thread; stops when `cancel` fires, the
    /// consumer goes away or the file is closed.
    fn scan_matching(&self, query: &dyn Query, cancel: &CancellationToken, tx: &PacketSender) {
        let match_all = query.matches_all();
        let scanned = scan_pcap(&self.packet_path, |record| {
            if cancel.is_cancelled() || tx.is_closed() || self.is_closed() {
                return false;
            }
            let packet = record.to_packet();
            if !match_all && !query.matches(&packet) {
                return true;
            }
            tx.blocking_send(packet)
        });
        if let Err(e) = scanned {
            tx.blocking_send_error(e);
        }
    }
}

impl Blockfile for PcapBlockfile {
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
            if let Err(e) = self.index() {
                out.send_error(e).await;
                return;
            }

            let (tx, mut scanned) = packet_channel(SCAN_BUFFER);
            let reader = {
                let file = self.clone();
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    file.scan_matching(query.as_ref(), &cancel, &tx)
                })
            };

            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = scanned.recv() => item,
                };
                let sent = match item {
                    None => break,
                    Some(Ok(packet)) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = out.send(packet) => sent,
                    },
                    Some(Err(e)) => out.send_error(e).await,
                };
                if !sent {
                    break;
                }
            }

            // Unblocks the reader, then waits so the file is never read
            // after this lookup has returned.
            drop(scanned);
            if let Err(e) = reader.await {
                error!("Reader task for {} failed: {}", self.name, e);
            }
            debug!("Lookup on {} finished", self.name);
        }
        .boxed()
    }

    fn positions(&self, query: &dyn Query) -> Result<Positions> {
        self.index()?;
        if query.matches_all() {
            return Ok(Positions::All);
        }

        let mut offsets = Vec::new();
        let mut overflow = None;
        scan_pcap(&self.packet_path, |record| {
            let packet = record.to_packet();
            if !query.matches(&packet) {
                return true;
            }
            match u32::try_from(packet.offset) {
                Ok(offset) => {
                    offsets.push(offset);
                    true
                }
                Err(_) => {
                    overflow = Some(packet.offset);
                    false
                }
            }
        })?;
        if let Some(offset) = overflow {
            return Err(TrackerError::QueryError(format!(
                "offset {} in {} does not fit in 32 bits",
                offset, self.name
            )));
        }
        Ok(Positions::Offsets(offsets))
    }

    fn dump_index(
        &self,
        out: &mut dyn Write,
        start: Option<&[u8]>,
        finish: Option<&[u8]>,
    ) -> Result<()> {
        let index = self.index()?;
        for (key, offsets) in &index.offsets {
            let key = key.as_slice();
            if start.is_some_and(|s| key < s) {
                continue;
            }
            if finish.is_some_and(|f| key > f) {
                break;
            }
            for offset in offsets {
                writeln!(out, "{}\t{}", hex::encode(key), offset)?;
            }
        }
        Ok(())
    }

    fn all_packets(self: Arc<Self>) -> PacketStream {
        let (tx, rx) = packet_channel(DEFAULT_PACKET_BUFFER);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = self.index() {
                tx.blocking_send_error(e);
                return;
            }
            self.scan_matching(&MatchAll, &CancellationToken::new(), &tx);
        });
        rx
    }

    fn close(&self) {
        match self.index.lock() {
            Ok(mut index) => {
                index.take();
                debug!("Closed blockfile {}", self.packet_path.display());
            }
            Err(e) => {
                error!("Could not close blockfile {}: {}", self.name, e);
            }
        }
    }
}

/// Opens `PcapBlockfile`s
#[derive(Debug, Clone, Copy, Default)]
pub struct PcapBlockfileOpener;

impl BlockfileOpener for PcapBlockfileOpener {
    fn open(
        &self,
        name: &str,
        packet_path: &Path,
        index_path: &Path,
    ) -> Result<Arc<dyn Blockfile>> {
        Ok(Arc::new(PcapBlockfile::open(name, packet_path, index_path)?))
    }
}

/// One record of a pcap file, borrowed from the reader's buffer
struct PcapRecord<'a> {
    timestamp_us: i64,
    captured_length: u32,
    original_length: u32,
    offset: u64,
    data: &'a [u8],
}

impl PcapRecord<'_> {
    fn to_packet(&self) -> Packet {
        Packet {
            timestamp_us: self.timestamp_us,
            captured_length: self.captured_length,
            original_length: self.original_length,
            offset: self.offset,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// Visit the records of a legacy pcap file in file order until `visit`
/// returns false
fn scan_pcap(path: &Path, mut visit: impl FnMut(&PcapRecord<'_>) -> bool) -> Result<()> {
    let file = File::open(path).map_err(|e| {
        TrackerError::IoError(format!("could not open {}: {}", path.display(), e))
    })?;
    let mut reader = LegacyPcapReader::new(READER_BUFFER_SIZE, BufReader::new(file)).map_err(
        |e| TrackerError::IoError(format!("{} is not a pcap file: {}", path.display(), e)),
    )?;

    let mut position: u64 = 0;
    loop {
        match reader.next() {
            Ok((consumed, block)) => {
                let keep_going = match block {
                    PcapBlockOwned::Legacy(record) => visit(&PcapRecord {
                        timestamp_us: (record.ts_sec as i64) * 1_000_000 + (record.ts_usec as i64),
                        captured_length: record.caplen,
                        original_length: record.origlen,
                        offset: position,
                        data: record.data,
                    }),
                    _ => true,
                };
                position += consumed as u64;
                reader.consume(consumed);
                if !keep_going {
                    return Ok(());
                }
            }
            Err(PcapError::Eof) => return Ok(()),
            Err(PcapError::Incomplete(_)) => {
                reader.refill().map_err(|e| {
                    TrackerError::IoError(format!("pcap refill error in {}: {}", path.display(), e))
                })?;
            }
            Err(e) => {
                return Err(TrackerError::IoError(format!(
                    "pcap parse error in {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

/// Classic pcap global header (microsecond timestamps, Ethernet)
pub fn pcap_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(PCAP_HEADER_LEN);
    buf.put_u32_le(PCAP_MAGIC_MICROS);
    buf.put_u16_le(2);
    buf.put_u16_le(4);
    buf.put_i32_le(0);
    buf.put_u32_le(0);
    buf.put_u32_le(DEFAULT_SNAPLEN);
    buf.put_u32_le(LINKTYPE_ETHERNET);
    buf.freeze()
}

/// One pcap record: 16-byte record header followed by the packet data
pub fn pcap_record(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(PCAP_RECORD_HEADER_LEN + packet.data.len());
    // Times outside what the header can hold are pinned to its range.
    let timestamp_us = packet.timestamp_us.clamp(0, MAX_PCAP_TIMESTAMP_US);
    buf.put_u32_le((timestamp_us / 1_000_000) as u32);
    buf.put_u32_le((timestamp_us % 1_000_000) as u32);
    buf.put_u32_le(packet.data.len() as u32);
    buf.put_u32_le(packet.original_length.max(packet.data.len() as u32));
    buf.put_slice(&packet.data);
    buf.freeze()
}

/// Write a complete pcap file to `out`
pub fn write_pcap<'a>(
    out: &mut dyn Write,
    packets: impl IntoIterator<Item = &'a Packet>,
) -> Result<()> {
    out.write_all(&pcap_header())?;
    for packet in packets {
        out.write_all(&pcap_record(packet))?;
    }
    Ok(())
}
