//! Packet Module
//!
//! Packets and the bounded channel pair used to move them from a blockfile
//! producer to a consumer. A `PacketStream` is the consumer side of one
//! producer; dropping it makes every further send on the paired
//! `PacketSender` fail immediately, so producers never block on an
//! abandoned consumer.

use crate::{Result, TrackerError};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Default capacity of a single producer's packet channel
pub const DEFAULT_PACKET_BUFFER: usize = 100;

/// A captured packet as read back from a blockfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Capture time in microseconds since the Unix epoch
    pub timestamp_us: i64,
    /// Number of bytes stored for the packet
    pub captured_length: u32,
    /// Length of the packet on the wire
    pub original_length: u32,
    /// Byte offset of the packet record within its packet artifact
    pub offset: u64,
    pub data: Bytes,
}

impl Packet {
    pub fn new(timestamp_us: i64, offset: u64, data: Bytes) -> Self {
        let len = data.len() as u32;
        Self {
            timestamp_us,
            captured_length: len,
            original_length: len,
            offset,
            data,
        }
    }
}

/// Create a bounded producer/consumer pair
pub fn packet_channel(capacity: usize) -> (PacketSender, PacketStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PacketSender { tx }, PacketStream { rx })
}

/// Producer side of a packet channel
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Result<Packet>>,
}

impl PacketSender {
    /// Send a packet, waiting for buffer space.
    ///
    /// Returns false once the consumer is gone; callers should stop producing.
    pub async fn send(&self, packet: Packet) -> bool {
        self.tx.send(Ok(packet)).await.is_ok()
    }

    /// Report a per-file failure to the consumer
    pub async fn send_error(&self, err: TrackerError) -> bool {
        self.tx.send(Err(err)).await.is_ok()
    }

    /// `send` for producers running on a blocking thread. Must not be
    /// called from async code.
    pub fn blocking_send(&self, packet: Packet) -> bool {
        self.tx.blocking_send(Ok(packet)).is_ok()
    }

    /// `send_error` for producers running on a blocking thread
    pub fn blocking_send_error(&self, err: TrackerError) -> bool {
        self.tx.blocking_send(Err(err)).is_ok()
    }

    /// True once the consumer has dropped its stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer side of a packet channel
#[derive(Debug)]
pub struct PacketStream {
    rx: mpsc::Receiver<Result<Packet>>,
}

impl PacketStream {
    /// Receive the next item, or None once the producer has finished
    pub async fn recv(&mut self) -> Option<Result<Packet>> {
        self.rx.recv().await
    }

    /// Stop accepting packets; buffered items can still be received
    pub fn close(&mut self) {
        self.rx.close()
    }

    /// Drain the stream into a vector, stopping at the first error
    pub async fn collect_packets(mut self) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        while let Some(item) = self.rx.recv().await {
            packets.push(item?);
        }
        Ok(packets)
    }
}

impl Stream for PacketStream {
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
