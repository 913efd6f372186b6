//! Merged Packet Stream Module
//!
//! Concatenates an ordered sequence of producer streams into a single
//! consumer-facing stream. Producers are admitted through a bounded channel so
//! several of them can run ahead and buffer while the merge is still draining
//! an earlier one; emission always follows admission order.
//!
//! The merge stops early when its cancellation token fires or when the
//! consumer drops the output. In both cases the in-flight producer stream and
//! every queued one are dropped, so their producers see closed channels rather
//! than blocking forever. `Done` resolves after that release has happened.

use crate::packet::{packet_channel, Packet, PacketSender, PacketStream};
use crate::Result;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal signal of a merge: resolves once every producer has been released
#[derive(Debug, Clone)]
pub struct Done {
    rx: watch::Receiver<bool>,
}

impl Done {
    /// Wait until the merge task has finished
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender also means the merge task is gone.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Non-blocking check
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Output of `concat_packet_streams`
#[derive(Debug)]
pub struct MergedPacketStream {
    out: PacketStream,
    done: Done,
}

impl MergedPacketStream {
    /// Handle that resolves when all resources of the merge are released
    pub fn done(&self) -> Done {
        self.done.clone()
    }

    /// Receive the next merged item
    pub async fn recv(&mut self) -> Option<Result<Packet>> {
        self.out.recv().await
    }

    /// Drain the merged stream, stopping at the first error
    pub async fn collect_packets(self) -> Result<Vec<Packet>> {
        self.out.collect_packets().await
    }
}

impl Stream for MergedPacketStream {
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.out).poll_next(cx)
    }
}

/// Concatenate the streams received on `inputs`, in the order received.
///
/// The returned stream ends once `inputs` is closed and every received stream
/// has been drained, or as soon as `cancel` fires.
pub fn concat_packet_streams(
    cancel: CancellationToken,
    mut inputs: mpsc::Receiver<PacketStream>,
    capacity: usize,
) -> MergedPacketStream {
    let (out_tx, out) = packet_channel(capacity);
    let (done_tx, done_rx) = watch::channel(false);

    tokio::spawn(async move {
        let forwarded = forward_in_order(&cancel, &mut inputs, &out_tx).await;

        inputs.close();
        let mut abandoned = 0usize;
        while let Ok(stream) = inputs.try_recv() {
            drop(stream);
            abandoned += 1;
        }
        drop(out_tx);

        debug!(
            "Merge finished: forwarded={}, abandoned_producers={}, cancelled={}",
            forwarded,
            abandoned,
            cancel.is_cancelled()
        );
        let _ = done_tx.send(true);
    });

    MergedPacketStream {
        out,
        done: Done { rx: done_rx },
    }
}

/// Returns the number of items forwarded
async fn forward_in_order(
    cancel: &CancellationToken,
    inputs: &mut mpsc::Receiver<PacketStream>,
    out: &PacketSender,
) -> usize {
    let mut forwarded = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return forwarded,
            _ = out.closed() => return forwarded,
            next = inputs.recv() => next,
        };
        let Some(mut stream) = next else {
            return forwarded;
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return forwarded,
                _ = out.closed() => return forwarded,
                item = stream.recv() => item,
            };
            let Some(item) = item else {
                break;
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return forwarded,
                sent = forward_item(out, item) => sent,
            };
            if !sent {
                return forwarded;
            }
            forwarded += 1;
        }
    }
}

async fn forward_item(out: &PacketSender, item: Result<Packet>) -> bool {
    match item {
        Ok(packet) => out.send(packet).await,
        Err(err) => out.send_error(err).await,
    }
}
