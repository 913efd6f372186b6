//! Blockfile Module
//!
//! The contract the tracker consumes from the single-blockfile storage engine.
//! A blockfile owns exactly one packet artifact and one index artifact. It is
//! open and queryable (any number of concurrent queries) until `close()`, after
//! which it must not be used again.

use crate::packet::{PacketSender, PacketStream};
use crate::query::Query;
use crate::Result;
use futures::future::BoxFuture;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of a position lookup against one blockfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Positions {
    /// Every packet in the file matches
    All,
    /// Byte offsets of matching packets, ascending
    Offsets(Vec<u32>),
}

/// One open packet+index file pair
pub trait Blockfile: Send + Sync + 'static {
    /// Base name shared by both artifacts
    fn name(&self) -> &str;

    /// Write matching packets to `out` in file order.
    ///
    /// The returned future finishes when the file is exhausted, `cancel` fires,
    /// or the consumer of `out` goes away. Failures are reported through
    /// `out` rather than returned.
    fn lookup(
        self: Arc<Self>,
        query: Arc<dyn Query>,
        cancel: CancellationToken,
        out: PacketSender,
    ) -> BoxFuture<'static, ()>;

    /// Offsets of packets matching `query`
    fn positions(&self, query: &dyn Query) -> Result<Positions>;

    /// Write the index entries whose keys fall within `[start, finish]`
    fn dump_index(
        &self,
        out: &mut dyn Write,
        start: Option<&[u8]>,
        finish: Option<&[u8]>,
    ) -> Result<()>;

    /// Every packet in the file, in file order
    fn all_packets(self: Arc<Self>) -> PacketStream;

    /// Release the underlying files. Only called once, after which the
    /// handle is unreachable from the tracker.
    fn close(&self);
}

/// Opens blockfiles discovered on disk
pub trait BlockfileOpener: Send + Sync + 'static {
    fn open(&self, name: &str, packet_path: &Path, index_path: &Path)
        -> Result<Arc<dyn Blockfile>>;
}
