//! Delivery of reassembled data
//!
//! Flushed buffers leave the core through a [`FlushSink`]. Sinks must not
//! block: the worker that owns the session is the one calling `deliver`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::Direction;
pub use crate::paf::FlushReason;

/// Contiguous reassembled data handed to inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedBuffer {
    pub session_id: u64,
    pub direction: Direction,
    /// Per-direction count of buffers delivered before this one
    pub trans_seq: u64,
    /// Sequence number of the first byte
    pub seq: u32,
    pub data: Vec<u8>,
    pub reason: FlushReason,
}

impl FlushedBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Consumer of flushed buffers
pub trait FlushSink {
    fn deliver(&mut self, buffer: FlushedBuffer);
}

/// Collects buffers in memory
impl FlushSink for Vec<FlushedBuffer> {
    fn deliver(&mut self, buffer: FlushedBuffer) {
        self.push(buffer);
    }
}

/// Forwards buffers to an async consumer over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FlushedBuffer>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<FlushedBuffer>) -> Self {
        Self { tx, dropped: 0 }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlushedBuffer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Buffers lost because the receiver was gone
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl FlushSink for ChannelSink {
    fn deliver(&mut self, buffer: FlushedBuffer) {
        if self.tx.send(buffer).is_err() {
            self.dropped += 1;
            debug!("Flush channel closed, dropped {} buffers", self.dropped);
        }
    }
}
