//! crmonban-stream: TCP session tracking and stream reassembly
//!
//! Turns captured TCP segments into ordered, deduplicated byte streams for
//! inspection. Overlaps are resolved the way the target host's stack would
//! resolve them, and reassembled data is cut into buffers at application
//! message boundaries where a splitter can find them.
//!
//! - `core`: packet view and sequence arithmetic
//! - `reassembly`: segment store and overlap policies
//! - `paf`: protocol-aware flush decisions
//! - `stream`: trackers, sessions and the per-worker session table
//! - `sink`: delivery of flushed buffers
//!
//! Sessions are owned by a single worker; nothing in this crate locks.

pub mod config;
pub mod core;
pub mod error;
pub mod paf;
pub mod reassembly;
pub mod sink;
pub mod stream;

pub use config::{MemcapConfig, PafConfig, StreamConfig};
pub use error::{Infractions, Result, StreamError};
pub use paf::{CompressionState, FlushDecision, FlushPolicy, FlushReason, PafState};
pub use reassembly::{ReassemblyPolicy, SegmentStore};
pub use sink::{ChannelSink, FlushSink, FlushedBuffer};
pub use stream::{Session, SessionKey, SessionTable, StreamTracker, TcpState};
