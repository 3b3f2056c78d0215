//! TCP session tracking
//!
//! - `tracker`: per-endpoint sequence state, window/PAWS checks, reassembly
//! - `session`: connection state machine driving a pair of trackers
//! - `table`: per-worker session table with LRU pruning and timeouts
//! - `alerts`: bounded alert history per tracker
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use crmonban_stream::config::StreamConfig;
//! use crmonban_stream::core::{Direction, TcpFlags, TcpPacket};
//! use crmonban_stream::sink::FlushedBuffer;
//! use crmonban_stream::stream::{SessionKey, SessionTable, TcpState};
//!
//! let mut table = SessionTable::new(Arc::new(StreamConfig::default()));
//! let key = SessionKey::new("10.0.0.2:40000".parse().unwrap(), "10.0.0.1:80".parse().unwrap());
//! let mut sink: Vec<FlushedBuffer> = Vec::new();
//!
//! let syn = TcpPacket::new(Direction::ToServer, 100, 0, TcpFlags::from_u8(0x02), b"", Utc::now());
//! let processed = table.process(key, &syn, &mut sink).unwrap();
//! assert_eq!(processed.state, TcpState::SynSent);
//! ```

pub mod alerts;
pub mod session;
pub mod table;
pub mod tracker;

pub use alerts::{AlertRecord, AlertRing, MAX_SESSION_ALERTS};
pub use session::{EcnState, Processed, Role, Session, TcpState};
pub use table::{worker_index, SessionKey, SessionTable, TableStats};
pub use tracker::{Accepted, StreamTracker, SubState, TrackerStats};
