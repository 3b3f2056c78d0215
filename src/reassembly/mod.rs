//! Segment reassembly
//!
//! Ordered per-direction segment storage with target-based overlap
//! resolution.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use crmonban_stream::reassembly::{ReassemblyPolicy, SegmentStore, StoreLimits};
//!
//! let mut store = SegmentStore::new(ReassemblyPolicy::Linux, StoreLimits::default());
//! store.insert(1000, b"GET / HTTP/1.1\r\n", Utc::now()).unwrap();
//! store.insert(1016, b"\r\n", Utc::now()).unwrap();
//!
//! assert_eq!(store.extract_contiguous(1018), b"GET / HTTP/1.1\r\n\r\n");
//! ```

pub mod policy;
pub mod segment;
pub mod store;

pub use policy::{FullRule, LeftRule, OverlapRules, ReassemblyPolicy, RightRule};
pub use segment::Segment;
pub use store::{InsertOutcome, SegmentStore, StoreLimits, StoreStats};
