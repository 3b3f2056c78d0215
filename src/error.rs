//! Errors and infraction masks
//!
//! Everything except `AllocationFailure` is recoverable: the packet may be
//! dropped from reassembly but the session keeps tracking the flow.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Anomalies recorded against a session, surfaced to detection/logging
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Infractions: u32 {
        const STALE_TIMESTAMP    = 1 << 0;
        const OUT_OF_WINDOW      = 1 << 1;
        const PROTOCOL_VIOLATION = 1 << 2;
        const CAPACITY_EXCEEDED  = 1 << 3;
        const HANDSHAKE_REQUIRED = 1 << 4;
        const ALLOCATION_FAILURE = 1 << 5;
        const OVERLAP            = 1 << 6;
        const EXCESSIVE_OVERLAP  = 1 << 7;
        const SMALL_SEGMENTS     = 1 << 8;
        const DATA_AFTER_RESET   = 1 << 9;
        const DATA_ON_SYN        = 1 << 10;
        const GAP_SKIPPED        = 1 << 11;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stale timestamp: tsval {tsval} older than last accepted {last}")]
    StaleTimestamp { tsval: u32, last: u32 },

    #[error("segment seq {seq} len {len} outside window [{left}, {right})")]
    OutOfWindow { seq: u32, len: u32, left: u32, right: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("queue capacity exceeded: {queued_bytes} bytes / {queued_segs} segments queued")]
    CapacityExceeded { queued_bytes: usize, queued_segs: usize },

    #[error("three-way handshake required, midstream pickup refused")]
    HandshakeRequired,

    #[error("allocation of {0} bytes failed")]
    AllocationFailure(usize),

    #[error("config error: {0}")]
    Config(String),
}

impl StreamError {
    /// Errors that force a session reset
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::AllocationFailure(_))
    }

    /// Infraction bit recorded for this error
    pub fn infraction(&self) -> Infractions {
        match self {
            StreamError::StaleTimestamp { .. } => Infractions::STALE_TIMESTAMP,
            StreamError::OutOfWindow { .. } => Infractions::OUT_OF_WINDOW,
            StreamError::ProtocolViolation(_) => Infractions::PROTOCOL_VIOLATION,
            StreamError::CapacityExceeded { .. } => Infractions::CAPACITY_EXCEEDED,
            StreamError::HandshakeRequired => Infractions::HANDSHAKE_REQUIRED,
            StreamError::AllocationFailure(_) => Infractions::ALLOCATION_FAILURE,
            StreamError::Config(_) => Infractions::empty(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
