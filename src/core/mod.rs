//! Core shared types for the reassembly engine
//!
//! - `packet`: decoded TCP packet view supplied by the capture layer
//! - `seq`: wrapping sequence number arithmetic

pub mod packet;
pub mod seq;

pub use packet::{Direction, TcpFlags, TcpPacket, TcpTimestamp};
pub use seq::{seq_diff, seq_geq, seq_gt, seq_leq, seq_lt, seq_max, seq_min};
