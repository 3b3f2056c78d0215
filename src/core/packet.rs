//! Decoded TCP packet view
//!
//! The capture/decode collaborator hands the reassembly core a `TcpPacket`
//! with the header fields already parsed. Nothing here touches raw frames.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }

    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    /// Flag combinations no conforming stack emits
    pub fn is_invalid(&self) -> bool {
        (self.syn && self.rst) || (self.syn && self.fin)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if self.ece { s.push('E'); }
        if self.cwr { s.push('C'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Direction of data flow relative to the connection initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From client to server (initiator -> responder)
    ToServer,
    /// From server to client (responder -> initiator)
    ToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToServer => write!(f, "to_server"),
            Direction::ToClient => write!(f, "to_client"),
        }
    }
}

/// RFC 7323 timestamp option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpTimestamp {
    pub tsval: u32,
    pub tsecr: u32,
}

/// Decoded TCP segment as supplied by the packet decoder
#[derive(Debug, Clone)]
pub struct TcpPacket<'a> {
    /// Direction relative to the session initiator
    pub direction: Direction,
    pub seq: u32,
    pub ack: u32,
    /// Raw (unscaled) window field
    pub window: u16,
    pub flags: TcpFlags,
    /// Timestamp option, if present
    pub timestamp: Option<TcpTimestamp>,
    /// Window scale option (SYN / SYN-ACK only)
    pub wscale: Option<u8>,
    /// Maximum segment size option (SYN / SYN-ACK only)
    pub mss: Option<u16>,
    /// TCP payload
    pub payload: &'a [u8],
    /// Captured frame length
    pub caplen: u32,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Inbound interface index
    pub ingress_index: i32,
    /// Outbound interface index
    pub egress_index: i32,
}

impl<'a> TcpPacket<'a> {
    /// Create a packet with no options and no interface metadata
    pub fn new(
        direction: Direction,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &'a [u8],
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            direction,
            seq,
            ack,
            window: u16::MAX,
            flags,
            timestamp: None,
            wscale: None,
            mss: None,
            payload,
            caplen: 54 + payload.len() as u32,
            captured_at,
            ingress_index: -1,
            egress_index: -1,
        }
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn with_timestamp(mut self, tsval: u32, tsecr: u32) -> Self {
        self.timestamp = Some(TcpTimestamp { tsval, tsecr });
        self
    }

    pub fn with_options(mut self, wscale: Option<u8>, mss: Option<u16>) -> Self {
        self.wscale = wscale;
        self.mss = mss;
        self
    }

    pub fn with_interfaces(mut self, ingress: i32, egress: i32) -> Self {
        self.ingress_index = ingress;
        self.egress_index = egress;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Sequence space consumed by this segment (SYN and FIN count as one)
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.syn { len = len.wrapping_add(1); }
        if self.flags.fin { len = len.wrapping_add(1); }
        len
    }

    /// Sequence number of the first payload byte
    pub fn data_seq(&self) -> u32 {
        if self.flags.syn {
            self.seq.wrapping_add(1)
        } else {
            self.seq
        }
    }
}
