//! TCP session state machine
//!
//! A session owns the two endpoint trackers of one connection and drives
//! the connection state. States are named from the client's point of view.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::core::seq::seq_geq;
use crate::core::{Direction, TcpPacket};
use crate::error::{Infractions, Result, StreamError};
use crate::sink::FlushSink;
use super::tracker::StreamTracker;

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    /// No packets seen
    #[default]
    None,
    /// Client SYN seen
    SynSent,
    /// Server SYN-ACK seen
    SynRcvd,
    /// Handshake completed or picked up midstream
    Established,
    /// Client sent FIN
    FinWait1,
    /// Client FIN acknowledged, waiting for the server FIN
    FinWait2,
    /// Server sent FIN first
    CloseWait,
    /// Both sides sent FIN, client FIN not yet acknowledged
    Closing,
    /// Client sent FIN after the server's
    LastAck,
    /// Both FINs done
    TimeWait,
    /// Closed or reset
    Closed,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::None => "NONE",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// Endpoint role; memory is accounted per role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

/// Explicit congestion notification negotiation (RFC 3168)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EcnState {
    /// Client SYN carried ECE and CWR
    pub client_offered: bool,
    /// Server SYN-ACK carried ECE
    pub server_accepted: bool,
}

impl EcnState {
    pub fn negotiated(&self) -> bool {
        self.client_offered && self.server_accepted
    }
}

/// Result of processing one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub direction: Direction,
    /// Connection state after the packet
    pub state: TcpState,
    /// Infractions raised by this packet
    pub infractions: Infractions,
    /// Buffers delivered to the sink
    pub flushed: usize,
}

/// A tracked TCP connection
#[derive(Debug)]
pub struct Session {
    id: u64,
    config: Arc<StreamConfig>,
    state: TcpState,
    /// Reassembles to-client data
    client: StreamTracker,
    /// Reassembles to-server data
    server: StreamTracker,
    pub ingress_index: i32,
    pub egress_index: i32,
    pub address_space_id: u16,
    ecn: EcnState,
    /// Handshake observed
    tcp_init: bool,
    /// Session set up, by handshake or midstream pickup
    lws_init: bool,
    midstream: bool,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    packets: u64,
    /// Packets refused before setup
    rejected: u64,
    infractions: Infractions,
}

impl Session {
    /// Create a session for the flow `first` belongs to
    pub fn new(id: u64, config: Arc<StreamConfig>, first: &TcpPacket<'_>) -> Self {
        Self {
            id,
            client: StreamTracker::new(Direction::ToClient, &config),
            server: StreamTracker::new(Direction::ToServer, &config),
            config,
            state: TcpState::None,
            ingress_index: first.ingress_index,
            egress_index: first.egress_index,
            address_space_id: 0,
            ecn: EcnState::default(),
            tcp_init: false,
            lws_init: false,
            midstream: false,
            first_seen: first.captured_at,
            last_seen: first.captured_at,
            packets: 0,
            rejected: 0,
            infractions: Infractions::empty(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn client(&self) -> &StreamTracker {
        &self.client
    }

    pub fn server(&self) -> &StreamTracker {
        &self.server
    }

    /// Tracker reassembling data flowing in `direction`
    pub fn tracker(&self, direction: Direction) -> &StreamTracker {
        match direction {
            Direction::ToServer => &self.server,
            Direction::ToClient => &self.client,
        }
    }

    pub fn tracker_mut(&mut self, direction: Direction) -> &mut StreamTracker {
        match direction {
            Direction::ToServer => &mut self.server,
            Direction::ToClient => &mut self.client,
        }
    }

    /// (sender, receiver) trackers for a packet flowing in `direction`
    fn endpoints(&mut self, direction: Direction) -> (&mut StreamTracker, &mut StreamTracker) {
        match direction {
            Direction::ToServer => (&mut self.client, &mut self.server),
            Direction::ToClient => (&mut self.server, &mut self.client),
        }
    }

    pub fn ecn(&self) -> EcnState {
        self.ecn
    }

    pub fn handshake_seen(&self) -> bool {
        self.tcp_init
    }

    pub fn is_initialized(&self) -> bool {
        self.lws_init
    }

    pub fn is_midstream(&self) -> bool {
        self.midstream
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn rejected_packets(&self) -> u64 {
        self.rejected
    }

    /// Every infraction recorded over the session's life
    pub fn infractions(&self) -> Infractions {
        self.infractions
    }

    /// Bytes queued by the tracker of a role
    pub fn queued_bytes(&self, role: Role) -> usize {
        match role {
            Role::Client => self.client.queued_bytes(),
            Role::Server => self.server.queued_bytes(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, TcpState::Closed | TcpState::TimeWait)
    }

    /// Idle longer than the configured session timeout
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let timeout = i64::try_from(self.config.session_timeout).unwrap_or(i64::MAX);
        now - self.last_seen > Duration::seconds(timeout)
    }

    fn infraction(&mut self, err: StreamError) -> StreamError {
        self.infractions |= err.infraction();
        err
    }

    /// Process one packet of this connection
    pub fn process(&mut self, packet: &TcpPacket<'_>, sink: &mut dyn FlushSink) -> Result<Processed> {
        let direction = packet.direction;
        let flags = packet.flags;

        self.packets += 1;
        if packet.captured_at > self.last_seen {
            self.last_seen = packet.captured_at;
        }

        if flags.is_invalid() {
            debug!("Session {} invalid flags {} on {}", self.id, flags, direction);
            return Err(self.infraction(StreamError::ProtocolViolation("invalid flag combination")));
        }
        if !flags.syn && !flags.rst && !flags.ack {
            debug!("Session {} segment without ACK on {}", self.id, direction);
            return Err(self.infraction(StreamError::ProtocolViolation("segment without ACK")));
        }

        if flags.is_syn() && self.is_terminated() {
            debug!("Session {} reopened by new SYN", self.id);
            self.reset();
        }

        if self.state == TcpState::Closed {
            if packet.payload.is_empty() {
                return Ok(self.processed(direction, Infractions::empty(), 0));
            }
            if self.client.sub_state.rst_sent || self.server.sub_state.rst_sent {
                self.infractions |= Infractions::DATA_AFTER_RESET;
            }
            debug!("Session {} data on closed connection", self.id);
            return Err(self.infraction(StreamError::ProtocolViolation("data on closed session")));
        }

        let mut infractions = Infractions::empty();
        if self.state == TcpState::None && !flags.syn {
            if !self.config.midstream_allowed(self.first_seen, packet.captured_at) {
                self.rejected += 1;
                trace!("Session {} midstream pickup refused", self.id);
                return Err(self.infraction(StreamError::HandshakeRequired));
            }
            if self.config.require_3whs() && !packet.payload.is_empty() {
                debug!("Session {} payload before handshake", self.id);
                infractions |= Infractions::PROTOCOL_VIOLATION;
            }
            self.pick_up_midstream();
        }

        if flags.rst {
            return self.process_reset(packet, sink, infractions);
        }

        let id = self.id;
        let accepted = match self.tracker_mut(direction).accept(packet, id, sink) {
            Ok(accepted) => accepted,
            Err(e) => {
                if e.is_fatal() {
                    warn!("Session {} force reset: {}", id, e);
                    self.reset();
                }
                return Err(self.infraction(e));
            }
        };
        infractions |= accepted.infractions;
        let mut flushed = accepted.flushed;

        let (talker, listener) = self.endpoints(direction);
        talker.sent(packet);
        if flags.syn {
            listener.peer_syn(packet.wscale.is_some());
        }
        if flags.ack {
            listener.ack_received(packet.ack);
        }

        self.record_ecn(packet);
        self.transition(packet);

        if self.is_terminated() {
            flushed += self.flush_all_final(sink, &mut infractions);
        } else if self.tracker(direction).fin_complete() {
            let (n, gaps) = self.tracker_mut(direction).flush_final(id, sink);
            flushed += n;
            infractions |= gaps;
        }

        self.infractions |= infractions;
        Ok(self.processed(direction, infractions, flushed))
    }

    fn processed(&self, direction: Direction, infractions: Infractions, flushed: usize) -> Processed {
        Processed {
            direction,
            state: self.state,
            infractions,
            flushed,
        }
    }

    fn process_reset(
        &mut self,
        packet: &TcpPacket<'_>,
        sink: &mut dyn FlushSink,
        mut infractions: Infractions,
    ) -> Result<Processed> {
        let direction = packet.direction;
        if let Err(e) = self.tracker(direction).check_rst(packet) {
            debug!("Session {} ignoring reset: {}", self.id, e);
            return Err(self.infraction(e));
        }

        self.endpoints(direction).0.sent(packet);
        debug!("Session {} reset by {} in {}", self.id, direction, self.state);
        self.state = TcpState::Closed;

        let flushed = self.flush_all_final(sink, &mut infractions);
        self.infractions |= infractions;
        Ok(self.processed(direction, infractions, flushed))
    }

    fn pick_up_midstream(&mut self) {
        debug!("Session {} picked up midstream", self.id);
        self.midstream = true;
        self.set_established();
    }

    fn set_established(&mut self) {
        self.state = TcpState::Established;
        self.lws_init = true;
        self.client.sub_state.setup_ok = true;
        self.server.sub_state.setup_ok = true;
    }

    fn record_ecn(&mut self, packet: &TcpPacket<'_>) {
        let flags = packet.flags;
        if flags.is_syn() && flags.ece && flags.cwr {
            self.ecn.client_offered = true;
        } else if flags.is_syn_ack() && flags.ece {
            self.ecn.server_accepted = true;
        }
    }

    /// Advance the connection state; tolerates one-sided captures
    fn transition(&mut self, packet: &TcpPacket<'_>) {
        let flags = packet.flags;
        let from_client = packet.direction == Direction::ToServer;
        let acks_client_fin = !from_client
            && flags.ack
            && self.client.sub_state.fin_sent
            && seq_geq(packet.ack, self.client.l_nxt_seq);

        let next = match self.state {
            TcpState::None if flags.is_syn() => TcpState::SynSent,
            TcpState::None if flags.is_syn_ack() => TcpState::SynRcvd,
            TcpState::SynSent if flags.is_syn_ack() && !from_client => TcpState::SynRcvd,
            TcpState::SynSent if from_client && flags.ack && !flags.syn => TcpState::Established,
            TcpState::SynRcvd if flags.ack && !flags.syn => TcpState::Established,
            TcpState::Established if flags.fin && from_client => TcpState::FinWait1,
            TcpState::Established if flags.fin => TcpState::CloseWait,
            TcpState::FinWait1 if !from_client && flags.fin && acks_client_fin => TcpState::TimeWait,
            TcpState::FinWait1 if !from_client && flags.fin => TcpState::Closing,
            TcpState::FinWait1 if acks_client_fin => TcpState::FinWait2,
            TcpState::FinWait2 if !from_client && flags.fin => TcpState::TimeWait,
            TcpState::CloseWait if from_client && flags.fin => TcpState::LastAck,
            TcpState::LastAck if acks_client_fin => TcpState::Closed,
            TcpState::Closing if acks_client_fin => TcpState::TimeWait,
            _ => return,
        };

        trace!("Session {} {} -> {}", self.id, self.state, next);
        if next == TcpState::Established {
            self.tcp_init = !self.midstream;
            self.set_established();
        } else {
            self.state = next;
        }
    }

    fn flush_all_final(&mut self, sink: &mut dyn FlushSink, infractions: &mut Infractions) -> usize {
        let id = self.id;
        let mut flushed = 0;
        for tracker in [&mut self.server, &mut self.client] {
            let (n, gaps) = tracker.flush_final(id, sink);
            flushed += n;
            *infractions |= gaps;
        }
        flushed
    }

    /// Release both trackers' queued data and alert histories, keeping the
    /// connection state. Returns the bytes released.
    pub fn clear(&mut self) -> usize {
        self.client.clear() + self.server.clear()
    }

    /// Release everything and return to the initial state
    pub fn reset(&mut self) -> usize {
        let released = self.clear();
        self.state = TcpState::None;
        self.ecn = EcnState::default();
        self.tcp_init = false;
        self.lws_init = false;
        self.midstream = false;
        released
    }

    /// Terminal teardown: deliver what is queued, release all of it and
    /// close. Returns the buffers delivered.
    pub fn cleanup(&mut self, sink: &mut dyn FlushSink) -> usize {
        let mut infractions = Infractions::empty();
        let flushed = self.flush_all_final(sink, &mut infractions);
        self.infractions |= infractions;
        self.clear();
        self.state = TcpState::Closed;
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TcpFlags;
    use crate::paf::DelimiterSplitter;
    use crate::reassembly::segment::fail_allocations;
    use crate::sink::{FlushReason, FlushedBuffer};
    use crate::stream::tracker::WindowScale;

    const SYN: u8 = 0x02;
    const SYN_ACK: u8 = 0x12;
    const ACK: u8 = 0x10;
    const PSH_ACK: u8 = 0x18;
    const FIN_ACK: u8 = 0x11;
    const RST: u8 = 0x04;

    fn pkt<'a>(direction: Direction, seq: u32, ack: u32, flags: u8, payload: &'a [u8]) -> TcpPacket<'a> {
        TcpPacket::new(direction, seq, ack, TcpFlags::from_u8(flags), payload, Utc::now())
    }

    fn session_with(config: StreamConfig, first: &TcpPacket<'_>) -> Session {
        Session::new(1, Arc::new(config), first)
    }

    /// Client ISN 100, server ISN 500
    fn handshake(sink: &mut Vec<FlushedBuffer>) -> Session {
        let syn = pkt(Direction::ToServer, 100, 0, SYN, b"");
        let mut s = session_with(StreamConfig::default(), &syn);
        assert_eq!(s.process(&syn, sink).unwrap().state, TcpState::SynSent);
        let syn_ack = pkt(Direction::ToClient, 500, 101, SYN_ACK, b"");
        assert_eq!(s.process(&syn_ack, sink).unwrap().state, TcpState::SynRcvd);
        let ack = pkt(Direction::ToServer, 101, 501, ACK, b"");
        assert_eq!(s.process(&ack, sink).unwrap().state, TcpState::Established);
        s
    }

    #[test]
    fn test_three_way_handshake() {
        let mut sink = Vec::new();
        let s = handshake(&mut sink);
        assert!(s.handshake_seen());
        assert!(s.is_initialized());
        assert!(!s.is_midstream());
        assert!(s.client().sub_state.setup_ok);
        assert_eq!(s.server().store().base_seq(), Some(101));
        assert_eq!(s.client().store().base_seq(), Some(501));
        assert_eq!(s.client().isn, Some(100));
        assert_eq!(s.server().isn, Some(500));
    }

    #[test]
    fn test_graceful_close_flushes_both_directions() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);

        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"GET /"), &mut sink).unwrap();
        s.process(&pkt(Direction::ToClient, 501, 106, PSH_ACK, b"200 OK"), &mut sink).unwrap();
        assert!(sink.is_empty());

        let p = s.process(&pkt(Direction::ToServer, 106, 507, FIN_ACK, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::FinWait1);
        assert_eq!(p.flushed, 1);
        assert_eq!(sink[0].data, b"GET /");
        assert_eq!(sink[0].reason, FlushReason::Final);

        let p = s.process(&pkt(Direction::ToClient, 507, 107, ACK, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::FinWait2);

        let p = s.process(&pkt(Direction::ToClient, 507, 107, FIN_ACK, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::TimeWait);
        assert_eq!(sink[1].data, b"200 OK");
        assert_eq!(sink[1].direction, Direction::ToClient);
        assert!(s.is_terminated());
    }

    #[test]
    fn test_server_closes_first() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);

        assert_eq!(
            s.process(&pkt(Direction::ToClient, 501, 101, FIN_ACK, b""), &mut sink).unwrap().state,
            TcpState::CloseWait
        );
        assert_eq!(
            s.process(&pkt(Direction::ToServer, 101, 502, FIN_ACK, b""), &mut sink).unwrap().state,
            TcpState::LastAck
        );
        assert_eq!(
            s.process(&pkt(Direction::ToClient, 502, 102, ACK, b""), &mut sink).unwrap().state,
            TcpState::Closed
        );
    }

    #[test]
    fn test_simultaneous_close() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);

        s.process(&pkt(Direction::ToServer, 101, 501, FIN_ACK, b""), &mut sink).unwrap();
        // Server FIN crosses the client's and does not ack it
        let p = s.process(&pkt(Direction::ToClient, 501, 101, FIN_ACK, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::Closing);
        let p = s.process(&pkt(Direction::ToClient, 502, 102, ACK, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::TimeWait);
    }

    #[test]
    fn test_midstream_pickup_without_handshake_timeout() {
        let mut sink = Vec::new();
        let first = pkt(Direction::ToServer, 7000, 9000, PSH_ACK, b"hello\n");
        let mut config = StreamConfig::default();
        config.paf.data_block_size = 4;
        config.paf.final_block_size = 8;
        let mut s = session_with(config, &first);

        let p = s.process(&first, &mut sink).unwrap();
        assert_eq!(p.state, TcpState::Established);
        assert!(p.infractions.is_empty());
        assert!(s.is_midstream());
        assert!(!s.handshake_seen());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].data, b"hello\n");
        assert_eq!(sink[0].seq, 7000);
    }

    #[test]
    fn test_strict_midstream_window() {
        let mut sink = Vec::new();
        let first = pkt(Direction::ToServer, 7000, 9000, PSH_ACK, b"data");
        let config = StreamConfig {
            hs_timeout: 5,
            ..StreamConfig::default()
        };
        let mut s = session_with(config.clone(), &first);

        let p = s.process(&first, &mut sink).unwrap();
        assert_eq!(p.state, TcpState::Established);
        assert!(p.infractions.contains(Infractions::PROTOCOL_VIOLATION));

        let mut late = pkt(Direction::ToServer, 7000, 9000, PSH_ACK, b"data");
        let mut s = session_with(config, &late);
        late.captured_at += Duration::seconds(10);
        assert_eq!(s.process(&late, &mut sink).unwrap_err(), StreamError::HandshakeRequired);
        assert_eq!(s.state(), TcpState::None);
        assert_eq!(s.rejected_packets(), 1);
        assert!(s.infractions().contains(Infractions::HANDSHAKE_REQUIRED));
    }

    #[test]
    fn test_invalid_flags_are_violations() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);

        let syn_rst = pkt(Direction::ToServer, 101, 0, SYN | RST, b"");
        assert!(matches!(s.process(&syn_rst, &mut sink), Err(StreamError::ProtocolViolation(_))));
        let no_ack = pkt(Direction::ToServer, 101, 0, 0x08, b"x");
        assert!(matches!(s.process(&no_ack, &mut sink), Err(StreamError::ProtocolViolation(_))));

        assert_eq!(s.state(), TcpState::Established);
        assert!(s.infractions().contains(Infractions::PROTOCOL_VIOLATION));
    }

    #[test]
    fn test_reset_flushes_and_closes() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"abc"), &mut sink).unwrap();

        let p = s.process(&pkt(Direction::ToClient, 501, 0, RST, b""), &mut sink).unwrap();
        assert_eq!(p.state, TcpState::Closed);
        assert_eq!(sink.len(), 1);
        assert_eq!(s.queued_bytes(Role::Server), 0);

        let late = pkt(Direction::ToServer, 104, 501, PSH_ACK, b"more");
        assert!(matches!(s.process(&late, &mut sink), Err(StreamError::ProtocolViolation(_))));
        assert!(s.infractions().contains(Infractions::DATA_AFTER_RESET));
    }

    #[test]
    fn test_out_of_window_reset_ignored() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);

        // The client advertised a 65535 window from 501
        let rst = pkt(Direction::ToClient, 501 + 70_000, 0, RST, b"");
        assert!(matches!(s.process(&rst, &mut sink), Err(StreamError::OutOfWindow { .. })));
        assert_eq!(s.state(), TcpState::Established);
    }

    #[test]
    fn test_new_syn_reopens_closed_session() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.process(&pkt(Direction::ToClient, 501, 0, RST, b""), &mut sink).unwrap();

        let syn = pkt(Direction::ToServer, 9000, 0, SYN, b"");
        assert_eq!(s.process(&syn, &mut sink).unwrap().state, TcpState::SynSent);
        assert_eq!(s.server().store().base_seq(), Some(9001));
    }

    #[test]
    fn test_ecn_negotiation() {
        let mut sink = Vec::new();
        let syn = pkt(Direction::ToServer, 100, 0, SYN | 0x40 | 0x80, b"");
        let mut s = session_with(StreamConfig::default(), &syn);
        s.process(&syn, &mut sink).unwrap();
        s.process(&pkt(Direction::ToClient, 500, 101, SYN_ACK | 0x40, b""), &mut sink).unwrap();
        assert!(s.ecn().negotiated());
    }

    #[test]
    fn test_asymmetric_capture_client_side_only() {
        let mut sink = Vec::new();
        let syn = pkt(Direction::ToServer, 100, 0, SYN, b"");
        let mut s = session_with(StreamConfig::default(), &syn);
        s.process(&syn, &mut sink).unwrap();

        // SYN-ACK never seen
        let ack = pkt(Direction::ToServer, 101, 501, PSH_ACK, b"hi");
        assert_eq!(s.process(&ack, &mut sink).unwrap().state, TcpState::Established);
        assert_eq!(s.server().r_nxt_ack, 103);
    }

    #[test]
    fn test_fin_flushes_when_complete() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.server.set_splitter(Some(Box::new(DelimiterSplitter::lines())));

        s.process(&pkt(Direction::ToServer, 104, 501, FIN_ACK, b"def"), &mut sink).unwrap();
        assert!(sink.is_empty());
        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"abc"), &mut sink).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].data, b"abcdef");
    }

    #[test]
    fn test_reset_and_clear_idempotent() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"abc"), &mut sink).unwrap();

        assert_eq!(s.clear(), 3);
        assert_eq!(s.clear(), 0);
        assert_eq!(s.state(), TcpState::Established);

        assert_eq!(s.reset(), 0);
        assert_eq!(s.reset(), 0);
        assert_eq!(s.state(), TcpState::None);
    }

    #[test]
    fn test_cleanup_is_terminal() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"abc"), &mut sink).unwrap();
        s.process(&pkt(Direction::ToClient, 501, 104, PSH_ACK, b"xyz"), &mut sink).unwrap();

        assert_eq!(s.cleanup(&mut sink), 2);
        assert_eq!(s.state(), TcpState::Closed);
        assert_eq!(s.queued_bytes(Role::Client), 0);
        assert_eq!(s.queued_bytes(Role::Server), 0);
        assert_eq!(s.cleanup(&mut sink), 0);
    }

    #[test]
    fn test_allocation_failure_forces_reset() {
        let mut sink = Vec::new();
        let mut s = handshake(&mut sink);
        s.process(&pkt(Direction::ToServer, 101, 501, PSH_ACK, b"abc"), &mut sink).unwrap();
        s.process(&pkt(Direction::ToClient, 501, 104, PSH_ACK, b"xyz"), &mut sink).unwrap();

        fail_allocations(true);
        let err = s.process(&pkt(Direction::ToServer, 104, 504, PSH_ACK, b"def"), &mut sink).unwrap_err();
        fail_allocations(false);

        assert_eq!(err, StreamError::AllocationFailure(3));
        assert_eq!(s.state(), TcpState::None);
        assert!(s.infractions().contains(Infractions::ALLOCATION_FAILURE));
        assert_eq!(s.queued_bytes(Role::Client), 0);
        assert_eq!(s.queued_bytes(Role::Server), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_midstream_window_scale_unknown() {
        let mut sink = Vec::new();
        // Server acks 1000 with raw window 502; its shift was never seen
        let first = pkt(Direction::ToClient, 9000, 1000, ACK, b"").with_window(502);
        let mut s = session_with(StreamConfig::default(), &first);
        s.process(&first, &mut sink).unwrap();

        let payload = [b'x'; 1400];
        for i in 0..5u32 {
            let p = s.process(&pkt(Direction::ToServer, 1000 + i * 1400, 9000, PSH_ACK, &payload), &mut sink);
            assert!(p.is_ok());
        }
        assert_eq!(s.queued_bytes(Role::Server), 7000);
        assert_eq!(s.server().stats().out_of_window, 0);
    }

    #[test]
    fn test_window_scale_ignored_when_one_sided() {
        let mut sink = Vec::new();
        let syn = pkt(Direction::ToServer, 100, 0, SYN, b"").with_options(Some(7), None);
        let mut s = session_with(StreamConfig::default(), &syn);
        s.process(&syn, &mut sink).unwrap();
        s.process(&pkt(Direction::ToClient, 500, 101, SYN_ACK, b""), &mut sink).unwrap();
        s.process(&pkt(Direction::ToServer, 101, 501, ACK, b"").with_window(1000), &mut sink).unwrap();

        assert_eq!(s.client().window_scale(), WindowScale::Off);
        assert_eq!(s.server().window_scale(), WindowScale::Off);
        // Client advertised 1000 unscaled from 501
        let beyond = pkt(Direction::ToClient, 1501, 101, PSH_ACK, b"x");
        assert!(matches!(s.process(&beyond, &mut sink), Err(StreamError::OutOfWindow { .. })));
        s.process(&pkt(Direction::ToClient, 1500, 101, PSH_ACK, b"x"), &mut sink).unwrap();
    }

    #[test]
    fn test_expiry() {
        let first = pkt(Direction::ToServer, 1, 1, ACK, b"");
        let s = session_with(StreamConfig::default(), &first);
        assert!(!s.is_expired(first.captured_at + Duration::seconds(30)));
        assert!(s.is_expired(first.captured_at + Duration::seconds(31)));
    }
}
