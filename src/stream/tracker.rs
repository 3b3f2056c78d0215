//! Per-endpoint stream tracking
//!
//! A session has two trackers, one per endpoint. Each tracker reassembles
//! the data its endpoint *receives*: the server tracker queues to-server
//! data, the client tracker queues to-client data. Fields prefixed `l_`
//! describe what the endpoint itself sends, fields prefixed `r_` describe
//! the peer's data arriving at it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::core::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::core::{Direction, TcpPacket};
use crate::error::{Infractions, Result, StreamError};
use crate::paf::{FlushDecision, FlushPolicy, FlushReason, Splitter};
use crate::reassembly::{InsertOutcome, SegmentStore};
use crate::sink::{FlushSink, FlushedBuffer};
use super::alerts::{AlertRecord, AlertRing};

/// Timestamps older than this no longer take part in PAWS (RFC 7323 5.5)
const PAWS_IDLE_DAYS: i64 = 24;

/// Largest window shift (RFC 7323 2.3)
pub const MAX_WINDOW_SHIFT: u8 = 14;

/// Window scaling applied to an endpoint's advertised windows.
///
/// Scaling is in effect only when both SYNs carried the option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScale {
    /// This endpoint's SYN was not seen
    #[default]
    Unknown,
    /// Offered on this endpoint's SYN; the peer's SYN is still missing
    Offered(u8),
    Negotiated(u8),
    Off,
}

impl WindowScale {
    /// Shift for window advertisements. Unresolved negotiation assumes the
    /// largest shift so a picked-up flow is not cut down to 64 KiB.
    pub fn shift(self) -> u8 {
        match self {
            WindowScale::Negotiated(shift) => shift,
            WindowScale::Off => 0,
            WindowScale::Unknown | WindowScale::Offered(_) => MAX_WINDOW_SHIFT,
        }
    }
}

/// Handshake progress of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubState {
    pub syn_sent: bool,
    pub ack_sent: bool,
    /// Connection setup completed from this endpoint's view
    pub setup_ok: bool,
    pub fin_sent: bool,
    pub rst_sent: bool,
}

/// Tracker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Packets from the peer
    pub packets: u64,
    /// Payload bytes from the peer
    pub bytes: u64,
    pub out_of_window: u64,
    pub stale_timestamps: u64,
    pub overlaps: u64,
    pub capacity_drops: u64,
    pub flushes: u64,
    pub flushed_bytes: u64,
    /// Bytes dropped after the inspection depth ran out
    pub discarded_bytes: u64,
}

/// Result of accepting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Accepted {
    pub infractions: Infractions,
    pub insert: InsertOutcome,
    /// Buffers delivered to the sink
    pub flushed: usize,
}

/// Sequence, window and reassembly state for one endpoint
#[derive(Debug)]
pub struct StreamTracker {
    /// Direction of the data this tracker reassembles
    direction: Direction,
    fudge: u32,
    max_window: u32,
    overlap_limit: u32,

    /// Next sequence number this endpoint will send
    pub l_nxt_seq: u32,
    /// Oldest sequence number sent by this endpoint not yet acked
    pub l_unackd: u32,
    /// Receive window this endpoint advertised, scaled
    pub l_window: u32,
    /// Next sequence number expected from the peer
    pub r_nxt_ack: u32,
    /// Latest acknowledgement this endpoint sent; left edge of the window
    pub r_win_base: u32,
    /// This endpoint's initial sequence number
    pub isn: Option<u32>,
    /// Window scale option on this endpoint's SYN
    pub wscale: Option<u8>,
    pub mss: Option<u16>,
    /// Sequence number of the peer's FIN
    pub fin_seq: Option<u32>,
    pub sub_state: SubState,
    /// This endpoint has sent at least one packet
    sending: bool,
    scale: WindowScale,
    /// Whether the peer's SYN offered window scaling, once seen
    peer_offered_scale: Option<bool>,
    window_known: bool,
    /// Last TSval accepted from the peer and when it arrived
    last_timestamp: Option<(u32, DateTime<Utc>)>,

    store: SegmentStore,
    paf: FlushPolicy,
    alerts: AlertRing,
    extra_data: u32,
    trans_seq: u64,
    stats: TrackerStats,
}

impl StreamTracker {
    /// Tracker reassembling data flowing in `direction`
    pub fn new(direction: Direction, config: &StreamConfig) -> Self {
        Self {
            direction,
            fudge: config.paws_ts_fudge,
            max_window: config.max_window,
            overlap_limit: config.overlap_limit,
            l_nxt_seq: 0,
            l_unackd: 0,
            l_window: 0,
            r_nxt_ack: 0,
            r_win_base: 0,
            isn: None,
            wscale: None,
            mss: None,
            fin_seq: None,
            sub_state: SubState::default(),
            sending: false,
            scale: WindowScale::Unknown,
            peer_offered_scale: None,
            window_known: false,
            last_timestamp: None,
            store: SegmentStore::new(config.reassembly_policy, config.store_limits()),
            paf: FlushPolicy::new(&config.paf, direction),
            alerts: AlertRing::new(),
            extra_data: 0,
            trans_seq: 0,
            stats: TrackerStats::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn flush_policy(&self) -> &FlushPolicy {
        &self.paf
    }

    /// Parsers steer compression state and depth through this
    pub fn flush_policy_mut(&mut self) -> &mut FlushPolicy {
        &mut self.paf
    }

    pub fn set_splitter(&mut self, splitter: Option<Box<dyn Splitter>>) {
        self.paf.set_splitter(splitter);
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn queued_bytes(&self) -> usize {
        self.store.queued_bytes()
    }

    /// Buffers delivered so far; the next buffer's transaction number
    pub fn trans_seq(&self) -> u64 {
        self.trans_seq
    }

    /// Whether every byte up to the peer's FIN has arrived
    pub fn fin_complete(&self) -> bool {
        self.fin_seq.is_some_and(|fin| seq_geq(self.r_nxt_ack, fin))
    }

    /// Bookkeeping for a packet this endpoint sent
    pub fn sent(&mut self, packet: &TcpPacket<'_>) {
        let flags = packet.flags;

        if flags.syn {
            self.isn = Some(packet.seq);
            self.l_unackd = packet.seq;
            self.wscale = packet.wscale;
            self.mss = packet.mss;
            self.scale = match (packet.wscale, self.peer_offered_scale) {
                (None, _) | (Some(_), Some(false)) => WindowScale::Off,
                (Some(shift), Some(true)) => WindowScale::Negotiated(shift.min(MAX_WINDOW_SHIFT)),
                (Some(shift), None) => WindowScale::Offered(shift.min(MAX_WINDOW_SHIFT)),
            };
            self.sub_state.syn_sent = true;
        } else if !self.sending {
            self.l_unackd = packet.seq;
        }

        let end = packet.seq.wrapping_add(packet.seq_len());
        if !self.sending || seq_gt(end, self.l_nxt_seq) {
            self.l_nxt_seq = end;
        }
        self.sending = true;

        // Window scaling never applies to the SYN itself
        let shift = if flags.syn { 0 } else { self.scale.shift() };
        self.l_window = u32::from(packet.window) << shift;

        if flags.ack {
            if !self.window_known || seq_gt(packet.ack, self.r_win_base) {
                self.r_win_base = packet.ack;
            }
            self.window_known = true;
            self.sub_state.ack_sent = true;
        }
        if flags.fin {
            self.sub_state.fin_sent = true;
        }
        if flags.rst {
            self.sub_state.rst_sent = true;
        }
    }

    /// The peer's SYN was seen, with or without the window scale option
    pub fn peer_syn(&mut self, offered_scale: bool) {
        self.peer_offered_scale = Some(offered_scale);
        self.scale = match self.scale {
            WindowScale::Offered(shift) if offered_scale => WindowScale::Negotiated(shift),
            WindowScale::Offered(_) => WindowScale::Off,
            other => other,
        };
    }

    pub fn window_scale(&self) -> WindowScale {
        self.scale
    }

    /// The peer acknowledged data this endpoint sent
    pub fn ack_received(&mut self, ack: u32) {
        if seq_gt(ack, self.l_unackd) {
            self.l_unackd = ack;
        }
    }

    /// PAWS: reject a peer segment whose TSval went backwards
    pub fn check_timestamp(&self, packet: &TcpPacket<'_>) -> Result<()> {
        if packet.flags.rst {
            return Ok(());
        }
        let (Some(ts), Some((last, last_at))) = (packet.timestamp, self.last_timestamp) else {
            return Ok(());
        };
        if packet.captured_at - last_at > Duration::days(PAWS_IDLE_DAYS) {
            return Ok(());
        }

        let delta = i64::from(ts.tsval.wrapping_sub(last) as i32);
        if delta + i64::from(self.fudge) < 0 {
            return Err(StreamError::StaleTimestamp {
                tsval: ts.tsval,
                last,
            });
        }
        Ok(())
    }

    /// [left, right) sequence range this endpoint will accept
    fn window_bounds(&self) -> (u32, u32) {
        let mut window = self.l_window;
        if self.max_window > 0 {
            window = window.min(self.max_window);
        }
        (self.r_win_base, self.r_win_base.wrapping_add(window.max(1)))
    }

    /// Sequence acceptance against the window this endpoint advertised
    pub fn check_window(&self, packet: &TcpPacket<'_>) -> Result<()> {
        if packet.payload.is_empty() || !self.window_known {
            return Ok(());
        }

        let seq = packet.data_seq();
        let len = packet.payload.len() as u32;
        let (left, right) = self.window_bounds();
        let end = seq.wrapping_add(len);

        if seq_leq(end, left) || seq_geq(seq, right) {
            return Err(StreamError::OutOfWindow {
                seq,
                len,
                left,
                right,
            });
        }
        Ok(())
    }

    /// A reset must land inside the window to be believed
    pub fn check_rst(&self, packet: &TcpPacket<'_>) -> Result<()> {
        if !self.window_known {
            return Ok(());
        }
        let (left, right) = self.window_bounds();
        if seq_geq(packet.seq, left) && seq_lt(packet.seq, right) {
            Ok(())
        } else {
            Err(StreamError::OutOfWindow {
                seq: packet.seq,
                len: 0,
                left,
                right,
            })
        }
    }

    /// Accept a packet from the peer: PAWS, window check, insert, flush.
    ///
    /// Recoverable rejections are counted and returned as errors; the
    /// packet's data is then not reassembled.
    pub fn accept(&mut self, packet: &TcpPacket<'_>, session_id: u64, sink: &mut dyn FlushSink) -> Result<Accepted> {
        self.stats.packets += 1;
        self.stats.bytes += packet.payload.len() as u64;

        if let Err(e) = self.check_timestamp(packet) {
            self.stats.stale_timestamps += 1;
            debug!("{} on {}", e, self.direction);
            return Err(e);
        }
        if let Err(e) = self.check_window(packet) {
            self.stats.out_of_window += 1;
            debug!("{} on {}", e, self.direction);
            return Err(e);
        }

        let mut accepted = Accepted::default();
        let data_seq = packet.data_seq();

        if packet.flags.syn && self.store.base_seq().is_none() {
            self.store.set_base(data_seq);
            self.r_nxt_ack = data_seq;
        }
        if packet.flags.syn && !packet.payload.is_empty() {
            accepted.infractions |= Infractions::DATA_ON_SYN;
        }

        if !packet.payload.is_empty() {
            let outcome = match self.store.insert(data_seq, packet.payload, packet.captured_at) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if matches!(e, StreamError::CapacityExceeded { .. }) {
                        self.stats.capacity_drops += 1;
                        warn!(
                            "Dropped {} bytes at seq {} on {}: {}",
                            packet.payload.len(),
                            data_seq,
                            self.direction,
                            e
                        );
                    }
                    return Err(e);
                }
            };

            if outcome.overlapped {
                self.stats.overlaps += 1;
                accepted.infractions |= Infractions::OVERLAP;
                if self.overlap_limit > 0 && self.store.stats().overlap_count > self.overlap_limit {
                    accepted.infractions |= Infractions::EXCESSIVE_OVERLAP;
                }
            }
            if outcome.small_segments_exceeded {
                accepted.infractions |= Infractions::SMALL_SEGMENTS;
            }
            if outcome.rewrote_buffered {
                trace!("Buffered data rewritten on {}, rescanning", self.direction);
                self.paf.rescan();
            }
            accepted.insert = outcome;
        }

        if let Some(base) = self.store.base_seq() {
            self.r_nxt_ack = base.wrapping_add(self.store.contiguous_len() as u32);
        }
        if packet.flags.fin {
            self.fin_seq = Some(data_seq.wrapping_add(packet.payload.len() as u32));
        }
        if let Some(ts) = packet.timestamp {
            let newer = self
                .last_timestamp
                .map_or(true, |(last, _)| seq_geq(ts.tsval, last));
            if newer {
                self.last_timestamp = Some((ts.tsval, packet.captured_at));
            }
        }

        accepted.flushed = self.flush(session_id, sink);
        Ok(accepted)
    }

    /// Deliver whatever the flush policy is ready to release
    pub fn flush(&mut self, session_id: u64, sink: &mut dyn FlushSink) -> usize {
        let mut delivered = 0;

        loop {
            match self.paf.evaluate(&self.store) {
                FlushDecision::Wait => break,
                FlushDecision::Flush { len, reason } => {
                    if self.deliver(len, reason, session_id, sink) == 0 {
                        break;
                    }
                    delivered += 1;
                }
                FlushDecision::Discard(len) => self.discard(len),
            }
        }

        if let Some(base) = self.store.base_seq() {
            self.store.mark_buffered(base.wrapping_add(self.paf.scanned() as u32));
        }
        delivered
    }

    /// Teardown flush: deliver everything queued, passing over holes
    pub fn flush_final(&mut self, session_id: u64, sink: &mut dyn FlushSink) -> (usize, Infractions) {
        let mut infractions = Infractions::empty();
        let mut delivered = self.flush(session_id, sink);

        loop {
            let available = self.store.contiguous_len();
            if available == 0 {
                let gap = self.store.skip_hole();
                if gap == 0 {
                    break;
                }
                debug!("Skipped {} byte hole in final flush on {}", gap, self.direction);
                infractions |= Infractions::GAP_SKIPPED;
                self.paf.rescan();
                continue;
            }

            match self.paf.final_decision(available) {
                FlushDecision::Flush { len, reason } => {
                    if self.deliver(len, reason, session_id, sink) == 0 {
                        break;
                    }
                    delivered += 1;
                }
                FlushDecision::Discard(len) => self.discard(len),
                FlushDecision::Wait => break,
            }
        }

        (delivered, infractions)
    }

    fn deliver(&mut self, len: usize, reason: FlushReason, session_id: u64, sink: &mut dyn FlushSink) -> usize {
        let Some(seq) = self.store.base_seq() else {
            return 0;
        };
        let data = self.store.extract_contiguous(seq.wrapping_add(len as u32));
        let n = data.len();
        if n == 0 {
            return 0;
        }

        self.paf.flushed(n);
        self.stats.flushes += 1;
        self.stats.flushed_bytes += n as u64;
        trace!("Flushing {} bytes at seq {} on {} ({:?})", n, seq, self.direction, reason);

        sink.deliver(FlushedBuffer {
            session_id,
            direction: self.direction,
            trans_seq: self.trans_seq,
            seq,
            data,
            reason,
        });
        self.trans_seq += 1;
        n
    }

    fn discard(&mut self, len: usize) {
        if let Some(base) = self.store.base_seq() {
            let released = self.store.purge_to(base.wrapping_add(len as u32));
            self.paf.discarded(len);
            self.stats.discarded_bytes += released as u64;
        }
    }

    /// Record an alert raised against this stream
    pub fn raise_alert(&mut self, record: AlertRecord) {
        if let Some(evicted) = self.alerts.push(record) {
            trace!("Alert ring full on {}, evicted {}:{}", self.direction, evicted.gid, evicted.sid);
        }
    }

    /// Attach logger identifiers to a previously raised alert
    pub fn update_alert(&mut self, gid: u32, sid: u32, event_id: u32, event_second: u32) -> bool {
        self.alerts.update(gid, sid, event_id, event_second)
    }

    pub fn has_alert(&self, gid: u32, sid: u32) -> bool {
        self.alerts.contains(gid, sid)
    }

    pub fn alerts(&self) -> &AlertRing {
        &self.alerts
    }

    /// Flag extra data as available for logging
    pub fn set_extra_data(&mut self, mask: u32) {
        self.extra_data |= mask;
    }

    /// Pending extra-data flags, clearing them
    pub fn take_extra_data(&mut self) -> u32 {
        std::mem::take(&mut self.extra_data)
    }

    /// Release queued data and alert history. Returns the bytes released.
    pub fn clear(&mut self) -> usize {
        let released = self.store.clear();
        self.alerts.clear();
        self.paf.reset();
        self.extra_data = 0;
        self.l_nxt_seq = 0;
        self.l_unackd = 0;
        self.l_window = 0;
        self.r_nxt_ack = 0;
        self.r_win_base = 0;
        self.isn = None;
        self.fin_seq = None;
        self.sub_state = SubState::default();
        self.sending = false;
        self.scale = WindowScale::Unknown;
        self.peer_offered_scale = None;
        self.window_known = false;
        self.last_timestamp = None;
        released
    }
}
