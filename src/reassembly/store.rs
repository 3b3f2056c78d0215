//! Per-direction segment store
//!
//! Holds the out-of-order byte ranges received on one direction of a
//! session, ordered by sequence number relative to the store's base (the
//! next byte to be delivered). Overlapping data is resolved at insert time
//! so the retained segments never disagree about a byte.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::error::{Result, StreamError};
use super::policy::{LeftRule, OverlapRules, ReassemblyPolicy, RightRule};
use super::segment::Segment;

/// Queue limits for one store; zero means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreLimits {
    pub max_queued_bytes: usize,
    pub max_queued_segs: usize,
    /// Payloads shorter than this count as small segments
    pub small_seg_size: usize,
    /// Consecutive small segments tolerated before flagging
    pub max_consec_small_segs: u32,
}

/// Store counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Segments queued over the life of the store
    pub total_segs_queued: u64,
    /// Bytes queued over the life of the store
    pub total_bytes_queued: u64,
    /// Bytes currently queued
    pub queued_bytes: usize,
    /// Segments currently queued
    pub queued_segs: usize,
    /// Inserts that overlapped retained data
    pub overlap_count: u32,
    /// Small segments seen
    pub small_seg_count: u32,
    /// Current run of consecutive small segments
    pub consec_small_segs: u32,
    /// Non-empty extractions
    pub flush_count: u32,
}

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    /// No new sequence space was covered
    pub duplicate: bool,
    /// The new data overlapped retained segments
    pub overlapped: bool,
    /// Winning new bytes replaced bytes the flush policy already scanned
    pub rewrote_buffered: bool,
    /// Consecutive small segment limit exceeded
    pub small_segments_exceeded: bool,
    /// Net change in queued bytes
    pub bytes_added: usize,
}

struct Resolution {
    segments: Vec<Segment>,
    overlapped: bool,
    rewrote_buffered: bool,
}

/// Ordered segment collection for one direction of a session
#[derive(Debug)]
pub struct SegmentStore {
    policy: ReassemblyPolicy,
    rules: OverlapRules,
    limits: StoreLimits,
    segments: VecDeque<Segment>,
    /// Next sequence number to deliver
    base_seq: Option<u32>,
    /// Base came from a SYN, `set_base` or a delivery; until then earlier
    /// data moves it down instead of being trimmed
    base_fixed: bool,
    stats: StoreStats,
}

impl SegmentStore {
    pub fn new(policy: ReassemblyPolicy, limits: StoreLimits) -> Self {
        Self {
            policy,
            rules: policy.rules(),
            limits,
            segments: VecDeque::new(),
            base_seq: None,
            base_fixed: false,
            stats: StoreStats::default(),
        }
    }

    pub fn policy(&self) -> ReassemblyPolicy {
        self.policy
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn queued_bytes(&self) -> usize {
        self.stats.queued_bytes
    }

    pub fn queued_segs(&self) -> usize {
        self.stats.queued_segs
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn base_seq(&self) -> Option<u32> {
        self.base_seq
    }

    /// Whether the base can no longer move down
    pub fn is_base_fixed(&self) -> bool {
        self.base_fixed
    }

    /// Set the next sequence number to deliver. Retained data below it is
    /// discarded.
    pub fn set_base(&mut self, seq: u32) {
        if self.base_seq.is_some() {
            self.purge_to(seq);
        }
        self.base_seq = Some(seq);
        self.base_fixed = true;
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Insert a byte range, resolving overlaps per the store's policy.
    ///
    /// On `CapacityExceeded` or `AllocationFailure` the store is left exactly
    /// as it was.
    pub fn insert(&mut self, seq: u32, payload: &[u8], captured_at: DateTime<Utc>) -> Result<InsertOutcome> {
        if payload.is_empty() {
            return Ok(InsertOutcome { duplicate: true, ..Default::default() });
        }

        let base = match self.base_seq {
            Some(base) if self.base_fixed || seq_geq(seq, base) => base,
            _ => seq,
        };
        let lowered = self.base_seq.is_some_and(|old| old != base);
        let end = seq.wrapping_add(payload.len() as u32);

        if seq_leq(end, base) {
            trace!("Segment {}+{} entirely below base {}", seq, payload.len(), base);
            return Ok(InsertOutcome { duplicate: true, ..Default::default() });
        }

        let (seq, bytes) = if seq_lt(seq, base) {
            let skip = base.wrapping_sub(seq) as usize;
            (base, &payload[skip..])
        } else {
            (seq, payload)
        };

        let incoming = Segment::copy_from(seq, bytes, payload.len(), captured_at)?;
        // Scan offsets are relative to the base, so moving it invalidates them
        let rescan_lowered = lowered && self.segments.iter().any(Segment::is_buffered);
        let new_end = incoming.end();

        // Segments interacting with [seq, new_end): at most one starting
        // before seq, plus every segment starting inside the range.
        let mut first = self.segments.partition_point(|s| seq_lt(s.seq(), seq));
        if first > 0 && seq_gt(self.segments[first - 1].end(), seq) {
            first -= 1;
        }
        let last = self.segments.partition_point(|s| seq_lt(s.seq(), new_end));

        let old: Vec<Segment> = self.segments.drain(first..last).collect();
        let old_bytes: usize = old.iter().map(Segment::len).sum();
        let old_segs = old.len();

        let resolution = resolve(self.rules, old.clone(), incoming);
        let new_bytes: usize = resolution.segments.iter().map(Segment::len).sum();
        let new_segs = resolution.segments.len();

        let queued_bytes = self.stats.queued_bytes - old_bytes + new_bytes;
        let queued_segs = self.stats.queued_segs - old_segs + new_segs;

        let over_bytes = self.limits.max_queued_bytes > 0 && queued_bytes > self.limits.max_queued_bytes;
        let over_segs = self.limits.max_queued_segs > 0 && queued_segs > self.limits.max_queued_segs;
        if over_bytes || over_segs {
            for (i, seg) in old.into_iter().enumerate() {
                self.segments.insert(first + i, seg);
            }
            return Err(StreamError::CapacityExceeded {
                queued_bytes: self.stats.queued_bytes,
                queued_segs: self.stats.queued_segs,
            });
        }

        for (i, seg) in resolution.segments.into_iter().enumerate() {
            self.segments.insert(first + i, seg);
        }
        self.base_seq = Some(base);

        let bytes_added = new_bytes.saturating_sub(old_bytes);
        self.stats.queued_bytes = queued_bytes;
        self.stats.queued_segs = queued_segs;
        self.stats.total_segs_queued += 1;
        self.stats.total_bytes_queued += bytes_added as u64;
        if resolution.overlapped {
            self.stats.overlap_count += 1;
        }

        let small_segments_exceeded = self.count_small_segment(payload.len());

        trace!(
            "Queued {}+{} ({} policy): {} segs / {} bytes",
            seq,
            bytes.len(),
            self.policy,
            self.stats.queued_segs,
            self.stats.queued_bytes
        );

        Ok(InsertOutcome {
            duplicate: bytes_added == 0,
            overlapped: resolution.overlapped,
            rewrote_buffered: resolution.rewrote_buffered || rescan_lowered,
            small_segments_exceeded,
            bytes_added,
        })
    }

    fn count_small_segment(&mut self, len: usize) -> bool {
        if self.limits.small_seg_size == 0 {
            return false;
        }

        if len < self.limits.small_seg_size {
            self.stats.small_seg_count += 1;
            self.stats.consec_small_segs += 1;
        } else {
            self.stats.consec_small_segs = 0;
        }

        self.limits.max_consec_small_segs > 0
            && self.stats.consec_small_segs > self.limits.max_consec_small_segs
    }

    /// Number of bytes available contiguously from the base sequence
    pub fn contiguous_len(&self) -> usize {
        let Some(mut cursor) = self.base_seq else {
            return 0;
        };

        let mut len = 0;
        for seg in &self.segments {
            if seg.seq() != cursor {
                break;
            }
            len += seg.len();
            cursor = seg.end();
        }
        len
    }

    /// Contiguous data from the base as a sequence of slices, starting
    /// `skip` bytes in
    pub fn contiguous_slices(&self, skip: usize) -> impl Iterator<Item = &[u8]> {
        let mut cursor = self.base_seq;
        let mut to_skip = skip;

        self.segments
            .iter()
            .take_while(move |seg| {
                let ok = cursor == Some(seg.seq());
                if ok {
                    cursor = Some(seg.end());
                }
                ok
            })
            .filter_map(move |seg| {
                if to_skip >= seg.len() {
                    to_skip -= seg.len();
                    None
                } else {
                    let start = to_skip;
                    to_skip = 0;
                    Some(&seg.data()[start..])
                }
            })
    }

    /// Mark contiguous segments ending at or before `up_to` as scanned
    pub fn mark_buffered(&mut self, up_to: u32) {
        for seg in self.segments.iter_mut() {
            if seq_gt(seg.end(), up_to) {
                break;
            }
            seg.set_buffered(true);
        }
    }

    /// Remove and return the contiguous prefix from the base, stopping at
    /// `up_to_seq`. Returns an empty buffer when nothing is available.
    pub fn extract_contiguous(&mut self, up_to_seq: u32) -> Vec<u8> {
        let Some(base) = self.base_seq else {
            return Vec::new();
        };
        if seq_leq(up_to_seq, base) {
            return Vec::new();
        }

        let limit = up_to_seq.wrapping_sub(base) as usize;
        let mut out = Vec::with_capacity(limit.min(self.contiguous_len()));
        let mut cursor = base;

        while let Some(front) = self.segments.front_mut() {
            if front.seq() != cursor {
                break;
            }
            let room = limit - out.len();
            if room == 0 {
                break;
            }

            if front.len() <= room {
                if let Some(seg) = self.segments.pop_front() {
                    cursor = seg.end();
                    self.stats.queued_bytes -= seg.len();
                    self.stats.queued_segs -= 1;
                    out.extend_from_slice(&seg.into_data());
                }
            } else {
                out.extend_from_slice(&front.data()[..room]);
                front.trim_front(room);
                cursor = front.seq();
                self.stats.queued_bytes -= room;
                break;
            }
        }

        self.base_seq = Some(cursor);
        if !out.is_empty() {
            self.base_fixed = true;
            self.stats.flush_count += 1;
        }
        out
    }

    /// Discard everything below `seq` and move the base up to it.
    /// Returns the number of queued bytes released.
    pub fn purge_to(&mut self, seq: u32) -> usize {
        let mut released = 0;

        while let Some(front) = self.segments.front_mut() {
            if seq_leq(front.end(), seq) {
                released += front.len();
                self.stats.queued_bytes -= front.len();
                self.stats.queued_segs -= 1;
                self.segments.pop_front();
            } else {
                if seq_lt(front.seq(), seq) {
                    let n = seq.wrapping_sub(front.seq()) as usize;
                    front.trim_front(n);
                    released += n;
                    self.stats.queued_bytes -= n;
                }
                break;
            }
        }

        match self.base_seq {
            Some(base) if seq_geq(base, seq) => {}
            _ => self.base_seq = Some(seq),
        }
        self.base_fixed = true;
        released
    }

    /// Size of the hole between the base and the first retained segment
    pub fn next_hole(&self) -> Option<usize> {
        let base = self.base_seq?;
        let front = self.segments.front()?;
        if front.seq() == base {
            None
        } else {
            Some(front.seq().wrapping_sub(base) as usize)
        }
    }

    /// Advance the base over a hole to the first retained segment
    pub fn skip_hole(&mut self) -> usize {
        match (self.next_hole(), self.segments.front()) {
            (Some(gap), Some(front)) => {
                self.base_seq = Some(front.seq());
                self.base_fixed = true;
                gap
            }
            _ => 0,
        }
    }

    /// Release every queued segment. Lifetime counters survive.
    pub fn clear(&mut self) -> usize {
        let released = self.stats.queued_bytes;
        self.segments.clear();
        self.stats.queued_bytes = 0;
        self.stats.queued_segs = 0;
        self.stats.consec_small_segs = 0;
        self.base_seq = None;
        self.base_fixed = false;
        released
    }
}

/// Resolve `incoming` against the retained segments it touches.
///
/// `old` is sorted and contains at most one segment starting before the
/// new data followed by segments starting inside it. The result is sorted
/// and free of overlaps.
fn resolve(rules: OverlapRules, old: Vec<Segment>, incoming: Segment) -> Resolution {
    let mut out = Vec::with_capacity(old.len() + 2);
    let mut overlapped = false;
    let mut rewrote_buffered = false;
    let mut pending = None;
    let mut split_tail = None;

    let mut iter = old.into_iter().peekable();

    match iter.next_if(|s| seq_lt(s.seq(), incoming.seq())) {
        Some(mut left) => {
            overlapped = true;
            let mut new = incoming;
            let left_end = left.end();
            let new_end = new.end();
            let covered = seq_geq(left_end, new_end);

            match rules.left {
                LeftRule::KeepFirst | LeftRule::TrimFirst if covered => {
                    // Old segment holds every new byte
                }
                LeftRule::KeepFirst => {
                    new.trim_front(left_end.wrapping_sub(new.seq()) as usize);
                    pending = Some(new);
                }
                LeftRule::TrimFirst => {
                    rewrote_buffered |= left.is_buffered();
                    left.trim_back(left_end.wrapping_sub(new.seq()) as usize);
                    pending = Some(new);
                }
                LeftRule::KeepLast => {
                    rewrote_buffered |= left.is_buffered();
                    if seq_gt(left_end, new_end) {
                        split_tail = Some(left.split_off(new_end.wrapping_sub(left.seq()) as usize));
                    }
                    let keep = new.seq().wrapping_sub(left.seq()) as usize;
                    left.trim_back(left.len() - keep);
                    pending = Some(new);
                }
            }
            out.push(left);
        }
        None => pending = Some(incoming),
    }

    for mut right in iter {
        let Some(mut new) = pending.take() else {
            out.push(right);
            continue;
        };

        let new_end = new.end();
        if seq_geq(right.seq(), new_end) {
            out.push(new);
            out.push(right);
            continue;
        }

        overlapped = true;
        let right_end = right.end();

        if seq_gt(right_end, new_end) {
            // New data covers only the head of this segment
            match rules.right {
                RightRule::TruncateExisting => {
                    rewrote_buffered |= right.is_buffered();
                    right.trim_front(new_end.wrapping_sub(right.seq()) as usize);
                }
                RightRule::TruncateNew => {
                    new.trim_back(new_end.wrapping_sub(right.seq()) as usize);
                }
            }
            if !new.is_empty() {
                out.push(new);
            }
            out.push(right);
            continue;
        }

        let starts_before = seq_lt(new.seq(), right.seq());
        let ends_after = seq_gt(new_end, right_end);
        if rules.full.new_wins(starts_before, ends_after) {
            rewrote_buffered |= right.is_buffered();
            pending = Some(new);
        } else {
            let rest = new.split_off(right_end.wrapping_sub(new.seq()) as usize);
            new.trim_back(right_end.wrapping_sub(right.seq()) as usize);
            if !new.is_empty() {
                out.push(new);
            }
            out.push(right);
            if !rest.is_empty() {
                pending = Some(rest);
            }
        }
    }

    if let Some(new) = pending {
        if !new.is_empty() {
            out.push(new);
        }
    }
    if let Some(tail) = split_tail {
        out.push(tail);
    }

    Resolution {
        segments: out,
        overlapped,
        rewrote_buffered,
    }
}
