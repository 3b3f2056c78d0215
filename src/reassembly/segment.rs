//! Queued TCP segment

use chrono::{DateTime, Utc};

use crate::core::seq::seq_lt;
use crate::error::{Result, StreamError};

#[cfg(test)]
thread_local! {
    static FAIL_ALLOCATIONS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make segment copies on this thread fail as if the allocator refused them
#[cfg(test)]
pub(crate) fn fail_allocations(fail: bool) {
    FAIL_ALLOCATIONS.with(|f| f.set(fail));
}

/// A byte range received on one direction of a session.
///
/// Pieces produced by overlap trimming keep the on-wire length of the
/// packet they came from in `orig_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    seq: u32,
    data: Vec<u8>,
    orig_len: usize,
    captured_at: DateTime<Utc>,
    buffered: bool,
}

impl Segment {
    /// Copy `payload` into a new segment, failing instead of aborting when
    /// the allocation cannot be satisfied.
    pub fn copy_from(seq: u32, payload: &[u8], orig_len: usize, captured_at: DateTime<Utc>) -> Result<Self> {
        #[cfg(test)]
        if FAIL_ALLOCATIONS.with(|f| f.get()) {
            return Err(StreamError::AllocationFailure(payload.len()));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(payload.len())
            .map_err(|_| StreamError::AllocationFailure(payload.len()))?;
        data.extend_from_slice(payload);

        Ok(Self {
            seq,
            data,
            orig_len,
            captured_at,
            buffered: false,
        })
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Sequence number one past the last byte
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length of the packet this segment was cut from
    pub fn orig_len(&self) -> usize {
        self.orig_len
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Whether the flush policy has already scanned this segment
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub(crate) fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Does this segment hold the byte at `seq`?
    pub fn contains(&self, seq: u32) -> bool {
        !seq_lt(seq, self.seq) && seq_lt(seq, self.end())
    }

    /// Drop `n` bytes from the front
    pub(crate) fn trim_front(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        self.seq = self.seq.wrapping_add(n as u32);
    }

    /// Drop `n` bytes from the back
    pub(crate) fn trim_back(&mut self, n: usize) {
        let keep = self.data.len().saturating_sub(n);
        self.data.truncate(keep);
    }

    /// Split at byte offset `at`, returning the tail `[at, len)`
    pub(crate) fn split_off(&mut self, at: usize) -> Segment {
        let at = at.min(self.data.len());
        let tail = self.data.split_off(at);
        Segment {
            seq: self.seq.wrapping_add(at as u32),
            data: tail,
            orig_len: self.orig_len,
            captured_at: self.captured_at,
            buffered: self.buffered,
        }
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }
}
