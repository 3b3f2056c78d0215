//! Protocol-aware flushing
//!
//! Decides where reassembled data is cut into buffers for inspection. With a
//! splitter attached, cuts fall on application message boundaries. Without
//! one, or once the splitter gives up, data is cut into fixed-size blocks
//! whose size follows the compression state and the remaining depth.

pub mod splitter;

pub use splitter::{AbortSplitter, DelimiterSplitter, LengthPrefixSplitter, ScanResult, Splitter};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::PafConfig;
use crate::core::Direction;
use crate::reassembly::SegmentStore;

/// Content encoding of the stream as reported by the application parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionState {
    #[default]
    None,
    Gzip,
    Deflate,
}

/// Flush point search state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PafState {
    #[default]
    Searching,
    FoundFlushPoint,
    Skipping,
    Aborted,
}

/// Why a buffer was cut where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Splitter found the end of a message
    FlushPoint,
    /// Searched `paf_max` bytes without a flush point
    Forced,
    /// Fixed-size block
    Block,
    /// Connection teardown
    Final,
}

/// What the tracker should do with the contiguous data at its base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Keep buffering
    Wait,
    /// Extract and deliver `len` bytes
    Flush { len: usize, reason: FlushReason },
    /// Depth exhausted; drop `len` bytes without delivery
    Discard(usize),
}

/// Remaining inspection depth. The effective depth is the lesser of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct DepthBudget {
    detect: Option<u64>,
    file: Option<u64>,
}

impl DepthBudget {
    fn remaining(&self) -> Option<u64> {
        match (self.detect, self.file) {
            (Some(detect), Some(file)) => Some(detect.min(file)),
            (detect, file) => detect.or(file),
        }
    }

    fn charge(&mut self, n: u64) {
        for depth in [&mut self.detect, &mut self.file].into_iter().flatten() {
            *depth = depth.saturating_sub(n);
        }
    }

    /// Remaining depth as a byte count, `usize::MAX` when unlimited
    fn cap(&self) -> usize {
        self.remaining()
            .map_or(usize::MAX, |d| usize::try_from(d).unwrap_or(usize::MAX))
    }
}

/// Flush policy for one direction of a session
#[derive(Debug)]
pub struct FlushPolicy {
    config: PafConfig,
    direction: Direction,
    state: PafState,
    splitter: Option<Box<dyn Splitter>>,
    /// Bytes from the base already seen by the splitter or skipped
    scanned: usize,
    skip_remaining: usize,
    compression: CompressionState,
    depth: DepthBudget,
}

impl FlushPolicy {
    pub fn new(config: &PafConfig, direction: Direction) -> Self {
        Self {
            config: config.clone(),
            direction,
            state: PafState::Searching,
            splitter: None,
            scanned: 0,
            skip_remaining: 0,
            compression: CompressionState::None,
            depth: DepthBudget {
                detect: config.detect_depth,
                file: config.file_depth,
            },
        }
    }

    pub fn with_splitter(mut self, splitter: Box<dyn Splitter>) -> Self {
        self.set_splitter(Some(splitter));
        self
    }

    /// Attach or detach the splitter; the search restarts at the base
    pub fn set_splitter(&mut self, splitter: Option<Box<dyn Splitter>>) {
        self.splitter = splitter;
        self.state = PafState::Searching;
        self.scanned = 0;
        self.skip_remaining = 0;
    }

    pub fn splitter_name(&self) -> Option<&'static str> {
        self.splitter.as_ref().map(|s| s.name())
    }

    pub fn state(&self) -> PafState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes from the base the search has already covered
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn compression(&self) -> CompressionState {
        self.compression
    }

    pub fn set_compression(&mut self, compression: CompressionState) {
        self.compression = compression;
    }

    /// Replace the remaining detection and file depths
    pub fn set_depth(&mut self, detect: Option<u64>, file: Option<u64>) {
        self.depth = DepthBudget { detect, file };
    }

    /// Remaining depth; `None` when unlimited
    pub fn depth_remaining(&self) -> Option<u64> {
        self.depth.remaining()
    }

    /// Whether data is cut into fixed-size blocks
    pub fn is_block_mode(&self) -> bool {
        !self.config.enabled || self.splitter.is_none() || self.state == PafState::Aborted
    }

    /// (target, max) block sizes for the current compression state and
    /// remaining depth
    pub fn block_sizes(&self) -> (usize, usize) {
        let (target, max) = self.config.block_sizes(self.compression);
        let depth = self.depth.cap();

        match self.compression {
            CompressionState::None => (target.min(depth), max.min(depth)),
            CompressionState::Gzip | CompressionState::Deflate => {
                if depth > 0 {
                    (target, max)
                } else {
                    (0, 0)
                }
            }
        }
    }

    /// Decide what to do with the contiguous data at the store's base
    pub fn evaluate(&mut self, store: &SegmentStore) -> FlushDecision {
        let available = store.contiguous_len();
        if available == 0 {
            return FlushDecision::Wait;
        }

        let depth = self.depth.cap();
        if depth == 0 {
            return FlushDecision::Discard(available);
        }
        if self.is_block_mode() {
            return self.block(available);
        }

        if self.scanned > available {
            self.rescan();
        }

        match self.state {
            PafState::Searching => self.search(store, available, depth),
            PafState::Skipping => self.skip(available, depth),
            PafState::FoundFlushPoint => self.cut(self.scanned, FlushReason::FlushPoint, depth),
            PafState::Aborted => self.block(available),
        }
    }

    fn search(&mut self, store: &SegmentStore, available: usize, depth: usize) -> FlushDecision {
        let Some(splitter) = self.splitter.as_mut() else {
            return self.block(available);
        };
        let name = splitter.name();

        let mut offset = self.scanned;
        let mut verdict = ScanResult::Search;
        for slice in store.contiguous_slices(self.scanned) {
            verdict = splitter.scan(slice, self.direction);
            match verdict {
                ScanResult::Search => offset += slice.len(),
                ScanResult::FlushAt(n) => {
                    offset = (offset + n.min(slice.len())).max(1);
                    break;
                }
                ScanResult::Skip(_) => {
                    offset += slice.len();
                    break;
                }
                ScanResult::Abort => break,
            }
        }
        self.scanned = offset;

        match verdict {
            ScanResult::Search => self.forced_or_wait(depth),
            ScanResult::FlushAt(_) => {
                trace!("{} flush point at {} on {}", name, offset, self.direction);
                self.state = PafState::FoundFlushPoint;
                self.cut(offset, FlushReason::FlushPoint, depth)
            }
            ScanResult::Skip(n) => {
                trace!("{} skipping {} bytes on {}", name, n, self.direction);
                self.state = PafState::Skipping;
                self.skip_remaining = n;
                self.skip(available, depth)
            }
            ScanResult::Abort => {
                debug!("{} splitter aborted on {}, falling back to block flushing", name, self.direction);
                self.state = PafState::Aborted;
                self.scanned = 0;
                self.block(available)
            }
        }
    }

    fn skip(&mut self, available: usize, depth: usize) -> FlushDecision {
        let step = available.saturating_sub(self.scanned).min(self.skip_remaining);
        self.scanned += step;
        self.skip_remaining -= step;

        if self.skip_remaining == 0 {
            self.state = PafState::FoundFlushPoint;
            return self.cut(self.scanned, FlushReason::FlushPoint, depth);
        }
        self.forced_or_wait(depth)
    }

    fn forced_or_wait(&self, depth: usize) -> FlushDecision {
        if self.scanned >= self.config.paf_max {
            self.cut(self.config.paf_max, FlushReason::Forced, depth)
        } else {
            FlushDecision::Wait
        }
    }

    fn cut(&self, len: usize, reason: FlushReason, depth: usize) -> FlushDecision {
        FlushDecision::Flush {
            len: len.min(depth),
            reason,
        }
    }

    fn block(&self, available: usize) -> FlushDecision {
        let (target, max) = self.block_sizes();
        if max == 0 {
            return FlushDecision::Discard(available);
        }
        if available >= target {
            FlushDecision::Flush {
                len: available.min(max),
                reason: FlushReason::Block,
            }
        } else {
            FlushDecision::Wait
        }
    }

    /// Teardown: the next chunk of `available` contiguous bytes, which may
    /// be smaller than a block
    pub fn final_decision(&self, available: usize) -> FlushDecision {
        if available == 0 {
            return FlushDecision::Wait;
        }

        let depth = self.depth.cap();
        if depth == 0 {
            return FlushDecision::Discard(available);
        }

        let cap = if self.is_block_mode() {
            self.block_sizes().1
        } else {
            self.config.paf_max
        };
        FlushDecision::Flush {
            len: available.min(cap.max(1)).min(depth),
            reason: FlushReason::Final,
        }
    }

    /// `len` bytes were delivered from the base
    pub fn flushed(&mut self, len: usize) {
        self.depth.charge(len as u64);
        self.advance(len);
    }

    /// `len` bytes were dropped from the base without delivery
    pub fn discarded(&mut self, len: usize) {
        self.advance(len);
    }

    fn advance(&mut self, len: usize) {
        self.scanned = self.scanned.saturating_sub(len);
        if self.state == PafState::FoundFlushPoint {
            self.state = PafState::Searching;
        }
    }

    /// Buffered data changed under the search; scan again from the base
    pub fn rescan(&mut self) {
        if self.state == PafState::Aborted {
            return;
        }
        if let Some(splitter) = self.splitter.as_mut() {
            splitter.reset();
        }
        self.state = PafState::Searching;
        self.scanned = 0;
        self.skip_remaining = 0;
    }

    /// Back to the initial state, keeping the splitter
    pub fn reset(&mut self) {
        if let Some(splitter) = self.splitter.as_mut() {
            splitter.reset();
        }
        self.state = PafState::Searching;
        self.scanned = 0;
        self.skip_remaining = 0;
        self.compression = CompressionState::None;
        self.depth = DepthBudget {
            detect: self.config.detect_depth,
            file: self.config.file_depth,
        };
    }
}
