//! Protocol splitters
//!
//! A splitter is the protocol-specific half of protocol-aware flushing: it
//! looks at reassembled bytes as they become contiguous and says where the
//! current application message ends.

use std::fmt;

use crate::core::Direction;

/// Splitter verdict for the bytes just scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    /// No message boundary yet; keep buffering
    Search,
    /// The message ends `n` bytes into the scanned slice
    FlushAt(usize),
    /// The message continues for `n` bytes past the end of the scanned
    /// slice; those bytes need no scanning
    Skip(usize),
    /// Give up on message framing for the rest of the connection
    Abort,
}

/// Protocol-specific flush point detection.
///
/// `scan` is called with consecutive slices of one direction's stream.
/// After returning `FlushAt` or `Skip` the splitter must start over at the
/// resulting flush point.
pub trait Splitter: Send + fmt::Debug {
    /// Short protocol name for logging
    fn name(&self) -> &'static str;

    /// Inspect the next slice of contiguous data
    fn scan(&mut self, data: &[u8], direction: Direction) -> ScanResult;

    /// Forget partial state; scanning restarts at the current base
    fn reset(&mut self);
}

/// Flushes after each occurrence of a delimiter, e.g. `\r\n` for line
/// protocols or `\r\n\r\n` for HTTP headers
#[derive(Debug, Clone)]
pub struct DelimiterSplitter {
    delimiter: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl DelimiterSplitter {
    pub fn new(delimiter: &[u8]) -> Self {
        assert!(!delimiter.is_empty(), "delimiter must not be empty");

        // KMP failure table so split delimiters match across slices
        let mut failure = vec![0; delimiter.len()];
        let mut k = 0;
        for i in 1..delimiter.len() {
            while k > 0 && delimiter[i] != delimiter[k] {
                k = failure[k - 1];
            }
            if delimiter[i] == delimiter[k] {
                k += 1;
            }
            failure[i] = k;
        }

        Self {
            delimiter: delimiter.to_vec(),
            failure,
            matched: 0,
        }
    }

    pub fn lines() -> Self {
        Self::new(b"\n")
    }

    pub fn http_headers() -> Self {
        Self::new(b"\r\n\r\n")
    }
}

impl Splitter for DelimiterSplitter {
    fn name(&self) -> &'static str {
        "delimiter"
    }

    fn scan(&mut self, data: &[u8], _direction: Direction) -> ScanResult {
        for (i, &byte) in data.iter().enumerate() {
            while self.matched > 0 && byte != self.delimiter[self.matched] {
                self.matched = self.failure[self.matched - 1];
            }
            if byte == self.delimiter[self.matched] {
                self.matched += 1;
            }
            if self.matched == self.delimiter.len() {
                self.matched = 0;
                return ScanResult::FlushAt(i + 1);
            }
        }
        ScanResult::Search
    }

    fn reset(&mut self) {
        self.matched = 0;
    }
}

/// Frames messages carrying a big-endian length header (1 to 4 bytes)
/// that counts the body following it
#[derive(Debug, Clone)]
pub struct LengthPrefixSplitter {
    header_len: usize,
    max_message: usize,
    header: u32,
    header_seen: usize,
}

impl LengthPrefixSplitter {
    pub fn new(header_len: usize, max_message: usize) -> Self {
        assert!((1..=4).contains(&header_len), "header length must be 1..=4 bytes");
        Self {
            header_len,
            max_message,
            header: 0,
            header_seen: 0,
        }
    }
}

impl Splitter for LengthPrefixSplitter {
    fn name(&self) -> &'static str {
        "length_prefix"
    }

    fn scan(&mut self, data: &[u8], _direction: Direction) -> ScanResult {
        let mut pos = 0;
        while self.header_seen < self.header_len {
            let Some(&byte) = data.get(pos) else {
                return ScanResult::Search;
            };
            self.header = (self.header << 8) | u32::from(byte);
            self.header_seen += 1;
            pos += 1;
        }

        let body = self.header as usize;
        if body > self.max_message {
            return ScanResult::Abort;
        }

        self.reset();
        let rest = data.len() - pos;
        if body <= rest {
            ScanResult::FlushAt(pos + body)
        } else {
            ScanResult::Skip(body - rest)
        }
    }

    fn reset(&mut self) {
        self.header = 0;
        self.header_seen = 0;
    }
}

/// Never finds a flush point; switches the direction to block flushing on
/// the first byte. For protocols inspected as an opaque byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortSplitter;

impl Splitter for AbortSplitter {
    fn name(&self) -> &'static str {
        "abort"
    }

    fn scan(&mut self, _data: &[u8], _direction: Direction) -> ScanResult {
        ScanResult::Abort
    }

    fn reset(&mut self) {}
}
