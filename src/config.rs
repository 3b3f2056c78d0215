//! Stream reassembly configuration
//!
//! One `StreamConfig` per policy binding. Sessions hold it behind an `Arc`
//! and never modify it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::paf::CompressionState;
use crate::reassembly::{ReassemblyPolicy, StoreLimits};

/// Default idle timeout (seconds)
pub const DEFAULT_SESSION_TIMEOUT: u64 = 30;
/// Default cap on queued bytes per direction
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 1_048_576;
/// Default cap on queued segments per direction
pub const DEFAULT_MAX_QUEUED_SEGS: usize = 2621;
/// Default PAF search limit
pub const DEFAULT_PAF_MAX: usize = 16_384;

/// Reassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Overlap resolution policy for both directions
    pub reassembly_policy: ReassemblyPolicy,

    /// Idle session timeout (seconds)
    pub session_timeout: u64,

    /// Seconds after first packet during which midstream pickup is
    /// accepted; negative accepts midstream sessions unconditionally
    pub hs_timeout: i64,

    /// Largest acceptable receive window; 0 means no cap
    pub max_window: u32,

    /// Overlaps tolerated per direction before flagging; 0 disables
    pub overlap_limit: u32,

    /// Queued bytes per direction; 0 means unlimited
    pub max_queued_bytes: usize,

    /// Queued segments per direction; 0 means unlimited
    pub max_queued_segs: usize,

    /// Consecutive small segments tolerated; 0 disables
    pub max_consec_small_segs: u32,

    /// Payloads shorter than this are small segments; 0 disables
    pub max_consec_small_seg_size: usize,

    /// TSval slack allowed by the PAWS check
    pub paws_ts_fudge: u32,

    /// Global queued-byte caps per tracker role
    pub memcap: MemcapConfig,

    /// Sessions pruned per pruning pass at most
    pub prune_batch: usize,

    /// Protocol-aware flushing
    pub paf: PafConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reassembly_policy: ReassemblyPolicy::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            hs_timeout: -1,
            max_window: 0,
            overlap_limit: 0,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            max_queued_segs: DEFAULT_MAX_QUEUED_SEGS,
            max_consec_small_segs: 0,
            max_consec_small_seg_size: 0,
            paws_ts_fudge: 0,
            memcap: MemcapConfig::default(),
            prune_batch: 8,
            paf: PafConfig::default(),
        }
    }
}

/// Global memory caps, per tracker role
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcapConfig {
    /// Bytes queued across all client-side trackers
    pub client: usize,
    /// Bytes queued across all server-side trackers
    pub server: usize,
}

impl Default for MemcapConfig {
    fn default() -> Self {
        Self {
            client: 64 * 1024 * 1024,
            server: 64 * 1024 * 1024,
        }
    }
}

/// Protocol-aware flush configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PafConfig {
    /// Use splitters when one is attached; otherwise block flushing
    pub enabled: bool,
    /// Bytes searched without a flush point before forcing one
    pub paf_max: usize,
    /// Target block size, uncompressed data
    pub data_block_size: usize,
    /// Maximum block size, uncompressed data
    pub final_block_size: usize,
    /// Target block size, gzip/deflate data
    pub gzip_block_size: usize,
    /// Maximum block size, gzip/deflate data
    pub final_gzip_block_size: usize,
    /// Bytes handed to detection per direction; `None` is unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_depth: Option<u64>,
    /// Bytes handed to file processing per direction; `None` is unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_depth: Option<u64>,
}

impl Default for PafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paf_max: DEFAULT_PAF_MAX,
            data_block_size: 16_384,
            final_block_size: 24_576,
            gzip_block_size: 2_048,
            final_gzip_block_size: 2_304,
            detect_depth: None,
            file_depth: None,
        }
    }
}

impl PafConfig {
    /// (target, max) block sizes for a compression state
    pub fn block_sizes(&self, compression: CompressionState) -> (usize, usize) {
        match compression {
            CompressionState::None => (self.data_block_size, self.final_block_size),
            CompressionState::Gzip | CompressionState::Deflate => {
                (self.gzip_block_size, self.final_gzip_block_size)
            }
        }
    }
}

impl StreamConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StreamError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StreamError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout == 0 {
            return Err(StreamError::Config("session_timeout must be non-zero".into()));
        }
        if self.paf.paf_max == 0 {
            return Err(StreamError::Config("paf.paf_max must be non-zero".into()));
        }
        if self.paf.data_block_size == 0 || self.paf.gzip_block_size == 0 {
            return Err(StreamError::Config("paf block sizes must be non-zero".into()));
        }
        if self.paf.final_block_size < self.paf.data_block_size {
            return Err(StreamError::Config(
                "paf.final_block_size must not be smaller than paf.data_block_size".into(),
            ));
        }
        if self.paf.final_gzip_block_size < self.paf.gzip_block_size {
            return Err(StreamError::Config(
                "paf.final_gzip_block_size must not be smaller than paf.gzip_block_size".into(),
            ));
        }
        if self.max_consec_small_segs > 0 && self.max_consec_small_seg_size == 0 {
            return Err(StreamError::Config(
                "max_consec_small_segs requires max_consec_small_seg_size".into(),
            ));
        }
        Ok(())
    }

    /// Whether a three-way handshake is required before reassembly
    pub fn require_3whs(&self) -> bool {
        self.hs_timeout >= 0
    }

    /// Whether a session first seen at `first_seen` may still be picked up
    /// midstream at `now`
    pub fn midstream_allowed(&self, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.hs_timeout < 0 || (now - first_seen).num_seconds() < self.hs_timeout
    }

    /// Per-direction store limits
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_queued_bytes: self.max_queued_bytes,
            max_queued_segs: self.max_queued_segs,
            small_seg_size: self.max_consec_small_seg_size,
            max_consec_small_segs: self.max_consec_small_segs,
        }
    }
}
