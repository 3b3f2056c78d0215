//! Per-tracker alert history
//!
//! Detection raises alerts against reassembled buffers; the tracker keeps
//! the most recent ones so logging can attach them to later output and so
//! the same rule is not reported twice for one buffer.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Alerts kept per tracker
pub const MAX_SESSION_ALERTS: usize = 8;

/// One alert raised against a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertRecord {
    pub gid: u32,
    pub sid: u32,
    /// Stream sequence number the alert was raised at
    pub seq: u32,
    /// Event id assigned by the logger, 0 until logged
    pub event_id: u32,
    /// Event time (seconds), 0 until logged
    pub event_second: u32,
}

impl AlertRecord {
    pub fn new(gid: u32, sid: u32, seq: u32) -> Self {
        Self {
            gid,
            sid,
            seq,
            event_id: 0,
            event_second: 0,
        }
    }
}

/// Bounded alert history; the oldest record is evicted first
#[derive(Debug, Clone, Default)]
pub struct AlertRing {
    alerts: VecDeque<AlertRecord>,
}

impl AlertRing {
    pub fn new() -> Self {
        Self {
            alerts: VecDeque::with_capacity(MAX_SESSION_ALERTS),
        }
    }

    /// Append, evicting the oldest record when full. Returns the evicted one.
    pub fn push(&mut self, record: AlertRecord) -> Option<AlertRecord> {
        let evicted = if self.alerts.len() == MAX_SESSION_ALERTS {
            self.alerts.pop_front()
        } else {
            None
        };
        self.alerts.push_back(record);
        evicted
    }

    /// Attach logging identifiers to the newest matching alert
    pub fn update(&mut self, gid: u32, sid: u32, event_id: u32, event_second: u32) -> bool {
        match self.alerts.iter_mut().rev().find(|a| a.gid == gid && a.sid == sid) {
            Some(alert) => {
                alert.event_id = event_id;
                alert.event_second = event_second;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, gid: u32, sid: u32) -> bool {
        self.alerts.iter().any(|a| a.gid == gid && a.sid == sid)
    }

    /// Whether this rule already fired at `seq`
    pub fn contains_at(&self, gid: u32, sid: u32, seq: u32) -> bool {
        self.alerts
            .iter()
            .any(|a| a.gid == gid && a.sid == sid && a.seq == seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertRecord> {
        self.alerts.iter()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
    }
}
