//! OS-specific overlap resolution tables
//!
//! Each reassembly policy mimics how a particular TCP stack resolves
//! retransmitted data that overlaps bytes it already holds. A policy is
//! three independent rules, one per overlap shape:
//!
//! ```text
//!   left:   old  |--------|            old starts before new, covers its head
//!           new       |--------|
//!
//!   right:  old           |--------|   new covers only the head of old
//!           new       |--------|
//!
//!   full:   old         |----|         new covers all of old
//!           new       |--------|
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target-based reassembly policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassemblyPolicy {
    First,
    Last,
    Linux,
    Bsd,
    Windows,
    Vista,
    OldLinux,
    Macos,
    Solaris,
}

impl Default for ReassemblyPolicy {
    fn default() -> Self {
        ReassemblyPolicy::Bsd
    }
}

/// Rule applied when an older segment overlaps the head of the new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftRule {
    /// Old bytes win; the new segment is trimmed (or dropped if covered)
    KeepFirst,
    /// New bytes win on the overlap unless the old segment covers the new one
    TrimFirst,
    /// New bytes win; the old segment is truncated and split if needed
    KeepLast,
}

/// Rule applied when the new segment overlaps only the head of a later one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightRule {
    /// New bytes win; the head of the old segment is trimmed
    TruncateExisting,
    /// Old bytes win; the tail of the new segment is trimmed
    TruncateNew,
}

/// Rule applied when the new segment completely covers a later one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRule {
    /// New wins iff it starts strictly before the old segment
    Os1,
    /// New wins unless both segments have identical bounds
    Os2,
    /// New wins iff it starts strictly before and ends strictly after
    Os3,
    /// New always wins
    Os4,
    /// Old always wins
    Os5,
}

impl FullRule {
    /// Decide whether new data replaces an old segment it fully covers.
    ///
    /// `starts_before` / `ends_after` compare the new segment's bounds with
    /// the old segment's.
    pub fn new_wins(self, starts_before: bool, ends_after: bool) -> bool {
        match self {
            FullRule::Os1 => starts_before,
            FullRule::Os2 => starts_before || ends_after,
            FullRule::Os3 => starts_before && ends_after,
            FullRule::Os4 => true,
            FullRule::Os5 => false,
        }
    }
}

/// The three rules making up one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapRules {
    pub left: LeftRule,
    pub right: RightRule,
    pub full: FullRule,
}

impl ReassemblyPolicy {
    pub const ALL: [ReassemblyPolicy; 9] = [
        ReassemblyPolicy::First,
        ReassemblyPolicy::Last,
        ReassemblyPolicy::Linux,
        ReassemblyPolicy::Bsd,
        ReassemblyPolicy::Windows,
        ReassemblyPolicy::Vista,
        ReassemblyPolicy::OldLinux,
        ReassemblyPolicy::Macos,
        ReassemblyPolicy::Solaris,
    ];

    /// Overlap table for this policy
    pub fn rules(self) -> OverlapRules {
        use FullRule::*;
        use LeftRule::*;
        use RightRule::*;

        let (left, right, full) = match self {
            ReassemblyPolicy::First => (KeepFirst, TruncateNew, Os5),
            ReassemblyPolicy::Last => (KeepLast, TruncateExisting, Os4),
            ReassemblyPolicy::Linux => (KeepFirst, TruncateExisting, Os2),
            ReassemblyPolicy::OldLinux => (KeepFirst, TruncateExisting, Os4),
            ReassemblyPolicy::Bsd => (KeepFirst, TruncateExisting, Os1),
            ReassemblyPolicy::Macos => (KeepFirst, TruncateExisting, Os1),
            ReassemblyPolicy::Windows => (KeepFirst, TruncateExisting, Os1),
            ReassemblyPolicy::Vista => (KeepFirst, TruncateNew, Os5),
            ReassemblyPolicy::Solaris => (TrimFirst, TruncateNew, Os3),
        };

        OverlapRules { left, right, full }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReassemblyPolicy::First => "first",
            ReassemblyPolicy::Last => "last",
            ReassemblyPolicy::Linux => "linux",
            ReassemblyPolicy::Bsd => "bsd",
            ReassemblyPolicy::Windows => "windows",
            ReassemblyPolicy::Vista => "vista",
            ReassemblyPolicy::OldLinux => "old_linux",
            ReassemblyPolicy::Macos => "macos",
            ReassemblyPolicy::Solaris => "solaris",
        }
    }
}

impl fmt::Display for ReassemblyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReassemblyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReassemblyPolicy::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown reassembly policy: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_rule_table() {
        // (starts_before, ends_after)
        let shapes = [(false, false), (true, false), (false, true), (true, true)];
        let expect = |rule: FullRule| -> Vec<bool> {
            shapes.iter().map(|&(b, a)| rule.new_wins(b, a)).collect()
        };

        assert_eq!(expect(FullRule::Os1), vec![false, true, false, true]);
        assert_eq!(expect(FullRule::Os2), vec![false, true, true, true]);
        assert_eq!(expect(FullRule::Os3), vec![false, false, false, true]);
        assert_eq!(expect(FullRule::Os4), vec![true, true, true, true]);
        assert_eq!(expect(FullRule::Os5), vec![false, false, false, false]);
    }

    #[test]
    fn test_policy_tables() {
        assert_eq!(
            ReassemblyPolicy::Linux.rules(),
            OverlapRules { left: LeftRule::KeepFirst, right: RightRule::TruncateExisting, full: FullRule::Os2 }
        );
        assert_eq!(ReassemblyPolicy::Last.rules().left, LeftRule::KeepLast);
        assert_eq!(ReassemblyPolicy::Solaris.rules().left, LeftRule::TrimFirst);
        assert_eq!(ReassemblyPolicy::First.rules().full, FullRule::Os5);
        assert_eq!(ReassemblyPolicy::OldLinux.rules().full, FullRule::Os4);
        assert_eq!(ReassemblyPolicy::Vista.rules().right, RightRule::TruncateNew);
    }

    #[test]
    fn test_policy_names() {
        for policy in ReassemblyPolicy::ALL {
            assert_eq!(policy.as_str().parse::<ReassemblyPolicy>(), Ok(policy));
        }
        assert_eq!("MacOS".parse::<ReassemblyPolicy>(), Ok(ReassemblyPolicy::Macos));
        assert!("plan9".parse::<ReassemblyPolicy>().is_err());
    }
}
