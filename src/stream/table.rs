//! Per-worker session table
//!
//! Each worker owns one table and the sessions of the flows hashed to it,
//! so nothing here is shared or locked. The table keeps sessions in
//! least-recently-used order and accounts queued bytes per tracker role
//! against the configured memcaps.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::core::TcpPacket;
use crate::error::Result;
use crate::sink::FlushSink;
use super::session::{Processed, Role, Session};

/// Flow identity, independent of packet direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Lower address:port
    pub low: SocketAddr,
    /// Higher address:port
    pub high: SocketAddr,
    pub vlan: u16,
    pub address_space_id: u16,
}

impl SessionKey {
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a < b {
            Self { low: a, high: b, vlan: 0, address_space_id: 0 }
        } else {
            Self { low: b, high: a, vlan: 0, address_space_id: 0 }
        }
    }

    pub fn with_vlan(mut self, vlan: u16) -> Self {
        self.vlan = vlan;
        self
    }

    pub fn with_address_space(mut self, address_space_id: u16) -> Self {
        self.address_space_id = address_space_id;
        self
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.low, self.high)?;
        if self.vlan != 0 {
            write!(f, " vlan {}", self.vlan)?;
        }
        Ok(())
    }
}

/// Worker that owns `key` among `workers` workers
pub fn worker_index(key: &SessionKey, workers: usize) -> usize {
    if workers == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub created: u64,
    pub removed: u64,
    /// Removed by the idle timeout
    pub expired: u64,
    /// Removed after closing or reset
    pub closed: u64,
    /// Removed under memory pressure
    pub pruned: u64,
    pub packets: u64,
    /// Packets that returned an error
    pub errors: u64,
}

struct SessionEntry {
    session: Session,
    lru_tick: u64,
}

/// Sessions owned by one worker
pub struct SessionTable {
    config: Arc<StreamConfig>,
    sessions: HashMap<SessionKey, SessionEntry>,
    /// Last-use tick -> key, oldest first
    lru: BTreeMap<u64, SessionKey>,
    tick: u64,
    next_id: u64,
    client_bytes: usize,
    server_bytes: usize,
    stats: TableStats,
}

impl SessionTable {
    pub fn new(config: Arc<StreamConfig>) -> Self {
        info!(
            "Initializing session table (policy={}, memcap client={} server={})",
            config.reassembly_policy, config.memcap.client, config.memcap.server
        );

        Self {
            config,
            sessions: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            next_id: 1,
            client_bytes: 0,
            server_bytes: 0,
            stats: TableStats::default(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key).map(|e| &e.session)
    }

    /// Mutable access, e.g. to attach splitters. Queued bytes must not be
    /// changed through it.
    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key).map(|e| &mut e.session)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &Session)> {
        self.sessions.iter().map(|(k, e)| (k, &e.session))
    }

    /// Bytes queued across all trackers of a role
    pub fn memory_in_use(&self, role: Role) -> usize {
        match role {
            Role::Client => self.client_bytes,
            Role::Server => self.server_bytes,
        }
    }

    /// Route a packet to its session, creating the session on first sight
    pub fn process(&mut self, key: SessionKey, packet: &TcpPacket<'_>, sink: &mut dyn FlushSink) -> Result<Processed> {
        self.stats.packets += 1;
        self.tick += 1;
        let tick = self.tick;

        let (session, prev_tick) = match self.sessions.entry(key) {
            Entry::Occupied(e) => {
                let entry = e.into_mut();
                let prev = std::mem::replace(&mut entry.lru_tick, tick);
                (&mut entry.session, Some(prev))
            }
            Entry::Vacant(e) => {
                let id = self.next_id;
                self.next_id += 1;
                self.stats.created += 1;
                debug!("New session {} for {}", id, key);

                let mut session = Session::new(id, Arc::clone(&self.config), packet);
                session.address_space_id = key.address_space_id;
                let entry = e.insert(SessionEntry { session, lru_tick: tick });
                (&mut entry.session, None)
            }
        };
        if let Some(prev) = prev_tick {
            self.lru.remove(&prev);
        }
        self.lru.insert(tick, key);

        let before = (session.queued_bytes(Role::Client), session.queued_bytes(Role::Server));
        let result = session.process(packet, sink);
        let after = (session.queued_bytes(Role::Client), session.queued_bytes(Role::Server));

        self.client_bytes = self.client_bytes.saturating_sub(before.0) + after.0;
        self.server_bytes = self.server_bytes.saturating_sub(before.1) + after.1;
        if result.is_err() {
            self.stats.errors += 1;
        }

        if self.over_memcap() {
            self.prune_except(Some(key), sink);
        }
        result
    }

    fn over_memcap(&self) -> bool {
        let memcap = self.config.memcap;
        (memcap.client > 0 && self.client_bytes > memcap.client)
            || (memcap.server > 0 && self.server_bytes > memcap.server)
    }

    /// Tear down least-recently-used sessions while over a memcap, at most
    /// `prune_batch` per call. Returns the number pruned.
    pub fn prune(&mut self, sink: &mut dyn FlushSink) -> usize {
        self.prune_except(None, sink)
    }

    fn prune_except(&mut self, keep: Option<SessionKey>, sink: &mut dyn FlushSink) -> usize {
        let batch = self.config.prune_batch.max(1);
        let mut pruned = 0;

        while pruned < batch && self.over_memcap() {
            let Some(victim) = self.lru.values().find(|k| Some(**k) != keep).copied() else {
                break;
            };
            self.remove(&victim, sink);
            self.stats.pruned += 1;
            pruned += 1;
        }

        if pruned > 0 {
            warn!(
                "Memcap exceeded, pruned {} sessions (client={} server={})",
                pruned, self.client_bytes, self.server_bytes
            );
        }
        pruned
    }

    /// Tear down and remove a session, delivering what it still holds
    pub fn remove(&mut self, key: &SessionKey, sink: &mut dyn FlushSink) -> Option<Session> {
        let mut entry = self.sessions.remove(key)?;
        self.lru.remove(&entry.lru_tick);

        let session = &mut entry.session;
        self.client_bytes = self.client_bytes.saturating_sub(session.queued_bytes(Role::Client));
        self.server_bytes = self.server_bytes.saturating_sub(session.queued_bytes(Role::Server));
        session.cleanup(sink);

        self.stats.removed += 1;
        Some(entry.session)
    }

    /// Remove sessions idle past the session timeout and sessions that
    /// have closed. Returns the number removed.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>, sink: &mut dyn FlushSink) -> usize {
        let mut expired = Vec::new();
        let mut closed = Vec::new();
        for (key, entry) in &self.sessions {
            if entry.session.is_expired(now) {
                expired.push(*key);
            } else if entry.session.is_terminated() {
                closed.push(*key);
            }
        }

        for key in &expired {
            self.remove(key, sink);
        }
        for key in &closed {
            self.remove(key, sink);
        }
        self.stats.expired += expired.len() as u64;
        self.stats.closed += closed.len() as u64;

        let total = expired.len() + closed.len();
        if total > 0 {
            debug!("Cleaned up {} expired and {} closed sessions", expired.len(), closed.len());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemcapConfig;
    use crate::core::{Direction, TcpFlags};
    use crate::error::StreamError;
    use crate::sink::FlushedBuffer;
    use crate::stream::TcpState;
    use chrono::Duration;

    fn key(port: u16) -> SessionKey {
        SessionKey::new(
            "192.168.1.100:40000".parse().unwrap(),
            format!("10.0.0.1:{}", port).parse().unwrap(),
        )
    }

    fn data(payload: &[u8]) -> TcpPacket<'_> {
        TcpPacket::new(Direction::ToServer, 1000, 1, TcpFlags::from_u8(0x18), payload, Utc::now())
    }

    fn table_with(memcap_server: usize, prune_batch: usize) -> SessionTable {
        SessionTable::new(Arc::new(StreamConfig {
            memcap: MemcapConfig {
                client: 0,
                server: memcap_server,
            },
            prune_batch,
            ..StreamConfig::default()
        }))
    }

    #[test]
    fn test_key_normalized() {
        let a: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let b: SocketAddr = "192.168.1.100:40000".parse().unwrap();
        assert_eq!(SessionKey::new(a, b), SessionKey::new(b, a));
        assert_ne!(SessionKey::new(a, b), SessionKey::new(a, b).with_vlan(7));
        assert_eq!(worker_index(&SessionKey::new(a, b), 4), worker_index(&SessionKey::new(b, a), 4));
    }

    #[test]
    fn test_worker_index_in_range() {
        for port in 1..200 {
            assert!(worker_index(&key(port), 3) < 3);
        }
        assert_eq!(worker_index(&key(80), 0), 0);
    }

    #[test]
    fn test_create_and_lookup() {
        let mut table = table_with(0, 8);
        let mut sink: Vec<FlushedBuffer> = Vec::new();

        table.process(key(80), &data(b"abc"), &mut sink).unwrap();
        let reply = TcpPacket::new(Direction::ToClient, 1, 1003, TcpFlags::from_u8(0x18), b"xy", Utc::now());
        table.process(key(80), &reply, &mut sink).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().created, 1);
        assert_eq!(table.stats().packets, 2);
        assert_eq!(table.get(&key(80)).unwrap().state(), TcpState::Established);
        assert_eq!(table.memory_in_use(Role::Server), 3);
        assert_eq!(table.memory_in_use(Role::Client), 2);
    }

    #[test]
    fn test_remove_releases_accounting() {
        let mut table = table_with(0, 8);
        let mut sink = Vec::new();

        table.process(key(80), &data(b"abcdef"), &mut sink).unwrap();
        let session = table.remove(&key(80), &mut sink).unwrap();

        assert_eq!(session.state(), TcpState::Closed);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].data, b"abcdef");
        assert_eq!(table.memory_in_use(Role::Server), 0);
        assert!(table.remove(&key(80), &mut sink).is_none());
    }

    #[test]
    fn test_allocation_failure_releases_accounting() {
        let mut table = table_with(0, 8);
        let mut sink: Vec<FlushedBuffer> = Vec::new();

        table.process(key(80), &data(b"abcdef"), &mut sink).unwrap();
        let reply = TcpPacket::new(Direction::ToClient, 1, 1006, TcpFlags::from_u8(0x18), b"xy", Utc::now());
        table.process(key(80), &reply, &mut sink).unwrap();
        assert_eq!(table.memory_in_use(Role::Server), 6);
        assert_eq!(table.memory_in_use(Role::Client), 2);

        crate::reassembly::segment::fail_allocations(true);
        let more = TcpPacket::new(Direction::ToServer, 1006, 3, TcpFlags::from_u8(0x18), b"ghi", Utc::now());
        let err = table.process(key(80), &more, &mut sink).unwrap_err();
        crate::reassembly::segment::fail_allocations(false);

        assert!(err.is_fatal());
        assert_eq!(table.get(&key(80)).unwrap().state(), TcpState::None);
        assert_eq!(table.memory_in_use(Role::Server), 0);
        assert_eq!(table.memory_in_use(Role::Client), 0);
        assert_eq!(table.stats().errors, 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_memcap_prunes_least_recently_used() {
        let mut table = table_with(10, 8);
        let mut sink = Vec::new();

        table.process(key(1), &data(&[1; 6]), &mut sink).unwrap();
        table.process(key(2), &data(&[2; 3]), &mut sink).unwrap();
        // Touch session 1 so session 2 becomes the oldest
        table.process(key(1), &TcpPacket::new(Direction::ToServer, 1006, 1, TcpFlags::from_u8(0x10), b"", Utc::now()), &mut sink).unwrap();
        table.process(key(3), &data(&[3; 3]), &mut sink).unwrap();

        assert!(table.get(&key(2)).is_none());
        assert!(table.get(&key(1)).is_some());
        assert!(table.get(&key(3)).is_some());
        assert_eq!(table.stats().pruned, 1);
        assert_eq!(table.memory_in_use(Role::Server), 9);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].data, vec![2; 3]);
    }

    #[test]
    fn test_prune_batch_and_current_session() {
        let mut table = table_with(3, 1);
        let mut sink = Vec::new();

        // The only session is the one being processed; it is kept
        table.process(key(1), &data(&[1; 4]), &mut sink).unwrap();
        assert_eq!(table.len(), 1);

        table.process(key(2), &data(&[2; 4]), &mut sink).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(&key(2)).is_some());
        assert_eq!(table.memory_in_use(Role::Server), 4);

        assert_eq!(table.prune(&mut sink), 1);
        assert!(table.is_empty());
        assert_eq!(table.memory_in_use(Role::Server), 0);
    }

    #[test]
    fn test_sweep_timeouts() {
        let mut table = table_with(0, 8);
        let mut sink = Vec::new();
        let now = Utc::now();

        table.process(key(1), &data(b"idle"), &mut sink).unwrap();
        table.process(key(2), &data(b"busy"), &mut sink).unwrap();
        let rst = TcpPacket::new(Direction::ToClient, 1, 0, TcpFlags::from_u8(0x04), b"", now);
        table.process(key(2), &rst, &mut sink).unwrap();

        assert_eq!(table.sweep_timeouts(now, &mut sink), 1);
        assert!(table.get(&key(2)).is_none());
        assert_eq!(table.stats().closed, 1);

        assert_eq!(table.sweep_timeouts(now + Duration::seconds(60), &mut sink), 1);
        assert!(table.is_empty());
        assert_eq!(table.stats().expired, 1);
        assert_eq!(table.memory_in_use(Role::Server), 0);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_errors_counted() {
        let mut table = SessionTable::new(Arc::new(StreamConfig {
            max_queued_bytes: 2,
            ..StreamConfig::default()
        }));
        let mut sink = Vec::new();

        let err = table.process(key(80), &data(b"too long"), &mut sink).unwrap_err();
        assert!(matches!(err, StreamError::CapacityExceeded { .. }));
        assert_eq!(table.stats().errors, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.memory_in_use(Role::Server), 0);
    }
}
