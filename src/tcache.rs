//! Timeout cache (tcache).
//!
//! The single substrate under the attribute, name, readdir and
//! capability caches: a size- and time-bounded associative cache with a
//! configurable reclaim policy.  Entries live in an arena of slots
//! indexed by small integers; the hash chains and the LRU list are
//! intrusive links *by index*, so eviction is pure index surgery and no
//! ownership cycle can exist.  Payload ownership is exclusive to the
//! slot: deleting an entry drops the payload.
//!
//! Terminology, shared with the per-cache counters:
//! - DELETE: removal at the caller's request
//! - PURGE: removal by a reclaim sweep
//! - REPLACEMENT: removal of the single LRU entry at the hard limit
//! - EXPIRED: an entry past its expiration that is still resident
//! - REFRESH: re-arming an entry's expiration

use std::time::{Duration, Instant};

use crate::error::{PvfsError, PvfsResult};

/// Keys supply their own bucket function so each cache keeps its hash
/// (the readdir cache uses a Bob-Jenkins word mix, the name cache a
/// string hash).
pub trait CacheKey: Eq {
    fn bucket(&self, table_size: usize) -> usize;
}

/// Stable identifier of a resident entry.  Valid until the entry is
/// deleted or evicted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EntryId(u32);

const NIL: u32 = u32::MAX;

/// Default hash table width when the wrapper does not choose one.
pub const DEFAULT_TABLE_SIZE: usize = 1021;

/// Tunable options; the enumeration is the contract with the param
/// upcall.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcacheOption {
    /// Default entry lifetime, in milliseconds.
    TimeoutMsecs,
    /// Current entry count (read-only).
    NumEntries,
    /// Absolute cap; reaching it forces LRU replacement on insert.
    HardLimit,
    /// Threshold that triggers a reclaim sweep on insert.
    SoftLimit,
    /// Fraction of the soft limit reclaimed per sweep.
    ReclaimPercentage,
    /// When off, inserts silently discard and lookups miss.
    Enable,
    /// When off, entries live until LRU eviction.
    EnableExpiration,
}

/// Outcome of an insert, for the wrapper's counter accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inserted {
    /// Entries removed by the pre-insert reclaim sweep.
    pub purged: usize,
    /// Whether the single LRU entry was evicted at the hard limit.
    pub replaced: bool,
}

struct Entry<K, P> {
    key: K,
    payload: P,
    expiration: Instant,
    bucket: u32,
    hash_prev: u32,
    hash_next: u32,
    /// Toward the MRU head.
    lru_prev: u32,
    /// Toward the LRU tail.
    lru_next: u32,
}

enum Slot<K, P> {
    Occupied(Entry<K, P>),
    Free { next_free: u32 },
}

impl<K, P> Slot<K, P> {
    fn entry(&self) -> &Entry<K, P> {
        match self {
            Slot::Occupied(e) => e,
            Slot::Free { .. } => unreachable!("free slot on a live list"),
        }
    }

    fn entry_mut(&mut self) -> &mut Entry<K, P> {
        match self {
            Slot::Occupied(e) => e,
            Slot::Free { .. } => unreachable!("free slot on a live list"),
        }
    }
}

/// A generic timeout cache instance.
pub struct Tcache<K: CacheKey, P> {
    slots: Vec<Slot<K, P>>,
    free_head: u32,
    buckets: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    num_entries: usize,
    timeout: Duration,
    soft_limit: usize,
    hard_limit: usize,
    reclaim_percentage: usize,
    enabled: bool,
    expiration_enabled: bool,
}

impl<K: CacheKey, P> Tcache<K, P> {
    pub fn new(table_size: usize) -> Tcache<K, P> {
        let table_size = if table_size == 0 {
            DEFAULT_TABLE_SIZE
        } else {
            table_size
        };
        Tcache {
            slots: Vec::new(),
            free_head: NIL,
            buckets: vec![NIL; table_size],
            lru_head: NIL,
            lru_tail: NIL,
            num_entries: 0,
            timeout: Duration::from_millis(0),
            soft_limit: 5120,
            hard_limit: 10240,
            reclaim_percentage: 25,
            enabled: true,
            expiration_enabled: true,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_info(&mut self, option: TcacheOption, value: u32) -> PvfsResult<()> {
        match option {
            TcacheOption::TimeoutMsecs => {
                self.timeout = Duration::from_millis(value as u64);
                if value == 0 {
                    // A zero timeout is the historical way to disable.
                    self.enabled = false;
                }
            }
            TcacheOption::NumEntries => return Err(PvfsError::EINVAL),
            TcacheOption::HardLimit => {
                if value == 0 {
                    return Err(PvfsError::EINVAL);
                }
                self.hard_limit = value as usize;
                while self.num_entries > self.hard_limit {
                    let tail = self.lru_tail;
                    self.remove_index(tail);
                }
            }
            TcacheOption::SoftLimit => {
                if value == 0 {
                    return Err(PvfsError::EINVAL);
                }
                self.soft_limit = value as usize;
            }
            TcacheOption::ReclaimPercentage => {
                if value > 100 {
                    return Err(PvfsError::EINVAL);
                }
                self.reclaim_percentage = value as usize;
            }
            TcacheOption::Enable => self.enabled = value != 0,
            TcacheOption::EnableExpiration => self.expiration_enabled = value != 0,
        }
        Ok(())
    }

    pub fn get_info(&self, option: TcacheOption) -> u32 {
        match option {
            TcacheOption::TimeoutMsecs => self.timeout.as_millis() as u32,
            TcacheOption::NumEntries => self.num_entries as u32,
            TcacheOption::HardLimit => self.hard_limit as u32,
            TcacheOption::SoftLimit => self.soft_limit as u32,
            TcacheOption::ReclaimPercentage => self.reclaim_percentage as u32,
            TcacheOption::Enable => self.enabled as u32,
            TcacheOption::EnableExpiration => self.expiration_enabled as u32,
        }
    }

    /// Insert with the default expiration (`now + timeout`).
    pub fn insert(&mut self, key: K, payload: P) -> Inserted {
        let expiration = Instant::now() + self.timeout;
        self.insert_with_expiration(key, payload, expiration)
    }

    /// Insert with an explicit expiration instant.
    ///
    /// If the key is already resident the payload is replaced in place
    /// and the entry refreshed; no reclaim runs.  Otherwise a reclaim
    /// sweep runs first when the soft limit is reached, and the single
    /// LRU entry is evicted when the hard limit still stands.
    pub fn insert_with_expiration(&mut self, key: K, payload: P, expiration: Instant) -> Inserted {
        if !self.enabled {
            return Inserted::default();
        }
        if let Some((id, _)) = self.find(&key) {
            let entry = self.slots[id.0 as usize].entry_mut();
            entry.payload = payload;
            entry.expiration = expiration;
            self.lru_promote(id.0);
            return Inserted::default();
        }

        let mut outcome = Inserted::default();
        if self.num_entries >= self.soft_limit {
            outcome.purged = self.reclaim();
        }
        if self.num_entries >= self.hard_limit {
            let tail = self.lru_tail;
            self.remove_index(tail);
            outcome.replaced = true;
        }

        let bucket = (key.bucket(self.buckets.len()) % self.buckets.len()) as u32;
        let index = self.alloc_slot(Entry {
            key,
            payload,
            expiration,
            bucket,
            hash_prev: NIL,
            hash_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        });
        self.hash_link(index, bucket);
        self.lru_link_head(index);
        self.num_entries += 1;
        outcome
    }

    /// Look up a key.  A resident entry is always returned; the bool is
    /// true when expiration is enabled and the entry has expired.  An
    /// expired entry is not promoted on the LRU.
    pub fn lookup(&mut self, key: &K) -> Option<(EntryId, bool)> {
        if !self.enabled {
            return None;
        }
        let (id, expired) = self.find(key)?;
        if !expired {
            self.lru_promote(id.0);
        }
        Some((id, expired))
    }

    fn find(&self, key: &K) -> Option<(EntryId, bool)> {
        let bucket = key.bucket(self.buckets.len()) % self.buckets.len();
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            let entry = self.slots[cur as usize].entry();
            if entry.key == *key {
                let expired = self.expiration_enabled && entry.expiration <= Instant::now();
                return Some((EntryId(cur), expired));
            }
            cur = entry.hash_next;
        }
        None
    }

    pub fn payload(&self, id: EntryId) -> &P {
        &self.slots[id.0 as usize].entry().payload
    }

    pub fn payload_mut(&mut self, id: EntryId) -> &mut P {
        &mut self.slots[id.0 as usize].entry_mut().payload
    }

    /// Remove an entry, dropping its payload.
    pub fn delete(&mut self, id: EntryId) {
        self.remove_index(id.0);
    }

    /// Re-arm an entry's expiration to `now + timeout` and promote it.
    pub fn refresh(&mut self, id: EntryId) {
        let expiration = Instant::now() + self.timeout;
        self.slots[id.0 as usize].entry_mut().expiration = expiration;
        self.lru_promote(id.0);
    }

    /// Set an explicit expiration and promote.
    pub fn refresh_with_expiration(&mut self, id: EntryId, expiration: Instant) {
        self.slots[id.0 as usize].entry_mut().expiration = expiration;
        self.lru_promote(id.0);
    }

    /// Sweep from the LRU tail toward the head, deleting expired
    /// entries, until the list is exhausted or the sweep quota
    /// (`ceil(reclaim_percentage% of soft_limit)`) is reached.
    pub fn reclaim(&mut self) -> usize {
        if !self.expiration_enabled {
            return 0;
        }
        let quota = (self.reclaim_percentage * self.soft_limit).div_ceil(100);
        let now = Instant::now();
        let mut reclaimed = 0;
        let mut cur = self.lru_tail;
        while cur != NIL && reclaimed < quota {
            let entry = self.slots[cur as usize].entry();
            let prev = entry.lru_prev;
            if entry.expiration <= now {
                self.remove_index(cur);
                reclaimed += 1;
            }
            cur = prev;
        }
        reclaimed
    }

    // slot arena

    fn alloc_slot(&mut self, entry: Entry<K, P>) -> u32 {
        if self.free_head != NIL {
            let index = self.free_head;
            match self.slots[index as usize] {
                Slot::Free { next_free } => self.free_head = next_free,
                Slot::Occupied(_) => unreachable!("occupied slot on the free list"),
            }
            self.slots[index as usize] = Slot::Occupied(entry);
            index
        } else {
            self.slots.push(Slot::Occupied(entry));
            (self.slots.len() - 1) as u32
        }
    }

    fn remove_index(&mut self, index: u32) {
        debug_assert_ne!(index, NIL);
        self.hash_unlink(index);
        self.lru_unlink(index);
        self.slots[index as usize] = Slot::Free {
            next_free: self.free_head,
        };
        self.free_head = index;
        self.num_entries -= 1;
    }

    // hash chain surgery

    fn hash_link(&mut self, index: u32, bucket: u32) {
        let head = self.buckets[bucket as usize];
        {
            let entry = self.slots[index as usize].entry_mut();
            entry.hash_prev = NIL;
            entry.hash_next = head;
            entry.bucket = bucket;
        }
        if head != NIL {
            self.slots[head as usize].entry_mut().hash_prev = index;
        }
        self.buckets[bucket as usize] = index;
    }

    fn hash_unlink(&mut self, index: u32) {
        let (bucket, prev, next) = {
            let entry = self.slots[index as usize].entry();
            (entry.bucket, entry.hash_prev, entry.hash_next)
        };
        if prev != NIL {
            self.slots[prev as usize].entry_mut().hash_next = next;
        } else {
            self.buckets[bucket as usize] = next;
        }
        if next != NIL {
            self.slots[next as usize].entry_mut().hash_prev = prev;
        }
    }

    // LRU surgery; head is MRU

    fn lru_link_head(&mut self, index: u32) {
        let head = self.lru_head;
        {
            let entry = self.slots[index as usize].entry_mut();
            entry.lru_prev = NIL;
            entry.lru_next = head;
        }
        if head != NIL {
            self.slots[head as usize].entry_mut().lru_prev = index;
        }
        self.lru_head = index;
        if self.lru_tail == NIL {
            self.lru_tail = index;
        }
    }

    fn lru_unlink(&mut self, index: u32) {
        let (prev, next) = {
            let entry = self.slots[index as usize].entry();
            (entry.lru_prev, entry.lru_next)
        };
        if prev != NIL {
            self.slots[prev as usize].entry_mut().lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.slots[next as usize].entry_mut().lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn lru_promote(&mut self, index: u32) {
        if self.lru_head == index {
            return;
        }
        self.lru_unlink(index);
        self.lru_link_head(index);
    }

    /// Entries from MRU to LRU, for tests and diagnostics.
    pub fn lru_keys(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.num_entries);
        let mut cur = self.lru_head;
        while cur != NIL {
            let entry = self.slots[cur as usize].entry();
            keys.push(&entry.key);
            cur = entry.lru_next;
        }
        keys
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        // num_entries == LRU length == sum of bucket chain lengths, and
        // no index appears twice.
        let mut seen = std::collections::HashSet::new();
        let mut lru_len = 0;
        let mut cur = self.lru_head;
        let mut prev = NIL;
        while cur != NIL {
            assert!(seen.insert(cur), "index {cur} twice on the LRU list");
            let entry = self.slots[cur as usize].entry();
            assert_eq!(entry.lru_prev, prev);
            prev = cur;
            cur = entry.lru_next;
            lru_len += 1;
        }
        assert_eq!(self.lru_tail, prev);
        assert_eq!(lru_len, self.num_entries);

        let mut hash_seen = std::collections::HashSet::new();
        let mut hash_len = 0;
        for (b, &head) in self.buckets.iter().enumerate() {
            let mut cur = head;
            let mut prev = NIL;
            while cur != NIL {
                assert!(hash_seen.insert(cur), "index {cur} on two hash chains");
                let entry = self.slots[cur as usize].entry();
                assert_eq!(entry.bucket as usize, b);
                assert_eq!(entry.hash_prev, prev);
                prev = cur;
                cur = entry.hash_next;
                hash_len += 1;
            }
        }
        assert_eq!(hash_len, self.num_entries);
        assert_eq!(seen, hash_seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    struct Key(u64);

    impl CacheKey for Key {
        fn bucket(&self, table_size: usize) -> usize {
            (self.0 % table_size as u64) as usize
        }
    }

    fn cache(soft: u32, hard: u32, pct: u32, timeout_ms: u32) -> Tcache<Key, String> {
        let mut c = Tcache::new(16);
        c.set_info(TcacheOption::SoftLimit, soft).unwrap();
        c.set_info(TcacheOption::HardLimit, hard).unwrap();
        c.set_info(TcacheOption::ReclaimPercentage, pct).unwrap();
        c.set_info(TcacheOption::TimeoutMsecs, timeout_ms).unwrap();
        c
    }

    fn past() -> Instant {
        Instant::now() - Duration::from_secs(10)
    }

    fn future() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn insert_lookup_delete() {
        let mut c = cache(4, 8, 50, 60_000);
        c.insert(Key(1), "one".into());
        c.insert(Key(2), "two".into());
        let (id, expired) = c.lookup(&Key(1)).unwrap();
        assert!(!expired);
        assert_eq!(c.payload(id), "one");
        c.delete(id);
        assert!(c.lookup(&Key(1)).is_none());
        assert_eq!(c.num_entries(), 1);
        c.assert_consistent();
    }

    #[test]
    fn expired_lookup_returns_entry() {
        let mut c = cache(4, 8, 50, 60_000);
        c.insert_with_expiration(Key(1), "stale".into(), past());
        let (id, expired) = c.lookup(&Key(1)).unwrap();
        assert!(expired);
        assert_eq!(c.payload(id), "stale");
        // still resident until refreshed or deleted
        assert_eq!(c.num_entries(), 1);
        c.refresh_with_expiration(id, future());
        let (_, expired) = c.lookup(&Key(1)).unwrap();
        assert!(!expired);
    }

    #[test]
    fn expired_lookup_does_not_promote() {
        let mut c = cache(8, 16, 50, 60_000);
        c.insert_with_expiration(Key(1), "a".into(), past());
        c.insert_with_expiration(Key(2), "b".into(), future());
        // key 1 is at the LRU tail; an expired lookup must leave it there
        c.lookup(&Key(1)).unwrap();
        assert_eq!(c.lru_keys(), [&Key(2), &Key(1)]);
        // a fresh lookup promotes
        c.lookup(&Key(2)).unwrap();
        c.insert_with_expiration(Key(3), "c".into(), future());
        assert_eq!(c.lru_keys(), [&Key(3), &Key(2), &Key(1)]);
        c.assert_consistent();
    }

    #[test]
    fn reclaim_sweeps_expired_up_to_quota() {
        // soft=4, pct=50 -> quota of 2 per sweep
        let mut c = cache(4, 8, 50, 1_000);
        for i in 0..4 {
            c.insert_with_expiration(Key(i), format!("{i}"), past());
        }
        let outcome = c.insert_with_expiration(Key(99), "new".into(), future());
        assert_eq!(outcome.purged, 2);
        assert!(!outcome.replaced);
        assert_eq!(c.num_entries(), 3);
        c.assert_consistent();
    }

    #[test]
    fn hard_limit_replaces_exactly_one() {
        let mut c = cache(4, 8, 50, 60_000);
        for i in 0..8 {
            c.insert_with_expiration(Key(i), format!("{i}"), future());
        }
        assert_eq!(c.num_entries(), 8);
        let outcome = c.insert_with_expiration(Key(99), "new".into(), future());
        assert_eq!(outcome.purged, 0);
        assert!(outcome.replaced);
        assert_eq!(c.num_entries(), 8);
        // Key(0) was the LRU entry
        assert!(c.lookup(&Key(0)).is_none());
        assert!(c.lookup(&Key(99)).is_some());
        c.assert_consistent();
    }

    #[test]
    fn insert_existing_replaces_payload() {
        let mut c = cache(4, 8, 50, 60_000);
        c.insert(Key(1), "old".into());
        let outcome = c.insert(Key(1), "new".into());
        assert_eq!(outcome, Inserted::default());
        assert_eq!(c.num_entries(), 1);
        let (id, _) = c.lookup(&Key(1)).unwrap();
        assert_eq!(c.payload(id), "new");
    }

    #[test]
    fn disabled_cache_discards() {
        let mut c = cache(4, 8, 50, 60_000);
        c.set_info(TcacheOption::Enable, 0).unwrap();
        c.insert(Key(1), "x".into());
        assert_eq!(c.num_entries(), 0);
        assert!(c.lookup(&Key(1)).is_none());
    }

    #[test]
    fn expiration_disabled_entries_persist() {
        let mut c = cache(4, 8, 50, 1);
        c.set_info(TcacheOption::EnableExpiration, 0).unwrap();
        c.insert_with_expiration(Key(1), "x".into(), past());
        let (_, expired) = c.lookup(&Key(1)).unwrap();
        assert!(!expired);
        assert_eq!(c.reclaim(), 0);
    }

    #[test]
    fn shrinking_hard_limit_evicts() {
        let mut c = cache(4, 8, 50, 60_000);
        for i in 0..6 {
            c.insert_with_expiration(Key(i), format!("{i}"), future());
        }
        c.set_info(TcacheOption::HardLimit, 3).unwrap();
        assert_eq!(c.num_entries(), 3);
        // the three most recent survive
        assert!(c.lookup(&Key(5)).is_some());
        assert!(c.lookup(&Key(0)).is_none());
        c.assert_consistent();
    }

    #[test]
    fn zero_timeout_disables() {
        let mut c = cache(4, 8, 50, 60_000);
        c.set_info(TcacheOption::TimeoutMsecs, 0).unwrap();
        c.insert(Key(1), "x".into());
        assert_eq!(c.num_entries(), 0);
    }

    #[test]
    fn slot_reuse_after_delete() {
        let mut c = cache(64, 128, 50, 60_000);
        for round in 0..3 {
            for i in 0..32 {
                c.insert_with_expiration(Key(i), format!("{round}-{i}"), future());
            }
            for i in 0..32 {
                let (id, _) = c.lookup(&Key(i)).unwrap();
                c.delete(id);
            }
            assert_eq!(c.num_entries(), 0);
            c.assert_consistent();
        }
    }
}
