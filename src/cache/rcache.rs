//! Readdir cache (rcache).
//!
//! Maps `(directory, readdir token)` pairs to the dirdata server index
//! the token position lives on, so a streaming readdir keeps hitting
//! the same shard.  Expiration is disabled: entries live until the hard
//! limit forces LRU eviction.  The table is a power of two and indexed
//! with a Bob-Jenkins word mix of the handle halves and the token.

use log::debug;
use parking_lot::Mutex;

use crate::cache::{count_insert, publish_params, CacheCounter};
use crate::error::{PvfsError, PvfsResult};
use crate::perf::{PerfCounter, PerfKey, PerfOp};
use crate::tcache::{CacheKey, Tcache, TcacheOption};
use crate::types::ObjectRef;

/// Token value the kernel uses to start a directory stream; never a
/// cacheable position.
pub const ITERATE_START: u64 = (i32::MAX - 1) as u64;
/// Token value marking the end of a directory stream.
pub const ITERATE_END: u64 = (i32::MAX - 2) as u64;

const RCACHE_TABLE_SIZE: usize = 512;
const RCACHE_DEFAULT_SOFT_LIMIT: u32 = 512;
const RCACHE_DEFAULT_HARD_LIMIT: u32 = 1024;
const RCACHE_DEFAULT_RECLAIM_PERCENTAGE: u32 = 25;

static RCACHE_KEYS: [PerfKey; CacheCounter::COUNT] = [
    PerfKey { name: "RCACHE_NUM_ENTRIES", preserve: true },
    PerfKey { name: "RCACHE_SOFT_LIMIT", preserve: true },
    PerfKey { name: "RCACHE_HARD_LIMIT", preserve: true },
    PerfKey { name: "RCACHE_HITS", preserve: false },
    PerfKey { name: "RCACHE_MISSES", preserve: false },
    PerfKey { name: "RCACHE_UPDATES", preserve: false },
    PerfKey { name: "RCACHE_PURGES", preserve: false },
    PerfKey { name: "RCACHE_REPLACEMENTS", preserve: false },
    PerfKey { name: "RCACHE_DELETIONS", preserve: false },
    PerfKey { name: "RCACHE_ENABLED", preserve: true },
];

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
struct RcacheKey {
    refn: ObjectRef,
    token: u64,
}

// from http://burtleburtle.net/bob/hash/evahash.html
fn mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15);
    c
}

impl CacheKey for RcacheKey {
    fn bucket(&self, table_size: usize) -> usize {
        let a = (self.refn.handle.hi() ^ (self.refn.handle.hi() >> 32)) as u32;
        let b = (self.refn.handle.lo() ^ (self.refn.handle.lo() >> 32)) as u32;
        let c = self.token as u32;
        debug_assert!(table_size.is_power_of_two());
        mix(a, b, c) as usize & (table_size - 1)
    }
}

struct RcachePayload {
    dirdata_index: u32,
}

/// The readdir cache.
pub struct Rcache {
    tcache: Mutex<Tcache<RcacheKey, RcachePayload>>,
    pc: PerfCounter,
}

impl Default for Rcache {
    fn default() -> Self {
        Self::new()
    }
}

impl Rcache {
    pub fn new() -> Rcache {
        let mut tcache = Tcache::new(RCACHE_TABLE_SIZE);
        tcache
            .set_info(TcacheOption::EnableExpiration, 0)
            .expect("static default");
        tcache
            .set_info(TcacheOption::SoftLimit, RCACHE_DEFAULT_SOFT_LIMIT)
            .expect("static default");
        tcache
            .set_info(TcacheOption::HardLimit, RCACHE_DEFAULT_HARD_LIMIT)
            .expect("static default");
        tcache
            .set_info(
                TcacheOption::ReclaimPercentage,
                RCACHE_DEFAULT_RECLAIM_PERCENTAGE,
            )
            .expect("static default");
        let rcache = Rcache {
            tcache: Mutex::new(tcache),
            pc: PerfCounter::new(&RCACHE_KEYS),
        };
        publish_params(&rcache.pc, &rcache.tcache.lock());
        rcache
    }

    /// The dirdata index a token position was last served from.
    pub fn get_cached(&self, refn: ObjectRef, token: u64) -> PvfsResult<u32> {
        let key = RcacheKey { refn, token };
        let mut tcache = self.tcache.lock();
        match tcache.lookup(&key) {
            Some((id, _)) => {
                self.pc.count(CacheCounter::Hits.idx(), 1, PerfOp::Add);
                Ok(tcache.payload(id).dirdata_index)
            }
            None => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                Err(PvfsError::ENOENT)
            }
        }
    }

    /// Record the shard a token was served from.  The stream-start
    /// sentinel and the null handle are not cacheable positions.
    pub fn insert(&self, refn: ObjectRef, token: u64, dirdata_index: u32) -> PvfsResult<()> {
        if refn.handle.is_null() || token == ITERATE_START {
            return Err(PvfsError::EINVAL);
        }
        let key = RcacheKey { refn, token };
        let mut tcache = self.tcache.lock();
        let updating = tcache.lookup(&key).is_some();
        let outcome = tcache.insert(key, RcachePayload { dirdata_index });
        if updating {
            self.pc.count(CacheCounter::Updates.idx(), 1, PerfOp::Add);
        }
        count_insert(&self.pc, outcome);
        publish_params(&self.pc, &tcache);
        Ok(())
    }

    /// Drop every token cached for a directory (used when the directory
    /// mutates under a streaming reader).
    pub fn invalidate_dir(&self, refn: ObjectRef) {
        let mut tcache = self.tcache.lock();
        let victims: Vec<RcacheKey> = tcache
            .lru_keys()
            .into_iter()
            .filter(|k| k.refn == refn)
            .copied()
            .collect();
        let mut deleted = 0;
        for key in victims {
            if let Some((id, _)) = tcache.lookup(&key) {
                tcache.delete(id);
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!("rcache: dropped {} tokens for {}", deleted, refn);
            self.pc
                .count(CacheCounter::Deletions.idx(), deleted, PerfOp::Add);
            publish_params(&self.pc, &tcache);
        }
    }

    pub fn set_info(&self, option: TcacheOption, value: u32) -> PvfsResult<()> {
        let mut tcache = self.tcache.lock();
        let ret = tcache.set_info(option, value);
        publish_params(&self.pc, &tcache);
        ret
    }

    pub fn get_info(&self, option: TcacheOption) -> u32 {
        self.tcache.lock().get_info(option)
    }

    pub fn perf_counter(&self) -> &PerfCounter {
        &self.pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handle;

    fn refn(h: u128) -> ObjectRef {
        ObjectRef::new(Handle(h), 5)
    }

    #[test]
    fn token_round_trip() {
        let rcache = Rcache::new();
        rcache.insert(refn(1), 100, 3).unwrap();
        assert_eq!(rcache.get_cached(refn(1), 100).unwrap(), 3);
        assert_eq!(
            rcache.get_cached(refn(1), 200).unwrap_err(),
            PvfsError::ENOENT
        );
    }

    #[test]
    fn sentinel_and_null_rejected() {
        let rcache = Rcache::new();
        assert_eq!(
            rcache.insert(refn(1), ITERATE_START, 0).unwrap_err(),
            PvfsError::EINVAL
        );
        assert_eq!(
            rcache.insert(refn(0), 5, 0).unwrap_err(),
            PvfsError::EINVAL
        );
        assert_eq!(rcache.get_info(TcacheOption::NumEntries), 0);
    }

    #[test]
    fn entries_never_expire() {
        let rcache = Rcache::new();
        rcache.insert(refn(1), 100, 3).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        // timeout is irrelevant with expiration off
        assert_eq!(rcache.get_cached(refn(1), 100).unwrap(), 3);
    }

    #[test]
    fn hard_limit_evicts_lru() {
        let rcache = Rcache::new();
        rcache.set_info(TcacheOption::SoftLimit, 2).unwrap();
        rcache.set_info(TcacheOption::HardLimit, 2).unwrap();
        rcache.insert(refn(1), 1, 0).unwrap();
        rcache.insert(refn(1), 2, 1).unwrap();
        rcache.insert(refn(1), 3, 2).unwrap();
        assert_eq!(rcache.get_info(TcacheOption::NumEntries), 2);
        assert!(rcache.get_cached(refn(1), 1).is_err());
        assert_eq!(
            rcache.perf_counter().current(CacheCounter::Replacements.idx()),
            1
        );
    }

    #[test]
    fn invalidate_dir_drops_all_tokens() {
        let rcache = Rcache::new();
        rcache.insert(refn(1), 1, 0).unwrap();
        rcache.insert(refn(1), 2, 1).unwrap();
        rcache.insert(refn(2), 1, 0).unwrap();
        rcache.invalidate_dir(refn(1));
        assert!(rcache.get_cached(refn(1), 1).is_err());
        assert!(rcache.get_cached(refn(1), 2).is_err());
        assert_eq!(rcache.get_cached(refn(2), 1).unwrap(), 0);
    }
}
