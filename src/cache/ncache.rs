//! Name cache (ncache).
//!
//! Maps `(parent, entry name)` pairs to object references so hot-path
//! lookups skip the network.  The default timeout is deliberately short
//! (names are the most volatile binding in the namespace) and can be
//! overridden with the `PVFS2_NCACHE_TIMEOUT` environment variable, in
//! milliseconds.

use std::env;

use log::debug;
use parking_lot::Mutex;

use crate::cache::{count_insert, publish_params, CacheCounter};
use crate::error::{PvfsError, PvfsResult};
use crate::perf::{PerfCounter, PerfKey, PerfOp};
use crate::tcache::{CacheKey, Tcache, TcacheOption};
use crate::types::ObjectRef;

const NCACHE_DEFAULT_TIMEOUT_MSECS: u32 = 3000;
const NCACHE_DEFAULT_SOFT_LIMIT: u32 = 5120;
const NCACHE_DEFAULT_HARD_LIMIT: u32 = 10240;
const NCACHE_DEFAULT_RECLAIM_PERCENTAGE: u32 = 25;

static NCACHE_KEYS: [PerfKey; CacheCounter::COUNT] = [
    PerfKey { name: "NCACHE_NUM_ENTRIES", preserve: true },
    PerfKey { name: "NCACHE_SOFT_LIMIT", preserve: true },
    PerfKey { name: "NCACHE_HARD_LIMIT", preserve: true },
    PerfKey { name: "NCACHE_HITS", preserve: false },
    PerfKey { name: "NCACHE_MISSES", preserve: false },
    PerfKey { name: "NCACHE_UPDATES", preserve: false },
    PerfKey { name: "NCACHE_PURGES", preserve: false },
    PerfKey { name: "NCACHE_REPLACEMENTS", preserve: false },
    PerfKey { name: "NCACHE_DELETIONS", preserve: false },
    PerfKey { name: "NCACHE_ENABLED", preserve: true },
];

#[derive(PartialEq, Eq, Debug, Clone)]
struct NcacheKey {
    parent: ObjectRef,
    name: String,
}

impl CacheKey for NcacheKey {
    // FNV-1a over the parent reference and the name bytes.  (The
    // original used a sum of name bytes; any real string hash keeps the
    // observable semantics.)
    fn bucket(&self, table_size: usize) -> usize {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = FNV_OFFSET;
        for chunk in [
            self.parent.handle.lo(),
            self.parent.handle.hi(),
            self.parent.fs_id as u64,
        ] {
            for byte in chunk.to_le_bytes() {
                h = (h ^ byte as u64).wrapping_mul(FNV_PRIME);
            }
        }
        for byte in self.name.as_bytes() {
            h = (h ^ *byte as u64).wrapping_mul(FNV_PRIME);
        }
        (h % table_size as u64) as usize
    }
}

struct NcachePayload {
    entry: ObjectRef,
}

/// The name cache.
pub struct Ncache {
    tcache: Mutex<Tcache<NcacheKey, NcachePayload>>,
    pc: PerfCounter,
}

impl Default for Ncache {
    fn default() -> Self {
        Self::new()
    }
}

impl Ncache {
    pub fn new() -> Ncache {
        let timeout = env::var("PVFS2_NCACHE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(NCACHE_DEFAULT_TIMEOUT_MSECS);
        let mut tcache = Tcache::new(0);
        tcache
            .set_info(TcacheOption::TimeoutMsecs, timeout)
            .expect("static default");
        tcache
            .set_info(TcacheOption::SoftLimit, NCACHE_DEFAULT_SOFT_LIMIT)
            .expect("static default");
        tcache
            .set_info(TcacheOption::HardLimit, NCACHE_DEFAULT_HARD_LIMIT)
            .expect("static default");
        tcache
            .set_info(
                TcacheOption::ReclaimPercentage,
                NCACHE_DEFAULT_RECLAIM_PERCENTAGE,
            )
            .expect("static default");
        let ncache = Ncache {
            tcache: Mutex::new(tcache),
            pc: PerfCounter::new(&NCACHE_KEYS),
        };
        publish_params(&ncache.pc, &ncache.tcache.lock());
        ncache
    }

    /// Resolve a name under a parent.  `ETIME` marks a resident but
    /// expired binding (the entry stays until refreshed or evicted);
    /// `ENOENT` a plain miss.
    pub fn get_cached(&self, parent: ObjectRef, name: &str) -> PvfsResult<ObjectRef> {
        let key = NcacheKey {
            parent,
            name: name.to_owned(),
        };
        let mut tcache = self.tcache.lock();
        match tcache.lookup(&key) {
            Some((id, false)) => {
                self.pc.count(CacheCounter::Hits.idx(), 1, PerfOp::Add);
                Ok(tcache.payload(id).entry)
            }
            Some((_, true)) => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                debug!("ncache: expired: {:?} under {}", name, parent);
                Err(PvfsError::ETIME)
            }
            None => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                Err(PvfsError::ENOENT)
            }
        }
    }

    /// Install or refresh a binding.  The name is copied; the cache
    /// owns its keys.
    pub fn update(&self, parent: ObjectRef, name: &str, entry: ObjectRef) {
        let key = NcacheKey {
            parent,
            name: name.to_owned(),
        };
        let mut tcache = self.tcache.lock();
        let updating = tcache.lookup(&key).is_some();
        let outcome = tcache.insert(key, NcachePayload { entry });
        if updating {
            self.pc.count(CacheCounter::Updates.idx(), 1, PerfOp::Add);
        }
        count_insert(&self.pc, outcome);
        publish_params(&self.pc, &tcache);
    }

    /// Drop a binding without waiting for expiration.
    pub fn invalidate(&self, parent: ObjectRef, name: &str) {
        let key = NcacheKey {
            parent,
            name: name.to_owned(),
        };
        let mut tcache = self.tcache.lock();
        if let Some((id, _)) = tcache.lookup(&key) {
            tcache.delete(id);
            self.pc.count(CacheCounter::Deletions.idx(), 1, PerfOp::Add);
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
