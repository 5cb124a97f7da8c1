//! Client capability cache (capcache).
//!
//! Caches server-issued capabilities keyed by `(object, user)`.  The
//! entry expiration is `min(capability timeout, now + cache timeout)`
//! minus a safety buffer, so a capability handed out by the cache is
//! never about to expire on the wire.  An already-expired capability is
//! refused at update time.

use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::cache::{count_insert, publish_params, CacheCounter};
use crate::error::{PvfsError, PvfsResult};
use crate::perf::{PerfCounter, PerfKey, PerfOp};
use crate::tcache::{CacheKey, Tcache, TcacheOption};
use crate::types::{epoch_secs, Capability, ObjectRef};

/// Safety margin, in seconds, between an entry's expiration in the
/// cache and the capability's own timeout.
pub const CAPCACHE_TIMEOUT_BUFFER_SECS: i64 = 5;

const CAPCACHE_DEFAULT_TIMEOUT_MSECS: u32 = 600_000;
const CAPCACHE_DEFAULT_SOFT_LIMIT: u32 = 5120;
const CAPCACHE_DEFAULT_HARD_LIMIT: u32 = 10240;
const CAPCACHE_DEFAULT_RECLAIM_PERCENTAGE: u32 = 25;

static CAPCACHE_KEYS: [PerfKey; CacheCounter::COUNT] = [
    PerfKey { name: "CLIENT_CAPCACHE_NUM_ENTRIES", preserve: true },
    PerfKey { name: "CLIENT_CAPCACHE_SOFT_LIMIT", preserve: true },
    PerfKey { name: "CLIENT_CAPCACHE_HARD_LIMIT", preserve: true },
    PerfKey { name: "CLIENT_CAPCACHE_HITS", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_MISSES", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_UPDATES", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_PURGES", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_REPLACEMENTS", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_DELETIONS", preserve: false },
    PerfKey { name: "CLIENT_CAPCACHE_ENABLED", preserve: true },
];

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
struct CapcacheKey {
    refn: ObjectRef,
    uid: u32,
}

impl CacheKey for CapcacheKey {
    fn bucket(&self, table_size: usize) -> usize {
        let h = self.refn.handle.lo()
            ^ self.refn.handle.hi().rotate_left(13)
            ^ (self.refn.fs_id as u64).rotate_left(29)
            ^ (self.uid as u64).rotate_left(43);
        (h % table_size as u64) as usize
    }
}

struct CapcachePayload {
    capability: Capability,
}

/// The client capability cache.
pub struct Capcache {
    tcache: Mutex<Tcache<CapcacheKey, CapcachePayload>>,
    pc: PerfCounter,
}

impl Default for Capcache {
    fn default() -> Self {
        Self::new()
    }
}

impl Capcache {
    pub fn new() -> Capcache {
        let mut tcache = Tcache::new(0);
        tcache
            .set_info(TcacheOption::TimeoutMsecs, CAPCACHE_DEFAULT_TIMEOUT_MSECS)
            .expect("static default");
        tcache
            .set_info(TcacheOption::SoftLimit, CAPCACHE_DEFAULT_SOFT_LIMIT)
            .expect("static default");
        tcache
            .set_info(TcacheOption::HardLimit, CAPCACHE_DEFAULT_HARD_LIMIT)
            .expect("static default");
        tcache
            .set_info(
                TcacheOption::ReclaimPercentage,
                CAPCACHE_DEFAULT_RECLAIM_PERCENTAGE,
            )
            .expect("static default");
        let capcache = Capcache {
            tcache: Mutex::new(tcache),
            pc: PerfCounter::new(&CAPCACHE_KEYS),
        };
        publish_params(&capcache.pc, &capcache.tcache.lock());
        capcache
    }

    /// A cached capability for `(object, uid)`.  Anything returned
    /// satisfies `now <= capability.timeout`; a stale hit is reported
    /// as `ETIME` and left for the reclaim sweep.
    pub fn get_cached(&self, refn: ObjectRef, uid: u32) -> PvfsResult<Capability> {
        let key = CapcacheKey { refn, uid };
        let mut tcache = self.tcache.lock();
        match tcache.lookup(&key) {
            Some((id, false)) => {
                let cap = &tcache.payload(id).capability;
                if cap.is_expired(epoch_secs()) {
                    // entry not yet expired but the capability itself is
                    self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                    return Err(PvfsError::ETIME);
                }
                self.pc.count(CacheCounter::Hits.idx(), 1, PerfOp::Add);
                Ok(cap.clone())
            }
            Some((_, true)) => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                Err(PvfsError::ETIME)
            }
            None => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                Err(PvfsError::ENOENT)
            }
        }
    }

    /// Cache a capability.  The copy keeps both the handle array and
    /// the signature bytes.  An expired capability is refused with
    /// `ETIME`.
    pub fn update(&self, refn: ObjectRef, uid: u32, capability: &Capability) -> PvfsResult<()> {
        let now_secs = epoch_secs();
        if capability.is_expired(now_secs) {
            debug!(
                "capcache: refusing expired capability for {} (timeout {})",
                refn, capability.timeout
            );
            return Err(PvfsError::ETIME);
        }

        let mut tcache = self.tcache.lock();

        // entry expiration: cache timeout capped by the capability's
        // own lifetime, less the safety buffer
        let cache_timeout_secs = (tcache.timeout().as_millis() / 1000) as i64;
        let buffer = CAPCACHE_TIMEOUT_BUFFER_SECS.min(cache_timeout_secs);
        let expire_at_secs = (now_secs + cache_timeout_secs).min(capability.timeout) - buffer;
        let lifetime = (expire_at_secs - now_secs).max(0);
        let expiration = Instant::now() + Duration::from_secs(lifetime as u64);

        let key = CapcacheKey { refn, uid };
        let updating = tcache.lookup(&key).is_some();
        let outcome = tcache.insert_with_expiration(
            key,
            CapcachePayload {
                capability: capability.clone(),
            },
            expiration,
        );
        if updating {
            self.pc.count(CacheCounter::Updates.idx(), 1, PerfOp::Add);
        }
        count_insert(&self.pc, outcome);
        publish_params(&self.pc, &tcache);
        Ok(())
    }

    /// Drop the capability for `(object, uid)`.
    pub fn invalidate(&self, refn: ObjectRef, uid: u32) {
        let key = CapcacheKey { refn, uid };
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
