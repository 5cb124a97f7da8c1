//! The client caches.
//!
//! Four specialized caches layered on the [`crate::tcache`] substrate:
//! attributes ([`acache`]), names ([`ncache`]), readdir tokens
//! ([`rcache`]) and capabilities ([`capcache`]).  Each owns its tcache
//! instance(s) behind a mutex and a rolling perf counter with the
//! standard key set below.

pub mod acache;
pub mod capcache;
pub mod ncache;
pub mod rcache;

pub use acache::Acache;
pub use capcache::Capcache;
pub use ncache::Ncache;
pub use rcache::Rcache;

use crate::perf::{PerfCounter, PerfOp};
use crate::tcache::{CacheKey, Inserted, Tcache, TcacheOption};
use crate::types::ObjectRef;

/// Counter slots every cache exposes, in matrix order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum CacheCounter {
    NumEntries = 0,
    SoftLimit = 1,
    HardLimit = 2,
    Hits = 3,
    Misses = 4,
    Updates = 5,
    Purges = 6,
    Replacements = 7,
    Deletions = 8,
    Enabled = 9,
}

impl CacheCounter {
    pub const COUNT: usize = 10;

    pub fn idx(self) -> usize {
        self as usize
    }
}

impl CacheKey for ObjectRef {
    fn bucket(&self, table_size: usize) -> usize {
        let h = self.handle.lo() ^ self.handle.hi().rotate_left(17) ^ self.fs_id as u64;
        (h % table_size as u64) as usize
    }
}

/// Record an insert outcome (purges from the reclaim sweep, the
/// hard-limit replacement) on a cache's counter.
pub(crate) fn count_insert(pc: &PerfCounter, outcome: Inserted) {
    if outcome.purged > 0 {
        pc.count(CacheCounter::Purges.idx(), outcome.purged as i64, PerfOp::Add);
    }
    if outcome.replaced {
        pc.count(CacheCounter::Replacements.idx(), 1, PerfOp::Add);
    }
}

/// Publish the size-class values (entry count, limits, enable flag)
/// onto the preserved counter rows.
pub(crate) fn publish_params<K: CacheKey, P>(pc: &PerfCounter, tcache: &Tcache<K, P>) {
    pc.count(
        CacheCounter::NumEntries.idx(),
        tcache.num_entries() as i64,
        PerfOp::Set,
    );
    pc.count(
        CacheCounter::SoftLimit.idx(),
        tcache.get_info(TcacheOption::SoftLimit) as i64,
        PerfOp::Set,
    );
    pc.count(
        CacheCounter::HardLimit.idx(),
        tcache.get_info(TcacheOption::HardLimit) as i64,
        PerfOp::Set,
    );
    pc.count(
        CacheCounter::Enabled.idx(),
        tcache.get_info(TcacheOption::Enable) as i64,
        PerfOp::Set,
    );
}
