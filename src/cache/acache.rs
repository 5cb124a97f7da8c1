//! Attribute cache (acache).
//!
//! Two tcache instances kept strictly in sync: a dynamic half holding
//! attributes and logical sizes on a short timeout, and a static half
//! holding the long-lived fields (object type, distribution, datafile
//! array) on a timeout modeled after the server's handle recycle time.
//! A getattr that only needs distribution info pays no network cost
//! after the first fetch.

use log::debug;
use parking_lot::Mutex;

use crate::cache::{count_insert, publish_params, CacheCounter};
use crate::perf::{PerfCounter, PerfKey, PerfOp};
use crate::tcache::{Tcache, TcacheOption};
use crate::types::{AttrMask, AttrObject, Distribution, Handle, ObjectAttr, ObjectRef, ObjectType};

const ACACHE_DEFAULT_TIMEOUT_MSECS: u32 = 5000;
const ACACHE_DEFAULT_SOFT_LIMIT: u32 = 5120;
const ACACHE_DEFAULT_HARD_LIMIT: u32 = 10240;
const ACACHE_DEFAULT_RECLAIM_PERCENTAGE: u32 = 25;

/// Modeled after the server's default handle purgatory time.
const STATIC_ACACHE_DEFAULT_TIMEOUT_MSECS: u32 = 360_000;

static ACACHE_KEYS: [PerfKey; CacheCounter::COUNT] = [
    PerfKey { name: "ACACHE_NUM_ENTRIES", preserve: true },
    PerfKey { name: "ACACHE_SOFT_LIMIT", preserve: true },
    PerfKey { name: "ACACHE_HARD_LIMIT", preserve: true },
    PerfKey { name: "ACACHE_HITS", preserve: false },
    PerfKey { name: "ACACHE_MISSES", preserve: false },
    PerfKey { name: "ACACHE_UPDATES", preserve: false },
    PerfKey { name: "ACACHE_PURGES", preserve: false },
    PerfKey { name: "ACACHE_REPLACEMENTS", preserve: false },
    PerfKey { name: "ACACHE_DELETIONS", preserve: false },
    PerfKey { name: "ACACHE_ENABLED", preserve: true },
];

static STATIC_ACACHE_KEYS: [PerfKey; CacheCounter::COUNT] = [
    PerfKey { name: "STATIC_ACACHE_NUM_ENTRIES", preserve: true },
    PerfKey { name: "STATIC_ACACHE_SOFT_LIMIT", preserve: true },
    PerfKey { name: "STATIC_ACACHE_HARD_LIMIT", preserve: true },
    PerfKey { name: "STATIC_ACACHE_HITS", preserve: false },
    PerfKey { name: "STATIC_ACACHE_MISSES", preserve: false },
    PerfKey { name: "STATIC_ACACHE_UPDATES", preserve: false },
    PerfKey { name: "STATIC_ACACHE_PURGES", preserve: false },
    PerfKey { name: "STATIC_ACACHE_REPLACEMENTS", preserve: false },
    PerfKey { name: "STATIC_ACACHE_DELETIONS", preserve: false },
    PerfKey { name: "STATIC_ACACHE_ENABLED", preserve: true },
];

/// Dynamic half: attributes and logical size, each independently valid.
struct DynamicPayload {
    attr: Option<ObjectAttr>,
    size: Option<i64>,
}

/// Static half: the fields that only change when the handle is
/// recycled.
struct StaticPayload {
    mask: AttrMask,
    objtype: ObjectType,
    dist: Option<Distribution>,
    dfiles: Vec<Handle>,
}

/// Which half an option addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcacheScope {
    Dynamic,
    Static,
}

/// Result of a cache probe: whatever fields were fresh, with `mask`
/// naming them.  The caller checks the mask against what it needs.
#[derive(Clone, Debug, Default)]
pub struct CachedAttrs {
    pub attr: Option<ObjectAttr>,
    pub size: Option<i64>,
    /// The union of fresh attribute bits (including `SIZE`).
    pub mask: AttrMask,
}

struct Halves {
    dynamic: Tcache<ObjectRef, DynamicPayload>,
    stat: Tcache<ObjectRef, StaticPayload>,
}

/// The attribute cache.
pub struct Acache {
    halves: Mutex<Halves>,
    pc: PerfCounter,
    static_pc: PerfCounter,
}

impl Default for Acache {
    fn default() -> Self {
        Self::new()
    }
}

impl Acache {
    pub fn new() -> Acache {
        fn set_defaults<P>(cache: &mut Tcache<ObjectRef, P>, timeout_ms: u32) {
            cache
                .set_info(TcacheOption::TimeoutMsecs, timeout_ms)
                .expect("static default");
            cache
                .set_info(TcacheOption::SoftLimit, ACACHE_DEFAULT_SOFT_LIMIT)
                .expect("static default");
            cache
                .set_info(TcacheOption::HardLimit, ACACHE_DEFAULT_HARD_LIMIT)
                .expect("static default");
            cache
                .set_info(
                    TcacheOption::ReclaimPercentage,
                    ACACHE_DEFAULT_RECLAIM_PERCENTAGE,
                )
                .expect("static default");
        }
        let mut dynamic = Tcache::new(0);
        let mut stat = Tcache::new(0);
        set_defaults(&mut dynamic, ACACHE_DEFAULT_TIMEOUT_MSECS);
        set_defaults(&mut stat, STATIC_ACACHE_DEFAULT_TIMEOUT_MSECS);
        let acache = Acache {
            halves: Mutex::new(Halves { dynamic, stat }),
            pc: PerfCounter::new(&ACACHE_KEYS),
            static_pc: PerfCounter::new(&STATIC_ACACHE_KEYS),
        };
        {
            let halves = acache.halves.lock();
            publish_params(&acache.pc, &halves.dynamic);
            publish_params(&acache.static_pc, &halves.stat);
        }
        acache
    }

    /// Probe both halves for a reference.  Returns `None` only when
    /// nothing at all was fresh; otherwise the returned mask names the
    /// fresh fields.
    pub fn get_cached(&self, refn: ObjectRef) -> Option<CachedAttrs> {
        let mut halves = self.halves.lock();
        let mut out = CachedAttrs::default();

        let static_hit = match halves.stat.lookup(&refn) {
            Some((id, false)) => {
                self.static_pc.count(CacheCounter::Hits.idx(), 1, PerfOp::Add);
                let sp = halves.stat.payload(id);
                out.mask |= sp.mask;
                Some((sp.mask, sp.objtype, sp.dist.clone(), sp.dfiles.clone()))
            }
            _ => {
                self.static_pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                debug!("acache: static miss: {}", refn);
                None
            }
        };

        match halves.dynamic.lookup(&refn) {
            Some((id, false)) => {
                self.pc.count(CacheCounter::Hits.idx(), 1, PerfOp::Add);
                let payload = halves.dynamic.payload(id);
                if let Some(attr) = &payload.attr {
                    out.mask |= attr.mask;
                    out.attr = Some(attr.clone());
                }
                if let Some(size) = payload.size {
                    out.mask |= AttrMask::SIZE;
                    out.size = Some(size);
                }
            }
            _ => {
                self.pc.count(CacheCounter::Misses.idx(), 1, PerfOp::Add);
                debug!("acache: dynamic miss: {}", refn);
            }
        }

        if let Some((mask, objtype, dist, dfiles)) = static_hit {
            let attr = out.attr.get_or_insert_with(ObjectAttr::default);
            attr.mask |= mask;
            overlay_static(attr, mask, objtype, dist, dfiles);
        }

        if out.mask.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Install fresh attributes, atomically copying the static bits
    /// into the static half and the dynamic bits into the dynamic half.
    /// An existing entry is refreshed in place (an UPDATE, not a
    /// REPLACEMENT).
    pub fn update(&self, refn: ObjectRef, attr: &ObjectAttr, size: Option<i64>) {
        let mut halves = self.halves.lock();
        debug!("acache: update: {} mask={:?}", refn, attr.mask);

        let (dynamic_attr, static_payload) = split_attr(attr);

        let updating = halves.dynamic.lookup(&refn).is_some();
        let outcome = halves.dynamic.insert(
            refn,
            DynamicPayload {
                attr: Some(dynamic_attr),
                size,
            },
        );
        if updating {
            self.pc.count(CacheCounter::Updates.idx(), 1, PerfOp::Add);
        }
        count_insert(&self.pc, outcome);

        if let Some(payload) = static_payload {
            let updating = halves.stat.lookup(&refn).is_some();
            let outcome = halves.stat.insert(refn, payload);
            if updating {
                self.static_pc.count(CacheCounter::Updates.idx(), 1, PerfOp::Add);
            }
            count_insert(&self.static_pc, outcome);
        }

        self.publish(&halves);
    }

    /// Drop both halves for a reference.  Called on any failed getattr
    /// above this layer.
    pub fn invalidate(&self, refn: ObjectRef) {
        let mut halves = self.halves.lock();
        if let Some((id, _)) = halves.dynamic.lookup(&refn) {
            halves.dynamic.delete(id);
            self.pc.count(CacheCounter::Deletions.idx(), 1, PerfOp::Add);
        }
        if let Some((id, _)) = halves.stat.lookup(&refn) {
            halves.stat.delete(id);
            self.static_pc.count(CacheCounter::Deletions.idx(), 1, PerfOp::Add);
        }
        self.publish(&halves);
    }

    /// Clear only the cached logical size, leaving the rest of the
    /// entry intact.  Used after writes and truncates.
    pub fn invalidate_size(&self, refn: ObjectRef) {
        let mut halves = self.halves.lock();
        if let Some((id, _)) = halves.dynamic.lookup(&refn) {
            halves.dynamic.payload_mut(id).size = None;
        }
    }

    pub fn set_info(&self, scope: AcacheScope, option: TcacheOption, value: u32) -> crate::error::PvfsResult<()> {
        let mut halves = self.halves.lock();
        let ret = match scope {
            AcacheScope::Dynamic => halves.dynamic.set_info(option, value),
            AcacheScope::Static => halves.stat.set_info(option, value),
        };
        self.publish(&halves);
        ret
    }

    pub fn get_info(&self, scope: AcacheScope, option: TcacheOption) -> u32 {
        let halves = self.halves.lock();
        match scope {
            AcacheScope::Dynamic => halves.dynamic.get_info(option),
            AcacheScope::Static => halves.stat.get_info(option),
        }
    }

    pub fn perf_counter(&self) -> &PerfCounter {
        &self.pc
    }

    pub fn static_perf_counter(&self) -> &PerfCounter {
        &self.static_pc
    }

    fn publish(&self, halves: &Halves) {
        publish_params(&self.pc, &halves.dynamic);
        publish_params(&self.static_pc, &halves.stat);
    }
}

/// Split full attributes into the dynamic copy and (when any static bit
/// is present) the static payload.
fn split_attr(attr: &ObjectAttr) -> (ObjectAttr, Option<StaticPayload>) {
    let static_mask = attr.static_mask();
    let mut dynamic = attr.clone();
    // size freshness is tracked by the payload's own size slot
    dynamic.mask = attr.dynamic_mask() - AttrMask::SIZE;
    if let AttrObject::Metafile {
        dist,
        dfiles,
        ..
    } = &mut dynamic.object
    {
        // the static half owns these
        *dist = None;
        dfiles.clear();
    }

    if static_mask.is_empty() {
        return (dynamic, None);
    }
    let (dist, dfiles) = match &attr.object {
        AttrObject::Metafile { dist, dfiles, .. } => (dist.clone(), dfiles.clone()),
        _ => (None, Vec::new()),
    };
    let payload = StaticPayload {
        mask: static_mask,
        objtype: attr.object.object_type(),
        dist,
        dfiles,
    };
    (dynamic, Some(payload))
}

fn overlay_static(
    attr: &mut ObjectAttr,
    mask: AttrMask,
    objtype: ObjectType,
    dist: Option<Distribution>,
    dfiles: Vec<Handle>,
) {
    if mask.contains(AttrMask::DISTRIBUTION) || mask.contains(AttrMask::DFILES) {
        let dist_size = dist.as_ref().map(|d| d.size()).unwrap_or(0);
        match &mut attr.object {
            AttrObject::Metafile {
                dist: d,
                dfiles: df,
                dist_size: ds,
                ..
            } => {
                *d = dist;
                *df = dfiles;
                *ds = dist_size;
            }
            object => {
                *object = AttrObject::Metafile {
                    dist,
                    dfiles,
                    dist_size,
                    stuffed_size: 0,
                    flags: 0,
                };
            }
        }
    } else if mask.contains(AttrMask::TYPE) && attr.object.object_type() == ObjectType::None {
        attr.object = match objtype {
            ObjectType::Directory => AttrObject::Directory {
                dirent_count: 0,
                hint: None,
            },
            ObjectType::Datafile => AttrObject::Datafile { size: 0 },
            ObjectType::Symlink => AttrObject::Symlink {
                target: String::new(),
            },
            ObjectType::Metafile => AttrObject::Metafile {
                dist: None,
                dfiles: Vec::new(),
                dist_size: 0,
                stuffed_size: 0,
                flags: 0,
            },
            ObjectType::DirData => AttrObject::DirData,
            ObjectType::Internal => AttrObject::Internal,
            ObjectType::None => AttrObject::None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permissions;

    fn refn(h: u128) -> ObjectRef {
        ObjectRef::new(Handle(h), 42)
    }

    fn meta_attr() -> ObjectAttr {
        ObjectAttr {
            owner: 100,
            group: 200,
            perms: Permissions::OWNER_READ | Permissions::OWNER_WRITE,
            atime: 1,
            mtime: 2,
            ctime: 3,
            mask: AttrMask::COMMON | AttrMask::SIZE | AttrMask::DISTRIBUTION | AttrMask::DFILES,
            object: AttrObject::Metafile {
                dist: Some(Distribution {
                    name: "simple_stripe".into(),
                    params: vec![0, 1, 2, 3],
                }),
                dfiles: vec![Handle(11), Handle(12)],
                dist_size: 0,
                stuffed_size: 0,
                flags: 0,
            },
        }
    }

    #[test]
    fn update_then_get_everything() {
        let acache = Acache::new();
        acache.update(refn(7), &meta_attr(), Some(1024));
        let cached = acache.get_cached(refn(7)).unwrap();
        assert!(cached.mask.contains(AttrMask::UID));
        assert!(cached.mask.contains(AttrMask::SIZE));
        assert!(cached.mask.contains(AttrMask::DFILES));
        assert_eq!(cached.size, Some(1024));
        let attr = cached.attr.unwrap();
        assert_eq!(attr.owner, 100);
        match attr.object {
            AttrObject::Metafile { dfiles, dist, .. } => {
                assert_eq!(dfiles, vec![Handle(11), Handle(12)]);
                assert_eq!(dist.unwrap().name, "simple_stripe");
            }
            other => panic!("expected metafile attrs, got {other:?}"),
        }
    }

    #[test]
    fn size_bit_invalidation() {
        let acache = Acache::new();
        acache.update(refn(7), &meta_attr(), Some(1024));
        acache.invalidate_size(refn(7));
        let cached = acache.get_cached(refn(7)).unwrap();
        // uid still fresh, size no longer reported
        assert!(cached.mask.contains(AttrMask::UID));
        assert!(!cached.mask.contains(AttrMask::SIZE));
        assert_eq!(cached.size, None);
    }

    #[test]
    fn static_half_survives_dynamic_expiry() {
        let acache = Acache::new();
        // dynamic half expires immediately, static half does not
        acache
            .set_info(AcacheScope::Dynamic, TcacheOption::TimeoutMsecs, 1)
            .unwrap();
        acache.update(refn(9), &meta_attr(), None);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let cached = acache.get_cached(refn(9)).unwrap();
        assert!(cached.mask.contains(AttrMask::DFILES));
        assert!(!cached.mask.contains(AttrMask::UID));
    }

    #[test]
    fn invalidate_clears_both_halves() {
        let acache = Acache::new();
        acache.update(refn(7), &meta_attr(), Some(10));
        acache.invalidate(refn(7));
        assert!(acache.get_cached(refn(7)).is_none());
        assert_eq!(
            acache.perf_counter().current(CacheCounter::Deletions.idx()),
            1
        );
        assert_eq!(
            acache
                .static_perf_counter()
                .current(CacheCounter::Deletions.idx()),
            1
        );
    }

    #[test]
    fn update_counts_update_not_replacement() {
        let acache = Acache::new();
        acache.update(refn(7), &meta_attr(), Some(1));
        acache.update(refn(7), &meta_attr(), Some(2));
        let pc = acache.perf_counter();
        assert_eq!(pc.current(CacheCounter::Updates.idx()), 1);
        assert_eq!(pc.current(CacheCounter::Replacements.idx()), 0);
        assert_eq!(pc.current(CacheCounter::NumEntries.idx()), 1);
        assert_eq!(acache.get_cached(refn(7)).unwrap().size, Some(2));
    }

    #[test]
    fn hit_and_miss_counters() {
        let acache = Acache::new();
        assert!(acache.get_cached(refn(1)).is_none());
        acache.update(refn(1), &meta_attr(), None);
        acache.get_cached(refn(1)).unwrap();
        let pc = acache.perf_counter();
        assert_eq!(pc.current(CacheCounter::Misses.idx()), 1);
        assert_eq!(pc.current(CacheCounter::Hits.idx()), 1);
    }
}
