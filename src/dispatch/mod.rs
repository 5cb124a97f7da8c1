//! The upcall dispatcher (client core).
//!
//! Owns everything with a lifecycle: the device, the shared regions,
//! the caches, the operation manager, its context, the unexpected-
//! message slots and the mount table.  The main loop is a cooperative
//! testsome/service/repost cycle on a single thread; worker threads
//! only run service callouts against the system interface.  Suspension
//! points are the completion test, the device read, and mutexes briefly
//! contended by workers.

pub mod mount;
pub mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cache::{Acache, Capcache, Ncache, Rcache};
use crate::cache::acache::AcacheScope;
use crate::context::{Completion, CompletionContext, ContextSet, OpId, UserToken};
use crate::dev::{aligned_sub_buf, DeviceChannel, SharedRegion};
use crate::dev::{
    DEFAULT_IO_DESC_COUNT, DEFAULT_IO_DESC_SIZE, DEFAULT_READDIR_DESC_COUNT,
    DEFAULT_READDIR_DESC_SIZE,
};
use crate::error::{PvfsError, PvfsResult};
use crate::hints::HintSet;
use crate::manager::{Manager, Posted, QueueId, ServiceFn, Target, WorkerKind};
use crate::perf::PerfCounter;
use crate::proto::{
    self, encode_dirents, Dirent, Downcall, IoType, Opcode, ParamCmd, ParamId, PerfCountKind,
    pvfs_upcall_header, put_str, IOX_HINDEXED_COUNT, MAX_NUM_OPS, SLOT_BUFFER_SIZE,
};
use crate::security::{CredentialFactory, RsaSha1Signer};
use crate::sysint::{
    Extent, IoKind, MountResult, ReaddirPlusResult, ReaddirResult, ServerOps, StatfsResult,
};
use crate::tcache::TcacheOption;
use crate::types::{AttrMask, AttrObject, Credential, ObjectAttr, ObjectRef};

use self::mount::{parse_mount_uri, MountTable};
use self::request::{decode, DecodeError, VfsRequest};

/// In-progress hash width (small-prime chaining in the original; a
/// pre-sized std map here).
const OPS_IN_PROGRESS_BUCKETS: usize = 67;

/// Dispatcher configuration, assembled from the CLI surface.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub io_desc_count: usize,
    pub io_desc_size: usize,
    pub readdir_desc_count: usize,
    pub readdir_desc_size: usize,
    pub acache_timeout_ms: Option<u32>,
    pub acache_soft_limit: Option<u32>,
    pub acache_hard_limit: Option<u32>,
    pub acache_reclaim_percentage: Option<u32>,
    pub ncache_timeout_ms: Option<u32>,
    pub ncache_soft_limit: Option<u32>,
    pub ncache_hard_limit: Option<u32>,
    pub ncache_reclaim_percentage: Option<u32>,
    pub perf_time_interval_secs: Option<u64>,
    pub perf_history_size: Option<usize>,
    pub key_file: Option<std::path::PathBuf>,
    /// Threads in the system-interface service pool.
    pub worker_threads: usize,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            io_desc_count: DEFAULT_IO_DESC_COUNT,
            io_desc_size: DEFAULT_IO_DESC_SIZE,
            readdir_desc_count: DEFAULT_READDIR_DESC_COUNT,
            readdir_desc_size: DEFAULT_READDIR_DESC_SIZE,
            acache_timeout_ms: None,
            acache_soft_limit: None,
            acache_hard_limit: None,
            acache_reclaim_percentage: None,
            ncache_timeout_ms: None,
            ncache_soft_limit: None,
            ncache_hard_limit: None,
            ncache_reclaim_percentage: None,
            perf_time_interval_secs: None,
            perf_history_size: None,
            key_file: None,
            worker_threads: 4,
        }
    }
}

/// The client caches, constructed once at dispatcher startup and owned
/// by the core (no process-wide mutable state).
pub struct Caches {
    pub acache: Acache,
    pub ncache: Ncache,
    pub rcache: Rcache,
    pub capcache: Capcache,
}

impl Caches {
    fn new(config: &CoreConfig) -> PvfsResult<Caches> {
        let caches = Caches {
            acache: Acache::new(),
            ncache: Ncache::new(),
            rcache: Rcache::new(),
            capcache: Capcache::new(),
        };
        if let Some(ms) = config.acache_timeout_ms {
            caches
                .acache
                .set_info(AcacheScope::Dynamic, TcacheOption::TimeoutMsecs, ms)?;
        }
        if let Some(n) = config.acache_soft_limit {
            caches
                .acache
                .set_info(AcacheScope::Dynamic, TcacheOption::SoftLimit, n)?;
            caches
                .acache
                .set_info(AcacheScope::Static, TcacheOption::SoftLimit, n)?;
        }
        if let Some(n) = config.acache_hard_limit {
            caches
                .acache
                .set_info(AcacheScope::Dynamic, TcacheOption::HardLimit, n)?;
            caches
                .acache
                .set_info(AcacheScope::Static, TcacheOption::HardLimit, n)?;
        }
        if let Some(n) = config.acache_reclaim_percentage {
            caches
                .acache
                .set_info(AcacheScope::Dynamic, TcacheOption::ReclaimPercentage, n)?;
        }
        if let Some(ms) = config.ncache_timeout_ms {
            caches.ncache.set_info(TcacheOption::TimeoutMsecs, ms)?;
        }
        if let Some(n) = config.ncache_soft_limit {
            caches.ncache.set_info(TcacheOption::SoftLimit, n)?;
        }
        if let Some(n) = config.ncache_hard_limit {
            caches.ncache.set_info(TcacheOption::HardLimit, n)?;
        }
        if let Some(n) = config.ncache_reclaim_percentage {
            caches
                .ncache
                .set_info(TcacheOption::ReclaimPercentage, n)?;
        }
        if let Some(secs) = config.perf_time_interval_secs {
            caches.set_perf_interval(Duration::from_secs(secs));
        }
        if let Some(n) = config.perf_history_size {
            caches.set_perf_history(n)?;
        }
        Ok(caches)
    }

    fn counters(&self) -> [&PerfCounter; 5] {
        [
            self.acache.perf_counter(),
            self.acache.static_perf_counter(),
            self.ncache.perf_counter(),
            self.rcache.perf_counter(),
            self.capcache.perf_counter(),
        ]
    }

    pub fn set_perf_interval(&self, interval: Duration) {
        for pc in self.counters() {
            pc.set_interval(interval);
        }
    }

    pub fn set_perf_history(&self, history: usize) -> PvfsResult<()> {
        for pc in self.counters() {
            pc.set_history_size(history)?;
        }
        Ok(())
    }

    pub fn reset_counters(&self) {
        for pc in self.counters() {
            pc.reset();
        }
    }

    fn maybe_rollover(&self) {
        for pc in self.counters() {
            pc.maybe_rollover();
        }
    }

    fn perf_text(&self, kind: PerfCountKind) -> String {
        match kind {
            PerfCountKind::Acache => self.acache.perf_counter().text(),
            PerfCountKind::StaticAcache => self.acache.static_perf_counter().text(),
            PerfCountKind::Ncache => self.ncache.perf_counter().text(),
            PerfCountKind::Rcache => self.rcache.perf_counter().text(),
            PerfCountKind::Capcache => self.capcache.perf_counter().text(),
        }
    }
}

/// What a service callout produced, staged in the slot until the main
/// loop encodes the downcall.
#[derive(Debug)]
enum SysResponse {
    Ref(ObjectRef),
    Attr(ObjectAttr),
    Unit,
    Readdir(ReaddirResult),
    ReaddirPlus(ReaddirPlusResult),
    Xattr(Vec<u8>),
    XattrList(Vec<String>),
    Statfs(StatfsResult),
    Mount(MountResult),
    IoAmount(i64),
}

/// One occupied unexpected-message slot.
struct InFlight {
    tag: u64,
    op: Opcode,
    request: VfsRequest,
    response: Arc<Mutex<Option<SysResponse>>>,
    pending: SmallVec<[OpId; 4]>,
    /// Aggregated byte count across iox chunks.
    iox_total: Arc<AtomicI64>,
    first_error: Option<PvfsError>,
    cancelled: bool,
}

/// The client core.
pub struct ClientCore<S: ServerOps> {
    server: Arc<S>,
    dev: Arc<dyn DeviceChannel>,
    pub caches: Arc<Caches>,
    contexts: ContextSet,
    ctx: Arc<CompletionContext>,
    manager: Manager,
    sysint_queue: QueueId,
    slots: Vec<Option<InFlight>>,
    in_progress: HashMap<u64, usize>,
    mounts: MountTable,
    hints: HintSet,
    creds: CredentialFactory,
    io_region: Arc<SharedRegion>,
    readdir_region: Arc<SharedRegion>,
    remount_gate: Arc<Mutex<()>>,
    remount_thread: Option<JoinHandle<()>>,
    scratch: Vec<u8>,
}

impl<S: ServerOps> ClientCore<S> {
    /// Build the core: caches, regions, a job context, the service
    /// worker, and the credential machinery.  Call [`start`] next.
    ///
    /// [`start`]: ClientCore::start
    pub fn new(
        config: CoreConfig,
        server: Arc<S>,
        dev: Arc<dyn DeviceChannel>,
    ) -> PvfsResult<ClientCore<S>> {
        let caches = Arc::new(Caches::new(&config)?);

        let io_region = SharedRegion::new(config.io_desc_count, config.io_desc_size)
            .map_err(|e| {
                error!("failed to map I/O region: {}", e);
                PvfsError::EDEVINIT
            })?;
        let readdir_region =
            SharedRegion::new(config.readdir_desc_count, config.readdir_desc_size).map_err(
                |e| {
                    error!("failed to map readdir region: {}", e);
                    PvfsError::EDEVINIT
                },
            )?;

        let contexts = ContextSet::new();
        let ctx = contexts.open(None);
        let manager = Manager::new(ctx.clone());
        let worker = manager.add_worker(WorkerKind::ThreadedQueues {
            threads: config.worker_threads,
        })?;
        let sysint_queue = manager.add_queue(worker)?;
        // the routing chain sends every implicit post at the service
        // pool; anything unclaimed would fall back to blocking
        manager.add_mapping(Box::new(move |_| Target::Queue(sysint_queue)));

        let signer: Option<Box<dyn crate::security::CredentialSigner>> = match &config.key_file {
            Some(path) => match RsaSha1Signer::from_pem_file(path) {
                Ok(signer) => Some(Box::new(signer)),
                Err(PvfsError::ENOENT) => {
                    warn!(
                        "client key {} not found; credentials will be unsigned",
                        path.display()
                    );
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let issuer = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "pvfs2-client".to_owned());
        let creds = CredentialFactory::new(signer, issuer);

        let hints = HintSet::from_env();
        if !hints.is_empty() {
            info!("carrying {} hints from PVFS2_HINTS", hints.len());
        }

        Ok(ClientCore {
            server,
            dev,
            caches,
            contexts,
            ctx,
            manager,
            sysint_queue,
            slots: (0..MAX_NUM_OPS).map(|_| None).collect(),
            in_progress: HashMap::with_capacity(OPS_IN_PROGRESS_BUCKETS),
            mounts: MountTable::new(),
            hints,
            creds,
            io_region: Arc::new(io_region),
            readdir_region: Arc::new(readdir_region),
            remount_gate: Arc::new(Mutex::new(())),
            remount_thread: None,
            scratch: vec![0u8; SLOT_BUFFER_SIZE + 8],
        })
    }

    /// Finish startup under the remount gate: with the gate held, all
    /// slots stand posted and the kernel's mount-discovery thread is
    /// told to proceed; it re-enqueues any pre-existing mount upcalls
    /// once we release the gate.
    pub fn start(&mut self) {
        let guard = self.remount_gate.lock();
        let gate = self.remount_gate.clone();
        let dev = self.dev.clone();
        self.remount_thread = Some(
            std::thread::Builder::new()
                .name("pvfs2-remount".into())
                .spawn(move || {
                    let _gate = gate.lock();
                    if let Err(e) = dev.remount() {
                        error!("failed to remount filesystems: {}", e);
                    }
                })
                .expect("spawn remount thread"),
        );
        // slots are all free (== posted); release the gate
        drop(guard);
    }

    pub fn mounted_filesystems(&self) -> usize {
        self.mounts.len()
    }

    /// The bulk I/O region, for wiring up the kernel's buffer mapping.
    pub fn io_region(&self) -> &Arc<SharedRegion> {
        &self.io_region
    }

    /// The readdir trailer region.
    pub fn readdir_region(&self) -> &Arc<SharedRegion> {
        &self.readdir_region
    }

    pub fn ops_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    /// Drive the dispatcher until `stop` is raised or the device goes
    /// away.
    pub fn run(&mut self, stop: &AtomicBool) -> PvfsResult<()> {
        while !stop.load(Ordering::Acquire) {
            self.run_once(Duration::from_millis(50))?;
        }
        info!("client core stopping");
        self.shutdown();
        Ok(())
    }

    /// One testsome/service/repost cycle.
    pub fn run_once(&mut self, budget: Duration) -> PvfsResult<()> {
        // completions of previously posted operations
        let completions =
            self.manager
                .test_context(&self.ctx, MAX_NUM_OPS, Some(Duration::ZERO))?;
        let had_completions = !completions.is_empty();
        for completion in completions {
            self.handle_completion(completion);
        }

        // new device messages, while slots remain
        let mut read_budget = if had_completions {
            Duration::ZERO
        } else {
            budget
        };
        while self.free_slot().is_some() {
            let mut scratch = std::mem::take(&mut self.scratch);
            let buf = aligned_sub_buf(&mut scratch, 8);
            let received = self.dev.receive(buf, Some(read_budget));
            let result = match received {
                Ok(Some(len)) => {
                    let image = &buf[..len];
                    self.handle_upcall_image(image);
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                    error!("request device disappeared");
                    Err(PvfsError::ENODEV)
                }
                Err(e) => {
                    warn!("device read failed: {}", e);
                    Ok(false)
                }
            };
            self.scratch = scratch;
            match result {
                Ok(true) => {
                    read_budget = Duration::ZERO;
                }
                Ok(false) => break,
                Err(e) => return Err(e),
            }
        }

        self.caches.maybe_rollover();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.remount_thread.take() {
            let _ = handle.join();
        }
        if self.contexts.close(self.ctx.id()).is_err() {
            debug!("context still busy at shutdown");
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn credential(&self, header: &pvfs_upcall_header) -> PvfsResult<Credential> {
        self.creds.credential(header.uid, &[header.gid])
    }

    fn write_downcall(&self, downcall: &Downcall) {
        let result = downcall.with_iovec(|iov| self.dev.send(iov));
        if let Err(e) = result {
            error!("failed to write downcall (tag {}): {}", downcall.tag(), e);
        }
    }

    // upcall path

    fn handle_upcall_image(&mut self, image: &[u8]) {
        let (header, op, request) = match decode(image) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{}", e);
                if let (Some(tag), DecodeError::UnknownOpcode(_, opnum)) = (e.tag(), &e) {
                    // reply so the kernel does not wait forever on an
                    // opcode we will never service
                    self.write_downcall(&Downcall::error_raw(tag, *opnum, PvfsError::ENOSYS));
                }
                return;
            }
        };

        // nothing but mounts is serviceable before the first mount; the
        // kernel retries, which bounds the discovery window
        if self.mounts.is_empty() && op != Opcode::FsMount {
            debug!("dropping pre-mount upcall {:?} (tag {})", op, header.tag);
            return;
        }

        // the kernel retransmits while service is in progress
        if let Some(&slot) = self.in_progress.get(&header.tag) {
            if self.slots[slot].as_ref().map(|s| s.op) == Some(op) {
                debug!("duplicate upcall tag {} ({:?}); dropping", header.tag, op);
                return;
            }
        }

        match request {
            VfsRequest::FsUmount { .. }
            | VfsRequest::Cancel { .. }
            | VfsRequest::PerfCount { .. }
            | VfsRequest::Param { .. }
            | VfsRequest::Fskey { .. }
            | VfsRequest::RaFlush { .. } => {
                let downcall = self.service_inline(&header, op, request);
                self.write_downcall(&downcall);
            }
            request => self.service_posted(&header, op, request),
        }
    }

    /// Opcodes serviced on the spot: synthesize the downcall without
    /// touching the manager (the umount server call still goes through
    /// the blocking worker).
    fn service_inline(
        &mut self,
        header: &pvfs_upcall_header,
        op: Opcode,
        request: VfsRequest,
    ) -> Downcall {
        let tag = header.tag;
        match request {
            VfsRequest::FsUmount { id, fs_id } => {
                let Some(mntent) = self.mounts.remove(id) else {
                    warn!("umount for unknown dynamic mount id {}", id);
                    return Downcall::error(tag, op, PvfsError::EINVAL);
                };
                debug!("unmounting {} ({})", mntent.mount_point, mntent.fs_name);
                let cred = match self.credential(header) {
                    Ok(cred) => cred,
                    Err(e) => return Downcall::error(tag, op, e),
                };
                let server = self.server.clone();
                let posted = self.manager.post(
                    UserToken(0),
                    &self.hints,
                    Box::new(move || server.umount(&cred, fs_id)),
                    Target::Blocking,
                );
                match posted {
                    Ok(Posted::Completed(Ok(()))) => Downcall::ok(tag, op),
                    Ok(Posted::Completed(Err(e))) => Downcall::error(tag, op, e),
                    Ok(Posted::Posted(_)) => unreachable!("blocking post registered"),
                    Err(e) => Downcall::error(tag, op, e),
                }
            }
            VfsRequest::Cancel { tag: target_tag } => {
                match self.in_progress.get(&target_tag).copied() {
                    Some(slot_idx) => {
                        if let Some(slot) = self.slots[slot_idx].as_mut() {
                            slot.cancelled = true;
                            for op_id in slot.pending.clone() {
                                if let Err(e) = self.manager.cancel(op_id) {
                                    debug!("cancel of {:?} raced completion: {}", op_id, e);
                                }
                            }
                        }
                        Downcall::ok(tag, op)
                    }
                    None => Downcall::error(tag, op, PvfsError::ENOENT),
                }
            }
            VfsRequest::PerfCount { kind } => {
                let text = self.caches.perf_text(kind);
                let mut trailer = Vec::with_capacity(text.len() + 1);
                put_str(&mut trailer, &text);
                Downcall::ok(tag, op).with_trailer(trailer)
            }
            VfsRequest::Param { cmd, id, value } => match self.service_param(cmd, id, value) {
                Ok(value) => Downcall::ok(tag, op)
                    .with_body(&proto::pvfs_param_downcall { value }),
                Err(e) => Downcall::error(tag, op, e),
            },
            VfsRequest::Fskey { fs_id } => match self.mounts.by_fs_id(fs_id) {
                Some(mntent) => {
                    let key = mntent.fs_key.clone();
                    Downcall::ok(tag, op)
                        .with_body(&proto::pvfs_fskey_downcall {
                            key_len: key.len() as u32,
                            pad: 0,
                        })
                        .with_trailer(key)
                }
                None => Downcall::error(tag, op, PvfsError::EINVAL),
            },
            VfsRequest::RaFlush { refn } => {
                self.caches.acache.invalidate_size(refn);
                Downcall::ok(tag, op)
            }
            other => unreachable!("{:?} is not an inline opcode", other),
        }
    }

    fn service_param(&mut self, cmd: ParamCmd, id: ParamId, value: i64) -> PvfsResult<i64> {
        use AcacheScope::{Dynamic, Static};
        let caches = &self.caches;
        let acache_opt = |id: ParamId| match id {
            ParamId::AcacheTimeoutMsecs | ParamId::StaticAcacheTimeoutMsecs => {
                TcacheOption::TimeoutMsecs
            }
            ParamId::AcacheSoftLimit | ParamId::StaticAcacheSoftLimit => TcacheOption::SoftLimit,
            ParamId::AcacheHardLimit | ParamId::StaticAcacheHardLimit => TcacheOption::HardLimit,
            _ => TcacheOption::ReclaimPercentage,
        };
        match cmd {
            ParamCmd::Get => Ok(match id {
                ParamId::AcacheTimeoutMsecs
                | ParamId::AcacheSoftLimit
                | ParamId::AcacheHardLimit
                | ParamId::AcacheReclaimPercentage => {
                    caches.acache.get_info(Dynamic, acache_opt(id)) as i64
                }
                ParamId::StaticAcacheTimeoutMsecs
                | ParamId::StaticAcacheSoftLimit
                | ParamId::StaticAcacheHardLimit
                | ParamId::StaticAcacheReclaimPercentage => {
                    caches.acache.get_info(Static, acache_opt(id)) as i64
                }
                ParamId::NcacheTimeoutMsecs => {
                    caches.ncache.get_info(TcacheOption::TimeoutMsecs) as i64
                }
                ParamId::NcacheSoftLimit => caches.ncache.get_info(TcacheOption::SoftLimit) as i64,
                ParamId::NcacheHardLimit => caches.ncache.get_info(TcacheOption::HardLimit) as i64,
                ParamId::NcacheReclaimPercentage => {
                    caches.ncache.get_info(TcacheOption::ReclaimPercentage) as i64
                }
                ParamId::CapcacheTimeoutMsecs => {
                    caches.capcache.get_info(TcacheOption::TimeoutMsecs) as i64
                }
                ParamId::CapcacheSoftLimit => {
                    caches.capcache.get_info(TcacheOption::SoftLimit) as i64
                }
                ParamId::CapcacheHardLimit => {
                    caches.capcache.get_info(TcacheOption::HardLimit) as i64
                }
                ParamId::CapcacheReclaimPercentage => {
                    caches.capcache.get_info(TcacheOption::ReclaimPercentage) as i64
                }
                ParamId::PerfTimeIntervalSecs => {
                    caches.acache.perf_counter().interval().as_secs() as i64
                }
                ParamId::PerfHistorySize => caches.acache.perf_counter().history_size() as i64,
                ParamId::PerfReset => 0,
            }),
            ParamCmd::Set => {
                if value < 0 {
                    return Err(PvfsError::EINVAL);
                }
                let v = value as u32;
                match id {
                    ParamId::AcacheTimeoutMsecs
                    | ParamId::AcacheSoftLimit
                    | ParamId::AcacheHardLimit
                    | ParamId::AcacheReclaimPercentage => {
                        caches.acache.set_info(Dynamic, acache_opt(id), v)?
                    }
                    ParamId::StaticAcacheTimeoutMsecs
                    | ParamId::StaticAcacheSoftLimit
                    | ParamId::StaticAcacheHardLimit
                    | ParamId::StaticAcacheReclaimPercentage => {
                        caches.acache.set_info(Static, acache_opt(id), v)?
                    }
                    ParamId::NcacheTimeoutMsecs => {
                        caches.ncache.set_info(TcacheOption::TimeoutMsecs, v)?
                    }
                    ParamId::NcacheSoftLimit => {
                        caches.ncache.set_info(TcacheOption::SoftLimit, v)?
                    }
                    ParamId::NcacheHardLimit => {
                        caches.ncache.set_info(TcacheOption::HardLimit, v)?
                    }
                    ParamId::NcacheReclaimPercentage => {
                        caches.ncache.set_info(TcacheOption::ReclaimPercentage, v)?
                    }
                    ParamId::CapcacheTimeoutMsecs => {
                        caches.capcache.set_info(TcacheOption::TimeoutMsecs, v)?
                    }
                    ParamId::CapcacheSoftLimit => {
                        caches.capcache.set_info(TcacheOption::SoftLimit, v)?
                    }
                    ParamId::CapcacheHardLimit => {
                        caches.capcache.set_info(TcacheOption::HardLimit, v)?
                    }
                    ParamId::CapcacheReclaimPercentage => {
                        caches.capcache.set_info(TcacheOption::ReclaimPercentage, v)?
                    }
                    ParamId::PerfTimeIntervalSecs => {
                        caches.set_perf_interval(Duration::from_secs(v as u64))
                    }
                    ParamId::PerfHistorySize => caches.set_perf_history(v as usize)?,
                    ParamId::PerfReset => caches.reset_counters(),
                }
                Ok(0)
            }
        }
    }

    /// Post a request as a non-blocking system-interface operation,
    /// consulting the caches first.  A hit short-circuits to a
    /// synthesized completion.
    fn service_posted(&mut self, header: &pvfs_upcall_header, op: Opcode, request: VfsRequest) {
        let tag = header.tag;

        // hot-path cache consults
        match &request {
            VfsRequest::Lookup { parent, name, .. } => {
                if let Ok(refn) = self.caches.ncache.get_cached(*parent, name) {
                    debug!("ncache satisfied lookup of {:?} (tag {})", name, tag);
                    let downcall = Downcall::ok(tag, op).with_body(&proto::pvfs_ref_downcall {
                        refn: refn.into(),
                    });
                    self.write_downcall(&downcall);
                    return;
                }
            }
            VfsRequest::Getattr { refn, mask } => {
                if let Some(cached) = self.caches.acache.get_cached(*refn) {
                    if cached.mask.contains(*mask) {
                        debug!("acache satisfied getattr of {} (tag {})", refn, tag);
                        let attr = cached.attr.unwrap_or_default();
                        let downcall = getattr_downcall(tag, &attr, cached.size);
                        self.write_downcall(&downcall);
                        return;
                    }
                }
            }
            _ => {}
        }

        let cred = match self.credential(header) {
            Ok(cred) => cred,
            Err(e) => {
                self.write_downcall(&Downcall::error(tag, op, e));
                return;
            }
        };

        let Some(slot_idx) = self.free_slot() else {
            // backpressure: all slots busy, the kernel will retransmit
            warn!("no free request slots; dropping tag {}", tag);
            return;
        };

        let response = Arc::new(Mutex::new(None));
        let iox_total = Arc::new(AtomicI64::new(0));
        let callouts = match self.build_callouts(&request, cred, &response, &iox_total) {
            Ok(callouts) => callouts,
            Err(e) => {
                self.write_downcall(&Downcall::error(tag, op, e));
                return;
            }
        };

        self.slots[slot_idx] = Some(InFlight {
            tag,
            op,
            request,
            response,
            pending: SmallVec::new(),
            iox_total,
            first_error: None,
            cancelled: false,
        });
        self.in_progress.insert(tag, slot_idx);

        let token = UserToken(slot_idx as u64);
        let mut inline_error = None;
        for callout in callouts {
            match self
                .manager
                .post(token, &self.hints, callout, Target::Implicit)
            {
                Ok(Posted::Posted(op_id)) => {
                    let slot = self.slots[slot_idx].as_mut().expect("slot just filled");
                    slot.pending.push(op_id);
                }
                Ok(Posted::Completed(result)) => {
                    // the mapping chain sent it at the blocking worker:
                    // an inlined completion
                    if let Err(e) = result {
                        inline_error = inline_error.or(Some(e));
                    }
                }
                Err(e) => {
                    inline_error = inline_error.or(Some(e));
                }
            }
        }
        if let Some(e) = inline_error {
            let slot = self.slots[slot_idx].as_mut().expect("slot just filled");
            slot.first_error = Some(e);
        }

        let finished = self.slots[slot_idx]
            .as_ref()
            .map(|s| s.pending.is_empty())
            .unwrap_or(false);
        if finished {
            // every callout completed synchronously
            let slot = self.slots[slot_idx].take().expect("slot just filled");
            self.in_progress.remove(&slot.tag);
            self.finish_slot(slot);
        }
    }

    /// Build the service callout(s) for a posted request.  Scatter/
    /// gather I/O splits into chunks of [`IOX_HINDEXED_COUNT`] extents,
    /// all sharing one region descriptor.
    fn build_callouts(
        &self,
        request: &VfsRequest,
        cred: Credential,
        response: &Arc<Mutex<Option<SysResponse>>>,
        iox_total: &Arc<AtomicI64>,
    ) -> PvfsResult<Vec<ServiceFn>> {
        let server = self.server.clone();
        let response = response.clone();
        let store = move |r: SysResponse| {
            *response.lock() = Some(r);
        };

        let callout: ServiceFn = match request.clone() {
            VfsRequest::Lookup {
                parent,
                name,
                follow,
            } => Box::new(move || {
                server
                    .lookup(&cred, parent, &name, follow)
                    .map(|refn| store(SysResponse::Ref(refn)))
            }),
            VfsRequest::Create {
                parent,
                name,
                perms,
            } => Box::new(move || {
                server
                    .create(&cred, parent, &name, perms)
                    .map(|refn| store(SysResponse::Ref(refn)))
            }),
            VfsRequest::Symlink {
                parent,
                name,
                target,
                perms,
            } => Box::new(move || {
                server
                    .symlink(&cred, parent, &name, &target, perms)
                    .map(|refn| store(SysResponse::Ref(refn)))
            }),
            VfsRequest::Mkdir {
                parent,
                name,
                perms,
            } => Box::new(move || {
                server
                    .mkdir(&cred, parent, &name, perms)
                    .map(|refn| store(SysResponse::Ref(refn)))
            }),
            VfsRequest::Getattr { refn, mask } => Box::new(move || {
                server
                    .getattr(&cred, refn, mask | AttrMask::COMMON)
                    .map(|attr| store(SysResponse::Attr(attr)))
            }),
            VfsRequest::Setattr { refn, attr } => Box::new(move || {
                server
                    .setattr(&cred, refn, &attr)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Remove { parent, name } => Box::new(move || {
                server
                    .remove(&cred, parent, &name)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Rename {
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => Box::new(move || {
                server
                    .rename(&cred, old_parent, &old_name, new_parent, &new_name)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Truncate { refn, size } => Box::new(move || {
                server
                    .truncate(&cred, refn, size)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Readdir {
                refn, token, count, ..
            } => {
                let hint = self.caches.rcache.get_cached(refn, token).ok();
                Box::new(move || {
                    server
                        .readdir(&cred, refn, token, count, hint)
                        .map(|r| store(SysResponse::Readdir(r)))
                })
            }
            VfsRequest::ReaddirPlus {
                refn,
                token,
                count,
                mask,
            } => Box::new(move || {
                server
                    .readdirplus(&cred, refn, token, count, mask)
                    .map(|r| store(SysResponse::ReaddirPlus(r)))
            }),
            VfsRequest::Getxattr { refn, name } => Box::new(move || {
                server
                    .getxattr(&cred, refn, &name)
                    .map(|v| store(SysResponse::Xattr(v)))
            }),
            VfsRequest::Setxattr {
                refn,
                name,
                value,
                flags,
            } => Box::new(move || {
                server
                    .setxattr(&cred, refn, &name, &value, flags)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Listxattr { refn, count } => Box::new(move || {
                server
                    .listxattr(&cred, refn, count)
                    .map(|keys| store(SysResponse::XattrList(keys)))
            }),
            VfsRequest::Removexattr { refn, name } => Box::new(move || {
                server
                    .removexattr(&cred, refn, &name)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Statfs { fs_id } => Box::new(move || {
                server
                    .statfs(&cred, fs_id)
                    .map(|s| store(SysResponse::Statfs(s)))
            }),
            VfsRequest::FsMount { uri } => {
                let (config_server, fs_name) = parse_mount_uri(&uri)?;
                Box::new(move || {
                    server
                        .mount(&cred, &config_server, &fs_name)
                        .map(|m| store(SysResponse::Mount(m)))
                })
            }
            VfsRequest::Fsync { refn } => Box::new(move || {
                server
                    .fsync(&cred, refn)
                    .map(|()| store(SysResponse::Unit))
            }),
            VfsRequest::Io {
                refn,
                io_type,
                buf_index,
                count,
                offset,
            } => {
                let buf = self
                    .io_region
                    .buffer(buf_index as usize)
                    .and_then(|b| b.slice(0, count as usize))
                    .ok_or(PvfsError::EMSGSIZE)?;
                let kind = io_kind(io_type);
                let caches = self.caches.clone();
                Box::new(move || {
                    let cap = acquire_capability(&*server, &caches, &cred, refn)?;
                    let extent = Extent {
                        offset,
                        len: count as i64,
                    };
                    // the kernel owns this descriptor for the duration
                    // of the call; we are a passthrough
                    let data = unsafe { buf.as_mut_slice() };
                    let amount = server.io(&cred, &cap, refn, kind, extent, data)?;
                    store(SysResponse::IoAmount(amount));
                    Ok(())
                })
            }
            VfsRequest::Iox {
                refn,
                io_type,
                buf_index,
                extents,
            } => {
                return self.build_iox_callouts(refn, io_type, buf_index, &extents, cred, iox_total)
            }
            VfsRequest::FsUmount { .. }
            | VfsRequest::Cancel { .. }
            | VfsRequest::PerfCount { .. }
            | VfsRequest::Param { .. }
            | VfsRequest::Fskey { .. }
            | VfsRequest::RaFlush { .. } => unreachable!("inline opcodes are not posted"),
        };
        Ok(vec![callout])
    }

    /// One posted operation per chunk of `IOX_HINDEXED_COUNT` extents.
    /// The chunks share a single region descriptor; each consumes its
    /// extents' bytes at the running buffer offset.
    fn build_iox_callouts(
        &self,
        refn: ObjectRef,
        io_type: IoType,
        buf_index: u32,
        extents: &[Extent],
        cred: Credential,
        iox_total: &Arc<AtomicI64>,
    ) -> PvfsResult<Vec<ServiceFn>> {
        let buf = self
            .io_region
            .buffer(buf_index as usize)
            .ok_or(PvfsError::EINVAL)?;
        let total_len: i64 = extents.iter().map(|e| e.len).sum();
        if total_len < 0 || total_len as usize > buf.len() {
            return Err(PvfsError::EMSGSIZE);
        }
        let kind = io_kind(io_type);

        let mut callouts: Vec<ServiceFn> = Vec::new();
        let mut buf_offset = 0usize;
        for chunk in extents.chunks(IOX_HINDEXED_COUNT) {
            let chunk: Vec<Extent> = chunk.to_vec();
            let chunk_len = chunk.iter().map(|e| e.len as usize).sum::<usize>();
            // each chunk owns a disjoint range of the shared descriptor
            let chunk_buf = buf
                .slice(buf_offset, chunk_len)
                .ok_or(PvfsError::EMSGSIZE)?;
            buf_offset += chunk_len;

            let server = self.server.clone();
            let caches = self.caches.clone();
            let cred = cred.clone();
            let total = iox_total.clone();
            callouts.push(Box::new(move || {
                let cap = acquire_capability(&*server, &caches, &cred, refn)?;
                let data = unsafe { chunk_buf.as_mut_slice() };
                let mut at = 0usize;
                for extent in chunk {
                    let len = extent.len as usize;
                    let amount =
                        server.io(&cred, &cap, refn, kind, extent, &mut data[at..at + len])?;
                    total.fetch_add(amount, Ordering::Relaxed);
                    at += len;
                }
                Ok(())
            }));
        }
        Ok(callouts)
    }

    // completion path

    fn handle_completion(&mut self, completion: Completion) {
        let slot_idx = completion.token.0 as usize;
        let Some(slot) = self.slots.get_mut(slot_idx).and_then(Option::as_mut) else {
            warn!("completion for vacant slot {}", slot_idx);
            return;
        };
        match slot.pending.iter().position(|&op| op == completion.op) {
            Some(pos) => {
                slot.pending.remove(pos);
            }
            None => {
                debug!("stale completion {:?} for tag {}", completion.op, slot.tag);
                return;
            }
        }
        if let Err(e) = completion.result {
            if e != PvfsError::ECANCEL && slot.first_error.is_none() {
                slot.first_error = Some(e);
            }
        }
        if !slot.pending.is_empty() {
            // iox: the downcall waits for the last chunk
            return;
        }
        let slot = self.slots[slot_idx].take().expect("slot checked above");
        self.in_progress.remove(&slot.tag);
        if slot.cancelled {
            // the kernel already discarded the request; skip the
            // downcall and stand the slot back up
            debug!("dropping completion of cancelled tag {}", slot.tag);
            return;
        }
        self.finish_slot(slot);
    }

    /// Transform a finished request into its downcall, applying the
    /// cache side effects of the outcome.
    fn finish_slot(&mut self, slot: InFlight) {
        let tag = slot.tag;
        let op = slot.op;

        if let Some(error) = slot.first_error {
            self.apply_failure(&slot.request, error);
            self.write_downcall(&Downcall::error(tag, op, error));
            return;
        }

        let response = slot.response.lock().take();
        let downcall = match (&slot.request, response) {
            (VfsRequest::Lookup { parent, name, .. }, Some(SysResponse::Ref(refn))) => {
                self.caches.ncache.update(*parent, name, refn);
                Downcall::ok(tag, op).with_body(&proto::pvfs_ref_downcall { refn: refn.into() })
            }
            (
                VfsRequest::Create { parent, name, .. }
                | VfsRequest::Mkdir { parent, name, .. }
                | VfsRequest::Symlink { parent, name, .. },
                Some(SysResponse::Ref(refn)),
            ) => {
                self.caches.ncache.update(*parent, name, refn);
                // the parent's entry count and times moved
                self.caches.acache.invalidate(*parent);
                self.caches.rcache.invalidate_dir(*parent);
                Downcall::ok(tag, op).with_body(&proto::pvfs_ref_downcall { refn: refn.into() })
            }
            (VfsRequest::Getattr { refn, .. }, Some(SysResponse::Attr(attr))) => {
                let size = attr.size();
                self.caches.acache.update(*refn, &attr, size);
                getattr_downcall(tag, &attr, size)
            }
            (VfsRequest::Setattr { refn, .. }, Some(SysResponse::Unit)) => {
                self.caches.acache.invalidate(*refn);
                Downcall::ok(tag, op)
            }
            (VfsRequest::Remove { parent, name }, Some(SysResponse::Unit)) => {
                self.caches.ncache.invalidate(*parent, name);
                self.caches.acache.invalidate(*parent);
                self.caches.rcache.invalidate_dir(*parent);
                Downcall::ok(tag, op)
            }
            (
                VfsRequest::Rename {
                    old_parent,
                    old_name,
                    new_parent,
                    new_name,
                },
                Some(SysResponse::Unit),
            ) => {
                self.caches.ncache.invalidate(*old_parent, old_name);
                self.caches.ncache.invalidate(*new_parent, new_name);
                self.caches.acache.invalidate(*old_parent);
                self.caches.acache.invalidate(*new_parent);
                Downcall::ok(tag, op)
            }
            (VfsRequest::Truncate { refn, .. }, Some(SysResponse::Unit)) => {
                self.caches.acache.invalidate_size(*refn);
                Downcall::ok(tag, op)
            }
            (
                VfsRequest::Readdir {
                    refn, buf_index, ..
                },
                Some(SysResponse::Readdir(result)),
            ) => {
                if result.token != crate::cache::rcache::ITERATE_END {
                    let _ = self
                        .caches
                        .rcache
                        .insert(*refn, result.token, result.dirdata_index);
                }
                self.readdir_downcall(tag, op, &result, *buf_index)
            }
            (VfsRequest::ReaddirPlus { refn, .. }, Some(SysResponse::ReaddirPlus(result))) => {
                if result.base.token != crate::cache::rcache::ITERATE_END {
                    let _ = self.caches.rcache.insert(
                        *refn,
                        result.base.token,
                        result.base.dirdata_index,
                    );
                }
                // attributes ride along: warm the acache with them
                for (dirent, attr) in result.base.dirents.iter().zip(&result.attrs) {
                    if let Ok(attr) = attr {
                        let size = attr.size();
                        self.caches.acache.update(dirent.refn, attr, size);
                    }
                }
                self.readdirplus_downcall(tag, op, &result)
            }
            (VfsRequest::Getxattr { .. }, Some(SysResponse::Xattr(value))) => Downcall::ok(tag, op)
                .with_body(&proto::pvfs_getxattr_downcall {
                    value_len: value.len() as u32,
                    pad: 0,
                })
                .with_trailer(value),
            (VfsRequest::Setxattr { .. } | VfsRequest::Removexattr { .. }, Some(SysResponse::Unit)) => {
                Downcall::ok(tag, op)
            }
            (VfsRequest::Listxattr { .. }, Some(SysResponse::XattrList(keys))) => {
                let mut trailer = Vec::new();
                for key in &keys {
                    put_str(&mut trailer, key);
                }
                Downcall::ok(tag, op)
                    .with_body(&proto::pvfs_listxattr_downcall {
                        returned_count: keys.len() as u32,
                        keylen: trailer.len() as u32,
                    })
                    .with_trailer(trailer)
            }
            (VfsRequest::Statfs { fs_id }, Some(SysResponse::Statfs(s))) => Downcall::ok(tag, op)
                .with_body(&proto::pvfs_statfs_downcall {
                    block_size: s.block_size,
                    blocks_total: s.blocks_total,
                    blocks_avail: s.blocks_avail,
                    files_total: s.files_total,
                    files_avail: s.files_avail,
                    fs_id: *fs_id,
                    pad: 0,
                }),
            (VfsRequest::FsMount { uri }, Some(SysResponse::Mount(m))) => {
                let (config_server, fs_name) =
                    parse_mount_uri(uri).expect("validated before posting");
                let id = self.mounts.add(config_server, fs_name, m.fs_id, m.root);
                info!("mounted fs {} as <DYNAMIC-{}>", m.fs_id, id);
                // connection-level aborts must surface promptly from
                // here on, so cancellation can reach the wire
                self.server.enable_forceful_cancel();
                Downcall::ok(tag, op).with_body(&proto::pvfs_fs_mount_downcall {
                    fs_id: m.fs_id,
                    id,
                    root: m.root.into(),
                })
            }
            (VfsRequest::Fsync { .. }, Some(SysResponse::Unit)) => Downcall::ok(tag, op),
            (VfsRequest::Io { refn, io_type, .. }, Some(SysResponse::IoAmount(amount))) => {
                if *io_type == IoType::Write {
                    self.caches.acache.invalidate_size(*refn);
                }
                Downcall::ok(tag, op).with_body(&proto::pvfs_io_downcall {
                    amt_complete: amount,
                })
            }
            (VfsRequest::Iox { refn, io_type, .. }, None) => {
                if *io_type == IoType::Write {
                    self.caches.acache.invalidate_size(*refn);
                }
                Downcall::ok(tag, op).with_body(&proto::pvfs_io_downcall {
                    amt_complete: slot.iox_total.load(Ordering::Relaxed),
                })
            }
            (request, response) => {
                error!(
                    "request {:?} completed without a usable response ({})",
                    request,
                    if response.is_some() { "mismatched" } else { "missing" },
                );
                Downcall::error(tag, op, PvfsError::EINVAL)
            }
        };
        self.write_downcall(&downcall);
    }

    /// Cache consequences of a failed operation.
    fn apply_failure(&mut self, request: &VfsRequest, error: PvfsError) {
        match request {
            // a failed getattr poisons both halves
            VfsRequest::Getattr { refn, .. } => self.caches.acache.invalidate(*refn),
            VfsRequest::Setattr { refn, .. } | VfsRequest::Truncate { refn, .. } => {
                self.caches.acache.invalidate(*refn)
            }
            VfsRequest::Lookup { parent, name, .. } if error == PvfsError::ENOENT => {
                self.caches.ncache.invalidate(*parent, name)
            }
            _ => {}
        }
    }

    fn readdir_downcall(
        &self,
        tag: u64,
        op: Opcode,
        result: &ReaddirResult,
        buf_index: i32,
    ) -> Downcall {
        let dirents: Vec<Dirent> = result
            .dirents
            .iter()
            .map(|d| Dirent {
                refn: d.refn,
                name: d.name.clone(),
            })
            .collect();
        let mut stream = Vec::new();
        encode_dirents(&mut stream, &dirents);

        // large responses ride the readdir shared region when the
        // kernel passed a descriptor index
        if buf_index >= 0 {
            if let Some(buf) = self.readdir_region.buffer(buf_index as usize) {
                if stream.len() <= buf.len() {
                    unsafe {
                        buf.as_mut_slice()[..stream.len()].copy_from_slice(&stream);
                    }
                    return Downcall::ok(tag, op).with_body(&proto::pvfs_readdir_downcall {
                        token: result.token,
                        dirent_count: dirents.len() as u32,
                        shared_region: 1,
                    });
                }
            }
        }
        Downcall::ok(tag, op)
            .with_body(&proto::pvfs_readdir_downcall {
                token: result.token,
                dirent_count: dirents.len() as u32,
                shared_region: 0,
            })
            .with_trailer(stream)
    }

    fn readdirplus_downcall(&self, tag: u64, op: Opcode, result: &ReaddirPlusResult) -> Downcall {
        let mut stream = Vec::new();
        let dirents: Vec<Dirent> = result
            .base
            .dirents
            .iter()
            .map(|d| Dirent {
                refn: d.refn,
                name: d.name.clone(),
            })
            .collect();
        encode_dirents(&mut stream, &dirents);
        for attr in &result.attrs {
            let (wire, _) = match attr {
                Ok(attr) => attr_to_wire(attr, attr.size()),
                Err(e) => {
                    let mut wire = proto::pvfs_wire_attr::default();
                    wire.mask = 0;
                    wire.size = e.to_wire_status() as i64;
                    (wire, None)
                }
            };
            stream.extend_from_slice(zerocopy::IntoBytes::as_bytes(&wire));
        }
        Downcall::ok(tag, op)
            .with_body(&proto::pvfs_readdir_downcall {
                token: result.base.token,
                dirent_count: dirents.len() as u32,
                shared_region: 0,
            })
            .with_trailer(stream)
    }
}

impl<S: ServerOps> Drop for ClientCore<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.remount_thread.take() {
            let _ = handle.join();
        }
    }
}

fn io_kind(io_type: IoType) -> IoKind {
    match io_type {
        IoType::Read => IoKind::Read,
        IoType::Write => IoKind::Write,
    }
}

/// Consult the capcache, falling back to a server fetch.  Whatever is
/// returned satisfies `now <= capability.timeout`.
fn acquire_capability(
    server: &dyn ServerOps,
    caches: &Caches,
    cred: &Credential,
    refn: ObjectRef,
) -> PvfsResult<crate::types::Capability> {
    if let Ok(cap) = caches.capcache.get_cached(refn, cred.userid) {
        return Ok(cap);
    }
    let cap = server.get_capability(cred, refn)?;
    if let Err(e) = caches.capcache.update(refn, cred.userid, &cap) {
        debug!("capability for {} not cacheable: {}", refn, e);
    }
    Ok(cap)
}

/// Lower attributes onto the wire, with the symlink target as the
/// trailer when present.
pub(crate) fn attr_to_wire(
    attr: &ObjectAttr,
    size: Option<i64>,
) -> (proto::pvfs_wire_attr, Option<String>) {
    let mut mask = attr.mask;
    if size.is_some() {
        mask |= AttrMask::SIZE;
    }
    let (dirent_count, dfile_count, link_target) = match &attr.object {
        AttrObject::Directory { dirent_count, .. } => (*dirent_count, 0, None),
        AttrObject::Metafile { dfiles, .. } => (0, dfiles.len() as u32, None),
        AttrObject::Symlink { target } => (0, 0, Some(target.clone())),
        _ => (0, 0, None),
    };
    let wire = proto::pvfs_wire_attr {
        owner: attr.owner,
        group: attr.group,
        perms: attr.perms.bits(),
        objtype: attr.object.object_type() as u32,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        size: size.unwrap_or(0),
        dirent_count,
        dfile_count,
        mask: mask.bits(),
    };
    (wire, link_target)
}

fn getattr_downcall(tag: u64, attr: &ObjectAttr, size: Option<i64>) -> Downcall {
    let (wire, link_target) = attr_to_wire(attr, size);
    let downcall =
        Downcall::ok(tag, Opcode::Getattr).with_body(&proto::pvfs_getattr_downcall { attr: wire });
    match link_target {
        Some(target) => {
            let mut trailer = Vec::with_capacity(target.len() + 1);
            put_str(&mut trailer, &target);
            downcall.with_trailer(trailer)
        }
        None => downcall,
    }
}
