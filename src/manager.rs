//! Operation manager and worker backends.
//!
//! A manager owns a closed set of worker backends and routes posted
//! operations to them: inline on the caller (blocking), onto named
//! queues drained from the test call (pull model), onto queues serviced
//! by a dedicated thread pool, onto a thread per operation, or to an
//! external driver.  Every non-blocking post registers the operation in
//! the manager's op table until its completion is pushed into the
//! target context.
//!
//! Lock order: manager op table, then worker internals, then whatever
//! the callout touches.  Workers never call back up into post, so no
//! cycle is possible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::context::{Completion, CompletionContext, OpId, UserToken};
use crate::error::{PvfsError, PvfsResult};
use crate::hints::HintSet;

/// Service callout: the body of an operation, run exactly once.
pub type ServiceFn = Box<dyn FnOnce() -> PvfsResult<()> + Send + 'static>;

/// Pre-sized op table capacity.
const OP_TABLE_CAPACITY: usize = 32 * 1024;

/// Identifier of a registered worker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkerId(u64);

/// Identifier of a named queue owned by a queue worker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueueId(u64);

/// Where a post should land.  The blocking and implicit sentinels are
/// variants, not magic ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    /// Service on the caller's thread; the post call returns completed.
    Blocking,
    /// Defer the choice to the manager's mapping chain.
    Implicit,
    Worker(WorkerId),
    Queue(QueueId),
}

/// Outcome of a post.
#[derive(Debug)]
pub enum Posted {
    /// Serviced synchronously (blocking worker); never registered.
    Completed(PvfsResult<()>),
    /// Registered and handed to a worker.
    Posted(OpId),
}

/// What a mapping callout sees.
pub struct PostArgs<'a> {
    pub token: UserToken,
    pub hint: &'a HintSet,
}

/// Mapping callout: may claim an implicit post for a target.
pub type MapFn = Box<dyn Fn(&PostArgs<'_>) -> Target + Send + Sync>;

/// The closed set of worker backends.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerKind {
    /// Named queues drained from `test_context` on the caller's thread.
    Queues,
    /// Named queues serviced by a dedicated thread pool.
    ThreadedQueues { threads: usize },
    /// A thread per posted operation.
    PerOp,
    /// Completion driven by the caller through the back-door API.
    External,
    /// Reserved; posts fail with `ENOSYS`.
    Pool,
}

struct QueuedOp {
    op: OpId,
    callout: ServiceFn,
}

struct OpEntry {
    ctx: Arc<CompletionContext>,
    token: UserToken,
    worker: WorkerId,
    cancelled: Arc<AtomicBool>,
    posted_at: Instant,
    /// Held for external workers until the driver claims it.
    external: Option<ServiceFn>,
}

/// State shared with worker threads.
struct Shared {
    ops: Mutex<HashMap<OpId, OpEntry>>,
    op_count: AtomicUsize,
    next_op: AtomicU64,
}

impl Shared {
    fn register(
        &self,
        ctx: Arc<CompletionContext>,
        token: UserToken,
        worker: WorkerId,
        external: Option<ServiceFn>,
    ) -> (OpId, Arc<AtomicBool>) {
        let op = OpId(self.next_op.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = OpEntry {
            ctx,
            token,
            worker,
            cancelled: cancelled.clone(),
            posted_at: Instant::now(),
            external,
        };
        self.ops.lock().insert(op, entry);
        self.op_count.fetch_add(1, Ordering::Relaxed);
        (op, cancelled)
    }

    /// Remove the entry and deliver its completion.  The entry is gone
    /// before the context sees the result, so a tester can never
    /// observe a completed op still registered.
    fn complete_op(&self, op: OpId, result: PvfsResult<()>) {
        let entry = self.ops.lock().remove(&op);
        match entry {
            Some(entry) => {
                self.op_count.fetch_sub(1, Ordering::Relaxed);
                entry.ctx.complete(Completion {
                    op,
                    token: entry.token,
                    result,
                });
            }
            None => warn!("completion for unregistered op {:?}", op),
        }
    }

    /// Run a callout with service-time accounting, then complete.
    fn service_op(&self, op: OpId, callout: ServiceFn) {
        trace!("service start {:?}", op);
        let start = Instant::now();
        let result = callout();
        trace!("service end {:?} ({:?})", op, start.elapsed());
        self.complete_op(op, result);
    }
}

struct PoolInner {
    queues: Mutex<Vec<(QueueId, std::collections::VecDeque<QueuedOp>)>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn pop(&self) -> Option<QueuedOp> {
        let mut queues = self.queues.lock();
        loop {
            if let Some(item) = queues
                .iter_mut()
                .find_map(|(_, q)| q.pop_front())
            {
                return Some(item);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            self.ready.wait(&mut queues);
        }
    }
}

enum WorkerImpl {
    Queues {
        queues: Mutex<Vec<(QueueId, std::collections::VecDeque<QueuedOp>)>>,
    },
    Threaded {
        inner: Arc<PoolInner>,
        threads: Mutex<Vec<JoinHandle<()>>>,
    },
    PerOp {
        threads: Mutex<Vec<JoinHandle<()>>>,
    },
    External,
}

struct Worker {
    id: WorkerId,
    imp: WorkerImpl,
}

/// The operation manager.
pub struct Manager {
    shared: Arc<Shared>,
    context: Arc<CompletionContext>,
    workers: Mutex<Vec<Worker>>,
    queue_owner: Mutex<HashMap<QueueId, WorkerId>>,
    mappings: Mutex<Vec<MapFn>>,
    next_worker: AtomicU64,
    next_queue: AtomicU64,
}

impl Manager {
    /// Create a manager whose posts complete into `context` by default.
    /// Every manager can service blocking posts without further setup.
    pub fn new(context: Arc<CompletionContext>) -> Manager {
        Manager {
            shared: Arc::new(Shared {
                ops: Mutex::new(HashMap::with_capacity(OP_TABLE_CAPACITY)),
                op_count: AtomicUsize::new(0),
                next_op: AtomicU64::new(1),
            }),
            context,
            workers: Mutex::new(Vec::new()),
            queue_owner: Mutex::new(HashMap::new()),
            mappings: Mutex::new(Vec::new()),
            next_worker: AtomicU64::new(1),
            next_queue: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<CompletionContext> {
        &self.context
    }

    /// Operations currently registered.
    pub fn ops_in_flight(&self) -> usize {
        self.shared.op_count.load(Ordering::Relaxed)
    }

    /// Register a worker backend.
    pub fn add_worker(&self, kind: WorkerKind) -> PvfsResult<WorkerId> {
        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let imp = match kind {
            WorkerKind::Queues => WorkerImpl::Queues {
                queues: Mutex::new(Vec::new()),
            },
            WorkerKind::ThreadedQueues { threads } => {
                let inner = Arc::new(PoolInner {
                    queues: Mutex::new(Vec::new()),
                    ready: Condvar::new(),
                    shutdown: AtomicBool::new(false),
                });
                let mut handles = Vec::with_capacity(threads.max(1));
                for n in 0..threads.max(1) {
                    let inner = inner.clone();
                    let shared = self.shared.clone();
                    handles.push(
                        std::thread::Builder::new()
                            .name(format!("pvfs2-wq-{}-{}", id.0, n))
                            .spawn(move || {
                                while let Some(item) = inner.pop() {
                                    shared.service_op(item.op, item.callout);
                                }
                            })
                            .map_err(|_| PvfsError::ENOMEM)?,
                    );
                }
                WorkerImpl::Threaded {
                    inner,
                    threads: Mutex::new(handles),
                }
            }
            WorkerKind::PerOp => WorkerImpl::PerOp {
                threads: Mutex::new(Vec::new()),
            },
            WorkerKind::External => WorkerImpl::External,
            WorkerKind::Pool => return Err(PvfsError::ENOSYS),
        };
        self.workers.lock().push(Worker { id, imp });
        Ok(id)
    }

    /// Add a named queue to a queue-type worker.
    pub fn add_queue(&self, worker: WorkerId) -> PvfsResult<QueueId> {
        let mut workers = self.workers.lock();
        let w = workers
            .iter_mut()
            .find(|w| w.id == worker)
            .ok_or(PvfsError::EINVAL)?;
        let queue = QueueId(self.next_queue.fetch_add(1, Ordering::Relaxed));
        match &mut w.imp {
            WorkerImpl::Queues { queues } => {
                queues.lock().push((queue, Default::default()));
            }
            WorkerImpl::Threaded { inner, .. } => {
                inner.queues.lock().push((queue, Default::default()));
            }
            _ => return Err(PvfsError::EINVAL),
        }
        self.queue_owner.lock().insert(queue, worker);
        Ok(queue)
    }

    /// Append a mapping callout; callouts are consulted in registration
    /// order when a post targets [`Target::Implicit`].
    pub fn add_mapping(&self, map: MapFn) {
        self.mappings.lock().push(map);
    }

    /// Post to the manager's default context.
    pub fn post(
        &self,
        token: UserToken,
        hint: &HintSet,
        callout: ServiceFn,
        target: Target,
    ) -> PvfsResult<Posted> {
        self.ctx_post(self.context.clone(), token, hint, callout, target)
    }

    /// Post an operation toward a specific context.
    pub fn ctx_post(
        &self,
        ctx: Arc<CompletionContext>,
        token: UserToken,
        hint: &HintSet,
        callout: ServiceFn,
        target: Target,
    ) -> PvfsResult<Posted> {
        let target = match target {
            Target::Implicit => self.map_implicit(&PostArgs { token, hint }),
            other => other,
        };

        // blocking: service on this thread, no registration
        if target == Target::Blocking {
            return Ok(Posted::Completed(callout()));
        }

        let (worker_id, queue) = match target {
            Target::Queue(queue) => {
                let owner = self
                    .queue_owner
                    .lock()
                    .get(&queue)
                    .copied()
                    .ok_or_else(|| {
                        warn!("post to unregistered queue {:?}", queue);
                        PvfsError::EINVAL
                    })?;
                (owner, Some(queue))
            }
            Target::Worker(worker) => (worker, None),
            Target::Blocking | Target::Implicit => unreachable!("resolved above"),
        };

        let workers = self.workers.lock();
        let worker = workers
            .iter()
            .find(|w| w.id == worker_id)
            .ok_or(PvfsError::EINVAL)?;

        match &worker.imp {
            WorkerImpl::Queues { queues } => {
                let queue = queue.ok_or(PvfsError::EINVAL)?;
                let (op, _) = self
                    .shared
                    .register(ctx, token, worker_id, None);
                let mut queues = queues.lock();
                let slot = queues
                    .iter_mut()
                    .find(|(id, _)| *id == queue)
                    .expect("queue registered to this worker");
                slot.1.push_back(QueuedOp { op, callout });
                Ok(Posted::Posted(op))
            }
            WorkerImpl::Threaded { inner, .. } => {
                let queue = queue.ok_or(PvfsError::EINVAL)?;
                let (op, _) = self
                    .shared
                    .register(ctx, token, worker_id, None);
                {
                    let mut queues = inner.queues.lock();
                    let slot = queues
                        .iter_mut()
                        .find(|(id, _)| *id == queue)
                        .expect("queue registered to this worker");
                    slot.1.push_back(QueuedOp { op, callout });
                }
                inner.ready.notify_one();
                Ok(Posted::Posted(op))
            }
            WorkerImpl::PerOp { threads } => {
                let (op, _) = self
                    .shared
                    .register(ctx, token, worker_id, None);
                let shared = self.shared.clone();
                let mut threads = threads.lock();
                threads.retain(|h| !h.is_finished());
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("pvfs2-op-{}", op.0))
                        .spawn(move || shared.service_op(op, callout))
                        .map_err(|_| PvfsError::ENOMEM)?,
                );
                Ok(Posted::Posted(op))
            }
            WorkerImpl::External => {
                let (op, _) = self
                    .shared
                    .register(ctx, token, worker_id, Some(callout));
                Ok(Posted::Posted(op))
            }
        }
    }

    fn map_implicit(&self, args: &PostArgs<'_>) -> Target {
        for map in self.mappings.lock().iter() {
            let target = map(args);
            if target != Target::Implicit {
                return target;
            }
        }
        // nothing claimed it: fall back to the blocking worker
        Target::Blocking
    }

    /// Drain completions for a context, driving pull-model queue
    /// workers while waiting.  A `timeout` of `None` loops until at
    /// least one completion arrives.
    pub fn test_context(
        &self,
        ctx: &Arc<CompletionContext>,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> PvfsResult<Vec<Completion>> {
        const IDLE_WAIT: Duration = Duration::from_millis(10);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let got = ctx.test_all(capacity, Some(Duration::ZERO))?;
            if !got.is_empty() {
                return Ok(got);
            }
            if timeout == Some(Duration::ZERO) {
                return Ok(got);
            }
            if self.do_work() > 0 {
                continue;
            }
            // nothing to drive; block on the context for a while
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    (deadline - now).min(IDLE_WAIT)
                }
                None => IDLE_WAIT,
            };
            let got = ctx.test_all(capacity, Some(wait))?;
            if !got.is_empty() {
                return Ok(got);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Service one round of work from every manual queue worker, on the
    /// caller's thread.  Returns the number of operations serviced.
    fn do_work(&self) -> usize {
        let mut batch = Vec::new();
        {
            let workers = self.workers.lock();
            for worker in workers.iter() {
                if let WorkerImpl::Queues { queues } = &worker.imp {
                    let mut queues = queues.lock();
                    for (_, q) in queues.iter_mut() {
                        if let Some(item) = q.pop_front() {
                            batch.push(item);
                        }
                    }
                }
            }
        }
        let serviced = batch.len();
        for item in batch {
            self.shared.service_op(item.op, item.callout);
        }
        serviced
    }

    /// Best-effort cancellation.  A queued operation is removed and
    /// completed with `ECANCEL`; an operation already being serviced is
    /// only flagged, and its eventual completion is the caller's to
    /// discard.
    pub fn cancel(&self, op: OpId) -> PvfsResult<()> {
        let worker_id = {
            let ops = self.shared.ops.lock();
            let entry = ops.get(&op).ok_or(PvfsError::ENOENT)?;
            entry.cancelled.store(true, Ordering::Release);
            entry.worker
        };
        debug!("cancel requested for {:?}", op);

        let mut dequeued = false;
        {
            let workers = self.workers.lock();
            if let Some(worker) = workers.iter().find(|w| w.id == worker_id) {
                let queues = match &worker.imp {
                    WorkerImpl::Queues { queues } => Some(queues),
                    WorkerImpl::Threaded { inner, .. } => Some(&inner.queues),
                    _ => None,
                };
                if let Some(queues) = queues {
                    let mut queues = queues.lock();
                    for (_, q) in queues.iter_mut() {
                        if let Some(pos) = q.iter().position(|item| item.op == op) {
                            q.remove(pos);
                            dequeued = true;
                            break;
                        }
                    }
                }
            }
        }
        if dequeued {
            self.shared.complete_op(op, Err(PvfsError::ECANCEL));
        }
        Ok(())
    }

    /// Whether an operation has been flagged for cancellation.
    pub fn is_cancelled(&self, op: OpId) -> bool {
        self.shared
            .ops
            .lock()
            .get(&op)
            .map(|e| e.cancelled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Back-door for external workers: claim the service callout.
    pub fn external_service(&self, op: OpId) -> Option<ServiceFn> {
        self.shared.ops.lock().get_mut(&op).and_then(|e| e.external.take())
    }

    /// Back-door for external workers: deliver the completion.
    pub fn external_complete(&self, op: OpId, result: PvfsResult<()>) {
        self.shared.complete_op(op, result);
    }

    /// Age of a registered operation, for diagnostics.
    pub fn op_age(&self, op: OpId) -> Option<Duration> {
        self.shared
            .ops
            .lock()
            .get(&op)
            .map(|e| e.posted_at.elapsed())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            match worker.imp {
                WorkerImpl::Threaded { inner, threads } => {
                    inner.shutdown.store(true, Ordering::Release);
                    inner.ready.notify_all();
                    for handle in threads.into_inner() {
                        let _ = handle.join();
                    }
                }
                WorkerImpl::PerOp { threads } => {
                    for handle in threads.into_inner() {
                        let _ = handle.join();
                    }
                }
                WorkerImpl::Queues { queues } => {
                    let abandoned: usize =
                        queues.into_inner().iter().map(|(_, q)| q.len()).sum();
                    if abandoned > 0 {
                        warn!("manager dropped with {} queued ops", abandoned);
                    }
                }
                WorkerImpl::External => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSet;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (ContextSet, Arc<CompletionContext>, Manager) {
        let set = ContextSet::new();
        let ctx = set.open(None);
        let manager = Manager::new(ctx.clone());
        (set, ctx, manager)
    }

    #[test]
    fn blocking_post_completes_inline() {
        let (_set, _ctx, manager) = setup();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let posted = manager
            .post(
                UserToken(1),
                &HintSet::new(),
                Box::new(move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                Target::Blocking,
            )
            .unwrap();
        assert!(matches!(posted, Posted::Completed(Ok(()))));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // never registered
        assert_eq!(manager.ops_in_flight(), 0);
    }

    #[test]
    fn queue_worker_pull_model() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::Queues).unwrap();
        let queue = manager.add_queue(worker).unwrap();
        let posted = manager
            .post(
                UserToken(7),
                &HintSet::new(),
                Box::new(|| Ok(())),
                Target::Queue(queue),
            )
            .unwrap();
        let op = match posted {
            Posted::Posted(op) => op,
            other => panic!("expected a registered post, got {other:?}"),
        };
        assert_eq!(manager.ops_in_flight(), 1);
        // work only happens when tested
        let got = manager
            .test_context(&ctx, 16, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].op, op);
        assert_eq!(got[0].token, UserToken(7));
        assert!(got[0].result.is_ok());
        assert_eq!(manager.ops_in_flight(), 0);
    }

    #[test]
    fn threaded_queue_services_without_test() {
        let (_set, ctx, manager) = setup();
        let worker = manager
            .add_worker(WorkerKind::ThreadedQueues { threads: 2 })
            .unwrap();
        let queue = manager.add_queue(worker).unwrap();
        for i in 0..8 {
            manager
                .post(
                    UserToken(i),
                    &HintSet::new(),
                    Box::new(|| Ok(())),
                    Target::Queue(queue),
                )
                .unwrap();
        }
        let mut seen = 0;
        while seen < 8 {
            let got = manager
                .test_context(&ctx, 8, Some(Duration::from_secs(5)))
                .unwrap();
            assert!(!got.is_empty(), "timed out waiting for completions");
            seen += got.len();
        }
        assert_eq!(manager.ops_in_flight(), 0);
    }

    #[test]
    fn per_op_worker_spawns() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::PerOp).unwrap();
        manager
            .post(
                UserToken(3),
                &HintSet::new(),
                Box::new(|| Err(PvfsError::ENOENT)),
                Target::Worker(worker),
            )
            .unwrap();
        let got = manager
            .test_context(&ctx, 4, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].result.unwrap_err(), PvfsError::ENOENT);
    }

    #[test]
    fn external_worker_backdoor() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::External).unwrap();
        let posted = manager
            .post(
                UserToken(9),
                &HintSet::new(),
                Box::new(|| Ok(())),
                Target::Worker(worker),
            )
            .unwrap();
        let op = match posted {
            Posted::Posted(op) => op,
            other => panic!("unexpected {other:?}"),
        };
        // nothing happens until the external driver acts
        assert!(manager
            .test_context(&ctx, 4, Some(Duration::from_millis(20)))
            .unwrap()
            .is_empty());
        let callout = manager.external_service(op).unwrap();
        let result = callout();
        manager.external_complete(op, result);
        let got = manager
            .test_context(&ctx, 4, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].op, op);
    }

    #[test]
    fn mapping_chain_in_registration_order() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::Queues).unwrap();
        let queue = manager.add_queue(worker).unwrap();
        // first callout passes, second claims, third never consulted
        manager.add_mapping(Box::new(|_| Target::Implicit));
        manager.add_mapping(Box::new(move |args| {
            if args.token == UserToken(42) {
                Target::Queue(queue)
            } else {
                Target::Implicit
            }
        }));
        let posted = manager
            .post(
                UserToken(42),
                &HintSet::new(),
                Box::new(|| Ok(())),
                Target::Implicit,
            )
            .unwrap();
        assert!(matches!(posted, Posted::Posted(_)));
        manager
            .test_context(&ctx, 4, Some(Duration::from_secs(5)))
            .unwrap();

        // unclaimed implicit posts fall back to blocking
        let posted = manager
            .post(
                UserToken(1),
                &HintSet::new(),
                Box::new(|| Ok(())),
                Target::Implicit,
            )
            .unwrap();
        assert!(matches!(posted, Posted::Completed(Ok(()))));
    }

    #[test]
    fn cancel_dequeues_pending_op() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::Queues).unwrap();
        let queue = manager.add_queue(worker).unwrap();
        let posted = manager
            .post(
                UserToken(5),
                &HintSet::new(),
                Box::new(|| panic!("cancelled op must not run")),
                Target::Queue(queue),
            )
            .unwrap();
        let op = match posted {
            Posted::Posted(op) => op,
            other => panic!("unexpected {other:?}"),
        };
        manager.cancel(op).unwrap();
        let got = manager
            .test_context(&ctx, 4, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].result.unwrap_err(), PvfsError::ECANCEL);
        assert_eq!(manager.ops_in_flight(), 0);
        assert_eq!(manager.cancel(op).unwrap_err(), PvfsError::ENOENT);
    }

    #[test]
    fn unknown_targets_rejected() {
        let (_set, _ctx, manager) = setup();
        let err = manager
            .post(
                UserToken(1),
                &HintSet::new(),
                Box::new(|| Ok(())),
                Target::Queue(QueueId(999)),
            )
            .unwrap_err();
        assert_eq!(err, PvfsError::EINVAL);
        assert!(matches!(
            manager.add_worker(WorkerKind::Pool),
            Err(PvfsError::ENOSYS)
        ));
    }

    #[test]
    fn completions_in_service_order_per_queue() {
        let (_set, ctx, manager) = setup();
        let worker = manager.add_worker(WorkerKind::Queues).unwrap();
        let queue = manager.add_queue(worker).unwrap();
        let mut posted = Vec::new();
        for i in 0..4 {
            match manager
                .post(
                    UserToken(i),
                    &HintSet::new(),
                    Box::new(|| Ok(())),
                    Target::Queue(queue),
                )
                .unwrap()
            {
                Posted::Posted(op) => posted.push(op),
                other => panic!("unexpected {other:?}"),
            }
        }
        let mut seen = Vec::new();
        while seen.len() < 4 {
            for c in manager
                .test_context(&ctx, 16, Some(Duration::from_secs(5)))
                .unwrap()
            {
                seen.push(c.op);
            }
        }
        assert_eq!(seen, posted);
    }
}
