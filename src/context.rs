//! Completion contexts.
//!
//! A context is where finished operations surface.  It is either a
//! queue (callers drain it with the test calls) or a registered
//! callback invoked synchronously on the thread that finished the
//! operation.  Contexts are refcounted: a context still referenced by a
//! manager, or with undelivered completions, cannot be closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PvfsError, PvfsResult};

/// Identifier of an open context.
pub type ContextId = u64;

/// Identifier of a posted operation, assigned at post time and stable
/// for the operation's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpId(pub u64);

/// Caller-owned token carried through post and returned with the
/// completion.  The dispatcher keys its request slots with it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct UserToken(pub u64);

/// A finished operation as delivered to the poster.
#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub op: OpId,
    pub token: UserToken,
    pub result: PvfsResult<()>,
}

/// Callback form of a context.
pub type CompletionCallback = Box<dyn Fn(Completion) + Send + Sync>;

enum Kind {
    Queue {
        queue: Mutex<VecDeque<Completion>>,
        ready: Condvar,
    },
    Callback(CompletionCallback),
}

/// A completion context.
pub struct CompletionContext {
    id: ContextId,
    kind: Kind,
}

impl CompletionContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.kind, Kind::Callback(_))
    }

    /// Deliver a completion: enqueue it, or run the callback on the
    /// calling thread.
    pub fn complete(&self, completion: Completion) {
        match &self.kind {
            Kind::Queue { queue, ready } => {
                queue.lock().push_back(completion);
                ready.notify_all();
            }
            Kind::Callback(callback) => callback(completion),
        }
    }

    /// Undelivered completions (zero for callback contexts).
    pub fn queue_len(&self) -> usize {
        match &self.kind {
            Kind::Queue { queue, .. } => queue.lock().len(),
            Kind::Callback(_) => 0,
        }
    }

    /// Drain up to `capacity` completions, waiting up to `timeout` for
    /// the first one (`None` waits indefinitely).  An empty vector
    /// means the wait timed out.  Callback contexts cannot be tested.
    pub fn test_all(
        &self,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> PvfsResult<Vec<Completion>> {
        let (queue, ready) = match &self.kind {
            Kind::Queue { queue, ready } => (queue, ready),
            Kind::Callback(_) => return Err(PvfsError::EINVAL),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut q = queue.lock();
        loop {
            if !q.is_empty() {
                let n = capacity.min(q.len());
                return Ok(q.drain(..n).collect());
            }
            match deadline {
                None => ready.wait(&mut q),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    ready.wait_for(&mut q, deadline - now);
                }
            }
        }
    }

    /// Remove and return the completion of one specific operation.
    /// `ENOMSG` when the wait expires with nothing to deliver.
    pub fn test(&self, op: OpId, timeout: Option<Duration>) -> PvfsResult<Completion> {
        let (queue, ready) = match &self.kind {
            Kind::Queue { queue, ready } => (queue, ready),
            Kind::Callback(_) => return Err(PvfsError::EINVAL),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut q = queue.lock();
        loop {
            if let Some(pos) = q.iter().position(|c| c.op == op) {
                return Ok(q.remove(pos).expect("position just found"));
            }
            match deadline {
                None => ready.wait(&mut q),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PvfsError::ENOMSG);
                    }
                    ready.wait_for(&mut q, deadline - now);
                }
            }
        }
    }
}

/// The set of open contexts.  Whoever owns the set (normally the client
/// core) allocates ids from it.
pub struct ContextSet {
    contexts: Mutex<Vec<Arc<CompletionContext>>>,
    next_id: AtomicU64,
}

impl Default for ContextSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextSet {
    pub fn new() -> ContextSet {
        ContextSet {
            contexts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a context.  With no callback a queue is attached; otherwise
    /// completions invoke the callback.
    pub fn open(&self, callback: Option<CompletionCallback>) -> Arc<CompletionContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = match callback {
            Some(cb) => Kind::Callback(cb),
            None => Kind::Queue {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            },
        };
        let ctx = Arc::new(CompletionContext { id, kind });
        self.contexts.lock().push(ctx.clone());
        ctx
    }

    pub fn get(&self, id: ContextId) -> Option<Arc<CompletionContext>> {
        self.contexts.lock().iter().find(|c| c.id == id).cloned()
    }

    /// Close a context.  Fails with `EBUSY` while completions are
    /// undelivered or outside references (a manager, a tester) remain.
    pub fn close(&self, id: ContextId) -> PvfsResult<()> {
        let mut contexts = self.contexts.lock();
        let pos = contexts
            .iter()
            .position(|c| c.id == id)
            .ok_or(PvfsError::EINVAL)?;
        if contexts[pos].queue_len() > 0 || Arc::strong_count(&contexts[pos]) > 1 {
            return Err(PvfsError::EBUSY);
        }
        contexts.remove(pos);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn completion(op: u64) -> Completion {
        Completion {
            op: OpId(op),
            token: UserToken(op * 10),
            result: Ok(()),
        }
    }

    #[test]
    fn queue_context_accounting() {
        let set = ContextSet::new();
        let ctx = set.open(None);
        for i in 0..5 {
            ctx.complete(completion(i));
        }
        // completions delivered minus observed equals queue length
        let got = ctx.test_all(3, Some(Duration::ZERO)).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(ctx.queue_len(), 2);
        let got = ctx.test_all(16, Some(Duration::ZERO)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(ctx.queue_len(), 0);
    }

    #[test]
    fn test_all_times_out_empty() {
        let set = ContextSet::new();
        let ctx = set.open(None);
        let got = ctx.test_all(8, Some(Duration::from_millis(5))).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_removes_only_matching_entry() {
        let set = ContextSet::new();
        let ctx = set.open(None);
        ctx.complete(completion(1));
        ctx.complete(completion(2));
        ctx.complete(completion(3));
        let got = ctx.test(OpId(2), Some(Duration::ZERO)).unwrap();
        assert_eq!(got.token, UserToken(20));
        assert_eq!(ctx.queue_len(), 2);
        assert_eq!(
            ctx.test(OpId(9), Some(Duration::from_millis(5))).unwrap_err(),
            PvfsError::ENOMSG
        );
    }

    #[test]
    fn callback_context_runs_synchronously() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let set = ContextSet::new();
        let ctx = set.open(Some(Box::new(|c| {
            assert_eq!(c.op, OpId(7));
            CALLS.fetch_add(1, Ordering::SeqCst);
        })));
        ctx.complete(completion(7));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.queue_len(), 0);
        // a callback context cannot be tested
        assert_eq!(
            ctx.test_all(1, Some(Duration::ZERO)).unwrap_err(),
            PvfsError::EINVAL
        );
    }

    #[test]
    fn close_refuses_busy_contexts() {
        let set = ContextSet::new();
        let ctx = set.open(None);
        let id = ctx.id();
        // outside reference held
        assert_eq!(set.close(id).unwrap_err(), PvfsError::EBUSY);
        ctx.complete(completion(1));
        drop(ctx);
        // queue non-empty
        assert_eq!(set.close(id).unwrap_err(), PvfsError::EBUSY);
        let ctx = set.get(id).unwrap();
        ctx.test_all(1, Some(Duration::ZERO)).unwrap();
        drop(ctx);
        set.close(id).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.close(id).unwrap_err(), PvfsError::EINVAL);
    }

    #[test]
    fn waiting_test_sees_cross_thread_completion() {
        let set = ContextSet::new();
        let ctx = set.open(None);
        let ctx2 = ctx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ctx2.complete(completion(4));
        });
        let got = ctx.test(OpId(4), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(got.token, UserToken(40));
        handle.join().unwrap();
    }
}
