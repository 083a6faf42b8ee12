//! Component B: the TLB-shootdown / flush-request coordinator.
//!
//! Each executor (CPU) owns a lock-free, single-consumer LIFO of pending
//! flush requests -- the same Treiber-stack shape `crate::tagpool` uses
//! for the boundary-tag reservoir, here keyed per executor and wrapped in
//! `crossbeam_utils::CachePadded` (the same padding `nrk::memory::
//! GlobalMemory::node_caches` applies to its per-NUMA-node locks) so two
//! executors' queue heads never share a cache line. A request's per-CPU
//! attachment nodes live inline in the request itself (spec's "per-cpu
//! attachment nodes" field) rather than being heap-allocated per
//! submission, so `submit_and_wait` never allocates.
//!
//! The coordinator never takes an allocator lock (spec.md §5): it only
//! touches its own queues, the request's `pending_count`, and the
//! `PagingBackend`/`InterruptController` collaborators.

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use crossbeam_utils::CachePadded;

use crate::collab::{ExecutorId, InterruptController, PagingBackend, ProcessId, VRange};

/// Bounds the per-request node array and the coordinator's queue table.
pub const MAX_EXECUTORS: usize = 64;

/// Sentinel meaning "no process currently attached to this executor".
const UNATTACHED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    Kernel,
    User(ProcessId),
}

/// One executor's attachment point in a request's intrusive queue link.
struct FlushNode {
    next: AtomicPtr<FlushNode>,
    /// Back-pointer to the owning request, published by the `Relaxed`
    /// store in `FlushCoordinator::push` right before the release CAS
    /// that links the node in; the consumer's acquire load of that same
    /// queue head makes this write visible before it dereferences.
    request: AtomicPtr<FlushRequest>,
}

impl FlushNode {
    const fn empty() -> FlushNode {
        FlushNode {
            next: AtomicPtr::new(core::ptr::null_mut()),
            request: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// A coordinated TLB invalidation delivered to a set of executors.
/// Exists on the submitter's stack until `submit_and_wait` returns --
/// `pending_count` reaching zero is the only thing that makes it safe to
/// drop or reuse the storage.
pub struct FlushRequest {
    range: VRange,
    target: FlushTarget,
    pending_count: AtomicUsize,
    nodes: ArrayVec<FlushNode, MAX_EXECUTORS>,
}

impl FlushRequest {
    pub fn new(range: VRange, target: FlushTarget) -> FlushRequest {
        let mut nodes = ArrayVec::new();
        for _ in 0..MAX_EXECUTORS {
            nodes.push(FlushNode::empty());
        }
        FlushRequest {
            range,
            target,
            // One implicit "pending decrement" for the submitter's own
            // local flush, matching scenario 4's 1 -> N -> ... -> 0 walk.
            pending_count: AtomicUsize::new(1),
            nodes,
        }
    }

    pub fn range(&self) -> VRange {
        self.range
    }

    pub fn target(&self) -> FlushTarget {
        self.target
    }
}

pub struct FlushCoordinator {
    queues: alloc::vec::Vec<CachePadded<AtomicPtr<FlushNode>>>,
    attached: alloc::vec::Vec<CachePadded<AtomicU64>>,
    executor_count: usize,
}

impl FlushCoordinator {
    pub fn new(executor_count: usize) -> FlushCoordinator {
        assert!(
            executor_count <= MAX_EXECUTORS,
            "executor_count {} exceeds MAX_EXECUTORS {}",
            executor_count,
            MAX_EXECUTORS
        );
        let queues = (0..executor_count)
            .map(|_| CachePadded::new(AtomicPtr::new(core::ptr::null_mut())))
            .collect();
        let attached = (0..executor_count)
            .map(|_| CachePadded::new(AtomicU64::new(UNATTACHED)))
            .collect();
        FlushCoordinator {
            queues,
            attached,
            executor_count,
        }
    }

    pub fn executor_count(&self) -> usize {
        self.executor_count
    }

    /// Record which process `executor` is currently running, so a
    /// `user`-targeted flush can skip executors not attached to that
    /// process. The owning scheduler (out of scope) is expected to call
    /// this on every context switch.
    pub fn set_attached_process(&self, executor: ExecutorId, pid: Option<ProcessId>) {
        self.attached[executor as usize].store(pid.unwrap_or(UNATTACHED), Ordering::Release);
    }

    fn attached_process(&self, executor: ExecutorId) -> Option<ProcessId> {
        let v = self.attached[executor as usize].load(Ordering::Acquire);
        if v == UNATTACHED {
            None
        } else {
            Some(v)
        }
    }

    fn push(&self, executor: usize, node: *const FlushNode) {
        let head = &self.queues[executor];
        loop {
            let cur = head.load(Ordering::Acquire);
            unsafe {
                (*node).next.store(cur, Ordering::Relaxed);
            }
            if head
                .compare_exchange(cur, node as *mut FlushNode, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Fan the request out to every executor but `self_id`, run the local
    /// flush, then spin until every remote decrement has landed. Drains
    /// this executor's own queue while spinning, so a concurrent request
    /// from another executor cannot deadlock against us.
    ///
    /// Preemption on the caller is expected to already be disabled by
    /// the scheduler (spec.md §4.B step 1); this crate has no scheduler
    /// to disable, so that step has no code here.
    pub fn submit_and_wait(
        &self,
        request: &FlushRequest,
        self_id: ExecutorId,
        paging: &mut dyn PagingBackend,
        interrupts: &dyn InterruptController,
    ) {
        debug_assert!((self_id as usize) < self.executor_count);

        for executor in 0..self.executor_count {
            if executor == self_id as usize {
                continue;
            }
            let node = &request.nodes[executor];
            node.request
                .store(request as *const FlushRequest as *mut FlushRequest, Ordering::Relaxed);
            request.pending_count.fetch_add(1, Ordering::AcqRel);
            self.push(executor, node as *const FlushNode);
            interrupts.send_flush_ipi(executor as ExecutorId);
        }

        paging.flush_cache(request.range);
        request.pending_count.fetch_sub(1, Ordering::Release);

        while request.pending_count.load(Ordering::Acquire) != 0 {
            self.process_pending_on_self(self_id, paging);
            core::hint::spin_loop();
        }
    }

    /// Service every request queued for executor `me`. Runs with
    /// interrupts or preemption disabled on real hardware (spec.md
    /// §4.B); also called by `submit_and_wait` itself while spinning, so
    /// a submitter that is also a flush target for someone else's
    /// request keeps making progress.
    pub fn process_pending_on_self(&self, me: ExecutorId, paging: &mut dyn PagingBackend) {
        let head = &self.queues[me as usize];
        loop {
            let cur = head.load(Ordering::Acquire);
            if cur.is_null() {
                return;
            }
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            if head
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // SAFETY: `cur` was published with a release CAS in `push`;
            // the acquire CAS above synchronizes-with it, so the node's
            // `request` field and the request it points at are visible.
            let node = unsafe { &*cur };
            let req_ptr = node.request.load(Ordering::Relaxed);
            let req = unsafe { &*req_ptr };

            let skip = match req.target {
                FlushTarget::Kernel => false,
                FlushTarget::User(pid) => self.attached_process(me) != Some(pid),
            };
            if !skip {
                paging.flush_cache(req.range);
            }
            req.pending_count.fetch_sub(1, Ordering::Release);
        }
    }
}
