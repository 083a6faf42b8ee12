//! The process-wide boundary-tag reservoir.
//!
//! Resource arenas (component C) need boundary tags to describe their own
//! address space, but tags themselves have to come from *somewhere* —
//! and that somewhere can't be the arena doing the allocating, or
//! bootstrapping the very first arena becomes circular (spec.md §9,
//! "Tag storage bootstrapping"). The fix, same as illumos vmem: a single
//! global reservoir of unused tags, replenished a whole frame at a time.
//!
//! The reservoir is a lock-free LIFO in the same style as the frame
//! allocator's free list (`crate::frame`), except the intrusive "next"
//! pointer lives directly on `Tag` (its `all_next` field, unused while a
//! tag sits outside any arena). Refilling the reservoir from a physical
//! frame is serialized by `inflate_lock` so at most one CPU carves a
//! frame into cells at a time (spec.md §4.C).

use arrayvec::ArrayVec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::Mutex;

use crate::addr::BASE_PAGE_SIZE;
use crate::error::ArenaError;
use crate::frame::PhysicalFrameProvider;
use crate::vmem::Tag;

/// Two tags for a new span plus one for a split, per mutating operation
/// (spec.md §4.C).
pub const MAX_TAGS_PER_ALLOCATION: usize = 3;

pub struct TagPool {
    head: AtomicPtr<Tag>,
    inflate_lock: Mutex<()>,
}

unsafe impl Send for TagPool {}
unsafe impl Sync for TagPool {}

impl TagPool {
    pub const fn new() -> TagPool {
        TagPool {
            head: AtomicPtr::new(core::ptr::null_mut()),
            inflate_lock: Mutex::new(()),
        }
    }

    /// Pop one tag cell off the reservoir, or `None` if it's empty.
    pub fn pop(&self) -> Option<NonNull<Tag>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let head_nn = NonNull::new(head)?;
            let next = unsafe { head_nn.as_ref().all_next };
            let next_ptr = next.map_or(core::ptr::null_mut(), |p| p.as_ptr());
            if self
                .head
                .compare_exchange(head, next_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head_nn);
            }
        }
    }

    /// Push one tag cell, previously obtained from [`TagPool::pop`] or
    /// freshly carved from a frame, back onto the reservoir.
    pub fn push(&self, mut tag: NonNull<Tag>) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                tag.as_mut().all_next = NonNull::new(head);
            }
            if self
                .head
                .compare_exchange(head, tag.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Guarantee at least `count` unused tags are available, returning
    /// that many popped from the pool. Inflates from `frames` (one whole
    /// physical frame, carved into tag-sized cells) when the pool can't
    /// satisfy the request outright; the leftover cells beyond `count`
    /// are donated back to the pool for the next caller.
    pub fn ensure(
        &self,
        count: usize,
        frames: &dyn PhysicalFrameProvider,
    ) -> Result<ArrayVec<NonNull<Tag>, MAX_TAGS_PER_ALLOCATION>, ArenaError> {
        debug_assert!(count <= MAX_TAGS_PER_ALLOCATION);
        let mut got: ArrayVec<NonNull<Tag>, MAX_TAGS_PER_ALLOCATION> = ArrayVec::new();

        while got.len() < count {
            match self.pop() {
                Some(tag) => got.push(tag),
                None => break,
            }
        }
        if got.len() == count {
            return Ok(got);
        }

        // Not enough cells: inflate from a fresh frame. Serialize so only
        // one CPU carves a frame at a time.
        let _guard = self.inflate_lock.lock();

        // Someone else may have inflated while we waited for the lock.
        while got.len() < count {
            match self.pop() {
                Some(tag) => got.push(tag),
                None => break,
            }
        }
        if got.len() == count {
            return Ok(got);
        }

        let frame = frames
            .allocate_frame()
            .map_err(|_| ArenaError::OutOfBoundaryTags)?;
        let cells_per_frame = BASE_PAGE_SIZE / core::mem::size_of::<Tag>();
        let base = crate::addr::direct_map(frame.base()) as *mut Tag;

        // SAFETY: `frame` was just allocated and is owned exclusively by
        // this call; it is `BASE_PAGE_SIZE` bytes, large enough for
        // `cells_per_frame` tag-sized cells, and nothing else aliases it.
        unsafe {
            for i in 0..cells_per_frame {
                let cell = base.add(i);
                cell.write(Tag::empty());
                let cell = NonNull::new_unchecked(cell);
                if got.len() < count {
                    got.push(cell);
                } else {
                    self.push(cell);
                }
            }
        }

        if got.len() == count {
            Ok(got)
        } else {
            Err(ArenaError::OutOfBoundaryTags)
        }
    }
}

impl Default for TagPool {
    fn default() -> Self {
        TagPool::new()
    }
}
