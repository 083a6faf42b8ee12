//! Component D: the slab / object cache.
//!
//! A `RawCache` hands out fixed-size objects carved out of slabs. Layout
//! is decided once at `init` time from `(object_size, alignment)`:
//! *small* objects embed their control block and free-list nodes in the
//! unused tail of the page they live on; *large* objects are tracked by
//! an externally allocated `SlabHeader`/`LargeObject` pair so the object
//! region itself never has to make room for bookkeeping. Both variants
//! share the same `available_slabs`/`full_slabs` transition logic and
//! the same cache-wide lock.
//!
//! Per spec.md §9's bootstrap note, a *large* cache's own metadata
//! (`SlabHeader` and `LargeObject` records) must come from caches that
//! don't themselves need the heap -- otherwise initializing the heap's
//! own quantum-cache slab caches would be circular. Callers supply two
//! small, `allocate_slabs_from_heap = false` bootstrap caches for this
//! (see `layout::Bootstrap`), the same role `nrk`'s `KernelAllocator`
//! gives its zone allocator's base-page refill path.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use arrayvec::ArrayString;
use hashbrown::HashMap;
use log::debug;
use spin::mutex::ticket::TicketMutex;

use crate::addr::{direct_map, PAGE_SIZE};
use crate::error::CacheError;
use crate::frame::PhysicalFrameProvider;
use crate::vmem::{Allocation, Arena, Policy};

/// Small objects trade the externally-tracked bookkeeping a large object
/// needs for one page-sized slab that carries its own control block and
/// free list inline. The boundary is spec's "object_size <= page_size / 8".
const SMALL_OBJECT_CEILING_DIVISOR: usize = 8;

/// Spec's `default_large_objects_per_slab`: large slabs span however
/// many pages this many objects would occupy, then pack as many objects
/// as actually fit in that many pages.
const DEFAULT_LARGE_OBJECTS_PER_SLAB: usize = 16;

pub const MAX_CACHE_NAME: usize = 32;

/// Called once per object slot when a slab is first carved up. A
/// constructor failure aborts that slab's allocation (spec's
/// `ObjectConstructionFailed`); objects already constructed earlier in
/// the same slab are destructed again via `destructor` before the slab
/// is abandoned, so partially-constructed slabs never leak into
/// `available_slabs`.
pub type Constructor = fn(*mut u8) -> Result<(), CacheError>;
/// Called once per live object when its slab is finally reclaimed.
pub type Destructor = fn(*mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Small,
    Large,
}

/// Intrusive doubly-linked list membership, reused for both
/// `available_slabs` and `full_slabs` (a slab is never on both).
struct SlabLink {
    prev: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
}

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Per-slab control block. For small objects this struct is placed in
/// the last `size_of::<SlabHeader>()` bytes of the backing page; for
/// large objects it is allocated from a dedicated metadata cache and
/// `base`/`page_count` describe the (separately-tracked) object region.
struct SlabHeader {
    link: SlabLink,
    free_list: Option<NonNull<FreeNode>>,
    allocated_count: usize,
    objects_per_slab: usize,
    /// Base address of the object region this slab hands objects out of
    /// (the page itself for small slabs; the externally allocated object
    /// region for large slabs).
    base: usize,
    /// Only set for large slabs: the arena allocation backing `base`,
    /// needed to release it on `deinit`/slab reclaim.
    large_backing: Option<Allocation>,
}

// The embedded-control-block layout only makes sense if the header itself
// leaves room for at least one object's worth of the page it lives in.
static_assertions::const_assert!(core::mem::size_of::<SlabHeader>() < PAGE_SIZE);

/// `{ buffer, owning_slab, link }` from spec.md §3, keyed in the cache's
/// hashmap on `buffer` (the object's address).
struct LargeObject {
    owning_slab: NonNull<SlabHeader>,
}

struct CacheInner {
    available_slabs: Option<NonNull<SlabHeader>>,
    full_slabs: Option<NonNull<SlabHeader>>,
    large_objects: HashMap<usize, LargeObject>,
}

/// Component D's object cache. `'a` ties a cache to the arena (and, for
/// large caches, the bootstrap metadata caches) it draws backing memory
/// from.
pub struct RawCache<'a> {
    name: ArrayString<MAX_CACHE_NAME>,
    object_size: usize,
    effective_object_size: usize,
    alignment: usize,
    size_class: SizeClass,
    objects_per_slab: usize,
    pages_per_slab: usize,
    source_arena: &'a Arena<'a>,
    frames: &'a dyn PhysicalFrameProvider,
    metadata_cache: Option<&'a RawCache<'a>>,
    constructor: Option<Constructor>,
    destructor: Option<Destructor>,
    deallocate_last_available_slab: bool,
    allocate_slabs_from_heap: bool,
    lock: TicketMutex<CacheInner>,
    allocate_mutex: TicketMutex<()>,
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl<'a> RawCache<'a> {
    /// Small-object cache: one page per slab, control block and free
    /// list embedded in the page's own tail bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn init_small(
        name: &str,
        object_size: usize,
        alignment: usize,
        source_arena: &'a Arena<'a>,
        frames: &'a dyn PhysicalFrameProvider,
        constructor: Option<Constructor>,
        destructor: Option<Destructor>,
        deallocate_last_available_slab: bool,
        allocate_slabs_from_heap: bool,
    ) -> Result<RawCache<'a>, CacheError> {
        debug_assert!(object_size <= PAGE_SIZE / SMALL_OBJECT_CEILING_DIVISOR);
        let effective_object_size = align_up(
            align_up(object_size, align_of::<FreeNode>()) + size_of::<FreeNode>(),
            alignment.max(1),
        );
        let objects_per_slab = (PAGE_SIZE - size_of::<SlabHeader>()) / effective_object_size;
        debug_assert!(objects_per_slab > 0, "object too large for a small-object slab");

        let cache = RawCache {
            name: ArrayString::from(name).map_err(|_| CacheError::SlabAllocationFailed)?,
            object_size,
            effective_object_size,
            alignment,
            size_class: SizeClass::Small,
            objects_per_slab,
            pages_per_slab: 1,
            source_arena,
            frames,
            metadata_cache: None,
            constructor,
            destructor,
            deallocate_last_available_slab,
            allocate_slabs_from_heap,
            lock: TicketMutex::new(CacheInner {
                available_slabs: None,
                full_slabs: None,
                large_objects: HashMap::new(),
            }),
            allocate_mutex: TicketMutex::new(()),
        };
        debug!(
            "cache {}: created (small, {} objects/slab, object size {})",
            cache.name, objects_per_slab, object_size
        );
        Ok(cache)
    }

    /// Large-object cache: slab metadata and per-object `LargeObject`
    /// records are allocated from `metadata_cache` (a small, non-heap
    /// bootstrap cache per spec.md §9), object storage itself always
    /// comes from `source_arena` and must be heap-backed.
    #[allow(clippy::too_many_arguments)]
    pub fn init_large(
        name: &str,
        object_size: usize,
        alignment: usize,
        source_arena: &'a Arena<'a>,
        frames: &'a dyn PhysicalFrameProvider,
        metadata_cache: &'a RawCache<'a>,
        constructor: Option<Constructor>,
        destructor: Option<Destructor>,
        deallocate_last_available_slab: bool,
    ) -> Result<RawCache<'a>, CacheError> {
        debug_assert!(object_size > PAGE_SIZE / SMALL_OBJECT_CEILING_DIVISOR);
        let target_bytes = DEFAULT_LARGE_OBJECTS_PER_SLAB * object_size;
        let pages_per_slab = (target_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let objects_per_slab = (pages_per_slab * PAGE_SIZE) / object_size;
        debug_assert!(objects_per_slab > 0);

        let cache = RawCache {
            name: ArrayString::from(name).map_err(|_| CacheError::SlabAllocationFailed)?,
            object_size,
            effective_object_size: object_size,
            alignment,
            size_class: SizeClass::Large,
            objects_per_slab,
            pages_per_slab,
            source_arena,
            frames,
            metadata_cache: Some(metadata_cache),
            constructor,
            destructor,
            deallocate_last_available_slab,
            allocate_slabs_from_heap: true,
            lock: TicketMutex::new(CacheInner {
                available_slabs: None,
                full_slabs: None,
                large_objects: HashMap::new(),
            }),
            allocate_mutex: TicketMutex::new(()),
        };
        debug!(
            "cache {}: created (large, {} objects/slab, object size {})",
            cache.name, objects_per_slab, object_size
        );
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    // -- list maintenance -------------------------------------------------

    unsafe fn list_push_front(list: &mut Option<NonNull<SlabHeader>>, mut slab: NonNull<SlabHeader>) {
        slab.as_mut().link.prev = None;
        slab.as_mut().link.next = *list;
        if let Some(mut head) = *list {
            head.as_mut().link.prev = Some(slab);
        }
        *list = Some(slab);
    }

    unsafe fn list_remove(list: &mut Option<NonNull<SlabHeader>>, mut slab: NonNull<SlabHeader>) {
        let prev = slab.as_ref().link.prev;
        let next = slab.as_ref().link.next;
        match prev {
            Some(mut p) => p.as_mut().link.next = next,
            None => *list = next,
        }
        if let Some(mut n) = next {
            n.as_mut().link.prev = prev;
        }
        slab.as_mut().link.prev = None;
        slab.as_mut().link.next = None;
    }

    // -- backing memory -----------------------------------------------------

    /// Obtain `pages_per_slab` pages of backing memory for a new slab's
    /// object region, returning its base address and the arena
    /// allocation to remember for release (`None` for bootstrap caches
    /// that pull a frame directly).
    fn obtain_slab_memory(&self) -> Result<(usize, Option<Allocation>), CacheError> {
        if self.allocate_slabs_from_heap {
            let alloc = self
                .source_arena
                .allocate(self.pages_per_slab * PAGE_SIZE, Policy::InstantFit)
                .map_err(|_| CacheError::SlabAllocationFailed)?;
            Ok((alloc.base, Some(alloc)))
        } else {
            debug_assert_eq!(self.pages_per_slab, 1, "bootstrap caches are always small-object");
            let frame = self
                .frames
                .allocate_frame()
                .map_err(|_| CacheError::SlabAllocationFailed)?;
            Ok((direct_map(frame.base()) as usize, None))
        }
    }

    fn release_slab_memory(&self, base: usize, backing: Option<Allocation>) {
        match backing {
            Some(alloc) => self.source_arena.deallocate(alloc),
            None => {
                // Bootstrap path: `base` is the direct-mapped address of
                // a single frame obtained via `frames.allocate_frame()`.
                // Recover the frame index from that same identity
                // mapping and hand it back.
                let frame = crate::frame::Frame((base / PAGE_SIZE) as u32);
                self.frames.deallocate_frame(frame);
            }
        }
    }

    /// Allocate a `SlabHeader` cell: from `metadata_cache` for large
    /// caches, or carved in-place at the tail of the slab's own page for
    /// small caches.
    fn new_slab_header(
        &self,
        base: usize,
        backing: Option<Allocation>,
    ) -> Result<NonNull<SlabHeader>, CacheError> {
        let header_ptr = match self.size_class {
            SizeClass::Small => (base + PAGE_SIZE - size_of::<SlabHeader>()) as *mut SlabHeader,
            SizeClass::Large => {
                let cache = self.metadata_cache.expect("large cache must have a metadata cache");
                cache.allocate()?.as_ptr() as *mut SlabHeader
            }
        };
        unsafe {
            header_ptr.write(SlabHeader {
                link: SlabLink { prev: None, next: None },
                free_list: None,
                allocated_count: 0,
                objects_per_slab: self.objects_per_slab,
                base,
                large_backing: backing,
            });
        }
        Ok(unsafe { NonNull::new_unchecked(header_ptr) })
    }

    fn object_region_len(&self) -> usize {
        match self.size_class {
            SizeClass::Small => PAGE_SIZE - size_of::<SlabHeader>(),
            SizeClass::Large => self.pages_per_slab * PAGE_SIZE,
        }
    }

    fn object_ptr(&self, base: usize, index: usize) -> *mut u8 {
        (base + index * self.effective_object_size) as *mut u8
    }

    /// Carve a brand new slab: obtain memory, build its header, link
    /// every object slot onto its free list, running the constructor on
    /// each. A constructor failure unwinds everything already
    /// constructed in this slab and returns the slab's memory.
    fn build_slab(&self) -> Result<NonNull<SlabHeader>, CacheError> {
        let (base, backing) = self.obtain_slab_memory()?;
        let header = match self.new_slab_header(base, backing) {
            Ok(h) => h,
            Err(e) => {
                self.release_slab_memory(base, backing);
                return Err(e);
            }
        };

        debug_assert!(self.objects_per_slab * self.effective_object_size <= self.object_region_len());

        let mut constructed = 0usize;
        let mut free_list: Option<NonNull<FreeNode>> = None;
        for i in 0..self.objects_per_slab {
            let obj = self.object_ptr(base, i);
            if let Some(ctor) = self.constructor {
                if let Err(e) = ctor(obj) {
                    // Roll back: destruct what succeeded, release memory.
                    if let Some(dtor) = self.destructor {
                        let mut cur = free_list;
                        let mut undone = 0;
                        while let Some(node) = cur {
                            let obj_base = node.as_ptr() as usize - self.free_node_offset();
                            dtor(obj_base as *mut u8);
                            cur = unsafe { node.as_ref().next };
                            undone += 1;
                        }
                        debug_assert_eq!(undone, constructed);
                    }
                    self.free_large_header_if_any(header);
                    self.release_slab_memory(base, backing);
                    return Err(e);
                }
            }
            constructed += 1;
            let node_ptr = unsafe { obj.add(self.free_node_offset()) } as *mut FreeNode;
            unsafe {
                node_ptr.write(FreeNode { next: free_list });
            }
            free_list = Some(unsafe { NonNull::new_unchecked(node_ptr) });
        }

        unsafe {
            header.as_ptr().as_mut().unwrap().free_list = free_list;
        }
        Ok(header)
    }

    /// Byte offset from an object's base to where its embedded
    /// `FreeNode` lives while free. Zero for large objects: their free
    /// node lives in the separately allocated `SlabHeader`'s bookkeeping
    /// via the large-object hashmap instead, so this offset is only
    /// meaningful for the small-object path.
    fn free_node_offset(&self) -> usize {
        match self.size_class {
            SizeClass::Small => {
                align_up(self.object_size, align_of::<FreeNode>())
            }
            SizeClass::Large => 0,
        }
    }

    fn free_large_header_if_any(&self, header: NonNull<SlabHeader>) {
        if self.size_class == SizeClass::Large {
            let cache = self.metadata_cache.expect("large cache must have a metadata cache");
            cache.free(unsafe { NonNull::new_unchecked(header.as_ptr() as *mut u8) });
        }
    }

    // -- allocate / free ----------------------------------------------------

    /// Pop one object. If no slab has a free object, drops the cache
    /// lock, takes `allocate_mutex`, re-checks (another executor may
    /// have refilled meanwhile), builds a new slab from `source_arena`
    /// (or a bare frame for bootstrap caches), then re-acquires the lock
    /// and links the slab onto `available_slabs`.
    pub fn allocate(&self) -> Result<NonNull<u8>, CacheError> {
        {
            let mut inner = self.lock.lock();
            if let Some(ptr) = self.take_from_available(&mut inner) {
                return Ok(ptr);
            }
        }

        let _refill = self.allocate_mutex.lock();
        {
            let mut inner = self.lock.lock();
            if let Some(ptr) = self.take_from_available(&mut inner) {
                return Ok(ptr);
            }
        }

        let slab = self.build_slab()?;
        let mut inner = self.lock.lock();
        unsafe { Self::list_push_front(&mut inner.available_slabs, slab) };
        self.take_from_available(&mut inner)
            .ok_or(CacheError::SlabAllocationFailed)
    }

    fn take_from_available(&self, inner: &mut CacheInner) -> Option<NonNull<u8>> {
        let mut slab = inner.available_slabs?;
        let (obj_ptr, now_full) = unsafe {
            let s = slab.as_mut();
            let node = s.free_list.take()?;
            s.free_list = node.as_ref().next;
            s.allocated_count += 1;
            let obj_base = node.as_ptr() as usize - self.free_node_offset();
            (obj_base, s.free_list.is_none())
        };

        if self.size_class == SizeClass::Large {
            inner.large_objects.insert(obj_ptr, LargeObject { owning_slab: slab });
        }

        if now_full {
            unsafe {
                Self::list_remove(&mut inner.available_slabs, slab);
                Self::list_push_front(&mut inner.full_slabs, slab);
            }
        }

        Some(unsafe { NonNull::new_unchecked(obj_ptr as *mut u8) })
    }

    /// Return `n` freshly constructed objects in one call. Implemented
    /// as repeated `allocate`; a later failure leaves earlier
    /// allocations live rather than unwinding them, matching how a
    /// caller iterating `allocate` one at a time would behave.
    pub fn allocate_many(&self, n: usize) -> Result<alloc::vec::Vec<NonNull<u8>>, CacheError> {
        let mut out = alloc::vec::Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.allocate()?);
        }
        Ok(out)
    }

    /// Return an object to its slab. Moves the slab from `full_slabs`
    /// back to `available_slabs` on the full -> not-full transition; on
    /// the all-objects-free transition deallocates the slab unless it
    /// is the sole available slab and `deallocate_last_available_slab`
    /// is false (last-slab retention).
    pub fn free(&self, ptr: NonNull<u8>) {
        let mut inner = self.lock.lock();

        let mut slab = match self.size_class {
            SizeClass::Large => {
                let obj = inner
                    .large_objects
                    .remove(&(ptr.as_ptr() as usize))
                    .expect("free: pointer is not a live object of this cache");
                obj.owning_slab
            }
            SizeClass::Small => self.small_slab_for_ptr(ptr),
        };

        let was_full = unsafe { slab.as_ref().free_list.is_none() };
        let node_ptr = unsafe { (ptr.as_ptr() as usize + self.free_node_offset()) as *mut FreeNode };
        unsafe {
            let s = slab.as_mut();
            node_ptr.write(FreeNode { next: s.free_list });
            s.free_list = Some(NonNull::new_unchecked(node_ptr));
            s.allocated_count -= 1;
        }

        if was_full {
            unsafe {
                Self::list_remove(&mut inner.full_slabs, slab);
                Self::list_push_front(&mut inner.available_slabs, slab);
            }
        }

        let now_empty = unsafe { slab.as_ref().allocated_count == 0 };
        if now_empty {
            let is_sole_available = unsafe {
                inner.available_slabs == Some(slab) && slab.as_ref().link.next.is_none()
            };
            if self.deallocate_last_available_slab || !is_sole_available {
                unsafe { Self::list_remove(&mut inner.available_slabs, slab) };
                self.reclaim_slab(slab);
            }
        }
    }

    pub fn free_many(&self, ptrs: &[NonNull<u8>]) {
        for &p in ptrs {
            self.free(p);
        }
    }

    /// Reverse lookup for a small-object pointer: align down to the
    /// page, then the control block sits at `page_base + PAGE_SIZE -
    /// size_of::<SlabHeader>()` (spec.md §4.D, testable property 5).
    fn small_slab_for_ptr(&self, ptr: NonNull<u8>) -> NonNull<SlabHeader> {
        let page_base = (ptr.as_ptr() as usize) & !(PAGE_SIZE - 1);
        let header_addr = page_base + PAGE_SIZE - size_of::<SlabHeader>();
        unsafe { NonNull::new_unchecked(header_addr as *mut SlabHeader) }
    }

    /// Run every live object's destructor, then release the slab's
    /// backing memory (and, for large slabs, its externally allocated
    /// header).
    fn reclaim_slab(&self, slab: NonNull<SlabHeader>) {
        let (base, backing) = unsafe {
            let s = slab.as_ref();
            (s.base, s.large_backing)
        };

        if let Some(dtor) = self.destructor {
            // Live objects aren't tracked directly on a freed slab (the
            // free list only names free slots), so destructing "every
            // live object" here means every slot not on the free list.
            let mut on_free_list = alloc::collections::BTreeSet::new();
            let mut cur = unsafe { slab.as_ref().free_list };
            while let Some(node) = cur {
                let obj_base = node.as_ptr() as usize - self.free_node_offset();
                on_free_list.insert(obj_base);
                cur = unsafe { node.as_ref().next };
            }
            for i in 0..self.objects_per_slab {
                let obj = self.object_ptr(base, i);
                if !on_free_list.contains(&(obj as usize)) {
                    dtor(obj);
                }
            }
        }

        self.free_large_header_if_any(slab);
        self.release_slab_memory(base, backing);
    }

    /// Destruct every live object across every slab and release all
    /// backing memory. Leaves the cache empty but reusable.
    pub fn deinit(&self) {
        let mut inner = self.lock.lock();
        let mut slabs = alloc::vec::Vec::new();
        let mut cur = inner.available_slabs.take();
        while let Some(s) = cur {
            cur = unsafe { s.as_ref().link.next };
            slabs.push(s);
        }
        let mut cur = inner.full_slabs.take();
        while let Some(s) = cur {
            cur = unsafe { s.as_ref().link.next };
            slabs.push(s);
        }
        inner.large_objects.clear();
        drop(inner);

        for slab in slabs {
            self.reclaim_slab(slab);
        }
    }

    /// True if every slab's bookkeeping is internally consistent
    /// (spec.md §8 property 6): `allocated_count == objects_per_slab -
    /// free_list_length` for each slab, and no slab sits on the wrong
    /// list. Intended for tests.
    #[cfg(test)]
    fn check_invariants(&self) -> bool {
        let inner = self.lock.lock();
        let mut ok = true;
        let mut cur = inner.available_slabs;
        while let Some(s) = cur {
            let r = unsafe { s.as_ref() };
            let free_len = Self::free_list_len(r.free_list);
            ok &= r.allocated_count == r.objects_per_slab - free_len;
            ok &= free_len > 0;
            cur = r.link.next;
        }
        let mut cur = inner.full_slabs;
        while let Some(s) = cur {
            let r = unsafe { s.as_ref() };
            let free_len = Self::free_list_len(r.free_list);
            ok &= r.allocated_count == r.objects_per_slab - free_len;
            ok &= free_len == 0;
            cur = r.link.next;
        }
        ok
    }

    #[cfg(test)]
    fn free_list_len(mut head: Option<NonNull<FreeNode>>) -> usize {
        let mut n = 0;
        while let Some(node) = head {
            n += 1;
            head = unsafe { node.as_ref().next };
        }
        n
    }

    #[cfg(test)]
    fn available_slab_count(&self) -> usize {
        let inner = self.lock.lock();
        let mut n = 0;
        let mut cur = inner.available_slabs;
        while let Some(s) = cur {
            n += 1;
            cur = unsafe { s.as_ref().link.next };
        }
        n
    }
}

unsafe impl<'a> Send for RawCache<'a> {}
unsafe impl<'a> Sync for RawCache<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{VAddr, BASE_PAGE_SIZE};
    use crate::collab::{BootMemoryMap, BootRegion, BootRegionType, VRange};
    use crate::frame::FrameAllocator;
    use crate::tagpool::TagPool;
    use alloc::vec;
    use alloc::vec::Vec;

    struct FakeMap(Vec<BootRegion>);
    impl BootMemoryMap for FakeMap {
        type Iter = alloc::vec::IntoIter<BootRegion>;
        fn ascending(&self) -> Self::Iter {
            self.0.clone().into_iter()
        }
    }

    fn frames(pages: u64) -> FrameAllocator {
        let map = FakeMap(vec![BootRegion {
            range: VRange::new(VAddr::from_u64(0), VAddr::from_u64(pages * BASE_PAGE_SIZE as u64)),
            kind: BootRegionType::Free,
        }]);
        FrameAllocator::init(&map, |_| false)
    }

    #[test]
    fn small_object_round_trip_is_disjoint_and_reverse_lookupable() {
        let pool = TagPool::new();
        let fa = frames(64);
        let arena = Arena::create("heap", BASE_PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0, 32 * BASE_PAGE_SIZE).unwrap();

        let cache =
            RawCache::init_small("objs64", 64, 8, &arena, &fa, None, None, false, true).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..120 {
            let p = cache.allocate().unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            ptrs.push(p);
        }
        let mut sorted = ptrs.clone();
        sorted.sort_by_key(|p| p.as_ptr() as usize);
        sorted.dedup_by_key(|p| p.as_ptr() as usize);
        assert_eq!(sorted.len(), ptrs.len(), "allocations must be pairwise disjoint");

        assert!(cache.check_invariants());

        for &p in ptrs.iter().rev() {
            cache.free(p);
        }
        assert!(cache.check_invariants());
        // deallocate_last_available_slab = false above: one empty slab
        // stays around instead of being released.
        assert_eq!(cache.available_slab_count(), 1);
    }

    #[test]
    fn last_slab_retention_drops_to_zero_when_enabled() {
        let pool = TagPool::new();
        let fa = frames(64);
        let arena = Arena::create("heap", BASE_PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0, 32 * BASE_PAGE_SIZE).unwrap();

        let cache =
            RawCache::init_small("objs64", 64, 8, &arena, &fa, None, None, true, true).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..120 {
            ptrs.push(cache.allocate().unwrap());
        }
        for p in ptrs {
            cache.free(p);
        }
        assert_eq!(cache.available_slab_count(), 0);
    }

    #[test]
    fn large_object_cache_round_trips_through_metadata_cache() {
        let pool = TagPool::new();
        let fa = frames(256);
        let arena = Arena::create("heap", BASE_PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0, 128 * BASE_PAGE_SIZE).unwrap();

        let meta = RawCache::init_small(
            "slabhdr",
            size_of::<SlabHeader>(),
            align_of::<SlabHeader>(),
            &arena,
            &fa,
            None,
            None,
            false,
            false,
        )
        .unwrap();

        let large = RawCache::init_large("big", 4096 * 2, 8, &arena, &fa, &meta, None, None, false).unwrap();

        let a = large.allocate().unwrap();
        let b = large.allocate().unwrap();
        assert_ne!(a, b);
        assert!(large.check_invariants());
        large.free(a);
        large.free(b);
        assert!(large.check_invariants());
    }
}
