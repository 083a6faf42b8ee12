//! Component A: the physical frame allocator.
//!
//! A single global free list of physical page frames, implemented as a
//! lock-free Treiber stack over one `AtomicU32` per frame (the same
//! "next pointer embedded in the freed node" trick `nrk`'s slab caches
//! use for object free lists, applied here one level down at the frame
//! granularity). `PageRegion`s hold the backing storage for a contiguous
//! run of frames and are kept in a vector sorted by base frame index for
//! binary-search lookup, mirroring spec.md §3's "regions are kept sorted
//! for binary-search lookup from frame index -> page descriptor".
//!
//! NUMA placement (`nrk::memory::{TCache, NCache, GlobalMemory}`) is an
//! explicit spec Non-goal and is not reproduced here: this is one free
//! list, global to the core.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{error, trace};

use crate::addr::{PAddr, BASE_PAGE_SIZE};
use crate::collab::{BootMemoryMap, BootRegionType};
use crate::error::FrameError;

/// Sentinel: this frame is currently allocated (not on the free list).
const IN_USE: u32 = u32::MAX;
/// Sentinel: this frame is free and is the tail of the free list.
const FREE_TAIL: u32 = u32::MAX - 1;
/// No region may claim a frame index at or above this; keeps `IN_USE`/
/// `FREE_TAIL` from colliding with a real index.
pub const MAX_FRAMES: u32 = u32::MAX - 2;

/// An opaque index into the physical frame space. Base address of the
/// frame is `index * BASE_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub u32);

impl Frame {
    pub fn index(self) -> u32 {
        self.0
    }

    pub fn base(self) -> PAddr {
        PAddr::from(self.0 as usize * BASE_PAGE_SIZE)
    }
}

/// A contiguous run of physical frames and their per-frame free-list
/// state. One `AtomicU32` slot per frame: `IN_USE`, `FREE_TAIL`, or the
/// local index (relative to `base_frame`) of the next free frame in this
/// region's portion of the chain.
struct PageRegion {
    base_frame: u32,
    frame_count: u32,
    slots: Vec<AtomicU32>,
}

impl PageRegion {
    fn local(&self, frame: u32) -> usize {
        (frame - self.base_frame) as usize
    }
}

/// The physical frame allocator: one global lock-free LIFO of free
/// frames plus a monotone `free_memory` counter (spec.md §5: "release on
/// publish, acquire on read").
pub struct FrameAllocator {
    regions: Vec<PageRegion>,
    /// Global frame index of the head of the free list, or `FREE_TAIL` if empty.
    free_head: AtomicU32,
    free_memory: AtomicUsize,
    total_memory: AtomicUsize,
}

impl FrameAllocator {
    /// Build an allocator from a boot memory map. `preused` identifies
    /// frames the boot loader's early page-table construction already
    /// consumed: those frames are recorded `in_use` but never linked
    /// into the free list (spec.md §4.A).
    pub fn init<M: BootMemoryMap>(map: &M, preused: impl Fn(PAddr) -> bool) -> FrameAllocator {
        let mut regions = Vec::new();
        let mut free_head = FREE_TAIL;
        let mut free_memory = 0usize;
        let mut total_memory = 0usize;

        for region in map.ascending() {
            if region.kind != BootRegionType::Free {
                continue;
            }
            let start = region.range.start.as_u64();
            let end = region.range.end.as_u64();
            debug_assert_eq!(start % BASE_PAGE_SIZE as u64, 0);
            debug_assert_eq!(end % BASE_PAGE_SIZE as u64, 0);

            let base_frame = (start / BASE_PAGE_SIZE as u64) as u32;
            let frame_count = ((end - start) / BASE_PAGE_SIZE as u64) as u32;
            if frame_count == 0 {
                continue;
            }

            let mut slots = Vec::with_capacity(frame_count as usize);
            for local in 0..frame_count {
                let frame = base_frame + local;
                let paddr = PAddr::from(frame as usize * BASE_PAGE_SIZE);
                total_memory += BASE_PAGE_SIZE;
                if preused(paddr) {
                    slots.push(AtomicU32::new(IN_USE));
                } else {
                    free_memory += BASE_PAGE_SIZE;
                    // Temporarily store the *global* next pointer; fixed
                    // up to a local one once the whole region is built
                    // and we know the chain's shape.
                    slots.push(AtomicU32::new(free_head));
                    free_head = frame;
                }
            }

            regions.push(PageRegion {
                base_frame,
                frame_count,
                slots,
            });
        }

        regions.sort_by_key(|r| r.base_frame);

        FrameAllocator {
            regions,
            free_head: AtomicU32::new(free_head),
            free_memory: AtomicUsize::new(free_memory),
            total_memory: AtomicUsize::new(total_memory),
        }
    }

    fn region_for(&self, frame: u32) -> Option<&PageRegion> {
        self.regions
            .binary_search_by(|r| {
                if frame < r.base_frame {
                    core::cmp::Ordering::Greater
                } else if frame >= r.base_frame + r.frame_count {
                    core::cmp::Ordering::Less
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .ok()
            .map(|idx| &self.regions[idx])
    }

    fn slot(&self, frame: u32) -> &AtomicU32 {
        let region = self
            .region_for(frame)
            .expect("frame index not covered by any region");
        &region.slots[region.local(frame)]
    }

    /// Pop a frame off the free list. Lock-free Treiber pop.
    pub fn allocate(&self) -> Result<Frame, FrameError> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head == FREE_TAIL {
                error!("frame allocator: out of physical frames");
                return Err(FrameError::FramesExhausted);
            }
            let next = self.slot(head).load(Ordering::Acquire);
            if self
                .free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.slot(head).store(IN_USE, Ordering::Release);
                self.free_memory
                    .fetch_sub(BASE_PAGE_SIZE, Ordering::Release);
                trace!("frame allocator: allocated frame {}", head);
                return Ok(Frame(head));
            }
        }
    }

    /// Push a frame back onto the free list.
    ///
    /// # Panics
    /// Panics if `frame` is not currently `in_use` — a double-free is a
    /// programming error the core must abort on (spec.md §7), in debug
    /// and release builds alike.
    pub fn deallocate(&self, frame: Frame) {
        let slot = self.slot(frame.0);
        let prev = slot.swap(IN_USE, Ordering::AcqRel);
        assert_eq!(
            prev, IN_USE,
            "double-free or corrupt free-list: frame {} was not in_use",
            frame.0
        );

        loop {
            let head = self.free_head.load(Ordering::Acquire);
            slot.store(head, Ordering::Release);
            if self
                .free_head
                .compare_exchange(head, frame.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_memory
                    .fetch_add(BASE_PAGE_SIZE, Ordering::Release);
                trace!("frame allocator: freed frame {}", frame.0);
                return;
            }
        }
    }

    pub fn free_memory(&self) -> usize {
        self.free_memory.load(Ordering::Acquire)
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory.load(Ordering::Acquire)
    }
}

/// Generalization of `nrk::memory::PhysicalPageProvider`, narrowed to the
/// single base-page granularity this core's Non-goals leave in scope.
pub trait PhysicalFrameProvider {
    fn allocate_frame(&self) -> Result<Frame, FrameError>;
    fn deallocate_frame(&self, frame: Frame);
}

impl PhysicalFrameProvider for FrameAllocator {
    fn allocate_frame(&self) -> Result<Frame, FrameError> {
        self.allocate()
    }

    fn deallocate_frame(&self, frame: Frame) {
        self.deallocate(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{BootRegion, VRange};
    use crate::addr::VAddr;
    use alloc::vec;

    struct FakeMap(Vec<BootRegion>);

    impl BootMemoryMap for FakeMap {
        type Iter = alloc::vec::IntoIter<BootRegion>;

        fn ascending(&self) -> Self::Iter {
            self.0.clone().into_iter()
        }
    }

    fn free_region(start: u64, end: u64) -> BootRegion {
        BootRegion {
            range: VRange::new(VAddr::from_u64(start), VAddr::from_u64(end)),
            kind: BootRegionType::Free,
        }
    }

    #[test]
    fn allocate_exhausts_then_errors() {
        let map = FakeMap(vec![free_region(0, 3 * BASE_PAGE_SIZE as u64)]);
        let fa = FrameAllocator::init(&map, |_| false);
        assert_eq!(fa.free_memory(), 3 * BASE_PAGE_SIZE);

        let a = fa.allocate().unwrap();
        let b = fa.allocate().unwrap();
        let c = fa.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(fa.free_memory(), 0);
        assert!(matches!(fa.allocate(), Err(FrameError::FramesExhausted)));

        fa.deallocate(b);
        assert_eq!(fa.free_memory(), BASE_PAGE_SIZE);
        let d = fa.allocate().unwrap();
        assert_eq!(d, b);
    }

    #[test]
    #[should_panic]
    fn double_free_aborts() {
        let map = FakeMap(vec![free_region(0, BASE_PAGE_SIZE as u64)]);
        let fa = FrameAllocator::init(&map, |_| false);
        let a = fa.allocate().unwrap();
        fa.deallocate(a);
        fa.deallocate(a);
    }

    #[test]
    fn preused_frames_are_not_in_free_list() {
        let map = FakeMap(vec![free_region(0, 4 * BASE_PAGE_SIZE as u64)]);
        // Mark frame 0 as already consumed by boot-time page tables.
        let fa = FrameAllocator::init(&map, |p| p.as_u64() == 0);
        assert_eq!(fa.free_memory(), 3 * BASE_PAGE_SIZE);
        for _ in 0..3 {
            let f = fa.allocate().unwrap();
            assert_ne!(f.index(), 0);
        }
        assert!(matches!(fa.allocate(), Err(FrameError::FramesExhausted)));
    }

    #[test]
    fn total_memory_counts_all_free_regions() {
        let map = FakeMap(vec![
            free_region(0, 2 * BASE_PAGE_SIZE as u64),
            free_region(16 * BASE_PAGE_SIZE as u64, 18 * BASE_PAGE_SIZE as u64),
        ]);
        let fa = FrameAllocator::init(&map, |_| false);
        assert_eq!(fa.total_memory(), 4 * BASE_PAGE_SIZE);
        assert_eq!(fa.free_memory(), 4 * BASE_PAGE_SIZE);
    }
}
