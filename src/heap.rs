//! Component E: the heap facade.
//!
//! Composes three arenas the way spec.md §4.E describes:
//!
//! 1. `heap_address_space_arena` -- quantum = page size, no source, seeded
//!    once with the kernel heap's virtual window.
//! 2. `heap_page_arena` -- quantum = page size, sourced from (1) through
//!    [`PageArenaSource`], which additionally commits backing frames into
//!    the kernel page table on import and tears them down (plus a
//!    kernel-wide TLB flush) on release.
//! 3. `heap_arena` -- quantum = 16 bytes, quantum-cached 1x..32x, the
//!    allocator general kernel code actually calls through [`Heap::allocate`].
//!
//! A fourth, independent arena (`special_heap`) serves callers that map
//! externally supplied physical ranges (device memory, MMIO) directly,
//! bypassing the frame allocator entirely -- spec.md §4.E's last
//! paragraph.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::collab::{ExecutorId, InterruptController, MapAction, PagingBackend, VRange};
use crate::error::{ArenaError, KError};
use crate::flush::{FlushCoordinator, FlushRequest, FlushTarget};
use crate::frame::PhysicalFrameProvider;
use crate::vmem::{Allocation, Arena, Policy, Source};

/// `heap_arena`'s quantum (spec.md §4.E).
pub const HEAP_ARENA_QUANTUM: usize = 16;
/// Quantum caches installed on `heap_arena`: 1x..32x quantum.
pub const HEAP_ARENA_QUANTUM_CACHES: usize = 32;

/// Bridges `heap_page_arena` to `heap_address_space_arena`, additionally
/// committing/tearing down backing frames and flushing the TLB. This is
/// the `Source` implementation spec.md §4.E describes for step 2 of the
/// three-arena chain, kept separate from [`Arena`]'s own `Source` impl
/// (arena-to-arena chaining with no side effects) because this link has
/// to do real work: map frames in, unmap them out, flush.
pub struct PageArenaSource<'a, P: PagingBackend> {
    address_space_arena: &'a Arena<'a>,
    frames: &'a dyn PhysicalFrameProvider,
    page_table: &'a Mutex<P>,
    flush: &'a FlushCoordinator,
    interrupts: &'a dyn InterruptController,
    self_id: ExecutorId,
}

impl<'a, P: PagingBackend> PageArenaSource<'a, P> {
    pub fn new(
        address_space_arena: &'a Arena<'a>,
        frames: &'a dyn PhysicalFrameProvider,
        page_table: &'a Mutex<P>,
        flush: &'a FlushCoordinator,
        interrupts: &'a dyn InterruptController,
        self_id: ExecutorId,
    ) -> Self {
        PageArenaSource {
            address_space_arena,
            frames,
            page_table,
            flush,
            interrupts,
            self_id,
        }
    }
}

impl<'a, P: PagingBackend> Source for PageArenaSource<'a, P> {
    /// Reserve `len` from the address-space arena, then map a fresh frame
    /// at every page of the reservation.
    fn import(&self, len: usize, policy: Policy) -> Result<Allocation, ArenaError> {
        let alloc = self.address_space_arena.allocate(len, policy)?;
        let pages = len / PAGE_SIZE;
        let mut mapped = 0;
        let mut paging = self.page_table.lock();
        for i in 0..pages {
            let vaddr = VAddr::from_u64((alloc.base + i * PAGE_SIZE) as u64);
            let frame = match self.frames.allocate_frame() {
                Ok(f) => f,
                Err(_) => break,
            };
            if paging.map(vaddr, frame, MapAction::kernel_rw()).is_err() {
                self.frames.deallocate_frame(frame);
                break;
            }
            mapped += 1;
        }
        drop(paging);

        if mapped != pages {
            // Roll back what we managed to map, then give the virtual
            // range back -- this import attempt failed outright.
            let mut paging = self.page_table.lock();
            for i in 0..mapped {
                let vaddr = VAddr::from_u64((alloc.base + i * PAGE_SIZE) as u64);
                if let Some(frame) = paging.unmap(vaddr, true) {
                    self.frames.deallocate_frame(frame);
                }
            }
            drop(paging);
            self.address_space_arena.deallocate(alloc);
            return Err(ArenaError::RequestedLengthUnavailable);
        }
        Ok(alloc)
    }

    /// Unmap and free every frame backing `alloc`, flush the kernel TLB
    /// over the range, then return the virtual range to the address-space
    /// arena.
    fn release(&self, alloc: Allocation) {
        let pages = alloc.len / PAGE_SIZE;
        {
            let mut paging = self.page_table.lock();
            for i in 0..pages {
                let vaddr = VAddr::from_u64((alloc.base + i * PAGE_SIZE) as u64);
                if let Some(frame) = paging.unmap(vaddr, true) {
                    self.frames.deallocate_frame(frame);
                }
            }
            let range = VRange::new(
                VAddr::from_u64(alloc.base as u64),
                VAddr::from_u64((alloc.base + alloc.len) as u64),
            );
            let request = FlushRequest::new(range, FlushTarget::Kernel);
            self.flush
                .submit_and_wait(&request, self.self_id, &mut *paging, self.interrupts);
        }
        self.address_space_arena.deallocate(alloc);
    }
}

/// Header prepended to every `Heap::allocate` result (spec.md §4.E).
/// `arena_base`/`arena_len` are the exact values to hand back to
/// `heap_arena.deallocate`; `usable` is the byte range from the returned
/// pointer to the end of the backing allocation, which bounds what
/// `resize` may grow into without committing new backing memory.
#[repr(C)]
struct AllocationHeader {
    arena_base: usize,
    arena_len: usize,
    usable: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocationHeader>();
const HEADER_ALIGN: usize = core::mem::align_of::<AllocationHeader>();

/// The general-purpose kernel allocator: `heap_arena` plus the
/// `Allocation`-header bookkeeping spec.md §4.E describes.
pub struct Heap<'a> {
    arena: &'a Arena<'a>,
}

impl<'a> Heap<'a> {
    pub fn new(arena: &'a Arena<'a>) -> Heap<'a> {
        Heap { arena }
    }

    /// Allocate at least `len` bytes aligned to `align` (a power of two).
    pub fn allocate(&self, len: usize, align: usize) -> Result<NonNull<u8>, KError> {
        let align = align.max(HEADER_ALIGN);
        // Worst case: the arena might hand back a base that needs up to
        // `align - 1` bytes of padding after the header before the
        // aligned data can start.
        let worst_case = len + HEADER_SIZE + align - 1;
        let alloc = self
            .arena
            .allocate(worst_case, Policy::InstantFit)
            .map_err(|e| KError::Arena { source: e })?;

        let min_data_start = alloc.base + HEADER_SIZE;
        let aligned = crate::round_up!(min_data_start, align);
        debug_assert!(aligned + len <= alloc.base + alloc.len);

        let header_ptr = (aligned - HEADER_SIZE) as *mut AllocationHeader;
        unsafe {
            header_ptr.write(AllocationHeader {
                arena_base: alloc.base,
                arena_len: alloc.len,
                usable: alloc.base + alloc.len - aligned,
            });
        }
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    fn header_of(ptr: NonNull<u8>) -> *const AllocationHeader {
        (ptr.as_ptr() as usize - HEADER_SIZE) as *const AllocationHeader
    }

    /// Return a previous `allocate` result to `heap_arena`.
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        let header = unsafe { &*Self::header_of(ptr) };
        self.arena.deallocate(Allocation {
            base: header.arena_base,
            len: header.arena_len,
        });
    }

    /// Succeeds without touching backing memory as long as `new_len`
    /// still fits in the space already reserved for `ptr`; otherwise
    /// `None` (spec.md §4.E: "no backing-frame commits on shrink" implies
    /// growth also never commits more here -- callers needing more than
    /// their original reservation must allocate fresh and copy).
    pub fn resize(&self, ptr: NonNull<u8>, new_len: usize) -> Option<NonNull<u8>> {
        let header = unsafe { &*Self::header_of(ptr) };
        if new_len <= header.usable {
            Some(ptr)
        } else {
            None
        }
    }
}

/// `special_heap`: maps caller-supplied physical ranges (device memory,
/// MMIO) directly, never touching the frame allocator.
pub struct SpecialHeap<'a, P: PagingBackend> {
    arena: &'a Arena<'a>,
    page_table: &'a Mutex<P>,
}

impl<'a, P: PagingBackend> SpecialHeap<'a, P> {
    pub fn new(arena: &'a Arena<'a>, page_table: &'a Mutex<P>) -> Self {
        SpecialHeap { arena, page_table }
    }

    pub fn allocate_special(
        &self,
        size: usize,
        physical: PAddr,
        action: MapAction,
    ) -> Result<VRange, KError> {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let alloc = self
            .arena
            .allocate(pages * PAGE_SIZE, Policy::InstantFit)
            .map_err(|e| KError::Arena { source: e })?;

        let mut paging = self.page_table.lock();
        for i in 0..pages {
            let vaddr = VAddr::from_u64((alloc.base + i * PAGE_SIZE) as u64);
            let frame = crate::frame::Frame(
                ((physical.as_u64() as usize / PAGE_SIZE) + i) as u32,
            );
            let _ = paging.map(vaddr, frame, action);
        }
        drop(paging);

        Ok(VRange::new(
            VAddr::from_u64(alloc.base as u64),
            VAddr::from_u64((alloc.base + alloc.len) as u64),
        ))
    }

    pub fn deallocate_special(&self, range: VRange) {
        let mut paging = self.page_table.lock();
        let base = range.start.as_u64() as usize;
        let pages = range.len() / PAGE_SIZE;
        for i in 0..pages {
            let vaddr = VAddr::from_u64((base + i * PAGE_SIZE) as u64);
            // `free_backing = false`: the physical range belongs to the
            // device, not to this core's frame allocator.
            paging.unmap(vaddr, false);
        }
        drop(paging);
        self.arena.deallocate(Allocation {
            base,
            len: range.len(),
        });
    }
}
