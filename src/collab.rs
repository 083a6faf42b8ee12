//! Interfaces to collaborators this core consumes but does not implement.
//!
//! Per the design's "Polymorphism" note, these are small capability traits
//! rather than an inheritance hierarchy, in the same spirit as
//! `nrk::memory::{PhysicalPageProvider, PageTableProvider}`. Everything in
//! this module is architecture-specific, boot-sequencing-specific, or
//! interrupt-controller-specific territory and is explicitly out of scope
//! for this crate (spec.md §1); production code links a real
//! implementation, and `#[cfg(test)]` code uses an in-memory fake so the
//! in-scope components can still be exercised.

use crate::addr::VAddr;
use crate::frame::Frame;

/// A contiguous range of virtual addresses, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VRange {
    pub start: VAddr,
    pub end: VAddr,
}

impl VRange {
    pub fn new(start: VAddr, end: VAddr) -> Self {
        debug_assert!(start.as_u64() <= end.as_u64());
        VRange { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end.as_u64() - self.start.as_u64()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Protection requested for a page-table mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAction {
    pub writable: bool,
    pub executable: bool,
    pub user_accessible: bool,
}

impl MapAction {
    pub const fn kernel_rw() -> Self {
        MapAction {
            writable: true,
            executable: false,
            user_accessible: false,
        }
    }

    pub const fn kernel_ro() -> Self {
        MapAction {
            writable: false,
            executable: false,
            user_accessible: false,
        }
    }
}

/// Architecture-specific page-table manipulation, out of scope per
/// spec.md §1. Named after the conceptual interface in spec.md §6:
/// `paging.map`, `paging.unmap`, `paging.flushCache`.
pub trait PagingBackend {
    /// Install a mapping for `frame` at `vaddr` with `action`.
    fn map(&mut self, vaddr: VAddr, frame: Frame, action: MapAction) -> Result<(), MapError>;

    /// Remove the mapping at `vaddr`. If `free_backing` the backing frame
    /// is returned to the caller instead of being left dangling.
    fn unmap(&mut self, vaddr: VAddr, free_backing: bool) -> Option<Frame>;

    /// Architecture TLB invalidation over `range` on the executing CPU only.
    fn flush_cache(&mut self, range: VRange);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    OutOfPageTableMemory,
}

/// Identifies one of the system's executors (a CPU, in spec.md's
/// vocabulary). The flush coordinator (component B) and the address
/// space's user-target flush predicate both index by this.
pub type ExecutorId = u32;

/// A process this core's address spaces belong to, used only to decide
/// whether a `user`-targeted flush applies to an executor (spec.md §9
/// open question, resolved in SPEC_FULL.md §9).
pub type ProcessId = u64;

/// IPI delivery, out of scope per spec.md §1: `interrupts.sendFlushIPI`.
pub trait InterruptController {
    fn send_flush_ipi(&self, executor: ExecutorId);
}

/// Category of a boot memory map entry, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRegionType {
    Free,
    InUse,
    Reserved,
    BootloaderReclaimable,
    AcpiReclaimable,
    Unusable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegion {
    pub range: VRange,
    pub kind: BootRegionType,
}

/// `boot.memoryMap(direction)`: an iterator the bootloader's memory map
/// is consumed through. Out of scope per spec.md §1 (boot sequencing).
pub trait BootMemoryMap {
    type Iter: Iterator<Item = BootRegion>;

    /// Iterate the memory map, lowest address first.
    fn ascending(&self) -> Self::Iter;
}
