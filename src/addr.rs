//! Address types.
//!
//! `nrk::memory` re-exports `PAddr`/`VAddr`/`BASE_PAGE_SIZE` from its
//! arch-specific module (`crate::arch::memory`); architecture support is
//! out of scope here (spec.md §1), so this module re-exports the same
//! types directly from the `x86` crate, which is where `nrk`'s arch
//! module gets them from in the first place.

pub use x86::bits64::paging::{PAddr, VAddr, BASE_PAGE_SIZE};

/// The page size this core is built around. Equal to `BASE_PAGE_SIZE`;
/// named separately because spec.md talks about "page size" in contexts
/// (slab layout, entry ranges) that have nothing to do with the x86 crate.
pub const PAGE_SIZE: usize = BASE_PAGE_SIZE;

/// The permanent identity region mapping every physical frame to a fixed
/// virtual offset (spec glossary "Direct map"), used by allocator
/// bookkeeping that must touch a frame's bytes before any page tables
/// exist for it -- slab/boundary-tag control structures, zero-fill.
/// Real archs apply a fixed offset; finding and applying that offset is
/// arch-specific setup out of scope here (spec.md §1), so this crate
/// models the direct map as the identity function, same as treating
/// `PAddr` and `VAddr` as the same numeric space everywhere bookkeeping
/// needs to dereference physical memory directly.
pub fn direct_map(paddr: PAddr) -> *mut u8 {
    paddr.as_u64() as usize as *mut u8
}
