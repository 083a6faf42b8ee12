//! Test-only fixtures shared by every component's unit tests.
//!
//! Several tests (slab construction, tag-pool inflation, page-fault
//! zero-fill) genuinely write through the pointers this crate hands
//! out, rather than only tracking them as opaque bookkeeping integers.
//! On real hardware those pointers resolve through the direct map
//! (`crate::addr::direct_map`) to real physical memory; on the host
//! these helpers back the same addresses with real, intentionally
//! leaked host memory so the writes land somewhere valid instead of at
//! whatever low integer a toy boot memory map would otherwise hand out.

#![cfg(test)]

#[cfg(not(target_os = "linux"))]
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::addr::{VAddr, PAGE_SIZE};
use crate::collab::{BootMemoryMap, BootRegion, BootRegionType, VRange};
use crate::frame::FrameAllocator;

/// Route this crate's `log` calls to stderr for whichever test asks for
/// them, gated on `RUST_LOG` the usual way. Safe to call from every test;
/// `env_logger::try_init` is idempotent and ignores a second caller.
pub(crate) fn init_logging() {
    let _ = env_logger::try_init();
}

pub(crate) struct FakeBootMap(Vec<BootRegion>);

impl BootMemoryMap for FakeBootMap {
    type Iter = alloc::vec::IntoIter<BootRegion>;
    fn ascending(&self) -> Self::Iter {
        self.0.clone().into_iter()
    }
}

/// A page-aligned, real (leaked) byte range at least `pages * PAGE_SIZE`
/// long, placed low enough in the address space that `address / PAGE_SIZE`
/// fits `Frame`'s 32-bit index (spec.md §3's "opaque 32-bit index").
/// Leaked deliberately: these fixtures live for the test process's
/// lifetime, the same way a real boot-time memory map's backing store is
/// never reclaimed.
///
/// An ordinary `Box` allocation routinely lands above that 2^44-byte
/// ceiling on a 64-bit host (anonymous mmap regions sit around 0x7f...
/// by default), which would make `Frame::base()` reconstruct an address
/// that doesn't point back at the real buffer at all. `MAP_32BIT`
/// confines the mapping to the first 2 GiB, far inside the ceiling.
#[cfg(target_os = "linux")]
pub(crate) fn real_backed_region(pages: usize) -> (usize, usize) {
    let len = pages * PAGE_SIZE;
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED, "mmap(MAP_32BIT) failed for test fixture");
    (addr as usize, len)
}

/// Non-Linux fallback: `MAP_32BIT` is a Linux/x86-64-only flag, so retry
/// ordinary heap allocations until one happens to land below the 2^44
/// ceiling a `u32` frame index can address at `PAGE_SIZE` granularity.
#[cfg(not(target_os = "linux"))]
pub(crate) fn real_backed_region(pages: usize) -> (usize, usize) {
    const MAX_ADDR: usize = (u32::MAX as usize) * PAGE_SIZE;
    let len = (pages + 1) * PAGE_SIZE;
    for _ in 0..256 {
        let buf: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(buf) as *mut u8 as usize;
        let aligned = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if aligned + pages * PAGE_SIZE <= MAX_ADDR {
            return (aligned, pages * PAGE_SIZE);
        }
        // Doesn't fit a u32 frame index; leak it and try again.
    }
    panic!("could not find a test fixture address whose frame index fits in u32");
}

/// A `FrameAllocator` whose frames' base addresses are real, writable
/// host memory (see `real_backed_region`), rather than the small
/// integers a toy `[0, N*PAGE_SIZE)` map would produce.
pub(crate) fn real_backed_frames(pages: usize) -> FrameAllocator {
    init_logging();
    let (base, len) = real_backed_region(pages);
    let map = FakeBootMap(vec![BootRegion {
        range: VRange::new(VAddr::from_u64(base as u64), VAddr::from_u64((base + len) as u64)),
        kind: BootRegionType::Free,
    }]);
    FrameAllocator::init(&map, |_| false)
}
