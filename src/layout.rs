//! Component G: layout & bootstrap.
//!
//! Everything else in this crate is handed its arenas, frame allocator and
//! tag pool already constructed, by reference, with lifetimes tied to
//! whatever static or stack storage the caller chooses (see `heap`/`vspace`
//! tests for the usual shape: `Arena::create` over a `&'a TagPool` and a
//! `&'a dyn PhysicalFrameProvider`). Something has to run once, at boot,
//! before any of that: turn the boot loader's physical memory map into a
//! [`frame::FrameAllocator`], and turn the kernel's reserved virtual address
//! window into the handful of named, disjoint sub-ranges the heap and
//! per-process address spaces are seeded with.
//!
//! Grounded in `nrk::memory::GlobalMemory::new`, which walks a boot-time
//! `ArrayVec<Frame>` once to build its `TCache`/`NCache` instances per NUMA
//! node. NUMA placement itself is an explicit spec Non-goal (SPEC_FULL.md
//! §2.3) and is not reproduced -- this module builds one frame allocator and
//! one flat set of named virtual regions, not one per node.

use arrayvec::{ArrayString, ArrayVec};

use crate::addr::VAddr;
use crate::collab::{BootMemoryMap, VRange};
use crate::error::ArenaError;
use crate::frame::FrameAllocator;

/// Upper bound on how many named regions a single [`Layout::carve`] call
/// can produce. Generous relative to the handful of regions (heap address
/// space, heap pages, special/MMIO) this crate itself needs; a caller with
/// more regions than this is doing something this crate isn't meant for.
pub const MAX_LAYOUT_REGIONS: usize = 16;
pub const MAX_REGION_NAME: usize = 32;

struct NamedRegion {
    name: ArrayString<MAX_REGION_NAME>,
    range: VRange,
}

/// One named sub-range to carve out of the bootstrap window, in the order
/// it should be carved. Order matters: earlier requests get the
/// lower addresses, so a caller that wants two regions to end up adjacent
/// (e.g. to later merge them under one arena) lists them back to back.
#[derive(Debug, Clone, Copy)]
pub struct RegionRequest<'n> {
    pub name: &'n str,
    pub len: usize,
}

/// The kernel's reserved virtual address window, carved once at boot into
/// disjoint, quantum-aligned named sub-ranges. Built by [`Layout::carve`];
/// looked up by name afterwards to seed the heap/address-space arenas
/// (spec.md §4.E, §4.F) with their starting spans.
pub struct Layout {
    regions: ArrayVec<NamedRegion, MAX_LAYOUT_REGIONS>,
}

impl Layout {
    /// Bump-allocate `requests` out of `window`, in order, each request's
    /// length rounded up to `quantum`. Fails [`ArenaError::WouldWrap`] if a
    /// region's end would overflow the address space, and
    /// [`ArenaError::RequestedLengthUnavailable`] if the requests together
    /// don't fit in `window`.
    pub fn carve(
        window: VRange,
        quantum: usize,
        requests: &[RegionRequest],
    ) -> Result<Layout, ArenaError> {
        if requests.len() > MAX_LAYOUT_REGIONS {
            return Err(ArenaError::BucketGroupsExhausted {
                max: MAX_LAYOUT_REGIONS,
            });
        }

        let mut regions = ArrayVec::new();
        let mut cursor = window.start.as_u64() as usize;
        let window_end = window.end.as_u64() as usize;

        for req in requests {
            let len = crate::round_up!(req.len.max(1), quantum);
            let region_end = cursor.checked_add(len).ok_or(ArenaError::WouldWrap)?;
            if region_end > window_end {
                return Err(ArenaError::RequestedLengthUnavailable);
            }
            let name =
                ArrayString::from(req.name).map_err(|_| ArenaError::NameTooLong)?;
            regions.push(NamedRegion {
                name,
                range: VRange::new(
                    VAddr::from_u64(cursor as u64),
                    VAddr::from_u64(region_end as u64),
                ),
            });
            cursor = region_end;
        }

        Ok(Layout { regions })
    }

    /// The carved range for `name`, or `None` if no request used that name.
    pub fn region(&self, name: &str) -> Option<VRange> {
        self.regions
            .iter()
            .find(|r| r.name.as_str() == name)
            .map(|r| r.range)
    }

    /// Remaining, uncarved tail of the original window, starting right
    /// after the last region. Callers that want to seed a final arena with
    /// "everything left over" (rather than a fixed-size request) use this
    /// instead of a `RegionRequest`.
    pub fn remainder(&self, window: VRange) -> VRange {
        let cursor = self
            .regions
            .last()
            .map(|r| r.range.end)
            .unwrap_or(window.start);
        VRange::new(cursor, window.end)
    }
}

/// Build the bootstrap physical frame allocator from the boot loader's
/// memory map (component A's one-shot construction path, `FrameAllocator::init`).
/// Split out as its own function, rather than folded into `Layout::carve`,
/// because a caller may need the frame allocator before it has decided on a
/// virtual window to carve (e.g. to size that window from the amount of
/// free memory reported here).
pub fn bootstrap_frame_allocator<M: BootMemoryMap>(
    map: &M,
    preused: impl Fn(crate::addr::PAddr) -> bool,
) -> FrameAllocator {
    FrameAllocator::init(map, preused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::real_backed_frames;

    fn window() -> VRange {
        VRange::new(VAddr::from_u64(0x4000_0000), VAddr::from_u64(0x8000_0000))
    }

    #[test]
    fn carve_produces_disjoint_ascending_named_regions() {
        let requests = [
            RegionRequest { name: "aspace", len: 0x10_0000 },
            RegionRequest { name: "pages", len: 0x20_0000 },
        ];
        let layout = Layout::carve(window(), 0x1000, &requests).unwrap();

        let aspace = layout.region("aspace").unwrap();
        let pages = layout.region("pages").unwrap();
        assert_eq!(aspace.start, window().start);
        assert_eq!(aspace.end, pages.start, "regions must be contiguous, in request order");
        assert!(pages.end <= window().end);
        assert!(layout.region("nonexistent").is_none());
    }

    #[test]
    fn carve_rounds_each_region_up_to_quantum() {
        let requests = [RegionRequest { name: "odd", len: 1 }];
        let layout = Layout::carve(window(), 0x1000, &requests).unwrap();
        let odd = layout.region("odd").unwrap();
        assert_eq!(odd.len(), 0x1000);
    }

    #[test]
    fn carve_rejects_requests_that_overflow_the_window() {
        let small_window = VRange::new(VAddr::from_u64(0x1000), VAddr::from_u64(0x2000));
        let requests = [RegionRequest { name: "too-big", len: 0x5000 }];
        assert_eq!(
            Layout::carve(small_window, 0x1000, &requests).unwrap_err(),
            ArenaError::RequestedLengthUnavailable
        );
    }

    #[test]
    fn remainder_covers_whatever_carve_did_not_claim() {
        let requests = [RegionRequest { name: "aspace", len: 0x10_0000 }];
        let layout = Layout::carve(window(), 0x1000, &requests).unwrap();
        let rest = layout.remainder(window());
        assert_eq!(rest.start, layout.region("aspace").unwrap().end);
        assert_eq!(rest.end, window().end);
    }

    #[test]
    fn bootstrap_frame_allocator_counts_free_memory_from_the_boot_map() {
        // `real_backed_frames` already routes through `FrameAllocator::init`
        // over real host-backed memory; this just confirms this module's
        // thin wrapper produces the same thing.
        let fa = real_backed_frames(8);
        assert!(fa.total_memory() > 0);
        assert_eq!(fa.free_memory(), fa.total_memory());

        let frame = fa.allocate().unwrap();
        assert_eq!(fa.free_memory(), fa.total_memory() - crate::addr::PAGE_SIZE);
        fa.deallocate(frame);
        assert_eq!(fa.free_memory(), fa.total_memory());
    }
}
