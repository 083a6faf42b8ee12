//! Error types for the allocation core.
//!
//! Each component gets its own leaf error type (mirroring how
//! `nrk::memory::AllocationError` is scoped to the frame allocator), and
//! [`KError`] wraps all of them so callers that cross component
//! boundaries (e.g. the address space calling into the frame allocator)
//! can propagate a single type with `?`.

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub FrameError
    FramesExhausted = "No physical frames left to satisfy the request.",
    NotInUse = "Attempted to free a page that was not marked in_use.",
}

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub ArenaError
    ZeroLength = "addSpan/allocate called with a zero-length range.",
    WouldWrap = "span would wrap around the address universe.",
    Unaligned = "span or allocation is not quantum-aligned.",
    Overlap = "span overlaps an existing span in this arena.",
    RequestedLengthUnavailable = "No free tag large enough to satisfy the request.",
    OutOfBoundaryTags = "The boundary-tag reservoir is exhausted.",
    NameTooLong = "Arena name exceeds the maximum length.",
    InvalidQuantum = "Quantum must be a non-zero power of two.",
    BucketGroupsExhausted{max: usize} = "No more than {max} quantum caches are supported.",
}

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub CacheError
    SlabAllocationFailed = "Could not obtain backing memory for a new slab.",
    ObjectConstructionFailed = "An object constructor returned an error.",
    LargeObjectAllocationFailed = "Could not allocate or track a large object record.",
}

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub AddressSpaceError
    MapZeroLength = "map() called with number_of_pages == 0.",
    OutOfMemory = "The address space's virtual-range arena is exhausted.",
    NotMapped = "Faulting address is not covered by any entry.",
    Protection = "Access does not match the entry's protection.",
    NoMemory = "Out of memory while servicing a page fault.",
}

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub KError
    Frame{source: FrameError} = "frame allocator: {source}",
    Arena{source: ArenaError} = "resource arena: {source}",
    Cache{source: CacheError} = "object cache: {source}",
    AddressSpace{source: AddressSpaceError} = "address space: {source}",
}
