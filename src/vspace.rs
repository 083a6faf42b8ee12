//! Component F: the virtual address space.
//!
//! A UVM-style address space: a sorted, non-overlapping list of [`Entry`]
//! ranges, each optionally backed by an [`AnonMap`] (demand-paged,
//! copy-on-write anonymous memory) or a [`VmObject`] (externally backed
//! memory this crate never creates, only resolves against). Faults are
//! handled in the two phases spec.md §4.F describes: `fault_check` (entry
//! lookup, protection check, COW promotion) and
//! `fault_object_or_zero_fill` (materialize or resolve the faulting
//! page), with an internal [`Phase2Outcome::Restart`] bridging the two
//! when the entry list changes between them -- a loop with an explicit
//! tagged result, not an exception, per spec.md §9's "Restart loops" note.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayString;
use hashbrown::HashMap;
use log::{debug, trace, warn};
use spin::{Mutex, RwLock};

use crate::addr::{direct_map, PAddr, VAddr, PAGE_SIZE};
use crate::collab::{ExecutorId, InterruptController, MapAction, PagingBackend, VRange};
use crate::error::{AddressSpaceError, KError};
use crate::flush::{FlushCoordinator, FlushRequest, FlushTarget};
use crate::frame::{Frame, PhysicalFrameProvider};
use crate::vmem::{Allocation, Arena, Policy};

pub const MAX_ADDRESS_SPACE_NAME: usize = 32;

/// Access kind that triggered a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// An object-backed collaborator: resolves a page index to a physical
/// address this crate did not allocate and does not own the lifetime of
/// (file-backed / device memory). Out of this crate's Non-goals is
/// managing *what* backs an object; this trait only names the resolution
/// contract spec.md §3's `object_reference` needs.
pub trait VmObject: Send + Sync {
    fn resolve_page(&self, page_index: usize) -> Result<PAddr, AddressSpaceError>;
}

/// One physical frame backing an anonymous page. Freed exactly once, when
/// the last [`alloc::sync::Arc`] referencing it (shared across however
/// many entries' anonymous maps COW-share this page) drops -- the same
/// "reference count reaching zero triggers release" shape spec.md §9's
/// "shared graphs" note asks for, expressed with `Arc` instead of a
/// hand-rolled atomic counter plus manual free.
struct AnonPage<'a> {
    frame: Frame,
    frames: &'a dyn PhysicalFrameProvider,
}

impl<'a> Drop for AnonPage<'a> {
    fn drop(&mut self) {
        self.frames.deallocate_frame(self.frame);
    }
}

type AnonPageRef<'a> = Arc<AnonPage<'a>>;

struct AnonMapInner<'a> {
    number_of_pages: usize,
    pages_in_use: usize,
    chunks: HashMap<usize, AnonPageRef<'a>>,
}

/// Spec's anonymous map: `{ rwlock, reference_count, number_of_pages,
/// pages_in_use, anonymous_page_chunks }`. `reference_count` is not a
/// field here -- it *is* `Arc::strong_count` of whatever
/// `Arc<AnonMap>` entries hold, which is the same number by
/// construction and needs no separate bookkeeping to keep in sync.
pub struct AnonMap<'a> {
    inner: RwLock<AnonMapInner<'a>>,
}

impl<'a> AnonMap<'a> {
    fn new(number_of_pages: usize) -> Arc<AnonMap<'a>> {
        Arc::new(AnonMap {
            inner: RwLock::new(AnonMapInner {
                number_of_pages,
                pages_in_use: 0,
                chunks: HashMap::new(),
            }),
        })
    }

    pub fn number_of_pages(&self) -> usize {
        self.inner.read().number_of_pages
    }

    pub fn pages_in_use(&self) -> usize {
        self.inner.read().pages_in_use
    }
}

/// `{ map, start_offset }` from spec.md §3: how an entry names a
/// sub-window of a (possibly shared) anonymous map.
#[derive(Clone)]
struct AnonReference<'a> {
    map: Arc<AnonMap<'a>>,
    start_offset: usize,
}

/// `type ∈ {zero_fill, object(reference)}` from spec.md §4.F's `map()`.
pub enum MapKind<'a> {
    ZeroFill,
    Object(Arc<dyn VmObject + 'a>, usize),
}

pub struct MapOptions<'a> {
    pub number_of_pages: usize,
    pub protection: MapAction,
    pub kind: MapKind<'a>,
}

/// A contiguous mapped range with uniform protection and backing.
/// `allocations` records every distinct arena sub-allocation folded into
/// this entry by successive `map` merges, so `unmap` can release exactly
/// the whole sub-ranges it's able to (see `AddressSpace::unmap`'s doc
/// comment for the limitation this implies on mid-allocation partial
/// unmaps).
struct Entry<'a> {
    base: usize,
    number_of_pages: usize,
    protection: MapAction,
    anon: Option<AnonReference<'a>>,
    object: Option<(Arc<dyn VmObject + 'a>, usize)>,
    copy_on_write: bool,
    needs_copy: bool,
    allocations: Vec<Allocation>,
}

impl<'a> Entry<'a> {
    fn end(&self) -> usize {
        self.base + self.number_of_pages * PAGE_SIZE
    }
}

/// Snapshot of whatever `fault_check` needs to hand `fault_object_or_
/// zero_fill` without holding the entries lock across the boundary.
/// Cloning the `Arc<AnonMap>` is what makes this safe: the map stays
/// alive and addressable even if the owning entry is later removed by a
/// concurrent `unmap`.
struct FaultSnapshot<'a> {
    entry_base: usize,
    protection: MapAction,
    copy_on_write: bool,
    anon: Option<AnonReference<'a>>,
    object: Option<(Arc<dyn VmObject + 'a>, usize)>,
    version_observed: u64,
}

enum Phase2Outcome {
    Done,
    Restart,
}

/// Component F. `'a` ties the space to the arena, frame allocator, flush
/// coordinator and page-table backend it was built with (spec.md §4.F:
/// "a per-space arena over its virtual window... a page-table handle").
pub struct AddressSpace<'a, P: PagingBackend> {
    name: ArrayString<MAX_ADDRESS_SPACE_NAME>,
    arena: &'a Arena<'a>,
    frames: &'a dyn PhysicalFrameProvider,
    page_table: &'a Mutex<P>,
    flush: &'a FlushCoordinator,
    interrupts: &'a dyn InterruptController,
    entries: RwLock<Vec<Entry<'a>>>,
    entries_version: AtomicU64,
}

impl<'a, P: PagingBackend> AddressSpace<'a, P> {
    pub fn new(
        name: &str,
        arena: &'a Arena<'a>,
        frames: &'a dyn PhysicalFrameProvider,
        page_table: &'a Mutex<P>,
        flush: &'a FlushCoordinator,
        interrupts: &'a dyn InterruptController,
    ) -> Result<Self, KError> {
        let name = ArrayString::from(name).unwrap_or_default();
        Ok(AddressSpace {
            name,
            arena,
            frames,
            page_table,
            flush,
            interrupts,
            entries: RwLock::new(Vec::new()),
            entries_version: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mergeable(a: &Entry<'a>, protection: MapAction, copy_on_write: bool, needs_copy: bool, object: &Option<(Arc<dyn VmObject + 'a>, usize)>) -> bool {
        if a.protection != protection || a.copy_on_write != copy_on_write || a.needs_copy != needs_copy {
            return false;
        }
        match (&a.object, object) {
            (None, None) => true,
            (Some((oa, offa)), Some((ob, offb))) => Arc::ptr_eq(oa, ob) && *offa + a.number_of_pages == *offb,
            _ => false,
        }
    }

    /// Reserve virtual space and insert or merge an [`Entry`] for it.
    pub fn map(&self, opts: MapOptions<'a>) -> Result<VRange, KError> {
        if opts.number_of_pages == 0 {
            return Err(KError::AddressSpace {
                source: AddressSpaceError::MapZeroLength,
            });
        }
        let len = opts.number_of_pages * PAGE_SIZE;
        let alloc = self
            .arena
            .allocate(len, Policy::InstantFit)
            .map_err(|_| KError::AddressSpace {
                source: AddressSpaceError::OutOfMemory,
            })?;
        trace!("vspace {}: map reserved {:#x}/{:#x}", self.name, alloc.base, alloc.len);

        let (copy_on_write, needs_copy, object) = match &opts.kind {
            MapKind::ZeroFill => (true, false, None),
            MapKind::Object(obj, off) => (false, false, Some((obj.clone(), *off))),
        };

        let mut entries = self.entries.write();
        let idx = entries.partition_point(|e| e.base < alloc.base);

        let before_mergeable = idx > 0
            && entries[idx - 1].end() == alloc.base
            && Self::mergeable(&entries[idx - 1], opts.protection, copy_on_write, needs_copy, &object);
        let after_mergeable = idx < entries.len()
            && entries[idx].base == alloc.base + alloc.len
            && Self::mergeable(&entries[idx], opts.protection, copy_on_write, needs_copy, &object);

        match (before_mergeable, after_mergeable) {
            (true, true) => {
                let after = entries.remove(idx);
                let before = &mut entries[idx - 1];
                Self::grow_anon(before, opts.number_of_pages + after.number_of_pages);
                before.number_of_pages += opts.number_of_pages + after.number_of_pages;
                before.allocations.push(alloc);
                before.allocations.extend(after.allocations);
            }
            (true, false) => {
                let before = &mut entries[idx - 1];
                Self::grow_anon(before, opts.number_of_pages);
                before.number_of_pages += opts.number_of_pages;
                before.allocations.push(alloc);
            }
            (false, true) => {
                let after = &mut entries[idx];
                Self::grow_anon_front(after, opts.number_of_pages);
                after.base = alloc.base;
                after.number_of_pages += opts.number_of_pages;
                after.allocations.push(alloc);
            }
            (false, false) => {
                let anon = match opts.kind {
                    MapKind::ZeroFill => Some(AnonReference {
                        map: AnonMap::new(opts.number_of_pages),
                        start_offset: 0,
                    }),
                    MapKind::Object(_, _) => None,
                };
                entries.insert(
                    idx,
                    Entry {
                        base: alloc.base,
                        number_of_pages: opts.number_of_pages,
                        protection: opts.protection,
                        anon,
                        object,
                        copy_on_write,
                        needs_copy,
                        allocations: {
                            let mut v = Vec::new();
                            v.push(alloc);
                            v
                        },
                    },
                );
            }
        }
        self.entries_version.fetch_add(1, Ordering::Release);
        debug!("vspace {}: entry count now {}", self.name, entries.len());

        Ok(VRange::new(
            VAddr::from_u64(alloc.base as u64),
            VAddr::from_u64((alloc.base + alloc.len) as u64),
        ))
    }

    /// Grow `entry`'s anonymous map, if it has one and exclusively owns
    /// it (spec.md §4.F: "the map's reference_count must be 1 to grow").
    /// If the map is shared the entry's page count still grows (callers
    /// rely on that for merge correctness) but the map itself is left
    /// alone; the grown tail simply has no anonymous backing until a
    /// later operation gives it one, which cannot happen given how this
    /// crate only ever merges freshly allocated, exclusively owned maps.
    fn grow_anon(entry: &mut Entry<'a>, additional_pages: usize) {
        if let Some(anon) = &entry.anon {
            if Arc::strong_count(&anon.map) == 1 {
                anon.map.inner.write().number_of_pages += additional_pages;
            }
        }
    }

    /// Same as [`Self::grow_anon`] but for extending `entry` backward:
    /// every existing page's index inside the map shifts up by
    /// `additional_pages`, so `start_offset` moves down to compensate.
    fn grow_anon_front(entry: &mut Entry<'a>, additional_pages: usize) {
        if let Some(anon) = &mut entry.anon {
            if Arc::strong_count(&anon.map) == 1 {
                anon.map.inner.write().number_of_pages += additional_pages;
                anon.start_offset = anon.start_offset.saturating_sub(additional_pages);
            }
        }
    }

    fn vaddr_of(base: usize, page: usize) -> VAddr {
        VAddr::from_u64((base + page * PAGE_SIZE) as u64)
    }

    /// Tear down the page-table mapping and, if present, the anonymous
    /// chunk at `page_index` (entry-relative). `free_backing = false`:
    /// the `Arc<AnonPage>` we drop here, not the page-table backend, is
    /// what frees the physical frame -- once every map sharing that page
    /// has dropped its reference.
    fn teardown_page(&self, paging: &mut P, anon: &Option<AnonReference<'a>>, entry_relative_page: usize, vaddr: VAddr) {
        paging.unmap(vaddr, false);
        if let Some(r) = anon {
            let mut inner = r.map.inner.write();
            if inner.chunks.remove(&(r.start_offset + entry_relative_page)).is_some() {
                inner.pages_in_use -= 1;
            }
        }
    }

    /// Remove the virtual mapping over `range`, tearing down every
    /// covered page-table entry and anonymous-map chunk, then flush and
    /// return whatever of the underlying arena space can be released.
    ///
    /// `unmap` is not implemented in the kernel this crate is modeled on
    /// (spec.md §9 open question); this is a from-scratch design. The
    /// arena's `deallocate` only accepts an exact `(base, len)` match
    /// against a previously recorded `allocate` (see `crate::vmem`), so
    /// each entry tracks the distinct arena sub-allocations folded into
    /// it by `map`'s merge logic. A full-entry unmap, or a partial unmap
    /// that happens to land on one of those sub-allocation boundaries,
    /// releases the matching virtual range back to the arena immediately.
    /// A partial unmap that cuts strictly inside a sub-allocation's
    /// extent still tears down the page table and anonymous-map state
    /// for that range, but leaves the virtual range reserved in the
    /// arena (the sub-allocation record stays on the entry) until a
    /// later unmap removes that whole sub-allocation outright.
    pub fn unmap(&self, range: VRange, self_id: ExecutorId) -> Result<(), KError> {
        let unmap_base = range.start.as_u64() as usize;
        let unmap_end = range.end.as_u64() as usize;

        let mut entries = self.entries.write();
        let mut i = 0;
        let mut paging = self.page_table.lock();
        while i < entries.len() {
            let (e_base, e_end) = (entries[i].base, entries[i].end());
            if e_end <= unmap_base || e_base >= unmap_end {
                i += 1;
                continue;
            }
            let lo = e_base.max(unmap_base);
            let hi = e_end.min(unmap_end);

            for page in (lo - e_base) / PAGE_SIZE..(hi - e_base) / PAGE_SIZE {
                let vaddr = Self::vaddr_of(e_base, page);
                self.teardown_page(&mut paging, &entries[i].anon, page, vaddr);
            }

            if lo == e_base && hi == e_end {
                let removed = entries.remove(i);
                for a in removed.allocations {
                    self.arena.deallocate(a);
                }
                // Do not increment i: the next element has shifted down.
            } else if lo == e_base {
                // Head trim: shrink from the front.
                let trimmed_pages = (hi - lo) / PAGE_SIZE;
                let entry = &mut entries[i];
                entry.base = hi;
                entry.number_of_pages -= trimmed_pages;
                if let Some(r) = &mut entry.anon {
                    r.start_offset += trimmed_pages;
                }
                self.release_exact_suballocs(entry, lo, hi);
                i += 1;
            } else if hi == e_end {
                // Tail trim: shrink from the back.
                let trimmed_pages = (hi - lo) / PAGE_SIZE;
                let entry = &mut entries[i];
                entry.number_of_pages -= trimmed_pages;
                self.release_exact_suballocs(entry, lo, hi);
                i += 1;
            } else {
                // Middle split: the tail half becomes a new entry sharing
                // the same anonymous map (if any) at a shifted offset.
                let tail_pages = (e_end - hi) / PAGE_SIZE;
                let entry = &mut entries[i];
                let tail_anon = entry.anon.as_ref().map(|r| AnonReference {
                    map: r.map.clone(),
                    start_offset: r.start_offset + (hi - e_base) / PAGE_SIZE,
                });
                let tail = Entry {
                    base: hi,
                    number_of_pages: tail_pages,
                    protection: entry.protection,
                    anon: tail_anon,
                    object: entry.object.clone(),
                    copy_on_write: entry.copy_on_write,
                    needs_copy: entry.needs_copy,
                    allocations: Vec::new(),
                };
                entry.number_of_pages = (lo - e_base) / PAGE_SIZE;
                self.release_exact_suballocs(entry, lo, hi);
                entries.insert(i + 1, tail);
                i += 2;
            }
        }
        drop(entries);

        let request = FlushRequest::new(range, FlushTarget::Kernel);
        self.flush.submit_and_wait(&request, self_id, &mut *paging, self.interrupts);
        self.entries_version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Release any of `entry`'s tracked sub-allocations that fall wholly
    /// within `[lo, hi)` back to the arena, dropping them from the
    /// entry's tracking list. Sub-allocations only partially covered by
    /// `[lo, hi)` are left in place (see `unmap`'s doc comment).
    fn release_exact_suballocs(&self, entry: &mut Entry<'a>, lo: usize, hi: usize) {
        let mut kept = Vec::with_capacity(entry.allocations.len());
        for a in entry.allocations.drain(..) {
            if a.base >= lo && a.base + a.len <= hi {
                self.arena.deallocate(a);
            } else {
                kept.push(a);
            }
        }
        entry.allocations = kept;
    }

    /// Tear down every entry in this address space: unmap each of its
    /// pages, release anonymous-map/object references, and return every
    /// tracked sub-allocation to the arena. The counterpart to `map`
    /// (spec.md §4.F's `AddressSpace: init, deinit, map, unmap,
    /// handlePageFault`) -- without it, dropping a space would leak its
    /// entire virtual range back to the arena and leave anonymous frames
    /// reachable only by accident of `Arc` refcounting.
    pub fn deinit(&self, self_id: ExecutorId) {
        let mut entries = self.entries.write();
        if entries.is_empty() {
            return;
        }
        let span_start = entries.iter().map(|e| e.base).min().unwrap();
        let span_end = entries.iter().map(|e| e.end()).max().unwrap();

        let mut paging = self.page_table.lock();
        for entry in entries.drain(..) {
            for page in 0..entry.number_of_pages {
                let vaddr = Self::vaddr_of(entry.base, page);
                self.teardown_page(&mut paging, &entry.anon, page, vaddr);
            }
            for a in entry.allocations {
                self.arena.deallocate(a);
            }
        }
        drop(entries);

        let range = VRange::new(VAddr::from_u64(span_start as u64), VAddr::from_u64(span_end as u64));
        let request = FlushRequest::new(range, FlushTarget::Kernel);
        self.flush.submit_and_wait(&request, self_id, &mut *paging, self.interrupts);
        drop(paging);
        self.entries_version.fetch_add(1, Ordering::Release);
        debug!("vspace {}: deinit released all entries", self.name);
    }

    fn find_entry(entries: &[Entry<'a>], vaddr: usize) -> Option<usize> {
        let idx = entries.partition_point(|e| e.base <= vaddr);
        if idx == 0 {
            return None;
        }
        let e = &entries[idx - 1];
        if vaddr < e.end() {
            Some(idx - 1)
        } else {
            None
        }
    }

    /// Phase one of the fault handler: locate the entry, check
    /// protection, and promote (clear `needs_copy`, possibly splitting a
    /// shared anonymous map) on a write fault.
    fn fault_check(&self, vaddr: VAddr, access: FaultAccess) -> Result<FaultSnapshot<'a>, KError> {
        let vaddr_usize = vaddr.as_u64() as usize;
        let mut entries = self.entries.write();
        let idx = Self::find_entry(&entries, vaddr_usize).ok_or(KError::AddressSpace {
            source: AddressSpaceError::NotMapped,
        })?;

        if access == FaultAccess::Write && !entries[idx].protection.writable && !entries[idx].copy_on_write {
            return Err(KError::AddressSpace {
                source: AddressSpaceError::Protection,
            });
        }

        if access == FaultAccess::Write && entries[idx].needs_copy {
            self.promote(&mut entries[idx]);
        }

        let entry = &entries[idx];
        let snapshot = FaultSnapshot {
            entry_base: entry.base,
            protection: entry.protection,
            copy_on_write: entry.copy_on_write,
            anon: entry.anon.clone(),
            object: entry.object.clone(),
            version_observed: self.entries_version.load(Ordering::Acquire),
        };
        Ok(snapshot)
    }

    /// Clear `needs_copy`. If the entry's anonymous map is exclusively
    /// owned there is nothing to copy -- this is the first write after a
    /// lazily created private map, and clearing the flag is the entire
    /// promotion (spec.md §4.F: "AnonymousMap.copy... no existing map ->
    /// allocate a fresh map"; here the map already exists from a prior
    /// read fault, so the fast path degenerates to just dropping the
    /// flag). If it is shared, perform the real split: a fresh map gets
    /// its own `Arc` (reference_count 1), every existing page's `Arc` is
    /// cloned into it (incrementing that page's reference count), the
    /// entry repoints to the new map, and the old map's reference count
    /// decrements when `old` goes out of scope at the end of this call.
    fn promote(&self, entry: &mut Entry<'a>) {
        if entry.anon.is_none() {
            entry.anon = Some(AnonReference {
                map: AnonMap::new(entry.number_of_pages),
                start_offset: 0,
            });
            entry.needs_copy = false;
            return;
        }
        let anon = entry.anon.as_ref().unwrap();
        if Arc::strong_count(&anon.map) > 1 {
            warn!("vspace {}: splitting shared anonymous map on write fault", self.name);
            let old = anon.map.clone();
            let start_offset = anon.start_offset;
            let new_map = AnonMap::new(entry.number_of_pages);
            {
                let old_inner = old.inner.read();
                let mut new_inner = new_map.inner.write();
                for page in 0..entry.number_of_pages {
                    if let Some(p) = old_inner.chunks.get(&(start_offset + page)) {
                        new_inner.chunks.insert(page, p.clone());
                        new_inner.pages_in_use += 1;
                    }
                }
            }
            entry.anon = Some(AnonReference {
                map: new_map,
                start_offset: 0,
            });
            // `old` drops here, decrementing the shared map's reference
            // count now that this entry no longer points at it.
        }
        entry.needs_copy = false;
    }

    /// Phase two: materialize (zero-fill / lazily allocate the
    /// anonymous map) or resolve (object-backed) the faulting page, then
    /// install the page-table mapping. A second read fault on an
    /// already-resolved page is a no-op (spec.md §8 property 8): the
    /// early return below never touches the page table.
    fn fault_object_or_zero_fill(
        &self,
        snapshot: &FaultSnapshot<'a>,
        vaddr: VAddr,
        access: FaultAccess,
        page_table: &mut P,
    ) -> Result<Phase2Outcome, KError> {
        if self.entries_version.load(Ordering::Acquire) != snapshot.version_observed {
            return Ok(Phase2Outcome::Restart);
        }

        let page_index = (vaddr.as_u64() as usize - snapshot.entry_base) / PAGE_SIZE;

        if let Some((obj, obj_offset)) = &snapshot.object {
            let paddr = obj.resolve_page(obj_offset + page_index).map_err(|e| KError::AddressSpace { source: e })?;
            let frame = Frame(paddr.as_u64() as u32 / PAGE_SIZE as u32);
            let action = MapAction {
                writable: snapshot.protection.writable && (access == FaultAccess::Write || !snapshot.copy_on_write),
                executable: snapshot.protection.executable,
                user_accessible: snapshot.protection.user_accessible,
            };
            let _ = page_table.map(vaddr, frame, action);
            return Ok(Phase2Outcome::Done);
        }

        let anon = match &snapshot.anon {
            Some(r) => r.clone(),
            None => return Err(KError::AddressSpace { source: AddressSpaceError::NotMapped }),
        };
        let chunk_index = anon.start_offset + page_index;

        let existing = anon.map.inner.read().chunks.get(&chunk_index).cloned();
        if let Some(page) = existing {
            if access == FaultAccess::Read {
                // Already resolved and already mapped: a genuine no-op.
                return Ok(Phase2Outcome::Done);
            }
            // First write after a read fault: remap writable in place,
            // reusing the frame already behind this page.
            page_table.unmap(vaddr, false);
            let action = MapAction {
                writable: true,
                executable: snapshot.protection.executable,
                user_accessible: snapshot.protection.user_accessible,
            };
            let _ = page_table.map(vaddr, page.frame, action);
            return Ok(Phase2Outcome::Done);
        }

        let frame = self.frames.allocate_frame().map_err(|_| KError::AddressSpace { source: AddressSpaceError::NoMemory })?;
        unsafe {
            core::ptr::write_bytes(direct_map(frame.base()), 0, PAGE_SIZE);
        }
        let page = Arc::new(AnonPage { frame, frames: self.frames });
        {
            let mut inner = anon.map.inner.write();
            inner.chunks.insert(chunk_index, page.clone());
            inner.pages_in_use += 1;
        }

        let writable = snapshot.protection.writable && (access == FaultAccess::Write || !snapshot.copy_on_write);
        let action = MapAction {
            writable,
            executable: snapshot.protection.executable,
            user_accessible: snapshot.protection.user_accessible,
        };
        let _ = page_table.map(vaddr, frame, action);
        trace!("vspace {}: zero-fill fault resolved at page {}", self.name, chunk_index);
        Ok(Phase2Outcome::Done)
    }

    /// Resolve a page fault at `vaddr`, retrying internally if the entry
    /// list changes between the two phases.
    pub fn handle_page_fault(&self, vaddr: VAddr, access: FaultAccess) -> Result<(), KError> {
        loop {
            let snapshot = self.fault_check(vaddr, access)?;
            let mut paging = self.page_table.lock();
            match self.fault_object_or_zero_fill(&snapshot, vaddr, access, &mut paging)? {
                Phase2Outcome::Done => return Ok(()),
                Phase2Outcome::Restart => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MapError;
    use crate::tagpool::TagPool;
    use crate::testutil::real_backed_frames;
    use core::cell::RefCell;

    struct FakePaging {
        mapped: RefCell<HashMap<u64, (Frame, MapAction)>>,
    }

    impl FakePaging {
        fn new() -> Self {
            FakePaging { mapped: RefCell::new(HashMap::new()) }
        }
    }

    impl PagingBackend for FakePaging {
        fn map(&mut self, vaddr: VAddr, frame: Frame, action: MapAction) -> Result<(), MapError> {
            self.mapped.borrow_mut().insert(vaddr.as_u64(), (frame, action));
            Ok(())
        }
        fn unmap(&mut self, vaddr: VAddr, _free_backing: bool) -> Option<Frame> {
            self.mapped.borrow_mut().remove(&vaddr.as_u64()).map(|(f, _)| f)
        }
        fn flush_cache(&mut self, _range: VRange) {}
    }

    struct NoopInterrupts;
    impl InterruptController for NoopInterrupts {
        fn send_flush_ipi(&self, _executor: ExecutorId) {}
    }

    fn harness() -> (TagPool, crate::frame::FrameAllocator) {
        (TagPool::new(), real_backed_frames(64))
    }

    #[test]
    fn demand_zero_fault_then_write_promotes() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x1000_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let range = space
            .map(MapOptions {
                number_of_pages: 3,
                protection: MapAction::kernel_rw(),
                kind: MapKind::ZeroFill,
            })
            .unwrap();
        let base = range.start;

        space.handle_page_fault(base, FaultAccess::Read).unwrap();
        assert!(paging.lock().mapped.borrow().contains_key(&base.as_u64()));
        assert_eq!(paging.lock().mapped.borrow().get(&base.as_u64()).unwrap().1.writable, false);

        // Second read fault is a no-op: same frame, no new allocation.
        let frame_before = paging.lock().mapped.borrow().get(&base.as_u64()).unwrap().0;
        space.handle_page_fault(base, FaultAccess::Read).unwrap();
        let frame_after = paging.lock().mapped.borrow().get(&base.as_u64()).unwrap().0;
        assert_eq!(frame_before, frame_after);

        space.handle_page_fault(base, FaultAccess::Write).unwrap();
        assert!(paging.lock().mapped.borrow().get(&base.as_u64()).unwrap().1.writable);

        let second_page = VAddr::from_u64(base.as_u64() + PAGE_SIZE as u64);
        space.handle_page_fault(second_page, FaultAccess::Read).unwrap();
        let f2 = paging.lock().mapped.borrow().get(&second_page.as_u64()).unwrap().0;
        assert_ne!(f2, frame_after);
    }

    #[test]
    fn merge_on_map_yields_one_entry_and_grown_anon_map() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x2000_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let first = space
            .map(MapOptions { number_of_pages: 4, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        let second_base = VAddr::from_u64(first.end.as_u64());
        let _second = space
            .map(MapOptions { number_of_pages: 4, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();

        let entries = space.entries.read();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].number_of_pages, 8);
        assert_eq!(entries[0].anon.as_ref().unwrap().map.number_of_pages(), 8);
        drop(entries);
        let _ = second_base;
    }

    #[test]
    fn full_entry_unmap_releases_arena_space() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x3000_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let range = space
            .map(MapOptions { number_of_pages: 2, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        space.handle_page_fault(range.start, FaultAccess::Read).unwrap();
        let before = arena.allocated_bytes();
        assert!(before > 0);

        space.unmap(range, 0).unwrap();
        assert_eq!(arena.allocated_bytes(), 0);
        assert!(paging.lock().mapped.borrow().is_empty());
        assert!(space.entries.read().is_empty());
    }

    #[test]
    fn deinit_releases_every_entry_and_arena_suballocation() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x3800_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let first = space
            .map(MapOptions { number_of_pages: 2, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        let _second = space
            .map(MapOptions { number_of_pages: 2, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        space.handle_page_fault(first.start, FaultAccess::Read).unwrap();
        let second_entry_page = VAddr::from_u64(first.end.as_u64());
        space.handle_page_fault(second_entry_page, FaultAccess::Read).unwrap();
        assert!(arena.allocated_bytes() > 0);
        assert!(!paging.lock().mapped.borrow().is_empty());

        space.deinit(0);

        assert_eq!(arena.allocated_bytes(), 0);
        assert!(paging.lock().mapped.borrow().is_empty());
        assert!(space.entries.read().is_empty());
    }

    #[test]
    fn partial_head_unmap_splits_entry_without_losing_tail_mapping() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x4000_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let range = space
            .map(MapOptions { number_of_pages: 4, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        space.handle_page_fault(range.start, FaultAccess::Read).unwrap();
        let second_page = VAddr::from_u64(range.start.as_u64() + PAGE_SIZE as u64);
        space.handle_page_fault(second_page, FaultAccess::Read).unwrap();

        let head = VRange::new(range.start, second_page);
        space.unmap(head, 0).unwrap();

        let entries = space.entries.read();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].base, second_page.as_u64() as usize);
        assert_eq!(entries[0].number_of_pages, 3);
        drop(entries);
        assert!(!paging.lock().mapped.borrow().contains_key(&range.start.as_u64()));
        assert!(paging.lock().mapped.borrow().contains_key(&second_page.as_u64()));
        // The 2-page sub-allocation straddling the cut couldn't be
        // exactly matched, so nothing was released to the arena yet.
        assert_eq!(arena.allocated_bytes(), 4 * PAGE_SIZE);
    }

    #[test]
    fn full_cow_split_preserves_pages_and_drops_old_map_refcount() {
        let (pool, fa) = harness();
        let arena = Arena::create("vm", PAGE_SIZE, None, &pool, &fa).unwrap();
        arena.add_span(0x5000_0000, 0x10_0000).unwrap();
        let paging = Mutex::new(FakePaging::new());
        let flush = FlushCoordinator::new(1);
        let interrupts = NoopInterrupts;
        let space = AddressSpace::new("test", &arena, &fa, &paging, &flush, &interrupts).unwrap();

        let range = space
            .map(MapOptions { number_of_pages: 1, protection: MapAction::kernel_rw(), kind: MapKind::ZeroFill })
            .unwrap();
        space.handle_page_fault(range.start, FaultAccess::Read).unwrap();

        // Simulate a second entry sharing the same anonymous map, as a
        // fork-like collaborator (out of this crate's scope) would set
        // up: clone the Arc and bump needs_copy back on both sides.
        let shared_map = {
            let entries = space.entries.read();
            entries[0].anon.as_ref().unwrap().map.clone()
        };
        assert_eq!(Arc::strong_count(&shared_map), 2);
        {
            let mut entries = space.entries.write();
            entries[0].needs_copy = true;
        }

        space.handle_page_fault(range.start, FaultAccess::Write).unwrap();

        let entries = space.entries.read();
        assert!(!Arc::ptr_eq(&entries[0].anon.as_ref().unwrap().map, &shared_map));
        assert_eq!(entries[0].anon.as_ref().unwrap().map.pages_in_use(), 1);
        drop(entries);
        // Only this test's local clone keeps the old map alive now.
        assert_eq!(Arc::strong_count(&shared_map), 1);
    }
}
