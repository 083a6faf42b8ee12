//! A kernel virtual-memory allocation core: a vmem-style boundary-tag
//! resource arena, a slab/object cache built on top of it, a lock-free
//! TLB-shootdown coordinator, a UVM-style address space with copy-on-write
//! and demand paging, and the bootstrap path that wires them together from
//! a boot-time physical memory map.
//!
//! Modeled on `nrk::memory` (the node-replicated kernel): `no_std` + `alloc`,
//! no heap allocator of its own at the crate boundary (callers already have
//! one, or are building one out of this crate's pieces), no dependency on a
//! scheduler or process abstraction. Architecture-specific paging, boot
//! sequencing, and interrupt delivery are out of scope (spec.md §1) and are
//! modeled as the small capability traits in [`collab`].
//!
//! # Module map
//!
//! | Module | Component |
//! |---|---|
//! | [`frame`] | A -- physical frame allocator |
//! | [`flush`] | B -- TLB flush coordinator |
//! | [`tagpool`], [`vmem`] | C -- boundary-tag resource arena |
//! | [`slab`] | D -- slab / object cache |
//! | [`heap`] | E -- heap facade |
//! | [`vspace`] | F -- address space / page fault handling |
//! | [`layout`] | G -- one-shot bootstrap |
#![no_std]

extern crate alloc;

pub mod prelude;

pub mod addr;
pub mod collab;
pub mod error;
pub mod flush;
pub mod frame;
pub mod heap;
pub mod layout;
pub mod slab;
pub mod tagpool;
pub mod vmem;
pub mod vspace;

#[cfg(test)]
mod testutil;
