//! # Virtual Memory Support
//!
//! Physical frame accounting, x86-64 style four-level page tables and
//! per-process address spaces with copy-on-write `fork` and demand-zero
//! regions.
//!
//! ## What you get
//! - Typed [`PhysicalAddress`]/[`VirtualAddress`] newtypes and their page
//!   granular companions [`Frame`] and [`VirtualPage`].
//! - A reference counting [`FrameAllocator`] behind a [`FramePool`] lock.
//! - Page table entries as a [`PageEntryBits`] bitfield, including the
//!   software-defined copy-on-write marker.
//! - An [`AddressSpace`] that owns a root table and a set of [`Region`]s and
//!   resolves page faults against them.
//!
//! ## Address walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Only 4 KiB leaves are used. Intermediate entries are always
//! present, writable and user accessible; the effective permissions of a page
//! are decided by its leaf entry alone.
//!
//! ## Hardware seam
//!
//! All table and frame contents are accessed through [`PhysicalMemory`], so the
//! same code runs against real RAM (through a direct map) or against
//! [`HostMemory`] in tests. TLB maintenance is delegated to [`TlbInvalidate`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod addresses;
pub mod frame_alloc;
pub mod info;
mod page_entry_bits;
mod page_table;
pub mod phys;

pub use crate::address_space::{
    Access, AddressSpace, AddressSpaceStats, Backing, FaultCause, FaultResolution, PageFault,
    PageFaultError, Permissions, Region, Translation, VmError,
};
pub use crate::addresses::{Frame, PhysicalAddress, VirtualAddress, VirtualPage};
pub use crate::frame_alloc::{FrameAllocator, FrameError, FramePool, MemoryRegion, RegionKind};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::phys::{HostMemory, NoTlb, PhysicalMemory, TlbInvalidate};

/// Everything an address space operation needs from the outside world.
///
/// Bundles the physical memory accessor, the shared frame pool and the TLB
/// hook so that call sites do not have to thread three parameters through
/// every operation.
#[derive(Copy, Clone)]
pub struct VmContext<'a> {
    pub memory: &'a dyn PhysicalMemory,
    pub frames: &'a FramePool,
    pub tlb: &'a dyn TlbInvalidate,
}

impl<'a> VmContext<'a> {
    #[must_use]
    pub const fn new(
        memory: &'a dyn PhysicalMemory,
        frames: &'a FramePool,
        tlb: &'a dyn TlbInvalidate,
    ) -> Self {
        Self {
            memory,
            frames,
            tlb,
        }
    }
}
