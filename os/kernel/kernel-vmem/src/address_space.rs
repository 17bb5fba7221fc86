//! # Address spaces
//!
//! An [`AddressSpace`] owns a root page table and the set of user [`Region`]s
//! mapped into it. Every present leaf holds one reference on its frame in the
//! [`FramePool`](crate::FramePool); frames shared after [`AddressSpace::fork`]
//! carry one reference per mapping.
//!
//! ## Copy-on-write
//!
//! `fork` shares every populated page of the parent with the child. Pages of
//! writable regions are demoted to read-only with the
//! [`copy_on_write`](crate::PageEntryBits::copy_on_write) marker on both
//! sides. The first write from either side faults and
//! [`AddressSpace::handle_fault`] gives the writer a private copy, or, if the
//! writer holds the only remaining reference, simply re-enables writes.
//!
//! ## Demand-zero regions
//!
//! Regions mapped with [`Backing::Lazy`] are reserved without frames. The
//! first access to each page faults and is backed by a zeroed frame.

mod fault;
mod region;

pub use self::fault::{Access, FaultCause, FaultResolution, PageFault, PageFaultError};
pub use self::region::{Backing, Permissions, Region};

use crate::VmContext;
use crate::addresses::{Frame, PhysicalAddress, VirtualAddress, VirtualPage};
use crate::frame_alloc::FrameError;
use crate::info::{PAGE_SIZE, is_user_range};
use crate::page_entry_bits::PageEntryBits;
use crate::page_table::{EntrySlot, PageTableWalker};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("range overlaps an existing region")]
    Overlap,
    #[error("no region mapped at {0}")]
    NotMapped(VirtualAddress),
    #[error("address or length is not page aligned")]
    Unaligned,
    #[error("range is empty or outside user space")]
    InvalidRange,
    #[error("illegal access at {address}: {cause}")]
    IllegalFault {
        address: VirtualAddress,
        cause: FaultCause,
    },
    #[error("frame accounting error: {0}")]
    Frame(FrameError),
}

impl From<FrameError> for VmError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::OutOfMemory => Self::OutOfMemory,
            other => Self::Frame(other),
        }
    }
}

/// Result of a successful translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub address: PhysicalAddress,
    pub entry: PageEntryBits,
}

/// Counters kept per address space.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AddressSpaceStats {
    /// Private copies made by copy-on-write faults.
    pub cow_copies: u64,
    /// Copy-on-write pages re-enabled in place.
    pub cow_reclaims: u64,
    /// Lazy pages populated on first touch.
    pub zero_fills: u64,
}

pub struct AddressSpace {
    root: Frame,
    regions: BTreeMap<VirtualAddress, Region>,
    stats: AddressSpaceStats,
}

impl AddressSpace {
    /// Allocates and zeroes a new root table. The space starts without regions.
    pub fn create(ctx: VmContext<'_>) -> Result<Self, VmError> {
        let root = ctx.frames.lock().allocate()?;
        ctx.memory.zero(root);
        log::debug!("address space created with root {root:?}");
        Ok(Self {
            root,
            regions: BTreeMap::new(),
            stats: AddressSpaceStats::default(),
        })
    }

    /// Frame holding the top-level table, as loaded into the MMU root register.
    #[must_use]
    pub const fn root(&self) -> Frame {
        self.root
    }

    #[must_use]
    pub const fn stats(&self) -> AddressSpaceStats {
        self.stats
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// The region covering `va`, if any.
    #[must_use]
    pub fn region_containing(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    /// Maps a new region `[start, start + len)`.
    ///
    /// On failure nothing of the region remains mapped and every frame taken
    /// along the way is back in the pool.
    pub fn map(
        &mut self,
        ctx: VmContext<'_>,
        start: VirtualAddress,
        len: u64,
        permissions: Permissions,
        backing: Backing<'_>,
    ) -> Result<(), VmError> {
        if !start.is_page_aligned() || len % PAGE_SIZE != 0 {
            return Err(VmError::Unaligned);
        }
        if len == 0 || !is_user_range(start.as_u64(), len) {
            return Err(VmError::InvalidRange);
        }
        if let Backing::Image(bytes) = backing
            && bytes.len() as u64 > len
        {
            return Err(VmError::InvalidRange);
        }
        if self.regions.values().any(|r| r.overlaps(start, len)) {
            return Err(VmError::Overlap);
        }

        let region = Region::new(start, len, permissions, backing == Backing::Lazy);
        if !region.is_lazy() {
            self.populate(ctx, &region, backing)?;
        }

        log::debug!(
            "mapped {start}..{} {:?}{}",
            region.end(),
            permissions,
            if region.is_lazy() { " (lazy)" } else { "" }
        );
        self.regions.insert(start, region);
        Ok(())
    }

    fn populate(
        &self,
        ctx: VmContext<'_>,
        region: &Region,
        backing: Backing<'_>,
    ) -> Result<(), VmError> {
        let walker = PageTableWalker::new(ctx.memory, self.root);
        let mut created = Vec::new();
        let mut mapped: Vec<(EntrySlot, Frame)> = Vec::new();

        let result = (|| {
            for (i, page) in region.pages().enumerate() {
                let slot = walker.ensure_leaf(ctx.frames, page, &mut created)?;
                let frame = ctx.frames.lock().allocate()?;
                ctx.memory.zero(frame);
                if let Backing::Image(bytes) = backing {
                    let from = i * PAGE_SIZE as usize;
                    if from < bytes.len() {
                        let to = bytes.len().min(from + PAGE_SIZE as usize);
                        ctx.memory.write(frame, 0, &bytes[from..to]);
                    }
                }
                slot.write(ctx.memory, leaf_for(frame, region.permissions()));
                mapped.push((slot, frame));
            }
            Ok::<(), VmError>(())
        })();

        if let Err(e) = result {
            log::warn!("mapping {} failed: {e}; rolling back", region.start());
            for (slot, frame) in mapped.iter().rev() {
                slot.write(ctx.memory, PageEntryBits::new());
                if let Err(e) = ctx.frames.lock().release(*frame) {
                    log::error!("rollback release of {frame:?} failed: {e}");
                }
            }
            walker.discard_created(ctx.frames, &created);
            return Err(e);
        }
        Ok(())
    }

    /// Removes the region starting at `start` with exactly `len` bytes and
    /// releases its frames.
    pub fn unmap(
        &mut self,
        ctx: VmContext<'_>,
        start: VirtualAddress,
        len: u64,
    ) -> Result<Region, VmError> {
        let region = match self.regions.get(&start) {
            Some(r) if r.len() == len => *r,
            _ => return Err(VmError::NotMapped(start)),
        };
        self.clear_region(ctx, &region);
        self.regions.remove(&start);
        log::debug!("unmapped {start}..{}", region.end());
        Ok(region)
    }

    fn clear_region(&self, ctx: VmContext<'_>, region: &Region) {
        let walker = PageTableWalker::new(ctx.memory, self.root);
        for page in region.pages() {
            let Some(slot) = walker.leaf(page) else {
                continue;
            };
            let entry = slot.read(ctx.memory);
            if !entry.present() {
                continue;
            }
            slot.write(ctx.memory, PageEntryBits::new());
            ctx.tlb.invalidate(self.root, page);
            if let Err(e) = ctx.frames.lock().release(entry.frame()) {
                log::error!("release of {:?} for {page:?} failed: {e}", entry.frame());
            }
        }
    }

    /// Software page walk. Returns `None` if `va` has no present translation.
    #[must_use]
    pub fn translate(&self, ctx: VmContext<'_>, va: VirtualAddress) -> Option<Translation> {
        let walker = PageTableWalker::new(ctx.memory, self.root);
        let entry = walker.entry(va.page())?;
        entry.present().then(|| Translation {
            address: entry.frame().base() + va.page_offset(),
            entry,
        })
    }

    /// Performs the permission checks of the MMU for a user-mode access.
    ///
    /// Returns the physical address on success, or the page fault the access
    /// would raise.
    pub fn access(
        &self,
        ctx: VmContext<'_>,
        va: VirtualAddress,
        access: Access,
    ) -> Result<PhysicalAddress, PageFault> {
        let Some(t) = self.translate(ctx, va) else {
            return Err(PageFault::new(va, access, false));
        };
        let allowed = t.entry.user_access()
            && match access {
                Access::Read => true,
                Access::Write => t.entry.writable(),
                Access::Execute => !t.entry.no_execute(),
            };
        if allowed {
            Ok(t.address)
        } else {
            Err(PageFault::new(va, access, true))
        }
    }

    /// Resolves a page fault raised by this address space.
    ///
    /// Legitimate faults are copy-on-write writes and first touches of lazy
    /// pages. Everything else is reported as [`VmError::IllegalFault`].
    pub fn handle_fault(
        &mut self,
        ctx: VmContext<'_>,
        fault: PageFault,
    ) -> Result<FaultResolution, VmError> {
        let va = fault.address;
        let access = fault.access();
        let illegal = |cause| VmError::IllegalFault { address: va, cause };

        let region = *self
            .region_containing(va)
            .ok_or_else(|| illegal(FaultCause::Unmapped))?;
        if !region.permissions().allows(access) {
            return Err(illegal(match access {
                Access::Read => FaultCause::NotReadable,
                Access::Write => FaultCause::WriteProtected,
                Access::Execute => FaultCause::NotExecutable,
            }));
        }

        let page = va.page();
        let walker = PageTableWalker::new(ctx.memory, self.root);
        let mut created = Vec::new();
        let slot = walker.ensure_leaf(ctx.frames, page, &mut created)?;
        let entry = slot.read(ctx.memory);

        if !entry.present() {
            let frame = match ctx.frames.lock().allocate() {
                Ok(frame) => frame,
                Err(e) => {
                    walker.discard_created(ctx.frames, &created);
                    return Err(e.into());
                }
            };
            ctx.memory.zero(frame);
            slot.write(ctx.memory, leaf_for(frame, region.permissions()));
            self.stats.zero_fills += 1;
            log::trace!("zero-filled {page:?} with {frame:?}");
            return Ok(FaultResolution::ZeroFilled);
        }

        if access == Access::Write && entry.copy_on_write() {
            return self.break_cow(ctx, slot, page, entry);
        }

        Ok(FaultResolution::Spurious)
    }

    fn break_cow(
        &mut self,
        ctx: VmContext<'_>,
        slot: EntrySlot,
        page: VirtualPage,
        entry: PageEntryBits,
    ) -> Result<FaultResolution, VmError> {
        let old = entry.frame();
        let writable = entry.with_writable(true).with_copy_on_write(false);

        let mut frames = ctx.frames.lock();
        if frames.ref_count(old) <= 1 {
            drop(frames);
            slot.write(ctx.memory, writable);
            ctx.tlb.invalidate(self.root, page);
            self.stats.cow_reclaims += 1;
            log::trace!("reclaimed sole reference to {old:?} for {page:?}");
            return Ok(FaultResolution::Reclaimed);
        }

        let new = frames.allocate()?;
        drop(frames);
        ctx.memory.copy_frame(old, new);
        slot.write(ctx.memory, writable.with_frame(new));
        ctx.tlb.invalidate(self.root, page);
        if let Err(e) = ctx.frames.lock().release(old) {
            log::error!("release of shared {old:?} failed: {e}");
        }
        self.stats.cow_copies += 1;
        log::trace!("copied {old:?} to {new:?} for {page:?}");
        Ok(FaultResolution::CopiedOnWrite)
    }

    /// Creates a copy-on-write duplicate of this address space.
    ///
    /// Populated pages are shared: writable ones are demoted to copy-on-write
    /// in both spaces, read-only ones are shared as-is. Lazy pages that were
    /// never touched stay unpopulated in both. If the child cannot be built,
    /// the parent is restored and every frame taken is released.
    pub fn fork(&mut self, ctx: VmContext<'_>) -> Result<Self, VmError> {
        let mut child = Self::create(ctx)?;
        let parent_walker = PageTableWalker::new(ctx.memory, self.root);
        let child_walker = PageTableWalker::new(ctx.memory, child.root);
        let mut demoted: Vec<(EntrySlot, PageEntryBits, VirtualPage)> = Vec::new();

        let result = (|| {
            for region in self.regions.values() {
                child.regions.insert(region.start(), *region);
                for page in region.pages() {
                    let Some(slot) = parent_walker.leaf(page) else {
                        continue;
                    };
                    let entry = slot.read(ctx.memory);
                    if !entry.present() {
                        continue;
                    }

                    let mut scratch = Vec::new();
                    let child_slot = child_walker.ensure_leaf(ctx.frames, page, &mut scratch)?;
                    ctx.frames.lock().share(entry.frame())?;

                    let shared = if region.permissions().write() {
                        entry.as_copy_on_write()
                    } else {
                        entry
                    };
                    child_slot.write(ctx.memory, shared.with_accessed(false).with_dirty(false));
                    if shared != entry {
                        slot.write(ctx.memory, shared);
                        demoted.push((slot, entry, page));
                    }
                }
            }
            Ok::<(), VmError>(())
        })();

        match result {
            Ok(()) => {
                for (_, _, page) in &demoted {
                    ctx.tlb.invalidate(self.root, *page);
                }
                log::debug!(
                    "forked {:?} into {:?}: {} regions, {} pages demoted to copy-on-write",
                    self.root,
                    child.root,
                    child.regions.len(),
                    demoted.len()
                );
                Ok(child)
            }
            Err(e) => {
                log::warn!("fork of {:?} failed: {e}; rolling back", self.root);
                for (slot, original, _) in demoted.iter().rev() {
                    slot.write(ctx.memory, *original);
                }
                child.destroy(ctx);
                Err(e)
            }
        }
    }

    /// Releases every frame mapped by this space, its page tables and its root.
    pub fn destroy(mut self, ctx: VmContext<'_>) {
        let regions = core::mem::take(&mut self.regions);
        for region in regions.values() {
            self.clear_region(ctx, region);
        }
        PageTableWalker::new(ctx.memory, self.root).free_tables(ctx.frames);
        if let Err(e) = ctx.frames.lock().free(self.root) {
            log::error!("failed to free root table {:?}: {e}", self.root);
        }
        log::debug!("address space {:?} destroyed", self.root);
    }

    /// Returns `true` if every byte of `[va, va + len)` lies in regions that
    /// permit `access`. Population is not required.
    #[must_use]
    pub fn validate_range(&self, va: VirtualAddress, len: u64, access: Access) -> bool {
        if len == 0 {
            return true;
        }
        if !is_user_range(va.as_u64(), len) {
            return false;
        }
        let end = va.as_u64() + len;
        let mut cursor = va;
        while cursor.as_u64() < end {
            match self.region_containing(cursor) {
                Some(r) if r.permissions().allows(access) => cursor = r.end(),
                _ => return false,
            }
        }
        true
    }

    /// Copies bytes out of populated pages, bypassing permission checks.
    ///
    /// Fails with [`VmError::NotMapped`] at the first unpopulated page.
    pub fn read_bytes(
        &self,
        ctx: VmContext<'_>,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = va + done as u64;
            let t = self.translate(ctx, at).ok_or(VmError::NotMapped(at))?;
            let offset = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            ctx.memory
                .read(t.entry.frame(), offset, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Number of present leaves, for accounting.
    #[must_use]
    pub fn resident_pages(&self, ctx: VmContext<'_>) -> usize {
        let walker = PageTableWalker::new(ctx.memory, self.root);
        self.regions
            .values()
            .flat_map(Region::pages)
            .filter(|p| walker.entry(*p).is_some_and(|e| e.present()))
            .count()
    }

    /// Frame backing `va`, if populated.
    #[must_use]
    pub fn frame_of(&self, ctx: VmContext<'_>, va: VirtualAddress) -> Option<Frame> {
        self.translate(ctx, va).map(|t| t.entry.frame())
    }
}

fn leaf_for(frame: Frame, permissions: Permissions) -> PageEntryBits {
    PageEntryBits::user_leaf(frame, permissions.write(), permissions.execute())
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("regions", &self.regions.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::{FrameAllocator, FramePool};
    use crate::phys::{HostMemory, NoTlb, PhysicalMemory};

    struct Machine {
        memory: HostMemory,
        frames: FramePool,
    }

    impl Machine {
        fn new(frames: usize) -> Self {
            let memory = HostMemory::new(PhysicalAddress::new(0x10_0000), frames);
            let frames = FramePool::new(FrameAllocator::new(&memory.memory_map()));
            Self { memory, frames }
        }

        fn ctx(&self) -> VmContext<'_> {
            VmContext::new(&self.memory, &self.frames, &NoTlb)
        }

        fn free(&self) -> usize {
            self.frames.lock().free_frames()
        }
    }

    const BASE: VirtualAddress = VirtualAddress::new(0x40_0000);

    #[test]
    fn map_translate_unmap() {
        let m = Machine::new(32);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        let before = m.free();

        space
            .map(m.ctx(), BASE, 2 * PAGE_SIZE, Permissions::READ_WRITE, Backing::Zeroed)
            .unwrap();
        let t = space.translate(m.ctx(), BASE + 0x1234).unwrap();
        assert_eq!(t.address.page_offset(), 0x234);
        assert!(t.entry.writable() && t.entry.user_access() && t.entry.no_execute());

        space.unmap(m.ctx(), BASE, 2 * PAGE_SIZE).unwrap();
        assert!(space.translate(m.ctx(), BASE).is_none());
        // Intermediate tables stay until destroy.
        assert_eq!(m.free(), before - 3);
        space.destroy(m.ctx());
        assert_eq!(m.free(), 32);
    }

    #[test]
    fn overlapping_map_is_rejected() {
        let m = Machine::new(32);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        space
            .map(m.ctx(), BASE, 2 * PAGE_SIZE, Permissions::READ, Backing::Zeroed)
            .unwrap();
        let err = space
            .map(m.ctx(), BASE + PAGE_SIZE, PAGE_SIZE, Permissions::READ, Backing::Zeroed)
            .unwrap_err();
        assert_eq!(err, VmError::Overlap);
    }

    #[test]
    fn invalid_ranges() {
        let m = Machine::new(8);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        let rw = Permissions::READ_WRITE;
        assert_eq!(
            space.map(m.ctx(), BASE + 1, PAGE_SIZE, rw, Backing::Zeroed),
            Err(VmError::Unaligned)
        );
        assert_eq!(
            space.map(m.ctx(), BASE, 0, rw, Backing::Zeroed),
            Err(VmError::InvalidRange)
        );
        assert_eq!(
            space.map(m.ctx(), VirtualAddress::new(0), PAGE_SIZE, rw, Backing::Zeroed),
            Err(VmError::InvalidRange)
        );
        assert_eq!(
            space.unmap(m.ctx(), BASE, PAGE_SIZE),
            Err(VmError::NotMapped(BASE))
        );
    }

    #[test]
    fn failed_map_rolls_back() {
        // root + 3 tables + 2 data frames fit, the third data frame does not.
        let m = Machine::new(6);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        let free = m.free();
        let err = space
            .map(m.ctx(), BASE, 3 * PAGE_SIZE, Permissions::READ_WRITE, Backing::Zeroed)
            .unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
        assert_eq!(m.free(), free);
        assert_eq!(space.regions().count(), 0);
        assert!(space.translate(m.ctx(), BASE).is_none());
    }

    #[test]
    fn image_backing_copies_bytes() {
        let m = Machine::new(16);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        space
            .map(m.ctx(), BASE, PAGE_SIZE, Permissions::READ_EXECUTE, Backing::Image(b"\x90\xC3"))
            .unwrap();
        let mut buf = [0xFFu8; 4];
        space.read_bytes(m.ctx(), BASE, &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0xC3, 0, 0]);
        assert!(space.access(m.ctx(), BASE, Access::Execute).is_ok());
        let fault = space.access(m.ctx(), BASE, Access::Write).unwrap_err();
        assert!(fault.error.present() && fault.error.write());
    }

    #[test]
    fn lazy_region_fills_on_touch() {
        let m = Machine::new(16);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        space
            .map(m.ctx(), BASE, 4 * PAGE_SIZE, Permissions::READ_WRITE, Backing::Lazy)
            .unwrap();
        assert_eq!(space.resident_pages(m.ctx()), 0);

        let va = BASE + 2 * PAGE_SIZE + 8;
        let fault = space.access(m.ctx(), va, Access::Write).unwrap_err();
        assert!(!fault.error.present());
        assert_eq!(
            space.handle_fault(m.ctx(), fault),
            Ok(FaultResolution::ZeroFilled)
        );
        assert!(space.access(m.ctx(), va, Access::Write).is_ok());
        assert_eq!(space.resident_pages(m.ctx()), 1);
        assert_eq!(space.stats().zero_fills, 1);
    }

    #[test]
    fn illegal_faults_are_classified() {
        let m = Machine::new(16);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        space
            .map(m.ctx(), BASE, PAGE_SIZE, Permissions::READ, Backing::Zeroed)
            .unwrap();

        let unmapped = PageFault::new(VirtualAddress::new(0x80_0000), Access::Read, false);
        assert_eq!(
            space.handle_fault(m.ctx(), unmapped),
            Err(VmError::IllegalFault {
                address: VirtualAddress::new(0x80_0000),
                cause: FaultCause::Unmapped
            })
        );

        let ro = PageFault::new(BASE, Access::Write, true);
        assert!(matches!(
            space.handle_fault(m.ctx(), ro),
            Err(VmError::IllegalFault {
                cause: FaultCause::WriteProtected,
                ..
            })
        ));
    }

    #[test]
    fn fork_shares_then_copies_on_write() {
        let m = Machine::new(64);
        let mut parent = AddressSpace::create(m.ctx()).unwrap();
        parent
            .map(m.ctx(), BASE, PAGE_SIZE, Permissions::READ_WRITE, Backing::Image(b"parent"))
            .unwrap();
        let shared = parent.frame_of(m.ctx(), BASE).unwrap();

        let mut child = parent.fork(m.ctx()).unwrap();
        assert_eq!(child.frame_of(m.ctx(), BASE), Some(shared));
        assert_eq!(m.frames.lock().ref_count(shared), 2);

        // Both sides lost write access.
        let fault = child.access(m.ctx(), BASE, Access::Write).unwrap_err();
        assert!(parent.access(m.ctx(), BASE, Access::Write).is_err());

        assert_eq!(
            child.handle_fault(m.ctx(), fault),
            Ok(FaultResolution::CopiedOnWrite)
        );
        let private = child.frame_of(m.ctx(), BASE).unwrap();
        assert_ne!(private, shared);
        assert_eq!(m.frames.lock().ref_count(shared), 1);
        m.memory.write(private, 0, b"child!");

        let mut buf = [0u8; 6];
        parent.read_bytes(m.ctx(), BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        // The parent now holds the only reference and reclaims in place.
        let fault = parent.access(m.ctx(), BASE, Access::Write).unwrap_err();
        assert_eq!(
            parent.handle_fault(m.ctx(), fault),
            Ok(FaultResolution::Reclaimed)
        );
        assert_eq!(parent.frame_of(m.ctx(), BASE), Some(shared));
        assert_eq!(child.stats().cow_copies, 1);
        assert_eq!(parent.stats().cow_reclaims, 1);

        child.destroy(m.ctx());
        parent.destroy(m.ctx());
        assert_eq!(m.free(), 64);
    }

    #[test]
    fn fork_shares_read_only_without_cow() {
        let m = Machine::new(32);
        let mut parent = AddressSpace::create(m.ctx()).unwrap();
        parent
            .map(m.ctx(), BASE, PAGE_SIZE, Permissions::READ_EXECUTE, Backing::Zeroed)
            .unwrap();
        let child = parent.fork(m.ctx()).unwrap();
        let t = child.translate(m.ctx(), BASE).unwrap();
        assert!(!t.entry.copy_on_write());
        assert!(!t.entry.writable());
        child.destroy(m.ctx());
        assert_eq!(m.frames.lock().ref_count(parent.frame_of(m.ctx(), BASE).unwrap()), 1);
    }

    #[test]
    fn failed_fork_restores_parent() {
        // Parent: root + 3 tables + 1 data frame. Child needs root + 3 tables.
        let m = Machine::new(7);
        let mut parent = AddressSpace::create(m.ctx()).unwrap();
        parent
            .map(m.ctx(), BASE, PAGE_SIZE, Permissions::READ_WRITE, Backing::Zeroed)
            .unwrap();
        let free = m.free();
        assert_eq!(parent.fork(m.ctx()).unwrap_err(), VmError::OutOfMemory);
        assert_eq!(m.free(), free);
        let t = parent.translate(m.ctx(), BASE).unwrap();
        assert!(t.entry.writable());
        assert!(!t.entry.copy_on_write());
        assert_eq!(m.frames.lock().ref_count(t.entry.frame()), 1);
    }

    #[test]
    fn validate_range_spans_adjacent_regions() {
        let m = Machine::new(32);
        let mut space = AddressSpace::create(m.ctx()).unwrap();
        let rw = Permissions::READ_WRITE;
        space.map(m.ctx(), BASE, PAGE_SIZE, rw, Backing::Lazy).unwrap();
        space
            .map(m.ctx(), BASE + PAGE_SIZE, PAGE_SIZE, Permissions::READ, Backing::Lazy)
            .unwrap();
        assert!(space.validate_range(BASE + 100, PAGE_SIZE, Access::Read));
        assert!(!space.validate_range(BASE + 100, PAGE_SIZE, Access::Write));
        assert!(!space.validate_range(BASE, 3 * PAGE_SIZE, Access::Read));
        assert!(space.validate_range(BASE, 0, Access::Write));
    }
}
