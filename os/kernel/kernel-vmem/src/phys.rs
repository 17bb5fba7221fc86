//! # Physical memory access
//!
//! The kernel never dereferences physical addresses directly; every read or
//! write of a frame goes through [`PhysicalMemory`]. On hardware this is a
//! direct map of RAM, in tests it is [`HostMemory`].

use crate::addresses::{Frame, PhysicalAddress, VirtualPage};
use crate::frame_alloc::{MemoryRegion, RegionKind};
use crate::info::{ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::page_entry_bits::PageEntryBits;
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::SpinLock;

const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Byte-level access to physical frames.
///
/// Offsets are relative to the start of the frame; an access must not cross
/// the frame boundary.
pub trait PhysicalMemory: Send + Sync {
    /// Copies `buf.len()` bytes starting at `offset` within `frame` into `buf`.
    fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]);

    /// Copies `data` into `frame` starting at `offset`.
    fn write(&self, frame: Frame, offset: usize, data: &[u8]);

    /// Fills the frame with zeros.
    fn zero(&self, frame: Frame);

    /// Copies the full contents of `src` into `dst`.
    fn copy_frame(&self, src: Frame, dst: Frame);

    /// Reads entry `index` of the page table stored in `table`.
    fn read_entry(&self, table: Frame, index: usize) -> PageEntryBits {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let mut raw = [0u8; 8];
        self.read(table, index * 8, &mut raw);
        PageEntryBits::from_bits(u64::from_le_bytes(raw))
    }

    /// Writes entry `index` of the page table stored in `table`.
    fn write_entry(&self, table: Frame, index: usize, entry: PageEntryBits) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        self.write(table, index * 8, &entry.into_bits().to_le_bytes());
    }
}

/// Translation lookaside buffer maintenance.
///
/// Called whenever an existing translation of `page` in the address space
/// rooted at `root` is weakened or removed.
pub trait TlbInvalidate: Send + Sync {
    fn invalidate(&self, root: Frame, page: VirtualPage);
}

/// A [`TlbInvalidate`] that does nothing, for address spaces that are never
/// activated.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoTlb;

impl TlbInvalidate for NoTlb {
    fn invalidate(&self, _root: Frame, _page: VirtualPage) {}
}

/// Heap-backed physical memory of a fixed number of frames.
///
/// Frames are numbered from `base`; touching a frame outside that range is a
/// machine check and panics.
pub struct HostMemory {
    base: Frame,
    frames: SpinLock<Vec<[u8; FRAME_BYTES]>>,
}

impl HostMemory {
    /// Creates `count` zeroed frames starting at physical address `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        Self {
            base: base.frame(),
            frames: SpinLock::new(vec![[0u8; FRAME_BYTES]; count]),
        }
    }

    /// Number of frames backing this memory.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// The single usable region covering all of this memory.
    #[must_use]
    pub fn memory_map(&self) -> Vec<MemoryRegion> {
        vec![MemoryRegion {
            start: self.base.base(),
            frames: self.frame_count() as u64,
            kind: RegionKind::Usable,
        }]
    }

    fn slot(&self, frame: Frame) -> usize {
        let index = frame
            .number()
            .checked_sub(self.base.number())
            .unwrap_or(u64::MAX);
        usize::try_from(index).unwrap_or(usize::MAX)
    }

    fn with_frame<R>(&self, frame: Frame, f: impl FnOnce(&mut [u8; FRAME_BYTES]) -> R) -> R {
        let slot = self.slot(frame);
        let mut frames = self.frames.lock();
        match frames.get_mut(slot) {
            Some(bytes) => f(bytes),
            None => panic!("machine check: access to unbacked {frame:?}"),
        }
    }
}

impl PhysicalMemory for HostMemory {
    fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        self.with_frame(frame, |bytes| {
            buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        });
    }

    fn write(&self, frame: Frame, offset: usize, data: &[u8]) {
        self.with_frame(frame, |bytes| {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        });
    }

    fn zero(&self, frame: Frame) {
        self.with_frame(frame, |bytes| bytes.fill(0));
    }

    fn copy_frame(&self, src: Frame, dst: Frame) {
        let mut tmp = [0u8; FRAME_BYTES];
        self.with_frame(src, |bytes| tmp.copy_from_slice(bytes));
        self.with_frame(dst, |bytes| bytes.copy_from_slice(&tmp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_entries() {
        let mem = HostMemory::new(PhysicalAddress::new(0x10_0000), 4);
        let table = Frame::from_number(0x101);
        let entry = PageEntryBits::user_leaf(Frame::from_number(0x102), true, false);
        mem.write_entry(table, 511, entry);
        assert_eq!(mem.read_entry(table, 511), entry);
        assert_eq!(mem.read_entry(table, 0).raw(), 0);
    }

    #[test]
    fn copy_and_zero() {
        let mem = HostMemory::new(PhysicalAddress::new(0), 2);
        let (a, b) = (Frame::from_number(0), Frame::from_number(1));
        mem.write(a, 100, b"hello");
        mem.copy_frame(a, b);
        let mut buf = [0u8; 5];
        mem.read(b, 100, &mut buf);
        assert_eq!(&buf, b"hello");
        mem.zero(b);
        mem.read(b, 100, &mut buf);
        assert_eq!(buf, [0u8; 5]);
    }

    #[test]
    #[should_panic(expected = "machine check")]
    fn out_of_range_frame_panics() {
        let mem = HostMemory::new(PhysicalAddress::new(0x1000), 1);
        mem.zero(Frame::from_number(0));
    }
}
