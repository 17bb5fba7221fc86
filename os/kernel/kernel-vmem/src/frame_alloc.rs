//! # Physical frame allocator
//!
//! Hands out 4 KiB frames from the usable regions of the boot memory map and
//! keeps a reference count per frame. A frame shared between address spaces
//! (after a copy-on-write `fork`) returns to the pool only when its last
//! reference is released.
//!
//! The allocator itself is not synchronized; the kernel keeps it behind a
//! [`FramePool`].

use crate::addresses::{Frame, PhysicalAddress};
use crate::info::PAGE_SIZE;
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::TicketMutex;

/// The frame allocator as shared by all address spaces.
pub type FramePool = TicketMutex<FrameAllocator>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("frame {0:?} is not allocated")]
    DoubleFree(Frame),
    #[error("frame {0:?} is not managed by this allocator")]
    NotManaged(Frame),
}

/// Classification of a boot memory map entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// One entry of the boot memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    /// Length in 4 KiB frames.
    pub frames: u64,
    pub kind: RegionKind,
}

struct Span {
    first: u64,
    refs: Vec<u32>,
}

impl Span {
    fn contains(&self, number: u64) -> bool {
        number >= self.first && number - self.first < self.refs.len() as u64
    }
}

pub struct FrameAllocator {
    spans: Vec<Span>,
    free: Vec<Frame>,
    total: usize,
}

impl FrameAllocator {
    /// Builds the allocator from a memory map. Only [`RegionKind::Usable`]
    /// regions are managed; partial frames at region edges are skipped.
    #[must_use]
    pub fn new(regions: &[MemoryRegion]) -> Self {
        let mut spans = Vec::new();
        let mut free = Vec::new();

        for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
            let first = region.start.as_u64().div_ceil(PAGE_SIZE);
            let end = (region.start.as_u64() + region.frames * PAGE_SIZE) / PAGE_SIZE;
            if end <= first {
                continue;
            }

            let count = usize::try_from(end - first).unwrap_or(0);
            spans.push(Span {
                first,
                refs: vec![0; count],
            });
            free.extend((first..end).rev().map(Frame::from_number));
        }

        spans.sort_by_key(|s| s.first);
        let total = free.len();
        log::debug!("frame allocator: {total} frames in {} regions", spans.len());
        Self { spans, free, total }
    }

    /// Allocates a frame with a reference count of one. The contents are
    /// undefined.
    pub fn allocate(&mut self) -> Result<Frame, FrameError> {
        let frame = self.free.pop().ok_or(FrameError::OutOfMemory)?;
        *self.refs_mut(frame)? = 1;
        Ok(frame)
    }

    /// Releases the last reference to `frame` and returns it to the pool.
    ///
    /// Fails with [`FrameError::DoubleFree`] if the frame is not allocated.
    pub fn free(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.release(frame).map(|_| ())
    }

    /// Adds a reference to an allocated frame and returns the new count.
    pub fn share(&mut self, frame: Frame) -> Result<u32, FrameError> {
        let refs = self.refs_mut(frame)?;
        if *refs == 0 {
            return Err(FrameError::DoubleFree(frame));
        }
        *refs += 1;
        Ok(*refs)
    }

    /// Drops one reference. Returns `true` if this was the last one and the
    /// frame went back to the pool.
    pub fn release(&mut self, frame: Frame) -> Result<bool, FrameError> {
        let refs = self.refs_mut(frame)?;
        match *refs {
            0 => Err(FrameError::DoubleFree(frame)),
            1 => {
                *refs = 0;
                self.free.push(frame);
                Ok(true)
            }
            _ => {
                *refs -= 1;
                Ok(false)
            }
        }
    }

    /// Current reference count; `0` for free or unmanaged frames.
    #[must_use]
    pub fn ref_count(&self, frame: Frame) -> u32 {
        self.span(frame)
            .map_or(0, |s| s.refs[(frame.number() - s.first) as usize])
    }

    #[must_use]
    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.ref_count(frame) > 0
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.total - self.free.len()
    }

    fn span(&self, frame: Frame) -> Option<&Span> {
        self.spans.iter().find(|s| s.contains(frame.number()))
    }

    fn refs_mut(&mut self, frame: Frame) -> Result<&mut u32, FrameError> {
        let span = self
            .spans
            .iter_mut()
            .find(|s| s.contains(frame.number()))
            .ok_or(FrameError::NotManaged(frame))?;
        Ok(&mut span.refs[(frame.number() - span.first) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: u64) -> FrameAllocator {
        FrameAllocator::new(&[MemoryRegion {
            start: PhysicalAddress::new(0x10_0000),
            frames,
            kind: RegionKind::Usable,
        }])
    }

    #[test]
    fn allocates_until_exhausted() {
        let mut a = pool(3);
        let f1 = a.allocate().unwrap();
        let f2 = a.allocate().unwrap();
        let f3 = a.allocate().unwrap();
        assert_ne!(f1, f2);
        assert_ne!(f2, f3);
        assert_eq!(a.allocate(), Err(FrameError::OutOfMemory));
        a.free(f2).unwrap();
        assert_eq!(a.allocate(), Ok(f2));
    }

    #[test]
    fn lowest_frame_first() {
        let mut a = pool(2);
        assert_eq!(a.allocate().unwrap().base().as_u64(), 0x10_0000);
    }

    #[test]
    fn double_free_is_reported() {
        let mut a = pool(1);
        let f = a.allocate().unwrap();
        a.free(f).unwrap();
        assert_eq!(a.free(f), Err(FrameError::DoubleFree(f)));
    }

    #[test]
    fn unmanaged_frames_are_rejected() {
        let mut a = pool(1);
        let outside = Frame::from_number(1);
        assert_eq!(a.free(outside), Err(FrameError::NotManaged(outside)));
        assert_eq!(a.ref_count(outside), 0);
    }

    #[test]
    fn shared_frames_return_on_last_release() {
        let mut a = pool(1);
        let f = a.allocate().unwrap();
        assert_eq!(a.share(f), Ok(2));
        assert_eq!(a.release(f), Ok(false));
        assert_eq!(a.free_frames(), 0);
        assert_eq!(a.release(f), Ok(true));
        assert_eq!(a.free_frames(), 1);
    }

    #[test]
    fn reserved_regions_are_skipped() {
        let a = FrameAllocator::new(&[
            MemoryRegion {
                start: PhysicalAddress::new(0),
                frames: 256,
                kind: RegionKind::Reserved,
            },
            MemoryRegion {
                start: PhysicalAddress::new(0x10_0800),
                frames: 4,
                kind: RegionKind::Usable,
            },
        ]);
        // The unaligned usable region loses its partial first and last frame.
        assert_eq!(a.total_frames(), 3);
        assert!(!a.is_allocated(Frame::from_number(0)));
    }
}
