//! # Four-level page table walks
//!
//! Tables are plain frames read and written through [`PhysicalMemory`].
//! Levels are numbered `4` (PML4) down to `1` (PT); a leaf is always a PT
//! entry.

use crate::addresses::{Frame, VirtualPage};
use crate::frame_alloc::{FrameError, FramePool};
use crate::info::ENTRIES_PER_TABLE;
use crate::page_entry_bits::PageEntryBits;
use crate::phys::PhysicalMemory;
use alloc::vec::Vec;

/// Location of a single page table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EntrySlot {
    pub table: Frame,
    pub index: usize,
}

impl EntrySlot {
    pub fn read(self, mem: &dyn PhysicalMemory) -> PageEntryBits {
        mem.read_entry(self.table, self.index)
    }

    pub fn write(self, mem: &dyn PhysicalMemory, entry: PageEntryBits) {
        mem.write_entry(self.table, self.index, entry);
    }
}

/// A table created by [`PageTableWalker::ensure_leaf`], linked from `parent`.
#[derive(Debug, Copy, Clone)]
pub struct CreatedTable {
    pub parent: EntrySlot,
    pub frame: Frame,
}

pub struct PageTableWalker<'a> {
    mem: &'a dyn PhysicalMemory,
    root: Frame,
}

impl<'a> PageTableWalker<'a> {
    pub const fn new(mem: &'a dyn PhysicalMemory, root: Frame) -> Self {
        Self { mem, root }
    }

    /// Finds the leaf slot for `page` without creating tables.
    pub fn leaf(&self, page: VirtualPage) -> Option<EntrySlot> {
        let mut table = self.root;
        for level in (2..=4).rev() {
            let entry = self.mem.read_entry(table, page.table_index(level));
            if !entry.present() {
                return None;
            }
            table = entry.frame();
        }
        Some(EntrySlot {
            table,
            index: page.table_index(1),
        })
    }

    /// Returns the leaf entry for `page`, or `None` if any level is absent.
    pub fn entry(&self, page: VirtualPage) -> Option<PageEntryBits> {
        self.leaf(page).map(|slot| slot.read(self.mem))
    }

    /// Finds or creates the leaf slot for `page`. Every newly created table is
    /// zeroed and appended to `created` so a failed operation can undo it.
    pub fn ensure_leaf(
        &self,
        frames: &FramePool,
        page: VirtualPage,
        created: &mut Vec<CreatedTable>,
    ) -> Result<EntrySlot, FrameError> {
        let mut table = self.root;
        for level in (2..=4).rev() {
            let slot = EntrySlot {
                table,
                index: page.table_index(level),
            };
            let entry = slot.read(self.mem);
            table = if entry.present() {
                entry.frame()
            } else {
                let frame = frames.lock().allocate()?;
                self.mem.zero(frame);
                slot.write(self.mem, PageEntryBits::table(frame));
                created.push(CreatedTable {
                    parent: slot,
                    frame,
                });
                frame
            };
        }
        Ok(EntrySlot {
            table,
            index: page.table_index(1),
        })
    }

    /// Unlinks and frees tables recorded by [`Self::ensure_leaf`], newest first.
    pub fn discard_created(&self, frames: &FramePool, created: &[CreatedTable]) {
        for table in created.iter().rev() {
            table.parent.write(self.mem, PageEntryBits::new());
            if let Err(e) = frames.lock().free(table.frame) {
                log::error!("failed to free page table {:?}: {e}", table.frame);
            }
        }
    }

    /// Frees every intermediate table below the root (not the root itself and
    /// not the frames referenced by leaves).
    pub fn free_tables(&self, frames: &FramePool) {
        self.free_level(frames, self.root, 4);
    }

    fn free_level(&self, frames: &FramePool, table: Frame, level: u8) {
        if level == 1 {
            return;
        }
        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.mem.read_entry(table, index);
            if !entry.present() {
                continue;
            }
            let child = entry.frame();
            self.free_level(frames, child, level - 1);
            self.mem.write_entry(table, index, PageEntryBits::new());
            if let Err(e) = frames.lock().free(child) {
                log::error!("failed to free page table {child:?}: {e}");
            }
        }
    }
}
