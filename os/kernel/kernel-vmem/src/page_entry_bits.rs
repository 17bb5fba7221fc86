use crate::addresses::Frame;
use bitfield_struct::bitfield;

/// A single 64-bit page table entry.
///
/// Intermediate and leaf entries share the layout. Only 4 KiB leaves are
/// produced, so `large_page` is always clear.
///
/// ### Bit layout
///
/// | Bits      | Name              | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P`               | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty |
/// | 7         | `PS`              | Large page flag (always 0 here) |
/// | 8         | `G`               | Global |
/// | 9         | `COW`             | Software: shared copy-on-write page |
/// | 10–11     | OS avail low      | Unused |
/// | 12–51     | frame             | Physical frame number |
/// | 52–58     | OS avail high     | Unused |
/// | 59–62     | `PKU`             | Protection key (unused) |
/// | 63        | `NX`              | Execute disable |
///
/// A copy-on-write leaf is always mapped read-only: the write fault it causes
/// is what lets the kernel break the sharing.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the MMU on any access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the MMU on the first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// Copy-on-write marker (bit 9, OS-available).
    ///
    /// Set on both sides of a `fork` for pages of writable regions. The frame
    /// is shared and its reference count accounts for every such mapping.
    pub copy_on_write: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical frame number (bits 12..=51).
    #[bits(40)]
    frame_number: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Frame {
        Frame::from_number(self.frame_number())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: Frame) {
        self.set_frame_number(frame.number());
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: Frame) -> Self {
        self.with_frame_number(frame.number())
    }

    /// Entry for an intermediate table. Permissions are left to the leaf.
    #[inline]
    #[must_use]
    pub const fn table(frame: Frame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame(frame)
    }

    /// Leaf entry for a user page.
    #[inline]
    #[must_use]
    pub const fn user_leaf(frame: Frame, writable: bool, executable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_user_access(true)
            .with_no_execute(!executable)
            .with_frame(frame)
    }

    /// This entry demoted to a read-only copy-on-write mapping.
    #[inline]
    #[must_use]
    pub const fn as_copy_on_write(self) -> Self {
        self.with_writable(false).with_copy_on_write(true)
    }

    /// Returns the raw entry value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_bits() {
        let e = PageEntryBits::user_leaf(Frame::from_number(0xABCDE), true, false);
        assert_eq!(e.raw() & 0b111, 0b111);
        assert_eq!((e.raw() >> 12) & 0xFF_FFFF_FFFF, 0xABCDE);
        assert_eq!(e.raw() >> 63, 1);
        assert_eq!(e.frame(), Frame::from_number(0xABCDE));
    }

    #[test]
    fn cow_marker_is_bit_nine() {
        let e = PageEntryBits::user_leaf(Frame::from_number(1), true, true).as_copy_on_write();
        assert!(!e.writable());
        assert!(e.copy_on_write());
        assert_eq!(e.raw() & (1 << 9), 1 << 9);
        assert_eq!(e.raw() & (1 << 1), 0);
    }

    #[test]
    fn table_entry_is_permissive() {
        let e = PageEntryBits::table(Frame::from_number(7));
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.no_execute());
        assert!(!e.copy_on_write());
    }
}
