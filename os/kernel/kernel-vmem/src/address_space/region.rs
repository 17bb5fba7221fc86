use super::fault::Access;
use crate::addresses::{VirtualAddress, VirtualPage};
use crate::info::PAGE_SIZE;
use bitfield_struct::bitfield;

/// Access permissions of a region.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(5)]
    __: u8,
}

impl Permissions {
    pub const READ: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::new().with_read(true).with_write(true);
    pub const READ_EXECUTE: Self = Self::new().with_read(true).with_execute(true);

    #[must_use]
    pub const fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.read(),
            Access::Write => self.write(),
            Access::Execute => self.execute(),
        }
    }
}

/// How the pages of a new region are populated.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Backing<'d> {
    /// Every page is backed by a zeroed frame immediately.
    Zeroed,
    /// Pages are backed by a zeroed frame on first touch.
    Lazy,
    /// Pages are filled from the bytes, the tail of the region is zeroed.
    Image(&'d [u8]),
}

/// A contiguous page-aligned range of an address space with uniform
/// permissions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    start: VirtualAddress,
    len: u64,
    permissions: Permissions,
    lazy: bool,
}

impl Region {
    pub(crate) const fn new(
        start: VirtualAddress,
        len: u64,
        permissions: Permissions,
        lazy: bool,
    ) -> Self {
        Self {
            start,
            len,
            permissions,
            lazy,
        }
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.len)
    }

    #[must_use]
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.lazy
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end().as_u64()
    }

    #[must_use]
    pub const fn overlaps(&self, start: VirtualAddress, len: u64) -> bool {
        start.as_u64() < self.end().as_u64() && self.start.as_u64() < start.as_u64() + len
    }

    /// Number of 4 KiB pages.
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.len / PAGE_SIZE
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + use<> {
        let first = self.start.page().number();
        (first..first + self.page_count()).map(VirtualPage::from_number)
    }
}
