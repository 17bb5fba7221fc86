//! # Memory layout constants

/// Size of a base page and of a physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Lowest user-mappable address. The first 4 MiB stay unmapped so that null
/// and near-null dereferences always fault.
pub const USER_BASE: u64 = 0x0000_0000_0040_0000;

/// One past the highest user-mappable address (end of the lower canonical half).
pub const USER_END: u64 = 0x0000_8000_0000_0000;

/// Default top of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_0000;

/// Returns `true` if `[start, start + len)` lies entirely in user space.
#[must_use]
pub const fn is_user_range(start: u64, len: u64) -> bool {
    match start.checked_add(len) {
        Some(end) => start >= USER_BASE && end <= USER_END,
        None => false,
    }
}
