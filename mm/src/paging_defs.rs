//! Page table entry flags and page size constants.

use bitflags::bitflags;

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// Bits 9-11 are ignored by the MMU and carry kernel bookkeeping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;

        /// Read-only share; a write fault duplicates the frame.
        const COW           = 1 << 9;
        /// Entry points at the shared zero page.
        const ZERO_PAGE     = 1 << 10;
        /// Frame is reference counted by the physical page manager and the
        /// entry owns one reference.
        const FROM_PMM      = 1 << 11;

        /// Flags for intermediate tables that may lead to user pages.
        const TABLE_USER = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
        const TABLE_KERNEL = Self::PRESENT.bits() | Self::WRITABLE.bits();
    }
}

impl PageFlags {
    /// Bits 12-51 of an entry hold the 4KB-aligned physical address.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    #[inline]
    pub const fn extract_address(pte: u64) -> u64 {
        pte & Self::ADDRESS_MASK
    }
}

pub const PAGE_SIZE_4KB: u64 = 0x1000;
pub const PAGE_SIZE_4KB_USIZE: usize = PAGE_SIZE_4KB as usize;
pub const PAGE_SIZE_2MB: u64 = 0x20_0000;
pub const PAGE_SIZE_1GB: u64 = 0x4000_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_are_ignored_by_hardware() {
        let soft = PageFlags::COW | PageFlags::ZERO_PAGE | PageFlags::FROM_PMM;
        assert_eq!(soft.bits(), 0xE00);
        assert_eq!(soft.bits() & PageFlags::ADDRESS_MASK, 0);
    }

    #[test]
    fn address_extraction() {
        let pte = 0x0000_1234_5678_9A03u64;
        assert_eq!(PageFlags::extract_address(pte), 0x0000_1234_5678_9000);
    }
}
