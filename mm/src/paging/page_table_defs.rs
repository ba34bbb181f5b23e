use crate::paging_defs::PageFlags;
use koru_abi::addr::{PhysAddr, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    Four = 4,
    Three = 3,
    Two = 2,
    One = 1,
}

impl PageTableLevel {
    #[inline]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::Four => Some(Self::Three),
            Self::Three => Some(Self::Two),
            Self::Two => Some(Self::One),
            Self::One => None,
        }
    }

    #[inline]
    pub const fn supports_huge_pages(self) -> bool {
        matches!(self, Self::Three | Self::Two)
    }

    #[inline]
    pub const fn index_of(self, vaddr: VirtAddr) -> usize {
        let shift = 12 + ((self as u8 - 1) * 9);
        ((vaddr.as_u64() >> shift) & 0x1FF) as usize
    }

    /// Bytes of address space covered by one entry at this level.
    #[inline]
    pub const fn entry_size(self) -> u64 {
        1u64 << (12 + ((self as u8 - 1) * 9))
    }
}

impl core::fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Four => write!(f, "PML4"),
            Self::Three => write!(f, "PDPT"),
            Self::Two => write!(f, "PD"),
            Self::One => write!(f, "PT"),
        }
    }
}

/// One 64-bit paging structure entry.
///
/// ```text
///  63  | 62..52 | 51..12        | 11       | 10        | 9   | 8..0
///  NX  | avail  | frame address | FROM_PMM | ZERO_PAGE | COW | G PS D A PCD PWT U/S R/W P
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    #[inline]
    pub const fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        Self((addr.as_u64() & PageFlags::ADDRESS_MASK) | flags.bits())
    }

    #[inline]
    const fn has(&self, flag: PageFlags) -> bool {
        self.0 & flag.bits() != 0
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.has(PageFlags::PRESENT)
    }

    #[inline]
    pub const fn is_huge(&self) -> bool {
        self.has(PageFlags::HUGE)
    }

    #[inline]
    pub const fn is_user(&self) -> bool {
        self.has(PageFlags::USER)
    }

    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.has(PageFlags::WRITABLE)
    }

    #[inline]
    pub const fn is_cow(&self) -> bool {
        self.has(PageFlags::COW)
    }

    #[inline]
    pub const fn is_zero_page(&self) -> bool {
        self.has(PageFlags::ZERO_PAGE)
    }

    #[inline]
    pub const fn is_from_pmm(&self) -> bool {
        self.has(PageFlags::FROM_PMM)
    }

    #[inline]
    pub const fn is_no_execute(&self) -> bool {
        self.has(PageFlags::NO_EXECUTE)
    }

    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn address(&self) -> PhysAddr {
        PhysAddr(self.0 & PageFlags::ADDRESS_MASK)
    }

    #[inline]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageFlags) {
        *self = Self::new(addr, flags);
    }

    #[inline]
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & PageFlags::ADDRESS_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub const fn points_to_table(&self) -> bool {
        self.is_present() && !self.is_huge()
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:#x})", self.0)
    }
}

pub const PAGE_TABLE_ENTRIES: usize = 512;

/// A 512-entry paging structure, one frame in size.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_indices() {
        let va = VirtAddr::new(0x0000_7F12_3456_7000);
        assert_eq!(PageTableLevel::Four.index_of(va), 0xFE);
        assert_eq!(PageTableLevel::Three.index_of(va), 0x48);
        assert_eq!(PageTableLevel::Two.index_of(va), 0x1A2);
        assert_eq!(PageTableLevel::One.index_of(va), 0x167);
        assert_eq!(PageTableLevel::Two.entry_size(), 0x20_0000);
    }

    #[test]
    fn software_bits_roundtrip() {
        let e = PageTableEntry::new(
            PhysAddr::new(0x5000),
            PageFlags::PRESENT | PageFlags::COW | PageFlags::FROM_PMM,
        );
        assert!(e.is_present() && e.is_cow() && e.is_from_pmm());
        assert!(!e.is_writable() && !e.is_zero_page());
        assert_eq!(e.address(), PhysAddr::new(0x5000));
    }
}
