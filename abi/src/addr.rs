//! Physical and virtual address newtypes.
//!
//! Both are `#[repr(transparent)]` over `u64`, so they cost nothing at runtime
//! but keep frame numbers and virtual addresses from being swapped by accident.

use crate::PAGE_SIZE;
use crate::layout::{KERNEL_SPACE_START, USER_SPACE_END};

/// A physical memory address. Never dereferenced directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// A virtual memory address in either half of the canonical address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl PhysAddr {
    pub const NULL: Self = Self(0);

    /// Highest address reachable with 52 physical address bits.
    pub const MAX: Self = Self((1 << 52) - 1);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn from_page_number(page: u64) -> Self {
        Self(page * PAGE_SIZE)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 / PAGE_SIZE
    }

    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0 + off)
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtAddr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    #[inline]
    pub const fn checked_offset(self, off: u64) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// First page of memory; never mapped so null dereferences always fault.
    #[inline]
    pub const fn is_null_page(self) -> bool {
        self.0 < PAGE_SIZE
    }

    /// Anything at or above the end of the user half, including the
    /// non-canonical hole, is off limits to user mappings.
    #[inline]
    pub const fn is_kernel_range(self) -> bool {
        self.0 >= USER_SPACE_END
    }

    /// True only for canonical higher-half addresses.
    #[inline]
    pub const fn is_kernel_space(self) -> bool {
        self.0 >= KERNEL_SPACE_START
    }

    #[inline]
    pub const fn is_user_space(self) -> bool {
        self.0 < USER_SPACE_END
    }

    #[inline]
    pub const fn is_canonical(self) -> bool {
        self.is_user_space() || self.is_kernel_space()
    }
}

impl From<u64> for PhysAddr {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u64> for VirtAddr {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl core::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}
