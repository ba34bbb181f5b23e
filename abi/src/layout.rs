//! Fixed virtual memory layout.

/// First address past the canonical lower half.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// First canonical higher-half address.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Highest virtual address; inclusive upper bound of every range list.
pub const ADDRESS_SPACE_MAX: u64 = u64::MAX;

/// Permanently reserved null page, `[0x0, 0xFFF]`.
pub const NULL_PAGE_FIRST: u64 = 0x0;
pub const NULL_PAGE_LAST: u64 = 0xFFF;

/// Index of the first PML4 slot that belongs to the kernel half.
pub const KERNEL_PML4_FIRST_SLOT: usize = 256;
