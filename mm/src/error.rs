//! Error type shared by every memory management layer.

use crate::paging::page_table_defs::PageTableLevel;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No usable physical page with a zero reference count.
    OutOfPages,
    /// No gap in the address space is large enough.
    NoFreeRange { size: u64 },
    /// Page zero is never mapped.
    NullPage,
    /// A user mapping was requested in the kernel range.
    KernelAddress { address: u64 },
    NotAligned { address: u64 },
    InvalidSize { size: u64 },
    NotMapped { address: u64, level: PageTableLevel },
    InvalidPageTable,
    InvalidPhysicalAddress { address: u64 },
    NotCowPage,
    NotZeroPage,
    NoRegion { address: u64 },
    RegionOverlap { from: u64, to: u64 },
    ReservedRegion { address: u64 },
    FileReadFailed { offset: u64 },
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfPages => write!(f, "out of physical pages"),
            Self::NoFreeRange { size } => {
                write!(f, "no free virtual range of {:#x} bytes", size)
            }
            Self::NullPage => write!(f, "page zero cannot be mapped"),
            Self::KernelAddress { address } => {
                write!(f, "address {:#x} is in the kernel range", address)
            }
            Self::NotAligned { address } => {
                write!(f, "address {:#x} is not page aligned", address)
            }
            Self::InvalidSize { size } => write!(f, "invalid size {:#x}", size),
            Self::NotMapped { address, level } => {
                write!(f, "address {:#x} not mapped (stopped at {})", address, level)
            }
            Self::InvalidPageTable => write!(f, "invalid page table pointer"),
            Self::InvalidPhysicalAddress { address } => {
                write!(f, "invalid physical address {:#x}", address)
            }
            Self::NotCowPage => write!(f, "page is not copy-on-write"),
            Self::NotZeroPage => write!(f, "page is not backed by the zero page"),
            Self::NoRegion { address } => {
                write!(f, "no region contains address {:#x}", address)
            }
            Self::RegionOverlap { from, to } => {
                write!(f, "range [{:#x}, {:#x}] overlaps an existing region", from, to)
            }
            Self::ReservedRegion { address } => {
                write!(f, "region at {:#x} is permanently reserved", address)
            }
            Self::FileReadFailed { offset } => {
                write!(f, "reading backing file at offset {:#x} failed", offset)
            }
        }
    }
}

pub type MmResult<T = ()> = Result<T, MmError>;
