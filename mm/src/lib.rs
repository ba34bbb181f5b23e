#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cow;
pub mod demand;
pub mod error;
pub mod interval_list;
pub mod memory_manager;
pub mod page_alloc;
pub mod paging;
pub mod paging_defs;
pub mod phys_mem;

pub use error::{MmError, MmResult};
pub use interval_list::{Interval, IntervalList};
pub use memory_manager::{FileBacking, FileMapping, MemStats, MemoryManager, MemoryRegion, RegionKind};
pub use page_alloc::{OwnedFrame, PhysicalPageManager};
pub use paging::{Access, AddressSpace, MapOptions, MmuFault, VirtualPageManager};
pub use phys_mem::{HhdmMemory, PhysMemory, SimulatedRam};
