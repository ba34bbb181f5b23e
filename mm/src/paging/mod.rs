//! Four-level x86_64 paging: entry layout, table walking and the
//! virtual page manager built on top of them.

mod options;
pub mod page_table_defs;
mod vmm;
pub mod walker;

pub use options::{Access, MapOptions};
pub use page_table_defs::{PageTable, PageTableEntry, PageTableLevel};
pub use vmm::{AddressSpace, MmuFault, VirtualPageManager};
pub use walker::{PageTableWalker, WalkResult};
