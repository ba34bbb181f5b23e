use super::page_table_defs::{PageTable, PageTableEntry, PageTableLevel};
use crate::error::{MmError, MmResult};
use crate::paging_defs::PageFlags;
use crate::phys_mem::PhysMemory;
use koru_abi::addr::{PhysAddr, VirtAddr};

/// Leaf entry plus the permissions accumulated on the way down.
#[derive(Debug, Clone, Copy)]
pub struct WalkResult {
    pub entry: PageTableEntry,
    pub user: bool,
    pub writable: bool,
}

/// Four-level page table walker over any [`PhysMemory`] backend.
pub struct PageTableWalker<'m> {
    mem: &'m dyn PhysMemory,
}

impl<'m> PageTableWalker<'m> {
    #[inline]
    pub fn new(mem: &'m dyn PhysMemory) -> Self {
        Self { mem }
    }

    #[inline]
    pub fn table<'a>(&self, phys: PhysAddr) -> MmResult<&'a mut PageTable> {
        let ptr = self.mem.table_ptr(phys).ok_or(MmError::InvalidPageTable)?;
        Ok(unsafe { &mut *ptr })
    }

    fn next_table<'a>(
        &self,
        entry: &PageTableEntry,
        level: PageTableLevel,
        vaddr: VirtAddr,
    ) -> MmResult<&'a mut PageTable> {
        if !entry.is_present() {
            return Err(MmError::NotMapped {
                address: vaddr.as_u64(),
                level,
            });
        }
        if entry.is_huge() && level.supports_huge_pages() {
            return Err(MmError::InvalidPageTable);
        }
        self.table(entry.address())
    }

    /// Leaf entry for `vaddr`, without creating missing tables.
    pub fn leaf<'a>(&self, pml4: PhysAddr, vaddr: VirtAddr) -> MmResult<&'a mut PageTableEntry> {
        let mut table = self.table(pml4)?;
        let mut level = PageTableLevel::Four;
        while let Some(lower) = level.next_lower() {
            let entry = table[level.index_of(vaddr)];
            table = self.next_table(&entry, level, vaddr)?;
            level = lower;
        }
        Ok(&mut table[PageTableLevel::One.index_of(vaddr)])
    }

    /// Leaf entry for `vaddr`, allocating intermediate tables with
    /// `alloc_table` as needed. New tables must come back zeroed.
    pub fn leaf_or_create<'a>(
        &self,
        pml4: PhysAddr,
        vaddr: VirtAddr,
        alloc_table: &mut dyn FnMut() -> MmResult<PhysAddr>,
    ) -> MmResult<&'a mut PageTableEntry> {
        let table_flags = if vaddr.is_user_space() {
            PageFlags::TABLE_USER | PageFlags::FROM_PMM
        } else {
            PageFlags::TABLE_KERNEL | PageFlags::FROM_PMM
        };
        let mut table = self.table(pml4)?;
        let mut level = PageTableLevel::Four;
        while let Some(lower) = level.next_lower() {
            let entry = &mut table[level.index_of(vaddr)];
            if !entry.is_present() {
                let phys = alloc_table()?;
                entry.set(phys, table_flags);
            }
            let entry = *entry;
            table = self.next_table(&entry, level, vaddr)?;
            level = lower;
        }
        Ok(&mut table[PageTableLevel::One.index_of(vaddr)])
    }

    /// Walk as the MMU would, intersecting permissions at every level.
    pub fn walk(&self, pml4: PhysAddr, vaddr: VirtAddr) -> MmResult<WalkResult> {
        let mut table = self.table(pml4)?;
        let mut level = PageTableLevel::Four;
        let mut user = true;
        let mut writable = true;
        loop {
            let entry = table[level.index_of(vaddr)];
            if !entry.is_present() {
                return Err(MmError::NotMapped {
                    address: vaddr.as_u64(),
                    level,
                });
            }
            user &= entry.is_user();
            writable &= entry.is_writable();
            match level.next_lower() {
                Some(lower) => {
                    table = self.next_table(&entry, level, vaddr)?;
                    level = lower;
                }
                None => {
                    return Ok(WalkResult {
                        entry,
                        user,
                        writable,
                    });
                }
            }
        }
    }

    /// Visit every populated leaf below `table_phys` (a table at `level`
    /// covering addresses from `base`), restricted to top-level slots in
    /// `slots` when `level` is the PML4. Non-present leaves that still carry
    /// software bits are visited too.
    pub fn for_each_leaf(
        &self,
        table_phys: PhysAddr,
        level: PageTableLevel,
        base: u64,
        slots: core::ops::Range<usize>,
        visit: &mut dyn FnMut(VirtAddr, &mut PageTableEntry) -> MmResult<()>,
    ) -> MmResult<()> {
        let table = self.table(table_phys)?;
        for index in slots {
            let entry = &mut table[index];
            let populated = match level {
                PageTableLevel::One => !entry.is_unused(),
                _ => entry.is_present(),
            };
            if !populated {
                continue;
            }
            let va = canonical(base + index as u64 * level.entry_size());
            match level.next_lower() {
                Some(lower) if entry.points_to_table() => {
                    let child = entry.address();
                    self.for_each_leaf(child, lower, va, 0..512, visit)?;
                }
                Some(_) => {}
                None => visit(VirtAddr::new(va), entry)?,
            }
        }
        Ok(())
    }

    /// Visit every intermediate table frame below `table_phys` bottom-up,
    /// restricted to `slots` at the top level.
    pub fn for_each_table(
        &self,
        table_phys: PhysAddr,
        level: PageTableLevel,
        slots: core::ops::Range<usize>,
        visit: &mut dyn FnMut(&mut PageTableEntry),
    ) -> MmResult<()> {
        let Some(lower) = level.next_lower() else {
            return Ok(());
        };
        let table = self.table(table_phys)?;
        for index in slots {
            let entry = &mut table[index];
            if !entry.points_to_table() {
                continue;
            }
            self.for_each_table(entry.address(), lower, 0..512, visit)?;
            visit(entry);
        }
        Ok(())
    }
}

/// Sign-extend bit 47 so higher-half addresses come out canonical.
#[inline]
fn canonical(va: u64) -> u64 {
    if va & (1 << 47) != 0 {
        va | 0xFFFF_0000_0000_0000
    } else {
        va
    }
}
