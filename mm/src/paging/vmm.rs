//! Virtual page manager.
//!
//! Installs and removes 4KB mappings in explicit address spaces, owns the
//! shared zero page, and implements the copy-on-write primitives. Every
//! entry tagged `FROM_PMM` owns one reference on its frame; all releases go
//! through the physical page manager so reference counts stay exact.

use alloc::sync::Arc;

use koru_abi::addr::{PhysAddr, VirtAddr};
use koru_abi::fault::{PF_PRESENT, PageFaultCode};
use koru_abi::layout::KERNEL_PML4_FIRST_SLOT;
use koru_lib::{IrqMutex, cpu, klog_debug, klog_info, klog_warn};

use super::options::{Access, MapOptions};
use super::page_table_defs::{PAGE_TABLE_ENTRIES, PageTableEntry, PageTableLevel};
use super::walker::PageTableWalker;
use crate::error::{MmError, MmResult};
use crate::page_alloc::{OwnedFrame, PhysicalPageManager};
use crate::paging_defs::{PAGE_SIZE_4KB, PageFlags};
use crate::phys_mem::PhysMemory;

/// Handle on a page-table hierarchy: the physical address of its PML4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressSpace(PhysAddr);

impl AddressSpace {
    #[inline]
    pub const fn from_root(root: PhysAddr) -> Self {
        Self(root)
    }

    #[inline]
    pub const fn root(self) -> PhysAddr {
        self.0
    }
}

/// Fault a simulated access would have raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmuFault {
    pub address: VirtAddr,
    pub code: PageFaultCode,
}

pub struct VirtualPageManager {
    pmm: Arc<PhysicalPageManager>,
    mem: Arc<dyn PhysMemory>,
    zero_page: PhysAddr,
    kernel_space: AddressSpace,
    lock: IrqMutex<()>,
}

impl VirtualPageManager {
    /// Adopt an existing kernel hierarchy (the one the bootloader built) as
    /// the template for the kernel half of every new address space.
    pub fn new(
        pmm: Arc<PhysicalPageManager>,
        mem: Arc<dyn PhysMemory>,
        kernel_space: AddressSpace,
    ) -> MmResult<Self> {
        let zero = pmm.alloc_frame()?;
        if !mem.zero_frame(zero.phys()) {
            return Err(MmError::InvalidPhysicalAddress {
                address: zero.phys().as_u64(),
            });
        }
        // The zero page is pinned for the lifetime of the kernel.
        let zero_page = zero.into_raw();
        klog_info!(
            "vmm: zero page at {:#x}, kernel root {:#x}",
            zero_page.as_u64(),
            kernel_space.root().as_u64()
        );
        Ok(Self {
            pmm,
            mem,
            zero_page,
            kernel_space,
            lock: IrqMutex::new(()),
        })
    }

    /// Start from an empty kernel hierarchy.
    pub fn with_empty_kernel_space(
        pmm: Arc<PhysicalPageManager>,
        mem: Arc<dyn PhysMemory>,
    ) -> MmResult<Self> {
        let root = pmm.alloc_frame()?;
        if !mem.zero_frame(root.phys()) {
            return Err(MmError::InvalidPhysicalAddress {
                address: root.phys().as_u64(),
            });
        }
        let kernel_space = AddressSpace::from_root(root.into_raw());
        Self::new(pmm, mem, kernel_space)
    }

    #[inline]
    pub fn pmm(&self) -> &PhysicalPageManager {
        &self.pmm
    }

    #[inline]
    pub fn memory(&self) -> &dyn PhysMemory {
        &*self.mem
    }

    #[inline]
    pub fn zero_page(&self) -> PhysAddr {
        self.zero_page
    }

    #[inline]
    pub fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    /// Defaults for a kernel read-write mapping.
    #[inline]
    pub fn new_options(&self) -> MapOptions {
        MapOptions::default()
    }

    #[inline]
    fn walker(&self) -> PageTableWalker<'_> {
        PageTableWalker::new(&*self.mem)
    }

    fn alloc_table(&self) -> MmResult<PhysAddr> {
        let frame = self.pmm.alloc_frame()?;
        if !self.mem.zero_frame(frame.phys()) {
            return Err(MmError::InvalidPhysicalAddress {
                address: frame.phys().as_u64(),
            });
        }
        Ok(frame.into_raw())
    }

    fn check_target(virt: VirtAddr, opts: &MapOptions) -> MmResult<()> {
        if !virt.is_page_aligned() {
            return Err(MmError::NotAligned {
                address: virt.as_u64(),
            });
        }
        if virt.is_null_page() {
            return Err(MmError::NullPage);
        }
        if opts.user && virt.is_kernel_range() {
            return Err(MmError::KernelAddress {
                address: virt.as_u64(),
            });
        }
        Ok(())
    }

    fn leaf_for_map<'a>(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
    ) -> MmResult<&'a mut PageTableEntry> {
        let entry = self
            .walker()
            .leaf_or_create(space.root(), virt, &mut || self.alloc_table())?;
        if entry.is_present() || entry.is_zero_page() {
            panic!(
                "vmm: {:#x} already mapped to {:#x} in space {:#x}",
                virt.as_u64(),
                entry.address().as_u64(),
                space.root().as_u64()
            );
        }
        Ok(entry)
    }

    fn map_locked(
        &self,
        space: AddressSpace,
        phys: PhysAddr,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<()> {
        Self::check_target(virt, &opts)?;
        if opts.cow && opts.rw {
            klog_warn!(
                "vmm: COW mapping of {:#x} requested writable; mapping read-only",
                virt.as_u64()
            );
        }
        if opts.clear && !self.mem.zero_frame(phys) {
            return Err(MmError::InvalidPhysicalAddress {
                address: phys.as_u64(),
            });
        }
        let entry = self.leaf_for_map(space, virt)?;
        entry.set(phys.page_base(), opts.page_flags());
        cpu::invlpg(virt.as_u64());
        Ok(())
    }

    /// Map `phys` at `virt`. With `from_pmm` the entry takes over one
    /// reference the caller already holds.
    pub fn map(
        &self,
        space: AddressSpace,
        phys: PhysAddr,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<()> {
        let _guard = self.lock.lock();
        self.map_locked(space, phys, virt, opts)
    }

    fn newmap_locked(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<PhysAddr> {
        Self::check_target(virt, &opts)?;
        let frame = self.pmm.alloc_frame()?;
        self.map_locked(space, frame.phys(), virt, opts.from_pmm(true))?;
        Ok(frame.into_raw())
    }

    /// Allocate a fresh frame and map it.
    pub fn newmap(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<PhysAddr> {
        let _guard = self.lock.lock();
        self.newmap_locked(space, virt, opts)
    }

    /// Map `count` fresh frames starting at `virt`. On failure every page
    /// mapped by this call is released again.
    pub fn maprange(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        count: u64,
        opts: MapOptions,
    ) -> MmResult<()> {
        let _guard = self.lock.lock();
        for i in 0..count {
            let page = virt.offset(i * PAGE_SIZE_4KB);
            if let Err(err) = self.newmap_locked(space, page, opts) {
                klog_info!(
                    "vmm: maprange failed at {:#x} ({}), rolling back {} pages",
                    page.as_u64(),
                    err,
                    i
                );
                for j in 0..i {
                    let _ = self.unmap_locked(space, virt.offset(j * PAGE_SIZE_4KB));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn unmap_locked(&self, space: AddressSpace, virt: VirtAddr) -> MmResult<()> {
        let entry = self.walker().leaf(space.root(), virt.page_base())?;
        if !entry.is_present() && !entry.is_zero_page() {
            return Err(MmError::NotMapped {
                address: virt.as_u64(),
                level: PageTableLevel::One,
            });
        }
        let old = *entry;
        entry.clear();
        cpu::invlpg(virt.as_u64());
        if old.is_from_pmm() {
            self.pmm.dealloc(old.address());
        }
        Ok(())
    }

    pub fn unmap(&self, space: AddressSpace, virt: VirtAddr) -> MmResult<()> {
        let _guard = self.lock.lock();
        self.unmap_locked(space, virt)
    }

    /// Unmap every mapped page in the range. Holes are skipped.
    pub fn unmaprange(&self, space: AddressSpace, virt: VirtAddr, count: u64) -> usize {
        let _guard = self.lock.lock();
        (0..count)
            .filter(|i| {
                self.unmap_locked(space, virt.offset(i * PAGE_SIZE_4KB))
                    .is_ok()
            })
            .count()
    }

    fn is_free_slot(&self, space: AddressSpace, virt: VirtAddr) -> bool {
        match self.walker().leaf(space.root(), virt) {
            Ok(entry) => !entry.is_present() && !entry.is_zero_page(),
            Err(_) => true,
        }
    }

    /// First unmapped page in `[low, high)` that `opts` may legally map.
    pub fn find_page(
        &self,
        space: AddressSpace,
        low: VirtAddr,
        high: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<VirtAddr> {
        let _guard = self.lock.lock();
        self.find_page_locked(space, low, high, opts)
    }

    fn find_page_locked(
        &self,
        space: AddressSpace,
        low: VirtAddr,
        high: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<VirtAddr> {
        let mut page = low.page_base().as_u64().max(PAGE_SIZE_4KB);
        while page < high.as_u64() {
            let va = VirtAddr::new(page);
            if opts.user && va.is_kernel_range() {
                break;
            }
            if self.is_free_slot(space, va) {
                return Ok(va);
            }
            page = match page.checked_add(PAGE_SIZE_4KB) {
                Some(next) => next,
                None => break,
            };
        }
        Err(MmError::NoFreeRange {
            size: PAGE_SIZE_4KB,
        })
    }

    /// Find a free page in `[low, high)` and back it with a fresh frame.
    pub fn map_page_within_range(
        &self,
        space: AddressSpace,
        low: VirtAddr,
        high: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<VirtAddr> {
        let _guard = self.lock.lock();
        let va = self.find_page_locked(space, low, high, opts)?;
        self.newmap_locked(space, va, opts)?;
        Ok(va)
    }

    fn map_zero_page_locked(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        opts: MapOptions,
        present: bool,
    ) -> MmResult<()> {
        Self::check_target(virt, &opts)?;
        let mut flags = PageFlags::ZERO_PAGE;
        if present {
            flags |= PageFlags::PRESENT;
        }
        if opts.user {
            flags |= PageFlags::USER;
        }
        let entry = self.leaf_for_map(space, virt)?;
        entry.set(self.zero_page, flags);
        cpu::invlpg(virt.as_u64());
        Ok(())
    }

    /// Map `virt` read-only onto the shared zero page. Consumes no frame
    /// beyond whatever page tables are missing.
    pub fn map_zero_page(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<()> {
        let _guard = self.lock.lock();
        self.map_zero_page_locked(space, virt, opts, true)
    }

    /// Map `count` pages onto the zero page. Reads are served from the
    /// shared frame; the first write faults.
    pub fn map_zero_page_range(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        count: u64,
        opts: MapOptions,
    ) -> MmResult<()> {
        self.map_zero_range(space, virt, count, opts, true)
    }

    /// Like [`map_zero_page_range`](Self::map_zero_page_range), but the
    /// entries are left non-present so the first access of any kind faults.
    /// Used for pages whose content must be produced on first touch.
    pub fn map_zero_page_range_on_touch(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        count: u64,
        opts: MapOptions,
    ) -> MmResult<()> {
        self.map_zero_range(space, virt, count, opts, false)
    }

    fn map_zero_range(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        count: u64,
        opts: MapOptions,
        present: bool,
    ) -> MmResult<()> {
        let _guard = self.lock.lock();
        for i in 0..count {
            let page = virt.offset(i * PAGE_SIZE_4KB);
            if let Err(err) = self.map_zero_page_locked(space, page, opts, present) {
                for j in 0..i {
                    let _ = self.unmap_locked(space, virt.offset(j * PAGE_SIZE_4KB));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn present_entry(&self, space: AddressSpace, virt: VirtAddr) -> Option<PageTableEntry> {
        let _guard = self.lock.lock();
        let entry = *self.walker().leaf(space.root(), virt.page_base()).ok()?;
        entry.is_present().then_some(entry)
    }

    /// Options of the mapping at `virt`, if any.
    pub fn mapped(&self, space: AddressSpace, virt: VirtAddr) -> Option<MapOptions> {
        self.present_entry(space, virt).map(MapOptions::from_entry)
    }

    /// Frame backing `virt`, if mapped.
    pub fn mapping(&self, space: AddressSpace, virt: VirtAddr) -> Option<PhysAddr> {
        self.present_entry(space, virt).map(|e| e.address())
    }

    /// Whether `virt` is backed by the zero page, present or not.
    pub fn is_zero_page_mapping(&self, space: AddressSpace, virt: VirtAddr) -> bool {
        let _guard = self.lock.lock();
        self.walker()
            .leaf(space.root(), virt.page_base())
            .is_ok_and(|e| e.is_zero_page() && e.address() == self.zero_page)
    }

    fn present_leaf_locked<'a>(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
    ) -> MmResult<&'a mut PageTableEntry> {
        let entry = self.walker().leaf(space.root(), virt.page_base())?;
        if !entry.is_present() {
            return Err(MmError::NotMapped {
                address: virt.as_u64(),
                level: PageTableLevel::One,
            });
        }
        Ok(entry)
    }

    /// Give `virt` a private copy of its current frame, mapped writable.
    /// The old frame loses one reference.
    pub fn clone_page(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        opts: MapOptions,
    ) -> MmResult<PhysAddr> {
        let _guard = self.lock.lock();
        let entry = self.present_leaf_locked(space, virt)?;
        let old = *entry;
        let frame = self.pmm.alloc_frame()?;
        if !self.mem.copy_frame(old.address(), frame.phys()) {
            return Err(MmError::InvalidPhysicalAddress {
                address: old.address().as_u64(),
            });
        }
        let new_phys = frame.into_raw();
        let flags = opts.rw(true).cow(false).from_pmm(true).page_flags();
        entry.set(new_phys, flags);
        cpu::invlpg(virt.page_base().as_u64());
        if old.is_from_pmm() {
            self.pmm.dealloc(old.address());
        }
        klog_debug!(
            "vmm: cloned {:#x}: {:#x} -> {:#x}",
            virt.as_u64(),
            old.address().as_u64(),
            new_phys.as_u64()
        );
        Ok(new_phys)
    }

    /// Make `virt` read-only and copy-on-write.
    pub fn mark_cow(&self, space: AddressSpace, virt: VirtAddr) -> MmResult<()> {
        let _guard = self.lock.lock();
        let entry = self.present_leaf_locked(space, virt)?;
        entry.set_flags((entry.flags() - PageFlags::WRITABLE) | PageFlags::COW);
        cpu::invlpg(virt.page_base().as_u64());
        Ok(())
    }

    /// Turn a COW page whose frame is no longer shared back into a plain
    /// writable page.
    pub fn claim_cow_page(&self, space: AddressSpace, virt: VirtAddr) -> MmResult<()> {
        let _guard = self.lock.lock();
        let entry = self.present_leaf_locked(space, virt)?;
        if !entry.is_cow() {
            return Err(MmError::NotCowPage);
        }
        entry.set_flags((entry.flags() - PageFlags::COW) | PageFlags::WRITABLE);
        cpu::invlpg(virt.page_base().as_u64());
        Ok(())
    }

    /// Change writability. COW and zero-page entries stay read-only; their
    /// write faults decide when they become writable.
    pub fn protect(&self, space: AddressSpace, virt: VirtAddr, rw: bool) -> MmResult<()> {
        let _guard = self.lock.lock();
        let entry = self.present_leaf_locked(space, virt)?;
        let flags = entry.flags();
        if rw {
            if entry.is_cow() || entry.is_zero_page() {
                return Ok(());
            }
            entry.set_flags(flags | PageFlags::WRITABLE);
        } else {
            entry.set_flags(flags - PageFlags::WRITABLE);
        }
        cpu::invlpg(virt.page_base().as_u64());
        Ok(())
    }

    /// Swap a zero-page entry for `frame`. Returns `false`, releasing the
    /// frame, when `virt` no longer points at the zero page.
    pub fn replace_zero_page(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        frame: OwnedFrame<'_>,
        opts: MapOptions,
    ) -> MmResult<bool> {
        let _guard = self.lock.lock();
        let entry = self.walker().leaf(space.root(), virt.page_base())?;
        if !entry.is_zero_page() || entry.address() != self.zero_page {
            return Ok(false);
        }
        let flags = opts.cow(false).from_pmm(true).page_flags();
        entry.set(frame.into_raw(), flags);
        cpu::invlpg(virt.page_base().as_u64());
        Ok(true)
    }

    fn create_space_locked(&self) -> MmResult<AddressSpace> {
        let root = self.alloc_table()?;
        let walker = self.walker();
        let template = walker.table(self.kernel_space.root())?;
        let table = walker.table(root)?;
        for slot in KERNEL_PML4_FIRST_SLOT..PAGE_TABLE_ENTRIES {
            table[slot] = template[slot];
        }
        Ok(AddressSpace::from_root(root))
    }

    /// Fresh address space sharing the kernel half of the template.
    pub fn create_address_space(&self) -> MmResult<AddressSpace> {
        let _guard = self.lock.lock();
        let space = self.create_space_locked()?;
        klog_debug!("vmm: created address space {:#x}", space.root().as_u64());
        Ok(space)
    }

    /// Copy-on-write clone of the user half of `src`.
    ///
    /// Writable frames become read-only COW in both spaces and pick up one
    /// reference per space. Zero-page and foreign (non-PMM) entries are
    /// shared as they are.
    pub fn clone_address_space(&self, src: AddressSpace) -> MmResult<AddressSpace> {
        let _guard = self.lock.lock();
        let dst = self.create_space_locked()?;
        let walker = self.walker();
        let result = walker.for_each_leaf(
            src.root(),
            PageTableLevel::Four,
            0,
            0..KERNEL_PML4_FIRST_SLOT,
            &mut |va, entry| {
                let slot = walker.leaf_or_create(dst.root(), va, &mut || self.alloc_table())?;
                if entry.is_from_pmm() {
                    if entry.is_writable() {
                        entry.set_flags((entry.flags() - PageFlags::WRITABLE) | PageFlags::COW);
                        cpu::invlpg(va.as_u64());
                    }
                    self.pmm.alloc_at(entry.address());
                }
                *slot = *entry;
                Ok(())
            },
        );
        if let Err(err) = result {
            klog_warn!("vmm: address space clone failed: {}", err);
            self.destroy_space_locked(dst);
            return Err(err);
        }
        klog_debug!(
            "vmm: cloned address space {:#x} -> {:#x}",
            src.root().as_u64(),
            dst.root().as_u64()
        );
        Ok(dst)
    }

    fn destroy_space_locked(&self, space: AddressSpace) {
        let walker = self.walker();
        let leaves = walker.for_each_leaf(
            space.root(),
            PageTableLevel::Four,
            0,
            0..KERNEL_PML4_FIRST_SLOT,
            &mut |_, entry| {
                if entry.is_from_pmm() {
                    self.pmm.dealloc(entry.address());
                }
                entry.clear();
                Ok(())
            },
        );
        let tables = walker.for_each_table(
            space.root(),
            PageTableLevel::Four,
            0..KERNEL_PML4_FIRST_SLOT,
            &mut |entry| {
                if entry.is_from_pmm() {
                    self.pmm.dealloc(entry.address());
                }
                entry.clear();
            },
        );
        if leaves.is_err() || tables.is_err() {
            klog_warn!(
                "vmm: corrupt tables while destroying space {:#x}",
                space.root().as_u64()
            );
        }
        self.pmm.dealloc(space.root());
    }

    /// Release every user frame and page table of `space`, then its root.
    pub fn destroy_address_space(&self, space: AddressSpace) {
        if space == self.kernel_space {
            panic!("vmm: attempt to destroy the kernel address space");
        }
        let _guard = self.lock.lock();
        self.destroy_space_locked(space);
        klog_debug!("vmm: destroyed address space {:#x}", space.root().as_u64());
    }

    /// Load `space` into CR3.
    pub fn activate(&self, space: AddressSpace) {
        unsafe { cpu::load_cr3(space.root().as_u64()) };
    }

    /// Drop any cached translation of `virt`.
    #[inline]
    pub fn flush(&self, virt: VirtAddr) {
        cpu::invlpg(virt.page_base().as_u64());
    }

    /// Check `access` against the tables the way the MMU does and return
    /// the physical address, or the error code of the fault it would raise.
    pub fn translate(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        access: Access,
    ) -> Result<PhysAddr, PageFaultCode> {
        let _guard = self.lock.lock();
        let walk = self
            .walker()
            .walk(space.root(), virt.page_base())
            .map_err(|_| PageFaultCode(access.fault_bits()))?;
        let denied = (access.user && !walk.user)
            || (access.write && !walk.writable)
            || (access.execute && walk.entry.is_no_execute());
        if denied {
            return Err(PageFaultCode(access.fault_bits() | PF_PRESENT));
        }
        Ok(walk.entry.address().offset(virt.page_offset()))
    }

    /// Copy `buf.len()` bytes out of `space` starting at `virt`.
    pub fn read_bytes(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        buf: &mut [u8],
        user: bool,
    ) -> Result<(), MmuFault> {
        let access = Access::new(false, user);
        let mut done = 0usize;
        while done < buf.len() {
            let va = virt.offset(done as u64);
            let chunk = chunk_len(va, buf.len() - done);
            let phys = self
                .translate(space, va, access)
                .map_err(|code| MmuFault { address: va, code })?;
            if !self.mem.read(phys, &mut buf[done..done + chunk]) {
                return Err(MmuFault {
                    address: va,
                    code: PageFaultCode(access.fault_bits()),
                });
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into `space` starting at `virt`.
    pub fn write_bytes(
        &self,
        space: AddressSpace,
        virt: VirtAddr,
        data: &[u8],
        user: bool,
    ) -> Result<(), MmuFault> {
        let access = Access::new(true, user);
        let mut done = 0usize;
        while done < data.len() {
            let va = virt.offset(done as u64);
            let chunk = chunk_len(va, data.len() - done);
            let phys = self
                .translate(space, va, access)
                .map_err(|code| MmuFault { address: va, code })?;
            if !self.mem.write(phys, &data[done..done + chunk]) {
                return Err(MmuFault {
                    address: va,
                    code: PageFaultCode(access.fault_bits()),
                });
            }
            done += chunk;
        }
        Ok(())
    }
}

#[inline]
fn chunk_len(va: VirtAddr, remaining: usize) -> usize {
    ((PAGE_SIZE_4KB - va.page_offset()) as usize).min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mem::SimulatedRam;
    use koru_abi::fault::{PF_USER, PF_WRITE};

    const RAM_BASE: u64 = 0x10_0000;

    fn setup(frames: usize) -> VirtualPageManager {
        let ram = SimulatedRam::new(PhysAddr::new(RAM_BASE), frames);
        let pmm = PhysicalPageManager::new(ram.limit());
        pmm.add_pages(ram.base(), frames);
        VirtualPageManager::with_empty_kernel_space(Arc::new(pmm), Arc::new(ram)).unwrap()
    }

    const VA: VirtAddr = VirtAddr::new(0x40_0000);

    #[test]
    fn newmap_and_unmap_balance_frames() {
        let vmm = setup(32);
        let space = vmm.create_address_space().unwrap();
        let free = vmm.pmm().free_pages();
        let phys = vmm.newmap(space, VA, MapOptions::user_rw().clear(true)).unwrap();
        assert_eq!(vmm.mapping(space, VA), Some(phys));
        let opts = vmm.mapped(space, VA).unwrap();
        assert!(opts.rw && opts.user && opts.from_pmm);
        vmm.unmap(space, VA).unwrap();
        assert_eq!(vmm.mapping(space, VA), None);
        // Page tables created for the mapping are still held.
        assert!(vmm.pmm().free_pages() < free);
        vmm.destroy_address_space(space);
        assert_eq!(vmm.pmm().free_pages(), free + 1);
    }

    #[test]
    fn page_zero_is_refused() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        assert_eq!(
            vmm.newmap(space, VirtAddr::new(0), MapOptions::user_rw()),
            Err(MmError::NullPage)
        );
    }

    #[test]
    fn user_mapping_in_kernel_range_is_refused() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        let kva = VirtAddr::new(0xFFFF_8000_0010_0000);
        assert_eq!(
            vmm.newmap(space, kva, MapOptions::user_rw()),
            Err(MmError::KernelAddress {
                address: kva.as_u64()
            })
        );
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_panics() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        let _ = vmm.newmap(space, VA, MapOptions::user_rw());
    }

    #[test]
    fn maprange_rolls_back_on_exhaustion() {
        let vmm = setup(12);
        let space = vmm.create_address_space().unwrap();
        // Warm the page tables so only leaf frames are in play.
        vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        vmm.unmap(space, VA).unwrap();
        let free = vmm.pmm().free_pages();
        let err = vmm.maprange(space, VA, free as u64 + 1, MapOptions::user_rw());
        assert_eq!(err, Err(MmError::OutOfPages));
        assert_eq!(vmm.pmm().free_pages(), free);
        assert_eq!(vmm.mapping(space, VA), None);
    }

    #[test]
    fn zero_page_mappings_read_zero_and_fault_on_write() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        vmm.map_zero_page_range(space, VA, 2, MapOptions::user_rw()).unwrap();
        let free = vmm.pmm().free_pages();
        let mut buf = [0xAAu8; 16];
        vmm.read_bytes(space, VA.offset(0xFF8), &mut buf, true).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(vmm.pmm().free_pages(), free);
        assert!(vmm.is_zero_page_mapping(space, VA));
        let fault = vmm.write_bytes(space, VA, b"x", true).unwrap_err();
        assert_eq!(fault.code, PageFaultCode(PF_PRESENT | PF_WRITE | PF_USER));
    }

    #[test]
    fn unmapped_access_reports_not_present() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        assert_eq!(
            vmm.translate(space, VA, Access::USER_WRITE),
            Err(PageFaultCode(PF_WRITE | PF_USER))
        );
    }

    #[test]
    fn kernel_only_page_denies_user() {
        let vmm = setup(16);
        let space = vmm.create_address_space().unwrap();
        vmm.newmap(space, VA, MapOptions::default()).unwrap();
        assert!(vmm.translate(space, VA, Access::KERNEL_WRITE).is_ok());
        assert_eq!(
            vmm.translate(space, VA, Access::USER_READ),
            Err(PageFaultCode(PF_PRESENT | PF_USER))
        );
    }

    #[test]
    fn clone_page_copies_and_releases_old_frame() {
        let vmm = setup(32);
        let space = vmm.create_address_space().unwrap();
        let old = vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        vmm.write_bytes(space, VA, b"hello", true).unwrap();
        vmm.pmm().alloc_at(old);
        vmm.mark_cow(space, VA).unwrap();
        assert!(vmm.write_bytes(space, VA, b"J", true).is_err());

        let new = vmm.clone_page(space, VA, MapOptions::user_rw()).unwrap();
        assert_ne!(new, old);
        assert_eq!(vmm.pmm().refcount(old), 1);
        vmm.write_bytes(space, VA, b"J", true).unwrap();
        let mut buf = [0u8; 5];
        vmm.read_bytes(space, VA, &mut buf, true).unwrap();
        assert_eq!(&buf, b"Jello");
        vmm.memory().read(old, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn protect_keeps_cow_read_only() {
        let vmm = setup(32);
        let space = vmm.create_address_space().unwrap();
        vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        vmm.protect(space, VA, false).unwrap();
        assert!(!vmm.mapped(space, VA).unwrap().rw);
        vmm.protect(space, VA, true).unwrap();
        assert!(vmm.mapped(space, VA).unwrap().rw);
        vmm.mark_cow(space, VA).unwrap();
        vmm.protect(space, VA, true).unwrap();
        let opts = vmm.mapped(space, VA).unwrap();
        assert!(opts.cow && !opts.rw);
    }

    #[test]
    fn cloned_space_shares_frames_copy_on_write() {
        let vmm = setup(48);
        let parent = vmm.create_address_space().unwrap();
        let phys = vmm.newmap(parent, VA, MapOptions::user_rw()).unwrap();
        vmm.map_zero_page(parent, VA.offset(PAGE_SIZE_4KB), MapOptions::user_rw())
            .unwrap();
        let child = vmm.clone_address_space(parent).unwrap();

        assert_eq!(vmm.mapping(child, VA), Some(phys));
        assert_eq!(vmm.pmm().refcount(phys), 2);
        assert!(vmm.mapped(parent, VA).unwrap().cow);
        assert!(vmm.mapped(child, VA).unwrap().cow);
        assert!(vmm.is_zero_page_mapping(child, VA.offset(PAGE_SIZE_4KB)));

        vmm.destroy_address_space(child);
        assert_eq!(vmm.pmm().refcount(phys), 1);
    }

    #[test]
    fn find_page_skips_mapped_pages() {
        let vmm = setup(32);
        let space = vmm.create_address_space().unwrap();
        vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        let found = vmm
            .find_page(space, VA, VA.offset(4 * PAGE_SIZE_4KB), MapOptions::user_rw())
            .unwrap();
        assert_eq!(found, VA.offset(PAGE_SIZE_4KB));
        let mapped = vmm
            .map_page_within_range(space, VA, VA.offset(4 * PAGE_SIZE_4KB), MapOptions::user_rw())
            .unwrap();
        assert_eq!(mapped, found);
        assert_eq!(
            vmm.find_page(space, VA, VA.offset(2 * PAGE_SIZE_4KB), MapOptions::user_rw()),
            Err(MmError::NoFreeRange {
                size: PAGE_SIZE_4KB
            })
        );
    }
}
