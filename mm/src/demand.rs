//! Demand paging for zero-page backed regions.
//!
//! Pages of anonymous and file-backed regions start out pointing at the
//! shared zero page. The first write to an anonymous page, or the first
//! touch of a file page, swaps in a private frame. Resolution happens in
//! two steps so the caller can drop the region lock before a potentially
//! slow file read: [`plan_zero_fill`] inspects the region table,
//! [`complete_zero_fill`] only touches the page tables.

use alloc::vec;

use koru_abi::addr::VirtAddr;
use koru_abi::fault::PageFaultCode;
use koru_lib::{klog_debug, klog_warn};

use crate::error::{MmError, MmResult};
use crate::memory_manager::{FileMapping, MemoryManager, RegionKind};
use crate::paging::{AddressSpace, MapOptions, VirtualPageManager};
use crate::paging_defs::PAGE_SIZE_4KB;

#[derive(Clone, Debug)]
pub enum FillSource {
    Zeroes,
    File { mapping: FileMapping, offset: u64 },
}

/// What to install at a faulting zero-page address.
#[derive(Clone, Debug)]
pub struct ZeroFillPlan {
    pub page: VirtAddr,
    pub options: MapOptions,
    pub source: FillSource,
}

/// Whether the region's permissions allow the faulting access at all.
pub fn can_satisfy_fault(code: PageFaultCode, options: &MapOptions) -> bool {
    if code.user() && !options.user {
        return false;
    }
    if code.write() && !options.rw {
        return false;
    }
    !code.instruction_fetch()
}

/// Resolve `fault_addr` against the region table of `mm`.
///
/// Fails with `NotZeroPage` if the address is not currently backed by the
/// zero page and with `NoRegion` if no user region covers it.
pub fn plan_zero_fill(
    mm: &MemoryManager,
    fault_addr: VirtAddr,
    code: PageFaultCode,
) -> MmResult<ZeroFillPlan> {
    let page = fault_addr.page_base();
    if !mm.vmm().is_zero_page_mapping(mm.space(), page) {
        return Err(MmError::NotZeroPage);
    }
    let region = mm.is_within_region(page).ok_or(MmError::NoRegion {
        address: fault_addr.as_u64(),
    })?;
    if !can_satisfy_fault(code, &region.options) {
        klog_warn!(
            "demand: access {:#x} to {:#x} not allowed by region [{:#x} - {:#x}]",
            code.0,
            fault_addr.as_u64(),
            region.from,
            region.to
        );
        return Err(MmError::NoRegion {
            address: fault_addr.as_u64(),
        });
    }
    let source = match &region.kind {
        RegionKind::File(mapping) => FillSource::File {
            mapping: mapping.clone(),
            offset: page.as_u64() - region.from,
        },
        _ => FillSource::Zeroes,
    };
    Ok(ZeroFillPlan {
        page,
        options: region.options,
        source,
    })
}

/// Allocate and populate a frame for `plan` and map it in place of the zero
/// page. Returns `false` when the page stopped being a zero-page mapping in
/// the meantime; the new frame is released in that case.
pub fn complete_zero_fill(
    vmm: &VirtualPageManager,
    space: AddressSpace,
    plan: &ZeroFillPlan,
) -> MmResult<bool> {
    let frame = vmm.pmm().alloc_frame()?;
    if !vmm.memory().zero_frame(frame.phys()) {
        return Err(MmError::InvalidPhysicalAddress {
            address: frame.phys().as_u64(),
        });
    }

    if let FillSource::File { mapping, offset } = &plan.source {
        let len = mapping.size().saturating_sub(*offset).min(PAGE_SIZE_4KB) as usize;
        if len > 0 {
            let mut buf = vec![0u8; len];
            let read = mapping
                .file()
                .read_at(*offset, &mut buf)
                .ok_or(MmError::FileReadFailed { offset: *offset })?;
            if !vmm.memory().write(frame.phys(), &buf[..read.min(len)]) {
                return Err(MmError::InvalidPhysicalAddress {
                    address: frame.phys().as_u64(),
                });
            }
        }
    }

    let installed = vmm.replace_zero_page(space, plan.page, frame, plan.options)?;
    if installed {
        klog_debug!("demand: committed page {:#x}", plan.page.as_u64());
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::FileBacking;
    use crate::page_alloc::PhysicalPageManager;
    use crate::paging::Access;
    use crate::phys_mem::SimulatedRam;
    use alloc::sync::Arc;
    use koru_abi::addr::PhysAddr;
    use koru_abi::fault::{PF_PRESENT, PF_USER, PF_WRITE};

    const USER_WRITE: PageFaultCode = PageFaultCode(PF_PRESENT | PF_WRITE | PF_USER);
    const USER_READ: PageFaultCode = PageFaultCode(PF_PRESENT | PF_USER);

    fn manager() -> MemoryManager {
        let ram = SimulatedRam::new(PhysAddr::new(0x10_0000), 48);
        let pmm = PhysicalPageManager::new(ram.limit());
        pmm.add_pages(ram.base(), 48);
        let vmm = Arc::new(
            VirtualPageManager::with_empty_kernel_space(Arc::new(pmm), Arc::new(ram)).unwrap(),
        );
        let space = vmm.create_address_space().unwrap();
        MemoryManager::new(vmm, space)
    }

    /// Run the write the way the fault handler would: try, fault, resolve,
    /// retry.
    fn user_write(mm: &MemoryManager, va: VirtAddr, data: &[u8]) {
        if mm.vmm().write_bytes(mm.space(), va, data, true).is_err() {
            let plan = plan_zero_fill(mm, va, USER_WRITE).unwrap();
            assert!(complete_zero_fill(mm.vmm(), mm.space(), &plan).unwrap());
            mm.vmm().write_bytes(mm.space(), va, data, true).unwrap();
        }
    }

    #[test]
    fn first_write_commits_exactly_one_page() {
        let mut mm = manager();
        let r = mm
            .find_and_zero_page_region(8192, MapOptions::user_rw())
            .unwrap();
        let pmm_free = mm.vmm().pmm().free_pages();

        let mut buf = [0xEEu8; 32];
        mm.vmm()
            .read_bytes(mm.space(), r.base().offset(0x1000), &mut buf, true)
            .unwrap();
        assert_eq!(buf, [0u8; 32]);
        assert_eq!(mm.vmm().pmm().free_pages(), pmm_free);

        user_write(&mm, r.base().offset(8), b"dirty");
        assert_eq!(mm.vmm().pmm().free_pages(), pmm_free - 1);
        assert!(!mm.vmm().is_zero_page_mapping(mm.space(), r.base()));
        assert!(mm
            .vmm()
            .is_zero_page_mapping(mm.space(), r.base().offset(0x1000)));

        // The shared zero page itself is untouched.
        let mut zero = [0xEEu8; 16];
        mm.vmm().memory().read(mm.vmm().zero_page(), &mut zero);
        assert_eq!(zero, [0u8; 16]);
    }

    #[test]
    fn address_outside_regions_is_not_planned() {
        let mm = manager();
        assert!(matches!(
            plan_zero_fill(&mm, VirtAddr::new(0x7000_0000), USER_WRITE),
            Err(MmError::NotZeroPage)
        ));
    }

    #[test]
    fn read_only_region_refuses_write() {
        let mut mm = manager();
        let r = mm
            .find_and_zero_page_region(4096, MapOptions::user_rw().rw(false))
            .unwrap();
        assert!(matches!(
            plan_zero_fill(&mm, r.base(), USER_WRITE),
            Err(MmError::NoRegion { .. })
        ));
        assert!(plan_zero_fill(&mm, r.base(), USER_READ).is_ok());
    }

    #[test]
    fn stale_plan_releases_its_frame() {
        let mut mm = manager();
        let r = mm
            .find_and_zero_page_region(4096, MapOptions::user_rw())
            .unwrap();
        let plan = plan_zero_fill(&mm, r.base(), USER_WRITE).unwrap();
        assert!(complete_zero_fill(mm.vmm(), mm.space(), &plan).unwrap());
        let free = mm.vmm().pmm().free_pages();
        assert!(!complete_zero_fill(mm.vmm(), mm.space(), &plan).unwrap());
        assert_eq!(mm.vmm().pmm().free_pages(), free);
    }

    struct Pattern;

    impl FileBacking for Pattern {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<usize> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = ((offset as usize + i) % 251) as u8;
            }
            Some(buf.len())
        }

        fn close(&self) {}
    }

    #[test]
    fn file_page_filled_on_read_touch() {
        let mut mm = manager();
        let r = mm.find_and_file_map_region(Arc::new(Pattern), 4096 + 10).unwrap();

        let second = r.base().offset(0x1000);
        let plan = plan_zero_fill(&mm, second.offset(4), USER_READ).unwrap();
        match &plan.source {
            FillSource::File { offset, .. } => assert_eq!(*offset, 0x1000),
            FillSource::Zeroes => panic!("expected a file fill"),
        }
        assert!(complete_zero_fill(mm.vmm(), mm.space(), &plan).unwrap());

        let mut buf = [0u8; 12];
        mm.vmm()
            .read_bytes(mm.space(), second, &mut buf, true)
            .unwrap();
        let expected: alloc::vec::Vec<u8> = (0..10).map(|i| ((4096 + i) % 251) as u8).collect();
        assert_eq!(&buf[..10], &expected[..]);
        assert_eq!(&buf[10..], &[0, 0]);
        assert!(mm.vmm().translate(mm.space(), second, Access::USER_WRITE).is_ok());
    }
}
