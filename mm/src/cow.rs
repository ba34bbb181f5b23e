//! Copy-on-write fault resolution.

use koru_abi::addr::{PhysAddr, VirtAddr};
use koru_abi::fault::PageFaultCode;
use koru_lib::klog_debug;

use crate::error::{MmError, MmResult};
use crate::paging::{AddressSpace, VirtualPageManager};

/// A write to a present page whose entry carries the COW mark.
pub fn is_cow_fault(
    vmm: &VirtualPageManager,
    space: AddressSpace,
    fault_addr: VirtAddr,
    code: PageFaultCode,
) -> bool {
    if !code.write() || !code.present() {
        return false;
    }
    vmm.mapped(space, fault_addr).is_some_and(|opts| opts.cow)
}

/// Give the faulting space a writable page.
///
/// A frame nobody else references any more is simply made writable again;
/// a shared one is copied and the copy mapped writable.
pub fn handle_cow_fault(
    vmm: &VirtualPageManager,
    space: AddressSpace,
    fault_addr: VirtAddr,
) -> MmResult<PhysAddr> {
    let aligned = fault_addr.page_base();
    let opts = vmm.mapped(space, aligned).ok_or(MmError::NotMapped {
        address: aligned.as_u64(),
        level: crate::paging::PageTableLevel::One,
    })?;
    if !opts.cow {
        return Err(MmError::NotCowPage);
    }
    let old_phys = vmm.mapping(space, aligned).ok_or(MmError::NotCowPage)?;

    if opts.from_pmm && vmm.pmm().refcount(old_phys) <= 1 {
        vmm.claim_cow_page(space, aligned)?;
        klog_debug!("cow: {:#x} no longer shared, reusing frame", aligned.as_u64());
        return Ok(old_phys);
    }

    vmm.clone_page(space, aligned, opts.rw(true).cow(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::PhysicalPageManager;
    use crate::paging::{Access, MapOptions};
    use crate::phys_mem::SimulatedRam;
    use alloc::sync::Arc;
    use koru_abi::fault::{PF_PRESENT, PF_USER, PF_WRITE};

    const VA: VirtAddr = VirtAddr::new(0x60_0000);
    const WRITE_FAULT: PageFaultCode = PageFaultCode(PF_PRESENT | PF_WRITE | PF_USER);

    fn vmm() -> VirtualPageManager {
        let ram = SimulatedRam::new(PhysAddr::new(0x10_0000), 48);
        let pmm = PhysicalPageManager::new(ram.limit());
        pmm.add_pages(ram.base(), 48);
        VirtualPageManager::with_empty_kernel_space(Arc::new(pmm), Arc::new(ram)).unwrap()
    }

    #[test]
    fn shared_page_write_costs_one_frame() {
        let vmm = vmm();
        let parent = vmm.create_address_space().unwrap();
        vmm.newmap(parent, VA, MapOptions::user_rw()).unwrap();
        vmm.write_bytes(parent, VA, b"parent", true).unwrap();
        let child = vmm.clone_address_space(parent).unwrap();

        let fault = vmm.translate(child, VA, Access::USER_WRITE).unwrap_err();
        assert_eq!(fault, WRITE_FAULT);
        assert!(is_cow_fault(&vmm, child, VA.offset(3), fault));

        let free = vmm.pmm().free_pages();
        handle_cow_fault(&vmm, child, VA.offset(3)).unwrap();
        assert_eq!(vmm.pmm().free_pages(), free - 1);

        vmm.write_bytes(child, VA, b"child!", true).unwrap();
        let mut seen = [0u8; 6];
        vmm.read_bytes(parent, VA, &mut seen, true).unwrap();
        assert_eq!(&seen, b"parent");
        vmm.read_bytes(child, VA, &mut seen, true).unwrap();
        assert_eq!(&seen, b"child!");
    }

    #[test]
    fn last_sharer_reuses_frame() {
        let vmm = vmm();
        let parent = vmm.create_address_space().unwrap();
        let phys = vmm.newmap(parent, VA, MapOptions::user_rw()).unwrap();
        let child = vmm.clone_address_space(parent).unwrap();
        handle_cow_fault(&vmm, child, VA).unwrap();

        // The child took a copy, so the parent is now the only holder.
        assert_eq!(vmm.pmm().refcount(phys), 1);
        let free = vmm.pmm().free_pages();
        assert_eq!(handle_cow_fault(&vmm, parent, VA), Ok(phys));
        assert_eq!(vmm.pmm().free_pages(), free);
        assert!(vmm.translate(parent, VA, Access::USER_WRITE).is_ok());
    }

    #[test]
    fn read_fault_is_not_cow() {
        let vmm = vmm();
        let space = vmm.create_address_space().unwrap();
        vmm.newmap(space, VA, MapOptions::user_rw()).unwrap();
        vmm.mark_cow(space, VA).unwrap();
        assert!(!is_cow_fault(
            &vmm,
            space,
            VA,
            PageFaultCode(PF_PRESENT | PF_USER)
        ));
        assert_eq!(
            handle_cow_fault(&vmm, space, VA.offset(0x1000)),
            Err(MmError::NotMapped {
                address: 0x60_1000,
                level: crate::paging::PageTableLevel::One
            })
        );
    }
}
