//! Page-fault resolution.
//!
//! A fault is first checked against the shared zero page (lazy anonymous
//! or file-backed memory), then against copy-on-write. Anything else is a
//! real access violation: fatal in kernel mode, the end of the process in
//! user mode.

use koru_abi::addr::VirtAddr;
use koru_abi::fault::{PageFaultCode, VECTOR_PAGE_FAULT};
use koru_abi::task::{ExitStatus, Pid};
use koru_lib::{klog_debug, klog_error, klog_info, klog_warn};
use koru_mm::cow::{handle_cow_fault, is_cow_fault};
use koru_mm::demand::{complete_zero_fill, plan_zero_fill};
use koru_mm::{MmError, MemoryManager};

use crate::scheduler::ProcessManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping fixed; retry the instruction.
    Resolved,
    /// The faulting process was terminated; switch away from it.
    Killed(ExitStatus),
}

/// Handle a page fault raised by the current process.
pub fn handle_page_fault(
    pm: &ProcessManager,
    fault_addr: VirtAddr,
    code: PageFaultCode,
    rip: u64,
) -> FaultOutcome {
    let pid = pm.current();
    let Some(memory) = pm.memory_of(pid) else {
        return unresolved(pm, pid, fault_addr, code, rip);
    };
    let vmm = pm.vmm();

    let (space, plan) = {
        let mm = memory.lock();
        mm.stats().record_page_fault();
        (mm.space(), plan_zero_fill(&mm, fault_addr, code))
    };
    match plan {
        Ok(plan) => {
            // The mm lock is not held while a file page is read in.
            return match complete_zero_fill(vmm, space, &plan) {
                Ok(installed) => {
                    if installed {
                        memory.lock().stats().record_commit();
                    }
                    FaultOutcome::Resolved
                }
                Err(err) => {
                    klog_warn!("fault: lazy fill of {:#x} failed: {}", fault_addr.as_u64(), err);
                    unresolved(pm, pid, fault_addr, code, rip)
                }
            };
        }
        Err(MmError::NotZeroPage) => {}
        Err(err) => {
            klog_debug!("fault: zero page at {:#x} not claimable: {}", fault_addr.as_u64(), err);
            return unresolved(pm, pid, fault_addr, code, rip);
        }
    }

    if is_cow_fault(vmm, space, fault_addr, code) {
        match handle_cow_fault(vmm, space, fault_addr) {
            Ok(_) => return FaultOutcome::Resolved,
            Err(err) => {
                klog_warn!("fault: COW copy of {:#x} failed: {}", fault_addr.as_u64(), err);
            }
        }
    }

    if pm.config().verbose_faults {
        dump_regions(&memory.lock());
    }
    unresolved(pm, pid, fault_addr, code, rip)
}

fn dump_regions(mm: &MemoryManager) {
    for region in mm.regions() {
        klog_info!(
            "fault:   region [{:#x} - {:#x}] {:?}",
            region.from,
            region.to,
            region.kind
        );
    }
}

fn unresolved(
    pm: &ProcessManager,
    pid: Pid,
    fault_addr: VirtAddr,
    code: PageFaultCode,
    rip: u64,
) -> FaultOutcome {
    let cause = code.describe();
    if !code.user() {
        klog_error!(
            "fault: {} at {:#x}, rip {:#x}, code {:#x}, process {}",
            cause,
            fault_addr.as_u64(),
            rip,
            code.0,
            pid
        );
        panic!("page fault: {} at {:#x} (rip {:#x})", cause, fault_addr.as_u64(), rip);
    }

    klog_warn!(
        "fault: killing process {}: {} at {:#x} (rip {:#x})",
        pid,
        cause,
        fault_addr.as_u64(),
        rip
    );
    let status = ExitStatus::exception(VECTOR_PAGE_FAULT);
    if let Err(err) = pm.exit(pid, status) {
        panic!("fault: cannot terminate process {}: {}", pid, err);
    }
    FaultOutcome::Killed(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SpaceSource, SpawnInfo};
    use crate::testing::{fixture, idle};
    use koru_abi::fault::{PF_PRESENT, PF_USER, PF_WRITE};
    use koru_abi::task::ProcessState;
    use koru_mm::{MapOptions, MmuFault};

    #[test]
    fn first_write_to_zero_region_commits_one_page() {
        let fx = fixture();
        let user = fx.pm.spawn(SpawnInfo::new("user", idle)).unwrap();
        let memory = fx.pm.memory_of(user).unwrap();
        let region = memory
            .lock()
            .find_and_zero_page_region(8192, MapOptions::user_rw())
            .unwrap();
        let space = memory.lock().space();
        let vmm = fx.pm.vmm().clone();
        let free = vmm.pmm().free_pages();

        let mut buf = [0xAAu8; 64];
        vmm.read_bytes(space, region.base(), &mut buf, true).unwrap();
        assert_eq!(buf, [0u8; 64]);
        assert_eq!(vmm.pmm().free_pages(), free);

        let fault: MmuFault = vmm
            .write_bytes(space, region.base(), b"hello", true)
            .unwrap_err();
        assert!(fault.code.present() && fault.code.write());
        fx.switch.push(move |pm| {
            assert_eq!(
                handle_page_fault(pm, fault.address, fault.code, 0x40_0000),
                FaultOutcome::Resolved
            );
        });
        fx.pm.run(user);

        vmm.write_bytes(space, region.base(), b"hello", true).unwrap();
        assert_eq!(vmm.pmm().free_pages(), free - 1);
        assert!(vmm.is_zero_page_mapping(space, region.base().offset(0x1000)));
        let stats = memory.lock();
        assert_eq!(stats.stats().page_faults(), 1);
        assert_eq!(stats.stats().allocated(), 4096);
    }

    #[test]
    fn cow_write_after_clone_leaves_parent_untouched() {
        let fx = fixture();
        let parent = fx.pm.spawn(SpawnInfo::new("parent", idle)).unwrap();
        let parent_mm = fx.pm.memory_of(parent).unwrap();
        let region = parent_mm
            .lock()
            .find_and_map_region(4096, MapOptions::user_rw())
            .unwrap();
        let parent_space = parent_mm.lock().space();
        let vmm = fx.pm.vmm().clone();
        vmm.write_bytes(parent_space, region.base(), b"parent", true)
            .unwrap();

        let child = fx
            .pm
            .spawn(SpawnInfo {
                space: SpaceSource::CloneOf(parent),
                ..SpawnInfo::new("child", idle)
            })
            .unwrap();
        let child_space = fx.pm.memory_of(child).unwrap().lock().space();
        let free = vmm.pmm().free_pages();

        let fault = vmm
            .write_bytes(child_space, region.base(), b"child!", true)
            .unwrap_err();
        assert_eq!(fault.code, PageFaultCode(PF_PRESENT | PF_WRITE | PF_USER));
        fx.switch.push(move |pm| {
            assert_eq!(
                handle_page_fault(pm, fault.address, fault.code, 0),
                FaultOutcome::Resolved
            );
        });
        fx.pm.run(child);

        vmm.write_bytes(child_space, region.base(), b"child!", true)
            .unwrap();
        assert_eq!(vmm.pmm().free_pages(), free - 1);
        let mut seen = [0u8; 6];
        vmm.read_bytes(parent_space, region.base(), &mut seen, true)
            .unwrap();
        assert_eq!(&seen, b"parent");
    }

    #[test]
    fn user_access_outside_regions_kills_process() {
        let fx = fixture();
        let user = fx.pm.spawn(SpawnInfo::new("user", idle)).unwrap();
        fx.switch.push(|pm| {
            let outcome = handle_page_fault(
                pm,
                VirtAddr::new(0x4000_0000),
                PageFaultCode(PF_USER | PF_WRITE),
                0x40_1000,
            );
            assert_eq!(
                outcome,
                FaultOutcome::Killed(ExitStatus::exception(VECTOR_PAGE_FAULT))
            );
        });
        fx.pm.run(user);

        assert_eq!(fx.pm.state_of(user), Some(ProcessState::Exited));
        let info = fx.pm.info(user).unwrap();
        assert_eq!(info.exit_status, ExitStatus::exception(14));
        assert_eq!(info.page_faults, 1);
    }

    #[test]
    fn write_to_read_only_zero_region_is_fatal_for_the_process() {
        let fx = fixture();
        let user = fx.pm.spawn(SpawnInfo::new("user", idle)).unwrap();
        let memory = fx.pm.memory_of(user).unwrap();
        let region = memory
            .lock()
            .find_and_zero_page_region(4096, MapOptions::user_rw().rw(false))
            .unwrap();
        fx.switch.push(move |pm| {
            let outcome = handle_page_fault(
                pm,
                region.base(),
                PageFaultCode(PF_PRESENT | PF_USER | PF_WRITE),
                0,
            );
            assert!(matches!(outcome, FaultOutcome::Killed(_)));
        });
        fx.pm.run(user);
        assert_eq!(fx.pm.state_of(user), Some(ProcessState::Exited));
    }

    #[test]
    #[should_panic(expected = "page fault: kernel write to invalid memory")]
    fn kernel_fault_without_region_panics() {
        let fx = fixture();
        handle_page_fault(
            &fx.pm,
            VirtAddr::new(0x5000_0000),
            PageFaultCode(PF_WRITE),
            0xFFFF_FFFF_8010_0000,
        );
    }
}
