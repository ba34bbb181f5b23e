//! Privileged CPU primitives.
//!
//! Interrupt masking, TLB maintenance and CR3 loads only exist on the
//! bare-metal target. Host builds get inert stand-ins so the memory and
//! process core can run under `cargo test`.

use core::arch::asm;

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;

#[inline(always)]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

#[cfg(target_os = "none")]
mod imp {
    use super::RFLAGS_IF;
    use x86_64::instructions::{interrupts, tlb};
    use x86_64::registers::control::Cr3;
    use x86_64::registers::rflags;
    use x86_64::structures::paging::PhysFrame;

    #[inline(always)]
    pub fn enable_interrupts() {
        interrupts::enable();
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        interrupts::disable();
    }

    /// Save RFLAGS and mask interrupts.
    #[inline(always)]
    pub fn save_flags_cli() -> u64 {
        let flags = rflags::read_raw();
        interrupts::disable();
        flags
    }

    /// Re-enable interrupts only if they were enabled in `flags`.
    #[inline(always)]
    pub fn restore_flags(flags: u64) {
        if flags & RFLAGS_IF != 0 {
            interrupts::enable();
        }
    }

    #[inline(always)]
    pub fn halt() {
        x86_64::instructions::hlt();
    }

    #[inline(always)]
    pub fn invlpg(vaddr: u64) {
        tlb::flush(x86_64::VirtAddr::new_truncate(vaddr));
    }

    #[inline(always)]
    pub fn read_cr3() -> u64 {
        let (frame, _) = Cr3::read_raw();
        frame.start_address().as_u64()
    }

    /// # Safety
    /// `pml4` must be a valid top-level table that maps the running kernel.
    #[inline(always)]
    pub unsafe fn load_cr3(pml4: u64) {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(pml4));
        unsafe { Cr3::write_raw(frame, 0) };
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    #[inline(always)]
    pub fn enable_interrupts() {}

    #[inline(always)]
    pub fn disable_interrupts() {}

    #[inline(always)]
    pub fn save_flags_cli() -> u64 {
        0
    }

    #[inline(always)]
    pub fn restore_flags(_flags: u64) {}

    #[inline(always)]
    pub fn halt() {
        core::hint::spin_loop();
    }

    #[inline(always)]
    pub fn invlpg(_vaddr: u64) {}

    #[inline(always)]
    pub fn read_cr3() -> u64 {
        0
    }

    /// # Safety
    /// No-op on hosted builds.
    #[inline(always)]
    pub unsafe fn load_cr3(_pml4: u64) {}
}

pub use imp::*;
