//! Register-level context switch.
//!
//! The naked routines use `offset_of!` so a layout change in
//! [`SwitchContext`] is caught at compile time. They only exist on the
//! bare-metal target; hosted builds drive the process manager through a
//! scripted [`ContextSwitch`](super::manager::ContextSwitch) instead.

#[cfg(target_os = "none")]
mod imp {
    use core::arch::naked_asm;
    use core::mem::offset_of;

    use koru_abi::task::Pid;
    use koru_lib::cpu;

    use super::super::manager::{ContextSwitch, ProcessManager};
    use super::super::switch_context::SwitchContext;

    /// Save callee-saved registers into `prev` and resume `next`.
    ///
    /// # Safety
    /// Both pointers must reference live contexts, interrupts must be
    /// masked, and `next` must either be a fresh task context or one saved
    /// by this routine.
    #[unsafe(naked)]
    pub unsafe extern "sysv64" fn switch_registers(
        prev: *mut SwitchContext,
        next: *const SwitchContext,
    ) {
        naked_asm!(
            "mov [rdi + {off_rbx}], rbx",
            "mov [rdi + {off_r12}], r12",
            "mov [rdi + {off_r13}], r13",
            "mov [rdi + {off_r14}], r14",
            "mov [rdi + {off_r15}], r15",
            "mov [rdi + {off_rbp}], rbp",
            "mov [rdi + {off_rsp}], rsp",
            "pushfq",
            "pop QWORD PTR [rdi + {off_rflags}]",
            "mov rax, [rsp]",
            "mov [rdi + {off_rip}], rax",

            "mov rbx, [rsi + {off_rbx}]",
            "mov r12, [rsi + {off_r12}]",
            "mov r13, [rsi + {off_r13}]",
            "mov r14, [rsi + {off_r14}]",
            "mov r15, [rsi + {off_r15}]",
            "mov rbp, [rsi + {off_rbp}]",
            "push QWORD PTR [rsi + {off_rflags}]",
            "popfq",
            "mov rsp, [rsi + {off_rsp}]",
            "ret",

            off_rbx = const offset_of!(SwitchContext, rbx),
            off_r12 = const offset_of!(SwitchContext, r12),
            off_r13 = const offset_of!(SwitchContext, r13),
            off_r14 = const offset_of!(SwitchContext, r14),
            off_r15 = const offset_of!(SwitchContext, r15),
            off_rbp = const offset_of!(SwitchContext, rbp),
            off_rsp = const offset_of!(SwitchContext, rsp),
            off_rflags = const offset_of!(SwitchContext, rflags),
            off_rip = const offset_of!(SwitchContext, rip),
        );
    }

    /// First code a new task runs. Entry point in r12, argument in r13.
    #[unsafe(naked)]
    pub extern "sysv64" fn task_entry_trampoline() {
        naked_asm!(
            "mov rdi, r13",
            "call r12",
            "call {task_exit}",
            "ud2",
            task_exit = sym super::super::kthread::task_exit,
        );
    }

    /// Switch that actually moves the CPU.
    pub struct HardwareSwitch;

    impl ContextSwitch for HardwareSwitch {
        fn switch(&self, pm: &ProcessManager, from: Pid, to: Pid) {
            let Some(frames) = pm.switch_frames(from, to) else {
                panic!("switch: no context for {} -> {}", from, to);
            };
            let flags = cpu::save_flags_cli();
            if cpu::read_cr3() != frames.space.root().as_u64() {
                pm.vmm().activate(frames.space);
            }
            // SAFETY: both contexts live in boxed table slots that the
            // deleter cannot free while either process is switching.
            unsafe { switch_registers(frames.from, frames.to) };
            cpu::restore_flags(flags);
        }
    }

    pub fn trampoline_address() -> u64 {
        task_entry_trampoline as usize as u64
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    /// Hosted builds never enter a new context.
    pub fn trampoline_address() -> u64 {
        0
    }
}

pub use imp::*;
