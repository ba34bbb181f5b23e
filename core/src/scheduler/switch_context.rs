//! Saved register state of a process that is not running.
//!
//! Only callee-saved registers, the stack pointer, RFLAGS and the resume
//! address are kept; everything else is spilled by the compiler around the
//! call into the switch routine.

use alloc::boxed::Box;
use alloc::vec;
use core::mem::offset_of;

pub const KERNEL_STACK_SIZE: usize = 0x4000;

/// RFLAGS with only IF and the reserved bit 1 set.
const RFLAGS_DEFAULT: u64 = 0x202;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: RFLAGS_DEFAULT,
            rip: 0,
        }
    }

    /// First switch into this context "returns" into `trampoline`, which
    /// calls `entry_point(arg)` on the fresh stack.
    pub const fn new_for_task(entry_point: u64, arg: u64, stack_top: u64, trampoline: u64) -> Self {
        Self {
            rbx: 0,
            r12: entry_point,
            r13: arg,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: stack_top - 8,
            rflags: RFLAGS_DEFAULT,
            rip: trampoline,
        }
    }
}

const _: () = {
    assert!(core::mem::size_of::<SwitchContext>() == 72);
    assert!(offset_of!(SwitchContext, rbx) == 0);
    assert!(offset_of!(SwitchContext, r12) == 8);
    assert!(offset_of!(SwitchContext, r13) == 16);
    assert!(offset_of!(SwitchContext, r14) == 24);
    assert!(offset_of!(SwitchContext, r15) == 32);
    assert!(offset_of!(SwitchContext, rbp) == 40);
    assert!(offset_of!(SwitchContext, rsp) == 48);
    assert!(offset_of!(SwitchContext, rflags) == 56);
    assert!(offset_of!(SwitchContext, rip) == 64);
};

/// Heap-allocated kernel stack owned by one process.
pub struct KernelStack {
    memory: Box<[u8]>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            memory: vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        }
    }

    /// 16-byte aligned top of the stack.
    pub fn top(&self) -> u64 {
        let end = self.memory.as_ptr() as u64 + self.memory.len() as u64;
        end & !0xF
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_context_points_at_trampoline() {
        let stack = KernelStack::new();
        let ctx = SwitchContext::new_for_task(0x1000, 7, stack.top(), 0x2000);
        assert_eq!(ctx.r12, 0x1000);
        assert_eq!(ctx.r13, 7);
        assert_eq!(ctx.rip, 0x2000);
        assert_eq!(ctx.rsp, stack.top() - 8);
        assert_eq!(stack.top() % 16, 0);
    }
}
