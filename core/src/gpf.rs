//! General-protection fault recovery.
//!
//! Kernel code that probes hardware which may not exist (model-specific
//! registers, optional instructions) pushes a trusted resume address before
//! the probe and pops it afterwards. A #GP raised in kernel mode while a
//! frame is pushed resumes at that address instead of bringing the kernel
//! down. Each frame absorbs at most one fault.

use koru_abi::fault::VECTOR_GENERAL_PROTECTION;
use koru_abi::layout::KERNEL_SPACE_START;
use koru_abi::task::ExitStatus;
use koru_lib::{IrqMutex, klog_error, klog_warn};

use crate::scheduler::ProcessManager;

pub const GPF_RECOVERY_DEPTH: usize = 32;

#[derive(Clone, Copy)]
struct RecoveryFrame {
    rip: u64,
    used: bool,
}

struct RecoveryStack {
    frames: [RecoveryFrame; GPF_RECOVERY_DEPTH],
    len: usize,
}

pub struct GpfRecovery {
    stack: IrqMutex<RecoveryStack>,
}

#[inline]
fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_SPACE_START
}

impl GpfRecovery {
    pub const fn new() -> Self {
        Self {
            stack: IrqMutex::new(RecoveryStack {
                frames: [RecoveryFrame { rip: 0, used: false }; GPF_RECOVERY_DEPTH],
                len: 0,
            }),
        }
    }

    pub fn push(&self, rip: u64) {
        if !is_kernel_address(rip) {
            panic!("GPF recovery address {:#x} is not a kernel address", rip);
        }
        let mut stack = self.stack.lock();
        if stack.len == GPF_RECOVERY_DEPTH {
            panic!("GPF recovery stack overflow at {:#x}", rip);
        }
        let at = stack.len;
        stack.frames[at] = RecoveryFrame { rip, used: false };
        stack.len += 1;
    }

    /// Remove the frame pushed with the same `rip`. Pops must pair with
    /// pushes in strict LIFO order.
    pub fn pop(&self, rip: u64) {
        let mut stack = self.stack.lock();
        if stack.len == 0 {
            panic!("cannot remove GPF recovery frame from empty set");
        }
        let top = stack.frames[stack.len - 1];
        if top.rip != rip {
            panic!(
                "mismatched GPF recovery push/pop: top is {:#x}, popped {:#x}",
                top.rip, rip
            );
        }
        stack.len -= 1;
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().len
    }

    /// Resume address for a kernel-mode #GP, if a frame is armed.
    pub fn recover(&self) -> Option<u64> {
        let mut stack = self.stack.lock();
        let at = stack.len.checked_sub(1)?;
        let frame = &mut stack.frames[at];
        if !is_kernel_address(frame.rip) {
            return None;
        }
        if frame.used {
            panic!("GPF recovery frame {:#x} faulted twice", frame.rip);
        }
        frame.used = true;
        Some(frame.rip)
    }
}

impl Default for GpfRecovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames used by the trap handler.
pub static GPF_RECOVERY: GpfRecovery = GpfRecovery::new();

pub fn push_gpf_recovery(rip: u64) {
    GPF_RECOVERY.push(rip);
}

pub fn pop_gpf_recovery(rip: u64) {
    GPF_RECOVERY.pop(rip);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpfOutcome {
    /// Continue kernel execution at this address.
    Resume(u64),
    /// The current process was terminated.
    Killed(ExitStatus),
}

/// Handle #GP. Kernel faults either resume at the armed recovery frame or
/// panic; user faults end the current process.
pub fn handle_general_protection(
    pm: &ProcessManager,
    recovery: &GpfRecovery,
    error_code: u64,
    rip: u64,
    user: bool,
) -> GpfOutcome {
    if !user {
        if let Some(resume) = recovery.recover() {
            klog_warn!("gpf: fault at {:#x} recovered, resuming at {:#x}", rip, resume);
            return GpfOutcome::Resume(resume);
        }
        klog_error!("gpf: kernel fault at {:#x}, error code {:#x}", rip, error_code);
        panic!("general protection fault in kernel mode at {:#x}", rip);
    }

    let pid = pm.current();
    klog_warn!(
        "gpf: killing process {} at {:#x}, error code {:#x}",
        pid,
        rip,
        error_code
    );
    let status = ExitStatus::exception(VECTOR_GENERAL_PROTECTION);
    if let Err(err) = pm.exit(pid, status) {
        panic!("gpf: cannot terminate process {}: {}", pid, err);
    }
    GpfOutcome::Killed(status)
}
