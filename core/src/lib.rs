//! Process lifecycle, scheduling and fault handling for the Koru kernel.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fault;
pub mod gpf;
pub mod platform;
pub mod scheduler;

#[cfg(test)]
mod testing;

use spin::Once;

use koru_lib::klog_warn;

pub use error::{ProcessError, ProcessResult};
pub use fault::{FaultOutcome, handle_page_fault};
pub use gpf::{GpfOutcome, GpfRecovery, handle_general_protection};
pub use platform::{Clock, ManualClock, TickClock};
pub use scheduler::{
    BOOT_PID, ContextSwitch, HandleKind, KernelEntry, KernelHandle, Priority, ProcessInfo,
    ProcessManager, ProgramLoader, SpaceSource, SpawnInfo, Terminal,
};

static KERNEL: Once<ProcessManager> = Once::new();

/// Make `pm` the process manager the kernel tasks and trap handlers use.
pub fn install(pm: ProcessManager) -> &'static ProcessManager {
    if KERNEL.is_completed() {
        klog_warn!("proc: process manager already installed, keeping the first one");
    }
    KERNEL.call_once(move || pm)
}

/// The installed process manager.
pub fn kernel() -> &'static ProcessManager {
    match KERNEL.get() {
        Some(pm) => pm,
        None => panic!("proc: process manager used before install"),
    }
}
