#![cfg_attr(not(test), no_std)]

pub mod align;
pub mod config;
pub mod cpu;
pub mod klog;
pub mod rng;
pub mod spinlock;

#[doc(hidden)]
pub use paste;

pub use align::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use align::{checked_align_up_u64, pages_for_u64};
pub use config::{KernelConfig, SchedPolicyKind, config_from_cmdline};
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
pub use rng::Lfsr64;
pub use spinlock::{IrqMutex, IrqMutexGuard};
