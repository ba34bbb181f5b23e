//! Koru kernel ABI types.
//!
//! Types shared by every kernel layer and by the (external) syscall
//! dispatcher: typed addresses, process identifiers and states, the exit
//! status word, and the fixed virtual memory layout.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod addr;
pub mod fault;
pub mod layout;
pub mod task;

/// Standard 4KB page size.
pub const PAGE_SIZE: u64 = 0x1000;

pub use addr::*;
pub use fault::*;
pub use layout::*;
pub use task::*;
