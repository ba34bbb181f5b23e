//! Kernel access to physical frames.
//!
//! Page tables and frame contents are reached through a [`PhysMemory`]
//! implementation. On hardware that is the higher-half direct map; hosted
//! builds back every frame with heap memory so the paging code runs
//! unchanged under unit tests.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;

use koru_abi::addr::PhysAddr;

use crate::paging::page_table_defs::PageTable;
use crate::paging_defs::{PAGE_SIZE_4KB, PAGE_SIZE_4KB_USIZE};

/// Translation from physical addresses to kernel-dereferenceable pointers.
///
/// # Safety
///
/// `phys_ptr` must return either `None` or a pointer that is valid for
/// reads and writes up to the end of the frame containing `phys`, for as
/// long as the implementation is alive.
pub unsafe trait PhysMemory: Send + Sync {
    fn phys_ptr(&self, phys: PhysAddr) -> Option<*mut u8>;

    #[inline]
    fn table_ptr(&self, phys: PhysAddr) -> Option<*mut PageTable> {
        self.phys_ptr(phys.page_base()).map(|p| p.cast::<PageTable>())
    }

    fn zero_frame(&self, frame: PhysAddr) -> bool {
        match self.phys_ptr(frame.page_base()) {
            Some(p) => {
                unsafe { ptr::write_bytes(p, 0, PAGE_SIZE_4KB_USIZE) };
                true
            }
            None => false,
        }
    }

    fn copy_frame(&self, from: PhysAddr, to: PhysAddr) -> bool {
        match (
            self.phys_ptr(from.page_base()),
            self.phys_ptr(to.page_base()),
        ) {
            (Some(src), Some(dst)) => {
                unsafe { ptr::copy_nonoverlapping(src, dst, PAGE_SIZE_4KB_USIZE) };
                true
            }
            _ => false,
        }
    }

    /// Copy out of one frame. The range must not cross a page boundary.
    fn read(&self, phys: PhysAddr, buf: &mut [u8]) -> bool {
        if phys.page_offset() + buf.len() as u64 > PAGE_SIZE_4KB {
            return false;
        }
        match self.phys_ptr(phys) {
            Some(src) => {
                unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
                true
            }
            None => false,
        }
    }

    /// Copy into one frame. The range must not cross a page boundary.
    fn write(&self, phys: PhysAddr, data: &[u8]) -> bool {
        if phys.page_offset() + data.len() as u64 > PAGE_SIZE_4KB {
            return false;
        }
        match self.phys_ptr(phys) {
            Some(dst) => {
                unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
                true
            }
            None => false,
        }
    }
}

/// Higher-half direct map: every physical address is visible at a fixed
/// virtual offset.
pub struct HhdmMemory {
    offset: u64,
    limit: PhysAddr,
}

impl HhdmMemory {
    pub const fn new(offset: u64, limit: PhysAddr) -> Self {
        Self { offset, limit }
    }
}

unsafe impl PhysMemory for HhdmMemory {
    #[inline]
    fn phys_ptr(&self, phys: PhysAddr) -> Option<*mut u8> {
        if phys.is_null() || phys >= self.limit {
            return None;
        }
        Some((self.offset + phys.as_u64()) as *mut u8)
    }
}

#[repr(C, align(4096))]
struct RawFrame([u8; PAGE_SIZE_4KB_USIZE]);

/// Heap-backed physical memory covering `[base, base + frames * 4K)`.
pub struct SimulatedRam {
    base: PhysAddr,
    frames: Box<[UnsafeCell<RawFrame>]>,
}

// SAFETY: frames are only touched through raw pointers handed out by
// `phys_ptr`; callers serialize access the same way they would for real
// physical memory.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl SimulatedRam {
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        let frames: Vec<UnsafeCell<RawFrame>> = (0..frames)
            .map(|_| UnsafeCell::new(RawFrame([0; PAGE_SIZE_4KB_USIZE])))
            .collect();
        Self {
            base: base.page_base(),
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Exclusive end of the simulated range.
    pub fn limit(&self) -> PhysAddr {
        self.base
            .offset(self.frames.len() as u64 * PAGE_SIZE_4KB)
    }
}

unsafe impl PhysMemory for SimulatedRam {
    fn phys_ptr(&self, phys: PhysAddr) -> Option<*mut u8> {
        let rel = phys.as_u64().checked_sub(self.base.as_u64())?;
        let frame = self.frames.get((rel / PAGE_SIZE_4KB) as usize)?;
        let start = frame.get().cast::<u8>();
        Some(unsafe { start.add((rel % PAGE_SIZE_4KB) as usize) })
    }
}
