//! Physical page manager.
//!
//! One descriptor per physical page, indexed by page number. A page is
//! handed out when it is usable and its reference count is zero. Reference
//! counts are updated with compare-and-swap loops rather than under a lock
//! because the page-fault handler allocates and releases frames from
//! interrupt context while ordinary kernel code may be doing the same.
//!
//! Page states:
//!
//! ```text
//!   ABSENT --add_page--> USABLE --reserve--> RESERVED (permanent)
//!   ABSENT --reserve---> RESERVED
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicUsize, Ordering};

use koru_abi::addr::PhysAddr;
use koru_lib::{klog_debug, klog_info, klog_warn};

use crate::error::{MmError, MmResult};
use crate::paging_defs::PAGE_SIZE_4KB;

const PAGE_ABSENT: u8 = 0;
const PAGE_USABLE: u8 = 1;
const PAGE_RESERVED: u8 = 2;

struct PhysPage {
    refcount: AtomicU16,
    state: AtomicU8,
}

impl PhysPage {
    const fn new() -> Self {
        Self {
            refcount: AtomicU16::new(0),
            state: AtomicU8::new(PAGE_ABSENT),
        }
    }

    #[inline]
    fn is_usable(&self) -> bool {
        self.state.load(Ordering::Acquire) == PAGE_USABLE
    }
}

pub struct PhysicalPageManager {
    pages: Box<[PhysPage]>,
    last_checked: AtomicUsize,
    free_pages: AtomicUsize,
    total_pages: AtomicUsize,
}

impl PhysicalPageManager {
    /// Descriptor table for every page below `phys_limit`. No page is
    /// usable until it is registered with [`add_page`](Self::add_page).
    pub fn new(phys_limit: PhysAddr) -> Self {
        let count = (phys_limit.as_u64() / PAGE_SIZE_4KB) as usize;
        let pages: Vec<PhysPage> = (0..count).map(|_| PhysPage::new()).collect();
        klog_debug!("pmm: tracking {} page descriptors", count);
        Self {
            pages: pages.into_boxed_slice(),
            last_checked: AtomicUsize::new(0),
            free_pages: AtomicUsize::new(0),
            total_pages: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn page(&self, base: PhysAddr) -> Option<&PhysPage> {
        self.pages.get(base.page_number() as usize)
    }

    fn page_or_panic(&self, base: PhysAddr, op: &str) -> &PhysPage {
        match self.page(base) {
            Some(page) => page,
            None => panic!("pmm: {} of untracked page {:#x}", op, base.as_u64()),
        }
    }

    pub fn add_page(&self, base: PhysAddr) {
        let Some(page) = self.page(base) else {
            klog_warn!("pmm: ignoring page {:#x} past the tracked range", base.as_u64());
            return;
        };
        if page
            .state
            .compare_exchange(PAGE_ABSENT, PAGE_USABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.total_pages.fetch_add(1, Ordering::AcqRel);
            if page.refcount.load(Ordering::Acquire) == 0 {
                self.free_pages.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn add_pages(&self, base: PhysAddr, count: usize) {
        for i in 0..count as u64 {
            self.add_page(base.page_base().offset(i * PAGE_SIZE_4KB));
        }
        klog_info!(
            "pmm: added {} pages at {:#x}, {} free",
            count,
            base.as_u64(),
            self.free_pages()
        );
    }

    /// Permanently remove a page from allocation.
    pub fn reserve(&self, base: PhysAddr) {
        let page = self.page_or_panic(base, "reserve");
        let prev = page.state.swap(PAGE_RESERVED, Ordering::AcqRel);
        match prev {
            PAGE_RESERVED => panic!("pmm: page {:#x} reserved twice", base.as_u64()),
            PAGE_USABLE => {
                self.total_pages.fetch_sub(1, Ordering::AcqRel);
                if page.refcount.load(Ordering::Acquire) == 0 {
                    self.free_pages.fetch_sub(1, Ordering::AcqRel);
                }
            }
            _ => {}
        }
    }

    #[inline]
    fn try_claim(&self, index: usize) -> bool {
        let page = &self.pages[index];
        if !page.is_usable() {
            return false;
        }
        if page
            .refcount
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.free_pages.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Allocate one page, scanning circularly from the last hit.
    pub fn alloc(&self) -> MmResult<PhysAddr> {
        let count = self.pages.len();
        if count == 0 {
            return Err(MmError::OutOfPages);
        }
        let start = self.last_checked.load(Ordering::Relaxed) % count;
        for step in 0..count {
            let index = (start + step) % count;
            if self.try_claim(index) {
                self.last_checked.store(index, Ordering::Relaxed);
                return Ok(PhysAddr::from_page_number(index as u64));
            }
        }
        klog_info!("pmm: out of physical pages");
        Err(MmError::OutOfPages)
    }

    /// Take another reference on a known page, allocating it if free.
    pub fn alloc_at(&self, base: PhysAddr) -> u16 {
        let page = self.page_or_panic(base, "alloc_at");
        if !page.is_usable() {
            panic!("pmm: alloc_at on unusable page {:#x}", base.as_u64());
        }
        let mut current = page.refcount.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(1) else {
                panic!("pmm: refcount overflow on page {:#x}", base.as_u64());
            };
            match page.refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 0 {
                        self.free_pages.fetch_sub(1, Ordering::AcqRel);
                    }
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference. Returns the remaining count.
    pub fn dealloc(&self, base: PhysAddr) -> u16 {
        let page = self.page_or_panic(base, "dealloc");
        if !page.is_usable() {
            panic!("pmm: dealloc of unusable page {:#x}", base.as_u64());
        }
        let mut current = page.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                panic!("pmm: double free of page {:#x}", base.as_u64());
            }
            match page.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.free_pages.fetch_add(1, Ordering::AcqRel);
                    }
                    return current - 1;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocate `count` physically consecutive pages, all or nothing.
    pub fn alloc_contiguous(&self, count: usize) -> MmResult<PhysAddr> {
        if count == 0 {
            return Err(MmError::InvalidSize { size: 0 });
        }
        let total = self.pages.len();
        let mut first = 0usize;
        while first + count <= total {
            let mut claimed = 0usize;
            while claimed < count && self.try_claim(first + claimed) {
                claimed += 1;
            }
            if claimed == count {
                return Ok(PhysAddr::from_page_number(first as u64));
            }
            for index in first..first + claimed {
                self.dealloc(PhysAddr::from_page_number(index as u64));
            }
            first += claimed + 1;
        }
        klog_info!("pmm: no run of {} free pages", count);
        Err(MmError::OutOfPages)
    }

    pub fn refcount(&self, base: PhysAddr) -> u16 {
        self.page(base)
            .map(|p| p.refcount.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_usable(&self, base: PhysAddr) -> bool {
        self.page(base).is_some_and(PhysPage::is_usable)
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::Acquire)
    }

    /// Allocate a page wrapped in an owning handle.
    pub fn alloc_frame(&self) -> MmResult<OwnedFrame<'_>> {
        let base = self.alloc()?;
        Ok(OwnedFrame { pmm: self, base })
    }
}

/// One counted reference to a physical page.
///
/// Dropping the handle releases the reference. Page-table entries tagged
/// `FROM_PMM` hold references in raw form; [`into_raw`](Self::into_raw)
/// and [`from_raw`](Self::from_raw) move a reference between the two.
pub struct OwnedFrame<'a> {
    pmm: &'a PhysicalPageManager,
    base: PhysAddr,
}

impl<'a> OwnedFrame<'a> {
    /// # Safety
    /// The caller must own one reference on `base` that nothing else will
    /// release.
    pub unsafe fn from_raw(pmm: &'a PhysicalPageManager, base: PhysAddr) -> Self {
        Self { pmm, base }
    }

    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.base
    }

    /// Give up the handle without releasing the reference.
    pub fn into_raw(self) -> PhysAddr {
        let this = ManuallyDrop::new(self);
        this.base
    }

    pub fn clone_ref(&self) -> Self {
        self.pmm.alloc_at(self.base);
        Self {
            pmm: self.pmm,
            base: self.base,
        }
    }
}

impl Drop for OwnedFrame<'_> {
    fn drop(&mut self) {
        self.pmm.dealloc(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmm_with(pages: usize) -> PhysicalPageManager {
        let pmm = PhysicalPageManager::new(PhysAddr::new(0x100_000 + (pages as u64) * 0x1000));
        pmm.add_pages(PhysAddr::new(0x100_000), pages);
        pmm
    }

    #[test]
    fn alloc_then_dealloc_restores_free_count() {
        let pmm = pmm_with(8);
        let before = pmm.free_pages();
        let page = pmm.alloc().unwrap();
        assert_eq!(pmm.free_pages(), before - 1);
        assert_eq!(pmm.refcount(page), 1);
        assert_eq!(pmm.dealloc(page), 0);
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn exhaustion_reports_out_of_pages() {
        let pmm = pmm_with(2);
        let a = pmm.alloc().unwrap();
        let b = pmm.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pmm.free_pages(), 0);
        assert_eq!(pmm.alloc(), Err(MmError::OutOfPages));
    }

    #[test]
    fn shared_page_freed_on_last_reference() {
        let pmm = pmm_with(4);
        let page = pmm.alloc().unwrap();
        assert_eq!(pmm.alloc_at(page), 2);
        let free = pmm.free_pages();
        assert_eq!(pmm.dealloc(page), 1);
        assert_eq!(pmm.free_pages(), free);
        assert_eq!(pmm.dealloc(page), 0);
        assert_eq!(pmm.free_pages(), free + 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pmm = pmm_with(1);
        let page = pmm.alloc().unwrap();
        pmm.dealloc(page);
        pmm.dealloc(page);
    }

    #[test]
    #[should_panic(expected = "unusable")]
    fn reserved_page_cannot_be_restored() {
        let pmm = pmm_with(2);
        pmm.reserve(PhysAddr::new(0x100_000));
        pmm.alloc_at(PhysAddr::new(0x100_000));
    }

    #[test]
    fn reserved_pages_are_skipped() {
        let pmm = pmm_with(2);
        pmm.reserve(PhysAddr::new(0x100_000));
        assert_eq!(pmm.total_pages(), 1);
        assert_eq!(pmm.alloc().unwrap(), PhysAddr::new(0x101_000));
        assert_eq!(pmm.alloc(), Err(MmError::OutOfPages));
    }

    #[test]
    fn contiguous_is_all_or_nothing() {
        let pmm = pmm_with(6);
        // Punch a hole at the third page so only runs of two and three remain.
        let hole = PhysAddr::new(0x102_000);
        pmm.alloc_at(hole);
        let free = pmm.free_pages();
        assert_eq!(pmm.alloc_contiguous(4), Err(MmError::OutOfPages));
        assert_eq!(pmm.free_pages(), free);
        let run = pmm.alloc_contiguous(3).unwrap();
        assert_eq!(run, PhysAddr::new(0x103_000));
        assert_eq!(pmm.free_pages(), free - 3);
    }

    #[test]
    fn owned_frame_releases_on_drop() {
        let pmm = pmm_with(3);
        let free = pmm.free_pages();
        {
            let frame = pmm.alloc_frame().unwrap();
            let second = frame.clone_ref();
            assert_eq!(pmm.refcount(frame.phys()), 2);
            drop(second);
            assert_eq!(pmm.free_pages(), free - 1);
        }
        assert_eq!(pmm.free_pages(), free);

        let raw = pmm.alloc_frame().unwrap().into_raw();
        assert_eq!(pmm.refcount(raw), 1);
        drop(unsafe { OwnedFrame::from_raw(&pmm, raw) });
        assert_eq!(pmm.refcount(raw), 0);
    }
}
