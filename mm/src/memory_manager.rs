//! Per-process region tracking.
//!
//! A [`MemoryManager`] owns the user address space of one process and the
//! list of regions carved out of it. Regions never overlap. The null page
//! and everything from the end of the canonical lower half upwards are
//! reserved when the manager is built, so no allocation can land there.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use koru_abi::addr::VirtAddr;
use koru_abi::layout::{ADDRESS_SPACE_MAX, NULL_PAGE_FIRST, NULL_PAGE_LAST, USER_SPACE_END};
use koru_lib::{checked_align_up_u64, klog_debug, klog_warn};

use crate::error::{MmError, MmResult};
use crate::interval_list::{Interval, IntervalList};
use crate::paging::{AddressSpace, MapOptions, VirtualPageManager};
use crate::paging_defs::PAGE_SIZE_4KB;

/// Source of data for a file-backed region.
pub trait FileBacking: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the byte count.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<usize>;

    /// Called once the last region mapping the file is gone.
    fn close(&self);
}

struct MappedFile {
    file: Arc<dyn FileBacking>,
    size: u64,
    /// Region table entries, across cloned address spaces, mapping the file.
    regions: AtomicUsize,
}

/// File and length behind a file-backed region.
///
/// Clones are plain handles. The file is closed when the last region table
/// entry mapping it is removed, not when the last handle drops, so a
/// [`MemoryRegion`] kept by a caller never holds the file open.
#[derive(Clone)]
pub struct FileMapping {
    inner: Arc<MappedFile>,
}

impl FileMapping {
    pub fn new(file: Arc<dyn FileBacking>, size: u64) -> Self {
        Self {
            inner: Arc::new(MappedFile {
                file,
                size,
                regions: AtomicUsize::new(1),
            }),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    #[inline]
    pub fn file(&self) -> &Arc<dyn FileBacking> {
        &self.inner.file
    }

    fn retain_region(&self) {
        self.inner.regions.fetch_add(1, Ordering::AcqRel);
    }

    fn release_region(&self) {
        let prev = self.inner.regions.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        if prev == Ok(1) {
            self.inner.file.close();
        }
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum RegionKind {
    /// Never allocatable.
    Reserved,
    /// Backed by real frames when created.
    Mapped,
    /// Backed by the zero page until first write.
    ZeroPage,
    /// Backed by the zero page until first touch, then filled from a file.
    File(FileMapping),
    /// Tracked, but nothing is mapped.
    Unmapped,
}

#[derive(Clone, Debug)]
pub struct MemoryRegion {
    pub from: u64,
    pub to: u64,
    pub options: MapOptions,
    pub kind: RegionKind,
}

impl Interval for MemoryRegion {
    #[inline]
    fn from(&self) -> u64 {
        self.from
    }

    #[inline]
    fn to(&self) -> u64 {
        self.to
    }
}

impl MemoryRegion {
    fn reserved(from: u64, to: u64) -> Self {
        Self {
            from,
            to,
            options: MapOptions::default().rw(false),
            kind: RegionKind::Reserved,
        }
    }

    #[inline]
    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(self.from)
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.size()
    }

    #[inline]
    pub fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE_4KB
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        matches!(self.kind, RegionKind::Reserved)
    }

    pub fn file(&self) -> Option<&FileMapping> {
        match &self.kind {
            RegionKind::File(mapping) => Some(mapping),
            _ => None,
        }
    }
}

/// Memory counters of one process, in bytes except `page_faults`.
#[derive(Debug, Default)]
pub struct MemStats {
    available: AtomicU64,
    allocated: AtomicU64,
    page_faults: AtomicU64,
}

impl MemStats {
    pub const fn new() -> Self {
        Self {
            available: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            page_faults: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn page_faults(&self) -> u64 {
        self.page_faults.load(Ordering::Relaxed)
    }

    pub fn record_page_fault(&self) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// One page committed outside region creation (a fault-time fill).
    pub fn record_commit(&self) {
        self.allocated.fetch_add(PAGE_SIZE_4KB, Ordering::Relaxed);
    }

    fn add_available(&self, bytes: u64) {
        self.available.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_available(&self, bytes: u64) {
        sub_saturating(&self.available, bytes);
    }

    fn add_allocated(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_allocated(&self, bytes: u64) {
        sub_saturating(&self.allocated, bytes);
    }
}

fn sub_saturating(counter: &AtomicU64, bytes: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(bytes))
    });
}

pub struct MemoryManager {
    vmm: Arc<VirtualPageManager>,
    space: AddressSpace,
    regions: IntervalList<MemoryRegion>,
    all_regions_size: u64,
    stats: MemStats,
}

impl MemoryManager {
    pub fn new(vmm: Arc<VirtualPageManager>, space: AddressSpace) -> Self {
        let mut regions = IntervalList::new(ADDRESS_SPACE_MAX);
        regions.add(MemoryRegion::reserved(NULL_PAGE_FIRST, NULL_PAGE_LAST));
        regions.add(MemoryRegion::reserved(USER_SPACE_END, ADDRESS_SPACE_MAX));
        Self {
            vmm,
            space,
            regions,
            all_regions_size: 0,
            stats: MemStats::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    #[inline]
    pub fn vmm(&self) -> &Arc<VirtualPageManager> {
        &self.vmm
    }

    #[inline]
    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    /// Total size of every user region.
    #[inline]
    pub fn all_regions_size(&self) -> u64 {
        self.all_regions_size
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    fn page_size_of(size: u64) -> MmResult<u64> {
        if size == 0 {
            return Err(MmError::InvalidSize { size });
        }
        checked_align_up_u64(size, PAGE_SIZE_4KB).ok_or(MmError::InvalidSize { size })
    }

    /// Locate a free, page-granular range of at least `size` bytes without
    /// claiming it.
    pub fn find_region(&self, size: u64) -> MmResult<MemoryRegion> {
        let size = Self::page_size_of(size)?;
        let (from, to) = self
            .regions
            .find_free(size)
            .ok_or(MmError::NoFreeRange { size })?;
        klog_debug!("mm: free region found [{:#x} - {:#x}]", from, to);
        Ok(MemoryRegion {
            from,
            to,
            options: MapOptions::user_rw(),
            kind: RegionKind::Unmapped,
        })
    }

    fn add_region(&mut self, region: MemoryRegion) -> MemoryRegion {
        klog_debug!(
            "mm: adding region [{:#x} - {:#x}] {:?}",
            region.from,
            region.to,
            region.kind
        );
        self.all_regions_size += region.size();
        self.stats.add_available(region.size());
        self.regions.add(region.clone());
        region
    }

    /// Find a range and back every page with a fresh frame.
    pub fn find_and_map_region(&mut self, size: u64, opts: MapOptions) -> MmResult<MemoryRegion> {
        let mut region = self.find_region(size)?;
        self.vmm
            .maprange(self.space, region.base(), region.pages(), opts.from_pmm(true))?;
        region.options = opts;
        region.kind = RegionKind::Mapped;
        self.stats.add_allocated(region.size());
        Ok(self.add_region(region))
    }

    /// Find a range and point every page at the zero page. Frames are only
    /// committed when a page is first written.
    pub fn find_and_zero_page_region(
        &mut self,
        size: u64,
        opts: MapOptions,
    ) -> MmResult<MemoryRegion> {
        let mut region = self.find_region(size)?;
        self.vmm
            .map_zero_page_range(self.space, region.base(), region.pages(), opts)?;
        region.options = opts;
        region.kind = RegionKind::ZeroPage;
        Ok(self.add_region(region))
    }

    /// Find a range backed lazily by `file`. Every page starts as a
    /// non-present zero-page entry and is filled from the file on first
    /// touch, read or write.
    pub fn find_and_file_map_region(
        &mut self,
        file: Arc<dyn FileBacking>,
        size: u64,
    ) -> MmResult<MemoryRegion> {
        let mut region = self.find_region(size)?;
        let opts = MapOptions::user_rw();
        self.vmm
            .map_zero_page_range_on_touch(self.space, region.base(), region.pages(), opts)?;
        region.options = opts;
        region.kind = RegionKind::File(FileMapping::new(file, size));
        Ok(self.add_region(region))
    }

    fn check_external(&self, from: u64, to: u64) -> MmResult<()> {
        if from > to || from % PAGE_SIZE_4KB != 0 || (to + 1) % PAGE_SIZE_4KB != 0 {
            return Err(MmError::NotAligned { address: from });
        }
        if self.regions.overlaps(from, to) {
            return Err(MmError::RegionOverlap { from, to });
        }
        Ok(())
    }

    /// Track `[from, to]`, already populated by someone else (the program
    /// loader, a stack builder).
    pub fn add_mapped_region(
        &mut self,
        from: u64,
        to: u64,
        opts: MapOptions,
    ) -> MmResult<MemoryRegion> {
        self.check_external(from, to)?;
        let region = MemoryRegion {
            from,
            to,
            options: opts,
            kind: RegionKind::Mapped,
        };
        self.stats.add_allocated(region.size());
        Ok(self.add_region(region))
    }

    /// Track `[from, to]` with nothing mapped behind it.
    pub fn add_unmapped_region(
        &mut self,
        from: u64,
        to: u64,
        opts: MapOptions,
    ) -> MmResult<MemoryRegion> {
        self.check_external(from, to)?;
        Ok(self.add_region(MemoryRegion {
            from,
            to,
            options: opts,
            kind: RegionKind::Unmapped,
        }))
    }

    fn release_pages(&self, region: &MemoryRegion) {
        let zero = self.vmm.zero_page();
        let mut committed = 0;
        for page in 0..region.pages() {
            let va = region.base().offset(page * PAGE_SIZE_4KB);
            if self.vmm.mapping(self.space, va).is_some_and(|phys| phys != zero) {
                committed += PAGE_SIZE_4KB;
            }
            let _ = self.vmm.unmap(self.space, va);
        }
        self.stats.sub_allocated(committed);
    }

    /// Drop the region starting at `from` and unmap all of its pages.
    pub fn remove_region(&mut self, from: u64) -> MmResult<()> {
        let Some(region) = self.regions.contains(from) else {
            klog_debug!("mm: no region to remove at {:#x}", from);
            return Err(MmError::NoRegion { address: from });
        };
        if region.is_reserved() {
            return Err(MmError::ReservedRegion { address: from });
        }
        if region.from != from {
            return Err(MmError::NoRegion { address: from });
        }
        let to = region.to;
        let Some(region) = self.regions.del(from, to) else {
            return Err(MmError::NoRegion { address: from });
        };
        klog_debug!("mm: region [{:#x} - {:#x}] removed", region.from, region.to);
        self.all_regions_size -= region.size();
        self.stats.sub_available(region.size());
        self.release_pages(&region);
        if let Some(mapping) = region.file() {
            mapping.release_region();
        }
        Ok(())
    }

    /// User region containing `addr`. Page zero and reserved ranges never
    /// match.
    pub fn is_within_region(&self, addr: VirtAddr) -> Option<&MemoryRegion> {
        if addr.is_null_page() {
            return None;
        }
        self.regions
            .contains(addr.as_u64())
            .filter(|region| !region.is_reserved())
    }

    /// Change writability of the region containing `addr` and of every
    /// page already mapped in it. Copy-on-write pages stay read-only until
    /// their write fault.
    pub fn protect_region_at_address(&mut self, addr: VirtAddr, rw: bool) -> MmResult<()> {
        if addr.is_null_page() {
            return Err(MmError::NullPage);
        }
        let region = match self.regions.contains_mut(addr.as_u64()) {
            Some(region) if !region.is_reserved() => region,
            Some(_) => {
                return Err(MmError::ReservedRegion {
                    address: addr.as_u64(),
                });
            }
            None => {
                return Err(MmError::NoRegion {
                    address: addr.as_u64(),
                });
            }
        };
        region.options.rw = rw;
        let (base, pages) = (region.base(), region.pages());
        for page in 0..pages {
            let va = base.offset(page * PAGE_SIZE_4KB);
            if let Some(opts) = self.vmm.mapped(self.space, va) {
                if rw && opts.cow {
                    klog_warn!("mm: {:#x} is copy-on-write; left read-only", va.as_u64());
                }
                self.vmm.protect(self.space, va, rw)?;
            }
        }
        Ok(())
    }

    /// Copy the region table into `other`, whose address space must already
    /// be a clone of this one.
    pub fn clone_into(&self, other: &mut MemoryManager) {
        other.regions = self.regions.clone();
        for mapping in other.regions.iter().filter_map(MemoryRegion::file) {
            mapping.retain_region();
        }
        other.all_regions_size = self.all_regions_size;
        other.stats.add_available(self.all_regions_size);
        other.stats.add_allocated(self.stats.allocated());
    }

    /// Remove every user region, unmapping its pages and closing any
    /// backing files.
    pub fn cleanup_all_regions(&mut self) {
        let removed = self.regions.drain_where(|region| !region.is_reserved());
        for region in &removed {
            self.all_regions_size -= region.size();
            self.stats.sub_available(region.size());
            self.release_pages(region);
            if let Some(mapping) = region.file() {
                mapping.release_region();
            }
        }
        klog_debug!("mm: cleaned up {} regions", removed.len());
    }
}
