use super::page_table_defs::PageTableEntry;
use crate::paging_defs::PageFlags;

/// How a virtual page is backed and who may touch it.
///
/// `clear` is an instruction to the mapping call (zero the frame first)
/// rather than a property of the resulting entry, so it never comes back
/// out of [`MapOptions::from_entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapOptions {
    pub rw: bool,
    pub user: bool,
    pub clear: bool,
    pub from_pmm: bool,
    pub cow: bool,
    pub cached: bool,
    pub global: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            rw: true,
            user: false,
            clear: false,
            from_pmm: false,
            cow: false,
            cached: true,
            global: false,
        }
    }
}

macro_rules! option_setters {
    ($($field:ident),*) => {
        $(
            #[inline]
            pub const fn $field(mut self, value: bool) -> Self {
                self.$field = value;
                self
            }
        )*
    };
}

impl MapOptions {
    option_setters!(rw, user, clear, from_pmm, cow, cached, global);

    pub const fn user_rw() -> Self {
        Self {
            rw: true,
            user: true,
            clear: false,
            from_pmm: false,
            cow: false,
            cached: true,
            global: false,
        }
    }

    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        if self.rw && !self.cow {
            flags |= PageFlags::WRITABLE;
        }
        if self.user {
            flags |= PageFlags::USER;
        }
        if self.from_pmm {
            flags |= PageFlags::FROM_PMM;
        }
        if self.cow {
            flags |= PageFlags::COW;
        }
        if !self.cached {
            flags |= PageFlags::CACHE_DISABLE;
        }
        if self.global {
            flags |= PageFlags::GLOBAL;
        }
        flags
    }

    pub fn from_entry(entry: PageTableEntry) -> Self {
        let flags = entry.flags();
        Self {
            rw: flags.contains(PageFlags::WRITABLE),
            user: flags.contains(PageFlags::USER),
            clear: false,
            from_pmm: flags.contains(PageFlags::FROM_PMM),
            cow: flags.contains(PageFlags::COW),
            cached: !flags.contains(PageFlags::CACHE_DISABLE),
            global: flags.contains(PageFlags::GLOBAL),
        }
    }
}

/// A memory access as the MMU sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
    pub execute: bool,
}

impl Access {
    pub const USER_READ: Self = Self::new(false, true);
    pub const USER_WRITE: Self = Self::new(true, true);
    pub const KERNEL_READ: Self = Self::new(false, false);
    pub const KERNEL_WRITE: Self = Self::new(true, false);

    pub const fn new(write: bool, user: bool) -> Self {
        Self {
            write,
            user,
            execute: false,
        }
    }

    /// Error code bits a faulting access of this kind would push.
    pub const fn fault_bits(&self) -> u64 {
        use koru_abi::fault::{PF_INSTRUCTION, PF_USER, PF_WRITE};
        let mut code = 0;
        if self.write {
            code |= PF_WRITE;
        }
        if self.user {
            code |= PF_USER;
        }
        if self.execute {
            code |= PF_INSTRUCTION;
        }
        code
    }
}
