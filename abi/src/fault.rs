//! Exception vectors and the page-fault error code layout.

pub const VECTOR_GENERAL_PROTECTION: u8 = 13;
pub const VECTOR_PAGE_FAULT: u8 = 14;

/// Fault was a protection violation on a present page.
pub const PF_PRESENT: u64 = 0x1;
/// Faulting access was a write.
pub const PF_WRITE: u64 = 0x2;
/// Faulting access came from ring 3.
pub const PF_USER: u64 = 0x4;
/// A reserved bit was set in a paging structure.
pub const PF_RESERVED: u64 = 0x8;
/// Faulting access was an instruction fetch.
pub const PF_INSTRUCTION: u64 = 0x10;

/// Decoded page-fault error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFaultCode(pub u64);

impl PageFaultCode {
    #[inline]
    pub const fn present(self) -> bool {
        self.0 & PF_PRESENT != 0
    }

    #[inline]
    pub const fn write(self) -> bool {
        self.0 & PF_WRITE != 0
    }

    #[inline]
    pub const fn user(self) -> bool {
        self.0 & PF_USER != 0
    }

    #[inline]
    pub const fn reserved(self) -> bool {
        self.0 & PF_RESERVED != 0
    }

    #[inline]
    pub const fn instruction_fetch(self) -> bool {
        self.0 & PF_INSTRUCTION != 0
    }

    /// Human readable cause, used in panic messages and process kill logs.
    pub const fn describe(self) -> &'static str {
        if self.reserved() {
            return if self.user() {
                "userspace attempt to modify reserved paging structure"
            } else {
                "kernel attempt to modify reserved paging structure"
            };
        }
        if self.instruction_fetch() {
            return match (self.user(), self.present()) {
                (true, true) => "userspace instruction fetch from non-executable memory",
                (true, false) => "userspace instruction fetch from invalid memory",
                (false, true) => "kernel instruction fetch from non-executable memory",
                (false, false) => "kernel instruction fetch from invalid memory",
            };
        }
        match (self.user(), self.write(), self.present()) {
            (true, true, true) => "userspace write to protected memory",
            (true, true, false) => "userspace write to invalid memory",
            (true, false, true) => "userspace read from privileged memory",
            (true, false, false) => "userspace read from invalid memory",
            (false, true, true) => "kernel write to protected memory",
            (false, true, false) => "kernel write to invalid memory",
            (false, false, true) => "kernel read from protected memory",
            (false, false, false) => "kernel read from invalid memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_covers_common_faults() {
        assert_eq!(
            PageFaultCode(PF_USER | PF_WRITE).describe(),
            "userspace write to invalid memory"
        );
        assert_eq!(
            PageFaultCode(PF_USER | PF_PRESENT).describe(),
            "userspace read from privileged memory"
        );
        assert_eq!(
            PageFaultCode(PF_USER | PF_RESERVED | PF_PRESENT).describe(),
            "userspace attempt to modify reserved paging structure"
        );
        assert_eq!(PageFaultCode(0).describe(), "kernel read from invalid memory");
    }
}
