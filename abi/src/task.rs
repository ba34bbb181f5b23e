//! Process ABI types shared between the process manager and its callers.

use core::fmt;

pub const PROCESS_NAME_MAX_LEN: usize = 32;

/// Process identifier. Zero is never handed out so it can mean "none".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(pub u16);

impl Pid {
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- ProcessState ---

/// Lifecycle state of a process.
///
/// `New -> Available <-> {Sleeping, WaitSync, WaitMsg}`, any live state may
/// drop to `Exited`, and only the collection path moves on to `Collecting`
/// and `Collected`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    New = 0,
    Available = 1,
    Sleeping = 2,
    WaitSync = 3,
    WaitMsg = 4,
    Exited = 5,
    Collecting = 6,
    Collected = 7,
}

impl ProcessState {
    #[inline]
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::Sleeping | Self::WaitSync | Self::WaitMsg)
    }

    #[inline]
    pub const fn is_alive(self) -> bool {
        matches!(
            self,
            Self::New | Self::Available | Self::Sleeping | Self::WaitSync | Self::WaitMsg
        )
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::New => matches!(target, Self::Available | Self::Exited),
            Self::Available => matches!(
                target,
                Self::Sleeping | Self::WaitSync | Self::WaitMsg | Self::Exited
            ),
            Self::Sleeping | Self::WaitSync | Self::WaitMsg => {
                matches!(target, Self::Available | Self::Exited)
            }
            Self::Exited => matches!(target, Self::Collecting),
            Self::Collecting => matches!(target, Self::Collected),
            Self::Collected => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Available => "available",
            Self::Sleeping => "sleeping",
            Self::WaitSync => "waitsync",
            Self::WaitMsg => "waitmsg",
            Self::Exited => "exited",
            Self::Collecting => "collecting",
            Self::Collected => "collected",
        }
    }
}

// --- Exit status ---

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExitReason {
    #[default]
    Alive = 0,
    CleanExit = 1,
    Exception = 2,
    Killed = 3,
    KernelError = 0xFF,
}

impl ExitReason {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Alive,
            1 => Self::CleanExit,
            2 => Self::Exception,
            3 => Self::Killed,
            _ => Self::KernelError,
        }
    }
}

/// Why a process ended and the 8-bit status that goes with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ExitStatus {
    pub reason: ExitReason,
    pub status: u8,
}

impl ExitStatus {
    pub const ALIVE: Self = Self::new(ExitReason::Alive, 0);

    #[inline]
    pub const fn new(reason: ExitReason, status: u8) -> Self {
        Self { reason, status }
    }

    #[inline]
    pub const fn clean(status: u8) -> Self {
        Self::new(ExitReason::CleanExit, status)
    }

    #[inline]
    pub const fn killed() -> Self {
        Self::new(ExitReason::Killed, 0)
    }

    #[inline]
    pub const fn exception(vector: u8) -> Self {
        Self::new(ExitReason::Exception, vector)
    }

    /// Packed form handed to userspace: `status | reason << 24`.
    #[inline]
    pub const fn to_word(self) -> u32 {
        self.status as u32 | ((self.reason as u32) << 24)
    }

    #[inline]
    pub const fn from_word(word: u32) -> Self {
        Self {
            reason: ExitReason::from_u8((word >> 24) as u8),
            status: word as u8,
        }
    }
}

// --- Wakeups ---

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WakeReason {
    #[default]
    None = 0,
    Timeout = 1,
    Signaled = 2,
    ChildExited = 3,
    Message = 4,
}

/// Snapshot of the wait token a blocked process carried when it went to sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WaitToken(pub u64);

// --- Scheduling priority ---

pub const DEFAULT_QUANTUM: u8 = 5;
pub const DEFAULT_TICKETS: u64 = 10;
pub const SYSTEM_TASK_TICKETS: u64 = 1;
/// Ceiling on the tickets one process may hold, so a full table's total
/// still fits a `u64`.
pub const MAX_TICKETS: u64 = 1 << 32;
