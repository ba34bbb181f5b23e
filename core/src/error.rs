//! Errors returned by process management.

use core::fmt;

use koru_abi::task::Pid;
use koru_mm::MmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// No live process with this pid, or it was already collected.
    NoSuchProcess { pid: Pid },
    /// The target exists but is not a child of the caller.
    NotAChild(Pid),
    /// Every pid slot is taken.
    TableFull,
    ReadyQueueFull,
    OutOfMemory(MmError),
    /// System tasks cannot be killed.
    SystemProcess(Pid),
    /// `exec` was called before a program loader was registered.
    LoaderUnavailable,
    HandleTableFull,
    InvalidPriority,
    /// A blocking call was made before the kernel tasks were started.
    SchedulerNotRunning,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess { pid } => write!(f, "no such process {}", pid),
            Self::NotAChild(pid) => write!(f, "process {} is not a child of the caller", pid),
            Self::TableFull => write!(f, "process table full"),
            Self::ReadyQueueFull => write!(f, "ready queue full"),
            Self::OutOfMemory(err) => write!(f, "out of memory: {}", err),
            Self::SystemProcess(pid) => write!(f, "process {} is a system process", pid),
            Self::LoaderUnavailable => write!(f, "no program loader registered"),
            Self::HandleTableFull => write!(f, "handle table full"),
            Self::InvalidPriority => write!(f, "invalid priority"),
            Self::SchedulerNotRunning => write!(f, "scheduler not running"),
        }
    }
}

impl From<MmError> for ProcessError {
    fn from(err: MmError) -> Self {
        Self::OutOfMemory(err)
    }
}

pub type ProcessResult<T = ()> = Result<T, ProcessError>;
