//! Process descriptor.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use koru_abi::task::{
    DEFAULT_QUANTUM, ExitStatus, MAX_TICKETS, Pid, ProcessState, SYSTEM_TASK_TICKETS, WaitToken,
    WakeReason,
};
use koru_lib::IrqMutex;
use koru_mm::{AddressSpace, MemoryManager};

use super::switch_context::{KernelStack, SwitchContext};
use crate::error::{ProcessError, ProcessResult};

pub const HANDLE_TABLE_SIZE: usize = 32;

/// Entry point of a kernel task. The argument arrives in `rdi`.
pub type KernelEntry = extern "C" fn(u64);

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        /// Kernel task that can never be killed.
        const SYSTEM = 1 << 0;
        /// Quantum used up; the next preemption point yields.
        const DUE_FOR_RESCHEDULE = 1 << 1;
    }
}

/// An open kernel object held in one of the process handle tables.
pub trait KernelHandle: Send + Sync {
    fn close(&self);
}

/// The terminal a process is bound to.
pub trait Terminal: Send + Sync {
    fn push_foreground(&self, pid: Pid);
    fn pop_foreground(&self, pid: Pid);
}

/// Time quantum and lottery weight. The `max_*` values are the ceiling a
/// later `prioritize` may raise the current values to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Priority {
    pub quantum: u8,
    pub max_quantum: u8,
    pub tickets: u64,
    pub max_tickets: u64,
}

impl Priority {
    /// `tickets` is capped at [`MAX_TICKETS`].
    pub const fn new(quantum: u8, tickets: u64) -> Self {
        let tickets = if tickets > MAX_TICKETS { MAX_TICKETS } else { tickets };
        Self {
            quantum,
            max_quantum: quantum,
            tickets,
            max_tickets: tickets,
        }
    }

    pub const fn system() -> Self {
        Self::new(DEFAULT_QUANTUM, SYSTEM_TASK_TICKETS)
    }

    /// Zero leaves a value untouched; anything else is clamped to its
    /// maximum.
    pub fn adjust(&mut self, quantum: u8, tickets: u64) {
        if quantum != 0 {
            self.quantum = quantum.min(self.max_quantum);
        }
        if tickets != 0 {
            self.tickets = tickets.min(self.max_tickets);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub runtime_ms: u64,
    pub switches: u64,
    /// Clock reading when the process was last switched in.
    pub(crate) last_start_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read: u64,
    pub written: u64,
}

/// Fixed-capacity table of handles indexed by descriptor number.
pub struct HandleTable<T, const N: usize> {
    slots: [Option<T>; N],
}

impl<T, const N: usize> HandleTable<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Store `item` in the lowest free slot.
    pub fn insert(&mut self, item: T) -> ProcessResult<usize> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ProcessError::HandleTableFull)?;
        self.slots[idx] = Some(item);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn remove(&mut self, idx: usize) -> Option<T> {
        self.slots.get_mut(idx)?.take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }
}

impl<T: Clone, const N: usize> Clone for HandleTable<T, N> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T, const N: usize> Default for HandleTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub type Handles = HandleTable<Arc<dyn KernelHandle>, HANDLE_TABLE_SIZE>;

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    state: ProcessState,
    pub priority: Priority,
    pub used_ticks: u8,
    pub flags: ProcessFlags,
    pub name: String,
    pub args: String,
    pub space: AddressSpace,
    /// `None` for kernel tasks, which run in the kernel address space.
    pub memory: Option<Arc<IrqMutex<MemoryManager>>>,
    pub files: Handles,
    pub semaphores: Handles,
    pub mutexes: Handles,
    pub tty: Option<Arc<dyn Terminal>>,
    pub exit_status: ExitStatus,
    pub children: Vec<Pid>,
    pub stats: RuntimeStats,
    pub io: IoStats,
    pub sleep_deadline: u64,
    pub wait_token: u64,
    /// Token stamped when blocking for a child to exit. Only this wait is
    /// ended by a child's exit; other `WaitSync` waits are left alone.
    pub(crate) child_wait: Option<WaitToken>,
    pub wake_reason: WakeReason,
    pub context: SwitchContext,
    kernel_stack: KernelStack,
}

impl Process {
    pub fn new(pid: Pid, ppid: Pid, name: String, space: AddressSpace, priority: Priority) -> Self {
        Self {
            pid,
            ppid,
            state: ProcessState::New,
            priority,
            used_ticks: 0,
            flags: ProcessFlags::empty(),
            name,
            args: String::new(),
            space,
            memory: None,
            files: Handles::new(),
            semaphores: Handles::new(),
            mutexes: Handles::new(),
            tty: None,
            exit_status: ExitStatus::ALIVE,
            children: Vec::new(),
            stats: RuntimeStats::default(),
            io: IoStats::default(),
            sleep_deadline: 0,
            wait_token: 0,
            child_wait: None,
            wake_reason: WakeReason::None,
            context: SwitchContext::zero(),
            kernel_stack: KernelStack::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Move to `target`. An edge the state machine does not allow means
    /// the process manager lost track of this process.
    pub(crate) fn set_state(&mut self, target: ProcessState) {
        if !self.state.can_transition_to(target) {
            panic!(
                "process {} ({}): illegal transition {} -> {}",
                self.pid,
                self.name,
                self.state.as_str(),
                target.as_str()
            );
        }
        self.state = target;
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.flags.contains(ProcessFlags::SYSTEM)
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.top()
    }

    /// Empty every handle table.
    pub(crate) fn take_handles(&mut self) -> Vec<Arc<dyn KernelHandle>> {
        let mut handles: Vec<_> = self.files.drain().collect();
        handles.extend(self.semaphores.drain());
        handles.extend(self.mutexes.drain());
        handles
    }

    pub fn info(&self) -> ProcessInfo {
        let (allocated, page_faults) = match &self.memory {
            Some(mm) => {
                let mm = mm.lock();
                (mm.stats().allocated(), mm.stats().page_faults())
            }
            None => (0, 0),
        };
        ProcessInfo {
            pid: self.pid,
            ppid: self.ppid,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            runtime_ms: self.stats.runtime_ms,
            allocated,
            page_faults,
            exit_status: self.exit_status,
        }
    }
}

/// Point-in-time copy of a process for listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub runtime_ms: u64,
    pub allocated: u64,
    pub page_faults: u64,
    pub exit_status: ExitStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use koru_abi::addr::PhysAddr;

    fn process() -> Process {
        Process::new(
            Pid(3),
            Pid(1),
            String::from("t"),
            AddressSpace::from_root(PhysAddr::new(0x1000)),
            Priority::new(5, 10),
        )
    }

    #[test]
    fn adjust_clamps_and_zero_reads() {
        let mut p = Priority::new(5, 10);
        p.adjust(2, 3);
        assert_eq!((p.quantum, p.tickets), (2, 3));
        p.adjust(0, 0);
        assert_eq!((p.quantum, p.tickets), (2, 3));
        p.adjust(200, 1000);
        assert_eq!((p.quantum, p.tickets), (5, 10));
    }

    #[test]
    fn handle_table_reuses_lowest_slot() {
        let mut t: HandleTable<u32, 4> = HandleTable::new();
        assert_eq!(t.insert(10), Ok(0));
        assert_eq!(t.insert(11), Ok(1));
        assert_eq!(t.remove(0), Some(10));
        assert_eq!(t.insert(12), Ok(0));
        t.insert(13).unwrap();
        t.insert(14).unwrap();
        assert_eq!(t.insert(15), Err(ProcessError::HandleTableFull));
        assert_eq!(t.drain().count(), 4);
        assert!(t.is_empty());
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn exited_cannot_become_available() {
        let mut p = process();
        p.set_state(ProcessState::Exited);
        p.set_state(ProcessState::Available);
    }
}
