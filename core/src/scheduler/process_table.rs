//! Pid-indexed arena of process descriptors.
//!
//! Slot `n` holds pid `n`. Slot 0 is never used. Pids are handed out from
//! a rotating cursor so a freed pid is not immediately reused.

use alloc::boxed::Box;
use alloc::vec::Vec;

use koru_abi::task::Pid;

use super::process::Process;
use crate::error::{ProcessError, ProcessResult};

pub struct ProcessTable {
    slots: Vec<Option<Box<Process>>>,
    cursor: usize,
    live: usize,
}

impl ProcessTable {
    /// Table able to hold `capacity` processes (pids `1..=capacity`).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || None);
        Self {
            slots,
            cursor: 1,
            live: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn free_slot(&self) -> Option<usize> {
        let cap = self.capacity();
        (0..cap)
            .map(|i| 1 + (self.cursor - 1 + i) % cap)
            .find(|&idx| self.slots[idx].is_none())
    }

    /// Claim a pid and store the process `build` makes for it.
    pub fn insert_with(&mut self, build: impl FnOnce(Pid) -> Process) -> ProcessResult<Pid> {
        let idx = self.free_slot().ok_or(ProcessError::TableFull)?;
        let pid = Pid(idx as u16);
        self.slots[idx] = Some(Box::new(build(pid)));
        self.cursor = idx % self.capacity() + 1;
        self.live += 1;
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_usize())?.as_deref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_usize())?.as_deref_mut()
    }

    /// Release the slot of `pid`, returning its descriptor.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        if pid.is_none() {
            return None;
        }
        let process = self.slots.get_mut(pid.as_usize())?.take()?;
        self.live -= 1;
        Some(process)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(|s| s.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::process::Priority;
    use alloc::string::String;
    use koru_abi::addr::PhysAddr;
    use koru_mm::AddressSpace;

    fn build(pid: Pid) -> Process {
        Process::new(
            pid,
            Pid::NONE,
            String::from("p"),
            AddressSpace::from_root(PhysAddr::new(0x1000)),
            Priority::new(5, 10),
        )
    }

    #[test]
    fn pid_zero_is_never_handed_out() {
        let mut t = ProcessTable::new(4);
        let pids: Vec<Pid> = (0..4).map(|_| t.insert_with(build).unwrap()).collect();
        assert_eq!(pids, [Pid(1), Pid(2), Pid(3), Pid(4)]);
        assert_eq!(t.insert_with(build), Err(ProcessError::TableFull));
        assert!(t.get(Pid::NONE).is_none());
    }

    #[test]
    fn freed_pid_is_not_reused_first() {
        let mut t = ProcessTable::new(4);
        let a = t.insert_with(build).unwrap();
        t.insert_with(build).unwrap();
        assert!(t.remove(a).is_some());
        assert_eq!(t.insert_with(build), Ok(Pid(3)));
        assert_eq!(t.insert_with(build), Ok(Pid(4)));
        assert_eq!(t.insert_with(build), Ok(a));
        assert_eq!(t.len(), 4);
        assert_eq!(t.get(a).map(|p| p.pid), Some(a));
    }
}
