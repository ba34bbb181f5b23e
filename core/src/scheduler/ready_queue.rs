//! Bounded FIFO of runnable pids.

use alloc::collections::VecDeque;

use koru_abi::task::Pid;

use crate::error::{ProcessError, ProcessResult};

pub struct ReadyQueue {
    pids: VecDeque<Pid>,
    capacity: usize,
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `pid`. Pushing a pid that is already queued is a no-op.
    pub fn push(&mut self, pid: Pid) -> ProcessResult {
        if self.contains(pid) {
            return Ok(());
        }
        if self.pids.len() >= self.capacity {
            return Err(ProcessError::ReadyQueueFull);
        }
        self.pids.push_back(pid);
        Ok(())
    }

    /// Put back a process that was admitted earlier and blocked since.
    /// Capacity only limits admission, so this never fails.
    pub fn requeue(&mut self, pid: Pid) {
        if !self.contains(pid) {
            self.pids.push_back(pid);
        }
    }

    pub fn pop_front(&mut self) -> Option<Pid> {
        self.pids.pop_front()
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.pids.iter().position(|&p| p == pid) {
            Some(at) => {
                self.pids.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.pids.contains(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_and_deduplicated() {
        let mut q = ReadyQueue::new(2);
        q.push(Pid(1)).unwrap();
        q.push(Pid(1)).unwrap();
        q.push(Pid(2)).unwrap();
        assert_eq!(q.push(Pid(3)), Err(ProcessError::ReadyQueueFull));
        assert!(q.remove(Pid(1)));
        assert!(!q.remove(Pid(1)));
        q.push(Pid(3)).unwrap();
        q.requeue(Pid(1));
        assert_eq!(q.iter().collect::<alloc::vec::Vec<_>>(), [Pid(2), Pid(3), Pid(1)]);
    }
}
