//! Deadline-ordered sleep queue.

use alloc::collections::BinaryHeap;
use core::cmp::Reverse;

use koru_abi::task::{Pid, WaitToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SleepEntry {
    pub deadline_ms: u64,
    pub pid: Pid,
    pub token: WaitToken,
}

#[derive(Default)]
pub struct SleepQueue {
    heap: BinaryHeap<Reverse<SleepEntry>>,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, pid: Pid, deadline_ms: u64, token: WaitToken) {
        self.heap.push(Reverse(SleepEntry {
            deadline_ms,
            pid,
            token,
        }));
    }

    /// Earliest deadline still queued.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.deadline_ms)
    }

    /// Remove and return the earliest entry if its deadline has passed.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<SleepEntry> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.deadline_ms <= now_ms => self.heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
