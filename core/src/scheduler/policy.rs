//! Selection of the next process to run.
//!
//! A policy only looks at the ready queue and the process table. Processes
//! it finds in `Exited` are moved off the ready queue onto the death queue
//! so they are never picked.

use alloc::boxed::Box;
use alloc::vec::Vec;

use koru_abi::task::{Pid, ProcessState};
use koru_lib::{Lfsr64, SchedPolicyKind, klog_debug};

use super::process_table::ProcessTable;
use super::ready_queue::ReadyQueue;

pub trait SchedulingPolicy: Send {
    fn name(&self) -> &'static str;

    /// Choose the next process. `None` means nothing is runnable.
    fn pick(
        &mut self,
        ready: &mut ReadyQueue,
        table: &ProcessTable,
        exited: &mut Vec<Pid>,
    ) -> Option<Pid>;
}

pub fn policy_for(kind: SchedPolicyKind, seed: Option<u64>) -> Box<dyn SchedulingPolicy> {
    match kind {
        SchedPolicyKind::Lottery => Box::new(LotteryPolicy::new(match seed {
            Some(seed) => Lfsr64::new(seed),
            None => Lfsr64::from_tsc(),
        })),
        SchedPolicyKind::RoundRobin => Box::new(RoundRobinPolicy),
    }
}

fn state_of(table: &ProcessTable, pid: Pid) -> Option<ProcessState> {
    table.get(pid).map(|p| p.state())
}

fn bury(exited: &mut Vec<Pid>, pid: Pid) {
    if !exited.contains(&pid) {
        klog_debug!("sched: process {} moved to the death queue", pid);
        exited.push(pid);
    }
}

fn ticket_holders<'a>(
    ready: &'a ReadyQueue,
    table: &'a ProcessTable,
) -> impl Iterator<Item = (Pid, u64)> + 'a {
    ready.iter().filter_map(move |pid| {
        let p = table.get(pid)?;
        (p.state() == ProcessState::Available).then_some((pid, p.priority.tickets))
    })
}

/// Every available process holds `tickets` lottery tickets; one ticket is
/// drawn per decision.
pub struct LotteryPolicy {
    rng: Lfsr64,
}

impl LotteryPolicy {
    pub fn new(rng: Lfsr64) -> Self {
        Self { rng }
    }
}

impl SchedulingPolicy for LotteryPolicy {
    fn name(&self) -> &'static str {
        "lottery"
    }

    fn pick(
        &mut self,
        ready: &mut ReadyQueue,
        table: &ProcessTable,
        exited: &mut Vec<Pid>,
    ) -> Option<Pid> {
        loop {
            let dead = ready
                .iter()
                .find(|&pid| state_of(table, pid) == Some(ProcessState::Exited));
            if let Some(pid) = dead {
                ready.remove(pid);
                bury(exited, pid);
                continue;
            }

            let total = ticket_holders(ready, table).fold(0u64, |sum, (_, t)| sum.saturating_add(t));
            if total == 0 {
                return None;
            }

            let draw = self.rng.below(total);
            let mut covered = 0u64;
            for (pid, tickets) in ticket_holders(ready, table) {
                covered = covered.saturating_add(tickets);
                if covered > draw {
                    return Some(pid);
                }
            }
            panic!("lottery: no winner for draw {} of {} tickets", draw, total);
        }
    }
}

/// First come, first served, with the winner moved to the back.
pub struct RoundRobinPolicy;

impl SchedulingPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn pick(
        &mut self,
        ready: &mut ReadyQueue,
        table: &ProcessTable,
        exited: &mut Vec<Pid>,
    ) -> Option<Pid> {
        while let Some(pid) = ready.pop_front() {
            match state_of(table, pid) {
                Some(ProcessState::Available) => {
                    // The slot it was just popped from is free again.
                    let _ = ready.push(pid);
                    return Some(pid);
                }
                Some(ProcessState::Exited) => bury(exited, pid),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::process::{Priority, Process};
    use alloc::string::String;
    use koru_abi::addr::PhysAddr;
    use koru_abi::task::MAX_TICKETS;
    use koru_mm::AddressSpace;

    fn table_with(tickets: &[u64]) -> (ProcessTable, ReadyQueue) {
        let mut table = ProcessTable::new(16);
        let mut ready = ReadyQueue::new(16);
        for &t in tickets {
            let pid = table
                .insert_with(|pid| {
                    let mut p = Process::new(
                        pid,
                        Pid::NONE,
                        String::from("t"),
                        AddressSpace::from_root(PhysAddr::new(0x1000)),
                        Priority::new(5, t),
                    );
                    p.set_state(ProcessState::Available);
                    p
                })
                .unwrap();
            ready.push(pid).unwrap();
        }
        (table, ready)
    }

    #[test]
    fn lottery_winner_follows_the_draw() {
        let tickets = [10u64, 30, 60];
        let (table, mut ready) = table_with(&tickets);
        let mut policy = LotteryPolicy::new(Lfsr64::new(0x5EED));
        let mut shadow = Lfsr64::new(0x5EED);
        let mut exited = Vec::new();

        for _ in 0..32 {
            let draw = shadow.below(100);
            let expected = if draw < 10 {
                Pid(1)
            } else if draw < 40 {
                Pid(2)
            } else {
                Pid(3)
            };
            assert_eq!(policy.pick(&mut ready, &table, &mut exited), Some(expected));
        }
        assert!(exited.is_empty());
        assert_eq!(ready.len(), 3);
    }

    #[test]
    fn lottery_buries_exited_and_never_picks_them() {
        let (mut table, mut ready) = table_with(&[5, 5, 5]);
        table.get_mut(Pid(2)).unwrap().set_state(ProcessState::Exited);
        let mut policy = LotteryPolicy::new(Lfsr64::new(3));
        let mut exited = Vec::new();

        let first = policy.pick(&mut ready, &table, &mut exited).unwrap();
        assert_ne!(first, Pid(2));
        assert_eq!(exited, [Pid(2)]);
        assert!(!ready.contains(Pid(2)));
        for _ in 0..16 {
            assert_ne!(policy.pick(&mut ready, &table, &mut exited), Some(Pid(2)));
        }
        assert_eq!(exited, [Pid(2)]);
    }

    #[test]
    fn lottery_survives_huge_ticket_counts() {
        let (mut table, mut ready) = table_with(&[1, 1]);
        for pid in [Pid(1), Pid(2)] {
            table.get_mut(pid).unwrap().priority.tickets = u64::MAX;
        }
        let mut policy = LotteryPolicy::new(Lfsr64::new(7));
        for _ in 0..8 {
            let pick = policy.pick(&mut ready, &table, &mut Vec::new());
            assert!(matches!(pick, Some(Pid(1)) | Some(Pid(2))));
        }
    }

    #[test]
    fn priority_caps_tickets() {
        assert_eq!(Priority::new(5, u64::MAX).tickets, MAX_TICKETS);
    }

    #[test]
    fn lottery_without_tickets_picks_nothing() {
        let (mut table, mut ready) = table_with(&[5]);
        table.get_mut(Pid(1)).unwrap().set_state(ProcessState::Sleeping);
        let mut policy = LotteryPolicy::new(Lfsr64::new(3));
        assert_eq!(policy.pick(&mut ready, &table, &mut Vec::new()), None);
    }

    #[test]
    fn round_robin_rotates_and_drops() {
        let (mut table, mut ready) = table_with(&[1, 1, 1]);
        let mut policy = RoundRobinPolicy;
        let mut exited = Vec::new();
        assert_eq!(policy.pick(&mut ready, &table, &mut exited), Some(Pid(1)));
        assert_eq!(policy.pick(&mut ready, &table, &mut exited), Some(Pid(2)));

        table.get_mut(Pid(3)).unwrap().set_state(ProcessState::Exited);
        table.get_mut(Pid(1)).unwrap().set_state(ProcessState::WaitMsg);
        assert_eq!(policy.pick(&mut ready, &table, &mut exited), Some(Pid(2)));
        assert_eq!(exited, [Pid(3)]);
        assert_eq!(ready.iter().collect::<Vec<_>>(), [Pid(2)]);
    }
}
