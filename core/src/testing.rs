//! Host test harness.
//!
//! [`ScriptedSwitch`] stands in for the CPU: every context switch runs the
//! next queued closure, which plays whatever the other processes would
//! have done, and then "switches back" by returning.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use koru_abi::addr::PhysAddr;
use koru_abi::task::Pid;
use koru_lib::{KernelConfig, SchedPolicyKind};
use koru_mm::{PhysicalPageManager, SimulatedRam, VirtualPageManager};
use spin::Mutex;

use crate::platform::ManualClock;
use crate::scheduler::{ContextSwitch, ProcessManager};

type Step = Box<dyn FnOnce(&ProcessManager) + Send>;

#[derive(Default)]
pub(crate) struct ScriptedSwitch {
    steps: Mutex<VecDeque<Step>>,
    switches: Mutex<Vec<(Pid, Pid)>>,
}

impl ScriptedSwitch {
    pub(crate) fn push(&self, step: impl FnOnce(&ProcessManager) + Send + 'static) {
        self.steps.lock().push_back(Box::new(step));
    }

    pub(crate) fn switches(&self) -> Vec<(Pid, Pid)> {
        self.switches.lock().clone()
    }

    pub(crate) fn pending(&self) -> usize {
        self.steps.lock().len()
    }
}

impl ContextSwitch for ScriptedSwitch {
    fn switch(&self, pm: &ProcessManager, from: Pid, to: Pid) {
        self.switches.lock().push((from, to));
        let step = self.steps.lock().pop_front();
        match step {
            Some(step) => step(pm),
            None => panic!("no scripted step for switch {} -> {}", from, to),
        }
    }
}

pub(crate) struct Fixture {
    pub pm: ProcessManager,
    pub switch: Arc<ScriptedSwitch>,
    pub clock: Arc<ManualClock>,
}

pub(crate) extern "C" fn idle(_arg: u64) {}

pub(crate) fn fixture() -> Fixture {
    fixture_with(SchedPolicyKind::Lottery, 16)
}

/// Booted manager over 256 simulated frames.
pub(crate) fn fixture_with(policy: SchedPolicyKind, max_processes: usize) -> Fixture {
    let fx = unbooted(policy, max_processes);
    fx.pm.boot().unwrap();
    fx
}

/// Manager whose kernel tasks were never started.
pub(crate) fn unbooted(policy: SchedPolicyKind, max_processes: usize) -> Fixture {
    let ram = SimulatedRam::new(PhysAddr::new(0x10_0000), 256);
    let pmm = PhysicalPageManager::new(ram.limit());
    pmm.add_pages(ram.base(), 256);
    let vmm = Arc::new(
        VirtualPageManager::with_empty_kernel_space(Arc::new(pmm), Arc::new(ram)).unwrap(),
    );
    let config = KernelConfig {
        policy,
        max_processes,
        ready_queue_capacity: max_processes,
        lottery_seed: Some(0xC0FFEE),
        ..KernelConfig::default()
    };
    let switch = Arc::new(ScriptedSwitch::default());
    let clock = Arc::new(ManualClock::new());
    let pm = ProcessManager::new(config, vmm, clock.clone(), switch.clone()).unwrap();
    Fixture { pm, switch, clock }
}
