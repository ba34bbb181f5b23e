//! Kernel tasks started at boot.
//!
//! Each task is an ordinary process in the table. Their bodies reach the
//! process manager through the installed global, so they only ever run on
//! the bare-metal target.

use koru_abi::task::{ExitStatus, Pid, ProcessState};
use koru_lib::{cpu, klog_info};

use super::manager::{KernelTasks, ProcessManager, SpawnInfo};
use super::process::KernelEntry;
use crate::error::ProcessResult;
use crate::kernel;

impl ProcessManager {
    /// Spawn the scheduler, collector, awaker and deleter tasks.
    pub fn boot(&self) -> ProcessResult {
        let scheduler = self.spawn(SpawnInfo {
            schedulable: false,
            parent: Some(Pid::NONE),
            ..SpawnInfo::kernel_task("scheduler", scheduler_main, 0)
        })?;
        let task = |name: &str, entry: KernelEntry| {
            self.spawn(SpawnInfo {
                parent: Some(Pid::NONE),
                ..SpawnInfo::kernel_task(name, entry, 0)
            })
        };
        let collector = task("collector", collector_main)?;
        let awaker = task("awaker", awaker_main)?;
        let deleter = task("deleter", deleter_main)?;

        let tasks = KernelTasks {
            scheduler,
            collector,
            awaker,
            deleter,
        };
        self.set_kernel_tasks(tasks);
        klog_info!(
            "proc: kernel tasks up: scheduler {}, collector {}, awaker {}, deleter {}",
            scheduler,
            collector,
            awaker,
            deleter
        );
        Ok(())
    }
}

extern "C" fn scheduler_main(_arg: u64) {
    let pm = kernel();
    loop {
        match pm.schedule_next() {
            Some(next) => pm.run(next),
            None => cpu::halt(),
        }
    }
}

extern "C" fn collector_main(_arg: u64) {
    let pm = kernel();
    loop {
        pm.collector_step();
        pm.await_children();
    }
}

extern "C" fn awaker_main(_arg: u64) {
    let pm = kernel();
    loop {
        pm.awaker_step();
        pm.park(ProcessState::WaitMsg);
    }
}

extern "C" fn deleter_main(_arg: u64) {
    let pm = kernel();
    loop {
        pm.deleter_step();
        pm.park(ProcessState::WaitMsg);
    }
}

/// Where a kernel task lands when its entry function returns.
pub(crate) extern "C" fn task_exit() -> ! {
    kernel().exit_current(ExitStatus::clean(0))
}
