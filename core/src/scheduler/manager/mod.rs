//! Process lifecycle and scheduling queues.
//!
//! All scheduling state sits behind one [`IrqMutex`]. Operations that block
//! (collect, sleep, yield) change state under the lock, drop it, and hand
//! the CPU to the scheduler task through the [`ContextSwitch`]. Nothing is
//! ever switched away from while the lock is held.
//!
//! Resources of an exited process are not released on the exit path. The
//! parent collects the exit status, which queues the process for the
//! deleter task; the deleter tears down the address space and frees the
//! pid.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use koru_abi::task::{ExitStatus, Pid, ProcessState, WaitToken, WakeReason};
use koru_lib::{IrqMutex, KernelConfig, klog_debug, klog_info, klog_warn};
use koru_mm::{AddressSpace, MemoryManager, VirtualPageManager};

use super::policy::{SchedulingPolicy, policy_for};
use super::process::{KernelEntry, KernelHandle, Priority, Process, ProcessFlags, ProcessInfo, Terminal};
use super::process_table::ProcessTable;
use super::ready_queue::ReadyQueue;
use super::sleep::SleepQueue;
use super::switch_asm::trampoline_address;
use super::switch_context::SwitchContext;
use crate::error::{ProcessError, ProcessResult};
use crate::platform::Clock;


/// Pid of the boot context. It stays runnable forever and doubles as the
/// idle process.
pub const BOOT_PID: Pid = Pid(1);

/// Moves the CPU from one process to another.
pub trait ContextSwitch: Send + Sync {
    /// Suspend `from` and resume `to`. Returns once `from` is switched back
    /// in. Called without any process manager lock held.
    fn switch(&self, pm: &ProcessManager, from: Pid, to: Pid);
}

/// Supplies the kernel-side entry point of user programs. The entry loads
/// the program image of the current process and drops to user mode.
pub trait ProgramLoader: Send + Sync {
    fn entry(&self) -> KernelEntry;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceSource {
    /// Run in the kernel address space without a memory manager.
    Kernel,
    /// Empty user address space.
    Fresh,
    /// Copy-on-write clone of another process.
    CloneOf(Pid),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Semaphore,
    Mutex,
}

pub struct SpawnInfo {
    pub name: String,
    pub args: String,
    pub entry: KernelEntry,
    pub arg: u64,
    pub space: SpaceSource,
    /// `None` takes the configured defaults.
    pub priority: Option<Priority>,
    pub system: bool,
    /// Non-schedulable processes stay `New` and only run when switched to
    /// explicitly (the scheduler task).
    pub schedulable: bool,
    pub foreground: bool,
    /// `None` makes the caller the parent; `Some(Pid::NONE)` means none.
    pub parent: Option<Pid>,
}

impl SpawnInfo {
    pub fn new(name: &str, entry: KernelEntry) -> Self {
        Self {
            name: String::from(name),
            args: String::new(),
            entry,
            arg: 0,
            space: SpaceSource::Fresh,
            priority: None,
            system: false,
            schedulable: true,
            foreground: false,
            parent: None,
        }
    }

    pub fn kernel_task(name: &str, entry: KernelEntry, arg: u64) -> Self {
        Self {
            arg,
            space: SpaceSource::Kernel,
            system: true,
            ..Self::new(name, entry)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelTasks {
    pub scheduler: Pid,
    pub collector: Pid,
    pub awaker: Pid,
    pub deleter: Pid,
}

/// Register frames the hardware switch needs. Pointers stay valid while
/// both processes are in the table.
pub struct SwitchFrames {
    pub from: *mut SwitchContext,
    pub to: *const SwitchContext,
    pub space: AddressSpace,
    pub kernel_stack_top: u64,
}

struct SchedState {
    table: ProcessTable,
    ready: ReadyQueue,
    sleepers: SleepQueue,
    /// Death queue: exited processes not yet collected.
    exited: Vec<Pid>,
    /// Collected processes waiting for the deleter.
    collected: VecDeque<Pid>,
    policy: alloc::boxed::Box<dyn SchedulingPolicy>,
    current: Pid,
    tasks: KernelTasks,
}

impl SchedState {
    fn process(&self, pid: Pid) -> ProcessResult<&Process> {
        self.table.get(pid).ok_or(ProcessError::NoSuchProcess { pid })
    }

    fn process_mut(&mut self, pid: Pid) -> ProcessResult<&mut Process> {
        self.table.get_mut(pid).ok_or(ProcessError::NoSuchProcess { pid })
    }

    /// Take `pid` off the CPU into the blocked `state` and stamp its token.
    fn block(&mut self, pid: Pid, state: ProcessState) -> ProcessResult<WaitToken> {
        if !state.is_blocked() {
            panic!("proc: {} is not a blocking state", state.as_str());
        }
        let p = self.process_mut(pid)?;
        p.set_state(state);
        p.wake_reason = WakeReason::None;
        let token = WaitToken(p.wait_token);
        self.ready.remove(pid);
        Ok(token)
    }

    /// Block `pid` in `WaitSync` until one of its children exits.
    fn block_for_child(&mut self, pid: Pid) -> ProcessResult<WaitToken> {
        if self.tasks.scheduler.is_none() {
            return Err(ProcessError::SchedulerNotRunning);
        }
        let token = self.block(pid, ProcessState::WaitSync)?;
        if let Some(p) = self.table.get_mut(pid) {
            p.child_wait = Some(token);
        }
        Ok(token)
    }

    /// End a child wait of `pid`. A `WaitSync` block on anything else keeps
    /// its token.
    fn notify_child_exit(&mut self, pid: Pid) {
        let stamped = match self.table.get_mut(pid) {
            Some(p) => p.child_wait.take(),
            None => return,
        };
        if let Some(token) = stamped {
            self.wake(pid, token, WakeReason::ChildExited);
        }
    }

    /// Honor a wakeup only if `token` is still the live token of a blocked
    /// process.
    fn wake(&mut self, pid: Pid, token: WaitToken, reason: WakeReason) -> bool {
        let Some(p) = self.table.get_mut(pid) else {
            return false;
        };
        if !p.state().is_blocked() || p.wait_token != token.0 {
            klog_debug!(
                "proc: dropping stale wake of {} (token {}, live {})",
                pid,
                token.0,
                p.wait_token
            );
            return false;
        }
        p.set_state(ProcessState::Available);
        p.wake_reason = reason;
        p.wait_token += 1;
        self.ready.requeue(pid);
        true
    }

    /// Wake `pid` if it is blocked in `expected`, whatever token it holds.
    fn nudge(&mut self, pid: Pid, expected: ProcessState, reason: WakeReason) {
        let token = match self.table.get(pid) {
            Some(p) if p.state() == expected => WaitToken(p.wait_token),
            _ => return,
        };
        self.wake(pid, token, reason);
    }

    /// `Exited -> Collecting -> Collected`, detach from `parent` and queue
    /// for the deleter.
    fn reap(&mut self, parent: Pid, child: Pid) -> ExitStatus {
        let mut status = ExitStatus::ALIVE;
        if let Some(c) = self.table.get_mut(child) {
            c.set_state(ProcessState::Collecting);
            status = c.exit_status;
        }
        if let Some(p) = self.table.get_mut(parent) {
            p.children.retain(|&c| c != child);
        }
        self.exited.retain(|&pid| pid != child);
        self.ready.remove(child);
        if let Some(c) = self.table.get_mut(child) {
            c.set_state(ProcessState::Collected);
        }
        self.collected.push_back(child);
        let deleter = self.tasks.deleter;
        self.nudge(deleter, ProcessState::WaitMsg, WakeReason::Message);
        klog_debug!(
            "proc: {} collected by {} (status {:#x})",
            child,
            parent,
            status.to_word()
        );
        status
    }

    fn first_exited_child(&self, parent: Pid) -> ProcessResult<Option<Pid>> {
        let p = self.process(parent)?;
        if p.children.is_empty() {
            return Err(ProcessError::NoSuchProcess { pid: Pid::NONE });
        }
        Ok(p.children.iter().copied().find(|&c| {
            self.table
                .get(c)
                .is_some_and(|c| c.state() == ProcessState::Exited)
        }))
    }
}

pub struct ProcessManager {
    config: KernelConfig,
    vmm: Arc<VirtualPageManager>,
    clock: Arc<dyn Clock>,
    switcher: Arc<dyn ContextSwitch>,
    loader: IrqMutex<Option<Arc<dyn ProgramLoader>>>,
    state: IrqMutex<SchedState>,
}

impl ProcessManager {
    /// Build the manager and adopt the running boot context as pid 1.
    pub fn new(
        config: KernelConfig,
        vmm: Arc<VirtualPageManager>,
        clock: Arc<dyn Clock>,
        switcher: Arc<dyn ContextSwitch>,
    ) -> ProcessResult<Self> {
        let mut table = ProcessTable::new(config.max_processes);
        let mut ready = ReadyQueue::new(config.ready_queue_capacity);
        let kernel_space = vmm.kernel_space();
        let boot = table.insert_with(|pid| {
            let mut p = Process::new(pid, Pid::NONE, String::from("kernel"), kernel_space, Priority::system());
            p.flags.insert(ProcessFlags::SYSTEM);
            p.set_state(ProcessState::Available);
            p
        })?;
        ready.push(boot)?;

        let policy = policy_for(config.policy, config.lottery_seed);
        klog_info!(
            "proc: {} slots, {} scheduling, boot context is pid {}",
            config.max_processes,
            policy.name(),
            boot
        );
        Ok(Self {
            config,
            vmm,
            clock,
            switcher,
            loader: IrqMutex::new(None),
            state: IrqMutex::new(SchedState {
                table,
                ready,
                sleepers: SleepQueue::new(),
                exited: Vec::new(),
                collected: VecDeque::new(),
                policy,
                current: boot,
                tasks: KernelTasks::default(),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub fn vmm(&self) -> &Arc<VirtualPageManager> {
        &self.vmm
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn register_loader(&self, loader: Arc<dyn ProgramLoader>) {
        *self.loader.lock() = Some(loader);
    }

    pub fn current(&self) -> Pid {
        self.state.lock().current
    }

    pub fn kernel_tasks(&self) -> KernelTasks {
        self.state.lock().tasks
    }

    pub(crate) fn set_kernel_tasks(&self, tasks: KernelTasks) {
        self.state.lock().tasks = tasks;
    }

    // --- Process creation ---

    fn default_priority(&self) -> Priority {
        Priority::new(self.config.default_quantum, self.config.default_tickets)
    }

    fn build_space(
        &self,
        source: SpaceSource,
    ) -> ProcessResult<(AddressSpace, Option<Arc<IrqMutex<MemoryManager>>>)> {
        match source {
            SpaceSource::Kernel => Ok((self.vmm.kernel_space(), None)),
            SpaceSource::Fresh => {
                let space = self.vmm.create_address_space()?;
                let mm = MemoryManager::new(self.vmm.clone(), space);
                Ok((space, Some(Arc::new(IrqMutex::new(mm)))))
            }
            SpaceSource::CloneOf(src) => {
                let src_mm = self.state.lock().process(src)?.memory.clone();
                let Some(src_mm) = src_mm else {
                    return Ok((self.vmm.kernel_space(), None));
                };
                let src_mm = src_mm.lock();
                let space = self.vmm.clone_address_space(src_mm.space())?;
                let mut mm = MemoryManager::new(self.vmm.clone(), space);
                src_mm.clone_into(&mut mm);
                Ok((space, Some(Arc::new(IrqMutex::new(mm)))))
            }
        }
    }

    fn release_space(&self, space: AddressSpace, memory: Option<Arc<IrqMutex<MemoryManager>>>) {
        if let Some(mm) = memory {
            mm.lock().cleanup_all_regions();
        }
        if space != self.vmm.kernel_space() {
            self.vmm.destroy_address_space(space);
        }
    }

    /// Create a process and, if schedulable, make it runnable.
    pub fn spawn(&self, info: SpawnInfo) -> ProcessResult<Pid> {
        let (space, memory) = self.build_space(info.space)?;
        let priority = info.priority.unwrap_or_else(|| {
            if info.system {
                Priority::system()
            } else {
                self.default_priority()
            }
        });

        let (pid, tty) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let parent = info.parent.unwrap_or(st.current);
            let inherited = st.table.get(parent).map(|p| {
                let files = match info.space {
                    SpaceSource::CloneOf(_) => p.files.clone(),
                    _ => Default::default(),
                };
                (p.tty.clone(), files)
            });
            let (tty, files) = inherited.unwrap_or_default();

            let inserted = st.table.insert_with(|pid| {
                let mut p = Process::new(pid, parent, info.name.clone(), space, priority);
                p.args = info.args.clone();
                p.memory = memory.clone();
                p.tty = tty.clone();
                p.files = files;
                if info.system {
                    p.flags.insert(ProcessFlags::SYSTEM);
                }
                p.context = SwitchContext::new_for_task(
                    info.entry as usize as u64,
                    info.arg,
                    p.kernel_stack_top(),
                    trampoline_address(),
                );
                p
            });
            let pid = match inserted {
                Ok(pid) => pid,
                Err(err) => {
                    drop(guard);
                    self.release_space(space, memory);
                    return Err(err);
                }
            };

            if info.schedulable {
                if let Err(err) = st.ready.push(pid) {
                    st.table.remove(pid);
                    drop(guard);
                    self.release_space(space, memory);
                    klog_warn!("proc: cannot admit '{}': {}", info.name, err);
                    return Err(err);
                }
                if let Some(p) = st.table.get_mut(pid) {
                    p.set_state(ProcessState::Available);
                }
            }
            if let Some(p) = st.table.get_mut(parent) {
                p.children.push(pid);
            }
            (pid, tty)
        };

        if info.foreground {
            if let Some(tty) = tty {
                tty.push_foreground(pid);
            }
        }
        klog_debug!("proc: spawned {} '{}'", pid, info.name);
        Ok(pid)
    }

    /// Spawn a system task in the kernel address space.
    pub fn kspawn(
        &self,
        name: &str,
        entry: KernelEntry,
        arg: u64,
        priority: Option<Priority>,
    ) -> ProcessResult<Pid> {
        self.spawn(SpawnInfo {
            priority,
            ..SpawnInfo::kernel_task(name, entry, arg)
        })
    }

    /// Start the program at `path` in a fresh address space.
    pub fn exec(&self, path: &str, args: &str, foreground: bool) -> ProcessResult<Pid> {
        let entry = self
            .loader
            .lock()
            .as_ref()
            .map(|loader| loader.entry())
            .ok_or(ProcessError::LoaderUnavailable)?;
        self.spawn(SpawnInfo {
            args: String::from(args),
            foreground,
            ..SpawnInfo::new(path, entry)
        })
    }

    /// Copy-on-write clone of the calling process that starts at `entry`.
    pub fn clone_current(&self, entry: KernelEntry, arg: u64) -> ProcessResult<Pid> {
        let current = self.current();
        let (name, args) = {
            let st = self.state.lock();
            let p = st.process(current)?;
            (p.name.clone(), p.args.clone())
        };
        self.spawn(SpawnInfo {
            args,
            arg,
            space: SpaceSource::CloneOf(current),
            ..SpawnInfo::new(&name, entry)
        })
    }

    // --- Termination ---

    /// Record `status` and mark `pid` exited. Memory is released later by
    /// the deleter, after the parent collected the status.
    pub fn exit(&self, pid: Pid, status: ExitStatus) -> ProcessResult {
        let (handles, tty) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let p = st.process(pid)?;
            if !p.state().is_alive() {
                return Err(ProcessError::NoSuchProcess { pid });
            }
            if p.is_system() {
                panic!("proc: system process {} ({}) cannot exit", pid, p.name);
            }

            let heir = match st.tasks.collector {
                Pid::NONE => BOOT_PID,
                collector => collector,
            };
            let p = st.process_mut(pid)?;
            let orphans = core::mem::take(&mut p.children);
            let handles = p.take_handles();
            let tty = p.tty.take();
            let parent = p.ppid;
            let was_queued = p.state() == ProcessState::Available;
            p.exit_status = status;
            p.flags.remove(ProcessFlags::DUE_FOR_RESCHEDULE);
            p.wait_token += 1;
            p.set_state(ProcessState::Exited);
            if !was_queued {
                st.exited.push(pid);
            }

            let mut orphan_exited = false;
            for &orphan in &orphans {
                if let Some(o) = st.table.get_mut(orphan) {
                    o.ppid = heir;
                    orphan_exited |= o.state() == ProcessState::Exited;
                }
            }
            if let Some(h) = st.table.get_mut(heir) {
                h.children.extend(orphans.iter().copied());
            }
            if orphan_exited {
                st.notify_child_exit(heir);
            }
            st.notify_child_exit(parent);
            (handles, tty)
        };

        for handle in handles {
            handle.close();
        }
        if let Some(tty) = tty {
            tty.pop_foreground(pid);
        }
        klog_debug!(
            "proc: {} exited ({:?}, status {})",
            pid,
            status.reason,
            status.status
        );
        Ok(())
    }

    /// Exit the calling process and never come back.
    pub fn exit_current(&self, status: ExitStatus) -> ! {
        let pid = self.current();
        if let Err(err) = self.exit(pid, status) {
            panic!("proc: current process {} cannot exit: {}", pid, err);
        }
        self.reschedule();
        panic!("proc: exited process {} was switched back in", pid);
    }

    pub fn kill(&self, pid: Pid) -> ProcessResult {
        {
            let st = self.state.lock();
            if st.process(pid)?.is_system() {
                return Err(ProcessError::SystemProcess(pid));
            }
            if pid == st.current {
                drop(st);
                self.exit_current(ExitStatus::killed());
            }
        }
        self.exit(pid, ExitStatus::killed())
    }

    // --- Collection ---

    /// Wait for child `pid` to exit and return its status.
    pub fn collect(&self, pid: Pid) -> ProcessResult<ExitStatus> {
        let me = self.current();
        loop {
            {
                let mut st = self.state.lock();
                let child = st.process(pid)?;
                match child.state() {
                    ProcessState::Collecting | ProcessState::Collected => {
                        return Err(ProcessError::NoSuchProcess { pid });
                    }
                    _ if child.ppid != me => return Err(ProcessError::NotAChild(pid)),
                    ProcessState::Exited => return Ok(st.reap(me, pid)),
                    _ => {
                        st.block_for_child(me)?;
                    }
                }
            }
            self.reschedule();
        }
    }

    /// Collect any exited child. With `block` unset, `Ok(None)` means no
    /// child has exited yet.
    pub fn collectany(&self, block: bool) -> ProcessResult<Option<(Pid, ExitStatus)>> {
        let me = self.current();
        loop {
            {
                let mut st = self.state.lock();
                if let Some(child) = st.first_exited_child(me)? {
                    let status = st.reap(me, child);
                    return Ok(Some((child, status)));
                }
                if !block {
                    return Ok(None);
                }
                st.block_for_child(me)?;
            }
            self.reschedule();
        }
    }

    // --- Blocking and waking ---

    /// Make `pid` runnable regardless of its wait token.
    pub fn ready(&self, pid: Pid) -> ProcessResult {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let p = st.process_mut(pid)?;
        match p.state() {
            ProcessState::Available => Ok(()),
            ProcessState::New => {
                st.ready.push(pid)?;
                if let Some(p) = st.table.get_mut(pid) {
                    p.set_state(ProcessState::Available);
                }
                Ok(())
            }
            s if s.is_blocked() => {
                p.set_state(ProcessState::Available);
                p.wait_token += 1;
                st.ready.requeue(pid);
                Ok(())
            }
            _ => Err(ProcessError::NoSuchProcess { pid }),
        }
    }

    /// Block `pid` in `state`. The returned token is what a later
    /// [`wake`](Self::wake) must present.
    pub fn deschedule(&self, pid: Pid, state: ProcessState) -> ProcessResult<WaitToken> {
        self.state.lock().block(pid, state)
    }

    /// Single entry point for wakeups. Returns `false` for a stale token
    /// or a process that is not blocked.
    pub fn wake(&self, pid: Pid, token: WaitToken, reason: WakeReason) -> bool {
        self.state.lock().wake(pid, token, reason)
    }

    /// Live wait token of `pid`.
    pub fn wait_token(&self, pid: Pid) -> Option<WaitToken> {
        self.state.lock().table.get(pid).map(|p| WaitToken(p.wait_token))
    }

    /// Sleep for `ms` milliseconds or until woken otherwise.
    pub fn sleep(&self, ms: u64) -> WakeReason {
        let me = self.current();
        {
            let mut st = self.state.lock();
            if st.tasks.scheduler.is_none() {
                klog_warn!("proc: {} cannot sleep before the scheduler runs", me);
                return WakeReason::None;
            }
            let deadline = self.clock.now_ms().saturating_add(ms);
            let Ok(token) = st.block(me, ProcessState::Sleeping) else {
                return WakeReason::None;
            };
            if let Some(p) = st.table.get_mut(me) {
                p.sleep_deadline = deadline;
            }
            st.sleepers.push(me, deadline, token);
        }
        loop {
            self.reschedule();
            let st = self.state.lock();
            match st.table.get(me) {
                Some(p) if p.state() == ProcessState::Sleeping => continue,
                Some(p) => return p.wake_reason,
                None => return WakeReason::None,
            }
        }
    }

    /// Give up the CPU but stay runnable.
    pub fn yield_now(&self) {
        self.reschedule();
    }

    /// Block the calling task in `state` until something wakes it. Does
    /// nothing before the scheduler runs.
    pub fn park(&self, state: ProcessState) {
        let me = self.current();
        let blocked = {
            let mut st = self.state.lock();
            !st.tasks.scheduler.is_none() && st.block(me, state).is_ok()
        };
        if blocked {
            self.reschedule();
        }
    }

    /// Block the calling process until one of its children has exited.
    /// Returns at once if one already has. A caller without children waits
    /// for orphans to be handed to it.
    pub fn await_children(&self) {
        let me = self.current();
        let blocked = {
            let mut st = self.state.lock();
            match st.first_exited_child(me) {
                Ok(Some(_)) => false,
                _ => st.block_for_child(me).is_ok(),
            }
        };
        if blocked {
            self.reschedule();
        }
    }

    /// Timer hook. Charges the running process one tick, kicks the awaker
    /// when a sleeper is due, and returns `true` when the running process
    /// used up its quantum and should yield.
    pub fn tick(&self) -> bool {
        let now = self.clock.now_ms();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.sleepers.next_deadline().is_some_and(|d| d <= now) {
            let awaker = st.tasks.awaker;
            st.nudge(awaker, ProcessState::WaitMsg, WakeReason::Message);
        }
        let current = st.current;
        if current == st.tasks.scheduler {
            return false;
        }
        let Some(p) = st.table.get_mut(current) else {
            return false;
        };
        p.used_ticks = p.used_ticks.saturating_add(1);
        if p.used_ticks >= p.priority.quantum {
            p.flags.insert(ProcessFlags::DUE_FOR_RESCHEDULE);
        }
        p.flags.contains(ProcessFlags::DUE_FOR_RESCHEDULE)
    }

    /// Read and optionally lower or restore the quantum and tickets of
    /// `pid`. Zero leaves a value unchanged.
    pub fn prioritize(&self, pid: Pid, quantum: u8, tickets: u64) -> ProcessResult<(u8, u64)> {
        let mut st = self.state.lock();
        let p = st.process_mut(pid)?;
        p.priority.adjust(quantum, tickets);
        Ok((p.priority.quantum, p.priority.tickets))
    }

    // --- Scheduling ---

    /// Ask the policy for the next process and reset its quantum.
    pub fn schedule_next(&self) -> Option<Pid> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let next = st.policy.pick(&mut st.ready, &st.table, &mut st.exited)?;
        if let Some(p) = st.table.get_mut(next) {
            p.flags.remove(ProcessFlags::DUE_FOR_RESCHEDULE);
            p.used_ticks = 0;
        }
        Some(next)
    }

    /// Called by the scheduler task: run `next` until it switches back.
    pub fn run(&self, next: Pid) {
        let scheduler = {
            let mut st = self.state.lock();
            let now = self.clock.now_ms();
            let p = match st.table.get_mut(next) {
                Some(p) => p,
                None => return,
            };
            p.stats.last_start_ms = now;
            p.stats.switches += 1;
            st.current = next;
            st.tasks.scheduler
        };

        self.switcher.switch(self, scheduler, next);

        let mut st = self.state.lock();
        let now = self.clock.now_ms();
        if let Some(p) = st.table.get_mut(next) {
            p.stats.runtime_ms += now.saturating_sub(p.stats.last_start_ms);
        }
        st.current = scheduler;
    }

    /// Hand the CPU back to the scheduler task. A no-op until the kernel
    /// tasks are up.
    pub fn reschedule(&self) {
        let (from, to) = {
            let st = self.state.lock();
            (st.current, st.tasks.scheduler)
        };
        if to.is_none() || from == to {
            return;
        }
        self.switcher.switch(self, from, to);
        self.state.lock().current = from;
    }

    /// Registers of `from` and `to` for a hardware switch.
    pub fn switch_frames(&self, from: Pid, to: Pid) -> Option<SwitchFrames> {
        let mut st = self.state.lock();
        let (space, kernel_stack_top, to_ctx) = {
            let p = st.table.get(to)?;
            (p.space, p.kernel_stack_top(), &p.context as *const SwitchContext)
        };
        let from_ctx = &mut st.table.get_mut(from)?.context as *mut SwitchContext;
        Some(SwitchFrames {
            from: from_ctx,
            to: to_ctx,
            space,
            kernel_stack_top,
        })
    }

    // --- Kernel task bodies ---

    /// Wake every sleeper whose deadline passed. Returns how many woke.
    pub fn awaker_step(&self) -> usize {
        let now = self.clock.now_ms();
        let mut st = self.state.lock();
        let mut woken = 0;
        while let Some(entry) = st.sleepers.pop_due(now) {
            if st.wake(entry.pid, entry.token, WakeReason::Timeout) {
                woken += 1;
            }
        }
        woken
    }

    /// Collect every exited child of the collector task.
    pub fn collector_step(&self) -> usize {
        let mut st = self.state.lock();
        let collector = st.tasks.collector;
        let mut reaped = 0;
        while let Ok(Some(child)) = st.first_exited_child(collector) {
            st.reap(collector, child);
            reaped += 1;
        }
        reaped
    }

    /// Destroy every collected process. Returns how many were freed.
    pub fn deleter_step(&self) -> usize {
        let mut freed = 0;
        loop {
            let process = {
                let mut st = self.state.lock();
                let Some(pid) = st.collected.pop_front() else {
                    break;
                };
                st.table.remove(pid)
            };
            let Some(mut process) = process else {
                continue;
            };
            self.release_space(process.space, process.memory.take());
            klog_debug!("proc: deleted {} '{}'", process.pid, process.name);
            freed += 1;
        }
        freed
    }

    // --- Queries ---

    pub fn state_of(&self, pid: Pid) -> Option<ProcessState> {
        self.state.lock().table.get(pid).map(|p| p.state())
    }

    pub fn memory_of(&self, pid: Pid) -> Option<Arc<IrqMutex<MemoryManager>>> {
        self.state.lock().table.get(pid)?.memory.clone()
    }

    pub fn is_system(&self, pid: Pid) -> bool {
        self.state
            .lock()
            .table
            .get(pid)
            .is_some_and(|p| p.is_system())
    }

    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        self.state
            .lock()
            .table
            .get(pid)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    pub fn info(&self, pid: Pid) -> Option<ProcessInfo> {
        self.state.lock().table.get(pid).map(Process::info)
    }

    /// Snapshot of every process, in pid order.
    pub fn proctable(&self) -> Vec<ProcessInfo> {
        self.state.lock().table.iter().map(Process::info).collect()
    }

    pub fn set_tty(&self, pid: Pid, tty: Option<Arc<dyn Terminal>>) -> ProcessResult {
        self.state.lock().process_mut(pid)?.tty = tty;
        Ok(())
    }

    /// Store `handle` in one of the tables of `pid`; returns its index.
    pub fn add_handle(
        &self,
        pid: Pid,
        kind: HandleKind,
        handle: Arc<dyn KernelHandle>,
    ) -> ProcessResult<usize> {
        let mut st = self.state.lock();
        let p = st.process_mut(pid)?;
        match kind {
            HandleKind::File => p.files.insert(handle),
            HandleKind::Semaphore => p.semaphores.insert(handle),
            HandleKind::Mutex => p.mutexes.insert(handle),
        }
    }

    /// Account bytes moved by file I/O of `pid`.
    pub fn record_io(&self, pid: Pid, read: u64, written: u64) {
        if let Some(p) = self.state.lock().table.get_mut(pid) {
            p.io.read += read;
            p.io.written += written;
        }
    }
}
