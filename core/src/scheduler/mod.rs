pub mod kthread;
pub mod manager;
pub mod policy;
pub mod process;
pub mod process_table;
pub mod ready_queue;
pub mod sleep;
pub mod switch_asm;
pub mod switch_context;

pub use manager::{
    BOOT_PID, ContextSwitch, HandleKind, KernelTasks, ProcessManager, ProgramLoader, SpaceSource,
    SpawnInfo, SwitchFrames,
};
pub use policy::{LotteryPolicy, RoundRobinPolicy, SchedulingPolicy};
pub use process::{
    HandleTable, KernelEntry, KernelHandle, Priority, Process, ProcessFlags, ProcessInfo, Terminal,
};
pub use switch_context::SwitchContext;
