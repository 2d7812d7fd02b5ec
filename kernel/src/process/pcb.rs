//! Process control block: the kernel's record of one schedulable entity.
//!
//! A PCB comes in two variants (see module docs in [`super`]): a kernel
//! task running in ring 0 on a heap-allocated stack with no address space
//! of its own, and an isolated process running in ring 3 with a private
//! address space and a dedicated kernel stack for the next ring-3->0
//! transition. The variant replaces what the donor modeled as a
//! magic-number test against the user-space base address.

use crate::ipc::message::Message;
use crate::mm::vmm::AddressSpace;
use crate::mm::VirtualAddress;

pub type Pid = u32;

/// PID reserved for the idle/init task. Never reused, never terminates.
pub const IDLE_PID: Pid = 0;

/// "Any sender/receiver" sentinel used by `receive`'s `from` argument.
pub const PID_ANY: Pid = u32::MAX;

/// Ticks granted per quantum before a running task is preempted.
pub const DEFAULT_QUANTUM_TICKS: u32 = 5;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    None,
    Send,
    Receive,
    SendRec,
}

/// The two PCB variants. Distinguishes ring-0 kernel tasks, whose "user"
/// stack is really just a kernel-heap allocation, from ring-3 isolated
/// processes, whose user stack is a mapped region owned by their address
/// space and which additionally need a dedicated kernel stack for syscall
/// and interrupt entry.
pub enum Kind {
    KernelTask {
        stack_base: usize,
        stack_size: usize,
    },
    IsolatedProcess {
        space: AddressSpace,
        user_stack_base: VirtualAddress,
        user_stack_size: usize,
        kernel_stack_base: usize,
        kernel_stack_size: usize,
    },
}

impl Kind {
    pub fn is_isolated(&self) -> bool {
        matches!(self, Kind::IsolatedProcess { .. })
    }
}

/// IPC-related fields of a PCB: blocking state, peer, and the two
/// kernel-resident scratch areas (one for in-flight sends, one for
/// coalesced pending notifications).
pub struct IpcState {
    pub blocking_reason: BlockingReason,
    /// Destination when sending, expected source when receiving.
    pub peer: Pid,
    /// Copied eagerly from the sender's buffer at send/sendrec time, or
    /// filled by `reply` while the replier is current; read out of by the
    /// owning task once it resumes.
    pub scratch: Message,
    pub pending: Option<Message>,
}

impl IpcState {
    const fn new() -> Self {
        IpcState {
            blocking_reason: BlockingReason::None,
            peer: 0,
            scratch: Message::empty(),
            pending: None,
        }
    }
}

/// One schedulable entity.
pub struct Pcb {
    pub pid: Pid,
    pub name: [u8; 16],
    pub active: bool,
    pub priority: u8,
    pub state: TaskState,
    pub ticks_remaining: u32,
    pub wake_tick: u64,
    /// Saved stack pointer of the interrupt frame; `0` while running (the
    /// live frame is on the CPU's current stack, not saved anywhere).
    pub context: u32,
    pub kind: Kind,
    pub ipc: IpcState,
    pub io_privilege: bool,
    pub owned_irq: Option<u8>,
    pub exit_code: i32,
}

fn copy_name(name: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(15);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

impl Pcb {
    pub fn new_kernel_task(
        pid: Pid,
        name: &str,
        priority: u8,
        stack_base: usize,
        stack_size: usize,
        entry_esp: u32,
    ) -> Self {
        Pcb {
            pid,
            name: copy_name(name),
            active: true,
            priority,
            state: TaskState::Ready,
            ticks_remaining: DEFAULT_QUANTUM_TICKS,
            wake_tick: 0,
            context: entry_esp,
            kind: Kind::KernelTask {
                stack_base,
                stack_size,
            },
            ipc: IpcState::new(),
            io_privilege: true,
            owned_irq: None,
            exit_code: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_isolated_process(
        pid: Pid,
        name: &str,
        priority: u8,
        space: AddressSpace,
        user_stack_base: VirtualAddress,
        user_stack_size: usize,
        kernel_stack_base: usize,
        kernel_stack_size: usize,
        entry_esp: u32,
        io_privilege: bool,
    ) -> Self {
        Pcb {
            pid,
            name: copy_name(name),
            active: true,
            priority,
            state: TaskState::Ready,
            ticks_remaining: DEFAULT_QUANTUM_TICKS,
            wake_tick: 0,
            context: entry_esp,
            kind: Kind::IsolatedProcess {
                space,
                user_stack_base,
                user_stack_size,
                kernel_stack_base,
                kernel_stack_size,
            },
            ipc: IpcState::new(),
            io_privilege,
            owned_irq: None,
            exit_code: 0,
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    pub fn is_blocked(&self) -> bool {
        self.ipc.blocking_reason != BlockingReason::None
    }

    pub fn is_runnable(&self, now: u64) -> bool {
        match self.state {
            TaskState::Ready | TaskState::Running => true,
            TaskState::Sleeping => self.wake_tick <= now,
            TaskState::Blocked | TaskState::Terminated => false,
        }
    }

    /// Kernel-stack top used by the TSS `esp0` field on the next ring3->0
    /// transition; `None` for kernel tasks, which never cross rings.
    pub fn kernel_stack_top(&self) -> Option<u32> {
        match &self.kind {
            Kind::IsolatedProcess {
                kernel_stack_base,
                kernel_stack_size,
                ..
            } => Some((*kernel_stack_base + *kernel_stack_size) as u32),
            Kind::KernelTask { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_task_starts_ready_with_full_quantum() {
        let pcb = Pcb::new_kernel_task(1, "idle", 0, 0x1000, 0x1000, 0);
        assert_eq!(pcb.state, TaskState::Ready);
        assert_eq!(pcb.ticks_remaining, DEFAULT_QUANTUM_TICKS);
        assert!(!pcb.is_blocked());
        assert!(pcb.kernel_stack_top().is_none());
    }

    #[test]
    fn name_truncates_and_nul_terminates() {
        let pcb = Pcb::new_kernel_task(1, "a_very_long_task_name_indeed", 0, 0, 0, 0);
        assert_eq!(pcb.name_str(), "a_very_long_tas");
    }

    #[test]
    fn sleeping_task_runnable_only_after_wake_tick() {
        let mut pcb = Pcb::new_kernel_task(1, "t", 0, 0, 0, 0);
        pcb.state = TaskState::Sleeping;
        pcb.wake_tick = 100;
        assert!(!pcb.is_runnable(50));
        assert!(pcb.is_runnable(100));
        assert!(pcb.is_runnable(150));
    }
}
