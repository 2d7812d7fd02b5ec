//! Exception and hardware-interrupt dispatch.
//!
//! Called directly from the two shared stub handlers in
//! [`crate::arch::x86::idt`]: [`handle_exception`] for every CPU exception
//! vector (0-31, everything that isn't the syscall gate), [`handle_irq`] for
//! every remapped hardware IRQ line (32-47). Neither function is ever called
//! re-entrantly -- a nested interrupt runs on top of the current one's
//! kernel stack and returns before the outer one resumes.
//!
//! Ownership of a hardware IRQ line (beyond the timer, which the scheduler
//! owns outright) is tracked per-task via [`Pcb::owned_irq`], assigned by
//! the `register_irq` syscall. There is no separate IRQ-to-PID table: the
//! task table is scanned the same way the scheduler scans it for run
//! candidates.

use crate::arch::InterruptFrame;
use crate::ipc::{self, Message};
use crate::process::table::TASK_TABLE;
use crate::process::Pid;

/// CPU exception vector for a page fault; the only exception this core
/// handles specially rather than treating as fatal.
const PAGE_FAULT_VECTOR: u32 = 14;

/// Dispatches a CPU exception (vectors 0-31). A user-mode page fault kills
/// the faulting process; everything else reaching here in kernel mode is a
/// bug this core has no way to recover from.
pub fn handle_exception(frame: &mut InterruptFrame) {
    if frame.vector == PAGE_FAULT_VECTOR {
        let faulting_addr = crate::mm::VirtualAddress::new(read_cr2());
        crate::mm::vmm::page_fault_handler(faulting_addr, frame);
        return;
    }

    if frame.is_user_mode() {
        log::warn!("unhandled exception {} in user mode, killing task", frame.vector);
        crate::sched::kill_current(crate::error::KernelError::HardwareError {
            device: "cpu",
            code: frame.vector,
        });
    }

    panic!(
        "unrecoverable CPU exception {} (error_code={:#x}) at eip={:#010x}",
        frame.vector, frame.error_code, frame.eip
    );
}

/// Dispatches a remapped hardware IRQ (lines 0-15, vectors 32-47). Returns
/// whatever [`crate::sched::on_timer_interrupt`] returns for line 0 (the
/// possibly-new `esp` for `common_irq_stub` to switch to); every other line
/// never triggers a switch by itself, so returns 0.
pub fn handle_irq(irq_line: u32, frame: &mut InterruptFrame) -> u32 {
    let next_esp = if irq_line == 0 {
        crate::sched::on_timer_interrupt(frame)
    } else {
        deliver_to_owner(irq_line);
        0
    };

    // SAFETY: `irq_line` is exactly the line this interrupt was raised on;
    // EOI must be sent exactly once, after the handler has run.
    unsafe {
        crate::arch::x86::pic::send_eoi(irq_line as u8);
    }

    next_esp
}

/// Finds the task that owns `irq_line` (via [`Pcb::owned_irq`]) and
/// notifies it. A line with no registered owner is silently ignored --
/// this can happen for a brief window between a device raising its line
/// and the owning driver task calling `register_irq`.
fn deliver_to_owner(irq_line: u32) {
    let owner: Option<Pid> = TASK_TABLE.with(|table| {
        table
            .iter()
            .find(|p| p.owned_irq == Some(irq_line as u8))
            .map(|p| p.pid)
    });

    if let Some(pid) = owner {
        let ticks = crate::arch::timer::get_ticks();
        let _ = ipc::notify(pid, Message::irq_notification(irq_line, ticks));
    }
}

#[cfg(target_arch = "x86")]
fn read_cr2() -> u32 {
    // SAFETY: reading CR2 has no side effects and is always valid from
    // exception context.
    unsafe { x86::controlregs::cr2() as u32 }
}

#[cfg(not(target_arch = "x86"))]
fn read_cr2() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;

    #[test]
    fn deliver_to_owner_finds_registered_task() {
        crate::process::table::init();
        let pid = TASK_TABLE
            .with_mut(|table| table.insert(|pid| Pcb::new_kernel_task(pid, "drv", 5, 0, 0, 0)))
            .unwrap();
        TASK_TABLE.with_mut(|table| {
            table.get_mut(pid).unwrap().owned_irq = Some(5);
        });

        deliver_to_owner(5);

        TASK_TABLE.with(|table| {
            let p = table.get(pid).unwrap();
            assert!(p.ipc.pending.is_some() || p.state == crate::process::TaskState::Ready);
        });
    }

    #[test]
    fn deliver_to_owner_with_no_registrant_is_a_no_op() {
        crate::process::table::init();
        // Must not panic when nobody owns the line.
        deliver_to_owner(7);
    }
}
