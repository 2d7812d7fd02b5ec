//! Preemptive priority round-robin scheduler.
//!
//! Owns no run queue of its own: the task table *is* the run queue, scanned
//! fresh on every decision. The only scheduler-private state is which PID is
//! current and the preemption-lock counter.
//!
//! A context switch never happens "inside" this module in the sense of
//! assembly that swaps registers -- the only place `esp` actually changes is
//! the epilogue of `common_irq_stub` in [`crate::arch::x86::idt`], which
//! loads whatever value [`on_timer_interrupt`] returns. Everything here
//! either decides that value or parks the current task (`halt` in a loop)
//! until some future timer tick picks it again.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::InterruptFrame;
use crate::error::{KernelError, SchedError};
use crate::mm::vmm;
use crate::process::pcb::{Kind, DEFAULT_QUANTUM_TICKS};
use crate::process::table::{TaskTable, TASK_TABLE};
use crate::process::{Pcb, Pid, TaskState, IDLE_PID};

/// Size of the heap-allocated stack given to a kernel task spawned directly
/// (not ELF-loaded); see [`spawn_kernel_task`].
const KERNEL_TASK_STACK_SIZE: usize = 16 * 1024;

static CURRENT_PID: AtomicU32 = AtomicU32::new(IDLE_PID);
static LOCK_COUNT: AtomicU32 = AtomicU32::new(0);

/// PID of the task the CPU is currently executing on behalf of.
pub fn current_pid() -> Pid {
    CURRENT_PID.load(Ordering::SeqCst)
}

/// Runs `f` with a shared reference to the current task's PCB, if it's still
/// in the table.
pub fn with_current<R>(f: impl FnOnce(&Pcb) -> R) -> Option<R> {
    TASK_TABLE.with(|table| table.get(current_pid()).map(f))
}

/// Runs `f` with a mutable reference to the current task's PCB, if it's
/// still in the table.
pub fn with_current_mut<R>(f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
    TASK_TABLE.with_mut(|table| table.get_mut(current_pid()).map(f))
}

/// Disables preemption. Must be paired with [`unlock`]; nests via the
/// counter, so an IRQ that fires while the count is nonzero just returns 0
/// (no switch) from [`on_timer_interrupt`].
pub fn lock() {
    LOCK_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub fn unlock() {
    LOCK_COUNT.fetch_sub(1, Ordering::SeqCst);
}

fn preemption_disabled() -> bool {
    LOCK_COUNT.load(Ordering::SeqCst) != 0
}

/// Installs the task table and the permanent idle task at PID 0.
pub fn init() {
    crate::process::table::init();
    let _ = TASK_TABLE.insert_idle(|pid| Pcb::new_kernel_task(pid, "idle", u8::MAX, 0, 0, 0));
    TASK_TABLE.with_mut(|table| {
        if let Some(idle) = table.get_mut(IDLE_PID) {
            idle.state = TaskState::Running;
        }
    });
    CURRENT_PID.store(IDLE_PID, Ordering::SeqCst);
}

/// Builds a ring-0 entry frame and registers a new kernel-resident task,
/// backed by a heap-allocated stack rather than a mapped user region.
/// `entry` never returns; tasks built this way end with [`task_exit`].
pub fn spawn_kernel_task(
    name: &str,
    entry: extern "C" fn() -> !,
    priority: u8,
) -> Result<Pid, KernelError> {
    let mut stack = alloc::vec![0u8; KERNEL_TASK_STACK_SIZE].into_boxed_slice();
    let stack_base = stack.as_mut_ptr() as usize;
    let stack_top = stack_base as u32 + KERNEL_TASK_STACK_SIZE as u32;
    // The PCB now owns this allocation; it's reclaimed by `free_terminated`
    // when the task exits.
    core::mem::forget(stack);

    let mut frame = InterruptFrame::blank();
    frame.eip = entry as usize as u32;
    frame.eflags = 0x200; // IF
    #[cfg(target_arch = "x86")]
    {
        frame.cs = crate::arch::x86::gdt::KERNEL_CS as u32;
        frame.ds = crate::arch::x86::gdt::KERNEL_DS as u32;
        frame.es = crate::arch::x86::gdt::KERNEL_DS as u32;
        frame.fs = crate::arch::x86::gdt::KERNEL_DS as u32;
        frame.gs = crate::arch::x86::gdt::KERNEL_DS as u32;
    }

    // SAFETY: `stack_top` is the exclusive top of the region just allocated
    // and leaked above; nothing else can reach it.
    let esp = unsafe { frame.write_to_stack(stack_top) };

    TASK_TABLE.insert(|pid| {
        Pcb::new_kernel_task(pid, name, priority, stack_base, KERNEL_TASK_STACK_SIZE, esp)
    })
}

fn candidate_ok(p: &Pcb, now: u64) -> bool {
    p.active && matches!(p.state, TaskState::Ready | TaskState::Running) && p.is_runnable(now)
}

/// Two-pass priority round robin. Pass one starts one slot past `current`
/// and never considers `current` itself, so a task that just yielded or
/// slept gives every other ready task a turn before it can run again. Pass
/// two falls back to `current` (if it's still runnable) and finally to the
/// idle task.
fn pick_next(table: &TaskTable, current: Pid, now: u64) -> Pid {
    let slots = table.slot_count();
    let start = table.slot_of(current).unwrap_or(0);

    let mut best: Option<(u8, Pid)> = None;
    for step in 1..slots {
        let idx = (start + step) % slots;
        if let Some(p) = table.slot(idx) {
            if candidate_ok(p, now) {
                let better = match best {
                    Some((pr, _)) => p.priority < pr,
                    None => true,
                };
                if better {
                    best = Some((p.priority, p.pid));
                }
            }
        }
    }
    if let Some((_, pid)) = best {
        return pid;
    }

    if let Some(p) = table.slot(start) {
        if p.pid == current && candidate_ok(p, now) {
            return current;
        }
    }

    IDLE_PID
}

/// Called from [`crate::arch::x86::idt`]'s common IRQ handler for IRQ 0.
/// Returns 0 to keep running the current task, or a nonzero stack pointer
/// for the IRQ stub to switch `esp` to.
pub fn on_timer_interrupt(frame: &mut InterruptFrame) -> u32 {
    let now = crate::arch::timer::tick();
    let current = current_pid();

    if preemption_disabled() {
        return 0;
    }

    let mut next = None;

    TASK_TABLE.with_mut(|table| {
        for p in table.iter_mut() {
            if p.state == TaskState::Sleeping && p.wake_tick <= now {
                p.state = TaskState::Ready;
            }
        }

        let must_switch = match table.get_mut(current) {
            Some(cur) => {
                cur.context = frame as *const InterruptFrame as u32;
                match cur.state {
                    TaskState::Terminated
                    | TaskState::Sleeping
                    | TaskState::Blocked
                    | TaskState::Ready => true,
                    TaskState::Running => {
                        cur.ticks_remaining = cur.ticks_remaining.saturating_sub(1);
                        cur.ticks_remaining == 0
                    }
                }
            }
            None => true,
        };

        if must_switch {
            next = Some(pick_next(table, current, now));
        }
    });

    let Some(next) = next else {
        return 0;
    };

    if next == current {
        // Nothing else is runnable; keep going with a fresh quantum.
        TASK_TABLE.with_mut(|table| {
            if let Some(cur) = table.get_mut(current) {
                cur.ticks_remaining = DEFAULT_QUANTUM_TICKS;
            }
        });
        return 0;
    }

    switch_to(current, next)
}

/// Performs the actual handover from `old` to `new`: updates task states,
/// publishes `new` as current, switches CR3/TSS, and reclaims `old`'s
/// resources if it had terminated. Returns `new`'s saved stack pointer.
fn switch_to(old: Pid, new: Pid) -> u32 {
    let mut new_esp = 0u32;
    let mut old_terminated = false;

    TASK_TABLE.with_mut(|table| {
        if let Some(o) = table.get_mut(old) {
            old_terminated = o.state == TaskState::Terminated;
            if o.state == TaskState::Running {
                o.state = TaskState::Ready;
            }
        }
        if let Some(n) = table.get_mut(new) {
            n.state = TaskState::Running;
            n.ticks_remaining = DEFAULT_QUANTUM_TICKS;
            new_esp = n.context;
        }
    });

    CURRENT_PID.store(new, Ordering::SeqCst);
    apply_task_context(new);

    if old_terminated {
        if let Some(pcb) = TASK_TABLE.with_mut(|table| table.remove(old)) {
            // SAFETY: see the module doc comment. `old` never runs again;
            // we've already captured `new_esp` and switched CR3/TSS away
            // from it above, so nothing after this point reads its stack
            // or address space.
            free_terminated(pcb);
        }
    }

    new_esp
}

#[cfg(target_arch = "x86")]
fn apply_task_context(pid: Pid) {
    TASK_TABLE.with(|table| {
        if let Some(p) = table.get(pid) {
            match &p.kind {
                Kind::KernelTask { .. } => {
                    let _ = vmm::switch(None);
                }
                Kind::IsolatedProcess { space, .. } => {
                    let _ = vmm::switch(Some(space));
                    if let Some(esp0) = p.kernel_stack_top() {
                        // SAFETY: boot-time-installed TSS, single CPU.
                        unsafe {
                            crate::arch::x86::tss::tss().set_kernel_stack(esp0);
                        }
                    }
                }
            }
        }
    });
}

#[cfg(not(target_arch = "x86"))]
fn apply_task_context(pid: Pid) {
    TASK_TABLE.with(|table| {
        if let Some(p) = table.get(pid) {
            let _ = match &p.kind {
                Kind::KernelTask { .. } => vmm::switch(None),
                Kind::IsolatedProcess { space, .. } => vmm::switch(Some(space)),
            };
        }
    });
}

fn free_terminated(pcb: Pcb) {
    match pcb.kind {
        Kind::KernelTask {
            stack_base,
            stack_size,
        } => free_heap_stack(stack_base, stack_size),
        Kind::IsolatedProcess {
            space,
            kernel_stack_base,
            kernel_stack_size,
            ..
        } => {
            vmm::destroy_address_space(space);
            free_heap_stack(kernel_stack_base, kernel_stack_size);
        }
    }
}

fn free_heap_stack(base: usize, size: usize) {
    if size == 0 {
        return;
    }
    // SAFETY: `base`/`size` describe exactly the boxed-slice allocation
    // `spawn_kernel_task`/the ELF loader leaked when the task was created;
    // the task has just been removed from the table and cannot be
    // referenced again.
    unsafe {
        drop(alloc::vec::Vec::from_raw_parts(base as *mut u8, 0, size));
    }
}

/// Parks the current task by halting with interrupts enabled until some
/// future timer tick resumes it and `should_resume` holds. Execution
/// resumes exactly after the `halt()` call below, because that's where the
/// saved `eip` in this task's context points.
fn park_until(should_resume: impl Fn(&Pcb) -> bool) {
    loop {
        // SAFETY: re-enables interrupts so the timer IRQ that performs the
        // actual switch-away (and, later, switch-back) can run.
        unsafe {
            crate::arch::enable_interrupts();
        }
        crate::arch::halt();
        let resume = with_current(&should_resume).unwrap_or(true);
        if resume {
            break;
        }
    }
}

/// Used by the IPC primitives after marking the current task `Blocked` (or
/// leaving it `Sleeping`/mid-rendezvous) to wait for the next rendezvous or
/// timer tick to make it `Running` again.
pub fn block_until_ready() {
    park_until(|p| p.state == TaskState::Running);
}

/// Gives up the rest of the current quantum voluntarily.
pub fn task_yield() {
    with_current_mut(|cur| cur.state = TaskState::Ready);
    park_until(|p| p.state == TaskState::Running);
}

/// Sleeps for at least `ms` milliseconds.
pub fn task_sleep(ms: u32) {
    let ticks_per_sec = crate::arch::timer::ticks_per_second() as u64;
    let wake = crate::arch::timer::get_ticks() + (ms as u64 * ticks_per_sec) / 1000;
    with_current_mut(|cur| {
        cur.state = TaskState::Sleeping;
        cur.wake_tick = wake;
    });
    park_until(|p| p.state == TaskState::Running);
}

/// Terminates the current task and never returns. Resources are reclaimed
/// by the next task switch (see `switch_to`), not here -- this task is still
/// executing on its own soon-to-be-freed kernel stack.
pub fn task_exit(code: i32) -> ! {
    with_current_mut(|cur| {
        cur.state = TaskState::Terminated;
        cur.exit_code = code;
    });
    halt_forever()
}

/// Kills the current task in response to an unrecoverable synchronous fault
/// (currently just user-mode page faults; see
/// [`crate::mm::vmm::page_fault_handler`]). Unlike the IRQ path, a CPU
/// exception handler has no way to switch stacks itself -- it just marks
/// the task dead and halts, relying on a *nested* timer interrupt (we've
/// re-enabled IF) to notice and switch away through the normal IRQ-return
/// mechanism, abandoning this call frame for good.
pub fn kill_current(err: KernelError) -> ! {
    let pid = current_pid();
    log::warn!("killing task {pid}: {err}");
    with_current_mut(|cur| {
        cur.state = TaskState::Terminated;
        cur.exit_code = -1;
    });
    halt_forever()
}

/// Kills a task other than the caller. Takes effect on that task's next
/// scheduling decision; does not force an immediate switch since it isn't
/// the one currently running.
///
/// A target that isn't the currently-running task is detached from
/// [`TASK_TABLE`] and torn down (kernel stack freed, address space
/// destroyed) immediately -- `switch_to` only ever reaps `old`, so a task
/// killed while `Ready`/`Blocked`/`Sleeping` would otherwise never become
/// `old` and its slot would leak forever. The one task that can't be torn
/// down here is the caller itself (`pid == current_pid()`): it's still
/// executing on the stack this would free, so it's left `Terminated` in
/// the table for `switch_to` to reap once a future tick switches away from
/// it.
pub fn task_kill(pid: Pid) -> Result<(), KernelError> {
    if pid == IDLE_PID {
        return Err(SchedError::TaskNotFound { pid }.into());
    }

    if pid == current_pid() {
        let found = with_current_mut(|cur| cur.state = TaskState::Terminated).is_some();
        return if found {
            Ok(())
        } else {
            Err(SchedError::TaskNotFound { pid }.into())
        };
    }

    match TASK_TABLE.with_mut(|table| table.remove(pid)) {
        Some(pcb) => {
            free_terminated(pcb);
            Ok(())
        }
        None => Err(SchedError::TaskNotFound { pid }.into()),
    }
}

fn halt_forever() -> ! {
    loop {
        // SAFETY: fine to re-enable repeatedly; this task never runs again.
        unsafe {
            crate::arch::enable_interrupts();
        }
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;

    fn fresh_table() -> TaskTable {
        TaskTable::new()
    }

    #[test]
    fn pick_next_skips_current_in_first_pass() {
        let mut table = fresh_table();
        let a = table
            .insert(|pid| Pcb::new_kernel_task(pid, "a", 1, 0, 0, 0))
            .unwrap();
        let b = table
            .insert(|pid| Pcb::new_kernel_task(pid, "b", 1, 0, 0, 0))
            .unwrap();
        table.get_mut(a).unwrap().state = TaskState::Running;

        let next = pick_next(&table, a, 0);
        assert_eq!(next, b);
    }

    #[test]
    fn pick_next_prefers_lowest_priority() {
        let mut table = fresh_table();
        let high = table
            .insert(|pid| Pcb::new_kernel_task(pid, "high", 1, 0, 0, 0))
            .unwrap();
        let low = table
            .insert(|pid| Pcb::new_kernel_task(pid, "low", 9, 0, 0, 0))
            .unwrap();
        let current = table
            .insert(|pid| Pcb::new_kernel_task(pid, "cur", 5, 0, 0, 0))
            .unwrap();
        table.get_mut(current).unwrap().state = TaskState::Running;

        let next = pick_next(&table, current, 0);
        assert_eq!(next, high);
        let _ = low;
    }

    #[test]
    fn pick_next_falls_back_to_idle_when_nothing_runnable() {
        let mut table = fresh_table();
        table
            .insert_idle(|pid| Pcb::new_kernel_task(pid, "idle", u8::MAX, 0, 0, 0))
            .unwrap();
        let current = table
            .insert(|pid| Pcb::new_kernel_task(pid, "cur", 5, 0, 0, 0))
            .unwrap();
        table.get_mut(current).unwrap().state = TaskState::Blocked;

        let next = pick_next(&table, current, 0);
        assert_eq!(next, IDLE_PID);
    }

    #[test]
    fn pick_next_keeps_current_when_only_runnable_one() {
        let mut table = fresh_table();
        table
            .insert_idle(|pid| Pcb::new_kernel_task(pid, "idle", u8::MAX, 0, 0, 0))
            .unwrap();
        let current = table
            .insert(|pid| Pcb::new_kernel_task(pid, "cur", 5, 0, 0, 0))
            .unwrap();
        table.get_mut(current).unwrap().state = TaskState::Running;

        let next = pick_next(&table, current, 0);
        assert_eq!(next, current);
    }
}
