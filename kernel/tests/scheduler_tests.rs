//! Scheduler bring-up and task-spawning tests.
//!
//! These run without enabling interrupts, so nothing here exercises actual
//! preemption (`on_timer_interrupt`) -- that needs a running PIT tick and is
//! covered by manual QEMU runs, not this harness. What's tested is the data
//! the scheduler hands the timer path: task table state after `init` and
//! after spawning.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use veridian_kernel::process::table::TASK_TABLE;
use veridian_kernel::process::{TaskState, IDLE_PID};
use veridian_kernel::sched;
use veridian_kernel::serial_println;

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Scheduler Tests");

    sched::init();

    test_init_installs_running_idle_task();
    test_spawn_kernel_task_is_ready();
    test_lower_priority_value_means_higher_priority();
    test_task_kill_removes_candidate_from_scheduling();

    serial_println!("All tests passed!");
    veridian_kernel::exit_qemu(veridian_kernel::QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::test_panic_handler(info)
}

extern "C" fn dummy_entry() -> ! {
    loop {
        veridian_kernel::arch::halt();
    }
}

fn test_init_installs_running_idle_task() {
    assert_eq!(sched::current_pid(), IDLE_PID);
    TASK_TABLE.with(|table| {
        let idle = table.get(IDLE_PID).expect("idle task must exist after sched::init");
        assert_eq!(idle.state, TaskState::Running);
        assert_eq!(idle.priority, u8::MAX);
    });
    serial_println!("test_init_installs_running_idle_task... [ok]");
}

fn test_spawn_kernel_task_is_ready() {
    let pid = sched::spawn_kernel_task("worker", dummy_entry, 10).unwrap();
    TASK_TABLE.with(|table| {
        let pcb = table.get(pid).unwrap();
        assert_eq!(pcb.state, TaskState::Ready);
        assert_eq!(pcb.priority, 10);
        assert_eq!(pcb.name_str(), "worker");
    });
    sched::task_kill(pid).unwrap();
    serial_println!("test_spawn_kernel_task_is_ready... [ok]");
}

fn test_lower_priority_value_means_higher_priority() {
    let high = sched::spawn_kernel_task("high", dummy_entry, 1).unwrap();
    let low = sched::spawn_kernel_task("low", dummy_entry, 200).unwrap();

    TASK_TABLE.with(|table| {
        let high_pcb = table.get(high).unwrap();
        let low_pcb = table.get(low).unwrap();
        assert!(high_pcb.priority < low_pcb.priority);
    });

    sched::task_kill(high).unwrap();
    sched::task_kill(low).unwrap();
    serial_println!("test_lower_priority_value_means_higher_priority... [ok]");
}

fn test_task_kill_removes_candidate_from_scheduling() {
    let pid = sched::spawn_kernel_task("to-kill", dummy_entry, 5).unwrap();
    sched::task_kill(pid).unwrap();

    // Killing a task that isn't the one currently running must free its
    // slot immediately, not just mark it `Terminated` -- otherwise it can
    // never become `old` in `switch_to` and the slot leaks forever.
    TASK_TABLE.with(|table| {
        assert!(table.get(pid).is_none(), "killed task's slot must be freed, not merely marked Terminated");
    });

    // The freed slot must be reusable by a later spawn.
    let reused = sched::spawn_kernel_task("reuses-slot", dummy_entry, 5).unwrap();
    TASK_TABLE.with(|table| {
        assert_eq!(table.get(reused).unwrap().state, TaskState::Ready);
    });
    sched::task_kill(reused).unwrap();

    // Killing the idle task is rejected -- it's the scheduler's fallback
    // and must always remain a valid candidate.
    assert!(sched::task_kill(IDLE_PID).is_err());
    serial_println!("test_task_kill_removes_candidate_from_scheduling... [ok]");
}
