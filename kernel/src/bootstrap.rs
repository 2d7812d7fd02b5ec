//! Arch-independent boot sequence.
//!
//! [`crate::arch::x86::boot::boot_entry`] calls [`kernel_main`] exactly
//! once, with interrupts and paging both off and a single boot-time stack
//! in `crate::arch::x86::boot::BOOT_STACK`. Everything from here down runs
//! with a single logical CPU and no concurrent access to any of the
//! subsystems being brought up.
//!
//! Initialization order follows the core's boot contract: interrupt
//! plumbing, then the frame allocator and address spaces, then the
//! scheduler (kernel-task stacks come off the heap, which needs the frame
//! allocator already up), then IPC, then the log facade. The last step
//! hands off to [`system_init`], a placeholder for the servers a real
//! deployment would spawn here -- out of scope for this core.

use crate::{mm, process, sched};

/// Runs the boot sequence and never returns. `mem_kb` is the total usable
/// memory in kilobytes, as read out of the Multiboot info block by the
/// arch-specific entry point.
pub fn kernel_main(mem_kb: u32) -> ! {
    #[cfg(target_arch = "x86")]
    // SAFETY: called exactly once, here, before interrupts are enabled and
    // before any other code touches the GDT/IDT/PIC/PIT.
    unsafe {
        crate::arch::x86::init();
    }

    crate::log_service::log_init();
    crate::log_service::install_log_facade();
    log::info!("booting: {} KiB usable memory reported by the loader", mem_kb);

    if let Err(e) = mm::init(mem_kb) {
        panic!("memory subsystem init failed: {}", e);
    }

    sched::init();
    crate::ipc::init();
    log::info!("scheduler and IPC registry online");

    // SAFETY: the idle task installed by `sched::init` has a valid context
    // to resume into, and nothing has touched `esp0` yet -- there is
    // nothing for the first timer tick to race against.
    unsafe {
        crate::arch::enable_interrupts();
    }

    system_init()
}

/// Hand-off point for whatever spawns the system's actual servers -- driver
/// tasks, the console, a shell. Out of scope for this core; what remains is
/// an idle loop that lets the scheduler's timer-driven preemption run
/// whatever kernel tasks exist (today, just the idle task installed by
/// [`sched::init`]).
fn system_init() -> ! {
    let tasks = process::table::TASK_TABLE.with(|t| t.iter().count()).unwrap_or(0);
    log::info!("system_init: handing off with {} task(s) registered", tasks);
    loop {
        crate::arch::halt();
    }
}
