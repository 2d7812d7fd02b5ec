//! 32-bit x86 protected-mode architecture support: GDT/TSS, IDT, the 8259
//! PIC pair, the PIT tick source, and the register-frame shape interrupt
//! handlers operate on.

pub mod boot;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod port;
pub mod timer;
pub mod tss;

pub use context::InterruptFrame;

/// Brings up segmentation, interrupt handling, and the timer. Leaves
/// interrupts masked at the CPU (`sti` not yet executed) so the caller can
/// finish building the first task before anything can preempt it.
///
/// # Safety
/// Must run exactly once, early in [`crate::bootstrap::kernel_main`].
pub unsafe fn init() {
    // SAFETY: boot-time, single-threaded, interrupts not yet enabled.
    unsafe {
        gdt::init(tss::tss());
        idt::init();
        pic::init();
        timer::init();

        // Every hardware line starts masked out of `pic::init`; unmask only
        // the ones the kernel core itself drives. Device-owned lines are
        // unmasked when a process registers as their owner.
        pic::clear_mask(0); // PIT
    }
}

/// Enables maskable interrupts.
///
/// # Safety
/// Must only be called once the current task's kernel stack and the first
/// scheduled task are both ready to be preempted into.
pub unsafe fn enable_interrupts() {
    // SAFETY: caller's responsibility per the function's contract.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Disables maskable interrupts, returning whether they were enabled.
pub fn disable_interrupts() -> bool {
    let flags: u32;
    // SAFETY: `pushfd`/`cli` never touch memory beyond the stack slot the
    // compiler already reserves for `flags`.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {0}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags),
        );
    }
    flags & (1 << 9) != 0
}

/// Restores the interrupt flag to `enabled` (as previously returned by
/// [`disable_interrupts`]).
pub fn restore_interrupts(enabled: bool) {
    if enabled {
        // SAFETY: re-enabling interrupts is always sound; the caller
        // determined via `disable_interrupts` that they were on before.
        unsafe { enable_interrupts() };
    }
}

/// Halts the CPU until the next interrupt.
pub fn halt() {
    // SAFETY: `hlt` has no side effects beyond pausing the CPU.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}
