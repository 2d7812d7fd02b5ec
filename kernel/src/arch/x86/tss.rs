//! 32-bit Task State Segment.
//!
//! We never use the CPU's hardware task-switch feature; the only fields
//! that matter are `ss0`/`esp0`, which the CPU loads automatically whenever
//! an interrupt or `int` raises privilege from ring 3 to ring 0. The
//! scheduler rewrites `esp0` on every context switch to point at the top of
//! the incoming task's kernel stack, so the *next* ring-3 -> ring-0
//! transition lands on the right stack.
//!
//! `iomap_base` is set to the structure's own size, placing the I/O
//! permission bitmap entirely outside the TSS limit. That denies ring-3
//! `in`/`out` unless a process's EFLAGS carries `IOPL=3` (granted at ELF
//! load time for processes that need raw port access); we never build a
//! bitmap.

use core::mem::size_of;

use crate::arch::x86::gdt::KERNEL_DS;

#[repr(C, packed)]
pub struct Tss {
    prev_task: u16,
    reserved0: u16,
    pub esp0: u32,
    pub ss0: u16,
    reserved1: u16,
    esp1: u32,
    ss1: u16,
    reserved2: u16,
    esp2: u32,
    ss2: u16,
    reserved3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    reserved4: u16,
    cs: u16,
    reserved5: u16,
    ss: u16,
    reserved6: u16,
    ds: u16,
    reserved7: u16,
    fs: u16,
    reserved8: u16,
    gs: u16,
    reserved9: u16,
    ldt: u16,
    reserved10: u16,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Tss {
            prev_task: 0,
            reserved0: 0,
            esp0: 0,
            ss0: KERNEL_DS,
            reserved1: 0,
            esp1: 0,
            ss1: 0,
            reserved2: 0,
            esp2: 0,
            ss2: 0,
            reserved3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            reserved4: 0,
            cs: 0,
            reserved5: 0,
            ss: 0,
            reserved6: 0,
            ds: 0,
            reserved7: 0,
            fs: 0,
            reserved8: 0,
            gs: 0,
            reserved9: 0,
            ldt: 0,
            reserved10: 0,
            trap: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }

    /// Rewrites the ring-0 stack pointer used on the next privilege-raising
    /// interrupt. Called by the scheduler on every context switch.
    pub fn set_kernel_stack(&mut self, esp0: u32) {
        self.esp0 = esp0;
    }
}

impl Default for Tss {
    fn default() -> Self {
        Self::new()
    }
}

static mut TSS: Tss = Tss::new();

/// Returns the single process-wide TSS instance, initializing its `ss0`
/// field (already done at compile time by [`Tss::new`]).
///
/// # Safety
/// Must only be called after [`crate::arch::x86::gdt::init`] has installed
/// the TSS descriptor; the returned reference is `'static` and aliases a
/// single global, so callers must not hold overlapping mutable borrows.
pub unsafe fn tss() -> &'static mut Tss {
    // SAFETY: single-core kernel; the only writer is the scheduler's
    // context-switch path, which runs with interrupts disabled.
    unsafe { &mut *core::ptr::addr_of_mut!(TSS) }
}
