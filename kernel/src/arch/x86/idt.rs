//! Interrupt Descriptor Table: 256 gate descriptors covering the 32 CPU
//! exception vectors, the 16 hardware IRQ lines remapped behind them
//! (vectors 32-47, see [`super::pic`]), and the `int 0x80` syscall gate.
//!
//! Every vector has its own tiny naked stub (so the CPU-pushed error code,
//! present on only some exceptions, lines up the stack the same way for
//! every vector) that pushes a vector number and falls through to one of
//! two shared handlers. Exceptions and syscalls never need to switch
//! stacks on return, so they share `common_exception_stub`; only the timer
//! IRQ can hand control to a different task, so `common_irq_stub` checks
//! the Rust handler's return value and optionally loads a new `esp` before
//! `iretd`.

use core::arch::naked_asm;
use core::mem::size_of;

use crate::arch::x86::context::InterruptFrame;
use crate::arch::x86::gdt::KERNEL_CS;

pub const SYSCALL_VECTOR: u32 = 0x80;
const IDT_ENTRIES: usize = 256;

const GATE_INTERRUPT_RING0: u8 = 0x8E;
const GATE_INTERRUPT_RING3: u8 = 0xEE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: usize, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CS,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtDescriptor {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

macro_rules! isr_no_err {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            naked_asm!("push 0", concat!("push ", $vector), "jmp {}", sym common_exception_stub)
        }
    };
}

macro_rules! isr_err {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            naked_asm!(concat!("push ", $vector), "jmp {}", sym common_exception_stub)
        }
    };
}

macro_rules! irq_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            naked_asm!("push 0", concat!("push ", $vector), "jmp {}", sym common_irq_stub)
        }
    };
}

isr_no_err!(isr0, 0); // #DE divide error
isr_no_err!(isr1, 1); // #DB debug
isr_no_err!(isr2, 2); // NMI
isr_no_err!(isr3, 3); // #BP breakpoint
isr_no_err!(isr4, 4); // #OF overflow
isr_no_err!(isr5, 5); // #BR bound range
isr_no_err!(isr6, 6); // #UD invalid opcode
isr_no_err!(isr7, 7); // #NM device not available
isr_err!(isr8, 8); // #DF double fault
isr_no_err!(isr9, 9); // coprocessor segment overrun (reserved)
isr_err!(isr10, 10); // #TS invalid TSS
isr_err!(isr11, 11); // #NP segment not present
isr_err!(isr12, 12); // #SS stack-segment fault
isr_err!(isr13, 13); // #GP general protection fault
isr_err!(isr14, 14); // #PF page fault
isr_no_err!(isr15, 15); // reserved
isr_no_err!(isr16, 16); // #MF x87 fp exception
isr_err!(isr17, 17); // #AC alignment check
isr_no_err!(isr18, 18); // #MC machine check
isr_no_err!(isr19, 19); // #XM simd fp exception
isr_no_err!(isr20, 20); // #VE virtualization exception
isr_err!(isr21, 21); // #CP control protection
isr_no_err!(isr22, 22);
isr_no_err!(isr23, 23);
isr_no_err!(isr24, 24);
isr_no_err!(isr25, 25);
isr_no_err!(isr26, 26);
isr_no_err!(isr27, 27);
isr_no_err!(isr28, 28);
isr_no_err!(isr29, 29);
isr_err!(isr30, 30); // #SX security exception
isr_no_err!(isr31, 31);

irq_stub!(irq0, 32); // PIT timer
irq_stub!(irq1, 33); // keyboard
irq_stub!(irq2, 34); // cascade
irq_stub!(irq3, 35);
irq_stub!(irq4, 36);
irq_stub!(irq5, 37);
irq_stub!(irq6, 38);
irq_stub!(irq7, 39);
irq_stub!(irq8, 40);
irq_stub!(irq9, 41);
irq_stub!(irq10, 42);
irq_stub!(irq11, 43);
irq_stub!(irq12, 44);
irq_stub!(irq13, 45);
irq_stub!(irq14, 46);
irq_stub!(irq15, 47);

isr_no_err!(isr_syscall, 0x80);

#[unsafe(naked)]
unsafe extern "C" fn common_exception_stub() -> ! {
    naked_asm!(
        "pusha",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push esp",
        "call {handler}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8", // discard vector + error_code
        "iretd",
        handler = sym common_exception_handler,
    )
}

#[unsafe(naked)]
unsafe extern "C" fn common_irq_stub() -> ! {
    naked_asm!(
        "pusha",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push esp",
        "call {handler}",
        "add esp, 4",
        "test eax, eax",
        "jz 2f",
        "mov esp, eax",
        "2:",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8",
        "iretd",
        handler = sym common_irq_handler,
    )
}

unsafe extern "C" fn common_exception_handler(frame: *mut InterruptFrame) {
    // SAFETY: `frame` is the address the corresponding stub just pushed
    // `esp` from; it stays valid for the duration of this call.
    let frame = unsafe { &mut *frame };
    if frame.vector == SYSCALL_VECTOR {
        crate::syscall::dispatch(frame);
    } else {
        crate::irq::handle_exception(frame);
    }
}

unsafe extern "C" fn common_irq_handler(frame: *mut InterruptFrame) -> u32 {
    // SAFETY: same as `common_exception_handler`.
    let frame = unsafe { &mut *frame };
    let irq_line = frame.vector - 32;
    crate::irq::handle_irq(irq_line, frame)
}

/// Builds the IDT and loads it.
///
/// # Safety
/// Must run once, after [`super::gdt::init`] (gate descriptors reference
/// [`KERNEL_CS`]) and before interrupts are enabled.
pub unsafe fn init() {
    macro_rules! set_exception {
        ($vector:expr, $stub:expr) => {
            // SAFETY: single-threaded boot-time initialization.
            unsafe {
                IDT[$vector] = IdtEntry::new($stub as usize, GATE_INTERRUPT_RING0);
            }
        };
    }
    macro_rules! set_irq {
        ($vector:expr, $stub:expr) => {
            // SAFETY: single-threaded boot-time initialization.
            unsafe {
                IDT[$vector] = IdtEntry::new($stub as usize, GATE_INTERRUPT_RING0);
            }
        };
    }

    set_exception!(0, isr0);
    set_exception!(1, isr1);
    set_exception!(2, isr2);
    set_exception!(3, isr3);
    set_exception!(4, isr4);
    set_exception!(5, isr5);
    set_exception!(6, isr6);
    set_exception!(7, isr7);
    set_exception!(8, isr8);
    set_exception!(9, isr9);
    set_exception!(10, isr10);
    set_exception!(11, isr11);
    set_exception!(12, isr12);
    set_exception!(13, isr13);
    set_exception!(14, isr14);
    set_exception!(15, isr15);
    set_exception!(16, isr16);
    set_exception!(17, isr17);
    set_exception!(18, isr18);
    set_exception!(19, isr19);
    set_exception!(20, isr20);
    set_exception!(21, isr21);
    set_exception!(22, isr22);
    set_exception!(23, isr23);
    set_exception!(24, isr24);
    set_exception!(25, isr25);
    set_exception!(26, isr26);
    set_exception!(27, isr27);
    set_exception!(28, isr28);
    set_exception!(29, isr29);
    set_exception!(30, isr30);
    set_exception!(31, isr31);

    set_irq!(32, irq0);
    set_irq!(33, irq1);
    set_irq!(34, irq2);
    set_irq!(35, irq3);
    set_irq!(36, irq4);
    set_irq!(37, irq5);
    set_irq!(38, irq6);
    set_irq!(39, irq7);
    set_irq!(40, irq8);
    set_irq!(41, irq9);
    set_irq!(42, irq10);
    set_irq!(43, irq11);
    set_irq!(44, irq12);
    set_irq!(45, irq13);
    set_irq!(46, irq14);
    set_irq!(47, irq15);

    // SAFETY: single-threaded boot-time initialization. DPL 3 so `int 0x80`
    // from ring 3 doesn't fault with #GP before it even reaches our code.
    unsafe {
        IDT[SYSCALL_VECTOR as usize] = IdtEntry::new(isr_syscall as usize, GATE_INTERRUPT_RING3);
    }

    let descriptor = IdtDescriptor {
        limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u32,
    };

    // SAFETY: descriptor points at the static IDT populated above.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &descriptor, options(nostack, preserves_flags));
    }
}
