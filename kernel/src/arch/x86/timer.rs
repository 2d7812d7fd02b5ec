//! Programmable Interval Timer (8253/8254), channel 0, wired to IRQ0.
//!
//! Drives the scheduler's preemption tick and the sleep/wake tick counter
//! described by the scheduling component. We run it at a fixed 100 Hz;
//! nothing in the kernel needs a configurable rate.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::port::outb;

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const TIMER_HZ: u32 = 100;
const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_CMD_CHANNEL0_MODE3_BINARY: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Programs PIT channel 0 for a 100 Hz square wave on IRQ0.
///
/// # Safety
/// Must run once, early in boot, before IRQ0 is unmasked.
pub unsafe fn init() {
    let divisor = (PIT_FREQUENCY_HZ / TIMER_HZ) as u16;
    // SAFETY: standard PIT programming sequence: command byte, then the
    // divisor's low then high byte on the channel 0 data port.
    unsafe {
        outb(PIT_COMMAND, PIT_CMD_CHANNEL0_MODE3_BINARY);
        outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
    }
}

/// Called from the IRQ0 handler once per tick, before EOI.
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

pub fn get_timestamp_ms() -> u64 {
    get_ticks() * 1000 / TIMER_HZ as u64
}

pub const fn ticks_per_second() -> u32 {
    TIMER_HZ
}
