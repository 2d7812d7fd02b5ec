//! Binary entry point. All real module structure lives in the library
//! crate (`lib.rs`); this file only wires the Multiboot-provided `_start`
//! (declared in `veridian_kernel::arch::x86::boot`) to a panic handler,
//! since a `#![no_std]` binary has to provide one of its own.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use veridian_kernel::serial_println;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    serial_println!("[KERNEL PANIC] {}", info);
    loop {
        veridian_kernel::arch::halt();
    }
}
