//! No-std test framework for the kernel.
//!
//! Provides testing infrastructure that works in a no_std environment by
//! using serial output and the QEMU isolated debug-exit device to report
//! test results back to the host running the test binary.

use core::panic::PanicInfo;

use crate::{error::KernelError, serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Trait that all testable functions must implement.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

/// Custom test runner for the integration tests under `kernel/tests/`.
#[cfg(test)]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut passed = 0;
    let mut failed = 0;

    for test in tests {
        match test.run() {
            Ok(()) => passed += 1,
            Err(e) => {
                failed += 1;
                serial_println!("[ERROR] Test failed: {}", e);
            }
        }
    }

    serial_println!("\nTest Results: {} passed, {} failed", passed, failed);

    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        exit_qemu(QemuExitCode::Failed);
    }
}

/// Panic handler installed by integration test binaries.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}

/// Exits QEMU via the isolated debug-exit device at I/O port 0xf4, the same
/// device `.cargo/config.toml` configures `bootimage runner` to pass on the
/// QEMU command line (`isa-debug-exit,iobase=0xf4,iosize=0x04`).
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(target_arch = "x86")]
    // SAFETY: writing to port 0xf4 is only meaningful under the
    // `isa-debug-exit` QEMU device this kernel's test runner is launched
    // with; it halts the VM before control ever returns here.
    unsafe {
        crate::arch::x86::port::outl(0xf4, exit_code as u32);
        core::hint::unreachable_unchecked()
    }

    #[cfg(not(target_arch = "x86"))]
    {
        let _ = exit_code;
        loop {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_testable_reports_ok() {
        let t: &dyn Testable = &(|| -> Result<(), KernelError> { Ok(()) });
        assert!(t.run().is_ok());
    }

    #[test]
    fn failing_testable_reports_the_error() {
        let t: &dyn Testable =
            &(|| -> Result<(), KernelError> { Err(KernelError::InvalidState { expected: "a", actual: "b" }) });
        assert!(t.run().is_err());
    }
}
