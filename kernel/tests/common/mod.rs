//! Shared helpers for the integration test binaries under `kernel/tests/`.
//!
//! Each binary is its own `no_std`/`no_main` crate linked against
//! `veridian_kernel`, so this module is `include!`d (or declared as `mod
//! common;`) from each one rather than compiled as a library itself.

#![allow(dead_code)]

use veridian_kernel::serial_println;

/// Announces the start of a test suite on the serial console.
pub fn init_test_env(subsystem: &str) {
    serial_println!("\n=== {} Test Suite ===", subsystem);
}

#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => {
                veridian_kernel::serial_println!("Assertion failed: {:?} is not Ok", e);
                panic!("Expected Ok, got Err");
            }
        }
    };
}

#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(_) => {
                veridian_kernel::serial_println!("Assertion failed: result is Ok");
                panic!("Expected Err, got Ok");
            }
            Err(e) => e,
        }
    };
}
