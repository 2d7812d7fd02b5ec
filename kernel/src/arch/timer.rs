//! Thin timer facade so arch-agnostic code (the scheduler, `log_service`)
//! doesn't need `cfg(target_arch)` blocks of its own. On the real target
//! this forwards straight to the PIT-backed counter in [`super::x86::timer`].
//! On the host target (used for `cargo test` unit tests, where there's no
//! PIT to program) it falls back to a free-running atomic counter advanced
//! only by whatever test code chooses to call [`tick`] directly.

#[cfg(target_arch = "x86")]
pub fn get_ticks() -> u64 {
    super::x86::timer::get_ticks()
}

#[cfg(target_arch = "x86")]
pub fn get_timestamp_ms() -> u64 {
    super::x86::timer::get_timestamp_ms()
}

#[cfg(target_arch = "x86")]
pub fn ticks_per_second() -> u32 {
    super::x86::timer::ticks_per_second()
}

#[cfg(target_arch = "x86")]
pub fn tick() -> u64 {
    super::x86::timer::tick()
}

#[cfg(not(target_arch = "x86"))]
mod host {
    use core::sync::atomic::{AtomicU64, Ordering};
    pub static TICKS: AtomicU64 = AtomicU64::new(0);
}

#[cfg(not(target_arch = "x86"))]
pub fn get_ticks() -> u64 {
    host::TICKS.load(core::sync::atomic::Ordering::SeqCst)
}

#[cfg(not(target_arch = "x86"))]
pub fn get_timestamp_ms() -> u64 {
    get_ticks() * 10
}

#[cfg(not(target_arch = "x86"))]
pub const fn ticks_per_second() -> u32 {
    100
}

#[cfg(not(target_arch = "x86"))]
pub fn tick() -> u64 {
    host::TICKS.fetch_add(1, core::sync::atomic::Ordering::SeqCst) + 1
}
