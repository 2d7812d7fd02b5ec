//! Memory barrier helpers shared by `cfg(test)`-only host builds and the
//! real x86 target. x86's strongly-ordered memory model means a sequential
//! consistency fence covers both [`memory_fence`] and [`data_sync_barrier`];
//! [`instruction_sync_barrier`] is a no-op because no code here ever
//! generates self-modifying instruction pages.

use core::sync::atomic::{fence, Ordering};

#[inline(always)]
pub fn memory_fence() {
    fence(Ordering::SeqCst);
}

#[inline(always)]
pub fn data_sync_barrier() {
    fence(Ordering::SeqCst);
}

#[inline(always)]
pub fn instruction_sync_barrier() {}
