//! Kernel heap: a single `linked_list_allocator::LockedHeap` over a static
//! byte array, wired up as the crate's `#[global_allocator]`.
//!
//! No slab allocator, no per-size-class free lists, no per-CPU caches: one
//! CPU, one free list, first-fit. The kernel's own allocations (task-table
//! scratch, kernel task/process stacks, address-space bookkeeping) are
//! small and infrequent enough that first-fit never becomes a bottleneck.

use crate::error::KernelError;

/// 4 MiB is generous for a kernel that allocates page tables, PCB stacks,
/// and bookkeeping `Vec`s but never user-facing heap memory.
const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Brings up the global allocator. Must run once, after the VMM has mapped
/// the kernel's own address space (the heap lives in identity-mapped
/// memory, so paging being enabled doesn't matter, but call order still
/// follows [`super::init`]'s documented sequence).
///
/// On the host test target the system allocator is already active; this is
/// a no-op there.
#[cfg(target_os = "none")]
pub fn init() -> Result<(), KernelError> {
    // SAFETY: runs exactly once from `mm::init`, before any other code
    // touches `HEAP_MEMORY` or allocates from the heap.
    unsafe {
        let start = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        crate::ALLOCATOR.lock().init(start, HEAP_SIZE);
    }
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init() -> Result<(), KernelError> {
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    #[test]
    fn boxed_values_round_trip() {
        let x = Box::new(42);
        assert_eq!(*x, 42);
    }

    #[test]
    fn vec_grows_past_small_size_classes() {
        let mut v = Vec::new();
        for i in 0..1000 {
            v.push(i);
        }
        assert_eq!(v.len(), 1000);
    }
}
