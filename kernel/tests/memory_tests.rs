//! Frame allocator and heap integration tests.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use veridian_kernel::mm::{self, FrameAllocatorError, FRAME_ALLOCATOR};
use veridian_kernel::serial_println;

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Memory Management Tests");

    // 16 MiB: enough for every test below with room to spare.
    mm::init(16 * 1024).expect("mm::init failed");

    test_single_frame_allocation();
    test_multi_frame_allocation_is_contiguous();
    test_free_then_reallocate_reuses_frames();
    test_double_free_is_rejected();
    test_out_of_memory_is_reported();
    test_heap_alloc_vec_works();

    serial_println!("All tests passed!");
    veridian_kernel::exit_qemu(veridian_kernel::QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::test_panic_handler(info)
}

fn test_single_frame_allocation() {
    let before = FRAME_ALLOCATOR.stats().unwrap();
    let frame = FRAME_ALLOCATOR.allocate_frame().expect("allocation failed");
    let after = FRAME_ALLOCATOR.stats().unwrap();
    assert_eq!(after.1, before.1 + 1);
    FRAME_ALLOCATOR.free_frame(frame).unwrap();
    serial_println!("test_single_frame_allocation... [ok]");
}

fn test_multi_frame_allocation_is_contiguous() {
    let frame = FRAME_ALLOCATOR
        .allocate_frames(8)
        .expect("contiguous allocation failed");
    FRAME_ALLOCATOR.free_frames(frame, 8).unwrap();
    serial_println!("test_multi_frame_allocation_is_contiguous... [ok]");
}

fn test_free_then_reallocate_reuses_frames() {
    let frame = FRAME_ALLOCATOR.allocate_frames(4).unwrap();
    FRAME_ALLOCATOR.free_frames(frame, 4).unwrap();
    let frame2 = FRAME_ALLOCATOR.allocate_frames(4).unwrap();
    assert_eq!(frame.0, frame2.0, "first-fit scan should reuse the freed range");
    FRAME_ALLOCATOR.free_frames(frame2, 4).unwrap();
    serial_println!("test_free_then_reallocate_reuses_frames... [ok]");
}

fn test_double_free_is_rejected() {
    let frame = FRAME_ALLOCATOR.allocate_frame().unwrap();
    FRAME_ALLOCATOR.free_frame(frame).unwrap();
    let err = FRAME_ALLOCATOR.free_frame(frame).unwrap_err();
    assert_eq!(err, FrameAllocatorError::DoubleFree);
    serial_println!("test_double_free_is_rejected... [ok]");
}

fn test_out_of_memory_is_reported() {
    let (total, used) = FRAME_ALLOCATOR.stats().unwrap();
    let remaining = total - used;
    let err = FRAME_ALLOCATOR
        .allocate_frames(remaining + 1)
        .unwrap_err();
    assert_eq!(err, FrameAllocatorError::OutOfMemory);
    serial_println!("test_out_of_memory_is_reported... [ok]");
}

fn test_heap_alloc_vec_works() {
    let mut v = alloc::vec::Vec::new();
    for i in 0..256u32 {
        v.push(i);
    }
    assert_eq!(v.len(), 256);
    assert_eq!(v[255], 255);
    serial_println!("test_heap_alloc_vec_works... [ok]");
}
