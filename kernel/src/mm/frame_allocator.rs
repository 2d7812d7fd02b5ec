//! Physical frame allocator (PMM): a single flat bitmap over every 4 KiB
//! frame the machine reports, one bit per frame (1 = owned/reserved, 0 =
//! free). No per-zone splitting (DMA/normal/high), no buddy system, no NUMA
//! node table, and no per-CPU frame cache — the target is a uniprocessor
//! with one flat physical address space, and those designs would all be
//! solving problems this kernel doesn't have.

use spin::Mutex;

use super::{FrameNumber, PhysicalAddress, FRAME_SIZE};
use crate::sync::once_lock::GlobalState;

/// Upper bound on how much physical memory the bitmap can describe: 512 MiB
/// (131072 frames). Comfortably above anything QEMU or real hardware hands
/// this target at boot; `init` clamps `mem_kb` to this if exceeded.
pub const MAX_FRAMES: usize = 128 * 1024;
const BITMAP_WORDS: usize = MAX_FRAMES / 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    OutOfMemory,
    DoubleFree,
    OutOfRange,
}

pub struct FrameAllocator {
    bitmap: alloc::boxed::Box<[u32; BITMAP_WORDS]>,
    total_frames: usize,
    used_frames: usize,
}

impl FrameAllocator {
    fn new() -> Self {
        Self {
            bitmap: alloc::boxed::Box::new([0xFFFF_FFFF; BITMAP_WORDS]),
            total_frames: 0,
            used_frames: 0,
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 32] & (1 << (frame % 32)) != 0
    }

    fn mark_used(&mut self, frame: usize) {
        self.bitmap[frame / 32] |= 1 << (frame % 32);
    }

    fn mark_free(&mut self, frame: usize) {
        self.bitmap[frame / 32] &= !(1 << (frame % 32));
    }

    /// Computes `total_frames` from `mem_kb`, marks every frame reserved,
    /// then frees every frame from `kernel_end` (page-aligned up) to the
    /// end of memory. The allocator never hands out a frame inside the
    /// kernel image.
    fn init(&mut self, mem_kb: u32, kernel_end: PhysicalAddress) {
        let total = (mem_kb as usize * 1024) / FRAME_SIZE;
        self.total_frames = total.min(MAX_FRAMES);

        for word in self.bitmap.iter_mut() {
            *word = 0xFFFF_FFFF;
        }

        let first_free = (kernel_end.align_up(FRAME_SIZE as u32).as_u32() as usize / FRAME_SIZE)
            .min(self.total_frames);
        for frame in first_free..self.total_frames {
            self.mark_free(frame);
        }

        self.used_frames = first_free;
    }

    /// Linear first-fit scan for `count` contiguous free frames, starting
    /// from frame 0 every time. Always returns the lowest-numbered run that
    /// fits, so a frame freed below any previously allocated region is
    /// handed back out before higher frames are touched.
    fn allocate_frames(&mut self, count: usize) -> Result<FrameNumber, FrameAllocatorError> {
        if count == 0 || count > self.total_frames {
            return Err(FrameAllocatorError::OutOfMemory);
        }

        let mut start = 0;
        while start + count <= self.total_frames {
            if (start..start + count).all(|f| !self.is_used(f)) {
                for f in start..start + count {
                    self.mark_used(f);
                }
                self.used_frames += count;
                return Ok(FrameNumber::new(start as u32));
            }
            start += 1;
        }

        Err(FrameAllocatorError::OutOfMemory)
    }

    fn free_frames(&mut self, frame: FrameNumber, count: usize) -> Result<(), FrameAllocatorError> {
        let start = frame.0 as usize;
        if count == 0 || start + count > self.total_frames {
            return Err(FrameAllocatorError::OutOfRange);
        }
        for f in start..start + count {
            if !self.is_used(f) {
                return Err(FrameAllocatorError::DoubleFree);
            }
        }
        for f in start..start + count {
            self.mark_free(f);
        }
        self.used_frames -= count;
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames_count(&self) -> usize {
        self.total_frames - self.used_frames
    }
}

static FRAME_ALLOCATOR_STATE: GlobalState<Mutex<FrameAllocator>> = GlobalState::new();

/// Public handle re-exported by `mm::mod` for call sites that already
/// expect a `FRAME_ALLOCATOR` name from the VMM/RAII guards.
pub struct FrameAllocatorHandle;
pub static FRAME_ALLOCATOR: FrameAllocatorHandle = FrameAllocatorHandle;

impl FrameAllocatorHandle {
    pub fn allocate_frame(&self) -> Result<FrameNumber, FrameAllocatorError> {
        self.allocate_frames(1)
    }

    pub fn allocate_frames(&self, count: usize) -> Result<FrameNumber, FrameAllocatorError> {
        FRAME_ALLOCATOR_STATE
            .with_mut(|lock| lock.lock().allocate_frames(count))
            .unwrap_or(Err(FrameAllocatorError::OutOfMemory))
    }

    pub fn free_frame(&self, frame: FrameNumber) -> Result<(), FrameAllocatorError> {
        self.free_frames(frame, 1)
    }

    pub fn free_frames(&self, frame: FrameNumber, count: usize) -> Result<(), FrameAllocatorError> {
        FRAME_ALLOCATOR_STATE
            .with_mut(|lock| lock.lock().free_frames(frame, count))
            .unwrap_or(Err(FrameAllocatorError::OutOfRange))
    }

    pub fn stats(&self) -> Option<(usize, usize)> {
        FRAME_ALLOCATOR_STATE.with(|lock| {
            let a = lock.lock();
            (a.total_frames(), a.used_frames())
        })
    }
}

/// Initializes the global frame allocator. `kernel_end` is the first
/// physical address past the kernel image (from the linker-provided
/// `__kernel_end` symbol); everything below it is permanently reserved.
pub fn init(mem_kb: u32) {
    let kernel_end = kernel_image_end();
    let mut allocator = FrameAllocator::new();
    allocator.init(mem_kb, kernel_end);
    let _ = FRAME_ALLOCATOR_STATE.init(Mutex::new(allocator));
}

#[cfg(target_arch = "x86")]
fn kernel_image_end() -> PhysicalAddress {
    unsafe extern "C" {
        static __kernel_end: u8;
    }
    // SAFETY: `__kernel_end` is a linker symbol, not a real variable; we
    // only ever take its address, never read through it.
    PhysicalAddress::new(unsafe { core::ptr::addr_of!(__kernel_end) as u32 })
}

#[cfg(not(target_arch = "x86"))]
fn kernel_image_end() -> PhysicalAddress {
    // Host-target unit tests have no linker script; pretend the kernel ends
    // at 2 MiB so bitmap math below it is still exercised.
    PhysicalAddress::new(2 * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_reserves_kernel_image_and_nothing_else() {
        let mut a = FrameAllocator::new();
        a.init(16 * 1024, PhysicalAddress::new(0x10_0000));
        assert_eq!(a.total_frames(), 16 * 1024 * 1024 / FRAME_SIZE);
        assert_eq!(a.used_frames(), 0x10_0000 / FRAME_SIZE);
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut a = FrameAllocator::new();
        a.init(16 * 1024, PhysicalAddress::new(0x10_0000));
        let used_before = a.used_frames();

        let frame = a.allocate_frames(4).unwrap();
        assert_eq!(a.used_frames(), used_before + 4);

        a.free_frames(frame, 4).unwrap();
        assert_eq!(a.used_frames(), used_before);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut a = FrameAllocator::new();
        a.init(16 * 1024, PhysicalAddress::new(0x10_0000));
        let frame = a.allocate_frame().unwrap();
        a.free_frame(frame).unwrap();
        assert_eq!(a.free_frame(frame), Err(FrameAllocatorError::DoubleFree));
    }

    #[test]
    fn exhaustion_returns_out_of_memory() {
        let mut a = FrameAllocator::new();
        a.init(16, PhysicalAddress::new(0)); // 16 KiB = 4 frames
        assert!(a.allocate_frames(4).is_ok());
        assert_eq!(a.allocate_frame(), Err(FrameAllocatorError::OutOfMemory));
    }

    #[test]
    fn never_allocates_inside_kernel_image() {
        let mut a = FrameAllocator::new();
        a.init(16 * 1024, PhysicalAddress::new(0x10_0000));
        let reserved_frames = 0x10_0000 / FRAME_SIZE;
        let frame = a.allocate_frame().unwrap();
        assert!(frame.0 as usize >= reserved_frames);
    }

    #[test]
    fn freeing_a_lower_frame_makes_it_the_next_allocation() {
        let mut a = FrameAllocator::new();
        a.init(16 * 1024, PhysicalAddress::new(0x10_0000));

        let first = a.allocate_frame().unwrap();
        let _second = a.allocate_frame().unwrap();
        a.free_frames(first, 1).unwrap();

        // A strict lowest-bit first-fit must reclaim `first` here. A
        // hint-based scan that resumes past `_second` would instead return
        // a higher, never-before-used frame.
        let third = a.allocate_frame().unwrap();
        assert_eq!(third.0, first.0);
    }
}
