//! Multiboot entry point.
//!
//! GRUB (or any Multiboot-compliant loader) loads the kernel ELF, switches
//! the CPU to 32-bit protected mode with paging disabled, and jumps to
//! `_start` with `eax` holding the Multiboot magic and `ebx` a pointer to
//! the `multiboot_info` structure. We only read the `mem_upper` field out of
//! that structure; everything else (modules, framebuffer, memory map) is the
//! boot-time collaborator's concern, not the kernel's.

use core::arch::naked_asm;

const MULTIBOOT_MAGIC: u32 = 0x1BADB002;
const MULTIBOOT_FLAGS: u32 = 0x0000_0003; // align modules on page boundaries, provide mem_* fields
const MULTIBOOT_CHECKSUM: u32 = (0u32)
    .wrapping_sub(MULTIBOOT_MAGIC)
    .wrapping_sub(MULTIBOOT_FLAGS);

#[repr(C, align(4))]
struct MultibootHeader {
    magic: u32,
    flags: u32,
    checksum: u32,
}

#[used]
#[unsafe(link_section = ".multiboot_header")]
static MULTIBOOT_HEADER: MultibootHeader = MultibootHeader {
    magic: MULTIBOOT_MAGIC,
    flags: MULTIBOOT_FLAGS,
    checksum: MULTIBOOT_CHECKSUM,
};

/// Layout GRUB guarantees at the offsets we read; the rest of the struct
/// belongs to subsystems we don't implement.
#[repr(C)]
struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
}

const BOOT_STACK_SIZE: usize = 64 * 1024;

#[repr(align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

#[unsafe(no_mangle)]
static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

/// Entered by the bootloader in 32-bit protected mode, paging disabled,
/// interrupts disabled. Switches onto our own stack and hands off to
/// [`crate::bootstrap::kernel_main`].
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "mov esp, offset {stack} + {stack_size}",
        "mov ebp, esp",
        "push ebx", // multiboot_info pointer
        "push eax", // multiboot magic
        "call {entry}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        entry = sym boot_entry,
    )
}

/// Reads the fields we care about from the Multiboot info block and calls
/// into the arch-independent bootstrap sequence with the detected memory
/// size. `mem_upper` is KiB above 1 MiB; we report total usable KiB as the
/// 1 MiB low region plus that value.
unsafe extern "C" fn boot_entry(magic: u32, info_ptr: *const MultibootInfo) -> ! {
    let mem_kb: u32 = if magic == 0x2BADB002 && !info_ptr.is_null() {
        // SAFETY: GRUB guarantees mem_lower/mem_upper are valid when flags
        // bit 0 is set, which MULTIBOOT_FLAGS always requests.
        let info = unsafe { &*info_ptr };
        if info.flags & 0x1 != 0 {
            1024 + info.mem_upper
        } else {
            16 * 1024 // conservative fallback
        }
    } else {
        16 * 1024
    };

    crate::bootstrap::kernel_main(mem_kb)
}
