//! Global Descriptor Table: flat kernel/user code and data segments plus the
//! single TSS descriptor used for `esp0` on ring 3 -> ring 0 transitions.
//!
//! We don't use x86 segmentation for protection (everything is a flat 4 GiB
//! segment); the only thing segment selectors give us here is the ring
//! (CPL/DPL) tag the CPU needs to enforce privilege levels, and the TSS
//! slot the CPU consults on every privilege-raising interrupt to find the
//! ring-0 stack.

use core::mem::size_of;

use crate::arch::x86::tss::Tss;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x18 | 3;
pub const USER_DS: u16 = 0x20 | 3;
pub const TSS_SEL: u16 = 0x28;

const GDT_ENTRIES: usize = 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    const fn flat(access: u8, gran: u8) -> Self {
        GdtEntry {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            granularity: 0xC0 | gran,
            base_high: 0,
        }
    }

    fn tss(base: u32, limit: u32) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: 0x89, // present, DPL 0, type 9 (32-bit TSS, not busy)
            granularity: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtDescriptor {
    limit: u16,
    base: u32,
}

static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];

/// Builds the GDT, points `ebx`'s favourite register at it, and loads every
/// segment register with a flat selector.
///
/// # Safety
/// Must run once, early in boot, before any code relies on segment
/// selectors matching the layout here (in particular before IDT handlers
/// that reload `ds`/`es`/`fs`/`gs` from [`KERNEL_DS`] can fire).
pub unsafe fn init(tss: &'static Tss) {
    // SAFETY: single-threaded boot-time initialization, no concurrent access.
    unsafe {
        GDT[0] = GdtEntry::null();
        GDT[1] = GdtEntry::flat(0x9A, 0x0F); // kernel code: present, ring0, exec/read
        GDT[2] = GdtEntry::flat(0x92, 0x0F); // kernel data: present, ring0, read/write
        GDT[3] = GdtEntry::flat(0xFA, 0x0F); // user code: present, ring3, exec/read
        GDT[4] = GdtEntry::flat(0xF2, 0x0F); // user data: present, ring3, read/write
        GDT[5] = GdtEntry::tss(tss as *const Tss as u32, (size_of::<Tss>() - 1) as u32);

        let descriptor = GdtDescriptor {
            limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
            base: core::ptr::addr_of!(GDT) as u32,
        };

        load_gdt(&descriptor);
        reload_segments();
        load_task_register(TSS_SEL);
    }
}

unsafe fn load_gdt(descriptor: &GdtDescriptor) {
    // SAFETY: descriptor points at the static GDT built above and stays
    // valid for the kernel's lifetime.
    unsafe {
        core::arch::asm!("lgdt [{}]", in(reg) descriptor, options(nostack, preserves_flags));
    }
}

unsafe fn reload_segments() {
    // SAFETY: KERNEL_CS/KERNEL_DS name valid, just-loaded descriptors. The
    // far jump reloads `cs`; the rest follow as plain data segment loads.
    unsafe {
        core::arch::asm!(
            "push {cs}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {ds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            cs = const KERNEL_CS as u32,
            ds = const KERNEL_DS as u32,
            out("eax") _,
            options(nostack),
        );
    }
}

unsafe fn load_task_register(selector: u16) {
    // SAFETY: selector names the TSS descriptor just installed in the GDT.
    unsafe {
        core::arch::asm!("ltr {0:x}", in(reg) selector, options(nostack, preserves_flags));
    }
}
