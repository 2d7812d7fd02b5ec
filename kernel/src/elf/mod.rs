//! 32-bit ELF loader: turns a file image into a running isolated process.
//!
//! Composes the address-space manager ([`crate::mm::vmm`]), the task table
//! ([`crate::process::table`]), and the interrupt-frame layout
//! ([`crate::arch::InterruptFrame`]) to instantiate a brand-new ring-3
//! process from nothing but a buffer, a name, a priority, an I/O-privilege
//! flag, and a small flag word. Only `PT_LOAD` segments are honored; there
//! is no dynamic linking, no section-header introspection, and no
//! filesystem underneath -- `image` is whatever bytes the caller already
//! has in memory.

pub mod types;

use core::cell::Cell;
use core::mem::size_of;

use alloc::vec::Vec;

use types::{
    Elf32Header, Elf32ProgramHeader, ElfError, EM_386, ELFCLASS32, ELFDATA2LSB, ELF_MAGIC,
    ET_EXEC, PF_W, PT_LOAD,
};

use crate::arch::x86::gdt;
use crate::arch::InterruptFrame;
use crate::error::KernelError;
use crate::mm::vmm::{self, AddressSpace};
use crate::mm::{PageFlags, PhysicalAddress, VirtualAddress};
use crate::process::pcb::Pcb;
use crate::process::table::TASK_TABLE;
use crate::process::Pid;
use crate::raii::ScopeGuard;

/// Refuses to even parse an image larger than this. Not a real memory
/// limit -- just a sanity bound so a corrupt header claiming a gigabyte
/// segment fails fast instead of slowly exhausting the frame allocator.
const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on `PT_LOAD` segments this loader will walk.
const MAX_SEGMENTS: usize = 16;

/// Size of the dedicated kernel stack every isolated process gets for its
/// next ring 3 -> 0 transition (syscall or interrupt entry).
const KERNEL_STACK_SIZE: usize = 8 * 1024;

/// Bit in the loader's flag word requesting the new process get the VGA
/// text-mode framebuffer mapped into its own address space. The core
/// itself never drives VGA text mode (all kernel diagnostics go out the
/// serial port, see [`crate::serial`]); this exists purely so a userspace
/// console server can ask for direct access to the hardware framebuffer.
pub const FLAG_MAP_VGA: u32 = 1 << 0;

const VGA_PHYS: PhysicalAddress = PhysicalAddress::new(0x000B_8000);
const VGA_USER_VIRT: VirtualAddress = VirtualAddress::new(0x0050_0000);
const VGA_FRAMEBUFFER_BYTES: usize = 80 * 25 * 2;

/// Parses and validates the file header, rejecting anything this loader
/// doesn't support (64-bit, big-endian, non-executable, wrong machine)
/// rather than guessing at it.
fn read_header(image: &[u8]) -> Result<Elf32Header, ElfError> {
    if image.len() < size_of::<Elf32Header>() {
        return Err(ElfError::TooSmallForHeader);
    }
    // SAFETY: length just checked; `Elf32Header` has byte alignment, so an
    // unaligned read from arbitrary file bytes is sound.
    let header = unsafe { core::ptr::read_unaligned(image.as_ptr() as *const Elf32Header) };
    if header.magic != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.class != ELFCLASS32 {
        return Err(ElfError::NotElfClass32);
    }
    if header.data != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if header.elf_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if header.machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    if header.entry < vmm::USER_BASE.as_u32() {
        return Err(ElfError::EntryBelowUserBase);
    }
    Ok(header)
}

fn program_headers(
    image: &[u8],
    header: &Elf32Header,
) -> Result<Vec<Elf32ProgramHeader>, ElfError> {
    let phentsize = header.phentsize as usize;
    let phnum = header.phnum as usize;
    if phnum > MAX_SEGMENTS || phentsize < size_of::<Elf32ProgramHeader>() {
        return Err(ElfError::ProgramHeaderOutOfBounds);
    }

    let table_len = phentsize
        .checked_mul(phnum)
        .ok_or(ElfError::ProgramHeaderOutOfBounds)?;
    let start = header.phoff as usize;
    let end = start
        .checked_add(table_len)
        .ok_or(ElfError::ProgramHeaderOutOfBounds)?;
    let table = image
        .get(start..end)
        .ok_or(ElfError::ProgramHeaderOutOfBounds)?;

    let mut headers = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let entry = &table[i * phentsize..i * phentsize + size_of::<Elf32ProgramHeader>()];
        // SAFETY: slice is exactly `size_of::<Elf32ProgramHeader>()` bytes.
        let ph = unsafe { core::ptr::read_unaligned(entry.as_ptr() as *const Elf32ProgramHeader) };
        headers.push(ph);
    }
    Ok(headers)
}

/// Non-PAE 32-bit paging has no execute-disable bit, so `PF_X` has nothing
/// to map to; only the writable bit carries over.
fn segment_flags(p_flags: u32) -> PageFlags {
    if p_flags & PF_W != 0 {
        PageFlags::WRITABLE
    } else {
        PageFlags::empty()
    }
}

/// Maps one `PT_LOAD` segment into `space`: one physical frame per page
/// the segment spans, file bytes copied in (zero-extended past
/// `p_filesz` up to `p_memsz`, satisfying `.bss`), each mapped at its
/// `p_vaddr`-derived page.
fn load_segment(
    space: &mut AddressSpace,
    image: &[u8],
    ph: &Elf32ProgramHeader,
) -> Result<(), ElfError> {
    if ph.p_memsz == 0 {
        return Ok(());
    }
    if ph.p_memsz > (MAX_IMAGE_SIZE as u32) || ph.p_filesz > ph.p_memsz {
        return Err(ElfError::UnreasonableSize);
    }
    let file_end = (ph.p_offset as usize)
        .checked_add(ph.p_filesz as usize)
        .ok_or(ElfError::SegmentOutOfBounds)?;
    let file_bytes = image
        .get(ph.p_offset as usize..file_end)
        .ok_or(ElfError::SegmentOutOfBounds)?;

    if ph.p_vaddr < vmm::USER_BASE.as_u32() {
        return Err(ElfError::SegmentBelowUserBase);
    }
    let base = VirtualAddress::new(ph.p_vaddr).align_down(crate::mm::FRAME_SIZE as u32);
    let misalign = ph.p_vaddr - base.as_u32();
    let span = misalign as usize + ph.p_memsz as usize;
    let page_count = span.div_ceil(crate::mm::FRAME_SIZE);
    let flags = segment_flags(ph.p_flags);

    for page in 0..page_count {
        let virt = base.add((page * crate::mm::FRAME_SIZE) as u32);
        let frame = crate::mm::FRAME_ALLOCATOR
            .allocate_frame()
            .map_err(|_| ElfError::UnreasonableSize)?;
        let phys = frame.addr();

        // SAFETY: `phys` was just allocated and is not yet mapped
        // anywhere, but the kernel address space identity-maps every
        // usable physical frame, so it's directly writable through its
        // own physical address while the current (kernel) CR3 is loaded.
        let dest = unsafe { core::slice::from_raw_parts_mut(phys.as_u32() as *mut u8, crate::mm::FRAME_SIZE) };
        dest.fill(0);

        let page_start_file_off = (page * crate::mm::FRAME_SIZE) as isize - misalign as isize;
        for i in 0..crate::mm::FRAME_SIZE {
            let file_off = page_start_file_off + i as isize;
            if file_off >= 0 && (file_off as usize) < file_bytes.len() {
                dest[i] = file_bytes[file_off as usize];
            }
        }

        vmm::map_user(space, virt, phys, flags).map_err(|_| ElfError::SegmentOutOfBounds)?;
    }
    Ok(())
}

/// Loads `image` and starts it running as a brand-new isolated process.
///
/// Steps, each of which can fail and must unwind everything allocated by
/// the steps before it: parse and validate the header; walk program
/// headers and map every `PT_LOAD` segment; optionally map the VGA
/// framebuffer; map the user stack; allocate the process's dedicated
/// kernel stack; build the initial ring 3 entry frame; register the new
/// PCB. `ScopeGuard` (see [`crate::raii`]) owns the unwind for the address
/// space across all of that; only after every step has succeeded does the
/// space's ownership move into the new [`Pcb`].
pub fn load_process(
    image: &[u8],
    name: &str,
    priority: u8,
    io_privilege: bool,
    flags: u32,
) -> Result<Pid, KernelError> {
    if image.len() > MAX_IMAGE_SIZE {
        return Err(ElfError::UnreasonableSize.into());
    }
    let header = read_header(image)?;
    let phdrs = program_headers(image, &header)?;
    let loads: Vec<&Elf32ProgramHeader> = phdrs.iter().filter(|ph| ph.p_type == PT_LOAD).collect();
    if loads.is_empty() {
        return Err(ElfError::NoLoadSegments.into());
    }

    let space = vmm::create_isolated_space()?;
    let space_cell: Cell<Option<AddressSpace>> = Cell::new(Some(space));
    let space_guard = ScopeGuard::new(|| {
        if let Some(s) = space_cell.take() {
            vmm::destroy_address_space(s);
        }
    });

    let user_stack_top = with_space(&space_cell, |s| {
        for ph in &loads {
            load_segment(s, image, ph)?;
        }
        if flags & FLAG_MAP_VGA != 0 {
            map_vga(s)?;
        }
        vmm::map_user_stack(s).map_err(ElfError::from_vmm)
    })?;

    let mut kstack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let kstack_base = kstack.as_mut_ptr() as usize;
    core::mem::forget(kstack);
    let kstack_guard = ScopeGuard::new(|| {
        // SAFETY: reconstructs exactly the boxed slice leaked above via
        // `as_mut_ptr`/`forget` (mirrors `sched::spawn_kernel_task`); only
        // runs if this function returns before the PCB takes ownership.
        unsafe {
            drop(alloc::vec::Vec::from_raw_parts(
                kstack_base as *mut u8,
                KERNEL_STACK_SIZE,
                KERNEL_STACK_SIZE,
            ));
        }
    });

    let mut frame = InterruptFrame::blank();
    frame.eip = header.entry;
    frame.eflags = 0x200; // IF
    frame.user_esp = user_stack_top.as_u32();
    #[cfg(target_arch = "x86")]
    {
        frame.cs = gdt::USER_CS as u32;
        frame.ds = gdt::USER_DS as u32;
        frame.es = gdt::USER_DS as u32;
        frame.fs = gdt::USER_DS as u32;
        frame.gs = gdt::USER_DS as u32;
        frame.user_ss = gdt::USER_DS as u32;
    }

    let kernel_stack_top = (kstack_base + KERNEL_STACK_SIZE) as u32;
    // SAFETY: `kernel_stack_top` is the exclusive top of the allocation
    // leaked just above, owned solely by this function until the guard is
    // cancelled and the PCB takes over.
    let esp = unsafe { frame.write_to_stack(kernel_stack_top) };

    let space = space_cell.take().expect("address space consumed twice");
    let pid = TASK_TABLE.insert(|pid| {
        Pcb::new_isolated_process(
            pid,
            name,
            priority,
            space,
            user_stack_top,
            vmm::USER_STACK_PAGES * crate::mm::FRAME_SIZE,
            kstack_base,
            KERNEL_STACK_SIZE,
            esp,
            io_privilege,
        )
    })?;

    space_guard.cancel();
    kstack_guard.cancel();
    Ok(pid)
}

/// Runs `f` on the address space currently held in `cell`, putting it back
/// afterward regardless of outcome so `cell`'s guard can still clean it up
/// on error.
fn with_space<R>(
    cell: &Cell<Option<AddressSpace>>,
    f: impl FnOnce(&mut AddressSpace) -> Result<R, ElfError>,
) -> Result<R, KernelError> {
    let mut space = cell.take().expect("address space missing from cell");
    let result = f(&mut space);
    cell.set(Some(space));
    result.map_err(KernelError::from)
}

/// Maps the two physical pages covering VGA text memory (`VGA_PHYS` and the
/// page after it) into `space`'s user region. Uses
/// [`vmm::map_user_unowned`], not [`vmm::map_user`]: `VGA_PHYS` is hardware
/// MMIO, never handed out by [`crate::mm::FRAME_ALLOCATOR`], so it must not
/// be freed back into the general frame pool when the process exits.
fn map_vga(space: &mut AddressSpace) -> Result<(), ElfError> {
    let _ = VGA_FRAMEBUFFER_BYTES;
    for page in 0..2u32 {
        let offset = page * crate::mm::FRAME_SIZE as u32;
        vmm::map_user_unowned(
            space,
            VGA_USER_VIRT.add(offset),
            PhysicalAddress::new(VGA_PHYS.as_u32() + offset),
            PageFlags::WRITABLE,
        )
        .map_err(|_| ElfError::SegmentOutOfBounds)?;
    }
    Ok(())
}

impl ElfError {
    fn from_vmm(_err: KernelError) -> Self {
        ElfError::SegmentOutOfBounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(phnum: u16, phoff: u32) -> Elf32Header {
        Elf32Header {
            magic: ELF_MAGIC,
            class: ELFCLASS32,
            data: ELFDATA2LSB,
            version: 1,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
            elf_type: ET_EXEC,
            machine: EM_386,
            version2: 1,
            entry: 0x0040_1000,
            phoff,
            shoff: 0,
            flags: 0,
            ehsize: size_of::<Elf32Header>() as u16,
            phentsize: size_of::<Elf32ProgramHeader>() as u16,
            phnum,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    fn as_bytes<T>(value: &T) -> &[u8] {
        // SAFETY: test-only helper over `repr(C)` ELF structs.
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
    }

    #[test]
    fn rejects_image_too_small_for_header() {
        let image = [0u8; 4];
        assert_eq!(read_header(&image).unwrap_err(), ElfError::TooSmallForHeader);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut header = header_bytes(0, size_of::<Elf32Header>() as u32);
        header.magic = [0, 0, 0, 0];
        assert_eq!(read_header(as_bytes(&header)).unwrap_err(), ElfError::BadMagic);
    }

    #[test]
    fn accepts_a_well_formed_header() {
        let header = header_bytes(1, size_of::<Elf32Header>() as u32);
        assert!(read_header(as_bytes(&header)).is_ok());
    }

    #[test]
    fn program_header_table_out_of_bounds_is_rejected() {
        let header = header_bytes(4, 1_000_000);
        assert_eq!(
            program_headers(as_bytes(&header), &header).unwrap_err(),
            ElfError::ProgramHeaderOutOfBounds
        );
    }

    #[test]
    fn zero_memsz_segment_is_a_no_op() {
        let mut space = vmm_test_space();
        let ph = Elf32ProgramHeader {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: 0x0040_0000,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_flags: 0,
            p_align: 0x1000,
        };
        assert!(load_segment(&mut space, &[], &ph).is_ok());
    }

    fn vmm_test_space() -> AddressSpace {
        crate::mm::frame_allocator::init(4096);
        crate::mm::vmm::init(4096).unwrap();
        crate::mm::vmm::create_isolated_space().unwrap()
    }
}
