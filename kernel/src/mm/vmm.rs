//! Address-space manager: builds and destroys per-process page directories
//! and installs mappings.
//!
//! The kernel address space identity-maps RAM up to `mem_kb` as
//! present+writable and marks every kernel-region entry user-accessible at
//! the page-table-entry level, so later per-process clones can expose
//! kernel code to ring 3 only when they choose to (`create_address_space`)
//! or keep it supervisor-only (`create_isolated_space`).
//!
//! [`map_user`] edits *another* process's directory while the current CR3
//! may point anywhere else, using two reserved "mapping window" virtual
//! addresses in the permanently-shared kernel region: the first window
//! transiently maps the target directory, the second whatever page table
//! needs editing.

use alloc::vec::Vec;

use spin::Mutex;

use super::page_table::{self, Entry, PageDirectory, PageTable, ENTRIES_PER_TABLE};
use super::{FrameNumber, PageFlags, PhysicalAddress, VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE};
use crate::error::KernelError;
use crate::sync::once_lock::GlobalState;

/// Boundary between the shared kernel directory slot (index 0, < 4 MiB) and
/// the per-process user region. Chosen so the mapping windows and the low
/// identity-mapped kernel image fit entirely below it in directory slot 0.
pub const USER_BASE: VirtualAddress = VirtualAddress::new(0x0040_0000);

/// Fixed top of the per-process user stack; the ELF loader maps
/// `USER_STACK_PAGES` pages ending here.
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(0x0100_0000);
pub const USER_STACK_PAGES: usize = 16;

const WINDOW_1: VirtualAddress = VirtualAddress::new(0x003F_F000);
const WINDOW_2: VirtualAddress = VirtualAddress::new(0x003F_E000);

struct KernelSpace {
    directory_phys: PhysicalAddress,
}

static KERNEL_SPACE: GlobalState<Mutex<KernelSpace>> = GlobalState::new();

/// A process's private address space: the physical frame holding its page
/// directory, plus the frames it privately owns (its own page tables and
/// the user data frames mapped into them). Destroying it returns exactly
/// these frames to the allocator and nothing from the shared kernel region.
pub struct AddressSpace {
    directory_phys: PhysicalAddress,
    owned_tables: Vec<FrameNumber>,
    owned_user_frames: Vec<FrameNumber>,
}

impl AddressSpace {
    pub fn directory_phys(&self) -> PhysicalAddress {
        self.directory_phys
    }
}

/// Builds the kernel address space: identity-maps all RAM up to `mem_kb`,
/// installs the page-fault handler (wired by the IRQ dispatcher, not here),
/// and enables paging.
pub fn init(mem_kb: u32) -> Result<(), KernelError> {
    let dir_frame = alloc_zeroed_frame()?;
    let dir_phys = dir_frame.addr();

    // SAFETY: dir_phys was just allocated and zeroed; nothing else can
    // observe it while we're the only one holding its address.
    let directory = unsafe { &mut *window_ptr::<PageDirectory>(dir_phys) };
    for entry in directory.entries.iter_mut() {
        *entry = Entry::empty();
    }

    let _ = KERNEL_SPACE.init(Mutex::new(KernelSpace {
        directory_phys: dir_phys,
    }));

    // SAFETY: boot-time; nothing has loaded this directory yet, so mutating
    // it directly by its physical address (paging not yet enabled) is sound.
    unsafe {
        identity_map_low_memory(dir_phys, mem_kb)?;
    }

    // SAFETY: dir_phys is a fully populated directory covering at least RAM
    // up to mem_kb, including the code currently executing.
    unsafe {
        page_table::load_directory(dir_phys);
        page_table::enable_paging();
    }

    Ok(())
}

#[cfg(target_arch = "x86")]
unsafe fn identity_map_low_memory(dir_phys: PhysicalAddress, mem_kb: u32) -> Result<(), KernelError> {
    let total = (mem_kb as usize * 1024).div_ceil(FRAME_SIZE) * FRAME_SIZE;
    let mut addr = 0u32;
    while (addr as usize) < total {
        let virt = VirtualAddress::new(addr);
        // Reserve the two mapping-window pages: leave them present-but-
        // never-identity-backed so map_user's windowing never collides with
        // a "real" identity mapping at the same address.
        if virt != WINDOW_1 && virt != WINDOW_2 {
            map_page_in(
                dir_phys,
                virt,
                PhysicalAddress::new(addr),
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )?;
        }
        addr = addr.wrapping_add(FRAME_SIZE as u32);
    }
    Ok(())
}

#[cfg(not(target_arch = "x86"))]
unsafe fn identity_map_low_memory(_dir_phys: PhysicalAddress, _mem_kb: u32) -> Result<(), KernelError> {
    // Host-target unit tests never enable paging; nothing to map.
    Ok(())
}

fn alloc_zeroed_frame() -> Result<FrameNumber, KernelError> {
    FRAME_ALLOCATOR
        .allocate_frame()
        .map_err(|_| KernelError::OutOfMemory {
            requested: FRAME_SIZE,
            available: 0,
        })
}

/// Casts a physical address to a pointer usable directly, valid only before
/// paging is enabled or when `phys` happens to also be identity-mapped.
/// Only [`init`] relies on this (the kernel directory's own frame, used
/// while building the very first mapping).
fn window_ptr<T>(phys: PhysicalAddress) -> *mut T {
    phys.as_u32() as *mut T
}

/// Maps a single page into the directory at `dir_phys`, allocating a page
/// table if the covering directory slot is empty. Used both for the
/// kernel directory (where `dir_phys` is always the current CR3) and, via
/// [`map_user`], for an arbitrary process directory through the mapping
/// windows.
fn map_page_in(
    dir_phys: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), KernelError> {
    let dir_index = virt.directory_index();
    let tbl_index = virt.table_index();

    with_window_1(dir_phys, |directory| {
        let dir_entry = directory.entries[dir_index];
        let table_phys = if dir_entry.is_present() {
            dir_entry.frame().addr()
        } else {
            let frame = alloc_zeroed_frame()?;
            let table_phys = frame.addr();
            with_window_2(table_phys, |table| {
                for e in table.entries.iter_mut() {
                    *e = Entry::empty();
                }
            });
            directory.entries[dir_index] =
                Entry::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
            table_phys
        };

        with_window_2(table_phys, |table| {
            table.entries[tbl_index] =
                Entry::new(FrameNumber::from_addr(phys), flags | PageFlags::PRESENT);
        });

        Ok(())
    })
}

/// Maps `virt` -> `phys` in the kernel directory.
pub fn map_page(virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) -> Result<(), KernelError> {
    let dir_phys = kernel_directory_phys()?;
    map_page_in(dir_phys, virt, phys, flags)?;
    page_table::invalidate_page(virt);
    Ok(())
}

/// Maps `size` bytes starting at `virt`/`phys`, one page at a time.
pub fn map_range(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    size: usize,
    flags: PageFlags,
) -> Result<(), KernelError> {
    let pages = size.div_ceil(FRAME_SIZE);
    for i in 0..pages {
        let offset = (i * FRAME_SIZE) as u32;
        map_page(virt.add(offset), PhysicalAddress::new(phys.as_u32() + offset), flags)?;
    }
    Ok(())
}

/// Clears the mapping at `virt` in the kernel directory and invalidates its
/// TLB line.
pub fn unmap_page(virt: VirtualAddress) -> Result<(), KernelError> {
    let dir_phys = kernel_directory_phys()?;
    with_window_1(dir_phys, |directory| {
        let dir_entry = directory.entries[virt.directory_index()];
        if !dir_entry.is_present() {
            return Err(KernelError::UnmappedMemory {
                addr: virt.as_u32() as usize,
            });
        }
        let table_phys = dir_entry.frame().addr();
        with_window_2(table_phys, |table| {
            table.entries[virt.table_index()] = Entry::empty();
        });
        Ok(())
    })?;
    page_table::invalidate_page(virt);
    Ok(())
}

fn kernel_directory_phys() -> Result<PhysicalAddress, KernelError> {
    KERNEL_SPACE
        .with(|lock| lock.lock().directory_phys)
        .ok_or(KernelError::NotInitialized { subsystem: "vmm" })
}

/// Allocates a new directory whose entries are copies of every present
/// kernel directory entry, each with the user-accessible flag *added*.
/// Result: a process that, from ring 3, can reach the same low-memory code
/// as the kernel — used by in-kernel-binary server programs.
pub fn create_address_space() -> Result<AddressSpace, KernelError> {
    clone_kernel_directory(true)
}

/// Allocates a new directory whose kernel entries are copied verbatim
/// (supervisor-only), then clears every directory slot covering the user
/// address range so the user region starts empty. Result: a process whose
/// user code cannot reach kernel memory from ring 3 — used by ELF-loaded
/// processes.
pub fn create_isolated_space() -> Result<AddressSpace, KernelError> {
    clone_kernel_directory(false)
}

fn clone_kernel_directory(expose_user: bool) -> Result<AddressSpace, KernelError> {
    let kernel_dir_phys = kernel_directory_phys()?;
    let new_frame = alloc_zeroed_frame()?;
    let new_dir_phys = new_frame.addr();

    with_window_1(kernel_dir_phys, |kernel_dir| {
        with_window_2(new_dir_phys, |new_dir| {
            for e in new_dir.entries.iter_mut() {
                *e = Entry::empty();
            }
            for (i, entry) in kernel_dir.entries.iter().enumerate() {
                if !entry.is_present() {
                    continue;
                }
                let mut flags = entry.flags();
                if expose_user {
                    flags.insert(PageFlags::USER);
                }
                new_dir.entries[i] = Entry::new(entry.frame(), flags);
            }
        });
    });

    let user_start_index = USER_BASE.directory_index();
    if !expose_user {
        with_window_1(new_dir_phys, |new_dir| {
            for entry in new_dir.entries[user_start_index..].iter_mut() {
                *entry = Entry::empty();
            }
        });
    }

    Ok(AddressSpace {
        directory_phys: new_dir_phys,
        owned_tables: Vec::new(),
        owned_user_frames: Vec::new(),
    })
}

/// Installs a user mapping in `space`'s directory, the core's most delicate
/// operation: it must work while the current CR3 may be pointing at a
/// completely unrelated directory.
///
/// 1. The current CR3 is left untouched by this call — both mapping windows
///    live in the kernel region shared by every address space, so no CR3
///    switch is needed at all.
/// 2. Through the first window, inspect `space`'s directory slot for
///    `virt`. If absent, allocate a fresh page-table frame, zero it through
///    the second window, and install it with user-accessible and writable
///    flags, tracking it in `space.owned_tables`. If present, OR
///    user-accessible into the directory entry.
/// 3. Map the target page table through the second window, writing the
///    final PTE (present + user-accessible + caller-provided `flags`).
pub fn map_user(
    space: &mut AddressSpace,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), KernelError> {
    map_user_inner(space, virt, phys, flags, true)
}

/// Like [`map_user`], but for mapping hardware memory (e.g. the VGA
/// framebuffer) that was never obtained from [`FRAME_ALLOCATOR`]. The frame
/// is left out of `space.owned_user_frames`, so [`destroy_address_space`]
/// tears down the page-table frames this mapping needed without also
/// freeing the hardware frame itself back into the general pool.
pub fn map_user_unowned(
    space: &mut AddressSpace,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), KernelError> {
    map_user_inner(space, virt, phys, flags, false)
}

fn map_user_inner(
    space: &mut AddressSpace,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
    track_ownership: bool,
) -> Result<(), KernelError> {
    let dir_index = virt.directory_index();
    let tbl_index = virt.table_index();

    let table_phys = with_window_1(space.directory_phys, |directory| {
        let dir_entry = directory.entries[dir_index];
        if dir_entry.is_present() {
            directory.entries[dir_index].insert_flags(PageFlags::USER);
            Ok(dir_entry.frame().addr())
        } else {
            let frame = alloc_zeroed_frame()?;
            let table_phys = frame.addr();
            with_window_2(table_phys, |table| {
                for e in table.entries.iter_mut() {
                    *e = Entry::empty();
                }
            });
            directory.entries[dir_index] =
                Entry::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
            space.owned_tables.push(frame);
            Ok(table_phys)
        }
    })?;

    with_window_2(table_phys, |table| {
        table.entries[tbl_index] = Entry::new(
            FrameNumber::from_addr(phys),
            flags | PageFlags::PRESENT | PageFlags::USER,
        );
    });
    if track_ownership {
        space.owned_user_frames.push(FrameNumber::from_addr(phys));
    }

    if page_table::current_directory() == space.directory_phys {
        page_table::invalidate_page(virt);
    }

    Ok(())
}

/// Clears a user mapping previously installed with [`map_user`] and
/// invalidates its TLB line if `space` is the current directory.
pub fn unmap_user(space: &mut AddressSpace, virt: VirtualAddress) -> Result<(), KernelError> {
    let dir_index = virt.directory_index();
    let tbl_index = virt.table_index();

    with_window_1(space.directory_phys, |directory| {
        let dir_entry = directory.entries[dir_index];
        if !dir_entry.is_present() {
            return Err(KernelError::UnmappedMemory {
                addr: virt.as_u32() as usize,
            });
        }
        let table_phys = dir_entry.frame().addr();
        with_window_2(table_phys, |table| {
            table.entries[tbl_index] = Entry::empty();
        });
        Ok(())
    })?;

    if page_table::current_directory() == space.directory_phys {
        page_table::invalidate_page(virt);
    }

    Ok(())
}

/// Loads `space`'s directory as the active one, or the kernel directory if
/// `space` is `None`.
pub fn switch(space: Option<&AddressSpace>) -> Result<(), KernelError> {
    let phys = match space {
        Some(s) => s.directory_phys,
        None => kernel_directory_phys()?,
    };
    if page_table::current_directory() != phys {
        // SAFETY: `phys` names either the permanent kernel directory or an
        // `AddressSpace`'s directory built by `clone_kernel_directory`,
        // both of which carry every kernel mapping the currently executing
        // code depends on.
        unsafe {
            page_table::load_directory(phys);
        }
    }
    Ok(())
}

/// Frees every frame `space` privately owns: its page-table frames and the
/// user data frames mapped through them. Never touches the shared kernel
/// directory or its page tables.
pub fn destroy_address_space(space: AddressSpace) {
    for frame in &space.owned_user_frames {
        let _ = FRAME_ALLOCATOR.free_frame(*frame);
    }
    for frame in &space.owned_tables {
        let _ = FRAME_ALLOCATOR.free_frame(*frame);
    }
    let _ = FRAME_ALLOCATOR.free_frame(FrameNumber::from_addr(space.directory_phys));
}

/// Maps a fresh, zeroed [`USER_STACK_PAGES`]-page stack in `space`, ending
/// at [`USER_STACK_TOP`]. Shared by the ELF loader and the `create_task`
/// syscall's in-kernel-binary task path, the two ways a ring-3 task comes
/// into being.
pub fn map_user_stack(space: &mut AddressSpace) -> Result<VirtualAddress, KernelError> {
    let base = USER_STACK_TOP.as_u32() - (USER_STACK_PAGES * FRAME_SIZE) as u32;
    for i in 0..USER_STACK_PAGES {
        let virt = VirtualAddress::new(base + (i * FRAME_SIZE) as u32);
        let frame = alloc_zeroed_frame()?;
        zero_frame(frame.addr());
        map_user(space, virt, frame.addr(), PageFlags::WRITABLE)?;
    }
    Ok(VirtualAddress::new(base))
}

/// Zeroes a whole frame through [`WINDOW_2`]. `PageTable` is exactly one
/// frame of all-zero-valid `Entry(u32)`s, so reusing it as the zeroing
/// target avoids a second, byte-oriented window helper.
fn zero_frame(phys: PhysicalAddress) {
    with_window_2(phys, |table| {
        for e in table.entries.iter_mut() {
            *e = Entry::empty();
        }
    });
}

/// Invoked by the IRQ dispatcher on vector 14 (#PF). User-process faults
/// are reported up to the scheduler, which kills the offending task; a
/// kernel-mode fault is unrecoverable.
pub fn page_fault_handler(faulting_addr: VirtualAddress, frame: &crate::arch::InterruptFrame) {
    if frame.is_user_mode() {
        crate::log_service::klog(
            crate::log_service::LogLevel::Warn,
            "vmm",
            "user page fault, killing process",
        );
        crate::sched::kill_current(crate::error::KernelError::UnmappedMemory {
            addr: faulting_addr.as_u32() as usize,
        });
    } else {
        panic!("page fault in kernel mode at {:#010x}", faulting_addr.as_u32());
    }
}

/// Maps the target directory frame at [`WINDOW_1`] in the *current*
/// directory, runs `f`, then leaves the window mapped (the next call just
/// repoints it — nothing reads a stale window between calls because every
/// access goes through these helpers).
fn with_window_1<R>(target: PhysicalAddress, f: impl FnOnce(&mut PageDirectory) -> R) -> R {
    map_window(WINDOW_1, target);
    // SAFETY: WINDOW_1 now maps `target`'s frame as a `PageDirectory`-sized,
    // page-aligned region; no other code accesses WINDOW_1 concurrently
    // because callers run with interrupts disabled for the duration.
    let directory = unsafe { &mut *(WINDOW_1.as_u32() as *mut PageDirectory) };
    f(directory)
}

fn with_window_2<R>(target: PhysicalAddress, f: impl FnOnce(&mut PageTable) -> R) -> R {
    map_window(WINDOW_2, target);
    // SAFETY: same reasoning as `with_window_1`, for WINDOW_2.
    let table = unsafe { &mut *(WINDOW_2.as_u32() as *mut PageTable) };
    f(table)
}

#[cfg(target_arch = "x86")]
fn map_window(window: VirtualAddress, target: PhysicalAddress) {
    let dir_phys = page_table::current_directory();
    // SAFETY: the window pages are reserved, never identity-mapped, and
    // live in directory slot 0 which is present in every address space;
    // writing their PTE directly through the current directory's own
    // physical frame is valid before paging fully stabilizes as well as
    // after, since the kernel directory's own frame is always identity
    // mapped by `init`.
    unsafe {
        let directory = &mut *(dir_phys.as_u32() as *mut PageDirectory);
        let dir_entry = directory.entries[window.directory_index()];
        let table_phys = if dir_entry.is_present() {
            dir_entry.frame().addr()
        } else {
            panic!("mapping window directory slot not present");
        };
        let table = &mut *(table_phys.as_u32() as *mut PageTable);
        table.entries[window.table_index()] =
            Entry::new(FrameNumber::from_addr(target), PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    page_table::invalidate_page(window);
}

#[cfg(not(target_arch = "x86"))]
fn map_window(_window: VirtualAddress, _target: PhysicalAddress) {
    // Host-target unit tests never enable paging, so there's no real
    // window to repoint; callers below instead operate on frames that are
    // already directly addressable (see the `#[cfg(test)]` module, which
    // builds directories/tables as plain heap values rather than through
    // `with_window_*`).
}

#[allow(dead_code)]
const _: () = assert!(ENTRIES_PER_TABLE == 1024);
