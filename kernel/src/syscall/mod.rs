//! System-call dispatcher: the user-visible boundary of the core.
//!
//! Reached from [`crate::arch::x86::idt`]'s syscall gate (vector 0x80) with
//! the caller's register frame already saved on the current kernel stack.
//! The calling convention is the kernel's own: `eax` holds the syscall
//! number, `ebx`/`ecx`/`edx`/`esi`/`edi` hold up to five arguments, and
//! [`dispatch`] writes the result back into the saved `eax` slot before
//! returning. A syscall that blocks (the IPC primitives, `sleep`, `exit`)
//! does so by calling straight into [`crate::sched`]/[`crate::ipc`];
//! `dispatch` itself never blocks.
//!
//! User-supplied pointers are read and written in place through
//! [`user_bytes`]/[`write_user_bytes`] rather than copied through some
//! intermediate capability object: the caller's CR3 is still loaded for
//! the whole of a syscall, so a raw dereference of a caller-supplied
//! address is exactly "the crossing into kernel-owned scratch memory" the
//! ABI promises, not a privilege violation.

use alloc::alloc::Layout;

use crate::arch::InterruptFrame;
use crate::error::{to_syscall_errno, KernelError};
use crate::ipc::message::Message;
use crate::ipc::{self, registry};
use crate::log_service::{klog, LogLevel};
use crate::process::{Pid, TASK_TABLE};
use crate::sched;

/// Syscall numbers. Not part of any external ABI this core promises to
/// keep stable -- user programs are rebuilt against whatever table ships
/// with a given kernel build.
mod nr {
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
    pub const GETPID: u32 = 3;
    pub const EXIT: u32 = 4;
    pub const SLEEP: u32 = 5;
    pub const GET_TICKS: u32 = 6;
    pub const MALLOC: u32 = 7;
    pub const FREE: u32 = 8;
    pub const IPC_SEND: u32 = 9;
    pub const IPC_RECEIVE: u32 = 10;
    pub const IPC_SENDREC: u32 = 11;
    pub const IPC_REPLY: u32 = 12;
    pub const IPC_NOTIFY: u32 = 13;
    pub const REGISTER_SERVICE: u32 = 14;
    pub const LOOKUP_SERVICE: u32 = 15;
    pub const GRANT_IO: u32 = 16;
    pub const REGISTER_IRQ: u32 = 17;
    pub const CREATE_TASK: u32 = 18;
    pub const DEBUG_LOG: u32 = 19;
    pub const GPU_SUBMIT: u32 = 20;
}

/// Dispatches the syscall described by `frame`, writing its result (a
/// non-negative value on success, one of [`to_syscall_errno`]'s sentinels
/// on failure) back into `frame`'s `eax`.
///
/// `exit` never returns to its caller at all -- [`sched::task_exit`]
/// switches away permanently -- so that one arm below diverges rather than
/// producing a `Result` like every other syscall.
pub fn dispatch(frame: &mut InterruptFrame) {
    let a0 = frame.syscall_arg(0);
    let a1 = frame.syscall_arg(1);
    let a2 = frame.syscall_arg(2);

    let result: Result<u32, KernelError> = match frame.syscall_number() {
        nr::WRITE => sys_write(a0, a1),
        nr::READ => Err(KernelError::NotImplemented { feature: "read" }),
        nr::GETPID => Ok(sched::current_pid()),
        nr::EXIT => sched::task_exit(a0 as i32),
        nr::SLEEP => {
            sched::task_sleep(a0);
            Ok(0)
        }
        nr::GET_TICKS => Ok(crate::arch::timer::get_ticks() as u32),
        nr::MALLOC => Ok(user_malloc(a0)),
        nr::FREE => {
            user_free(a0);
            Ok(0)
        }
        nr::IPC_SEND => sys_send(a0, a1),
        nr::IPC_RECEIVE => sys_receive(a0, a1),
        nr::IPC_SENDREC => sys_sendrec(a0, a1),
        nr::IPC_REPLY => sys_reply(a0, a1),
        nr::IPC_NOTIFY => sys_notify(a0, a1),
        nr::REGISTER_SERVICE => sys_register_service(a0),
        nr::LOOKUP_SERVICE => sys_lookup_service(a0),
        nr::GRANT_IO => sys_grant_io(a0),
        nr::REGISTER_IRQ => sys_register_irq(a0),
        nr::CREATE_TASK => sys_create_task(a0, a1, a2),
        nr::DEBUG_LOG => sys_debug_log(a0, a1),
        nr::GPU_SUBMIT => sys_gpu_submit(a0, a1),
        other => Err(crate::error::SyscallError::InvalidSyscall { nr: other as usize }.into()),
    };

    let value = match result {
        Ok(v) => v,
        Err(e) => to_syscall_errno(e) as i32 as u32,
    };
    frame.set_return_value(value);
}

// ---------------------------------------------------------------------------
// User memory access
// ---------------------------------------------------------------------------

/// Highest address a caller may ever legitimately name: above the mapped
/// user stack, so a wild or malicious pointer is rejected before it's ever
/// dereferenced rather than relying on a page fault to catch it.
const USER_ADDR_LIMIT: u32 = crate::mm::vmm::USER_STACK_TOP.as_u32();

fn check_user_range(addr: u32, len: usize) -> Result<(), KernelError> {
    if addr == 0 {
        return Err(KernelError::InvalidAddress { addr: 0 });
    }
    // The low-memory kernel region stays mapped (supervisor-only) inside
    // every isolated process's directory, and this code runs in ring 0, so
    // the U/S bit alone won't stop a read down there -- reject it outright
    // rather than let a syscall leak kernel memory to a user buffer.
    if addr < crate::mm::vmm::USER_BASE.as_u32() {
        return Err(KernelError::InvalidAddress { addr: addr as usize });
    }
    let end = (addr as u64) + (len as u64);
    if end > USER_ADDR_LIMIT as u64 {
        return Err(KernelError::InvalidAddress { addr: addr as usize });
    }
    Ok(())
}

/// Reads `len` bytes out of the caller's address space. Valid only while
/// the caller's own CR3 is loaded, i.e. for the duration of the syscall
/// that requested it.
fn user_bytes(addr: u32, len: usize) -> Result<&'static [u8], KernelError> {
    check_user_range(addr, len)?;
    // SAFETY: range checked above; the caller's CR3 is current for the
    // whole of this syscall, so `addr` names the caller's own memory.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn write_user_bytes(addr: u32, data: &[u8]) -> Result<(), KernelError> {
    check_user_range(addr, data.len())?;
    // SAFETY: see `user_bytes`.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    }
    Ok(())
}

fn user_message(addr: u32) -> Result<Message, KernelError> {
    let bytes = user_bytes(addr, crate::ipc::message::MESSAGE_SIZE)?;
    let mut buf = [0u8; crate::ipc::message::MESSAGE_SIZE];
    buf.copy_from_slice(bytes);
    Ok(Message::from_bytes(buf))
}

fn write_user_message(addr: u32, msg: &Message) -> Result<(), KernelError> {
    write_user_bytes(addr, msg.as_bytes())
}

/// Copies a short NUL-or-length-bounded name out of user memory, for the
/// service-registry syscalls. Names longer than the registry's own limit
/// are truncated by `registry::register`/`lookup`, not rejected here.
fn user_name(addr: u32) -> Result<alloc::string::String, KernelError> {
    let bytes = user_bytes(addr, 16)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end])
        .map(|s| s.into())
        .map_err(|_| KernelError::InvalidArgument {
            name: "name",
            value: "not valid utf-8",
        })
}

// ---------------------------------------------------------------------------
// I/O (legacy/direct)
// ---------------------------------------------------------------------------

/// Writes straight to the serial console, bypassing IPC entirely. Exists
/// for early boot-time and debug output before a console server exists to
/// own the device.
fn sys_write(buf: u32, len: u32) -> Result<u32, KernelError> {
    let bytes = user_bytes(buf, len as usize)?;
    for &b in bytes {
        crate::serial::_serial_print(format_args!("{}", b as char));
    }
    Ok(len)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Bytes reserved ahead of every allocation to record its own size, since
/// `free` is given back only a pointer and `GlobalAlloc::dealloc` must be
/// called with the exact layout `alloc` used.
const MALLOC_HEADER: usize = core::mem::size_of::<u64>();
const MALLOC_ALIGN: usize = 8;

fn user_malloc(size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    let total = MALLOC_HEADER + size as usize;
    let layout = match Layout::from_size_align(total, MALLOC_ALIGN) {
        Ok(l) => l,
        Err(_) => return 0,
    };
    // SAFETY: `layout` is non-zero-sized and correctly aligned.
    let raw = unsafe { alloc::alloc::alloc(layout) };
    if raw.is_null() {
        return 0;
    }
    // SAFETY: `raw` is a fresh allocation of at least `MALLOC_HEADER` bytes.
    unsafe { core::ptr::write(raw as *mut u64, total as u64) };
    // SAFETY: `raw` has at least `total` bytes, `MALLOC_HEADER` of them
    // now spoken for by the header just written.
    unsafe { raw.add(MALLOC_HEADER) as u32 }
}

fn user_free(ptr: u32) {
    if ptr == 0 {
        return;
    }
    let raw = (ptr as usize - MALLOC_HEADER) as *mut u8;
    // SAFETY: `raw` is `ptr` minus exactly the header `user_malloc` added;
    // every live `ptr` this kernel hands out came from `user_malloc`.
    let total = unsafe { core::ptr::read(raw as *const u64) } as usize;
    if let Ok(layout) = Layout::from_size_align(total, MALLOC_ALIGN) {
        // SAFETY: `raw`/`layout` exactly match the `alloc` call that
        // produced this allocation.
        unsafe { alloc::alloc::dealloc(raw, layout) };
    }
}

// ---------------------------------------------------------------------------
// IPC
// ---------------------------------------------------------------------------

fn sys_send(dest: u32, msg_ptr: u32) -> Result<u32, KernelError> {
    let msg = user_message(msg_ptr)?;
    ipc::send(dest as Pid, msg)?;
    Ok(0)
}

fn sys_receive(from: u32, msg_ptr: u32) -> Result<u32, KernelError> {
    let msg = ipc::receive(from as Pid)?;
    write_user_message(msg_ptr, &msg)?;
    Ok(0)
}

fn sys_sendrec(dest: u32, msg_ptr: u32) -> Result<u32, KernelError> {
    let msg = user_message(msg_ptr)?;
    let reply = ipc::sendrec(dest as Pid, msg)?;
    write_user_message(msg_ptr, &reply)?;
    Ok(0)
}

fn sys_reply(dest: u32, msg_ptr: u32) -> Result<u32, KernelError> {
    let msg = user_message(msg_ptr)?;
    ipc::reply(dest as Pid, msg)?;
    Ok(0)
}

fn sys_notify(dest: u32, msg_ptr: u32) -> Result<u32, KernelError> {
    let msg = user_message(msg_ptr)?;
    ipc::notify(dest as Pid, msg)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

fn sys_register_service(name_ptr: u32) -> Result<u32, KernelError> {
    let name = user_name(name_ptr)?;
    registry::register(&name, sched::current_pid())?;
    Ok(0)
}

fn sys_lookup_service(name_ptr: u32) -> Result<u32, KernelError> {
    let name = user_name(name_ptr)?;
    registry::lookup(&name).ok_or(KernelError::NotFound {
        resource: "service",
        id: 0,
    })
}

// ---------------------------------------------------------------------------
// Privilege
// ---------------------------------------------------------------------------

/// Grants `target` I/O privilege. Unconditional: any task may grant it to
/// any other, there being no finer-grained capability model in this core.
fn sys_grant_io(target: u32) -> Result<u32, KernelError> {
    TASK_TABLE.with_mut(|table| match table.get_mut(target as Pid) {
        Some(p) => {
            p.io_privilege = true;
            Ok(0)
        }
        None => Err(KernelError::ProcessNotFound { pid: target }),
    })
}

/// Registers the calling task as the owner of `irq`. Future occurrences of
/// that line are delivered to it as a notification (see
/// [`crate::irq::handle_irq`]).
fn sys_register_irq(irq: u32) -> Result<u32, KernelError> {
    let caller = sched::current_pid();
    TASK_TABLE.with_mut(|table| match table.get_mut(caller) {
        Some(p) => {
            p.owned_irq = Some(irq as u8);
            Ok(0)
        }
        None => Err(KernelError::ProcessNotFound { pid: caller }),
    })
}

fn sys_create_task(name_ptr: u32, entry: u32, priority: u32) -> Result<u32, KernelError> {
    let name = user_name(name_ptr)?;
    // SAFETY: the caller promises `entry` names a valid, never-returning,
    // C-ABI entry point; the kernel never calls it directly, only installs
    // it as a brand-new task's saved instruction pointer.
    let entry: extern "C" fn() -> ! = unsafe { core::mem::transmute(entry as usize) };
    sched::spawn_kernel_task(&name, entry, priority as u8)
}

// ---------------------------------------------------------------------------
// Debug
// ---------------------------------------------------------------------------

fn sys_debug_log(str_ptr: u32, len: u32) -> Result<u32, KernelError> {
    let bytes = user_bytes(str_ptr, len.min(127) as usize)?;
    let msg = core::str::from_utf8(bytes).unwrap_or("<invalid utf-8>");
    klog(LogLevel::Info, "user", msg);
    Ok(0)
}

// ---------------------------------------------------------------------------
// GPU pass-through
// ---------------------------------------------------------------------------

/// Opaque command-submission stub for the out-of-scope GPU driver
/// collaborator. Performs exactly the copy-from-user the real pass-through
/// would, then reports the driver as absent; a kernel built alongside an
/// actual GPU driver replaces this one function with the real hand-off.
fn sys_gpu_submit(buf: u32, len: u32) -> Result<u32, KernelError> {
    let _ = user_bytes(buf, len as usize)?;
    Err(KernelError::NotImplemented {
        feature: "gpu_submit",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_number_is_rejected() {
        let mut frame = InterruptFrame::blank();
        frame.eax = 9999;
        dispatch(&mut frame);
        assert!((frame.eax as i32) < 0);
    }

    #[test]
    fn null_pointer_is_rejected() {
        assert!(check_user_range(0, 10).is_err());
    }

    #[test]
    fn sub_user_base_pointer_is_rejected() {
        // A pointer into the kernel's low-memory region must never pass,
        // even though it's nonzero and its end is well under USER_ADDR_LIMIT
        // -- accepting it would let a syscall leak kernel memory.
        assert!(check_user_range(crate::mm::vmm::USER_BASE.as_u32() - 1, 10).is_err());
        assert!(check_user_range(0x1000, 10).is_err());
    }

    #[test]
    fn malloc_then_free_round_trips() {
        let ptr = user_malloc(64);
        assert_ne!(ptr, 0);
        user_free(ptr);
    }

    #[test]
    fn malloc_of_zero_returns_null() {
        assert_eq!(user_malloc(0), 0);
    }

    #[test]
    fn gpu_submit_reports_not_implemented() {
        let buf = [0u8; 8];
        let err = sys_gpu_submit(buf.as_ptr() as u32, buf.len() as u32).unwrap_err();
        assert!(matches!(err, KernelError::NotImplemented { .. }));
    }
}
