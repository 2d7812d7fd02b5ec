//! IPC integration tests exercising the primitives against the real task
//! table, rather than against bare structs.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use veridian_kernel::ipc::{self, Message};
use veridian_kernel::process::table::TASK_TABLE;
use veridian_kernel::process::{BlockingReason, Pcb, TaskState, PID_ANY};
use veridian_kernel::{serial_println, Pid};

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("IPC Integration Tests");

    veridian_kernel::process::table::init();
    ipc::registry::init();

    test_send_to_unknown_pid_fails();
    test_notify_delivers_to_waiting_receiver();
    test_notify_coalesces_when_receiver_busy();
    test_reply_requires_sendrec_state();

    serial_println!("All tests passed!");
    veridian_kernel::exit_qemu(veridian_kernel::QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::test_panic_handler(info)
}

fn spawn(name: &str) -> Pid {
    TASK_TABLE
        .with_mut(|table| table.insert(|pid| Pcb::new_kernel_task(pid, name, 10, 0, 0, 0)))
        .unwrap()
}

fn test_send_to_unknown_pid_fails() {
    let err = ipc::send(0xbeef, Message::empty()).unwrap_err();
    serial_println!("unknown-pid send rejected: {}", err);
    serial_println!("test_send_to_unknown_pid_fails... [ok]");
}

fn test_notify_delivers_to_waiting_receiver() {
    let receiver = spawn("waiting-receiver");
    TASK_TABLE.with_mut(|table| {
        let r = table.get_mut(receiver).unwrap();
        r.ipc.blocking_reason = BlockingReason::Receive;
        r.ipc.peer = PID_ANY;
        r.state = TaskState::Blocked;
    });

    ipc::notify(receiver, Message::irq_notification(1, 42)).unwrap();

    TASK_TABLE.with(|table| {
        let r = table.get(receiver).unwrap();
        assert_eq!(r.state, TaskState::Ready);
        assert_eq!(r.ipc.blocking_reason, BlockingReason::None);
    });
    serial_println!("test_notify_delivers_to_waiting_receiver... [ok]");
}

fn test_notify_coalesces_when_receiver_busy() {
    let target = spawn("busy-target");

    ipc::notify(target, Message::irq_notification(2, 1)).unwrap();
    ipc::notify(target, Message::irq_notification(2, 2)).unwrap();

    TASK_TABLE.with(|table| {
        let t = table.get(target).unwrap();
        let pending = t.ipc.pending.expect("notify should have queued a message");
        // SAFETY: both notifications above wrote the `irq` variant.
        let irq = unsafe { pending.payload.irq };
        assert_eq!(irq.ticks, 2, "later notification should replace the earlier one");
    });
    serial_println!("test_notify_coalesces_when_receiver_busy... [ok]");
}

fn test_reply_requires_sendrec_state() {
    let target = spawn("not-in-sendrec");
    let err = ipc::reply(target, Message::empty()).unwrap_err();
    serial_println!("reply without sendrec rejected: {}", err);

    TASK_TABLE.with_mut(|table| {
        let t = table.get_mut(target).unwrap();
        t.ipc.blocking_reason = BlockingReason::SendRec;
        t.state = TaskState::Blocked;
    });
    ipc::reply(target, Message::irq_notification(3, 5)).unwrap();
    TASK_TABLE.with(|table| {
        let t = table.get(target).unwrap();
        assert_eq!(t.state, TaskState::Ready);
    });
    serial_println!("test_reply_requires_sendrec_state... [ok]");
}
