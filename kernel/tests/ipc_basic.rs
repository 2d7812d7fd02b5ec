//! IPC message and service-registry tests.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use veridian_kernel::serial_println;
use veridian_kernel::ipc;
use veridian_kernel::ipc::{Message, MessageType};

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("IPC Basic Tests");

    test_empty_message_is_typed_empty();
    test_irq_notification_round_trips_through_bytes();
    test_registry_register_then_lookup();
    test_registry_later_registration_wins();

    serial_println!("All tests passed!");
    veridian_kernel::exit_qemu(veridian_kernel::QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::test_panic_handler(info)
}

fn test_empty_message_is_typed_empty() {
    let msg = Message::empty();
    assert_eq!(msg.message_type(), MessageType::Empty);
    assert_eq!(msg.sender, 0);
    serial_println!("test_empty_message_is_typed_empty... [ok]");
}

fn test_irq_notification_round_trips_through_bytes() {
    let msg = Message::irq_notification(3, 99);
    let bytes = *msg.as_bytes();
    let back = Message::from_bytes(bytes);
    assert_eq!(back.message_type(), MessageType::Irq);
    // SAFETY: message_type() above confirms the active union variant.
    let irq = unsafe { back.payload.irq };
    assert_eq!(irq.irq, 3);
    assert_eq!(irq.ticks, 99);
    serial_println!("test_irq_notification_round_trips_through_bytes... [ok]");
}

fn test_registry_register_then_lookup() {
    ipc::registry::init();
    ipc::registry::register("svctest", 7).unwrap();
    assert_eq!(ipc::registry::lookup("svctest"), Some(7));
    serial_println!("test_registry_register_then_lookup... [ok]");
}

fn test_registry_later_registration_wins() {
    ipc::registry::register("svctest", 11).unwrap();
    assert_eq!(ipc::registry::lookup("svctest"), Some(11));
    serial_println!("test_registry_later_registration_wins... [ok]");
}
