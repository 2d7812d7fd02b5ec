//! The 64-byte IPC message: a sender PID, a type tag, and a payload union
//! of the shapes the five IPC primitives and their users actually need.
//!
//! The fixed size is deliberate: each message fits in a cache line and the
//! kernel copies it without heap allocation, straight into a PCB-resident
//! scratch area (see [`crate::process::pcb`]).

use core::mem::size_of;

pub const MESSAGE_SIZE: usize = 64;

/// Discriminates [`Payload`]. Kept as a plain `u32` rather than a Rust enum
/// tag over the union so the wire layout is exactly the C-style tagged
/// union user programs link against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Empty = 0,
    IoRequest = 1,
    Irq = 2,
    Reply = 3,
    ServiceRegister = 4,
    Console = 5,
}

impl MessageType {
    pub const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::IoRequest,
            2 => Self::Irq,
            3 => Self::Reply,
            4 => Self::ServiceRegister,
            5 => Self::Console,
            _ => Self::Empty,
        }
    }
}

/// Generic I/O request: a path-relative offset/size pair plus the virtual
/// address of the caller's buffer, interpreted by whatever server owns the
/// resource named by the request (out of scope for the core itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IoRequest {
    pub offset: u32,
    pub size: u32,
    pub buffer: u32,
    pub _pad: u32,
}

/// IRQ notification payload, delivered via [`super::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IrqNotification {
    pub irq: u32,
    pub ticks: u32,
}

/// Reply payload for [`super::reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ReplyPayload {
    pub status: i32,
    pub value: u32,
    pub size: u32,
    pub data: [u8; 20],
}

/// Service registration payload for the name registry syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ServiceRegistration {
    pub name: [u8; 16],
    pub pid: u32,
}

/// Console I/O payload: a short run of bytes plus a foreground color, used
/// by the (out-of-scope) console server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ConsoleIo {
    pub len: u32,
    pub color: u32,
    pub bytes: [u8; 24],
}

/// Raw bytes large enough for the biggest payload variant, used as the
/// union's storage and for whole-message byte access.
const PAYLOAD_SIZE: usize = MESSAGE_SIZE - 8;

#[derive(Clone, Copy)]
#[repr(C)]
pub union Payload {
    pub raw: [u8; PAYLOAD_SIZE],
    pub io: IoRequest,
    pub irq: IrqNotification,
    pub reply: ReplyPayload,
    pub service: ServiceRegistration,
    pub console: ConsoleIo,
}

/// The fixed-size message passed by every IPC primitive.
///
/// `sender` is written by the kernel on delivery and must never be trusted
/// when it arrives from user space in a send/sendrec/reply call (those
/// primitives overwrite it unconditionally before copying into the
/// receiver's scratch).
#[repr(C)]
pub struct Message {
    pub sender: u32,
    pub msg_type: u32,
    pub payload: Payload,
}

const _: () = assert!(size_of::<Message>() == MESSAGE_SIZE);

impl Clone for Message {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for Message {}

impl Message {
    pub const fn empty() -> Self {
        Message {
            sender: 0,
            msg_type: MessageType::Empty as u32,
            payload: Payload {
                raw: [0; PAYLOAD_SIZE],
            },
        }
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_u32(self.msg_type)
    }

    /// View the message as a byte slice, for copying to/from user memory
    /// or across a PCB-resident scratch buffer.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        // SAFETY: `Message` is `repr(C)` and exactly `MESSAGE_SIZE` bytes,
        // asserted above; every bit pattern is a valid `[u8; N]`.
        unsafe { &*(self as *const Self as *const [u8; MESSAGE_SIZE]) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; MESSAGE_SIZE] {
        // SAFETY: same as `as_bytes`.
        unsafe { &mut *(self as *mut Self as *mut [u8; MESSAGE_SIZE]) }
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_SIZE]) -> Self {
        // SAFETY: the union accepts any bit pattern in its `raw` field and
        // the struct has no padding beyond that guaranteed by `repr(C)`.
        unsafe { core::mem::transmute(bytes) }
    }

    pub fn irq_notification(irq: u32, ticks: u32) -> Self {
        Message {
            sender: 0,
            msg_type: MessageType::Irq as u32,
            payload: Payload {
                irq: IrqNotification { irq, ticks },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_exactly_64_bytes() {
        assert_eq!(size_of::<Message>(), MESSAGE_SIZE);
    }

    #[test]
    fn byte_round_trip_preserves_payload() {
        let m = Message::irq_notification(1, 100);
        let bytes = *m.as_bytes();
        let m2 = Message::from_bytes(bytes);
        assert_eq!(m2.message_type(), MessageType::Irq);
        // SAFETY: test just wrote this variant above.
        let irq = unsafe { m2.payload.irq };
        assert_eq!(irq.irq, 1);
        assert_eq!(irq.ticks, 100);
    }

    #[test]
    fn empty_message_has_zero_sender() {
        let m = Message::empty();
        assert_eq!(m.sender, 0);
        assert_eq!(m.message_type(), MessageType::Empty);
    }
}
