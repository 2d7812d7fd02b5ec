//! Synchronous rendezvous IPC and the service name registry.
//!
//! Five primitives -- send, receive, sendrec, reply, notify -- operating
//! directly on PCB-resident state in the global task table (see
//! [`message_passing`]), plus a small fixed-capacity name->PID registry
//! (see [`registry`]). No async channels, no shared-memory fast path, no
//! capability transfer, no rate limiting, no RPC layer: this is the entire
//! IPC surface.

pub mod message;
pub mod message_passing;
pub mod registry;

pub use message::{Message, MessageType};
pub use message_passing::{notify, receive, reply, send, sendrec};

/// Brings up the service registry. The task table itself is initialized by
/// [`crate::sched::init`], which must run first.
pub fn init() {
    registry::init();
    log::info!("ipc: registry initialized");
}
