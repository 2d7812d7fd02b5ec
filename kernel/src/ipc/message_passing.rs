//! The five synchronous rendezvous primitives: send, receive, sendrec,
//! reply, notify. Everything here operates directly on PCB-resident state
//! (`Pcb::ipc`) in the global task table; there is no separate queue or
//! endpoint object.
//!
//! The copy out of the *sender's* buffer into kernel-resident scratch
//! happens eagerly, inside these functions, while the sender's own address
//! space is still current -- never lazily at delivery time when the
//! receiver's address space is current. A blocked/sendrec sender's reply
//! is handed back the same way: written into its scratch while the
//! replier is current, read out of it once the original caller resumes.

use super::message::Message;
use crate::error::{IpcError, KernelError};
use crate::process::table::TASK_TABLE;
use crate::process::{BlockingReason, Pid, TaskState, PID_ANY};
use crate::sched;

fn process_exists(pid: Pid) -> bool {
    TASK_TABLE.with(|table| table.get(pid).is_some())
}

fn receiver_ready_for(table: &crate::process::table::TaskTable, dest: Pid, from: Pid) -> bool {
    matches!(table.get(dest), Some(d) if d.state == TaskState::Blocked
        && d.ipc.blocking_reason == BlockingReason::Receive
        && (d.ipc.peer == PID_ANY || d.ipc.peer == from))
}

/// Sends `msg` to `dest`, blocking the caller until `dest` receives it.
/// Delivers immediately if `dest` is already parked in [`receive`] waiting
/// for this sender (or for anyone).
pub fn send(dest: Pid, msg: Message) -> Result<(), KernelError> {
    let caller = sched::current_pid();
    if !process_exists(dest) {
        return Err(IpcError::ProcessNotFound { pid: dest }.into());
    }
    let mut m = msg;
    m.sender = caller;

    let delivered = TASK_TABLE.with_mut(|table| {
        if receiver_ready_for(table, dest, caller) {
            if let Some(d) = table.get_mut(dest) {
                d.ipc.scratch = m;
                d.ipc.peer = caller;
                d.ipc.blocking_reason = BlockingReason::None;
                d.state = TaskState::Ready;
            }
            true
        } else {
            false
        }
    });

    if delivered {
        return Ok(());
    }

    TASK_TABLE.with_mut(|table| {
        if let Some(c) = table.get_mut(caller) {
            c.ipc.blocking_reason = BlockingReason::Send;
            c.ipc.peer = dest;
            c.ipc.scratch = m;
            c.state = TaskState::Blocked;
        }
    });
    sched::block_until_ready();
    TASK_TABLE.with_mut(|table| {
        if let Some(c) = table.get_mut(caller) {
            c.ipc.blocking_reason = BlockingReason::None;
        }
    });
    Ok(())
}

/// Receives a message, optionally restricted to a specific sender
/// (`PID_ANY` accepts any). Pending notifications are drained before any
/// blocked sender is considered.
pub fn receive(from: Pid) -> Result<Message, KernelError> {
    let caller = sched::current_pid();

    if let Some(m) =
        TASK_TABLE.with_mut(|table| table.get_mut(caller).and_then(|c| c.ipc.pending.take()))
    {
        return Ok(m);
    }

    let sender_pid = TASK_TABLE.with(|table| {
        table
            .iter()
            .find(|p| {
                matches!(
                    p.ipc.blocking_reason,
                    BlockingReason::Send | BlockingReason::SendRec
                ) && p.ipc.peer == caller
                    && (from == PID_ANY || p.pid == from)
            })
            .map(|p| p.pid)
    });

    if let Some(sender_pid) = sender_pid {
        let msg = TASK_TABLE.with_mut(|table| {
            let mut out = table.get(sender_pid).map(|p| p.ipc.scratch).unwrap();
            out.sender = sender_pid;
            if let Some(s) = table.get_mut(sender_pid) {
                if s.ipc.blocking_reason == BlockingReason::Send {
                    s.state = TaskState::Ready;
                    s.ipc.blocking_reason = BlockingReason::None;
                }
                // BlockingReason::SendRec stays blocked, awaiting reply.
            }
            out
        });
        return Ok(msg);
    }

    TASK_TABLE.with_mut(|table| {
        if let Some(c) = table.get_mut(caller) {
            c.ipc.blocking_reason = BlockingReason::Receive;
            c.ipc.peer = from;
            c.state = TaskState::Blocked;
        }
    });
    sched::block_until_ready();

    let delivered = TASK_TABLE
        .with_mut(|table| {
            table.get_mut(caller).map(|c| {
                c.ipc.blocking_reason = BlockingReason::None;
                c.ipc.scratch
            })
        })
        .unwrap();
    Ok(delivered)
}

/// Sends `msg` to `dest` and waits for its reply into the same logical
/// buffer. Attempts fast delivery exactly like [`send`]; either way the
/// caller becomes `blocked/sendrec` before returning to the scheduler, so
/// it never resumes until [`reply`] is called on its behalf.
pub fn sendrec(dest: Pid, msg: Message) -> Result<Message, KernelError> {
    let caller = sched::current_pid();
    if !process_exists(dest) {
        return Err(IpcError::ProcessNotFound { pid: dest }.into());
    }
    let mut m = msg;
    m.sender = caller;

    let delivered = TASK_TABLE.with_mut(|table| {
        if receiver_ready_for(table, dest, caller) {
            if let Some(d) = table.get_mut(dest) {
                d.ipc.scratch = m;
                d.ipc.peer = caller;
                d.ipc.blocking_reason = BlockingReason::None;
                d.state = TaskState::Ready;
            }
            true
        } else {
            false
        }
    });

    TASK_TABLE.with_mut(|table| {
        if let Some(c) = table.get_mut(caller) {
            c.ipc.blocking_reason = BlockingReason::SendRec;
            c.ipc.peer = dest;
            if !delivered {
                c.ipc.scratch = m;
            }
            c.state = TaskState::Blocked;
        }
    });
    sched::block_until_ready();

    let reply = TASK_TABLE
        .with_mut(|table| {
            table.get_mut(caller).map(|c| {
                c.ipc.blocking_reason = BlockingReason::None;
                c.ipc.scratch
            })
        })
        .unwrap();
    Ok(reply)
}

/// Replies to a task blocked in `sendrec`. Fails if `dest` is not
/// currently waiting for a reply.
pub fn reply(dest: Pid, msg: Message) -> Result<(), KernelError> {
    let caller = sched::current_pid();
    let mut m = msg;
    m.sender = caller;

    let ok = TASK_TABLE.with_mut(|table| match table.get_mut(dest) {
        Some(d) if d.ipc.blocking_reason == BlockingReason::SendRec => {
            d.ipc.scratch = m;
            d.ipc.blocking_reason = BlockingReason::None;
            d.state = TaskState::Ready;
            true
        }
        _ => false,
    });

    if ok {
        Ok(())
    } else {
        Err(IpcError::NotInReplyState { pid: dest }.into())
    }
}

/// Non-blocking kernel-originated notification. Delivered immediately if
/// `dest` is parked in [`receive`]; otherwise coalesced into its pending
/// slot, replacing any notification already waiting there.
pub fn notify(dest: Pid, msg: Message) -> Result<(), KernelError> {
    if !process_exists(dest) {
        return Err(IpcError::ProcessNotFound { pid: dest }.into());
    }
    let mut m = msg;
    m.sender = 0;

    TASK_TABLE.with_mut(|table| {
        if let Some(d) = table.get_mut(dest) {
            if d.state == TaskState::Blocked && d.ipc.blocking_reason == BlockingReason::Receive {
                d.ipc.scratch = m;
                d.ipc.peer = 0;
                d.ipc.blocking_reason = BlockingReason::None;
                d.state = TaskState::Ready;
            } else {
                d.ipc.pending = Some(m);
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;

    fn spawn(table: &mut crate::process::table::TaskTable, name: &str) -> Pid {
        table
            .insert(|pid| Pcb::new_kernel_task(pid, name, 5, 0, 0, 0))
            .unwrap()
    }

    #[test]
    fn send_to_terminated_process_fails() {
        crate::process::table::init();
        let err = send(9999, Message::empty()).unwrap_err();
        assert!(matches!(err, KernelError::IpcError(IpcError::ProcessNotFound { .. })));
    }

    #[test]
    fn notify_delivers_immediately_to_blocked_receiver() {
        crate::process::table::init();
        let receiver = TASK_TABLE.with_mut(|table| spawn(table, "recv"));
        TASK_TABLE.with_mut(|table| {
            let r = table.get_mut(receiver).unwrap();
            r.ipc.blocking_reason = BlockingReason::Receive;
            r.ipc.peer = PID_ANY;
            r.state = TaskState::Blocked;
        });

        notify(receiver, Message::irq_notification(1, 42)).unwrap();

        TASK_TABLE.with(|table| {
            let r = table.get(receiver).unwrap();
            assert_eq!(r.state, TaskState::Ready);
            assert_eq!(r.ipc.blocking_reason, BlockingReason::None);
            assert_eq!(r.ipc.scratch.sender, 0);
        });
    }

    #[test]
    fn notify_coalesces_into_pending_when_not_receiving() {
        crate::process::table::init();
        let target = TASK_TABLE.with_mut(|table| spawn(table, "t"));

        notify(target, Message::irq_notification(1, 1)).unwrap();
        notify(target, Message::irq_notification(1, 2)).unwrap();

        TASK_TABLE.with(|table| {
            let t = table.get(target).unwrap();
            let pending = t.ipc.pending.unwrap();
            // SAFETY: test just wrote this variant.
            let irq = unsafe { pending.payload.irq };
            assert_eq!(irq.ticks, 2);
        });
    }

    #[test]
    fn reply_to_task_not_in_sendrec_fails() {
        crate::process::table::init();
        let target = TASK_TABLE.with_mut(|table| spawn(table, "t"));
        let err = reply(target, Message::empty()).unwrap_err();
        assert!(matches!(
            err,
            KernelError::IpcError(IpcError::NotInReplyState { .. })
        ));
    }

    #[test]
    fn reply_wakes_sendrec_caller_with_message() {
        crate::process::table::init();
        let caller = TASK_TABLE.with_mut(|table| spawn(table, "c"));
        TASK_TABLE.with_mut(|table| {
            let c = table.get_mut(caller).unwrap();
            c.ipc.blocking_reason = BlockingReason::SendRec;
            c.state = TaskState::Blocked;
        });

        reply(caller, Message::irq_notification(2, 7)).unwrap();

        TASK_TABLE.with(|table| {
            let c = table.get(caller).unwrap();
            assert_eq!(c.state, TaskState::Ready);
            assert_eq!(c.ipc.blocking_reason, BlockingReason::None);
        });
    }
}
