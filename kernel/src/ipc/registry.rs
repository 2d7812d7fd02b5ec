//! Service name registry: a fixed-capacity table mapping short names to the
//! PID currently providing them.
//!
//! Registration is last-write-wins: a process registering under a name
//! already held by someone else simply replaces the PID. There is no
//! automatic deregistration on process exit -- a later lookup can return a
//! PID that has since terminated. That's documented behavior, not a bug
//! (see `Pcb` lifecycle notes); callers that care must revalidate the PID
//! they get back.

use spin::Mutex;

use crate::error::{IpcError, KernelError};
use crate::process::Pid;
use crate::sync::once_lock::GlobalState;

/// Upper bound on distinct service names registered at once.
pub const MAX_SERVICES: usize = 32;

const NAME_LEN: usize = 16;

#[derive(Clone, Copy)]
struct Entry {
    name: [u8; NAME_LEN],
    pid: Pid,
    active: bool,
}

impl Entry {
    const EMPTY: Entry = Entry {
        name: [0; NAME_LEN],
        pid: 0,
        active: false,
    };
}

pub struct Registry {
    entries: [Entry; MAX_SERVICES],
}

fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut buf = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

impl Registry {
    const fn new() -> Self {
        Registry {
            entries: [Entry::EMPTY; MAX_SERVICES],
        }
    }

    /// Registers `pid` under `name`, replacing any existing active
    /// registration for that name. Fails only if the table is full and
    /// `name` is not already present.
    pub fn register(&mut self, name: &str, pid: Pid) -> Result<(), KernelError> {
        let key = encode_name(name);

        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.active && e.name == key)
        {
            e.pid = pid;
            return Ok(());
        }

        match self.entries.iter_mut().find(|e| !e.active) {
            Some(e) => {
                *e = Entry {
                    name: key,
                    pid,
                    active: true,
                };
                Ok(())
            }
            None => Err(IpcError::RegistryFull.into()),
        }
    }

    /// Looks up the PID currently registered under `name`, if any. May
    /// return the PID of a task that has since exited; see module docs.
    pub fn lookup(&self, name: &str) -> Option<Pid> {
        let key = encode_name(name);
        self.entries
            .iter()
            .find(|e| e.active && e.name == key)
            .map(|e| e.pid)
    }
}

static REGISTRY: GlobalState<Mutex<Registry>> = GlobalState::new();

pub fn init() {
    let _ = REGISTRY.init(Mutex::new(Registry::new()));
}

pub fn register(name: &str, pid: Pid) -> Result<(), KernelError> {
    REGISTRY
        .with(|lock| lock.lock().register(name, pid))
        .expect("service registry used before init")
}

pub fn lookup(name: &str) -> Option<Pid> {
    REGISTRY
        .with(|lock| lock.lock().lookup(name))
        .expect("service registry used before init")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_round_trips() {
        let mut reg = Registry::new();
        reg.register("fs", 7).unwrap();
        assert_eq!(reg.lookup("fs"), Some(7));
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut reg = Registry::new();
        reg.register("net", 3).unwrap();
        reg.register("net", 9).unwrap();
        assert_eq!(reg.lookup("net"), Some(9));
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let reg = Registry::new();
        assert_eq!(reg.lookup("nope"), None);
    }

    #[test]
    fn registry_full_once_max_services_reached() {
        let mut reg = Registry::new();
        for i in 0..MAX_SERVICES {
            let name = match i {
                0 => "svc0",
                _ => "svcN",
            };
            // distinct names: use pid to vary, name collisions would just
            // replace, so give each a unique name via a small lookup table
            let _ = name;
            reg.register(&alloc::format!("svc{i}"), i as Pid).unwrap();
        }
        assert!(reg.register("overflow", 999).is_err());
    }

    #[test]
    fn stale_pid_is_returned_after_no_deregistration() {
        let mut reg = Registry::new();
        reg.register("gone", 42).unwrap();
        // No unregister-on-exit call exists; a stale PID is expected back.
        assert_eq!(reg.lookup("gone"), Some(42));
    }
}
