//! Global task table: a single flat fixed-size array of PCB slots, scanned
//! directly by the scheduler. No SMP run-queue-per-core, no BTreeMap, no
//! dynamic growth — the table is the whole of process bookkeeping.

use spin::Mutex;

use super::pcb::Pcb;
use crate::error::{KernelError, SchedError};
use crate::sync::once_lock::GlobalState;

/// Upper bound on simultaneously active tasks.
pub const MAX_TASKS: usize = 64;

pub struct TaskTable {
    slots: [Option<Pcb>; MAX_TASKS],
    next_pid: u32,
}

impl TaskTable {
    pub(crate) const fn new() -> Self {
        TaskTable {
            slots: [const { None }; MAX_TASKS],
            next_pid: 1,
        }
    }

    fn alloc_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    pub fn get(&self, pid: u32) -> Option<&Pcb> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.active && p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Pcb> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.active && p.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().flatten().filter(|p| p.active)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().flatten().filter(|p| p.active)
    }

    /// Slot index (stable for the lifetime of the PCB) of a given PID, used
    /// by the round-robin scheduler to compute "one slot past current".
    pub fn slot_of(&self, pid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(p) if p.active && p.pid == pid))
    }

    pub fn slot(&self, index: usize) -> Option<&Pcb> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn slot_count(&self) -> usize {
        MAX_TASKS
    }

    pub(crate) fn insert(&mut self, build: impl FnOnce(u32) -> Pcb) -> Result<u32, KernelError> {
        let index = self.find_free_slot().ok_or(SchedError::TableFull)?;
        let pid = self.alloc_pid();
        self.slots[index] = Some(build(pid));
        Ok(pid)
    }

    /// Installs the fixed idle task at slot 0 / PID 0, bypassing
    /// `alloc_pid` (which starts at 1). Must run before any other
    /// insertion claims slot 0.
    pub(crate) fn insert_idle(&mut self, build: impl FnOnce(u32) -> Pcb) -> Result<(), KernelError> {
        if self.slots[0].is_some() {
            return Err(SchedError::TableFull.into());
        }
        self.slots[0] = Some(build(0));
        Ok(())
    }

    /// Removes a terminated task's slot entirely, freeing it for reuse.
    pub fn remove(&mut self, pid: u32) -> Option<Pcb> {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(p) if p.pid == pid) {
                return slot.take();
            }
        }
        None
    }
}

static TASK_TABLE_STATE: GlobalState<Mutex<TaskTable>> = GlobalState::new();

/// Zero-sized handle exposing the single global task table.
pub struct TaskTableHandle;
pub static TASK_TABLE: TaskTableHandle = TaskTableHandle;

impl TaskTableHandle {
    pub fn with<R>(&self, f: impl FnOnce(&TaskTable) -> R) -> R {
        TASK_TABLE_STATE
            .with(|lock| f(&lock.lock()))
            .expect("task table used before init")
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut TaskTable) -> R) -> R {
        TASK_TABLE_STATE
            .with(|lock| f(&mut lock.lock()))
            .expect("task table used before init")
    }

    pub fn insert(&self, build: impl FnOnce(u32) -> Pcb) -> Result<u32, KernelError> {
        self.with_mut(|table| table.insert(build).map_err(KernelError::from))
    }

    /// Installs the fixed idle task at PID 0. See [`TaskTable::insert_idle`].
    pub fn insert_idle(&self, build: impl FnOnce(u32) -> Pcb) -> Result<(), KernelError> {
        self.with_mut(|table| table.insert_idle(build))
    }
}

pub fn init() {
    let _ = TASK_TABLE_STATE.init(Mutex::new(TaskTable::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;

    fn fresh_table() -> TaskTable {
        TaskTable::new()
    }

    #[test]
    fn insert_assigns_increasing_pids() {
        let mut table = fresh_table();
        let a = table
            .insert(|pid| Pcb::new_kernel_task(pid, "a", 0, 0, 0, 0))
            .unwrap();
        let b = table
            .insert(|pid| Pcb::new_kernel_task(pid, "b", 0, 0, 0, 0))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn table_full_once_max_tasks_reached() {
        let mut table = fresh_table();
        for _ in 0..MAX_TASKS {
            table
                .insert(|pid| Pcb::new_kernel_task(pid, "t", 0, 0, 0, 0))
                .unwrap();
        }
        assert!(table
            .insert(|pid| Pcb::new_kernel_task(pid, "overflow", 0, 0, 0, 0))
            .is_err());
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut table = fresh_table();
        let pid = table
            .insert(|pid| Pcb::new_kernel_task(pid, "a", 0, 0, 0, 0))
            .unwrap();
        assert!(table.remove(pid).is_some());
        assert!(table.get(pid).is_none());
    }
}
