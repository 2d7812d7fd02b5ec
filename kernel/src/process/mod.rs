//! Process control blocks and the global task table.
//!
//! Scheduling policy and context-switch mechanics live in [`crate::sched`];
//! this module owns the PCB data structures themselves (see [`pcb`]) and
//! the fixed-size table that holds every active one (see [`table`]).

pub mod pcb;
pub mod table;

pub use pcb::{BlockingReason, IpcState, Kind, Pcb, Pid, TaskState, IDLE_PID, PID_ANY};
pub use table::{TaskTable, MAX_TASKS, TASK_TABLE};
