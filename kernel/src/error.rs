//! Unified error type spanning every fallible boundary in the core.
//!
//! Internal APIs return `Result<T, KernelError>`; only the syscall/IPC ABI
//! boundary narrows this down to the small negative-integer sentinel
//! convention used by the dispatcher.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: u32,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// IPC-related errors
    IpcError(IpcError),

    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// System call errors
    SyscallError(SyscallError),

    /// Hardware errors
    HardwareError {
        device: &'static str,
        code: u32,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    NotImplemented {
        feature: &'static str,
    },
    /// Operation would block
    WouldBlock,
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// IPC-specific errors: generic failure, no-such-process, invalid-reply-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    InvalidArgument,
    ProcessNotFound { pid: u32 },
    NotInReplyState { pid: u32 },
    RegistryFull,
    WouldBlock,
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidPriority { priority: u8 },
    TaskNotFound { pid: u32 },
    TableFull,
}

/// System call errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: usize },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
    NotImplemented,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "out of memory: requested {} bytes, {} available",
                    requested, available
                )
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::IpcError(e) => write!(f, "IPC error: {:?}", e),
            Self::SchedulerError(e) => write!(f, "scheduler error: {:?}", e),
            Self::SyscallError(e) => write!(f, "syscall error: {:?}", e),
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code {:#x}", device, code)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::NotImplemented { feature } => {
                write!(f, "feature not implemented: {}", feature)
            }
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::IpcError(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::SyscallError(err)
    }
}

/// Narrows a [`KernelError`] to the small negative-integer sentinel
/// convention used at the syscall ABI boundary. Internal callers never see
/// these raw integers; only `syscall::dispatch` calls this.
pub fn to_syscall_errno(err: KernelError) -> isize {
    match err {
        KernelError::ProcessNotFound { .. } => -1,
        KernelError::IpcError(IpcError::NotInReplyState { .. }) => -2,
        KernelError::InvalidArgument { .. } | KernelError::SyscallError(_) => -3,
        KernelError::OutOfMemory { .. } | KernelError::ResourceExhausted { .. } => -4,
        KernelError::WouldBlock => -5,
        KernelError::NotImplemented { .. } | KernelError::OperationNotSupported { .. } => -6,
        KernelError::PermissionDenied { .. } => -7,
        _ => -8,
    }
}

#[macro_export]
macro_rules! kernel_error {
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::OutOfMemory {
            requested: $req,
            available: $avail,
        }
    };
    (ProcessNotFound { pid: $pid:expr }) => {
        $crate::error::KernelError::ProcessNotFound { pid: $pid }
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
