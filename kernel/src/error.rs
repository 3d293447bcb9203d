//! Kernel-wide error types.
//!
//! Every subsystem defines its own closed error enum; this module collects
//! them into one `KernelError` sum type via `From`, so call sites several
//! layers removed from a subsystem can still propagate with `?`.

use core::fmt;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
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

    ProcessNotFound {
        pid: u64,
    },
    ThreadNotFound {
        tid: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    PageTable(PageTableError),
    AddressSpace(AddressSpaceError),
    Irp(IrpError),
    Scheduler(SchedError),
    Syscall(SyscallError),
    FsError(FsError),

    HardwareError {
        device: &'static str,
        code: u32,
    },

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
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    NotImplemented {
        feature: &'static str,
    },
    WouldBlock,
    BrokenPipe,
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Page-table-layer errors (`mm::page_table`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableError {
    FrameAllocationFailed,
    AlreadyMapped { addr: usize },
    NotMapped { addr: usize },
    Pinned { addr: usize },
    MisalignedAddress { addr: usize },
    NoUnmappedRegion { len: usize },
    TooManyCallbacks,
}

/// Address-space errors (`mm::vas`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    OutOfRange { addr: usize },
    Overlaps { addr: usize, len: usize },
    PinCountUnderflow { addr: usize },
    ShootdownRingFull { cpu: usize },
    ShootdownTimeout { cpu: usize },
}

/// IRP fabric errors (`irp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrpError {
    PoolExhausted,
    AlreadyCancelled,
    AlreadyClaimed,
    StackOverflow,
    StackUnderflow,
    UnknownVerb { verb: u32 },
}

/// Scheduler errors (`sched`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidPriority { priority: u8 },
    InvalidCpuId { cpu: usize },
    TaskNotFound { id: u64 },
    CpuOffline { cpu: usize },
    InvalidAffinity,
    QueueEmpty,
    AlreadyScheduled,
}

/// Syscall-dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: usize },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
    StringTooLong { max: usize },
    AccessDenied,
    NotImplemented,
}

/// Filesystem errors (`fs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    NotADirectory,
    NotAFile,
    IsADirectory,
    ReadOnly,
    InvalidPath,
    NoRootFs,
    AlreadyMounted,
    NotMounted,
    UnknownFsType,
    IoError,
    DirectoryNotEmpty,
    TooManyOpenFiles,
    BadFileDescriptor,
    NotSupported,
    NotASymlink,
    FileTooLarge,
    CrossesMount,
    NameTooLong,
    LoopDetected,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "thread {} not found", tid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::PageTable(e) => write!(f, "page table error: {:?}", e),
            Self::AddressSpace(e) => write!(f, "address space error: {:?}", e),
            Self::Irp(e) => write!(f, "irp error: {:?}", e),
            Self::Scheduler(e) => write!(f, "scheduler error: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall error: {:?}", e),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
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
            Self::Timeout {
                operation,
                duration_ms,
            } => write!(f, "timeout during {}: {} ms", operation, duration_ms),
            Self::NotImplemented { feature } => write!(f, "feature not implemented: {}", feature),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<PageTableError> for KernelError {
    fn from(err: PageTableError) -> Self {
        Self::PageTable(err)
    }
}

impl From<AddressSpaceError> for KernelError {
    fn from(err: AddressSpaceError) -> Self {
        Self::AddressSpace(err)
    }
}

impl From<IrpError> for KernelError {
    fn from(err: IrpError) -> Self {
        Self::Irp(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Scheduler(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}
