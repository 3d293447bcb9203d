//! I/O Request Packet (IRP) fabric.
//!
//! The asynchronous, layered, completion-based request primitive used by
//! the ring-based syscall interface and by internal kernel subsystems
//! (VFS, futex waits, timers). Not present in the teacher kernel; grounded
//! directly on `original_source/include/kernel/io/irp.h` and expressed in
//! the teacher's idiom (fixed-size `Mutex`-guarded arenas, per-CPU
//! structures touched only by their owning CPU).
//!
//! See [`pool::Irp`] for the request structure and its completion-stack
//! and cancellation contract, [`timeout`] for the per-CPU deadline queues,
//! and [`dispatch`] for verb routing.

pub mod dispatch;
pub mod pool;
pub mod timeout;

pub use dispatch::{dispatch, finalize, register, run_leave, DispatchEntry};
pub use pool::{
    CancelFn, CancelOutcome, Irp, IrpFlags, IrpLoc, IrpPool, IrpStatus, Verb, IRP_ARGS_MAX,
    IRP_LOC_MAX,
};
pub use timeout::{timeout_add, timeouts_check, MAX_CPUS};
