//! Per-CPU IRP timeout queues.
//!
//! Grounded on `irp.h`'s `irp_timeout_add`/`irp_timeout_remove`/
//! `irp_timeouts_check`, combined with the teacher's "one structure per
//! CPU, touched only by its owner" idiom (`sched::smp::CpuInfo`).

use alloc::vec::Vec;

use spin::Mutex;

use super::pool::{Irp, IrpStatus};

/// Upper bound on simultaneously-scheduled CPUs. Kept local to the IRP
/// fabric rather than imported from `sched` so this module has no
/// dependency on scheduler internals; the scheduler's own `MAX_CPUS`
/// (`sched::smp`) uses the same value.
pub const MAX_CPUS: usize = 32;

struct TimeoutEntry {
    // SAFETY: IRP pools are allocated once at boot and never freed, so
    // IRPs living in them are valid for the kernel's lifetime; this
    // queue never outlives the pool it references.
    irp: *const Irp,
    deadline: u64,
}

unsafe impl Send for TimeoutEntry {}

struct CpuTimeoutQueue {
    entries: Mutex<Vec<TimeoutEntry>>,
}

impl CpuTimeoutQueue {
    const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

// Mutex<Vec<_>> isn't `Sync` automatically for a `const` array initializer
// in stable Rust without a helper; build it via a small fixed array
// constructor instead of array-repeat (TimeoutEntry isn't Copy).
const EMPTY_QUEUE: CpuTimeoutQueue = CpuTimeoutQueue::new();
static PER_CPU_TIMEOUTS: [CpuTimeoutQueue; MAX_CPUS] = [EMPTY_QUEUE; MAX_CPUS];

fn queue_for(cpu: usize) -> &'static CpuTimeoutQueue {
    &PER_CPU_TIMEOUTS[cpu % MAX_CPUS]
}

/// Insert `irp` into `cpu`'s timeout queue, with a deadline computed from
/// `irp.timeout` and the current tick count supplied by the caller (the
/// timer subsystem's monotonic clock).
pub fn timeout_add(irp: &Irp, cpu: usize, now_ticks: u64) {
    let deadline = now_ticks.saturating_add(irp.timeout);
    irp.deadline.store(deadline, core::sync::atomic::Ordering::Release);
    irp.cpu.store(cpu as u64, core::sync::atomic::Ordering::Release);
    irp.mark_in_timeout_queue(true);
    queue_for(cpu).entries.lock().push(TimeoutEntry {
        irp: irp as *const Irp,
        deadline,
    });
}

/// Remove `irp` from whichever per-CPU timeout queue holds it, if any.
/// Idempotent: called unconditionally from [`Irp::complete`] on the final
/// unwind, whether or not the IRP was ever added to a timeout queue.
pub(super) fn timeout_remove(irp: &Irp) {
    if !irp.in_timeout_queue() {
        return;
    }
    let cpu = irp.cpu.load(core::sync::atomic::Ordering::Acquire) as usize;
    let mut entries = queue_for(cpu).entries.lock();
    let ptr = irp as *const Irp;
    entries.retain(|e| e.irp != ptr);
    irp.mark_in_timeout_queue(false);
}

/// Walk `cpu`'s timeout queue and cancel every IRP whose deadline has
/// passed. Driven by the timer tick handler.
pub fn timeouts_check(cpu: usize, now_ticks: u64) {
    let expired: Vec<*const Irp> = {
        let entries = queue_for(cpu).entries.lock();
        entries
            .iter()
            .filter(|e| e.deadline <= now_ticks)
            .map(|e| e.irp)
            .collect()
    };
    for ptr in expired {
        // SAFETY: see `TimeoutEntry::irp`.
        let irp = unsafe { &*ptr };
        let _ = irp.cancel(IrpStatus::TimedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irp::pool::{IrpFlags, IrpPool, Verb};

    #[test]
    fn expired_irp_is_cancelled_on_check() {
        let pool = IrpPool::new(2, 0);
        let irp = pool.alloc(Verb::NanoSleep, IrpFlags::empty(), false).unwrap();
        irp.push(|irp| irp.complete(), 0).unwrap();
        // Can't mutate `timeout` through `&Irp`; emulate the deadline
        // directly as `timeout_add` would compute it.
        timeout_add(irp, 0, 0);
        irp.deadline.store(5, core::sync::atomic::Ordering::Release);

        timeouts_check(0, 10);
        assert_eq!(irp.status(), IrpStatus::TimedOut);
        irp.complete();
        pool.free(irp);
    }

    #[test]
    fn unexpired_irp_survives_check() {
        let pool = IrpPool::new(2, 0);
        let irp = pool.alloc(Verb::NanoSleep, IrpFlags::empty(), false).unwrap();
        irp.push(|irp| irp.complete(), 0).unwrap();
        timeout_add(irp, 1, 100);
        timeouts_check(1, 50);
        assert_eq!(irp.status(), IrpStatus::InProgress);
        timeout_remove(irp);
        irp.complete();
        pool.free(irp);
    }
}
