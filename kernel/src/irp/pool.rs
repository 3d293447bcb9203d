//! The I/O Request Packet itself and the fixed-size arena it lives in.
//!
//! Grounded on `original_source/include/kernel/io/irp.h`: the field layout,
//! the layered completion-stack contract (`irp_push`/`irp_complete`), and
//! the cancellation race (`irp_set_cancel`/`irp_claim`/`irp_cancel`). The
//! pool/arena idiom (index-addressed, `O(1)` IRP-to-pool lookup) is
//! translated from the teacher's per-CPU arena style
//! (`sched::smp::CpuInfo`, `sched::task_ptr::TaskPtr`) rather than the
//! original's raw pointer arithmetic.

#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::error::IrpError;

/// Maximum depth of the completion stack carried by one IRP.
pub const IRP_LOC_MAX: usize = 8;

/// Maximum number of inline verb arguments an IRP can carry.
pub const IRP_ARGS_MAX: usize = 6;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrpFlags: u32 {
        const NONBLOCK      = 1 << 0;
        const USER          = 1 << 1;
        const HAS_DEADLINE  = 1 << 2;
    }
}

/// Operation tag carried by an IRP, dispatched by [`crate::irp::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Verb {
    Nop = 0,
    GetPid,
    Spawn,
    Exit,
    Kill,
    Open,
    Open2,
    OpenAt,
    Read,
    Write,
    Seek,
    Ioctl,
    Mmap,
    Poll,
    GetDents,
    Stat,
    Link,
    Remove,
    FutexWait,
    FutexWake,
    NanoSleep,
    Yield,
}

/// Live state and terminal outcome of an IRP, stored in `Irp::err`.
///
/// Mirrors the "special" values the original documents for the `err`
/// field: it is simultaneously a state machine and an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrpStatus {
    Ok,
    InProgress,
    TimedOut,
    Cancelled,
    Error(crate::error::FsError),
}

/// One frame of the layered completion stack.
#[derive(Clone, Copy)]
pub struct IrpLoc {
    pub complete: Option<fn(&Irp)>,
    pub ctx: usize,
}

impl IrpLoc {
    const fn empty() -> Self {
        Self {
            complete: None,
            ctx: 0,
        }
    }
}

/// A cancellation callback. Returns whether it fully completed the IRP or
/// re-armed a new cancellation callback to keep it alive.
pub type CancelFn = fn(&Irp) -> CancelOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The callback completed (or began completing) the IRP; cancellation
    /// rights stay claimed until the IRP is freed.
    Completed,
    /// The callback reinstalled a cancellation callback via
    /// [`Irp::rearm_cancel`] and the IRP remains alive.
    Rearmed,
}

/// Fixed-size, cache-line-aligned I/O Request Packet.
///
/// The `cancel` slot in the original is an atomic function pointer
/// exchanged against the `IRP_CANCELLED` sentinel. Safe Rust has no
/// portable way to reserve a sentinel bit pattern distinct from every
/// real function pointer, so the same "exactly one winner, ever" contract
/// is built from an `AtomicBool` claimed-flag guarding a `Mutex`-held
/// closure slot instead (see DESIGN.md).
#[repr(align(64))]
pub struct Irp {
    pub verb: Verb,
    pub flags: IrpFlags,
    /// Timeout (relative, ticks) until inserted into a timeout queue, at
    /// which point [`super::timeout::timeout_add`] turns it into a
    /// deadline.
    pub timeout: u64,
    pub deadline: AtomicU64,
    pub user_data: usize,
    pub args: [u64; IRP_ARGS_MAX],

    pub result: AtomicU64,
    status: Mutex<IrpStatus>,

    /// Index of this IRP within its pool.
    pub index: u32,
    /// Chain pointer for batched submission; `None` when not chained.
    pub next: Mutex<Option<u32>>,
    /// CPU whose timeout queue holds this IRP, if any.
    pub cpu: AtomicU64,

    /// Index of the current top of the completion stack. Grows toward 0;
    /// `IRP_LOC_MAX` means fully completed but not yet freed.
    location: AtomicU64,
    stack: Mutex<[IrpLoc; IRP_LOC_MAX]>,

    cancel_claimed: AtomicBool,
    cancel_fn: Mutex<Option<CancelFn>>,

    in_timeout_queue: AtomicBool,
    in_use: AtomicBool,
}

impl Irp {
    const fn empty() -> Self {
        Self {
            verb: Verb::Nop,
            flags: IrpFlags::empty(),
            timeout: 0,
            deadline: AtomicU64::new(0),
            user_data: 0,
            args: [0; IRP_ARGS_MAX],
            result: AtomicU64::new(0),
            status: Mutex::new(IrpStatus::InProgress),
            index: 0,
            next: Mutex::new(None),
            cpu: AtomicU64::new(0),
            location: AtomicU64::new(IRP_LOC_MAX as u64),
            stack: Mutex::new([IrpLoc::empty(); IRP_LOC_MAX]),
            cancel_claimed: AtomicBool::new(false),
            cancel_fn: Mutex::new(None),
            in_timeout_queue: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn location(&self) -> usize {
        self.location.load(Ordering::Acquire) as usize
    }

    pub fn status(&self) -> IrpStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: IrpStatus) {
        *self.status.lock() = status;
    }

    pub fn result(&self) -> u64 {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_result(&self, result: u64) {
        self.result.store(result, Ordering::Release);
    }

    /// Push a new completion frame onto the stack.
    ///
    /// Per the original's `assert(irp->location > 0)`: pushing past
    /// `IRP_LOC_MAX` layers is a fabric-level bug, not a runtime
    /// condition callers can recover from, so it's reported as an error
    /// rather than panicking a no_std kernel on attacker-reachable input.
    pub fn push(&self, complete: fn(&Irp), ctx: usize) -> Result<(), IrpError> {
        let loc = self.location.load(Ordering::Acquire);
        if loc == 0 {
            return Err(IrpError::StackOverflow);
        }
        let new_loc = loc - 1;
        self.stack.lock()[new_loc as usize] = IrpLoc {
            complete: Some(complete),
            ctx,
        };
        self.location.store(new_loc, Ordering::Release);
        Ok(())
    }

    /// Pop and invoke the current completion frame.
    ///
    /// When the pop reaches `IRP_LOC_MAX` (the stack is fully unwound) the
    /// IRP is removed from its timeout queue first, matching the
    /// original's ordering ("the timeout list membership is removed under
    /// the scheduler's per-CPU lock before the final completion runs").
    pub fn complete(&self) {
        let loc = self.location.load(Ordering::Acquire) as usize;
        if loc == IRP_LOC_MAX {
            return;
        }
        let frame = self.stack.lock()[loc];
        let new_loc = loc + 1;
        self.location.store(new_loc as u64, Ordering::Release);
        if new_loc == IRP_LOC_MAX {
            super::timeout::timeout_remove(self);
        }
        if let Some(f) = frame.complete {
            f(self);
        }
    }

    /// Install a cancellation callback. Fails once the IRP has been
    /// claimed by `claim()` or `cancel()`.
    pub fn set_cancel(&self, cancel: Option<CancelFn>) -> Result<Option<CancelFn>, IrpError> {
        if self.cancel_claimed.load(Ordering::Acquire) {
            return Err(IrpError::AlreadyCancelled);
        }
        let mut guard = self.cancel_fn.lock();
        if self.cancel_claimed.load(Ordering::Acquire) {
            return Err(IrpError::AlreadyCancelled);
        }
        Ok(core::mem::replace(&mut guard, cancel))
    }

    /// Re-install a cancellation callback from *within* a cancel callback
    /// that is choosing to stay alive (`CancelOutcome::Rearmed`). Only
    /// valid while the caller currently holds cancellation rights.
    pub fn rearm_cancel(&self, cancel: CancelFn) {
        *self.cancel_fn.lock() = Some(cancel);
        self.cancel_claimed.store(false, Ordering::Release);
    }

    /// Attempt to claim completion rights for the normal (non-cancelled)
    /// path. Races with [`Irp::cancel`]; exactly one caller ever wins.
    pub fn claim(&self) -> bool {
        !self.cancel_claimed.swap(true, Ordering::AcqRel)
    }

    /// Cancel the IRP, invoking its registered cancellation callback (if
    /// any) with the given terminal status. Returns an error if the IRP
    /// was already claimed or cancelled.
    pub fn cancel(&self, status: IrpStatus) -> Result<(), IrpError> {
        if self.cancel_claimed.swap(true, Ordering::AcqRel) {
            return Err(IrpError::AlreadyCancelled);
        }
        self.set_status(status);
        let cancel_fn = self.cancel_fn.lock().take();
        if let Some(f) = cancel_fn {
            f(self);
        }
        Ok(())
    }

    fn reset(&self, verb: Verb, flags: IrpFlags, user_irp: bool) {
        // SAFETY-relevant state only; the pool holds `&self` so fields
        // needing interior mutation already use atomics/Mutex.
        self.set_status(IrpStatus::InProgress);
        self.result.store(0, Ordering::Release);
        self.deadline.store(0, Ordering::Release);
        self.location.store(IRP_LOC_MAX as u64, Ordering::Release);
        *self.stack.lock() = [IrpLoc::empty(); IRP_LOC_MAX];
        self.cancel_claimed.store(false, Ordering::Release);
        *self.cancel_fn.lock() = None;
        self.in_timeout_queue.store(false, Ordering::Release);
        *self.next.lock() = None;
        self.in_use.store(true, Ordering::Release);
        let flags = if user_irp {
            flags | IrpFlags::USER
        } else {
            flags
        };
        // `verb`/`flags`/`timeout`/`args` are set by the allocator through
        // raw pointer writes below since they aren't behind interior
        // mutability (they're only ever touched single-threaded, during
        // setup, per the module doc's warning).
        let this = self as *const Irp as *mut Irp;
        unsafe {
            (*this).verb = verb;
            (*this).flags = flags;
        }
    }

    pub fn is_user_irp(&self) -> bool {
        self.flags.contains(IrpFlags::USER)
    }

    pub(super) fn mark_in_timeout_queue(&self, yes: bool) {
        self.in_timeout_queue.store(yes, Ordering::Release);
    }

    pub(super) fn in_timeout_queue(&self) -> bool {
        self.in_timeout_queue.load(Ordering::Acquire)
    }
}

/// A fixed-size arena of [`Irp`]s plus a free list, addressed by index so
/// `irp_pool_get`-equivalent lookups are `O(1)`.
pub struct IrpPool {
    irps: Vec<Irp>,
    free: Mutex<Vec<u32>>,
    ctx: usize,
}

impl IrpPool {
    /// Allocate a new pool of `size` IRPs.
    pub fn new(size: usize, ctx: usize) -> Self {
        let mut irps = Vec::with_capacity(size);
        for i in 0..size {
            let mut irp = Irp::empty();
            irp.index = i as u32;
            irps.push(irp);
        }
        let free = (0..size as u32).rev().collect();
        Self {
            irps,
            free: Mutex::new(free),
            ctx,
        }
    }

    pub fn ctx(&self) -> usize {
        self.ctx
    }

    /// Allocate a new IRP. `user_irp` marks it as originating from a
    /// submission queue entry, which causes dispatch to run the verb's
    /// `enter`/`leave` hooks.
    pub fn alloc(&self, verb: Verb, flags: IrpFlags, user_irp: bool) -> Result<&Irp, IrpError> {
        let idx = self.free.lock().pop().ok_or(IrpError::PoolExhausted)?;
        let irp = &self.irps[idx as usize];
        irp.reset(verb, flags, user_irp);
        Ok(irp)
    }

    /// Return an IRP to the free list. The caller must have driven it to
    /// `location == IRP_LOC_MAX` first (i.e. fully completed).
    pub fn free(&self, irp: &Irp) {
        debug_assert_eq!(irp.location(), IRP_LOC_MAX, "freeing an incomplete IRP");
        irp.in_use.store(false, Ordering::Release);
        self.free.lock().push(irp.index);
    }

    pub fn get(&self, index: u32) -> Option<&Irp> {
        self.irps.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.irps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.irps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    fn fa(irp: &Irp) {
        irp.set_result(irp.result() + 1);
        irp.complete();
    }
    fn fb(irp: &Irp) {
        irp.set_result(irp.result() * 2);
        irp.complete();
    }

    #[test]
    fn layered_completion_order_and_result() {
        let pool = IrpPool::new(4, 0);
        let irp = pool.alloc(Verb::Nop, IrpFlags::empty(), false).unwrap();
        irp.push(fa, 0).unwrap();
        irp.push(fb, 0).unwrap();
        irp.set_result(3);
        irp.complete();
        assert_eq!(irp.result(), 7);
        assert_eq!(irp.location(), IRP_LOC_MAX);
        pool.free(irp);
    }

    #[test]
    fn push_past_max_depth_errors() {
        let pool = IrpPool::new(1, 0);
        let irp = pool.alloc(Verb::Nop, IrpFlags::empty(), false).unwrap();
        for _ in 0..IRP_LOC_MAX {
            irp.push(fa, 0).unwrap();
        }
        assert_eq!(irp.push(fa, 0), Err(IrpError::StackOverflow));
        for _ in 0..IRP_LOC_MAX {
            irp.complete();
        }
    }

    #[test]
    fn claim_and_cancel_race_has_exactly_one_winner() {
        let pool = IrpPool::new(1, 0);
        let irp = pool.alloc(Verb::Nop, IrpFlags::empty(), false).unwrap();
        fn noop_cancel(irp: &Irp) -> CancelOutcome {
            irp.complete();
            CancelOutcome::Completed
        }
        irp.push(|irp| irp.complete(), 0).unwrap();
        irp.set_cancel(Some(noop_cancel)).unwrap();

        let claim_won = irp.claim();
        let cancel_result = irp.cancel(IrpStatus::Cancelled);

        assert!(claim_won);
        assert_eq!(cancel_result, Err(IrpError::AlreadyCancelled));

        // The loser must not have touched the IRP's completion stack.
        assert_eq!(irp.location(), IRP_LOC_MAX - 1);
        irp.complete();
        pool.free(irp);
    }

    #[test]
    fn set_cancel_after_cancelled_returns_sentinel() {
        let pool = IrpPool::new(1, 0);
        let irp = pool.alloc(Verb::Nop, IrpFlags::empty(), false).unwrap();
        irp.push(|irp| irp.complete(), 0).unwrap();
        assert!(irp.cancel(IrpStatus::Cancelled).is_ok());
        assert_eq!(
            irp.set_cancel(None),
            Err(IrpError::AlreadyCancelled)
        );
        irp.complete();
        pool.free(irp);
    }

    #[test]
    fn rearm_keeps_irp_alive() {
        let pool = IrpPool::new(1, 0);
        let irp = pool.alloc(Verb::Nop, IrpFlags::empty(), false).unwrap();
        fn rearm_once(irp: &Irp) -> CancelOutcome {
            fn second(irp: &Irp) -> CancelOutcome {
                irp.complete();
                CancelOutcome::Completed
            }
            irp.rearm_cancel(second);
            CancelOutcome::Rearmed
        }
        irp.push(|irp| irp.complete(), 0).unwrap();
        irp.set_cancel(Some(rearm_once)).unwrap();
        irp.cancel(IrpStatus::TimedOut).unwrap();
        // Rearmed: cancellation rights were released, and a new callback
        // is installed.
        assert!(irp.cancel(IrpStatus::Cancelled).is_ok());
        irp.complete();
        pool.free(irp);
        let _ = Ordering::SeqCst;
    }
}
