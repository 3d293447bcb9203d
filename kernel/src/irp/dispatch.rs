//! Verb dispatch table.
//!
//! The original assembles `irp_handler_t` entries into a linker section
//! (`._irp_table`) and sorts it once at boot (`irp_table_init`). Rust has
//! no portable equivalent of `__attribute__((section(...)))` without a
//! custom linker script, which is out of scope for a crate meant to
//! compile without a toolchain run. `register()` instead pushes entries
//! into a `Mutex<Vec<DispatchEntry>>`; `finalize()` sorts it once,
//! matching the original's "sorted once at boot, binary-searchable
//! thereafter" behavior without the linker mechanism (see DESIGN.md).

use alloc::vec::Vec;

use spin::Mutex;

use super::pool::{Irp, Verb};
use crate::error::IrpError;

pub struct DispatchEntry {
    pub verb: Verb,
    /// Parses a user IRP's raw submission arguments into structured
    /// arguments. Runs once, the first time a user IRP reaches dispatch.
    pub enter: Option<fn(&Irp)>,
    /// Runs when a user IRP is freed, regardless of outcome.
    pub leave: Option<fn(&Irp)>,
    pub handler: fn(&Irp),
}

static TABLE: Mutex<Vec<DispatchEntry>> = Mutex::new(Vec::new());
static SORTED: spin::Once<()> = spin::Once::new();

/// Register a handler for `verb`. Must be called during each subsystem's
/// `init()`, before [`finalize`].
pub fn register(entry: DispatchEntry) {
    TABLE.lock().push(entry);
}

/// Sort the dispatch table by verb. Idempotent; call once at the end of
/// boot after every subsystem has registered its handlers.
pub fn finalize() {
    SORTED.call_once(|| {
        TABLE.lock().sort_by_key(|e| e.verb as u32);
    });
}

fn lookup(verb: Verb) -> Option<usize> {
    let table = TABLE.lock();
    table.binary_search_by_key(&(verb as u32), |e| e.verb as u32).ok()
}

/// Dispatch a user or kernel IRP to its verb's handler.
///
/// If `irp.err` is not `InProgress` the IRP is immediately completed
/// without running a handler (matches the original: "If `irp->err !=
/// EINPROGRESS` the IRP is immediately completed"). Otherwise, for user
/// IRPs that haven't been entered yet, `enter` runs first to parse
/// arguments, then `handler` runs.
pub fn dispatch(irp: &Irp) -> Result<(), IrpError> {
    use super::pool::IrpStatus;
    if irp.status() != IrpStatus::InProgress {
        irp.complete();
        return Ok(());
    }

    let idx = lookup(irp.verb).ok_or(IrpError::UnknownVerb {
        verb: irp.verb as u32,
    })?;

    // Re-lock per access instead of holding the table lock across the
    // handler call, since handlers may recursively dispatch other IRPs.
    let (enter, handler) = {
        let table = TABLE.lock();
        let e = &table[idx];
        (e.enter, e.handler)
    };

    if irp.is_user_irp() {
        if let Some(enter) = enter {
            enter(irp);
        }
    }
    handler(irp);
    Ok(())
}

/// Run a verb's `leave` hook, if any. Called by [`super::pool::IrpPool`]
/// consumers before returning a user IRP to the pool.
pub fn run_leave(irp: &Irp) {
    if !irp.is_user_irp() {
        return;
    }
    if let Some(idx) = lookup(irp.verb) {
        let leave = TABLE.lock()[idx].leave;
        if let Some(leave) = leave {
            leave(irp);
        }
    }
}

/// Does nothing. Useful as a sleep/delay handler or a placeholder verb.
pub fn nop_do(irp: &Irp) {
    irp.set_result(0);
    irp.complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irp::pool::{IrpFlags, IrpPool};

    fn handled(irp: &Irp) {
        irp.set_result(42);
        irp.complete();
    }

    #[test]
    fn dispatch_runs_registered_handler() {
        register(DispatchEntry {
            verb: Verb::Yield,
            enter: None,
            leave: None,
            handler: handled,
        });
        finalize();

        let pool = IrpPool::new(1, 0);
        let irp = pool.alloc(Verb::Yield, IrpFlags::empty(), false).unwrap();
        irp.push(|irp| irp.complete(), 0).unwrap();
        dispatch(irp).unwrap();
        assert_eq!(irp.result(), 42);
        pool.free(irp);
    }

    #[test]
    fn dispatch_unknown_verb_errors() {
        let pool = IrpPool::new(1, 0);
        let irp = pool
            .alloc(Verb::GetDents, IrpFlags::empty(), false)
            .unwrap();
        irp.push(|irp| irp.complete(), 0).unwrap();
        let result = dispatch(irp);
        assert!(result.is_err());
        irp.complete();
        pool.free(irp);
    }
}
