// guard.rs

//! Recursion and stack-headroom protection for entry points the host can
//! re-enter from its own callbacks — a trigger body that prepares another
//! statement, a recursive CTE driving further prepares, anything that puts
//! a second call onto a stack the host may have started thin.
//!
//! The original implementation measured actual stack headroom through the
//! platform's thread-attribute interface (`pthread_getattr_np`) and bailed
//! out once the remaining gap fell under a hard threshold; a ~218-frame
//! recursion blew a 544 KB worker-thread stack before that guard existed.
//! Rust has no portable equivalent in `std`, so this tracks the same
//! signal two ways that don't need one: a hard cap on call depth, and a
//! cheap proxy for "how much of this thread's stack has this call chain
//! already used" built from the address of a local on each frame.

use std::cell::Cell;

use crate::Error;

/// Hard cap on recursive entry-point depth, independent of measured stack.
const MAX_DEPTH: u32 = 100;

/// Refuse further recursion once a call chain is judged to have eaten this
/// many bytes of stack since the thread's first entry — a proxy for "not
/// enough headroom left" when there is no portable way to ask the OS.
const MAX_ESTIMATED_STACK_USE: usize = 512 * 1024;

thread_local! {
    static DEPTH: Cell<u32> = Cell::new(0);
    static STACK_BASE: Cell<Option<usize>> = Cell::new(None);
}

/// Held for the duration of one guarded call. Dropping it — including via
/// an early `?` return — restores the depth counter.
pub(crate) struct RecursionGuard;

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Marks entry into a recursion-sensitive call. Fails with
/// `Error::ResourcePressure` (mapped to `NOMEM`, see [`crate::Error::status_code`])
/// if the depth cap is exceeded or the estimated stack use for this call
/// chain looks too deep to proceed safely.
pub(crate) fn enter() -> Result<RecursionGuard, Error> {
    let depth = DEPTH.with(|d| {
        let next = d.get() + 1;
        d.set(next);
        next
    });
    if depth > MAX_DEPTH {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        return Err(Error::ResourcePressure(format!(
            "recursion depth {} exceeds the {} frame cap",
            depth, MAX_DEPTH
        )));
    }

    let marker: u8 = 0;
    let here = &marker as *const u8 as usize;
    let base = STACK_BASE.with(|b| {
        let base = b.get().unwrap_or(here);
        b.set(Some(base));
        base
    });
    // Stacks grow down on every platform this crate targets, so a deeper
    // frame has a strictly lower address than the thread's first frame.
    let consumed = base.saturating_sub(here);
    if consumed > MAX_ESTIMATED_STACK_USE {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        return Err(Error::ResourcePressure(format!(
            "estimated stack use {} bytes exceeds the {} byte threshold",
            consumed, MAX_ESTIMATED_STACK_USE
        )));
    }

    Ok(RecursionGuard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_single_entry_succeeds_and_restores_depth_on_drop() {
        {
            let _g = enter().unwrap();
            assert_eq!(DEPTH.with(|d| d.get()), 1);
        }
        assert_eq!(DEPTH.with(|d| d.get()), 0);
    }

    #[test]
    fn depth_beyond_the_cap_is_resource_pressure() {
        let mut guards = Vec::new();
        for _ in 0..MAX_DEPTH {
            guards.push(enter().unwrap());
        }
        let err = enter();
        assert!(matches!(err, Err(Error::ResourcePressure(_))));
        assert_eq!(err.unwrap_err().status_code(), crate::abi::status_code::NOMEM);
        drop(guards);
        // The cap is a thread-local counter, not a one-shot latch: once the
        // over-cap guards all drop, the thread can enter again.
        assert!(enter().is_ok());
    }
}
