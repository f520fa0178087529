//! Grouped writes.
//!
//! Inside [`Batch::run`] writes still queue their wake-ups, but the waker stays
//! quiet and nothing is flushed until the outermost batch returns.

use std::cell::Cell;

use tracing::trace;

use crate::error::Result;
use crate::scheduler::flush_microtasks;

// Depth of nested `Batch::run` calls on this thread.
// While > 0 the waker stays quiet and queued wake-ups wait for the outermost exit.
thread_local! {
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard that restores the batch depth even when the body unwinds.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        BATCH_DEPTH.set(BATCH_DEPTH.get().saturating_sub(1));
    }
}

/// Check if a batch is open on this thread.
pub fn is_batch_active() -> bool {
    BATCH_DEPTH.get() > 0
}

/// Group several writes so dependent consumers wake once, at the end.
///
/// Writes inside a batch still notify listeners immediately; only the
/// deferred wake-ups queued by tracked reads wait. When the outermost batch
/// exits, the queue is flushed synchronously.
///
/// # Example
/// ```ignore
/// // Without a batch: the reaction is woken after the host's next flush.
/// // With a batch: it has already re-run when `run` returns.
/// Batch::run(|| {
///     width.set(640)?;
///     height.set(480)
/// })??;
/// ```
///
/// If the body panics, the depth is restored and nothing is flushed; the
/// queued work stays for the next flush.
pub struct Batch {
    _private: (),
}

impl Batch {
    /// Run `f` inside a batch and return its value.
    ///
    /// Fails only if flushing at the outermost exit reports a failing callback.
    pub fn run<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        BATCH_DEPTH.set(BATCH_DEPTH.get() + 1);
        let guard = BatchGuard;

        let value = f();

        drop(guard);
        if !is_batch_active() {
            let ran = flush_microtasks()?;
            trace!(ran, "batch closed");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::listener;
    use crate::scheduler::{pending_microtasks, schedule, set_waker};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    #[test]
    fn batch_returns_value() {
        assert_eq!(Batch::run(|| 42).unwrap(), 42);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let task = listener(move || runs_clone.set(runs_clone.get() + 1));

        Batch::run(|| {
            assert!(is_batch_active());
            Batch::run(|| schedule(task.clone())).unwrap();
            assert_eq!(runs.get(), 0);
            assert_eq!(pending_microtasks(), 1);
            schedule(task.clone());
        })
        .unwrap();

        assert!(!is_batch_active());
        assert_eq!(runs.get(), 1);
        assert_eq!(pending_microtasks(), 0);
    }

    #[test]
    fn waker_stays_quiet_inside_batch() {
        let wakes = Rc::new(Cell::new(0));
        let wakes_clone = wakes.clone();
        set_waker(move || wakes_clone.set(wakes_clone.get() + 1));

        Batch::run(|| schedule(listener(|| {}))).unwrap();
        assert_eq!(wakes.get(), 0);
    }

    #[test]
    fn panic_restores_depth_without_flushing() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            Batch::run::<_, ()>(|| {
                schedule(listener(|| {}));
                panic!("boom");
            })
        }));

        assert!(result.is_err());
        assert!(!is_batch_active());
        assert_eq!(pending_microtasks(), 1);
    }
}
