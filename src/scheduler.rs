//! Deferred observer wake-ups.
//!
//! Listeners registered by the tracker do not run the consumer's update
//! callback inline. They queue it here, and the queue is drained by
//! [`flush_microtasks`]. Queuing a callback that is already waiting does
//! nothing, so any number of writes in one synchronous turn wake each consumer
//! once, after the writes, with the final state visible.
//!
//! Hosts with an event loop install a waker with [`set_waker`]. It is called
//! when the queue goes from empty to non-empty (outside of a [`Batch`]) and
//! should arrange for `flush_microtasks` to run before the next externally
//! scheduled unit of work. Hosts without a loop call `flush_microtasks` at the
//! end of their update cycle.
//!
//! [`Batch`]: crate::Batch

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{trace, warn};

use crate::batch::is_batch_active;
use crate::error::{Result, invoke_isolated, pass_result};
use crate::hash::{FastIndexMap, fast_index_map};
use crate::listener::{Listener, listener_key};

/// Upper bound on drain rounds in one flush. Tasks still queued after that
/// many rounds stay queued for the next flush.
pub const MAX_FLUSH_ROUNDS: usize = 1024;

thread_local! {
    static QUEUE: RefCell<FastIndexMap<usize, Listener>> = RefCell::new(fast_index_map());
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
    static WAKER: RefCell<Option<Rc<dyn Fn()>>> = const { RefCell::new(None) };
}

/// Queue `task` for the next flush.
///
/// A task whose instance is already queued is not queued again.
pub fn schedule(task: Listener) {
    let key = listener_key(&task);
    let first = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        if queue.contains_key(&key) {
            cov_mark::hit!(microtask_coalesced);
            return false;
        }
        let first = queue.is_empty();
        queue.insert(key, task);
        first
    });
    trace!(first, "microtask scheduled");

    if first && !FLUSHING.get() && !is_batch_active() {
        wake();
    }
}

/// Run queued tasks until the queue is empty. Returns how many ran.
///
/// Tasks queued while flushing run in the same flush. A task that panics does
/// not stop the others; panics are reported after the queue is drained. A
/// flush started from inside a running task returns `Ok(0)` and leaves the
/// work to the outer flush.
pub fn flush_microtasks() -> Result<usize> {
    if FLUSHING.replace(true) {
        cov_mark::hit!(nested_flush_deferred);
        return Ok(0);
    }
    let _flushing = FlushingGuard;

    let mut ran = 0;
    let mut failures = Vec::new();
    for _ in 0..MAX_FLUSH_ROUNDS {
        let tasks: Vec<Listener> =
            QUEUE.with(|queue| queue.borrow_mut().drain(..).map(|(_, task)| task).collect());
        if tasks.is_empty() {
            break;
        }
        for task in tasks {
            if let Err(failure) = invoke_isolated(ran, || task()) {
                failures.push(failure);
            }
            ran += 1;
        }
    }

    let left = pending_microtasks();
    if left > 0 {
        warn!(left, rounds = MAX_FLUSH_ROUNDS, "flush stopped with tasks still queued");
    }
    trace!(ran, "microtasks flushed");
    pass_result(failures).map(|()| ran)
}

/// Number of queued tasks.
pub fn pending_microtasks() -> usize {
    QUEUE.with(|queue| queue.borrow().len())
}

/// True when tasks are waiting for a flush.
pub fn is_flush_scheduled() -> bool {
    pending_microtasks() > 0
}

/// Install the hook that tells the host a flush is needed.
pub fn set_waker(waker: impl Fn() + 'static) {
    WAKER.with(|slot| *slot.borrow_mut() = Some(Rc::new(waker)));
}

/// Remove the hook installed by [`set_waker`].
pub fn clear_waker() {
    WAKER.with(|slot| *slot.borrow_mut() = None);
}

/// Call the waker, if one is installed.
pub(crate) fn wake() {
    let waker = WAKER.with(|slot| slot.borrow().clone());
    if let Some(waker) = waker {
        // A failing waker is logged by the isolation helper; the tasks stay
        // queued either way.
        let _ = invoke_isolated(0, || waker());
    }
}

struct FlushingGuard;

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        FLUSHING.set(false);
    }
}
