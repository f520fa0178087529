//! Implicit dependency tracking.
//!
//! [`Tracker::evaluate`] installs an evaluation context in a thread-local
//! slot, runs the body, and hands back whatever the body returned together
//! with one [`Disposer`] per observable the body read. Observables call
//! [`track`] from their read paths; outside of an evaluation that is a no-op.
//!
//! A read of an observable already subscribed by the current context is not
//! subscribed again, so the update callback fires at most once per mutation
//! of each source no matter how often the body read it.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::group::GroupListenable;
use crate::listener::{Disposer, DisposerList, Listener, SingleListenable};
use crate::scheduler::schedule;

struct ActiveContext {
    /// What gets registered on every observable the body reads.
    listener: Listener,
    disposers: DisposerList,
    /// First registration failure, reported once the body returns.
    failure: Option<Error>,
}

thread_local! {
    static CURRENT: RefCell<Option<ActiveContext>> = const { RefCell::new(None) };
}

/// Owns the slot for the duration of one evaluation.
///
/// Dropping it without [`finish`](Self::finish) (the body unwound) clears the
/// slot and releases the subscriptions made so far.
struct EvaluationScope {
    finished: bool,
}

impl EvaluationScope {
    fn enter(listener: Listener) -> Result<Self> {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                cov_mark::hit!(nested_evaluation_rejected);
                return Err(Error::NestedEvaluation);
            }
            *slot = Some(ActiveContext {
                listener,
                disposers: DisposerList::new(),
                failure: None,
            });
            Ok(Self { finished: false })
        })
    }

    fn finish(mut self) -> (DisposerList, Option<Error>) {
        self.finished = true;
        match take_context() {
            Some(context) => (context.disposers, context.failure),
            None => (DisposerList::new(), None),
        }
    }
}

impl Drop for EvaluationScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(context) = take_context() {
            cov_mark::hit!(unwound_evaluation_released);
            debug!(reads = context.disposers.len(), "evaluation body unwound");
            if let Err(err) = context.disposers.dispose_all() {
                debug!(%err, "releasing reads of unwound evaluation");
            }
        }
    }
}

fn take_context() -> Option<ActiveContext> {
    CURRENT.with(|slot| slot.borrow_mut().take())
}

/// Result of a successful evaluation.
#[derive(Debug)]
pub struct Tracked<R> {
    /// What the body returned.
    pub value: R,
    /// One disposer per distinct observable the body read.
    pub disposers: DisposerList,
}

impl<R> Tracked<R> {
    /// Split into the value and the subscriptions.
    pub fn into_parts(self) -> (R, DisposerList) {
        (self.value, self.disposers)
    }
}

/// Evaluation settings.
///
/// ```ignore
/// let tracked = Tracker::new()
///     .strict(true)
///     .evaluate(&update, || cell.get())?;
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tracker {
    strict: bool,
    coalesce: bool,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            strict: false,
            coalesce: true,
        }
    }
}

impl Tracker {
    /// Lenient tracker that defers wake-ups through the microtask queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail evaluations that read no observable with
    /// [`Error::NoObservableRead`].
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// When set (the default), a mutation queues the update callback for the
    /// next [`flush_microtasks`](crate::flush_microtasks) instead of calling
    /// it inline from the write.
    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Whether empty evaluations are rejected.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Whether wake-ups go through the microtask queue.
    pub fn is_coalescing(&self) -> bool {
        self.coalesce
    }

    /// Run `body` and subscribe `update` to every observable it reads.
    ///
    /// Fails with [`Error::NestedEvaluation`] when called from inside another
    /// evaluation body. If a read hit a disposed observable, everything that
    /// was subscribed is released again and that error is returned.
    pub fn evaluate<R>(&self, update: &Listener, body: impl FnOnce() -> R) -> Result<Tracked<R>> {
        // Each evaluation registers its own wrapper, so the subscribe-once
        // check never matches an entry owned by another live evaluation.
        let listener = if self.coalesce {
            deferred(update)
        } else {
            inline(update)
        };
        let scope = EvaluationScope::enter(listener)?;

        let value = body();

        let (disposers, failure) = scope.finish();
        if let Some(err) = failure {
            if let Err(release) = disposers.dispose_all() {
                debug!(%release, "releasing reads of failed evaluation");
            }
            return Err(err);
        }
        if self.strict && disposers.is_empty() {
            cov_mark::hit!(strict_evaluation_read_nothing);
            debug!("strict evaluation read no observable");
            return Err(Error::NoObservableRead);
        }
        trace!(reads = disposers.len(), "evaluation finished");
        Ok(Tracked { value, disposers })
    }
}

/// [`Tracker::evaluate`] with the default settings.
pub fn evaluate<R>(update: &Listener, body: impl FnOnce() -> R) -> Result<Tracked<R>> {
    Tracker::new().evaluate(update, body)
}

/// Wrap `update` so that notifying the wrapper queues `update` instead of
/// running it.
fn deferred(update: &Listener) -> Listener {
    let update = Rc::clone(update);
    Rc::new(move || schedule(Rc::clone(&update)))
}

/// Wrap `update` in a fresh instance that calls it directly.
fn inline(update: &Listener) -> Listener {
    let update = Rc::clone(update);
    Rc::new(move || update())
}

/// Run `f` with tracking suspended. Reads inside `f` subscribe nothing.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = SuspendGuard {
        saved: take_context(),
    };
    f()
}

/// Puts a suspended context back, even if the closure panicked.
struct SuspendGuard {
    saved: Option<ActiveContext>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        let saved = self.saved.take();
        CURRENT.with(|slot| *slot.borrow_mut() = saved);
    }
}

/// True while an evaluation body is running and tracking is not suspended.
pub fn is_tracking() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}

/// Record a read of `source` in the current evaluation, if there is one.
///
/// Custom observables call this from their read paths.
pub fn track<S: SingleListenable + ?Sized>(source: &S) {
    record(
        |listener| source.has_listener(listener),
        |listener| source.add_listener(listener),
    );
}

/// Record a read of the `key` partition of `groups`.
pub fn track_group<K: Clone, G: GroupListenable<K> + ?Sized>(groups: &G, key: &K) {
    record(
        |listener| groups.has_group_listener(key, listener),
        |listener| groups.add_group_listener(key.clone(), listener),
    );
}

fn record(
    subscribed: impl FnOnce(&Listener) -> bool,
    subscribe: impl FnOnce(Listener) -> Result<Disposer>,
) {
    let Some(listener) = CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|context| Rc::clone(&context.listener))
    }) else {
        return;
    };
    if subscribed(&listener) {
        cov_mark::hit!(repeated_read_not_resubscribed);
        return;
    }

    // The slot is not borrowed while the observable registers the listener.
    let outcome = subscribe(listener);
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(context) = slot.as_mut() else {
            return;
        };
        match outcome {
            Ok(disposer) => context.disposers.push(disposer),
            Err(err) => {
                context.failure.get_or_insert(err);
            }
        }
    });
}
