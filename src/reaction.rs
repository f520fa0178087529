//! Self-tracking side effects.
//!
//! A [`Reaction`] owns a body and an update listener that points back at it.
//! Each run evaluates the body under the reaction's [`Tracker`] and swaps in
//! the new subscriptions only once that run has succeeded.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::error::Result;
use crate::listener::{DisposerList, Listener, listener};
use crate::tracker::Tracker;

struct ReactionInner {
    body: RefCell<Box<dyn FnMut()>>,
    tracker: Tracker,
    /// Registered on every observable the body reads. Holds only a weak
    /// reference back, so queued wake-ups never keep a dropped reaction alive.
    update: Listener,
    disposers: RefCell<DisposerList>,
    runs: Cell<u64>,
    disposed: Cell<bool>,
}

impl ReactionInner {
    fn run_now(&self) -> Result<()> {
        if self.disposed.get() {
            return Ok(());
        }

        // The previous subscriptions stay in place until the new run has
        // succeeded. A body that fails or unwinds leaves them untouched.
        let tracked = match self.tracker.evaluate(&self.update, || {
            let mut body = self.body.borrow_mut();
            (&mut **body)()
        }) {
            Ok(tracked) => tracked,
            Err(err) => {
                cov_mark::hit!(failed_run_keeps_dependencies);
                return Err(err);
            }
        };

        if self.disposed.get() {
            return tracked.disposers.dispose_all();
        }
        let previous = std::mem::replace(&mut *self.disposers.borrow_mut(), tracked.disposers);
        if let Err(err) = previous.dispose_all() {
            debug!(%err, "releasing stale reaction subscription");
        }
        self.runs.set(self.runs.get() + 1);
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.replace(true) {
            return Ok(());
        }
        let disposers = std::mem::take(&mut *self.disposers.borrow_mut());
        disposers.dispose_all()
    }
}

/// Side effect that re-runs whenever something it read changes.
///
/// The body runs once on creation. Each run re-tracks from scratch, so a body
/// that reads different observables on different branches is only woken by
/// the ones its latest run actually read.
///
/// # Example
/// ```ignore
/// let celsius = ValueCell::new(20.0);
/// let reaction = Reaction::new({
///     let celsius = celsius.clone();
///     move || println!("{} F", celsius.get() * 1.8 + 32.0)
/// })?;
///
/// celsius.set(25.0)?;
/// celsius.set(30.0)?;
/// flush_microtasks()?; // prints once, for 30.0
/// ```
///
/// Dropping the reaction releases its subscriptions.
pub struct Reaction {
    inner: Rc<ReactionInner>,
}

impl Reaction {
    /// Create a reaction with the default [`Tracker`] and run it.
    pub fn new<F>(body: F) -> Result<Self>
    where
        F: FnMut() + 'static,
    {
        Self::with_tracker(Tracker::new(), body)
    }

    /// Create a reaction that evaluates with `tracker` and run it.
    ///
    /// Fails if the first run fails, for example when `tracker` is strict and
    /// the body reads nothing.
    pub fn with_tracker<F>(tracker: Tracker, body: F) -> Result<Self>
    where
        F: FnMut() + 'static,
    {
        let inner = Rc::new_cyclic(|weak: &Weak<ReactionInner>| {
            let weak = weak.clone();
            ReactionInner {
                body: RefCell::new(Box::new(body)),
                tracker,
                update: listener(move || {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = inner.run_now() {
                        warn!(%err, "reaction re-run failed");
                    }
                }),
                disposers: RefCell::new(DisposerList::new()),
                runs: Cell::new(0),
                disposed: Cell::new(false),
            }
        });

        inner.run_now()?;
        Ok(Self { inner })
    }

    /// Re-run the body now, replacing the current subscriptions.
    pub fn run_now(&self) -> Result<()> {
        self.inner.run_now()
    }

    /// How many times the body has completed.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }

    /// Number of observables the latest run subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.inner.disposers.borrow().len()
    }

    /// Release all subscriptions and stop reacting. Later calls do nothing.
    pub fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }

    /// True once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        if let Err(err) = self.inner.dispose() {
            debug!(%err, "releasing subscriptions of dropped reaction");
        }
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("runs", &self.run_count())
            .field("dependencies", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
