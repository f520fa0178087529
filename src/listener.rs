//! Per-cell listener lists and the disposer capability.
//!
//! A [`ListenerRegistry`] is an ordered list of update callbacks. Identity of
//! a callback is the address of its `Rc` allocation, so the same instance may
//! be registered several times and each registration gets its own
//! [`Disposer`].
//!
//! Notification iterates a copy of the list taken when the pass starts.
//! Listeners added or removed by a callback during the pass only affect later
//! passes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::{Error, Resource, Result, invoke_isolated, pass_result};

/// An update callback.
pub type Listener = Rc<dyn Fn()>;

/// Wrap a closure as a [`Listener`].
pub fn listener(f: impl Fn() + 'static) -> Listener {
    Rc::new(f)
}

/// Identity of a listener instance.
pub(crate) fn listener_key(listener: &Listener) -> usize {
    Rc::as_ptr(listener) as *const () as usize
}

/// Something a single listener list can be attached to.
///
/// The dependency tracker subscribes through this trait, so anything that
/// implements it can take part in implicit subscription.
pub trait SingleListenable {
    /// Append `listener` and return the capability that removes it again.
    fn add_listener(&self, listener: Listener) -> Result<Disposer>;

    /// Remove the first registration of `listener`.
    fn remove_listener(&self, listener: &Listener) -> Result<bool>;

    /// True if `listener` is currently registered.
    fn has_listener(&self, listener: &Listener) -> bool;

    /// Invoke every registered listener.
    fn notify_listeners(&self) -> Result<()>;
}

struct Entry {
    id: u64,
    listener: Listener,
}

struct RegistryInner {
    entries: Vec<Entry>,
    next_id: u64,
    disposed: bool,
}

impl RegistryInner {
    fn remove_entry(&mut self, id: u64) -> Option<Entry> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(position))
    }
}

/// Ordered subscriber list of one observable.
pub struct ListenerRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                entries: Vec::new(),
                next_id: 0,
                disposed: false,
            })),
        }
    }

    /// Another handle to the same list, for callers that must not hold a
    /// borrow of their own container while notifying.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Append `listener`.
    ///
    /// Adding an instance that is already present creates an independent
    /// second entry.
    pub fn add(&self, listener: Listener) -> Result<Disposer> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry { id, listener });
            id
        };

        let registry = Rc::downgrade(&self.inner);
        Ok(Disposer::new(move || remove_by_id(&registry, id)))
    }

    /// True if `listener` has at least one entry.
    pub fn contains(&self, listener: &Listener) -> bool {
        let key = listener_key(listener);
        self.inner
            .borrow()
            .entries
            .iter()
            .any(|entry| listener_key(&entry.listener) == key)
    }

    /// Remove the first entry of `listener`. Returns whether one was found.
    pub fn remove(&self, listener: &Listener) -> Result<bool> {
        let key = listener_key(listener);
        let removed = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
            }
            let position = inner
                .entries
                .iter()
                .position(|entry| listener_key(&entry.listener) == key);
            position.map(|position| inner.entries.remove(position))
        };
        Ok(removed.is_some())
    }

    /// Invoke a snapshot of the current listeners.
    ///
    /// A panicking listener does not stop the pass; all panics are returned
    /// together as [`Error::Callback`] once every listener has run.
    pub fn notify_all(&self) -> Result<()> {
        let snapshot: Vec<Listener> = {
            let inner = self.inner.borrow();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
            }
            inner
                .entries
                .iter()
                .map(|entry| Rc::clone(&entry.listener))
                .collect()
        };

        trace!(listeners = snapshot.len(), "notify listener registry");
        let failures = snapshot
            .iter()
            .enumerate()
            .filter_map(|(index, listener)| invoke_isolated(index, || listener()).err())
            .collect();
        pass_result(failures)
    }

    /// Drop every listener. Teardown happens once; a second call fails.
    pub fn dispose(&self) -> Result<()> {
        let entries = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                cov_mark::hit!(registry_disposed_twice);
                return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
            }
            inner.disposed = true;
            std::mem::take(&mut inner.entries)
        };
        debug!(listeners = entries.len(), "listener registry disposed");
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.borrow().disposed
    }
}

fn remove_by_id(registry: &Weak<RefCell<RegistryInner>>, id: u64) -> Result<()> {
    let Some(registry) = registry.upgrade() else {
        return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
    };
    let removed = {
        let mut inner = registry.borrow_mut();
        if inner.disposed {
            return Err(Error::UseAfterDispose(Resource::ListenerRegistry));
        }
        inner.remove_entry(id)
    };
    drop(removed);
    Ok(())
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &inner.entries.len())
            .field("disposed", &inner.disposed)
            .finish()
    }
}

impl SingleListenable for ListenerRegistry {
    fn add_listener(&self, listener: Listener) -> Result<Disposer> {
        self.add(listener)
    }

    fn remove_listener(&self, listener: &Listener) -> Result<bool> {
        self.remove(listener)
    }

    fn has_listener(&self, listener: &Listener) -> bool {
        self.contains(listener)
    }

    fn notify_listeners(&self) -> Result<()> {
        self.notify_all()
    }
}

type DisposeFn = Box<dyn FnOnce() -> Result<()>>;

/// Capability that removes exactly one subscription.
///
/// The first [`dispose`](Self::dispose) removes the subscription, later calls
/// do nothing. Dropping a disposer without calling it keeps the subscription.
pub struct Disposer {
    action: Cell<Option<DisposeFn>>,
}

impl Disposer {
    pub(crate) fn new(action: impl FnOnce() -> Result<()> + 'static) -> Self {
        Self {
            action: Cell::new(Some(Box::new(action))),
        }
    }

    /// Remove the subscription.
    ///
    /// Fails with [`Error::UseAfterDispose`] on the first call if the owning
    /// registry was already torn down.
    pub fn dispose(&self) -> Result<()> {
        match self.action.take() {
            Some(action) => action(),
            None => {
                cov_mark::hit!(disposer_called_twice);
                Ok(())
            }
        }
    }

    /// True once [`dispose`](Self::dispose) has been called.
    pub fn is_spent(&self) -> bool {
        let action = self.action.take();
        let spent = action.is_none();
        self.action.set(action);
        spent
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer").field("spent", &self.is_spent()).finish()
    }
}

/// Disposers accumulated by one evaluation.
#[derive(Debug, Default)]
pub struct DisposerList {
    disposers: Vec<Disposer>,
}

impl DisposerList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a disposer.
    pub fn push(&mut self, disposer: Disposer) {
        self.disposers.push(disposer);
    }

    /// Number of disposers held.
    pub fn len(&self) -> usize {
        self.disposers.len()
    }

    /// True when the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.disposers.is_empty()
    }

    /// Call every disposer. All of them run; the first failure is returned.
    pub fn dispose_all(self) -> Result<()> {
        let mut first_error = None;
        for disposer in self.disposers {
            if let Err(err) = disposer.dispose() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Extend<Disposer> for DisposerList {
    fn extend<I: IntoIterator<Item = Disposer>>(&mut self, iter: I) {
        self.disposers.extend(iter);
    }
}

impl IntoIterator for DisposerList {
    type Item = Disposer;
    type IntoIter = std::vec::IntoIter<Disposer>;

    fn into_iter(self) -> Self::IntoIter {
        self.disposers.into_iter()
    }
}
