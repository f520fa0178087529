//! Listener lists partitioned by key.
//!
//! A [`GroupRegistry`] maps application-chosen keys to their own
//! [`ListenerRegistry`], so a mutation can wake only the consumers tagged with
//! one key. Keys appear on first subscribe and disappear again when their last
//! listener is disposed.

use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::{Error, Resource, Result};
use crate::hash::{FastIndexMap, fast_index_map};
use crate::listener::{Disposer, Listener, ListenerRegistry};

/// Something that keeps a listener list per key.
pub trait GroupListenable<K> {
    /// Append `listener` to the list of `key`, creating the list if needed.
    fn add_group_listener(&self, key: K, listener: Listener) -> Result<Disposer>;

    /// True if `key` currently has a list.
    fn has_group(&self, key: &K) -> bool;

    /// True if `listener` is registered under `key`.
    fn has_group_listener(&self, key: &K, listener: &Listener) -> bool;

    /// Invoke the listeners of `key` only.
    fn notify_group(&self, key: &K) -> Result<()>;

    /// Tear down the list of `key`. Returns whether the key existed.
    fn dispose_group(&self, key: &K) -> Result<bool>;
}

struct GroupInner<K> {
    groups: FastIndexMap<K, ListenerRegistry>,
    disposed: bool,
}

/// Keyed collection of listener registries.
pub struct GroupRegistry<K> {
    inner: Rc<RefCell<GroupInner<K>>>,
}

impl<K: Eq + Hash + Clone + 'static> GroupRegistry<K> {
    /// Create a registry with no groups.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GroupInner {
                groups: fast_index_map(),
                disposed: false,
            })),
        }
    }

    /// Subscribe `listener` under `key`.
    ///
    /// The returned disposer removes the key once its list is empty.
    pub fn add_for_key(&self, key: K, listener: Listener) -> Result<Disposer> {
        let registry = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::GroupRegistry));
            }
            let slot = inner.groups.entry(key.clone()).or_insert_with(|| {
                cov_mark::hit!(group_created_on_first_subscribe);
                ListenerRegistry::new()
            });
            if slot.is_disposed() {
                *slot = ListenerRegistry::new();
            }
            slot.share()
        };

        let entry = registry.add(listener)?;
        let groups = Rc::downgrade(&self.inner);
        Ok(Disposer::new(move || {
            let result = entry.dispose();
            prune_if_empty(&groups, &key, &registry);
            result
        }))
    }

    /// Notify the listeners of `key`. Does nothing if the key is absent.
    pub fn notify_key(&self, key: &K) -> Result<()> {
        let registry = {
            let inner = self.inner.borrow();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::GroupRegistry));
            }
            inner.groups.get(key).map(ListenerRegistry::share)
        };
        match registry {
            Some(registry) => registry.notify_all(),
            None => {
                cov_mark::hit!(notify_of_absent_group);
                Ok(())
            }
        }
    }

    /// True if `key` currently has a list.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.borrow().groups.contains_key(key)
    }

    /// True if `listener` is registered under `key`.
    pub fn contains_listener(&self, key: &K, listener: &Listener) -> bool {
        self.inner
            .borrow()
            .groups
            .get(key)
            .is_some_and(|registry| registry.contains(listener))
    }

    /// Number of listeners under `key`.
    pub fn listener_count(&self, key: &K) -> usize {
        self.inner
            .borrow()
            .groups
            .get(key)
            .map_or(0, ListenerRegistry::len)
    }

    /// Handle to the list of `key`, if present.
    pub fn group(&self, key: &K) -> Option<ListenerRegistry> {
        self.inner.borrow().groups.get(key).map(ListenerRegistry::share)
    }

    /// Keys in creation order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.borrow().groups.keys().cloned().collect()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.inner.borrow().groups.len()
    }

    /// True when no key has a list.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`dispose_all`](Self::dispose_all) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.borrow().disposed
    }

    /// Dispose and forget the list of `key` only.
    pub fn dispose_key(&self, key: &K) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(Error::UseAfterDispose(Resource::GroupRegistry));
            }
            inner.groups.shift_remove(key)
        };
        let Some(registry) = removed else {
            return Ok(false);
        };
        if !registry.is_disposed() {
            registry.dispose()?;
        }
        Ok(true)
    }

    /// Dispose every list and clear the map.
    ///
    /// Lists that were already disposed individually are skipped, and calling
    /// this again is a no-op.
    pub fn dispose_all(&self) -> Result<()> {
        let groups = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                cov_mark::hit!(group_registry_disposed_again);
                return Ok(());
            }
            inner.disposed = true;
            std::mem::take(&mut inner.groups)
        };

        debug!(groups = groups.len(), "group registry disposed");
        for registry in groups.into_values() {
            if registry.is_disposed() {
                cov_mark::hit!(child_registry_already_disposed);
                continue;
            }
            registry.dispose()?;
        }
        Ok(())
    }
}

fn prune_if_empty<K: Eq + Hash>(
    groups: &Weak<RefCell<GroupInner<K>>>,
    key: &K,
    registry: &ListenerRegistry,
) {
    let Some(groups) = groups.upgrade() else {
        return;
    };
    let pruned = {
        let mut inner = groups.borrow_mut();
        let prune = inner.groups.get(key).is_some_and(|current| {
            current.same_as(registry) && current.is_empty() && !current.is_disposed()
        });
        if prune { inner.groups.shift_remove(key) } else { None }
    };
    if pruned.is_some() {
        cov_mark::hit!(empty_group_pruned);
        trace!("pruned empty listener group");
    }
}

impl<K: Eq + Hash + Clone + 'static> Default for GroupRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for GroupRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("GroupRegistry")
            .field("groups", &inner.groups.keys().collect::<Vec<_>>())
            .field("disposed", &inner.disposed)
            .finish()
    }
}

impl<K: Eq + Hash + Clone + 'static> GroupListenable<K> for GroupRegistry<K> {
    fn add_group_listener(&self, key: K, listener: Listener) -> Result<Disposer> {
        self.add_for_key(key, listener)
    }

    fn has_group(&self, key: &K) -> bool {
        self.contains_key(key)
    }

    fn has_group_listener(&self, key: &K, listener: &Listener) -> bool {
        self.contains_listener(key, listener)
    }

    fn notify_group(&self, key: &K) -> Result<()> {
        self.notify_key(key)
    }

    fn dispose_group(&self, key: &K) -> Result<bool> {
        self.dispose_key(key)
    }
}
