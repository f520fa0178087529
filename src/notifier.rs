//! Mix-in for controllers that notify by hand.
//!
//! A [`Notifier`] bundles an ungrouped [`ListenerRegistry`] with a
//! [`GroupRegistry`], so a controller can wake every consumer with
//! [`refresh`](Notifier::refresh) or only the consumers tagged with some keys
//! with [`refresh_groups`](Notifier::refresh_groups).

use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::error::{Result, merge};
use crate::group::{GroupListenable, GroupRegistry};
use crate::listener::{Disposer, Listener, ListenerRegistry, SingleListenable};
use crate::tracker;

/// Ungrouped and grouped listener lists behind one handle.
///
/// ```ignore
/// struct Counter {
///     count: Cell<u32>,
///     notifier: Notifier<&'static str>,
/// }
///
/// impl Counter {
///     fn count(&self) -> u32 {
///         self.notifier.track_group(&"count");
///         self.count.get()
///     }
///
///     fn increment(&self) -> Result<()> {
///         self.count.set(self.count.get() + 1);
///         self.notifier.refresh_groups([&"count"])
///     }
/// }
/// ```
pub struct Notifier<K> {
    listeners: ListenerRegistry,
    groups: GroupRegistry<K>,
}

impl<K: Eq + Hash + Clone + 'static> Notifier<K> {
    /// Create a notifier with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: ListenerRegistry::new(),
            groups: GroupRegistry::new(),
        }
    }

    /// The ungrouped listener list.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// The keyed listener lists.
    pub fn groups(&self) -> &GroupRegistry<K> {
        &self.groups
    }

    /// Wake every ungrouped listener.
    pub fn refresh(&self) -> Result<()> {
        self.listeners.notify_all()
    }

    /// Wake the listeners of each key in `keys`, in order.
    ///
    /// Every key is notified even if an earlier one reported a failure; the
    /// failures are combined.
    pub fn refresh_groups<'a, I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut outcome = Ok(());
        for key in keys {
            outcome = merge(outcome, self.groups.notify_key(key));
        }
        trace!("refreshed listener groups");
        outcome
    }

    /// Subscribe the current evaluation to ungrouped refreshes.
    pub fn track(&self) {
        tracker::track(&self.listeners);
    }

    /// Subscribe the current evaluation to refreshes of `key`.
    pub fn track_group(&self, key: &K) {
        tracker::track_group(&self.groups, key);
    }

    /// Tear down both lists.
    pub fn dispose(&self) -> Result<()> {
        let listeners = if self.listeners.is_disposed() {
            Ok(())
        } else {
            self.listeners.dispose()
        };
        merge(listeners, self.groups.dispose_all())
    }
}

impl<K: Eq + Hash + Clone + 'static> Default for Notifier<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for Notifier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listeners)
            .field("groups", &self.groups)
            .finish()
    }
}

impl<K: Eq + Hash + Clone + 'static> SingleListenable for Notifier<K> {
    fn add_listener(&self, listener: Listener) -> Result<Disposer> {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, listener: &Listener) -> Result<bool> {
        self.listeners.remove(listener)
    }

    fn has_listener(&self, listener: &Listener) -> bool {
        self.listeners.contains(listener)
    }

    fn notify_listeners(&self) -> Result<()> {
        self.refresh()
    }
}

impl<K: Eq + Hash + Clone + 'static> GroupListenable<K> for Notifier<K> {
    fn add_group_listener(&self, key: K, listener: Listener) -> Result<Disposer> {
        self.groups.add_for_key(key, listener)
    }

    fn has_group(&self, key: &K) -> bool {
        self.groups.contains_key(key)
    }

    fn has_group_listener(&self, key: &K, listener: &Listener) -> bool {
        self.groups.contains_listener(key, listener)
    }

    fn notify_group(&self, key: &K) -> Result<()> {
        self.groups.notify_key(key)
    }

    fn dispose_group(&self, key: &K) -> Result<bool> {
        self.groups.dispose_key(key)
    }
}
