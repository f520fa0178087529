//! Observable value holder.
//!
//! A [`ValueCell`] stores one value. Reads through [`get`](ValueCell::get) or
//! [`with`](ValueCell::with) are tracked by the current evaluation. Writes
//! that change the value notify the cell's listeners first and then publish
//! the new value on the cell's [`MiniChannel`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::channel::{MiniChannel, Subscription};
use crate::error::{Error, Resource, Result, merge};
use crate::listener::{Disposer, Listener, ListenerRegistry, SingleListenable};
use crate::tracker;

struct CellInner<T> {
    value: RefCell<T>,
    registry: ListenerRegistry,
    channel: MiniChannel<T>,
    /// Set by the first write. Until then every write notifies, even one that
    /// stores a value equal to the initial one.
    mutated: Cell<bool>,
    disposed: Cell<bool>,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        if self.disposed.get() || self.channel.is_closed() {
            return;
        }
        if let Err(err) = self.channel.close() {
            debug!(%err, "closing channel of dropped value cell");
        }
    }
}

/// Shared handle to an observable value.
///
/// Clones share the value and its listeners.
///
/// ```ignore
/// let name = ValueCell::new(String::from("ada"));
/// let tracked = evaluate(&rebuild, || name.get())?;
/// name.set(String::from("grace"))?; // queues `rebuild`
/// flush_microtasks()?;
/// ```
pub struct ValueCell<T> {
    inner: Rc<CellInner<T>>,
}

impl<T: Clone + PartialEq + 'static> ValueCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(CellInner {
                value: RefCell::new(value),
                registry: ListenerRegistry::new(),
                channel: MiniChannel::new(),
                mutated: Cell::new(false),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Tracked read of a copy of the value.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Tracked read through a borrow.
    ///
    /// Writing to the same cell from inside `f` panics on the borrow.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        tracker::track(self);
        f(&self.inner.value.borrow())
    }

    /// Read without subscribing the current evaluation.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Store `value` and notify, unless it equals the current value.
    ///
    /// The first write after construction always notifies.
    pub fn set(&self, value: T) -> Result<()> {
        self.ensure_live()?;
        let first = !self.inner.mutated.get();
        if !first && *self.inner.value.borrow() == value {
            cov_mark::hit!(equal_write_skipped);
            return Ok(());
        }
        self.inner.mutated.set(true);
        self.store(value)
    }

    /// [`set`](Self::set) with a value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        self.ensure_live()?;
        let next = f(&self.inner.value.borrow());
        self.set(next)
    }

    /// Store `value` and notify even if it equals the current value.
    pub fn force_notify(&self, value: T) -> Result<()> {
        self.ensure_live()?;
        self.inner.mutated.set(true);
        self.store(value)
    }

    /// Edit the value in place, then notify unconditionally.
    pub fn mutate(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        self.ensure_live()?;
        f(&mut self.inner.value.borrow_mut());
        self.inner.mutated.set(true);
        let snapshot = self.get_untracked();
        self.notify(snapshot)
    }

    fn store(&self, value: T) -> Result<()> {
        let previous = self.inner.value.replace(value.clone());
        drop(previous);
        self.notify(value)
    }

    fn notify(&self, value: T) -> Result<()> {
        trace!(listeners = self.inner.registry.len(), "value cell changed");
        let listeners = self.inner.registry.notify_all();
        let subscribers = if self.inner.channel.is_closed() {
            Ok(())
        } else {
            self.inner.channel.publish(value)
        };
        merge(listeners, subscribers)
    }

    /// Subscribe to the stream of new values.
    pub fn listen(&self, on_data: impl FnMut(&T) + 'static) -> Result<Subscription<T>> {
        self.ensure_live()?;
        self.inner.channel.subscribe(on_data)
    }

    /// The channel new values are published on.
    pub fn channel(&self) -> &MiniChannel<T> {
        &self.inner.channel
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Drop every listener and close the channel. Later calls do nothing.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.replace(true) {
            cov_mark::hit!(value_cell_disposed_again);
            return Ok(());
        }
        debug!("value cell disposed");
        let listeners = self.inner.registry.dispose();
        let channel = if self.inner.channel.is_closed() {
            Ok(())
        } else {
            self.inner.channel.close()
        };
        merge(listeners, channel)
    }

    /// True once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.get() {
            return Err(Error::UseAfterDispose(Resource::ValueCell));
        }
        Ok(())
    }
}

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Default + 'static> Default for ValueCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ValueCell");
        match self.inner.value.try_borrow() {
            Ok(value) => debug.field("value", &*value),
            Err(_) => debug.field("value", &"<borrowed>"),
        };
        debug
            .field("listeners", &self.inner.registry.len())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> SingleListenable for ValueCell<T> {
    fn add_listener(&self, listener: Listener) -> Result<Disposer> {
        self.ensure_live()?;
        self.inner.registry.add(listener)
    }

    fn remove_listener(&self, listener: &Listener) -> Result<bool> {
        self.ensure_live()?;
        self.inner.registry.remove(listener)
    }

    fn has_listener(&self, listener: &Listener) -> bool {
        self.inner.registry.contains(listener)
    }

    fn notify_listeners(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.registry.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::listener;
    use proptest::prelude::*;

    fn counting() -> (Listener, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        (listener(move || count_clone.set(count_clone.get() + 1)), count)
    }

    #[test]
    fn first_write_notifies_even_when_equal() {
        let cell = ValueCell::new(0);
        let (cb, count) = counting();
        cell.add_listener(cb).unwrap();

        cell.set(0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn equal_write_is_skipped_after_first() {
        cov_mark::check!(equal_write_skipped);
        let cell = ValueCell::new(0);
        let (cb, count) = counting();
        cell.add_listener(cb).unwrap();

        cell.set(1).unwrap();
        cell.set(1).unwrap();
        assert_eq!(count.get(), 1);

        cell.force_notify(1).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn listeners_run_before_channel_subscribers() {
        let cell = ValueCell::new(String::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_sub = log.clone();
        let _sub = cell
            .listen(move |v: &String| log_sub.borrow_mut().push(format!("sub {v}")))
            .unwrap();
        let log_listener = log.clone();
        let reader = cell.clone();
        cell.add_listener(listener(move || {
            log_listener
                .borrow_mut()
                .push(format!("listener {}", reader.get_untracked()))
        }))
        .unwrap();

        cell.set("x".to_owned()).unwrap();
        assert_eq!(*log.borrow(), ["listener x", "sub x"]);
    }

    #[test]
    fn update_and_mutate_see_current_value() {
        let cell = ValueCell::new(vec![1]);
        let (cb, count) = counting();
        cell.add_listener(cb).unwrap();

        cell.update(|v| v.iter().map(|n| n * 10).collect()).unwrap();
        assert_eq!(cell.get_untracked(), vec![10]);

        cell.mutate(|v| v.push(2)).unwrap();
        assert_eq!(cell.get_untracked(), vec![10, 2]);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn listener_may_write_back_to_the_cell() {
        let cell = ValueCell::new(0);
        let writer = cell.clone();
        cell.add_listener(listener(move || {
            if writer.get_untracked() < 3 {
                writer.update(|v| v + 1).unwrap();
            }
        }))
        .unwrap();

        cell.set(1).unwrap();
        assert_eq!(cell.get_untracked(), 3);
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_writes() {
        cov_mark::check!(value_cell_disposed_again);
        let cell = ValueCell::new(1);
        let (cb, count) = counting();
        cell.add_listener(cb.clone()).unwrap();

        cell.dispose().unwrap();
        cell.dispose().unwrap();
        assert!(cell.is_disposed());
        assert!(cell.channel().is_closed());

        assert_eq!(cell.set(2), Err(Error::UseAfterDispose(Resource::ValueCell)));
        assert!(matches!(
            cell.add_listener(cb),
            Err(Error::UseAfterDispose(Resource::ValueCell))
        ));
        assert_eq!(count.get(), 0);
        assert_eq!(cell.get_untracked(), 1);
    }

    #[test]
    fn dropping_last_handle_completes_subscribers() {
        let cell = ValueCell::new(5u8);
        let done = Rc::new(Cell::new(false));
        let done_clone = done.clone();
        cell.channel()
            .subscribe_with(
                crate::channel::Handlers::new(|_: &u8| {}).on_done(move || done_clone.set(true)),
            )
            .unwrap();

        drop(cell);
        assert!(done.get());
    }

    proptest! {
        #[test]
        fn repeated_write_notifies_at_most_once(initial in any::<i32>(), next in any::<i32>()) {
            let cell = ValueCell::new(initial);
            let (cb, count) = counting();
            cell.add_listener(cb).unwrap();

            cell.set(next).unwrap();
            cell.set(next).unwrap();
            prop_assert_eq!(count.get(), 1);
            prop_assert_eq!(cell.get_untracked(), next);
        }

        #[test]
        fn force_notify_always_notifies(initial in any::<i32>(), next in any::<i32>()) {
            let cell = ValueCell::new(initial);
            let (cb, count) = counting();
            cell.add_listener(cb).unwrap();
            let published = Rc::new(Cell::new(0));
            let published_clone = published.clone();
            cell.listen(move |_: &i32| published_clone.set(published_clone.get() + 1))
                .unwrap();

            cell.force_notify(next).unwrap();
            cell.force_notify(next).unwrap();
            prop_assert_eq!(count.get(), 2);
            prop_assert_eq!(published.get(), 2);
            prop_assert_eq!(cell.get_untracked(), next);
        }
    }
}
