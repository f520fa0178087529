//! Minimal publish/subscribe primitive.
//!
//! A `MiniChannel` keeps its subscribers in a doubly linked list whose nodes
//! live in a [`Slab`]. Links are slab keys, and subscription handles pair the
//! key with a generation so a handle can never remove a node that later reused
//! the same slot.
//!
//! Delivery walks the list without holding a borrow across user code: the
//! callback is taken out of its node, invoked, and put back. A node removed
//! while a walk is in progress is only tombstoned; its forward link stays
//! valid and the slot is freed once the outermost walk finishes. Each node
//! remembers the publish round it joined in, so nodes added during a walk are
//! skipped by that walk.
//!
//! A callback is never re-entered. An event that reaches a node whose callback
//! is still running goes to that node's backlog, and the running delivery
//! drains the backlog in order once the callback returns.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;
use tracing::{debug, trace};

use crate::error::{CallbackPanic, Error, Resource, Result, invoke_isolated, pass_result};

type DataFn<T> = Box<dyn FnMut(&T)>;
type ErrorFn = Box<dyn FnMut(&ChannelFault)>;
type DoneFn = Box<dyn FnOnce()>;

/// An error published through [`MiniChannel::publish_error`].
#[derive(Debug)]
pub struct ChannelFault {
    error: Box<dyn StdError>,
    trace: Option<Backtrace>,
}

impl ChannelFault {
    /// The published error.
    pub fn error(&self) -> &(dyn StdError + 'static) {
        &*self.error
    }

    /// Backtrace supplied by the publisher, if any.
    pub fn trace(&self) -> Option<&Backtrace> {
        self.trace.as_ref()
    }
}

impl fmt::Display for ChannelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// The callbacks of one subscriber.
pub struct Handlers<T> {
    on_data: DataFn<T>,
    on_error: Option<ErrorFn>,
    on_done: Option<DoneFn>,
}

impl<T> Handlers<T> {
    /// Handlers with only a data callback.
    pub fn new(on_data: impl FnMut(&T) + 'static) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_error: None,
            on_done: None,
        }
    }

    /// Called for every [`MiniChannel::publish_error`].
    pub fn on_error(mut self, on_error: impl FnMut(&ChannelFault) + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Called once when the channel closes.
    pub fn on_done(mut self, on_done: impl FnOnce() + 'static) -> Self {
        self.on_done = Some(Box::new(on_done));
        self
    }
}

enum Event<T> {
    Data(Rc<T>),
    Fault(Rc<ChannelFault>),
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Data(value) => Event::Data(Rc::clone(value)),
            Event::Fault(fault) => Event::Fault(Rc::clone(fault)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeHandle {
    key: usize,
    generation: u64,
}

struct Node<T> {
    generation: u64,
    /// Publish round counter at subscription time.
    joined: u64,
    prev: Option<usize>,
    next: Option<usize>,
    removed: bool,
    /// Set while a delivery to this node is in progress.
    busy: bool,
    backlog: VecDeque<Event<T>>,
    on_data: Option<DataFn<T>>,
    on_error: Option<ErrorFn>,
    on_done: Option<DoneFn>,
}

struct ChannelInner<T> {
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    live: usize,
    generations: u64,
    rounds: u64,
    dispatching: u32,
    graveyard: Vec<usize>,
    latest: Option<Rc<T>>,
    closed: bool,
}

impl<T> ChannelInner<T> {
    fn new() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
            live: 0,
            generations: 0,
            rounds: 0,
            dispatching: 0,
            graveyard: Vec::new(),
            latest: None,
            closed: false,
        }
    }

    fn link(&mut self, handlers: Handlers<T>) -> NodeHandle {
        self.generations += 1;
        let generation = self.generations;
        let key = self.nodes.insert(Node {
            generation,
            joined: self.rounds,
            prev: self.tail,
            next: None,
            removed: false,
            busy: false,
            backlog: VecDeque::new(),
            on_data: Some(handlers.on_data),
            on_error: handlers.on_error,
            on_done: handlers.on_done,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.live += 1;
        NodeHandle { key, generation }
    }

    fn is_live(&self, handle: NodeHandle) -> bool {
        self.nodes
            .get(handle.key)
            .is_some_and(|node| node.generation == handle.generation && !node.removed)
    }

    /// Unlink a live node. Returns the node when its slot could be freed
    /// right away so the caller can drop it outside the borrow.
    fn unlink(&mut self, key: usize) -> Option<Node<T>> {
        let (prev, next) = {
            let node = &mut self.nodes[key];
            node.removed = true;
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.live -= 1;

        if self.dispatching == 0 {
            Some(self.nodes.remove(key))
        } else {
            cov_mark::hit!(node_tombstoned_during_dispatch);
            self.graveyard.push(key);
            None
        }
    }

    fn end_dispatch(&mut self) -> Vec<Node<T>> {
        self.dispatching -= 1;
        if self.dispatching > 0 {
            return Vec::new();
        }
        let keys = std::mem::take(&mut self.graveyard);
        keys.into_iter().map(|key| self.nodes.remove(key)).collect()
    }
}

fn data_slot<T>(node: &mut Node<T>) -> &mut Option<DataFn<T>> {
    &mut node.on_data
}

fn error_slot<T>(node: &mut Node<T>) -> &mut Option<ErrorFn> {
    &mut node.on_error
}

/// Single-owner publish/subscribe list.
///
/// ```ignore
/// let channel = MiniChannel::new();
/// let sub = channel.subscribe(|v: &u32| println!("got {v}"))?;
/// channel.publish(1)?;
/// sub.cancel();
/// channel.close()?;
/// ```
pub struct MiniChannel<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> MiniChannel<T> {
    /// Create an open channel with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner::new())),
        }
    }

    /// Subscribe a data callback.
    pub fn subscribe(&self, on_data: impl FnMut(&T) + 'static) -> Result<Subscription<T>> {
        self.subscribe_with(Handlers::new(on_data))
    }

    /// Subscribe with data, error and completion callbacks.
    pub fn subscribe_with(&self, handlers: Handlers<T>) -> Result<Subscription<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(Error::UseAfterDispose(Resource::MiniChannel));
        }
        let handle = inner.link(handlers);
        trace!(key = handle.key, subscribers = inner.live, "mini channel subscribe");
        Ok(Subscription {
            channel: Rc::downgrade(&self.inner),
            handle,
        })
    }

    /// Store `value` and deliver it to every current subscriber in order.
    pub fn publish(&self, value: T) -> Result<()> {
        let value = Rc::new(value);
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::UseAfterDispose(Resource::MiniChannel));
            }
            inner.latest = Some(Rc::clone(&value));
        }
        pass_result(self.dispatch(Event::Data(value)))
    }

    /// Deliver an error to every current subscriber that has an error callback.
    pub fn publish_error(
        &self,
        error: impl Into<Box<dyn StdError>>,
        trace: Option<Backtrace>,
    ) -> Result<()> {
        if self.inner.borrow().closed {
            return Err(Error::UseAfterDispose(Resource::MiniChannel));
        }
        let fault = Rc::new(ChannelFault {
            error: error.into(),
            trace,
        });
        pass_result(self.dispatch(Event::Fault(fault)))
    }

    /// Invoke `on_done` on every subscriber exactly once and drop them all.
    ///
    /// Publishing or subscribing afterwards fails with
    /// [`Error::UseAfterDispose`]; closing again fails with
    /// [`Error::DoubleClose`].
    pub fn close(&self) -> Result<()> {
        let (done, freed) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                cov_mark::hit!(channel_closed_twice);
                return Err(Error::DoubleClose);
            }
            inner.closed = true;

            let mut done = Vec::with_capacity(inner.live);
            let mut freed = Vec::new();
            let mut cursor = inner.head;
            while let Some(key) = cursor {
                cursor = inner.nodes[key].next;
                if let Some(on_done) = inner.nodes[key].on_done.take() {
                    done.push(on_done);
                }
                freed.extend(inner.unlink(key));
            }
            (done, freed)
        };
        drop(freed);

        debug!(subscribers = done.len(), "mini channel closed");
        let failures: Vec<CallbackPanic> = done
            .into_iter()
            .enumerate()
            .filter_map(|(index, on_done)| invoke_isolated(index, on_done).err())
            .collect();
        pass_result(failures)
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.inner.borrow().live
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// The most recently published value.
    pub fn latest(&self) -> Option<Rc<T>> {
        self.inner.borrow().latest.clone()
    }

    fn dispatch(&self, event: Event<T>) -> Vec<CallbackPanic> {
        let (round, mut cursor) = {
            let mut inner = self.inner.borrow_mut();
            inner.rounds += 1;
            inner.dispatching += 1;
            (inner.rounds, inner.head)
        };

        let mut failures = Vec::new();
        let mut delivered = 0;
        while let Some(key) = cursor {
            let mut pending = {
                let mut inner = self.inner.borrow_mut();
                let node = &mut inner.nodes[key];
                if node.removed || node.joined >= round {
                    None
                } else if node.busy {
                    cov_mark::hit!(reentrant_event_queued);
                    node.backlog.push_back(event.clone());
                    None
                } else {
                    node.busy = true;
                    Some(event.clone())
                }
            };

            while let Some(current) = pending.take() {
                if let Some(result) = self.deliver(key, &current, delivered) {
                    if let Err(failure) = result {
                        failures.push(failure);
                    }
                    delivered += 1;
                }

                let stale = {
                    let mut inner = self.inner.borrow_mut();
                    let node = &mut inner.nodes[key];
                    if node.removed {
                        std::mem::take(&mut node.backlog)
                    } else {
                        pending = node.backlog.pop_front();
                        node.busy = pending.is_some();
                        VecDeque::new()
                    }
                };
                drop(stale);
            }

            // Removed nodes keep their forward link until the walk ends.
            cursor = self.inner.borrow().nodes[key].next;
        }

        let freed = self.inner.borrow_mut().end_dispatch();
        drop(freed);
        trace!(delivered, failed = failures.len(), "mini channel dispatch");
        failures
    }

    /// Run the callback matching `event` on node `key`. Returns `None` when
    /// the node has no such callback.
    fn deliver(
        &self,
        key: usize,
        event: &Event<T>,
        index: usize,
    ) -> Option<Result<(), CallbackPanic>> {
        match event {
            Event::Data(value) => {
                self.invoke_slot(key, data_slot::<T>, index, |on_data: &mut DataFn<T>| {
                    on_data(&**value)
                })
            }
            Event::Fault(fault) => {
                self.invoke_slot(key, error_slot::<T>, index, |on_error: &mut ErrorFn| {
                    on_error(&**fault)
                })
            }
        }
    }

    fn invoke_slot<C>(
        &self,
        key: usize,
        slot: fn(&mut Node<T>) -> &mut Option<C>,
        index: usize,
        invoke: impl FnOnce(&mut C),
    ) -> Option<Result<(), CallbackPanic>> {
        let mut callback = slot(&mut self.inner.borrow_mut().nodes[key]).take()?;
        let result = invoke_isolated(index, || invoke(&mut callback));

        let orphan = {
            let mut inner = self.inner.borrow_mut();
            let node = &mut inner.nodes[key];
            if node.removed {
                Some(callback)
            } else {
                *slot(node) = Some(callback);
                None
            }
        };
        drop(orphan);
        Some(result)
    }
}

impl<T> Default for MiniChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MiniChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MiniChannel")
            .field("subscribers", &inner.live)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Handle to one subscriber of a [`MiniChannel`].
///
/// Dropping the handle leaves the subscription in place; call
/// [`cancel`](Self::cancel) to remove it.
pub struct Subscription<T> {
    channel: Weak<RefCell<ChannelInner<T>>>,
    handle: NodeHandle,
}

impl<T> Subscription<T> {
    /// Remove this subscriber. Returns false if it was already gone.
    pub fn cancel(&self) -> bool {
        let Some(channel) = self.channel.upgrade() else {
            return false;
        };
        let freed = {
            let mut inner = channel.borrow_mut();
            if !inner.is_live(self.handle) {
                return false;
            }
            inner.unlink(self.handle.key)
        };
        drop(freed);
        true
    }

    /// True while the subscriber is still linked.
    pub fn is_active(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.borrow().is_live(self.handle))
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.handle.key)
            .field("generation", &self.handle.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn delivers_in_subscription_order() {
        let channel = MiniChannel::new();
        let log = recorder();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            channel
                .subscribe(move |v: &u32| log.borrow_mut().push(format!("{name}{v}")))
                .unwrap();
        }

        channel.publish(7).unwrap();
        assert_eq!(*log.borrow(), ["a7", "b7", "c7"]);
        assert_eq!(channel.latest().as_deref(), Some(&7));
    }

    #[test]
    fn cancelled_subscriber_is_skipped() {
        let channel = MiniChannel::new();
        let log = recorder();
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let log = log.clone();
                channel
                    .subscribe(move |_: &()| log.borrow_mut().push(i.to_string()))
                    .unwrap()
            })
            .collect();

        assert!(subs[1].cancel());
        assert!(!subs[1].cancel());
        assert!(!subs[1].is_active());
        channel.publish(()).unwrap();

        assert_eq!(*log.borrow(), ["0", "2"]);
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn self_cancel_during_publish_keeps_walking() {
        cov_mark::check!(node_tombstoned_during_dispatch);
        let channel = MiniChannel::new();
        let log = recorder();
        let own: Rc<RefCell<Option<Subscription<u8>>>> = Rc::default();

        let own_clone = own.clone();
        let log_a = log.clone();
        let sub = channel
            .subscribe(move |_: &u8| {
                log_a.borrow_mut().push("a".into());
                if let Some(sub) = own_clone.borrow().as_ref() {
                    sub.cancel();
                }
            })
            .unwrap();
        *own.borrow_mut() = Some(sub);

        let log_b = log.clone();
        channel.subscribe(move |_: &u8| log_b.borrow_mut().push("b".into())).unwrap();

        channel.publish(1).unwrap();
        channel.publish(2).unwrap();
        assert_eq!(*log.borrow(), ["a", "b", "b"]);
    }

    #[test]
    fn node_removed_ahead_of_cursor_is_not_visited() {
        let channel = MiniChannel::new();
        let log = recorder();
        let victim: Rc<RefCell<Option<Subscription<u8>>>> = Rc::default();

        let victim_clone = victim.clone();
        let log_a = log.clone();
        channel
            .subscribe(move |_: &u8| {
                log_a.borrow_mut().push("a".into());
                if let Some(sub) = victim_clone.borrow().as_ref() {
                    sub.cancel();
                }
            })
            .unwrap();
        let log_b = log.clone();
        *victim.borrow_mut() = Some(
            channel
                .subscribe(move |_: &u8| log_b.borrow_mut().push("b".into()))
                .unwrap(),
        );
        let log_c = log.clone();
        channel.subscribe(move |_: &u8| log_c.borrow_mut().push("c".into())).unwrap();

        channel.publish(0).unwrap();
        assert_eq!(*log.borrow(), ["a", "c"]);
    }

    #[test]
    fn subscriber_added_during_publish_waits_for_next_one() {
        let channel = Rc::new(MiniChannel::new());
        let late_hits = Rc::new(Cell::new(0));

        let channel_clone = channel.clone();
        let late_clone = late_hits.clone();
        let added = Cell::new(false);
        channel
            .subscribe(move |_: &()| {
                if !added.replace(true) {
                    let late = late_clone.clone();
                    channel_clone
                        .subscribe(move |_: &()| late.set(late.get() + 1))
                        .unwrap();
                }
            })
            .unwrap();

        channel.publish(()).unwrap();
        assert_eq!(late_hits.get(), 0);
        channel.publish(()).unwrap();
        assert_eq!(late_hits.get(), 1);
    }

    #[test]
    fn nested_publish_reaches_running_subscriber_after_it_returns() {
        cov_mark::check!(reentrant_event_queued);
        let channel = Rc::new(MiniChannel::new());
        let log = recorder();

        let channel_clone = channel.clone();
        let log_a = log.clone();
        channel
            .subscribe(move |v: &u32| {
                log_a.borrow_mut().push(format!("a{v}"));
                if *v == 1 {
                    channel_clone.publish(2).unwrap();
                }
            })
            .unwrap();
        let log_b = log.clone();
        channel
            .subscribe(move |v: &u32| log_b.borrow_mut().push(format!("b{v}")))
            .unwrap();

        channel.publish(1).unwrap();
        assert_eq!(*log.borrow(), ["a1", "b2", "a2", "b1"]);
        assert_eq!(channel.latest().as_deref(), Some(&2));

        log.borrow_mut().clear();
        channel.publish(3).unwrap();
        assert_eq!(*log.borrow(), ["a3", "b3"]);
    }

    #[test]
    fn queued_events_are_dropped_when_running_subscriber_cancels() {
        let channel = Rc::new(MiniChannel::new());
        let log = recorder();
        let own: Rc<RefCell<Option<Subscription<u32>>>> = Rc::default();

        let channel_clone = channel.clone();
        let own_clone = own.clone();
        let log_a = log.clone();
        let sub = channel
            .subscribe(move |v: &u32| {
                log_a.borrow_mut().push(format!("a{v}"));
                if *v == 1 {
                    channel_clone.publish(2).unwrap();
                    if let Some(sub) = own_clone.borrow().as_ref() {
                        sub.cancel();
                    }
                }
            })
            .unwrap();
        *own.borrow_mut() = Some(sub);

        channel.publish(1).unwrap();
        assert_eq!(*log.borrow(), ["a1"]);
        assert!(channel.is_empty());
        *own.borrow_mut() = None;
    }

    #[test]
    fn close_during_publish_completes_everyone_and_stops_delivery() {
        cov_mark::check!(node_tombstoned_during_dispatch);
        let channel = Rc::new(MiniChannel::new());
        let log = recorder();
        let closed = Rc::new(RefCell::new(None));

        for name in ["a", "b", "c"] {
            let log_data = log.clone();
            let log_done = log.clone();
            let channel_clone = channel.clone();
            let closed = closed.clone();
            channel
                .subscribe_with(
                    Handlers::new(move |_: &()| {
                        log_data.borrow_mut().push(format!("{name} data"));
                        if name == "b" {
                            *closed.borrow_mut() = Some(channel_clone.close());
                        }
                    })
                    .on_done(move || log_done.borrow_mut().push(format!("{name} done"))),
                )
                .unwrap();
        }

        channel.publish(()).unwrap();
        assert_eq!(
            *log.borrow(),
            ["a data", "b data", "a done", "b done", "c done"]
        );
        assert_eq!(*closed.borrow(), Some(Ok(())));
        assert!(channel.is_closed());
        assert!(channel.is_empty());
        assert!(channel.inner.borrow().nodes.is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let channel = MiniChannel::new();
        let hits = Rc::new(Cell::new(0));
        channel.subscribe(|_: &()| panic!("first")).unwrap();
        let hits_clone = hits.clone();
        channel.subscribe(move |_: &()| hits_clone.set(hits_clone.get() + 1)).unwrap();

        let err = channel.publish(()).unwrap_err();
        assert_eq!(hits.get(), 1);
        assert_eq!(err.callback_panics().len(), 1);
        assert_eq!(err.callback_panics()[0].message, "first");

        // The panicking callback stays subscribed.
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn errors_reach_only_error_handlers() {
        let channel = MiniChannel::new();
        let seen = recorder();
        let seen_clone = seen.clone();
        channel
            .subscribe_with(Handlers::new(|_: &u8| {}).on_error(move |fault| {
                seen_clone.borrow_mut().push(fault.to_string());
                assert!(fault.trace().is_none());
            }))
            .unwrap();
        channel.subscribe(|_: &u8| panic!("data callback must not run")).unwrap();

        channel.publish_error("disk full", None).unwrap();
        assert_eq!(*seen.borrow(), ["disk full"]);
        assert!(channel.latest().is_none());
    }

    #[test]
    fn close_completes_every_subscriber_once() {
        cov_mark::check!(channel_closed_twice);
        let channel = MiniChannel::new();
        let done = Rc::new(Cell::new(0));
        let mut subs = Vec::new();
        for _ in 0..3 {
            let done = done.clone();
            subs.push(
                channel
                    .subscribe_with(
                        Handlers::new(|_: &()| {}).on_done(move || done.set(done.get() + 1)),
                    )
                    .unwrap(),
            );
        }
        subs[0].cancel();

        channel.close().unwrap();
        assert_eq!(done.get(), 2);
        assert!(channel.is_empty());
        assert!(channel.is_closed());

        assert_eq!(channel.close(), Err(Error::DoubleClose));
        assert_eq!(done.get(), 2);
        assert_eq!(
            channel.publish(()),
            Err(Error::UseAfterDispose(Resource::MiniChannel))
        );
        assert_eq!(
            channel.publish_error("late", None),
            Err(Error::UseAfterDispose(Resource::MiniChannel))
        );
        assert!(matches!(
            channel.subscribe(|_: &()| {}),
            Err(Error::UseAfterDispose(Resource::MiniChannel))
        ));
        assert!(!subs[1].cancel());
    }

    #[test]
    fn stale_handle_cannot_cancel_reused_slot() {
        let channel = MiniChannel::new();
        let first = channel.subscribe(|_: &()| {}).unwrap();
        assert!(first.cancel());

        let hits = Rc::new(Cell::new(0));
        let hits_clone = hits.clone();
        let second = channel
            .subscribe(move |_: &()| hits_clone.set(hits_clone.get() + 1))
            .unwrap();
        assert_eq!(first.handle.key, second.handle.key);

        assert!(!first.cancel());
        channel.publish(()).unwrap();
        assert_eq!(hits.get(), 1);
    }
}
