#![deny(missing_docs)]

//! Implicit dependency tracking and change notification for UI bindings.
//!
//! A consumer wraps its rendering code in an evaluation. Every observable the
//! code reads subscribes the consumer's update callback, and a later change to
//! any of them wakes the consumer, once per synchronous turn, after all the
//! writes of that turn have landed.
//!
//! Everything here is single-threaded: handles are `Rc`-based and the ambient
//! evaluation context and the wake-up queue are thread-local.
//!
//! # Quick Start
//!
//! ```ignore
//! use reaktiv_bind::{ValueCell, evaluate, flush_microtasks, listener};
//!
//! let first = ValueCell::new(String::from("Ada"));
//! let last = ValueCell::new(String::from("Lovelace"));
//!
//! let rebuild = listener(|| println!("rebuild"));
//! let tracked = evaluate(&rebuild, || format!("{} {}", first.get(), last.get()))?;
//!
//! // Two writes in one turn...
//! first.set(String::from("Grace"))?;
//! last.set(String::from("Hopper"))?;
//!
//! // ...wake the consumer once.
//! flush_microtasks()?;
//!
//! // Unsubscribe when the consumer goes away.
//! tracked.disposers.dispose_all()?;
//! ```
//!
//! # Core Types
//!
//! - [`ValueCell<T>`] - Observable value. Tracked reads, equality-gated writes.
//! - [`ListenerRegistry`] - Ordered list of listeners, notified together.
//! - [`GroupRegistry<K>`] - One listener list per key, for targeted refreshes.
//! - [`Notifier<K>`] - Both of the above for controllers that notify by hand.
//! - [`MiniChannel<T>`] - Push stream with data, error and completion callbacks.
//! - [`Tracker`] - Evaluation settings: strict mode and wake-up coalescing.
//! - [`Reaction`] - Side effect that re-runs when what it read changes.
//! - [`Batch`] - Group writes; wake-ups flush when the outermost batch exits.
//!
//! # Evaluations
//!
//! ```ignore
//! let tracked = Tracker::new().strict(true).evaluate(&update, || cell.get())?;
//! untracked(|| other.get()); // read without subscribing
//! is_tracking();             // inside an evaluation body?
//! ```
//!
//! # Wake-ups
//!
//! ```ignore
//! set_waker(|| host.request_flush()); // called when work gets queued
//! flush_microtasks()?;                // run queued update callbacks now
//! is_flush_scheduled();               // anything queued?
//! ```
//!
//! # Errors
//!
//! Operations on a disposed registry, channel or cell fail with
//! [`Error::UseAfterDispose`]. A panicking callback never stops the others in
//! its pass; the panics are collected into [`Error::Callback`].

// Internal modules
mod batch;
mod cell;
mod channel;
mod error;
mod group;
mod hash;
mod listener;
mod notifier;
mod reaction;
mod scheduler;
mod tracker;

// Errors
pub use error::{CallbackPanic, Error, Resource, Result};

// Listener lists
pub use group::{GroupListenable, GroupRegistry};
pub use listener::{Disposer, DisposerList, Listener, ListenerRegistry, SingleListenable, listener};
pub use notifier::Notifier;

// Observables
pub use cell::ValueCell;
pub use channel::{ChannelFault, Handlers, MiniChannel, Subscription};

// Tracking
pub use reaction::Reaction;
pub use tracker::{Tracked, Tracker, evaluate, is_tracking, track, track_group, untracked};

// Scheduling
pub use batch::{Batch, is_batch_active};
pub use scheduler::{
    MAX_FLUSH_ROUNDS, clear_waker, flush_microtasks, is_flush_scheduled, pending_microtasks,
    schedule, set_waker,
};
