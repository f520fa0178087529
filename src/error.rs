//! Error taxonomy shared by every component.
//!
//! Structural errors (use after dispose, double close, nested evaluation) are
//! returned synchronously to the caller that made the mistake. Panics raised
//! by user callbacks are caught one invocation at a time so the rest of a
//! delivery pass still runs, and are reported together once the pass is over.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kind of object an operation was attempted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// A [`ListenerRegistry`](crate::ListenerRegistry).
    ListenerRegistry,
    /// A [`GroupRegistry`](crate::GroupRegistry).
    GroupRegistry,
    /// A [`MiniChannel`](crate::MiniChannel).
    MiniChannel,
    /// A [`ValueCell`](crate::ValueCell).
    ValueCell,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::ListenerRegistry => "listener registry",
            Resource::GroupRegistry => "group registry",
            Resource::MiniChannel => "mini channel",
            Resource::ValueCell => "value cell",
        })
    }
}

/// A panic caught while delivering to one callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackPanic {
    /// Position of the callback within the delivery pass.
    pub index: usize,
    /// Panic payload rendered as text.
    pub message: String,
}

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback #{} panicked: {}", self.index, self.message)
    }
}

/// Errors reported by cells, registries, channels and the tracker.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A mutating or subscribing operation reached an object after its
    /// teardown completed.
    #[error("{0} used after it was disposed")]
    UseAfterDispose(Resource),

    /// A strict evaluation finished without reading a single observable.
    #[error("evaluation finished without reading any observable; it will never re-run")]
    NoObservableRead,

    /// `evaluate` was entered while another evaluation owned the ambient slot.
    #[error("an evaluation is already active on this thread")]
    NestedEvaluation,

    /// One or more callbacks panicked during a delivery pass.
    #[error("{} callback(s) panicked during delivery", .0.len())]
    Callback(Vec<CallbackPanic>),

    /// `close` was called on a channel that is already closed.
    #[error("mini channel closed twice")]
    DoubleClose,
}

impl Error {
    /// Panics collected from a delivery pass, if this is a callback error.
    pub fn callback_panics(&self) -> &[CallbackPanic] {
        match self {
            Error::Callback(panics) => panics,
            _ => &[],
        }
    }
}

/// Run one callback with its panic contained.
pub(crate) fn invoke_isolated<F: FnOnce()>(index: usize, f: F) -> Result<(), CallbackPanic> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let failure = CallbackPanic {
            index,
            message: panic_message(payload.as_ref()),
        };
        tracing::warn!(index, message = %failure.message, "callback panicked during delivery");
        failure
    })
}

/// Turn the panics of one pass into a result.
pub(crate) fn pass_result(failures: Vec<CallbackPanic>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Callback(failures))
    }
}

/// Merge the outcomes of two consecutive delivery passes.
///
/// Callback failures are concatenated; any structural error wins over them.
pub(crate) fn merge(first: Result<()>, second: Result<()>) -> Result<()> {
    match (first, second) {
        (Ok(()), other) | (other, Ok(())) => other,
        (Err(Error::Callback(mut a)), Err(Error::Callback(b))) => {
            a.extend(b);
            Err(Error::Callback(a))
        }
        (Err(Error::Callback(_)), Err(structural)) => Err(structural),
        (Err(structural), Err(_)) => Err(structural),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
