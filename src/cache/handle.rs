//! Cancelable query handle.
//!
//! A handle and its delivery share one state word. Whichever of `cancel` and
//! `deliver` moves it out of `PENDING` first wins, so a successful cancel
//! guarantees the callback never runs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const DELIVERED: u8 = 1;
const CANCELLED: u8 = 2;

/// Token returned by asynchronous queries.
///
/// Cancelling suppresses the completion callback only; a disk read already
/// under way still finishes and may still populate the memory tier.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    state: Arc<AtomicU8>,
}

impl QueryHandle {
    /// Handle for a query answered before it was returned.
    pub(crate) fn completed() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(DELIVERED)),
        }
    }

    /// Prevents the callback from running.
    ///
    /// Returns false when the callback has already been invoked.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// True once the callback has been invoked.
    pub fn is_delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }
}

/// Callback side of a [`QueryHandle`].
pub(crate) struct Delivery<F> {
    state: Arc<AtomicU8>,
    callback: F,
}

impl<F> Delivery<F> {
    pub(crate) fn new(callback: F) -> (Self, QueryHandle) {
        let state = Arc::new(AtomicU8::new(PENDING));
        let handle = QueryHandle {
            state: Arc::clone(&state),
        };
        (Self { state, callback }, handle)
    }

    /// Invokes the callback with `value` unless the handle was cancelled.
    pub(crate) fn deliver<T>(self, value: T) -> bool
    where
        F: FnOnce(T),
    {
        let claimed = self
            .state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            (self.callback)(value);
        }
        claimed
    }
}
