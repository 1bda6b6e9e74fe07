//! Completion handle for queued disk work.

use tokio::sync::oneshot;

use crate::error::{CacheError, Result};

/// Result of an operation queued on a disk worker.
///
/// Await it with [`Pending::wait`], block on it from synchronous code with
/// [`Pending::wait_blocking`], or drop it to fire and forget; the operation
/// runs either way.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Pairs a new handle with the sender the worker completes.
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Waits for the operation from async code.
    pub async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or(Err(CacheError::WorkerClosed))
    }

    /// Waits for the operation from synchronous code.
    ///
    /// Panics if called from within an async execution context, like every
    /// blocking receive on a Tokio channel.
    pub fn wait_blocking(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(CacheError::WorkerClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_resolves_immediately() {
        let pending = Pending::ready(Ok(5));
        assert_eq!(pending.wait().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed_worker() {
        let (tx, pending) = Pending::<()>::channel();
        drop(tx);
        assert!(matches!(pending.wait().await, Err(CacheError::WorkerClosed)));
    }

    #[test]
    fn test_wait_blocking_outside_runtime() {
        let (tx, pending) = Pending::channel();
        std::thread::spawn(move || {
            let _ = tx.send(Ok("done"));
        });
        assert_eq!(pending.wait_blocking().unwrap(), "done");
    }

    #[test]
    fn test_wait_from_foreign_executor() {
        let (tx, pending) = Pending::channel();
        let _ = tx.send(Ok(7));
        assert_eq!(tokio_test::block_on(pending.wait()).unwrap(), 7);
    }
}
