//! One-shot shareable async values.
//!
//! A [`Future`] runs its task body at most once and hands the same outcome to
//! every awaiter, no matter how many tasks await it concurrently. Bodies may
//! start eagerly, on first await, or be pre-resolved. [`await_all`] fans a
//! batch out in parallel and yields results strictly in input order, which is
//! what lets the reply reconciler pair the k-th result with the k-th reply.

use anyhow::anyhow;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Task<T> = BoxFuture<'static, anyhow::Result<T>>;

/// Error surfaced by [`Future::wait`]. Cloneable so that a single outcome can
/// be handed to every awaiter.
#[derive(Debug, Clone)]
pub enum FutureError {
    /// The awaiter's cancel token fired before a result was available.
    Cancelled,
    /// The task body returned an error or panicked.
    Failed(Arc<anyhow::Error>),
}

impl FutureError {
    pub fn failed(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for FutureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for FutureError {}

struct Inner<T> {
    /// Pending task body. Taken exactly once by whoever starts the future.
    task: Mutex<Option<Task<T>>>,
    /// Holds `None` until the task completes, then the shared outcome.
    tx: watch::Sender<Option<Result<T, FutureError>>>,
}

/// A one-shot computation whose result can be awaited any number of times.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Future<T> {
    fn with_task(task: Task<T>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                task: Mutex::new(Some(task)),
                tx,
            }),
        }
    }

    fn with_result(result: Result<T, FutureError>) -> Self {
        let (tx, _rx) = watch::channel(Some(result));
        Self {
            inner: Arc::new(Inner {
                task: Mutex::new(None),
                tx,
            }),
        }
    }

    /// Create a future and start running its body immediately.
    pub fn eager<F>(task: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let f = Self::with_task(task.boxed());
        f.start();
        f
    }

    /// Create a future whose body runs once, on first await.
    pub fn deferred<F>(task: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_task(task.boxed())
    }

    /// A future that is already resolved to `value`.
    pub fn resolved(value: T) -> Self {
        Self::with_result(Ok(value))
    }

    /// A future that has already failed with `err`.
    pub fn failed(err: anyhow::Error) -> Self {
        Self::with_result(Err(FutureError::failed(err)))
    }

    /// Start the task body if it has not started yet.
    pub fn start(&self) {
        let task = self.inner.task.lock().take();
        let Some(task) = task else { return };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(FutureError::failed(err)),
                Err(panic) => Err(FutureError::failed(anyhow!(
                    "task panicked: {}",
                    panic_message(&panic)
                ))),
            };
            inner.tx.send_replace(Some(outcome));
        });
    }

    /// Wait for the outcome, or for `cancel` to fire, whichever comes first.
    ///
    /// A result that is already available wins over a fired token, and
    /// repeated waits always observe the same outcome.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<T, FutureError> {
        self.start();
        let mut rx = self.inner.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(FutureError::Cancelled);
                    }
                }
                () = cancel.cancelled() => {
                    // Prefer a result that landed while we were waiting.
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    return Err(FutureError::Cancelled);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Await a batch of futures, yielding results strictly in input order.
///
/// Every future is started up front and every future is awaited, even after
/// `cancel` fires; cancelled entries simply yield [`FutureError::Cancelled`].
pub async fn await_all<T: Clone + Send + Sync + 'static>(
    cancel: &CancellationToken,
    futures: Vec<Future<T>>,
) -> Vec<Result<T, FutureError>> {
    for future in &futures {
        future.start();
    }
    let mut results = Vec::with_capacity(futures.len());
    for future in futures {
        results.push(future.wait(cancel).await);
    }
    results
}
