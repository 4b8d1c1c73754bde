//! Bounded-concurrency fan-out preserving input order.

use crate::error::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Maximum items in flight. Must be >= 1.
    pub concurrency: usize,
    /// When true (the default), the first item error cancels all in-flight
    /// work and is returned; completed results are discarded. When false,
    /// every item runs and per-item results are returned.
    pub stop_on_error: bool,
    /// Caller cancellation scope for the whole fan-out.
    pub cancel: CancellationToken,
}

impl MapOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            stop_on_error: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.stop_on_error = false;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Run `f` over `items` with at most `opts.concurrency` in flight. The
/// returned vector is indexed like the input regardless of completion
/// order. The outer error is the stop condition (first item error with
/// `stop_on_error`, or cancellation); inner results are per item.
pub async fn map<T, R, F, Fut>(
    items: Vec<T>,
    f: F,
    opts: MapOptions,
) -> Result<Vec<Result<R, Error>>, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    let scope = opts.cancel.child_token();
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let scope = scope.clone();
        let f = f.clone();
        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = scope.cancelled() => return (index, Err(Error::canceled())),
                permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
            };
            let result = tokio::select! {
                _ = scope.cancelled() => Err(Error::canceled()),
                result = f(item) => result,
            };
            (index, result)
        });
    }

    let mut slots: Vec<Option<Result<R, Error>>> = (0..total).map(|_| None).collect();
    loop {
        tokio::select! {
            _ = opts.cancel.cancelled() => {
                scope.cancel();
                return Err(Error::canceled());
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Err(join_err)) => {
                    scope.cancel();
                    return Err(Error::config(format!("fan-out worker panicked: {join_err}")));
                }
                Some(Ok((index, result))) => match result {
                    Err(err) if opts.stop_on_error => {
                        scope.cancel();
                        return Err(err);
                    }
                    other => slots[index] = Some(other),
                },
            }
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.expect("every index joined"))
        .collect())
}
