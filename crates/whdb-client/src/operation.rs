//! Cancellable session operations.
//!
//! Both the blocking and the async connection entry points funnel through
//! [`run_cancellable`]. Blocking callers drive the same future to completion
//! with [`block_on`] and an inert token.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Terminal state of a cancellable session operation.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    /// The operation completed.
    Succeeded(T),
    /// The operation failed.
    Faulted(Error),
    /// The operation observed its cancellation token.
    Canceled,
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Succeeded(value),
            Err(err) if err.is_cancelled() => Self::Canceled,
            Err(err) => Self::Faulted(err),
        }
    }
}

/// Drive `op` to completion while watching `cancel`.
///
/// `on_cancel` is registered before `op` is first polled and runs at most
/// once, as soon as the token fires. The operation itself keeps running until
/// it completes on its own. When the token is already cancelled at
/// registration time no callback is registered.
pub(crate) async fn run_cancellable<T, F, C>(
    op: F,
    cancel: &CancellationToken,
    on_cancel: C,
) -> Outcome<T>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(),
{
    let mut on_cancel = (!cancel.is_cancelled()).then_some(on_cancel);
    tokio::pin!(op);

    let result = loop {
        tokio::select! {
            biased;
            result = &mut op => break result,
            () = cancel.cancelled(), if on_cancel.is_some() => {
                if let Some(callback) = on_cancel.take() {
                    callback();
                }
            }
        }
    };

    Outcome::from(result)
}

/// Run a future to completion on a private current-thread runtime.
///
/// Fails with [`Error::BlockingInAsyncContext`] when called from inside a
/// Tokio runtime, where blocking the worker would stall the runtime.
pub(crate) fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::BlockingInAsyncContext);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(fut))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let outcome = tokio_test::block_on(run_cancellable(
            async { Ok(7) },
            &CancellationToken::new(),
            || {},
        ));
        assert!(matches!(outcome, Outcome::Succeeded(7)));

        let outcome: Outcome<()> = tokio_test::block_on(run_cancellable(
            async { Err(Error::Cancelled) },
            &CancellationToken::new(),
            || {},
        ));
        assert!(matches!(outcome, Outcome::Canceled));

        let outcome: Outcome<()> = tokio_test::block_on(run_cancellable(
            async { Err(Error::server(1, "boom")) },
            &CancellationToken::new(),
            || {},
        ));
        assert!(matches!(outcome, Outcome::Faulted(Error::Server { .. })));
    }

    #[test]
    fn test_callback_fires_while_operation_runs_to_completion() {
        let fired = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let inner = token.clone();

        let outcome = tokio_test::block_on(run_cancellable(
            async move {
                inner.cancel();
                tokio::task::yield_now().await;
                Ok("done")
            },
            &token,
            || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        ));

        assert!(matches!(outcome, Outcome::Succeeded("done")));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_callback_when_already_cancelled() {
        let fired = AtomicUsize::new(0);
        let token = CancellationToken::new();
        token.cancel();

        let outcome: Outcome<()> = tokio_test::block_on(run_cancellable(
            async { Err(Error::Cancelled) },
            &token,
            || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        ));

        assert!(matches!(outcome, Outcome::Canceled));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_block_on_outside_runtime() {
        assert_eq!(block_on(async { 42 }).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_block_on_inside_runtime_is_rejected() {
        let err = block_on(async {}).unwrap_err();
        assert!(matches!(err, Error::BlockingInAsyncContext));
    }
}
