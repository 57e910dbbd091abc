//! Handle to a call running on the client's runtime.

use crate::error::RestError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Request built, not yet handed to the transport
    Built,
    /// Waiting for the first response
    Sent,
    /// Long-running operation in progress; `polls` follow-up requests so far
    Polling { polls: usize },
    /// Terminal response turned into an output
    Materialized,
    /// The call ended with an error
    Faulted,
    /// Cancelled by the caller
    Cancelled,
}

impl CallState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Materialized | Self::Faulted | Self::Cancelled)
    }
}

/// Write side of a call's state, shared between the task and its handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct Progress {
    tx: Option<Arc<watch::Sender<CallState>>>,
}

impl Progress {
    /// Progress nobody observes.
    pub(crate) fn detached() -> Self {
        Self::default()
    }

    /// Record `state` unless the call was already cancelled.
    pub(crate) fn set(&self, state: CallState) {
        if let Some(tx) = &self.tx {
            tx.send_if_modified(|current| {
                if *current == CallState::Cancelled || *current == state {
                    return false;
                }
                *current = state;
                true
            });
        }
    }

    fn cancel(&self) {
        if let Some(tx) = &self.tx {
            tx.send_replace(CallState::Cancelled);
        }
    }
}

/// A call running on the tokio runtime.
///
/// The handle is a `Future` resolving to the call result. It also supports
/// cancellation, callback delivery and blocking waits. Dropping the handle
/// detaches the call; it keeps running to completion.
pub struct AsyncHandle<T> {
    result: BoxFuture<'static, Result<T, RestError>>,
    state: watch::Receiver<CallState>,
    progress: Progress,
    cancel: CancellationToken,
    runtime: tokio::runtime::Handle,
}

impl<T: Send + 'static> AsyncHandle<T> {
    /// Spawn the future produced by `call` on `runtime`.
    pub(crate) fn spawn<F>(runtime: &tokio::runtime::Handle, call: impl FnOnce(Progress) -> F) -> Self
    where
        F: Future<Output = Result<T, RestError>> + Send + 'static,
    {
        let (tx, state) = watch::channel(CallState::Built);
        let progress = Progress {
            tx: Some(Arc::new(tx)),
        };
        let cancel = CancellationToken::new();

        let call = call(progress.clone());
        let token = cancel.clone();
        let task_progress = progress.clone();
        let task = runtime.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(RestError::Cancelled),
                result = call => {
                    task_progress.set(if result.is_ok() {
                        CallState::Materialized
                    } else {
                        CallState::Faulted
                    });
                    result
                }
            }
        });

        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(RestError::Cancelled),
                Err(e) => Err(RestError::Runtime(format!("call task failed: {e}"))),
            }
        }
        .boxed();

        Self {
            result,
            state,
            progress,
            cancel,
            runtime: runtime.clone(),
        }
    }

    /// Stop the call. Advisory: a response already received is discarded,
    /// the in-flight request is dropped and the handle resolves to
    /// `RestError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.progress.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Deliver the result to `callback` once the call completes.
    ///
    /// The callback runs on the runtime and is never invoked once the
    /// returned [`Subscription`] (or this call) has been cancelled. It must
    /// not cancel its own subscription.
    pub fn subscribe(
        self,
        callback: impl FnOnce(Result<T, RestError>) + Send + 'static,
    ) -> Subscription {
        let armed = Arc::new(RwLock::new(true));
        let subscription = Subscription {
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            armed: armed.clone(),
        };

        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            let result = self.await;
            if matches!(result, Err(RestError::Cancelled)) {
                return;
            }
            let armed = armed.read().unwrap_or_else(PoisonError::into_inner);
            if *armed {
                callback(result);
            }
        });

        subscription
    }

    /// Compose a transformation of the successful result.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> AsyncHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        AsyncHandle {
            result: self.result.map(|result| result.map(f)).boxed(),
            state: self.state,
            progress: self.progress,
            cancel: self.cancel,
            runtime: self.runtime,
        }
    }

    /// Block the current thread until the call completes.
    ///
    /// Must not be called from a runtime worker thread.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or `RestError::Cancelled`.
    pub fn blocking_wait(self) -> Result<T, RestError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for AsyncHandle<T> {
    type Output = Result<T, RestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(RestError::Cancelled));
        }
        self.result.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("state", &*self.state.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Callback registration returned by [`AsyncHandle::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    progress: Progress,
    armed: Arc<RwLock<bool>>,
}

impl Subscription {
    /// Cancel the call. Once this returns the callback will not run; if it
    /// is running right now, this waits for it to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.progress.cancel();
        *self.armed.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
