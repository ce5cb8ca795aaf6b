//! Abort signals for listener cancellation
//!
//! Abort callbacks run synchronously inside [`AbortController::abort`].
//! Async code can wait on the same signal through its
//! [`CancellationToken`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

type AbortCallback = Arc<dyn Fn() + Send + Sync>;

struct SignalInner {
    token: CancellationToken,
    callbacks: Mutex<Vec<(u64, AbortCallback)>>,
    next_id: AtomicU64,
}

/// Read side of an abort controller
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// Check whether the signal has fired
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token cancelled when the signal fires
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Wait until the signal fires
    pub async fn aborted(&self) {
        self.inner.token.cancelled().await
    }

    /// Run `callback` once when the signal fires
    ///
    /// Returns `None` without registering if the signal already fired.
    pub fn on_abort<F>(&self, callback: F) -> Option<AbortRegistration>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        if self.is_aborted() {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        callbacks.push((id, Arc::new(callback)));
        Some(AbortRegistration {
            signal: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Number of pending abort callbacks
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

/// Handle removing one abort callback
#[derive(Debug)]
pub struct AbortRegistration {
    signal: Weak<SignalInner>,
    id: u64,
}

impl AbortRegistration {
    /// Remove the callback if it has not run yet
    pub fn remove(&self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Owner of an [`AbortSignal`]
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Create a controller with a fresh signal
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(SignalInner {
                    token: CancellationToken::new(),
                    callbacks: Mutex::new(Vec::new()),
                    next_id: AtomicU64::new(0),
                }),
            },
        }
    }

    /// The controlled signal
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal; callbacks run before this returns
    pub fn abort(&self) {
        let callbacks = {
            let mut callbacks = self.signal.inner.callbacks.lock();
            if self.signal.is_aborted() {
                return;
            }
            self.signal.inner.token.cancel();
            std::mem::take(&mut *callbacks)
        };

        for (_, callback) in callbacks {
            callback();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_abort_runs_callbacks_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        signal
            .on_abort(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        controller.abort();
        controller.abort();

        assert!(signal.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.callback_count(), 0);
    }

    #[test]
    fn test_removed_callback_does_not_run() {
        let controller = AbortController::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registration = controller
            .signal()
            .on_abort(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        registration.remove();
        assert_eq!(controller.signal().callback_count(), 0);
        controller.abort();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_after_abort_is_rejected() {
        let controller = AbortController::new();
        controller.abort();
        assert!(controller.signal().on_abort(|| {}).is_none());
    }

    #[tokio::test]
    async fn test_token_is_cancelled_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move { signal.aborted().await });

        controller.abort();
        waiter.await.unwrap();
        assert!(controller.signal().token().is_cancelled());
    }
}
