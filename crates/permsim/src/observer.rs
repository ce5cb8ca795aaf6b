//! Waiting for a status object to reach a state

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::debug;

use crate::access::PermissionState;
use crate::error::{Error, Result};
use crate::status::{EventListener, ListenerOptions, PermissionStatus, CHANGE_EVENT};

/// Resolves futures once a status object's masked state enters a target set
#[derive(Debug, Clone)]
pub struct StateObserver {
    status: PermissionStatus,
}

impl StateObserver {
    pub fn new(status: PermissionStatus) -> Self {
        Self { status }
    }

    /// The observed status object
    pub fn status(&self) -> &PermissionStatus {
        &self.status
    }

    /// Wait until the state is one of `targets`
    ///
    /// Fails immediately if `targets` is empty. The returned future
    /// completes at once when the current state already matches.
    pub fn wait_for_state<I>(&self, targets: I) -> Result<impl Future<Output = Result<()>> + Send>
    where
        I: IntoIterator<Item = PermissionState>,
    {
        self.wait_for_state_with(targets, std::future::ready(()))
    }

    /// Wait until the state is one of `targets` while running `task`
    ///
    /// The change listener is registered before this returns, so changes
    /// made by `task` are not missed. The future completes once both the
    /// state has been reached and `task` has finished, and yields the
    /// task's output. `task` runs even if no waiting is needed.
    pub fn wait_for_state_with<I, F>(
        &self,
        targets: I,
        task: F,
    ) -> Result<impl Future<Output = Result<F::Output>> + Send>
    where
        I: IntoIterator<Item = PermissionState>,
        F: Future + Send,
        F::Output: Send,
    {
        let targets: Vec<PermissionState> = targets.into_iter().collect();
        if targets.is_empty() {
            return Err(Error::InvalidArgument(
                "At least one target state is required".to_string(),
            ));
        }

        let waiter = StateWaiter::register(&self.status, targets.clone());
        let current = self.status.state()?;
        let waiter = if targets.contains(&current) {
            drop(waiter);
            None
        } else {
            debug!(
                "Waiting for {} to reach one of {:?}",
                self.status.name(),
                targets
            );
            Some(waiter)
        };

        Ok(async move {
            match waiter {
                None => Ok(task.await),
                Some(waiter) => {
                    let (reached, output) = futures::join!(waiter.wait(), task);
                    reached?;
                    Ok(output)
                }
            }
        })
    }
}

/// Change listener that fires a oneshot on the first matching state
///
/// The listener is removed when the waiter is dropped.
struct StateWaiter {
    status: PermissionStatus,
    listener: EventListener,
    receiver: Option<oneshot::Receiver<PermissionState>>,
}

impl StateWaiter {
    fn register(status: &PermissionStatus, targets: Vec<PermissionState>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        // The status owns this listener, so hold it weakly. The event payload
        // can be stale when an earlier listener changed the state mid-dispatch.
        let weak = status.downgrade();
        let listener = EventListener::new(move |_| {
            let Some(status) = weak.upgrade() else {
                return;
            };
            let Ok(state) = status.state() else {
                return;
            };
            if targets.contains(&state) {
                if let Some(sender) = sender.lock().take() {
                    let _ = sender.send(state);
                }
            }
        });
        status.add_event_listener(CHANGE_EVENT, listener.clone(), ListenerOptions::new());

        Self {
            status: status.clone(),
            listener,
            receiver: Some(receiver),
        }
    }

    async fn wait(mut self) -> Result<()> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| Error::IllegalState("State waiter already used".to_string()))?;
        let state = receiver
            .await
            .map_err(|_| Error::IllegalState("State listener went away".to_string()))?;
        debug!("{} reached {}", self.status.name(), state);
        Ok(())
    }
}

impl Drop for StateWaiter {
    fn drop(&mut self) {
        self.status
            .remove_event_listener(CHANGE_EVENT, &self.listener, false);
    }
}
