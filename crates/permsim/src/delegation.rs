//! Several permission subsystems behind one facade
//!
//! Every query goes to all delegates, so switching the selected delegate
//! takes effect immediately for status objects handed out earlier.

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::access::PermissionState;
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::permissions::Permissions;
use crate::status::{
    EventListener, ListenerOptions, Notify, PermissionStatus, StateSource, Teardown,
    WeakPermissionStatus, CHANGE_EVENT,
};

/// Status source following whichever delegate is selected
struct DelegatedSource {
    statuses: Vec<PermissionStatus>,
    selected: Arc<AtomicUsize>,
}

impl StateSource for DelegatedSource {
    fn current(&self) -> Result<PermissionState> {
        let index = self.selected.load(Ordering::SeqCst);
        match self.statuses.get(index) {
            Some(status) => status.state(),
            None => Err(Error::IllegalState(format!(
                "Selected delegate {} is out of range",
                index
            ))),
        }
    }

    fn watch(&self, notify: Notify) -> Teardown {
        let listeners: Vec<(PermissionStatus, EventListener)> = self
            .statuses
            .iter()
            .enumerate()
            .map(|(index, status)| {
                let selected = self.selected.clone();
                let notify = notify.clone();
                let listener = EventListener::new(move |_| {
                    if selected.load(Ordering::SeqCst) == index {
                        notify();
                    }
                });
                status.add_event_listener(CHANGE_EVENT, listener.clone(), ListenerOptions::new());
                (status.clone(), listener)
            })
            .collect();

        Box::new(move || {
            for (status, listener) in listeners {
                status.remove_event_listener(CHANGE_EVENT, &listener, false);
            }
        })
    }
}

/// Facade over an ordered, non-empty list of delegates
pub struct Delegation {
    delegates: Vec<Arc<dyn Permissions>>,
    selected: Arc<AtomicUsize>,
    live: Mutex<Vec<WeakPermissionStatus>>,
}

impl Delegation {
    /// Create a delegation; the first delegate starts out selected
    pub fn new(delegates: Vec<Arc<dyn Permissions>>) -> Result<Self> {
        if delegates.is_empty() {
            return Err(Error::InvalidArgument(
                "Delegation requires at least one delegate".to_string(),
            ));
        }
        Ok(Self {
            delegates,
            selected: Arc::new(AtomicUsize::new(0)),
            live: Mutex::new(Vec::new()),
        })
    }

    /// The delegates, in order
    pub fn delegates(&self) -> &[Arc<dyn Permissions>] {
        &self.delegates
    }

    /// Index of the selected delegate
    pub fn selected_index(&self) -> usize {
        self.selected.load(Ordering::SeqCst)
    }

    /// Check whether `delegate` is the selected one
    pub fn is_selected_delegate(&self, delegate: &Arc<dyn Permissions>) -> bool {
        self.position(delegate) == Some(self.selected_index())
    }

    /// Switch to `delegate`
    ///
    /// Status objects handed out earlier re-read their state and raise a
    /// change event if it differs from what they last reported.
    pub fn select_delegate(&self, delegate: &Arc<dyn Permissions>) -> Result<()> {
        let index = self
            .position(delegate)
            .ok_or_else(|| Error::InvalidArgument("Unknown delegate".to_string()))?;
        let previous = self.selected.swap(index, Ordering::SeqCst);
        if previous == index {
            return Ok(());
        }
        debug!("Switching delegate {} -> {}", previous, index);

        let statuses: Vec<PermissionStatus> = {
            let mut live = self.live.lock();
            live.retain(|status| status.upgrade().is_some());
            live.iter().filter_map(WeakPermissionStatus::upgrade).collect()
        };
        for status in statuses {
            status.refresh();
        }
        Ok(())
    }

    /// Number of composite status objects still alive
    pub fn live_status_count(&self) -> usize {
        let mut live = self.live.lock();
        live.retain(|status| status.upgrade().is_some());
        live.len()
    }

    fn position(&self, delegate: &Arc<dyn Permissions>) -> Option<usize> {
        let target = Arc::as_ptr(delegate) as *const ();
        self.delegates
            .iter()
            .position(|d| Arc::as_ptr(d) as *const () == target)
    }
}

#[async_trait]
impl Permissions for Delegation {
    async fn query(&self, descriptor: &Descriptor) -> Result<PermissionStatus> {
        let statuses =
            try_join_all(self.delegates.iter().map(|delegate| delegate.query(descriptor))).await?;

        let status = PermissionStatus::new(
            descriptor.name(),
            Box::new(DelegatedSource {
                statuses,
                selected: self.selected.clone(),
            }),
        );
        let mut live = self.live.lock();
        live.retain(|status| status.upgrade().is_some());
        live.push(status.downgrade());
        Ok(status)
    }
}

impl std::fmt::Debug for Delegation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegation")
            .field("delegates", &self.delegates.len())
            .field("selected", &self.selected_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessStatus;
    use crate::permissions::MockPermissions;
    use crate::store::PermissionStore;

    fn geolocation() -> Descriptor {
        Descriptor::new("geolocation")
    }

    fn delegate(status: AccessStatus) -> Arc<MockPermissions> {
        Arc::new(MockPermissions::new(
            PermissionStore::new([(geolocation(), status)]).unwrap(),
        ))
    }

    fn recorder(status: &PermissionStatus) -> Arc<Mutex<Vec<PermissionState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        status.add_event_listener(
            CHANGE_EVENT,
            EventListener::new(move |event| sink.lock().extend(event.state)),
            ListenerOptions::new(),
        );
        seen
    }

    #[test]
    fn test_empty_delegation_rejected() {
        assert!(matches!(
            Delegation::new(Vec::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_first_delegate_selected_initially() {
        let first: Arc<dyn Permissions> = delegate(AccessStatus::Granted);
        let second: Arc<dyn Permissions> = delegate(AccessStatus::Blocked);
        let delegation = Delegation::new(vec![first.clone(), second.clone()]).unwrap();

        assert!(delegation.is_selected_delegate(&first));
        assert!(!delegation.is_selected_delegate(&second));

        let status = delegation.query(&geolocation()).await.unwrap();
        assert_eq!(status.state().unwrap(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn test_switch_fires_one_event_when_state_differs() {
        let first: Arc<dyn Permissions> = delegate(AccessStatus::Granted);
        let second: Arc<dyn Permissions> = delegate(AccessStatus::Blocked);
        let delegation = Delegation::new(vec![first.clone(), second.clone()]).unwrap();

        let status = delegation.query(&geolocation()).await.unwrap();
        let seen = recorder(&status);

        delegation.select_delegate(&second).unwrap();
        assert!(delegation.is_selected_delegate(&second));
        assert_eq!(status.state().unwrap(), PermissionState::Denied);
        assert_eq!(*seen.lock(), vec![PermissionState::Denied]);
    }

    #[tokio::test]
    async fn test_switch_to_same_state_fires_nothing() {
        let first: Arc<dyn Permissions> = delegate(AccessStatus::Blocked);
        let second: Arc<dyn Permissions> = delegate(AccessStatus::BlockedAutomatically);
        let delegation = Delegation::new(vec![first, second.clone()]).unwrap();

        let status = delegation.query(&geolocation()).await.unwrap();
        let seen = recorder(&status);

        delegation.select_delegate(&second).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_only_selected_delegate_changes_propagate() {
        let first = delegate(AccessStatus::Prompt);
        let second = delegate(AccessStatus::Prompt);
        let first_dyn: Arc<dyn Permissions> = first.clone();
        let second_dyn: Arc<dyn Permissions> = second.clone();
        let delegation = Delegation::new(vec![first_dyn, second_dyn.clone()]).unwrap();

        let status = delegation.query(&geolocation()).await.unwrap();
        let seen = recorder(&status);

        second.set(&geolocation(), AccessStatus::Granted).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(status.state().unwrap(), PermissionState::Prompt);

        first.set(&geolocation(), AccessStatus::Blocked).unwrap();
        assert_eq!(*seen.lock(), vec![PermissionState::Denied]);

        delegation.select_delegate(&second_dyn).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![PermissionState::Denied, PermissionState::Granted]
        );

        first.set(&geolocation(), AccessStatus::Granted).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_delegate_rejected() {
        let first: Arc<dyn Permissions> = delegate(AccessStatus::Prompt);
        let stranger: Arc<dyn Permissions> = delegate(AccessStatus::Prompt);
        let delegation = Delegation::new(vec![first.clone()]).unwrap();

        let result = delegation.select_delegate(&stranger);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(delegation.is_selected_delegate(&first));
        assert!(!delegation.is_selected_delegate(&stranger));
    }

    #[tokio::test]
    async fn test_query_fails_if_any_delegate_lacks_descriptor() {
        let first: Arc<dyn Permissions> = delegate(AccessStatus::Prompt);
        let second: Arc<dyn Permissions> = Arc::new(MockPermissions::new(
            PermissionStore::new([(Descriptor::new("camera"), AccessStatus::Prompt)]).unwrap(),
        ));
        let delegation = Delegation::new(vec![first, second]).unwrap();

        let err = delegation.query(&geolocation()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_composite_subscribes_lazily_and_is_released() {
        let first = delegate(AccessStatus::Prompt);
        let second = delegate(AccessStatus::Prompt);
        let first_dyn: Arc<dyn Permissions> = first.clone();
        let second_dyn: Arc<dyn Permissions> = second.clone();
        let delegation = Delegation::new(vec![first_dyn, second_dyn]).unwrap();

        let status = delegation.query(&geolocation()).await.unwrap();
        assert_eq!(first.store().subscriber_count(), 0);
        assert_eq!(delegation.live_status_count(), 1);

        let _seen = recorder(&status);
        assert_eq!(first.store().subscriber_count(), 1);
        assert_eq!(second.store().subscriber_count(), 1);

        drop(status);
        assert_eq!(first.store().subscriber_count(), 0);
        assert_eq!(second.store().subscriber_count(), 0);
        assert_eq!(delegation.live_status_count(), 0);
    }
}
