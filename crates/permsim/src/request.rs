//! Access request flow
//!
//! [`AccessManager::request_access`] decides whether a dialog is needed,
//! hands an [`AccessDialog`] to the configured [`AccessHandler`], interprets
//! the outcome and applies the resulting transition to the store. Every
//! request is recorded as an [`AccessRequestRecord`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::AccessStatus;
use crate::descriptor::Descriptor;
use crate::dialog::{AccessDialog, DialogOutcome, DialogResult};
use crate::error::Result;
use crate::store::PermissionStore;

/// Dismissals in a row that block a permission automatically
pub const DEFAULT_DISMISSAL_THRESHOLD: u32 = 3;

/// Pluggable consent handler
///
/// The handler should take one terminal action on the dialog. Returning
/// with the dialog still open counts as a dismissal.
#[async_trait]
pub trait AccessHandler: Send + Sync {
    async fn handle(&self, dialog: AccessDialog, descriptor: Descriptor);
}

/// Adapter turning an async closure into an [`AccessHandler`]
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> AccessHandler for HandlerFn<F>
where
    F: Fn(AccessDialog, Descriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, dialog: AccessDialog, descriptor: Descriptor) {
        (self.0)(dialog, descriptor).await
    }
}

/// Wrap an async closure as a shared handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AccessHandler>
where
    F: Fn(AccessDialog, Descriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// One access request, pending or completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequestRecord {
    /// Unique identifier of the request
    pub id: String,
    /// Requested permission
    pub descriptor: Descriptor,
    /// Decision, `None` while pending or when the dialog was dismissed
    pub result: Option<DialogResult>,
    /// Whether the request has finished
    pub completed: bool,
    /// When the request started
    pub requested_at: DateTime<Utc>,
    /// When the request finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl AccessRequestRecord {
    fn pending(descriptor: Descriptor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            descriptor,
            result: None,
            completed: false,
            requested_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// How a request was resolved
#[derive(Debug, Clone, Copy)]
enum Resolution {
    /// A remembered status answered without a dialog
    Remembered { allow: bool },
    /// No handler configured; the prompt is denied without remembering
    DefaultDeny,
    /// A dialog was shown
    Dialog(DialogOutcome),
}

impl Resolution {
    fn result(self) -> Option<DialogResult> {
        match self {
            Resolution::Remembered { allow } => Some(DialogResult {
                allow,
                remember: true,
            }),
            Resolution::DefaultDeny => Some(DialogResult {
                allow: false,
                remember: false,
            }),
            Resolution::Dialog(outcome) => outcome.result(),
        }
    }

    fn is_allowed(self) -> bool {
        self.result().map(|r| r.allow).unwrap_or(false)
    }
}

/// Access request flow bound to one store
pub struct AccessManager {
    store: PermissionStore,
    handler: Mutex<Option<Arc<dyn AccessHandler>>>,
    dismissal_threshold: u32,
    dismissals: Mutex<Vec<(Descriptor, u32)>>,
    records: Mutex<Vec<AccessRequestRecord>>,
}

impl AccessManager {
    /// Create a manager with no handler and the default dismissal threshold
    pub fn new(store: PermissionStore) -> Self {
        Self {
            store,
            handler: Mutex::new(None),
            dismissal_threshold: DEFAULT_DISMISSAL_THRESHOLD,
            dismissals: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Set the dismissal threshold; 0 disables automatic blocking
    pub fn with_dismissal_threshold(mut self, threshold: u32) -> Self {
        self.dismissal_threshold = threshold;
        self
    }

    /// Set the consent handler
    pub fn with_handler(self, handler: Arc<dyn AccessHandler>) -> Self {
        self.set_handler(handler);
        self
    }

    /// Replace the consent handler
    pub fn set_handler(&self, handler: Arc<dyn AccessHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Remove the consent handler, restoring the default policy
    pub fn clear_handler(&self) {
        *self.handler.lock() = None;
    }

    /// The store this manager writes to
    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    /// The configured dismissal threshold
    pub fn dismissal_threshold(&self) -> u32 {
        self.dismissal_threshold
    }

    /// Request access and report whether it was allowed
    ///
    /// Fails with `NotFound` before anything is recorded if the store has
    /// no entry for `descriptor`.
    pub async fn request_access(&self, descriptor: &Descriptor) -> Result<bool> {
        let current = self.store.get(descriptor)?;
        let record = AccessRequestRecord::pending(descriptor.clone());
        let id = record.id.clone();
        self.records.lock().push(record);

        debug!("Access requested for {} (status {})", descriptor.name, current);

        let resolution = match current {
            AccessStatus::Granted => Resolution::Remembered { allow: true },
            AccessStatus::Blocked | AccessStatus::BlockedAutomatically => {
                Resolution::Remembered { allow: false }
            }
            AccessStatus::Prompt | AccessStatus::Allowed | AccessStatus::Denied => {
                let handler = self.handler.lock().clone();
                match handler {
                    Some(handler) => Resolution::Dialog(self.run_dialog(handler, descriptor).await),
                    None => Resolution::DefaultDeny,
                }
            }
        };

        let applied = self.apply(descriptor, resolution);
        self.complete(&id, resolution.result());
        applied?;

        let allowed = resolution.is_allowed();
        debug!("Access request for {} resolved: allowed={}", descriptor.name, allowed);
        Ok(allowed)
    }

    async fn run_dialog(
        &self,
        handler: Arc<dyn AccessHandler>,
        descriptor: &Descriptor,
    ) -> DialogOutcome {
        let dialog = AccessDialog::new(descriptor.clone());
        handler.handle(dialog.clone(), descriptor.clone()).await;

        match dialog.outcome() {
            Some(outcome) => outcome,
            None => {
                debug!("Handler for {} returned without acting; dismissing", descriptor.name);
                // Close the dialog so late calls from the handler fail
                let _ = dialog.dismiss();
                DialogOutcome::Dismissed
            }
        }
    }

    fn apply(&self, descriptor: &Descriptor, resolution: Resolution) -> Result<()> {
        match resolution {
            Resolution::Remembered { .. } => Ok(()),
            Resolution::DefaultDeny => self.store.set(descriptor, AccessStatus::Denied),
            Resolution::Dialog(DialogOutcome::Decided(result)) => {
                self.reset_dismissals(descriptor);
                let status = match (result.allow, result.remember) {
                    (true, true) => AccessStatus::Granted,
                    (true, false) => AccessStatus::Allowed,
                    (false, true) => AccessStatus::Blocked,
                    (false, false) => AccessStatus::Denied,
                };
                self.store.set(descriptor, status)
            }
            Resolution::Dialog(DialogOutcome::Dismissed) => {
                let count = self.increment_dismissals(descriptor);
                if self.dismissal_threshold > 0 && count >= self.dismissal_threshold {
                    warn!(
                        "Permission {} blocked automatically after {} dismissals",
                        descriptor.name, count
                    );
                    self.reset_dismissals(descriptor);
                    self.store.set(descriptor, AccessStatus::BlockedAutomatically)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn complete(&self, id: &str, result: Option<DialogResult>) {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.result = result;
                record.completed = true;
                record.completed_at = Some(Utc::now());
            }
            None => debug!("Access request {} was cleared before completing", id),
        }
    }

    fn increment_dismissals(&self, descriptor: &Descriptor) -> u32 {
        let matcher = self.store.matcher();
        let mut dismissals = self.dismissals.lock();
        match dismissals
            .iter_mut()
            .find(|(d, _)| matcher.matches(d, descriptor))
        {
            Some((_, count)) => {
                *count += 1;
                *count
            }
            None => {
                dismissals.push((descriptor.clone(), 1));
                1
            }
        }
    }

    fn reset_dismissals(&self, descriptor: &Descriptor) {
        let matcher = self.store.matcher();
        self.dismissals
            .lock()
            .retain(|(d, _)| !matcher.matches(d, descriptor));
    }

    /// Consecutive dismissals counted for `descriptor`
    pub fn dismissal_count(&self, descriptor: &Descriptor) -> u32 {
        let matcher = self.store.matcher();
        self.dismissals
            .lock()
            .iter()
            .find(|(d, _)| matcher.matches(d, descriptor))
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Recorded requests, oldest first, optionally limited to one permission
    pub fn access_requests(&self, descriptor: Option<&Descriptor>) -> Vec<AccessRequestRecord> {
        let matcher = self.store.matcher();
        self.records
            .lock()
            .iter()
            .filter(|r| descriptor.map_or(true, |d| matcher.matches(&r.descriptor, d)))
            .cloned()
            .collect()
    }

    /// Number of recorded requests, optionally limited to one permission
    pub fn access_request_count(&self, descriptor: Option<&Descriptor>) -> usize {
        let matcher = self.store.matcher();
        self.records
            .lock()
            .iter()
            .filter(|r| descriptor.map_or(true, |d| matcher.matches(&r.descriptor, d)))
            .count()
    }

    /// Forget recorded requests, optionally only for one permission
    pub fn clear_access_requests(&self, descriptor: Option<&Descriptor>) {
        let matcher = self.store.matcher();
        let mut records = self.records.lock();
        match descriptor {
            Some(d) => records.retain(|r| !matcher.matches(&r.descriptor, d)),
            None => records.clear(),
        }
    }
}

impl std::fmt::Debug for AccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessManager")
            .field("store", &self.store)
            .field("dismissal_threshold", &self.dismissal_threshold)
            .field("has_handler", &self.handler.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geolocation() -> Descriptor {
        Descriptor::new("geolocation")
    }

    fn new_manager(status: AccessStatus) -> AccessManager {
        let store = PermissionStore::new([
            (geolocation(), status),
            (Descriptor::new("notifications"), AccessStatus::Prompt),
        ])
        .unwrap();
        AccessManager::new(store)
    }

    fn allow(remember: bool) -> Arc<dyn AccessHandler> {
        handler_fn(move |dialog: AccessDialog, _| async move {
            dialog.remember(remember).unwrap();
            dialog.allow().unwrap();
        })
    }

    fn deny(remember: bool) -> Arc<dyn AccessHandler> {
        handler_fn(move |dialog: AccessDialog, _| async move {
            dialog.remember(remember).unwrap();
            dialog.deny().unwrap();
        })
    }

    fn dismiss() -> Arc<dyn AccessHandler> {
        handler_fn(|dialog: AccessDialog, _| async move {
            dialog.dismiss().unwrap();
        })
    }

    #[tokio::test]
    async fn test_allow_remembered_grants() {
        let manager = new_manager(AccessStatus::Prompt).with_handler(allow(true));
        assert!(manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Granted);
    }

    #[tokio::test]
    async fn test_decision_table() {
        let cases = [
            (allow(false), true, AccessStatus::Allowed),
            (deny(true), false, AccessStatus::Blocked),
            (deny(false), false, AccessStatus::Denied),
        ];
        for (handler, expected_allowed, expected_status) in cases {
            let manager = new_manager(AccessStatus::Prompt).with_handler(handler);
            assert_eq!(
                manager.request_access(&geolocation()).await.unwrap(),
                expected_allowed
            );
            assert_eq!(manager.store().get(&geolocation()).unwrap(), expected_status);
        }
    }

    #[tokio::test]
    async fn test_remembered_statuses_skip_the_dialog() {
        let manager = new_manager(AccessStatus::Granted).with_handler(deny(true));
        assert!(manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Granted);

        let manager = new_manager(AccessStatus::Blocked).with_handler(allow(true));
        assert!(!manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Blocked);
    }

    #[tokio::test]
    async fn test_default_policy_denies_prompt() {
        let manager = new_manager(AccessStatus::Prompt);
        assert!(!manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Denied);

        let records = manager.access_requests(None);
        assert_eq!(
            records[0].result,
            Some(DialogResult {
                allow: false,
                remember: false
            })
        );
    }

    #[tokio::test]
    async fn test_default_policy_passes_granted_through() {
        let manager = new_manager(AccessStatus::Granted);
        assert!(manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Granted);
    }

    #[tokio::test]
    async fn test_dismissals_block_at_threshold() {
        let manager = new_manager(AccessStatus::Prompt)
            .with_dismissal_threshold(3)
            .with_handler(dismiss());

        for expected in 1..3 {
            assert!(!manager.request_access(&geolocation()).await.unwrap());
            assert_eq!(manager.dismissal_count(&geolocation()), expected);
            assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Prompt);
        }

        assert!(!manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(
            manager.store().get(&geolocation()).unwrap(),
            AccessStatus::BlockedAutomatically
        );
        assert_eq!(manager.dismissal_count(&geolocation()), 0);

        manager.store().set(&geolocation(), AccessStatus::Prompt).unwrap();
        manager.request_access(&geolocation()).await.unwrap();
        assert_eq!(manager.dismissal_count(&geolocation()), 1);
    }

    #[tokio::test]
    async fn test_decision_resets_dismissals() {
        let manager = new_manager(AccessStatus::Prompt).with_handler(dismiss());
        manager.request_access(&geolocation()).await.unwrap();
        manager.request_access(&geolocation()).await.unwrap();
        assert_eq!(manager.dismissal_count(&geolocation()), 2);

        manager.set_handler(deny(false));
        manager.request_access(&geolocation()).await.unwrap();
        assert_eq!(manager.dismissal_count(&geolocation()), 0);
    }

    #[tokio::test]
    async fn test_zero_threshold_never_blocks() {
        let manager = new_manager(AccessStatus::Prompt)
            .with_dismissal_threshold(0)
            .with_handler(dismiss());
        for _ in 0..5 {
            manager.request_access(&geolocation()).await.unwrap();
        }
        assert_eq!(manager.store().get(&geolocation()).unwrap(), AccessStatus::Prompt);
    }

    #[tokio::test]
    async fn test_idle_handler_counts_as_dismissal() {
        let kept: Arc<Mutex<Option<AccessDialog>>> = Arc::new(Mutex::new(None));
        let slot = kept.clone();
        let manager = new_manager(AccessStatus::Prompt).with_handler(handler_fn(
            move |dialog: AccessDialog, _| {
                let slot = slot.clone();
                async move {
                    *slot.lock() = Some(dialog);
                }
            },
        ));

        assert!(!manager.request_access(&geolocation()).await.unwrap());
        assert_eq!(manager.dismissal_count(&geolocation()), 1);

        let late = kept.lock().take().unwrap();
        assert!(late.allow().is_err());
        assert_eq!(manager.access_requests(None)[0].result, None);
    }

    #[tokio::test]
    async fn test_records_are_scoped_and_cleared() {
        let manager = new_manager(AccessStatus::Prompt).with_handler(allow(false));
        manager.request_access(&geolocation()).await.unwrap();
        manager.request_access(&geolocation()).await.unwrap();
        manager
            .request_access(&Descriptor::new("notifications"))
            .await
            .unwrap();

        assert_eq!(manager.access_request_count(None), 3);
        assert_eq!(manager.access_request_count(Some(&geolocation())), 2);

        let records = manager.access_requests(Some(&geolocation()));
        assert!(records.iter().all(|r| r.completed && r.completed_at.is_some()));
        assert!(records[0].requested_at <= records[1].requested_at);

        manager.clear_access_requests(Some(&geolocation()));
        assert_eq!(manager.access_request_count(None), 1);
        manager.clear_access_requests(None);
        assert_eq!(manager.access_request_count(None), 0);
    }

    #[tokio::test]
    async fn test_unknown_descriptor_is_not_recorded() {
        let manager = new_manager(AccessStatus::Prompt);
        let err = manager
            .request_access(&Descriptor::new("camera"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(manager.access_request_count(None), 0);
    }

    #[tokio::test]
    async fn test_pending_record_visible_while_handler_runs() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let manager = Arc::new(new_manager(AccessStatus::Prompt).with_handler(handler_fn(
            move |dialog: AccessDialog, _| {
                let release = release_rx.lock().take();
                async move {
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    dialog.allow().unwrap();
                }
            },
        )));

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.request_access(&geolocation()).await }
        });

        while manager.access_request_count(None) == 0 {
            tokio::task::yield_now().await;
        }
        let pending = manager.access_requests(None);
        assert!(!pending[0].completed);
        assert_eq!(pending[0].result, None);

        release_tx.send(()).unwrap();
        assert!(task.await.unwrap().unwrap());
        assert!(manager.access_requests(None)[0].completed);
    }
}
