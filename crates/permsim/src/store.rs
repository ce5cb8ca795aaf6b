//! Permission state store
//!
//! The store is the single source of truth for access statuses. Every
//! transition goes through [`PermissionStore::set`], which notifies
//! subscribers synchronously and in registration order.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::access::AccessStatus;
use crate::descriptor::{DefaultMatcher, Descriptor, DescriptorMatcher, MatchPredicate};
use crate::error::{Error, Result};

/// Capacity of the subscriber fault channel
const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Result returned by a subscriber
pub type SubscriberResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback invoked with (changed-descriptor predicate, new status, old status)
pub type Subscriber =
    Arc<dyn Fn(&MatchPredicate, AccessStatus, AccessStatus) -> SubscriberResult + Send + Sync>;

/// A subscriber failure, reported out of band
#[derive(Debug, Clone)]
pub struct SubscriberFault {
    /// Descriptor whose transition was being delivered
    pub descriptor: Descriptor,
    /// Error or panic message
    pub message: String,
}

struct StoreInner {
    entries: Mutex<Vec<(Descriptor, AccessStatus)>>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber_id: AtomicU64,
    matcher: Arc<dyn DescriptorMatcher>,
    faults: broadcast::Sender<SubscriberFault>,
}

/// Mutable mapping from descriptor to access status
///
/// Cloning is cheap; clones share the same state and subscribers.
#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<StoreInner>,
}

impl PermissionStore {
    /// Create a store using the default matcher
    pub fn new<I>(initial: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Descriptor, AccessStatus)>,
    {
        Self::with_matcher(initial, Arc::new(DefaultMatcher::new()))
    }

    /// Create a store using a custom matcher
    ///
    /// Fails with `InvalidArgument` if two initial descriptors match each
    /// other.
    pub fn with_matcher<I>(initial: I, matcher: Arc<dyn DescriptorMatcher>) -> Result<Self>
    where
        I: IntoIterator<Item = (Descriptor, AccessStatus)>,
    {
        let mut entries: Vec<(Descriptor, AccessStatus)> = Vec::new();
        for (descriptor, status) in initial {
            if entries.iter().any(|(d, _)| matcher.matches(d, &descriptor)) {
                return Err(Error::InvalidArgument(format!(
                    "Duplicate permission descriptor: {}",
                    descriptor.to_json()
                )));
            }
            entries.push((descriptor, status));
        }

        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(entries),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(0),
                matcher,
                faults,
            }),
        })
    }

    /// Check whether some stored entry matches `descriptor`
    pub fn has(&self, descriptor: &Descriptor) -> bool {
        self.inner
            .entries
            .lock()
            .iter()
            .any(|(d, _)| self.inner.matcher.matches(d, descriptor))
    }

    /// Get the status of the entry matching `descriptor`
    pub fn get(&self, descriptor: &Descriptor) -> Result<AccessStatus> {
        self.inner
            .entries
            .lock()
            .iter()
            .find(|(d, _)| self.inner.matcher.matches(d, descriptor))
            .map(|(_, status)| *status)
            .ok_or_else(|| Error::not_found(descriptor))
    }

    /// Transition the entry matching `descriptor` to `to`
    ///
    /// Writing the current status again is a no-op and notifies nobody.
    /// Subscriber errors and panics do not reach the caller; they are sent
    /// to the fault channel (see [`PermissionStore::subscribe_faults`]).
    pub fn set(&self, descriptor: &Descriptor, to: AccessStatus) -> Result<()> {
        let from = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|(d, _)| self.inner.matcher.matches(d, descriptor))
                .ok_or_else(|| Error::not_found(descriptor))?;
            if entry.1 == to {
                return Ok(());
            }
            std::mem::replace(&mut entry.1, to)
        };

        debug!("Permission {} changed: {} -> {}", descriptor.name, from, to);

        let predicate = MatchPredicate::new(self.inner.matcher.clone(), descriptor.clone());
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(&predicate, to, from)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            self.report_fault(descriptor, message);
        }

        Ok(())
    }

    /// Register a subscriber closure
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&MatchPredicate, AccessStatus, AccessStatus) -> SubscriberResult
            + Send
            + Sync
            + 'static,
    {
        self.subscribe_shared(Arc::new(subscriber))
    }

    /// Register a shared subscriber
    ///
    /// Registering the same `Arc` twice keeps a single registration.
    pub fn subscribe_shared(&self, subscriber: Subscriber) -> Subscription {
        let mut subscribers = self.inner.subscribers.lock();
        let id = match subscribers
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &subscriber))
        {
            Some((id, _)) => *id,
            None => {
                let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
                subscribers.push((id, subscriber));
                id
            }
        };

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receive subscriber faults raised after this call
    pub fn subscribe_faults(&self) -> broadcast::Receiver<SubscriberFault> {
        self.inner.faults.subscribe()
    }

    /// Get the number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Get all stored descriptors, in insertion order
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|(d, _)| d.clone())
            .collect()
    }

    /// The matcher used for lookups
    pub fn matcher(&self) -> Arc<dyn DescriptorMatcher> {
        self.inner.matcher.clone()
    }

    fn report_fault(&self, descriptor: &Descriptor, message: String) {
        warn!("Permission subscriber failed for {}: {}", descriptor.name, message);
        // No receivers is fine; the fault has been logged
        let _ = self.inner.faults.send(SubscriberFault {
            descriptor: descriptor.clone(),
            message,
        });
    }
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStore")
            .field("entries", &*self.inner.entries.lock())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "subscriber panicked".to_string()
    }
}

/// Handle removing one subscriber registration
#[derive(Debug, Clone)]
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    /// Remove the registration; later calls do nothing
    pub fn unsubscribe(&self) {
        if let Some(store) = self.store.upgrade() {
            store.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
