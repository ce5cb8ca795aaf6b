//! Permission status objects
//!
//! A [`PermissionStatus`] is a long-lived handle on one permission. It reads
//! the masked state fresh on every access and raises `change` events when
//! the masked state moves.
//!
//! The handle only watches its underlying source while at least one change
//! listener is registered, counting capture and bubble listeners together.
//! The watch is installed when that count goes from zero to one and torn
//! down when it drops back to zero, so short-lived status objects never
//! leave subscribers behind in the store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::access::PermissionState;
use crate::descriptor::{Descriptor, MatchPredicate};
use crate::error::Result;
use crate::mask::PermissionMask;
use crate::signal::{AbortRegistration, AbortSignal};
use crate::store::PermissionStore;

/// Event type raised when the masked state changes
pub const CHANGE_EVENT: &str = "change";

/// Event delivered to status listeners
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionEvent {
    /// Event type, e.g. [`CHANGE_EVENT`]
    pub event_type: String,
    /// New masked state, set for change events
    pub state: Option<PermissionState>,
}

impl PermissionEvent {
    /// Create an event of an arbitrary type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state: None,
        }
    }

    /// Create a change event
    pub fn change(state: PermissionState) -> Self {
        Self {
            event_type: CHANGE_EVENT.to_string(),
            state: Some(state),
        }
    }
}

/// Shared event callback; listeners are identified by pointer
#[derive(Clone)]
pub struct EventListener(Arc<dyn Fn(&PermissionEvent) + Send + Sync>);

impl EventListener {
    /// Wrap a closure as a listener
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&PermissionEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, event: &PermissionEvent) {
        (self.0)(event)
    }
}

impl PartialEq for EventListener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EventListener {}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventListener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Options for [`PermissionStatus::add_event_listener`]
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Register for the capture phase
    pub capture: bool,
    /// Remove the listener after its first invocation
    pub once: bool,
    /// Remove the listener when this signal fires
    pub signal: Option<AbortSignal>,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct ListenerEntry {
    listener: EventListener,
    once: bool,
    removed: Arc<AtomicBool>,
    abort: Option<AbortRegistration>,
}

/// Listeners of one event type, split by phase
#[derive(Default)]
struct PhaseSets {
    capture: Vec<ListenerEntry>,
    bubble: Vec<ListenerEntry>,
}

impl PhaseSets {
    fn phase(&mut self, capture: bool) -> &mut Vec<ListenerEntry> {
        if capture {
            &mut self.capture
        } else {
            &mut self.bubble
        }
    }

    fn contains(&self, listener: &EventListener, capture: bool) -> bool {
        let set = if capture { &self.capture } else { &self.bubble };
        set.iter().any(|entry| entry.listener == *listener)
    }

    fn take(&mut self, listener: &EventListener, capture: bool) -> Option<ListenerEntry> {
        let set = self.phase(capture);
        let index = set.iter().position(|entry| entry.listener == *listener)?;
        let entry = set.remove(index);
        entry.removed.store(true, Ordering::SeqCst);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.capture.len() + self.bubble.len()
    }

    fn is_empty(&self) -> bool {
        self.capture.is_empty() && self.bubble.is_empty()
    }

    /// Capture listeners first, then bubble listeners
    fn snapshot(&self) -> Vec<(EventListener, bool, bool, Arc<AtomicBool>)> {
        self.capture
            .iter()
            .map(|e| (e, true))
            .chain(self.bubble.iter().map(|e| (e, false)))
            .map(|(e, capture)| (e.listener.clone(), capture, e.once, e.removed.clone()))
            .collect()
    }
}

/// Callback telling a status object to re-read its state
pub(crate) type Notify = Arc<dyn Fn() + Send + Sync>;

/// Undoes a [`StateSource::watch`]
pub(crate) type Teardown = Box<dyn FnOnce() + Send>;

/// Where a status object gets its masked state from
pub(crate) trait StateSource: Send + Sync {
    /// Current masked state
    fn current(&self) -> Result<PermissionState>;

    /// Call `notify` whenever the state may have changed
    fn watch(&self, notify: Notify) -> Teardown;
}

/// A single descriptor in a single store, seen through a mask
pub(crate) struct StoreSource {
    pub(crate) store: PermissionStore,
    pub(crate) descriptor: Descriptor,
    pub(crate) mask: Arc<PermissionMask>,
}

impl StateSource for StoreSource {
    fn current(&self) -> Result<PermissionState> {
        let status = self.store.get(&self.descriptor)?;
        Ok(self.mask.apply(&self.descriptor, status))
    }

    fn watch(&self, notify: Notify) -> Teardown {
        let descriptor = self.descriptor.clone();
        let subscription = self.store.subscribe(move |changed: &MatchPredicate, _, _| {
            if changed.matches(&descriptor) {
                notify();
            }
            Ok(())
        });
        Box::new(move || subscription.unsubscribe())
    }
}

#[derive(Default)]
struct StatusState {
    change: PhaseSets,
    other: HashMap<String, PhaseSets>,
    onchange: Option<EventListener>,
    watch: Option<Teardown>,
    last_state: Option<PermissionState>,
}

impl StatusState {
    fn sets(&mut self, event_type: &str) -> &mut PhaseSets {
        if event_type == CHANGE_EVENT {
            &mut self.change
        } else {
            self.other.entry(event_type.to_string()).or_default()
        }
    }
}

pub(crate) struct StatusInner {
    name: String,
    source: Box<dyn StateSource>,
    state: Mutex<StatusState>,
}

impl Drop for StatusInner {
    fn drop(&mut self) {
        if let Some(teardown) = self.state.get_mut().watch.take() {
            teardown();
        }
    }
}

/// Observable state of one permission
///
/// Only created by [`Permissions::query`](crate::Permissions::query);
/// there is no public constructor. Clones share listeners and state.
#[derive(Clone)]
pub struct PermissionStatus {
    inner: Arc<StatusInner>,
}

impl PermissionStatus {
    pub(crate) fn new(name: impl Into<String>, source: Box<dyn StateSource>) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                name: name.into(),
                source,
                state: Mutex::new(StatusState::default()),
            }),
        }
    }

    /// Permission name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current masked state, read fresh
    pub fn state(&self) -> Result<PermissionState> {
        self.inner.source.current()
    }

    /// The listener installed through [`PermissionStatus::set_onchange`]
    pub fn onchange(&self) -> Option<EventListener> {
        self.inner.state.lock().onchange.clone()
    }

    /// Replace the `onchange` bubble listener; `None` clears it
    pub fn set_onchange(&self, listener: Option<EventListener>) {
        let previous = self.inner.state.lock().onchange.take();
        if let Some(previous) = previous {
            self.remove_event_listener(CHANGE_EVENT, &previous, false);
        }
        if let Some(listener) = listener {
            self.add_event_listener(CHANGE_EVENT, listener.clone(), ListenerOptions::default());
            self.inner.state.lock().onchange = Some(listener);
        }
    }

    /// Register a listener
    ///
    /// Adding a listener already registered for the same type and phase
    /// does nothing. A listener whose signal already fired is not added.
    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: EventListener,
        options: ListenerOptions,
    ) {
        if options.signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            return;
        }

        let capture = options.capture;
        let abort = options.signal.as_ref().and_then(|signal| {
            let weak = Arc::downgrade(&self.inner);
            let event_type = event_type.to_string();
            let listener = listener.clone();
            signal.on_abort(move || {
                if let Some(inner) = weak.upgrade() {
                    PermissionStatus { inner }
                        .remove_event_listener(&event_type, &listener, capture);
                }
            })
        });

        let start_watch = {
            let mut state = self.inner.state.lock();
            let sets = state.sets(event_type);
            if sets.contains(&listener, capture) {
                drop(state);
                if let Some(abort) = abort {
                    abort.remove();
                }
                return;
            }
            sets.phase(capture).push(ListenerEntry {
                listener,
                once: options.once,
                removed: Arc::new(AtomicBool::new(false)),
                abort,
            });
            event_type == CHANGE_EVENT && state.change.len() == 1 && state.watch.is_none()
        };

        if start_watch {
            self.start_watch();
        }
    }

    /// Remove a listener registered for `event_type` in the given phase
    pub fn remove_event_listener(&self, event_type: &str, listener: &EventListener, capture: bool) {
        let (entry, teardown) = {
            let mut state = self.inner.state.lock();
            let entry = state.sets(event_type).take(listener, capture);
            let teardown = if entry.is_some()
                && event_type == CHANGE_EVENT
                && state.change.is_empty()
            {
                state.last_state = None;
                state.watch.take()
            } else {
                None
            };
            (entry, teardown)
        };

        if let Some(abort) = entry.and_then(|entry| entry.abort) {
            abort.remove();
        }
        if let Some(teardown) = teardown {
            debug!("Permission status {} stopped watching", self.inner.name);
            teardown();
        }
    }

    /// Deliver `event` to the listeners registered for its type
    ///
    /// Capture listeners run before bubble listeners. A listener removed
    /// during dispatch is skipped if it has not run yet.
    pub fn dispatch_event(&self, event: &PermissionEvent) {
        let listeners = {
            let mut state = self.inner.state.lock();
            state.sets(&event.event_type).snapshot()
        };

        for (listener, capture, once, removed) in listeners {
            if removed.load(Ordering::SeqCst) {
                continue;
            }
            if once {
                self.remove_event_listener(&event.event_type, &listener, capture);
            }
            if catch_unwind(AssertUnwindSafe(|| listener.call(event))).is_err() {
                warn!(
                    "Listener for {} event on {} panicked",
                    event.event_type, self.inner.name
                );
            }
        }
    }

    /// Number of registered change listeners across both phases
    pub fn change_listener_count(&self) -> usize {
        self.inner.state.lock().change.len()
    }

    /// Check whether the status is currently watching its source
    pub fn is_watching(&self) -> bool {
        self.inner.state.lock().watch.is_some()
    }

    /// Re-read the state and raise a change event if it moved
    pub(crate) fn refresh(&self) {
        let current = match self.inner.source.current() {
            Ok(current) => current,
            Err(e) => {
                warn!("Failed to read state of {}: {}", self.inner.name, e);
                return;
            }
        };

        let changed = {
            let mut state = self.inner.state.lock();
            if state.watch.is_none() {
                return;
            }
            let changed = state.last_state != Some(current);
            state.last_state = Some(current);
            changed
        };

        if changed {
            debug!("Permission status {} is now {}", self.inner.name, current);
            self.dispatch_event(&PermissionEvent::change(current));
        }
    }

    pub(crate) fn downgrade(&self) -> WeakPermissionStatus {
        WeakPermissionStatus(Arc::downgrade(&self.inner))
    }

    fn start_watch(&self) {
        let current = self.inner.source.current().ok();
        let weak = Arc::downgrade(&self.inner);
        let notify: Notify = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                PermissionStatus { inner }.refresh();
            }
        });
        let teardown = self.inner.source.watch(notify);

        let mut state = self.inner.state.lock();
        if state.watch.is_none() && !state.change.is_empty() {
            debug!("Permission status {} started watching", self.inner.name);
            state.watch = Some(teardown);
            state.last_state = current;
        } else {
            drop(state);
            teardown();
        }
    }
}

impl std::fmt::Debug for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStatus")
            .field("name", &self.inner.name)
            .field("state", &self.state().ok())
            .field("change_listeners", &self.change_listener_count())
            .finish()
    }
}

/// Non-owning handle on a status object
#[derive(Clone)]
pub(crate) struct WeakPermissionStatus(Weak<StatusInner>);

impl WeakPermissionStatus {
    pub(crate) fn upgrade(&self) -> Option<PermissionStatus> {
        self.0.upgrade().map(|inner| PermissionStatus { inner })
    }
}
