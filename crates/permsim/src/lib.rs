//! Permission Simulator
//!
//! In-memory permission state store with observable status objects,
//! a simulated consent dialog flow, state masking, multi-store delegation
//! and a wait-for-state observer. Meant for exercising permission-dependent
//! code deterministically in tests.

pub mod access;
pub mod config;
pub mod delegation;
pub mod descriptor;
pub mod dialog;
pub mod error;
pub mod mask;
pub mod observer;
pub mod permissions;
pub mod request;
pub mod signal;
pub mod status;
pub mod store;

pub use access::{AccessStatus, PermissionState};
pub use config::{InitialPermission, MaskEntry, PermissionSimConfig};
pub use delegation::Delegation;
pub use descriptor::{DefaultMatcher, Descriptor, DescriptorMatcher, MatchPredicate};
pub use dialog::{AccessDialog, DialogOutcome, DialogResult};
pub use error::{Error, Result};
pub use mask::PermissionMask;
pub use observer::StateObserver;
pub use permissions::{MockPermissions, Permissions};
pub use request::{
    handler_fn, AccessHandler, AccessManager, AccessRequestRecord, DEFAULT_DISMISSAL_THRESHOLD,
};
pub use signal::{AbortController, AbortRegistration, AbortSignal};
pub use status::{EventListener, ListenerOptions, PermissionEvent, PermissionStatus, CHANGE_EVENT};
pub use store::{PermissionStore, Subscriber, SubscriberFault, SubscriberResult, Subscription};
