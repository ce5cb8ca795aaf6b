//! Query seam and the store-backed implementation

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::access::{AccessStatus, PermissionState};
use crate::config::PermissionSimConfig;
use crate::descriptor::{Descriptor, DescriptorMatcher};
use crate::error::{Error, Result};
use crate::mask::PermissionMask;
use crate::request::{AccessHandler, AccessManager, AccessRequestRecord};
use crate::status::{PermissionStatus, StoreSource};
use crate::store::PermissionStore;

/// Something that hands out status objects for descriptors
#[async_trait]
pub trait Permissions: Send + Sync {
    /// Get a status object for `descriptor`
    async fn query(&self, descriptor: &Descriptor) -> Result<PermissionStatus>;
}

/// Store, mask and access manager bundled into one permission subsystem
pub struct MockPermissions {
    store: PermissionStore,
    mask: Arc<PermissionMask>,
    manager: Arc<AccessManager>,
}

impl MockPermissions {
    /// Create a subsystem over `store` with the default mask
    pub fn new(store: PermissionStore) -> Self {
        Self::with_mask(store, PermissionMask::new())
    }

    /// Create a subsystem over `store` with a custom mask
    pub fn with_mask(store: PermissionStore, mask: PermissionMask) -> Self {
        let manager = Arc::new(AccessManager::new(store.clone()));
        Self {
            store,
            mask: Arc::new(mask),
            manager,
        }
    }

    /// Set the dismissal threshold, resetting the access manager
    pub fn with_dismissal_threshold(mut self, threshold: u32) -> Self {
        self.manager = Arc::new(
            AccessManager::new(self.store.clone()).with_dismissal_threshold(threshold),
        );
        self
    }

    /// Build a subsystem from configuration
    pub fn from_config(config: &PermissionSimConfig) -> Result<Self> {
        Self::from_config_with_matcher(config, None)
    }

    /// Build a subsystem from configuration using a custom matcher
    pub fn from_config_with_matcher(
        config: &PermissionSimConfig,
        matcher: Option<Arc<dyn DescriptorMatcher>>,
    ) -> Result<Self> {
        let initial = config
            .permissions
            .iter()
            .map(|p| (p.descriptor.clone(), p.status));
        let store = match &matcher {
            Some(matcher) => PermissionStore::with_matcher(initial, matcher.clone())?,
            None => PermissionStore::new(initial)?,
        };
        let mask = config.build_mask(matcher);

        debug!(
            "Built permission subsystem with {} permissions and {} mask entries",
            config.permissions.len(),
            config.masks.len()
        );
        Ok(Self::with_mask(store, mask).with_dismissal_threshold(config.dismissal_threshold))
    }

    /// The backing store
    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    /// The mask applied to every status object
    pub fn mask(&self) -> &PermissionMask {
        &self.mask
    }

    /// The access manager driving access requests
    pub fn manager(&self) -> &AccessManager {
        &self.manager
    }

    /// Install the consent handler
    pub fn set_handler(&self, handler: Arc<dyn AccessHandler>) {
        self.manager.set_handler(handler);
    }

    /// Current masked state, without creating a status object
    pub fn state(&self, descriptor: &Descriptor) -> Result<PermissionState> {
        let status = self.store.get(descriptor)?;
        Ok(self.mask.apply(descriptor, status))
    }

    /// Write a new access status
    pub fn set(&self, descriptor: &Descriptor, status: AccessStatus) -> Result<()> {
        self.store.set(descriptor, status)
    }

    /// Run the access request flow for `descriptor`
    pub async fn request_access(&self, descriptor: &Descriptor) -> Result<bool> {
        self.manager.request_access(descriptor).await
    }

    /// Recorded access requests, optionally for one descriptor
    pub fn access_requests(&self, descriptor: Option<&Descriptor>) -> Vec<AccessRequestRecord> {
        self.manager.access_requests(descriptor)
    }

    /// Number of recorded access requests, optionally for one descriptor
    pub fn access_request_count(&self, descriptor: Option<&Descriptor>) -> usize {
        self.manager.access_request_count(descriptor)
    }

    /// Drop recorded access requests, optionally for one descriptor
    pub fn clear_access_requests(&self, descriptor: Option<&Descriptor>) {
        self.manager.clear_access_requests(descriptor)
    }
}

#[async_trait]
impl Permissions for MockPermissions {
    async fn query(&self, descriptor: &Descriptor) -> Result<PermissionStatus> {
        if !self.store.has(descriptor) {
            return Err(Error::not_found(descriptor));
        }
        Ok(PermissionStatus::new(
            descriptor.name(),
            Box::new(StoreSource {
                store: self.store.clone(),
                descriptor: descriptor.clone(),
                mask: self.mask.clone(),
            }),
        ))
    }
}

impl std::fmt::Debug for MockPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPermissions")
            .field("store", &self.store)
            .field("mask", &self.mask)
            .field("manager", &self.manager)
            .finish()
    }
}
