//! Serde-loadable setup for a permission subsystem

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::access::{AccessStatus, PermissionState};
use crate::descriptor::{Descriptor, DescriptorMatcher};
use crate::error::Result;
use crate::mask::PermissionMask;
use crate::request::DEFAULT_DISMISSAL_THRESHOLD;

/// Initial status of one permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialPermission {
    pub descriptor: Descriptor,
    pub status: AccessStatus,
}

/// Mask remapping for one descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskEntry {
    pub descriptor: Descriptor,
    pub states: HashMap<AccessStatus, PermissionState>,
}

/// Configuration of a [`MockPermissions`](crate::MockPermissions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSimConfig {
    /// Dismissals in a row before auto-blocking; 0 disables auto-blocking
    pub dismissal_threshold: u32,
    /// Initial store contents
    pub permissions: Vec<InitialPermission>,
    /// Mask entries
    pub masks: Vec<MaskEntry>,
}

impl Default for PermissionSimConfig {
    fn default() -> Self {
        Self {
            dismissal_threshold: DEFAULT_DISMISSAL_THRESHOLD,
            permissions: Vec::new(),
            masks: Vec::new(),
        }
    }
}

impl PermissionSimConfig {
    /// Parse configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading permission config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Render configuration as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Add an initial permission
    pub fn with_permission(mut self, descriptor: Descriptor, status: AccessStatus) -> Self {
        self.permissions.push(InitialPermission { descriptor, status });
        self
    }

    /// Set the dismissal threshold
    pub fn with_dismissal_threshold(mut self, threshold: u32) -> Self {
        self.dismissal_threshold = threshold;
        self
    }

    pub(crate) fn build_mask(&self, matcher: Option<Arc<dyn DescriptorMatcher>>) -> PermissionMask {
        let mut mask = match matcher {
            Some(matcher) => PermissionMask::with_matcher(matcher),
            None => PermissionMask::new(),
        };
        for entry in &self.masks {
            for (status, state) in &entry.states {
                mask.insert(entry.descriptor.clone(), *status, *state);
            }
        }
        mask
    }
}
