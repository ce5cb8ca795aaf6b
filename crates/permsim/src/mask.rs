//! Per-descriptor remapping of access status to external state

use std::collections::HashMap;
use std::sync::Arc;

use crate::access::{AccessStatus, PermissionState};
use crate::descriptor::{DefaultMatcher, Descriptor, DescriptorMatcher};

/// Lookup table from descriptor to a partial status remapping
///
/// Lookup uses the matcher, like store lookup. Statuses missing from a
/// matched entry, and descriptors with no entry, use
/// [`AccessStatus::default_state`].
#[derive(Clone)]
pub struct PermissionMask {
    entries: Vec<(Descriptor, HashMap<AccessStatus, PermissionState>)>,
    matcher: Arc<dyn DescriptorMatcher>,
}

impl PermissionMask {
    /// Create an empty mask using the default matcher
    pub fn new() -> Self {
        Self::with_matcher(Arc::new(DefaultMatcher::new()))
    }

    /// Create an empty mask using a custom matcher
    pub fn with_matcher(matcher: Arc<dyn DescriptorMatcher>) -> Self {
        Self {
            entries: Vec::new(),
            matcher,
        }
    }

    /// Remap `status` to `state` for `descriptor`
    pub fn insert(&mut self, descriptor: Descriptor, status: AccessStatus, state: PermissionState) {
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| self.matcher.matches(existing, &descriptor))
        {
            Some((_, states)) => {
                states.insert(status, state);
            }
            None => {
                let mut states = HashMap::new();
                states.insert(status, state);
                self.entries.push((descriptor, states));
            }
        }
    }

    /// Builder form of [`PermissionMask::insert`]
    pub fn with(
        mut self,
        descriptor: Descriptor,
        status: AccessStatus,
        state: PermissionState,
    ) -> Self {
        self.insert(descriptor, status, state);
        self
    }

    /// Get the external state for `status` of `descriptor`
    pub fn apply(&self, descriptor: &Descriptor, status: AccessStatus) -> PermissionState {
        self.entries
            .iter()
            .find(|(existing, _)| self.matcher.matches(existing, descriptor))
            .and_then(|(_, states)| states.get(&status).copied())
            .unwrap_or_else(|| status.default_state())
    }

    /// Check whether the mask has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PermissionMask {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PermissionMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionMask")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mask_uses_default_mapping() {
        let mask = PermissionMask::new();
        let descriptor = Descriptor::new("geolocation");
        for status in AccessStatus::ALL {
            assert_eq!(mask.apply(&descriptor, status), status.default_state());
        }
    }

    #[test]
    fn test_partial_mask_falls_through() {
        let mask = PermissionMask::new().with(
            Descriptor::new("notifications"),
            AccessStatus::Denied,
            PermissionState::Denied,
        );
        let descriptor = Descriptor::new("notifications");

        assert_eq!(mask.apply(&descriptor, AccessStatus::Denied), PermissionState::Denied);
        assert_eq!(mask.apply(&descriptor, AccessStatus::Allowed), PermissionState::Prompt);
        assert_eq!(mask.apply(&descriptor, AccessStatus::Granted), PermissionState::Granted);
    }

    #[test]
    fn test_mask_lookup_uses_matcher() {
        let mask = PermissionMask::new().with(
            Descriptor::new("midi").with_flag("sysex", true),
            AccessStatus::Prompt,
            PermissionState::Denied,
        );

        let sysex = Descriptor::new("midi").with_flag("sysex", true);
        let plain = Descriptor::new("midi");
        assert_eq!(mask.apply(&sysex, AccessStatus::Prompt), PermissionState::Denied);
        assert_eq!(mask.apply(&plain, AccessStatus::Prompt), PermissionState::Prompt);
    }

    #[test]
    fn test_insert_merges_matching_entries() {
        let mut mask = PermissionMask::new();
        mask.insert(Descriptor::new("camera"), AccessStatus::Prompt, PermissionState::Denied);
        mask.insert(
            Descriptor::new("camera").with_flag("panTiltZoom", false),
            AccessStatus::Allowed,
            PermissionState::Granted,
        );

        let camera = Descriptor::new("camera");
        assert_eq!(mask.apply(&camera, AccessStatus::Prompt), PermissionState::Denied);
        assert_eq!(mask.apply(&camera, AccessStatus::Allowed), PermissionState::Granted);
    }
}
