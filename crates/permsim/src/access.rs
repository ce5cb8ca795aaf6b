//! Access status and externally visible permission state

use serde::{Deserialize, Serialize};

/// Fine-grained status held by the permission store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessStatus {
    /// No decision yet, the user will be asked
    Prompt,
    /// Access granted and remembered
    Granted,
    /// Access blocked and remembered
    Blocked,
    /// Access blocked after too many dismissed dialogs
    BlockedAutomatically,
    /// Access allowed once, not remembered
    Allowed,
    /// Access denied once, not remembered
    Denied,
}

impl AccessStatus {
    /// All statuses, in declaration order
    pub const ALL: [AccessStatus; 6] = [
        AccessStatus::Prompt,
        AccessStatus::Granted,
        AccessStatus::Blocked,
        AccessStatus::BlockedAutomatically,
        AccessStatus::Allowed,
        AccessStatus::Denied,
    ];

    /// External state under the default mask
    pub fn default_state(self) -> PermissionState {
        match self {
            AccessStatus::Prompt | AccessStatus::Allowed | AccessStatus::Denied => {
                PermissionState::Prompt
            }
            AccessStatus::Granted => PermissionState::Granted,
            AccessStatus::Blocked | AccessStatus::BlockedAutomatically => PermissionState::Denied,
        }
    }
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessStatus::Prompt => write!(f, "PROMPT"),
            AccessStatus::Granted => write!(f, "GRANTED"),
            AccessStatus::Blocked => write!(f, "BLOCKED"),
            AccessStatus::BlockedAutomatically => write!(f, "BLOCKED_AUTOMATICALLY"),
            AccessStatus::Allowed => write!(f, "ALLOWED"),
            AccessStatus::Denied => write!(f, "DENIED"),
        }
    }
}

/// Coarse state visible to status observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Prompt,
    Granted,
    Denied,
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionState::Prompt => write!(f, "prompt"),
            PermissionState::Granted => write!(f, "granted"),
            PermissionState::Denied => write!(f, "denied"),
        }
    }
}
