//! Simulated access dialog
//!
//! An [`AccessDialog`] stands in for a consent prompt. It is single use:
//! exactly one of [`allow`](AccessDialog::allow), [`deny`](AccessDialog::deny)
//! or [`dismiss`](AccessDialog::dismiss) may be called, optionally preceded by
//! any number of [`remember`](AccessDialog::remember) calls.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

/// Decision taken in a dialog that was not dismissed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogResult {
    /// Whether access was allowed
    pub allow: bool,
    /// Whether the decision should be remembered
    pub remember: bool,
}

/// Terminal state of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogOutcome {
    /// The user answered
    Decided(DialogResult),
    /// The user closed the dialog without answering
    Dismissed,
}

impl DialogOutcome {
    /// The decision, `None` when dismissed
    pub fn result(self) -> Option<DialogResult> {
        match self {
            DialogOutcome::Decided(result) => Some(result),
            DialogOutcome::Dismissed => None,
        }
    }

    /// Check whether access was allowed
    pub fn is_allowed(self) -> bool {
        matches!(self, DialogOutcome::Decided(DialogResult { allow: true, .. }))
    }
}

#[derive(Debug, Default)]
struct DialogState {
    remember: bool,
    outcome: Option<DialogOutcome>,
}

/// One-shot consent interaction handed to an access handler
///
/// Clones share the same dialog.
#[derive(Debug, Clone)]
pub struct AccessDialog {
    descriptor: Descriptor,
    state: Arc<Mutex<DialogState>>,
}

impl AccessDialog {
    pub(crate) fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            state: Arc::new(Mutex::new(DialogState::default())),
        }
    }

    /// Descriptor this dialog asks about
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Set whether the following allow/deny should be remembered
    pub fn remember(&self, remember: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "remember")?;
        state.remember = remember;
        Ok(())
    }

    /// Allow access
    pub fn allow(&self) -> Result<()> {
        self.decide(true)
    }

    /// Deny access
    pub fn deny(&self) -> Result<()> {
        self.decide(false)
    }

    /// Close the dialog without answering
    pub fn dismiss(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "dismiss")?;
        state.outcome = Some(DialogOutcome::Dismissed);
        Ok(())
    }

    /// Check whether no terminal action has been taken
    pub fn is_open(&self) -> bool {
        self.state.lock().outcome.is_none()
    }

    /// Terminal outcome, `None` while open
    pub fn outcome(&self) -> Option<DialogOutcome> {
        self.state.lock().outcome
    }

    fn decide(&self, allow: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, if allow { "allow" } else { "deny" })?;
        let remember = state.remember;
        state.outcome = Some(DialogOutcome::Decided(DialogResult { allow, remember }));
        Ok(())
    }

    fn ensure_open(state: &DialogState, action: &str) -> Result<()> {
        match state.outcome {
            None => Ok(()),
            Some(_) => Err(Error::IllegalState(format!(
                "Cannot {} a dialog that has already been closed",
                action
            ))),
        }
    }
}
