//! Error types for the permission simulator

use thiserror::Error;

use crate::descriptor::Descriptor;

/// Result type for permission simulator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the permission simulator
#[derive(Error, Debug)]
pub enum Error {
    /// No stored entry matches the descriptor
    #[error("No permission state found for descriptor: {descriptor}")]
    NotFound { descriptor: String },

    /// An object was used after its legal window closed
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A precondition on an argument was violated
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `NotFound` error carrying the JSON rendering of `descriptor`
    pub fn not_found(descriptor: &Descriptor) -> Self {
        Error::NotFound {
            descriptor: descriptor.to_json(),
        }
    }

    /// Check whether this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
