//! Error types for device selection.

use thiserror::Error;

/// Errors raised by the device selector and directive parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// A device id does not fit in the allow-list bitmask.
    ///
    /// The allow-list is a fixed-width bitmask, so only the first
    /// `limit` accelerators can be named explicitly.
    #[error("Device id {id} is outside the supported range 0..{limit}")]
    DeviceIdOutOfRange {
        /// Requested device id
        id: usize,
        /// Exclusive upper bound
        limit: usize,
    },

    /// A device directive could not be parsed.
    #[error("Invalid device directive '{value}': {reason}")]
    InvalidDirective {
        /// Raw directive text
        value: String,
        /// Description of the problem
        reason: String,
    },

    /// The hardware probe reported a failure.
    #[error("Device probe failed: {0}")]
    Probe(String),
}

impl SelectError {
    /// Create an InvalidDirective error.
    pub fn invalid_directive<S1, S2>(value: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::InvalidDirective {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a Probe error.
    pub fn probe<S: Into<String>>(reason: S) -> Self {
        Self::Probe(reason.into())
    }
}

/// Result type alias for selector operations.
pub type Result<T> = std::result::Result<T, SelectError>;
