//! Delegated authentication errors.

/// Errors correlating an insurer callback with its pending request.
///
/// Both variants are security relevant and terminal for the attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtAuthError {
    /// No pending request exists for the presented state, or it expired.
    #[error("Invalid nonce: no pending request for the presented state")]
    InvalidNonce,

    /// A request was registered under a state that does not match its own.
    #[error("Invalid state parameter")]
    InvalidStateParameter,

    /// The insurer directory could not be read.
    #[error("Invalid insurer directory: {0}")]
    InvalidDirectory(String),
}

impl ExtAuthError {
    /// Returns `true` for correlation failures.
    #[must_use]
    pub fn is_correlation_error(&self) -> bool {
        matches!(self, Self::InvalidNonce | Self::InvalidStateParameter)
    }
}
