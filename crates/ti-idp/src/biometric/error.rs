//! Biometric key custody errors.

use crate::codec::CodecError;
use crate::store::StoreError;

/// Errors of the platform key store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    /// No biometry is enrolled, or enrollment changed.
    #[error("Biometry not enrolled")]
    BiometryNotEnrolled,

    /// No key exists under the tag.
    #[error("Key not found")]
    KeyNotFound,

    /// The user dismissed the prompt.
    #[error("User cancelled")]
    UserCancelled,

    /// The biometric match failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Too many failed attempts.
    #[error("Biometry locked out")]
    Lockout,

    /// The key was invalidated by an enrollment change.
    #[error("Key invalidated")]
    KeyInvalidated,

    /// Any other platform failure.
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Errors of the biometric key custodian.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BiometricError {
    /// The device was never paired, or the pairing was revoked.
    #[error("Key not found: device is not paired")]
    KeyNotFound,

    /// Biometric enrollment is absent or was revoked.
    #[error("Biometry unavailable: {0}")]
    BiometryUnavailable(String),

    /// The device key could not be created.
    #[error("Key creation failed: {0}")]
    KeyCreation(String),

    /// The prompt was failed or the biometry is locked out.
    #[error("Signing refused: {0}")]
    SigningRefused(String),

    /// The user dismissed the prompt.
    #[error("User cancelled")]
    UserCancelled,

    /// The authentication certificate could not be packaged.
    #[error("Certificate packaging failed: {0}")]
    CertificatePackaging(String),

    /// The pairing record could not be read or written.
    #[error("Pairing storage error: {0}")]
    Storage(#[from] StoreError),

    /// Envelope assembly failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl BiometricError {
    /// Returns `true` if the user actively declined.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Maps a key store failure during signing.
    pub(crate) fn from_signing(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::UserCancelled => Self::UserCancelled,
            KeyStoreError::KeyNotFound | KeyStoreError::KeyInvalidated => Self::KeyNotFound,
            KeyStoreError::BiometryNotEnrolled => Self::BiometryUnavailable(err.to_string()),
            KeyStoreError::AuthenticationFailed
            | KeyStoreError::Lockout
            | KeyStoreError::Platform(_) => Self::SigningRefused(err.to_string()),
        }
    }

    /// Maps a key store failure during key creation.
    pub(crate) fn from_creation(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::BiometryNotEnrolled | KeyStoreError::KeyInvalidated => {
                Self::BiometryUnavailable(err.to_string())
            }
            KeyStoreError::UserCancelled => Self::UserCancelled,
            other => Self::KeyCreation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_error_mapping() {
        assert_eq!(
            BiometricError::from_signing(KeyStoreError::UserCancelled),
            BiometricError::UserCancelled
        );
        assert_eq!(
            BiometricError::from_signing(KeyStoreError::KeyInvalidated),
            BiometricError::KeyNotFound
        );
        assert!(matches!(
            BiometricError::from_signing(KeyStoreError::Lockout),
            BiometricError::SigningRefused(_)
        ));
        assert!(matches!(
            BiometricError::from_creation(KeyStoreError::BiometryNotEnrolled),
            BiometricError::BiometryUnavailable(_)
        ));
    }
}
