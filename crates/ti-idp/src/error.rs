//! Session-level error type.
//!
//! [`IdpError`] wraps the error of every component through `#[from]`, so
//! callers keep the full cause chain. [`IdpError::category`] condenses it
//! into the recovery class a user interface acts on.

use std::fmt;

use crate::biometric::BiometricError;
use crate::card::CardError;
use crate::client::{ClientError, ServerResponse};
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::ext_auth::ExtAuthError;
use crate::store::StoreError;
use crate::trust::TrustError;

/// Why a silent refresh is impossible and a full login is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReauthReason {
    /// No token is stored for the profile.
    NotAuthenticated,
    /// The stored token carries no SSO token.
    MissingSsoToken,
    /// The SSO token has expired.
    SsoTokenExpired,
    /// The IDP rejected the SSO token.
    SsoRejected(ServerResponse),
}

impl fmt::Display for ReauthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "not authenticated"),
            Self::MissingSsoToken => write!(f, "no SSO token"),
            Self::SsoTokenExpired => write!(f, "SSO token expired"),
            Self::SsoRejected(response) => write!(f, "SSO token rejected ({response})"),
        }
    }
}

/// Errors of the session engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdpError {
    /// Talking to the IDP failed.
    #[error("IDP client error: {0}")]
    Client(#[from] ClientError),

    /// A token could not be decoded, verified or built.
    #[error("Token error: {0}")]
    Codec(#[from] CodecError),

    /// A certificate did not pass trust validation.
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    /// The smartcard operation failed.
    #[error("Card error: {0}")]
    Card(#[from] CardError),

    /// The biometric key operation failed.
    #[error("Biometric error: {0}")]
    Biometric(#[from] BiometricError),

    /// An insurer callback could not be correlated.
    #[error("External authentication error: {0}")]
    ExtAuth(#[from] ExtAuthError),

    /// The token store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The discovery document is malformed, expired or not trusted.
    #[error("Invalid discovery document: {0}")]
    InvalidDiscoveryDocument(String),

    /// The challenge expired before it could be answered.
    #[error("Challenge expired")]
    ChallengeExpired,

    /// The state returned by the IDP does not match the request.
    #[error("Invalid state parameter")]
    InvalidStateParameter,

    /// The id token does not carry the nonce of the request.
    #[error("Invalid nonce")]
    InvalidNonce,

    /// The authenticated identity belongs to another profile.
    #[error("Profile mismatch: expected {expected}, got {actual}")]
    ProfileMismatch {
        /// Insurance id bound to the profile.
        expected: String,
        /// Insurance id of the authenticated identity.
        actual: String,
    },

    /// A full login is required.
    #[error("Reauthentication required: {0}")]
    ReauthenticationRequired(ReauthReason),

    /// The user cancelled the operation.
    #[error("Cancelled")]
    Cancelled,

    /// The operation is not available with the current configuration.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// An invariant of the engine was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IdpError {
    /// Creates a new `InvalidDiscoveryDocument` error.
    #[must_use]
    pub fn invalid_discovery_document(message: impl Into<String>) -> Self {
        Self::InvalidDiscoveryDocument(message.into())
    }

    /// Creates a new `Unsupported` error.
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the recovery class of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Client(err) => client_category(err),
            Self::Codec(err) => codec_category(err),
            Self::Trust(_) | Self::InvalidDiscoveryDocument(_) => ErrorCategory::Untrusted,
            Self::Card(err) => card_category(err),
            Self::Biometric(err) => biometric_category(err),
            Self::ExtAuth(_) | Self::InvalidStateParameter | Self::InvalidNonce => {
                ErrorCategory::Protocol
            }
            Self::Store(_) | Self::Config(_) | Self::Internal(_) => ErrorCategory::Internal,
            Self::ChallengeExpired | Self::ReauthenticationRequired(_) => {
                ErrorCategory::Reauthentication
            }
            Self::ProfileMismatch { .. } => ErrorCategory::ProfileMismatch,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Unsupported(_) => ErrorCategory::Protocol,
        }
    }

    /// Returns `true` if repeating the same operation may succeed: network
    /// failures and transient card connection problems.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client(err) => err.is_network_error(),
            Self::Card(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if the user cancelled.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }

    /// Remaining PIN attempts after a wrong PIN.
    #[must_use]
    pub fn remaining_pin_attempts(&self) -> Option<u8> {
        match self {
            Self::Card(CardError::WrongPin { retries_left }) => Some(*retries_left),
            _ => None,
        }
    }

    /// Returns `true` if a full login is needed to continue.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        self.category() == ErrorCategory::Reauthentication
    }
}

fn client_category(err: &ClientError) -> ErrorCategory {
    match err {
        ClientError::Network(_) => ErrorCategory::Network,
        ClientError::Server(_) | ClientError::Decoding(_) | ClientError::EndpointUnavailable(_) => {
            ErrorCategory::Protocol
        }
    }
}

fn codec_category(err: &CodecError) -> ErrorCategory {
    match err {
        CodecError::InvalidSignature(_) => ErrorCategory::Untrusted,
        _ => ErrorCategory::Protocol,
    }
}

fn card_category(err: &CardError) -> ErrorCategory {
    match err {
        CardError::WrongCan | CardError::WrongPin { .. } | CardError::InvalidInput(_) => {
            ErrorCategory::Credential
        }
        CardError::PinBlocked | CardError::PasswordNotUsable => ErrorCategory::Blocked,
        CardError::Connection(_) | CardError::Timeout => ErrorCategory::Network,
        CardError::Cancelled => ErrorCategory::Cancelled,
        CardError::Certificate(_) => ErrorCategory::Untrusted,
        CardError::Pairing(err) => biometric_category(err),
        CardError::SecurityStatusNotSatisfied
        | CardError::MemoryFailure
        | CardError::PasswordNotFound
        | CardError::SessionInProgress
        | CardError::UnsupportedCard(_)
        | CardError::Protocol(_)
        | CardError::UnexpectedStatus(_)
        | CardError::Codec(_) => ErrorCategory::Protocol,
    }
}

fn biometric_category(err: &BiometricError) -> ErrorCategory {
    match err {
        BiometricError::UserCancelled => ErrorCategory::Cancelled,
        BiometricError::KeyNotFound | BiometricError::BiometryUnavailable(_) => {
            ErrorCategory::Reauthentication
        }
        BiometricError::SigningRefused(_) => ErrorCategory::Credential,
        BiometricError::Codec(_) | BiometricError::CertificatePackaging(_) => {
            ErrorCategory::Protocol
        }
        BiometricError::KeyCreation(_) | BiometricError::Storage(_) => ErrorCategory::Internal,
    }
}

/// User-facing recovery classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Offer a retry.
    Network,
    /// A wrong CAN, PIN or biometric match; ask again.
    Credential,
    /// PIN blocked; route to the unblock flow.
    Blocked,
    /// A certificate or signature is not trusted; hard stop.
    Untrusted,
    /// The identity belongs to another profile; offer a profile switch.
    ProfileMismatch,
    /// The user cancelled; show nothing.
    Cancelled,
    /// Start a full login.
    Reauthentication,
    /// Unexpected answer from the IDP or the card.
    Protocol,
    /// Local failure.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Credential => write!(f, "credential"),
            Self::Blocked => write!(f, "blocked"),
            Self::Untrusted => write!(f, "untrusted"),
            Self::ProfileMismatch => write!(f, "profile_mismatch"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Reauthentication => write!(f, "reauthentication"),
            Self::Protocol => write!(f, "protocol"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_keeps_cause() {
        let err = IdpError::from(CardError::WrongPin { retries_left: 2 });
        assert_eq!(err.to_string(), "Card error: Wrong PIN, 2 attempts left");

        let err = IdpError::ProfileMismatch {
            expected: "X110".to_string(),
            actual: "X220".to_string(),
        };
        assert_eq!(err.to_string(), "Profile mismatch: expected X110, got X220");
    }

    #[test]
    fn test_categories() {
        let cases = [
            (IdpError::from(ClientError::network("reset")), ErrorCategory::Network),
            (IdpError::from(CardError::WrongPin { retries_left: 1 }), ErrorCategory::Credential),
            (IdpError::from(CardError::PinBlocked), ErrorCategory::Blocked),
            (IdpError::from(TrustError::untrusted("unknown root")), ErrorCategory::Untrusted),
            (IdpError::from(CardError::Cancelled), ErrorCategory::Cancelled),
            (IdpError::from(BiometricError::UserCancelled), ErrorCategory::Cancelled),
            (
                IdpError::from(CardError::Pairing(BiometricError::UserCancelled)),
                ErrorCategory::Cancelled,
            ),
            (
                IdpError::ReauthenticationRequired(ReauthReason::SsoTokenExpired),
                ErrorCategory::Reauthentication,
            ),
            (
                IdpError::ProfileMismatch {
                    expected: "a".to_string(),
                    actual: "b".to_string(),
                },
                ErrorCategory::ProfileMismatch,
            ),
            (IdpError::from(ExtAuthError::InvalidNonce), ErrorCategory::Protocol),
        ];
        for (err, category) in cases {
            assert_eq!(err.category(), category, "{err}");
        }
    }

    #[test]
    fn test_retryable_only_for_transport() {
        assert!(IdpError::from(ClientError::network("timeout")).is_retryable());
        assert!(IdpError::from(CardError::Timeout).is_retryable());
        assert!(!IdpError::from(CardError::PinBlocked).is_retryable());
        assert!(!IdpError::from(TrustError::NoCertificateFound).is_retryable());
        assert!(!IdpError::Cancelled.is_retryable());
    }

    #[test]
    fn test_remaining_pin_attempts() {
        let err = IdpError::from(CardError::WrongPin { retries_left: 2 });
        assert_eq!(err.remaining_pin_attempts(), Some(2));
        assert_eq!(IdpError::Cancelled.remaining_pin_attempts(), None);
        assert_eq!(ErrorCategory::ProfileMismatch.to_string(), "profile_mismatch");
    }
}
