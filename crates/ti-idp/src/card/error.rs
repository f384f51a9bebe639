//! Smartcard errors.

use super::apdu::StatusWord;
use crate::biometric::BiometricError;
use crate::codec::CodecError;
use crate::trust::TrustError;

/// Errors of the secure channel, the PIN check, signing and card
/// administration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CardError {
    /// The card rejected the channel establishment: the CAN is wrong.
    #[error("Wrong CAN")]
    WrongCan,

    /// The PIN is wrong; `retries_left` attempts remain.
    #[error("Wrong PIN, {retries_left} attempts left")]
    WrongPin {
        /// Remaining attempts.
        retries_left: u8,
    },

    /// The PIN retry counter is exhausted. Unblocking needs the PUK.
    #[error("PIN blocked")]
    PinBlocked,

    /// Access rule evaluation failed.
    #[error("Security status not satisfied")]
    SecurityStatusNotSatisfied,

    /// The card reported a write failure.
    #[error("Card memory failure")]
    MemoryFailure,

    /// The PIN is still transport protected.
    #[error("PIN not usable")]
    PasswordNotUsable,

    /// The referenced password does not exist on the card.
    #[error("Password not found")]
    PasswordNotFound,

    /// The card or the radio link failed. Present the card again.
    #[error("Card connection error: {0}")]
    Connection(String),

    /// The card interaction did not finish in time.
    #[error("Card operation timed out")]
    Timeout,

    /// The user cancelled the card interaction.
    #[error("Card operation cancelled")]
    Cancelled,

    /// Another card session is active.
    #[error("Another card session is in progress")]
    SessionInProgress,

    /// The card does not support the protocol.
    #[error("Unsupported card: {0}")]
    UnsupportedCard(String),

    /// The card answered outside the protocol.
    #[error("Card protocol error: {0}")]
    Protocol(String),

    /// The card answered with an unexpected status word.
    #[error("Unexpected card status {0}")]
    UnexpectedStatus(StatusWord),

    /// A CAN, PIN or PUK has the wrong format.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The authentication certificate could not be read or is unusable.
    #[error("Card certificate error: {0}")]
    Certificate(#[from] TrustError),

    /// Envelope assembly failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The device key could not be paired.
    #[error("Pairing error: {0}")]
    Pairing(#[from] BiometricError),
}

impl From<openssl::error::ErrorStack> for CardError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl CardError {
    /// Creates a new `Protocol` error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether presenting the card again may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }

    /// Whether a secret was rejected (CAN or PIN).
    #[must_use]
    pub fn is_wrong_secret(&self) -> bool {
        matches!(self, Self::WrongCan | Self::WrongPin { .. })
    }

    /// Whether the PIN is blocked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::PinBlocked)
    }

    /// Maps the status of a VERIFY command.
    pub(crate) fn from_verify_status(sw: StatusWord) -> Result<(), Self> {
        match sw {
            StatusWord::SUCCESS => Ok(()),
            sw if sw.retries_left() == Some(0) => Err(Self::PinBlocked),
            sw if sw.retries_left().is_some() => Err(Self::WrongPin {
                retries_left: sw.retries_left().unwrap_or_default(),
            }),
            StatusWord::BLOCKED => Err(Self::PinBlocked),
            StatusWord::SECURITY_STATUS_NOT_SATISFIED => Err(Self::SecurityStatusNotSatisfied),
            StatusWord::MEMORY_FAILURE => Err(Self::MemoryFailure),
            StatusWord::CONDITIONS_NOT_SATISFIED => Err(Self::PasswordNotUsable),
            StatusWord::REFERENCED_DATA_NOT_FOUND => Err(Self::PasswordNotFound),
            other => Err(Self::UnexpectedStatus(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_status_mapping() {
        assert_eq!(CardError::from_verify_status(StatusWord::SUCCESS), Ok(()));
        assert_eq!(
            CardError::from_verify_status(StatusWord(0x63C2)),
            Err(CardError::WrongPin { retries_left: 2 })
        );
        assert_eq!(
            CardError::from_verify_status(StatusWord(0x63C0)),
            Err(CardError::PinBlocked)
        );
        assert_eq!(
            CardError::from_verify_status(StatusWord::BLOCKED),
            Err(CardError::PinBlocked)
        );
        assert_eq!(
            CardError::from_verify_status(StatusWord::CONDITIONS_NOT_SATISFIED),
            Err(CardError::PasswordNotUsable)
        );
        assert_eq!(
            CardError::from_verify_status(StatusWord(0x6F00)),
            Err(CardError::UnexpectedStatus(StatusWord(0x6F00)))
        );
    }

    #[test]
    fn test_classification() {
        assert!(CardError::Timeout.is_transient());
        assert!(!CardError::WrongCan.is_transient());
        assert!(CardError::WrongPin { retries_left: 1 }.is_wrong_secret());
        assert!(CardError::PinBlocked.is_blocked());
    }
}
