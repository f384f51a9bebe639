use std::fmt;

use time::OffsetDateTime;

use crate::error::IdpError;

/// Observable state of an [`IdpSession`](super::IdpSession).
///
/// ```text
/// Idle -> ChallengeRequested -> ProofPending -> Exchanging -> TokenObtained
///                                                                  |
///                                      TokenObtained | Failed <- Refreshing
/// ```
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    /// No attempt in progress and no token known.
    #[default]
    Idle,
    /// A challenge was requested from the IDP.
    ChallengeRequested,
    /// The challenge is with a credential source.
    ProofPending,
    /// The proof was accepted and the code is being exchanged.
    Exchanging,
    /// A live token exists.
    TokenObtained {
        /// Expiry of the access token.
        expires_at: OffsetDateTime,
    },
    /// A silent refresh is in flight.
    Refreshing,
    /// The last attempt failed.
    Failed(IdpError),
}

impl SessionState {
    /// Whether an attempt or refresh is currently running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::ChallengeRequested | Self::ProofPending | Self::Exchanging | Self::Refreshing
        )
    }

    /// The failure, for `Failed`.
    #[must_use]
    pub fn error(&self) -> Option<&IdpError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ChallengeRequested => write!(f, "challenge_requested"),
            Self::ProofPending => write!(f, "proof_pending"),
            Self::Exchanging => write!(f, "exchanging"),
            Self::TokenObtained { .. } => write!(f, "token_obtained"),
            Self::Refreshing => write!(f, "refreshing"),
            Self::Failed(_) => write!(f, "failed"),
        }
    }
}
