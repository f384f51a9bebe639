//! Challenge bundles handed between the session engine and the credential
//! sources.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::crypto::{b64url, random_token, sha256};
use crate::ext_auth::InsurerEntry;
use crate::trust::Certificate;

/// PKCE method used for every authorization request.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Claims of an IDP-issued challenge token. Only `exp` is required; the
/// remaining members echo the authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeClaims {
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issued at (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Token type, `challenge`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Correlation state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Nonce to be echoed in the id token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// PKCE code challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// Requested scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Redirect URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// Consent information shown to the user before signing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserConsent {
    /// Requested scopes with their descriptions.
    #[serde(default)]
    pub requested_scopes: std::collections::BTreeMap<String, String>,
    /// Requested claims with their descriptions.
    #[serde(default)]
    pub requested_claims: std::collections::BTreeMap<String, String>,
}

/// A verified challenge token as issued by the IDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpChallenge {
    /// The signed challenge token, verbatim.
    pub challenge: String,
    /// Its verified claims.
    pub claims: ChallengeClaims,
    /// Consent information, if the IDP sent any.
    pub user_consent: Option<UserConsent>,
}

impl IdpChallenge {
    /// Expiry of the challenge.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.claims.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Whether the challenge can no longer be submitted at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }
}

/// What a [`ChallengeSession`] is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    /// A challenge token to be signed by a card or a device key.
    Signed(IdpChallenge),
    /// A callback from an insurer's app.
    External {
        /// Insurer the user was handed off to.
        insurer: InsurerEntry,
    },
}

/// Client-side secrets of one authorization attempt plus what it awaits.
///
/// Lives from "challenge requested" until the proof is exchanged or the
/// challenge expires.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeSession {
    verifier: Zeroizing<String>,
    /// Correlation state sent with the authorization request.
    pub state: String,
    /// Nonce expected in the id token.
    pub nonce: String,
    /// Pending proof.
    pub kind: ChallengeKind,
}

impl ChallengeSession {
    /// Fresh verifier, state and nonce for a signed challenge. The
    /// challenge itself is attached through [`new`](Self::new).
    #[must_use]
    pub fn generate_secrets() -> (Zeroizing<String>, String, String) {
        (Zeroizing::new(random_token()), random_token(), random_token())
    }

    /// Creates a session from its parts.
    #[must_use]
    pub fn new(verifier: Zeroizing<String>, state: String, nonce: String, kind: ChallengeKind) -> Self {
        Self {
            verifier,
            state,
            nonce,
            kind,
        }
    }

    /// Creates a session for a delegated external authentication.
    #[must_use]
    pub fn external(insurer: InsurerEntry) -> Self {
        let (verifier, state, nonce) = Self::generate_secrets();
        Self::new(verifier, state, nonce, ChallengeKind::External { insurer })
    }

    /// PKCE code verifier.
    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// S256 code challenge derived from the verifier.
    #[must_use]
    pub fn code_challenge(&self) -> String {
        code_challenge(&self.verifier)
    }

    /// The signed challenge, if this session awaits one.
    #[must_use]
    pub fn idp_challenge(&self) -> Option<&IdpChallenge> {
        match &self.kind {
            ChallengeKind::Signed(challenge) => Some(challenge),
            ChallengeKind::External { .. } => None,
        }
    }
}

impl std::fmt::Debug for ChallengeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSession")
            .field("verifier", &"<redacted>")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// S256 code challenge for a verifier.
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    b64url(&sha256(verifier.as_bytes()))
}

/// A challenge signed by a smartcard, ready for submission.
///
/// Consumed exactly once by the verify step.
#[derive(Debug, Clone)]
pub struct SignedChallenge {
    /// The challenge that was signed.
    pub original: IdpChallenge,
    /// Compact JWS over the nested challenge, carrying the card certificate
    /// in `x5c`.
    pub signed: String,
    /// The card's authentication certificate.
    pub certificate: Certificate,
}
