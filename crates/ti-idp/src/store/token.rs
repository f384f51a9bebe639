use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::crypto::fingerprint;

/// Long-lived token that renews the access token without a new proof.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoToken {
    /// Opaque token value (an encrypted JWT).
    pub value: String,
    /// End of the silent refresh window.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SsoToken {
    /// Whether the token still allows a silent refresh at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

impl std::fmt::Debug for SsoToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsoToken")
            .field("value", &fingerprint(&self.value))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The live session of one profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    /// Decrypted access token (a signed JWT).
    pub access_token: String,
    /// Decrypted id token.
    pub id_token: String,
    /// SSO token, if the IDP issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_token: Option<SsoToken>,
    /// Expiry of the access token.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Token type, `Bearer`.
    pub token_type: String,
    /// Insurance identifier bound to the token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insurance_id: Option<String>,
}

impl SessionToken {
    /// Whether the access token is still usable at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }

    /// Whether the access token expires within `leeway` of `now`.
    #[must_use]
    pub fn needs_refresh(&self, now: OffsetDateTime, leeway: std::time::Duration) -> bool {
        now + leeway >= self.expires_at
    }

    /// Whether a silent refresh is possible at `now`.
    #[must_use]
    pub fn can_refresh_silently(&self, now: OffsetDateTime) -> bool {
        self.sso_token.as_ref().is_some_and(|sso| sso.is_valid_at(now))
    }

    /// Short fingerprint of the access token for log lines.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.access_token)
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("access_token", &self.fingerprint())
            .field("sso_token", &self.sso_token)
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;

    fn token() -> SessionToken {
        SessionToken {
            access_token: "access.secret.value".to_string(),
            id_token: "id".to_string(),
            sso_token: Some(SsoToken {
                value: "sso.secret".to_string(),
                expires_at: datetime!(2024-05-01 22:00 UTC),
            }),
            expires_at: datetime!(2024-05-01 10:05 UTC),
            token_type: "Bearer".to_string(),
            insurance_id: None,
        }
    }

    #[test]
    fn test_expiry_rules() {
        let token = token();
        let now = datetime!(2024-05-01 10:00 UTC);
        assert!(token.is_valid_at(now));
        assert!(!token.needs_refresh(now, Duration::from_secs(60)));
        assert!(token.needs_refresh(now, Duration::from_secs(300)));
        assert!(!token.is_valid_at(datetime!(2024-05-01 10:05 UTC)));
        assert!(token.can_refresh_silently(datetime!(2024-05-01 21:59 UTC)));
        assert!(!token.can_refresh_silently(datetime!(2024-05-01 22:00 UTC)));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", token());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("Bearer"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let token = token();
        let json = serde_json::to_string(&token).unwrap();
        assert!(json.contains("2024-05-01T10:05:00Z"));
        let back: SessionToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }
}
