//! Identity token checks performed after every exchange.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::decode_verified;
use crate::discovery::DiscoveryDocument;
use crate::error::IdpError;
use crate::profile::ProfileContext;

/// Claims of the IDP identity token that the client relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer.
    #[serde(default)]
    pub iss: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issued at (Unix seconds).
    #[serde(default)]
    pub iat: i64,
    /// Nonce of the authorization request.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Health-insurance identifier of the user.
    #[serde(rename = "idNummer", default)]
    pub id_nummer: Option<String>,
    /// Given name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    /// Family name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// Authentication methods.
    #[serde(default)]
    pub amr: Vec<String>,
}

/// Verifies the id token signature against the IDP signing certificate and
/// checks that it answers the request carrying `nonce`.
///
/// # Errors
///
/// Returns `Codec` for a bad signature or an expired token and
/// `InvalidNonce` if the nonce differs.
pub fn verify_id_token(
    id_token: &str,
    document: &DiscoveryDocument,
    nonce: &str,
    now: OffsetDateTime,
) -> Result<IdTokenClaims, IdpError> {
    let key = document.signing_key()?;
    let claims = decode_verified::<IdTokenClaims>(id_token, &key, now)?.claims;
    if claims.nonce.as_deref() != Some(nonce) {
        tracing::warn!("Id token nonce does not match the authorization request");
        return Err(IdpError::InvalidNonce);
    }
    Ok(claims)
}

/// Checks that the token belongs to the profile it is stored for.
///
/// A profile without an insurance identifier accepts any token; a token
/// without one is accepted by any profile.
///
/// # Errors
///
/// Returns `ProfileMismatch` if both carry identifiers and they differ.
pub fn check_profile_binding(
    claims: &IdTokenClaims,
    profile: &ProfileContext,
) -> Result<(), IdpError> {
    match (&profile.insurance_id, &claims.id_nummer) {
        (Some(expected), Some(actual)) if expected != actual => {
            tracing::warn!(profile = %profile.id, "Token issued for a different insurant");
            Err(IdpError::ProfileMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::clock::FixedClock;
    use crate::codec::{Curve, EcSecretKey, JwsHeader};
    use crate::config::TrustConfig;
    use crate::testing::fake_idp::{discovery_bundle, sign_jwt};
    use crate::testing::pki::{Issued, PkiOcspResponder, TestPki};
    use crate::trust::TrustValidator;

    async fn document(now: OffsetDateTime) -> (DiscoveryDocument, Issued) {
        let pki = Arc::new(TestPki::new());
        let clock = Arc::new(FixedClock::new(now));
        let disc = pki.issue_leaf("IDP Discovery");
        let sig = pki.issue_leaf("IDP Sig");
        let enc = EcSecretKey::generate(Curve::BrainpoolP256r1)
            .and_then(|key| key.public_key())
            .unwrap();
        let bundle = discovery_bundle("https://idp.test", &disc, &sig, &enc, now);
        let validator =
            TrustValidator::new(Arc::new(pki.anchors()), TrustConfig::default(), clock.clone())
                .with_ocsp_responder(Arc::new(PkiOcspResponder::new(pki.clone(), clock)));
        let document = DiscoveryDocument::verify(bundle, &validator, now)
            .await
            .unwrap();
        (document, sig)
    }

    fn id_token(signing: &Issued, nonce: Option<&str>, now: OffsetDateTime) -> String {
        let mut claims = json!({
            "iss": "https://idp.test",
            "iat": now.unix_timestamp(),
            "exp": now.unix_timestamp() + 300,
            "idNummer": "X110443874",
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = nonce.into();
        }
        sign_jwt(&signing.signing_key(), &JwsHeader::bp256r1(), &claims)
    }

    #[tokio::test]
    async fn test_matching_nonce_is_accepted() {
        let now = OffsetDateTime::now_utc();
        let (document, sig) = document(now).await;
        let token = id_token(&sig, Some("request-nonce"), now);
        let claims = verify_id_token(&token, &document, "request-nonce", now).unwrap();
        assert_eq!(claims.id_nummer.as_deref(), Some("X110443874"));
    }

    #[tokio::test]
    async fn test_mismatched_nonce_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let (document, sig) = document(now).await;
        let token = id_token(&sig, Some("other-nonce"), now);
        assert!(matches!(
            verify_id_token(&token, &document, "request-nonce", now),
            Err(IdpError::InvalidNonce)
        ));
    }

    #[tokio::test]
    async fn test_missing_nonce_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let (document, sig) = document(now).await;
        let token = id_token(&sig, None, now);
        assert!(matches!(
            verify_id_token(&token, &document, "request-nonce", now),
            Err(IdpError::InvalidNonce)
        ));
    }

    #[tokio::test]
    async fn test_token_from_other_key_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let (document, _) = document(now).await;
        let rogue = TestPki::new().issue_leaf("Rogue Sig");
        let token = id_token(&rogue, Some("request-nonce"), now);
        assert!(matches!(
            verify_id_token(&token, &document, "request-nonce", now),
            Err(IdpError::Codec(_))
        ));
    }

    fn claims(id_nummer: Option<&str>) -> IdTokenClaims {
        IdTokenClaims {
            iss: "https://idp.test".to_string(),
            exp: 1_700_000_300,
            iat: 1_700_000_000,
            nonce: Some("n".to_string()),
            id_nummer: id_nummer.map(str::to_string),
            given_name: None,
            family_name: None,
            amr: vec![],
        }
    }

    #[test]
    fn test_profile_binding() {
        let bound = ProfileContext::new("p1").with_insurance_id("X1");
        assert!(check_profile_binding(&claims(Some("X1")), &bound).is_ok());
        assert!(check_profile_binding(&claims(None), &bound).is_ok());
        assert!(check_profile_binding(&claims(Some("X2")), &ProfileContext::new("p1")).is_ok());

        let err = check_profile_binding(&claims(Some("X2")), &bound).unwrap_err();
        assert!(matches!(
            err,
            IdpError::ProfileMismatch { ref expected, ref actual } if expected == "X1" && actual == "X2"
        ));
    }

    #[test]
    fn test_claims_wire_names() {
        let json = r#"{"exp":1,"nonce":"n","idNummer":"X110443874","amr":["mfa"]}"#;
        let claims: IdTokenClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.id_nummer.as_deref(), Some("X110443874"));
        assert_eq!(claims.amr, vec!["mfa".to_string()]);
    }
}
