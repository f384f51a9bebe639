//! The IDP discovery document.
//!
//! The document is a JWT signed by the IDP discovery key, which travels in
//! the `x5c` header. It names the endpoints and the locations of the IDP
//! encryption key (`puk_idp_enc`) and signing key (`puk_idp_sig`). A
//! [`DiscoveryDocument`] only exists after the JWT signature and both
//! certificates passed trust validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::client::ClientError;
use crate::codec::{CodecError, Curve, EcPublicKey, Jwk, Jws, decode_verified};
use crate::error::IdpError;
use crate::trust::{Certificate, TrustValidator};

/// Claims of the discovery JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryClaims {
    /// Issuer.
    #[serde(default)]
    pub issuer: String,
    /// Challenge and signed-challenge endpoint.
    pub authorization_endpoint: String,
    /// SSO refresh endpoint.
    pub sso_endpoint: String,
    /// Token exchange endpoint.
    pub token_endpoint: String,
    /// Device pairing endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_pair: Option<String>,
    /// Alternative (paired device) authentication endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_pair_endpoint: Option<String>,
    /// Location of the encryption key.
    pub uri_puk_idp_enc: String,
    /// Location of the signing key.
    pub uri_puk_idp_sig: String,
    /// Location of the insurer app directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kk_app_list_uri: Option<String>,
    /// Federated authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub third_party_authorization_endpoint: Option<String>,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issued at (Unix seconds).
    pub iat: i64,
}

/// Endpoints advertised by the discovery document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Challenge requests and signed challenges.
    Authorization,
    /// SSO refresh.
    Sso,
    /// Token exchange.
    Token,
    /// Device pairing.
    Pairing,
    /// Paired device authentication.
    AuthenticationPaired,
    /// Insurer app directory.
    InsurerDirectory,
    /// Federated authorization.
    ThirdPartyAuthorization,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Self::Authorization => "authorization_endpoint",
            Self::Sso => "sso_endpoint",
            Self::Token => "token_endpoint",
            Self::Pairing => "uri_pair",
            Self::AuthenticationPaired => "auth_pair_endpoint",
            Self::InsurerDirectory => "kk_app_list_uri",
            Self::ThirdPartyAuthorization => "third_party_authorization_endpoint",
        }
    }
}

/// Unverified discovery material as fetched from the IDP.
#[derive(Debug, Clone)]
pub struct DiscoveryBundle {
    /// The discovery JWT.
    pub jwt: String,
    /// The IDP encryption key.
    pub encryption_key: Jwk,
    /// The IDP signing key, carrying its certificate in `x5c`.
    pub signing_key: Jwk,
}

/// A trust-validated discovery document.
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    jwt: String,
    claims: DiscoveryClaims,
    discovery_certificate: Certificate,
    signing_certificate: Certificate,
    encryption_key: EcPublicKey,
    created_at: OffsetDateTime,
}

impl DiscoveryDocument {
    /// Verifies fetched discovery material.
    ///
    /// The JWT must verify under its `x5c` certificate, and that
    /// certificate as well as the signing key certificate must pass
    /// `validator`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDiscoveryDocument` for malformed or expired material
    /// and `Trust` for certificates that do not validate.
    pub async fn verify(
        bundle: DiscoveryBundle,
        validator: &TrustValidator,
        now: OffsetDateTime,
    ) -> Result<Self, IdpError> {
        let signing_chain = bundle
            .signing_key
            .x5c
            .as_deref()
            .map(Certificate::chain_from_x5c)
            .transpose()?
            .unwrap_or_default();
        validator.validate(&signing_chain).await?;
        let signing_certificate = signing_chain
            .into_iter()
            .next()
            .ok_or_else(|| IdpError::invalid_discovery_document("signing key without certificate"))?;
        if signing_certificate.public_key()? != bundle.signing_key.to_public_key()? {
            return Err(IdpError::invalid_discovery_document(
                "signing key does not match its certificate",
            ));
        }
        let encryption_key = idp_encryption_key(&bundle.encryption_key)?;

        let document = Self::verify_jwt(
            bundle.jwt,
            signing_certificate,
            encryption_key,
            now,
            validator,
        )
        .await?;
        tracing::info!(
            issuer = %document.claims.issuer,
            expires_at = document.claims.exp,
            "Discovery document verified"
        );
        Ok(document)
    }

    /// Restores a persisted document, verifying it again offline.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify).
    pub async fn restore(
        stored: StoredDiscovery,
        validator: &TrustValidator,
        now: OffsetDateTime,
    ) -> Result<Self, IdpError> {
        validator.validate(std::slice::from_ref(&stored.signing_certificate)).await?;
        let encryption_key = idp_encryption_key(&stored.encryption_key)?;
        let mut document = Self::verify_jwt(
            stored.jwt,
            stored.signing_certificate,
            encryption_key,
            now,
            validator,
        )
        .await?;
        document.created_at = stored.created_at;
        Ok(document)
    }

    async fn verify_jwt(
        jwt: String,
        signing_certificate: Certificate,
        encryption_key: EcPublicKey,
        now: OffsetDateTime,
        validator: &TrustValidator,
    ) -> Result<Self, IdpError> {
        let header = Jws::parse(&jwt)
            .map_err(|e| IdpError::invalid_discovery_document(e.to_string()))?
            .header;
        let chain = header
            .x5c
            .as_deref()
            .map(Certificate::chain_from_x5c)
            .transpose()?
            .unwrap_or_default();
        let trusted = validator.validate(&chain).await?;
        let key = trusted.leaf.verification_key()?;
        let claims = decode_verified::<DiscoveryClaims>(&jwt, &key, now)
            .map_err(|e| IdpError::invalid_discovery_document(e.to_string()))?
            .claims;
        Ok(Self {
            jwt,
            claims,
            discovery_certificate: trusted.leaf,
            signing_certificate,
            encryption_key,
            created_at: now,
        })
    }

    /// Verified claims.
    #[must_use]
    pub fn claims(&self) -> &DiscoveryClaims {
        &self.claims
    }

    /// Certificate of the discovery signature.
    #[must_use]
    pub fn discovery_certificate(&self) -> &Certificate {
        &self.discovery_certificate
    }

    /// Certificate of the IDP signing key. Challenges and id tokens are
    /// verified against it.
    #[must_use]
    pub fn signing_certificate(&self) -> &Certificate {
        &self.signing_certificate
    }

    /// Verification key for tokens signed by the IDP.
    ///
    /// # Errors
    /// Returns `InvalidKey` if the certificate key is not on a supported
    /// curve.
    pub fn signing_key(&self) -> Result<EcPublicKey, CodecError> {
        self.signing_certificate.verification_key()
    }

    /// Key the key verifier and signed challenges are encrypted for.
    #[must_use]
    pub fn encryption_key(&self) -> &EcPublicKey {
        &self.encryption_key
    }

    /// Local time the document was first verified.
    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Resolves an advertised endpoint.
    ///
    /// # Errors
    /// Returns `EndpointUnavailable` if the document does not advertise it
    /// and `Decoding` if it is not a URL.
    pub fn endpoint(&self, endpoint: Endpoint) -> Result<Url, ClientError> {
        let value = match endpoint {
            Endpoint::Authorization => Some(&self.claims.authorization_endpoint),
            Endpoint::Sso => Some(&self.claims.sso_endpoint),
            Endpoint::Token => Some(&self.claims.token_endpoint),
            Endpoint::Pairing => self.claims.uri_pair.as_ref(),
            Endpoint::AuthenticationPaired => self.claims.auth_pair_endpoint.as_ref(),
            Endpoint::InsurerDirectory => self.claims.kk_app_list_uri.as_ref(),
            Endpoint::ThirdPartyAuthorization => {
                self.claims.third_party_authorization_endpoint.as_ref()
            }
        }
        .ok_or_else(|| ClientError::EndpointUnavailable(endpoint.name().to_string()))?;
        Url::parse(value).map_err(|e| ClientError::decoding(format!("{}: {e}", endpoint.name())))
    }

    /// Whether the document may still be used at `now`: not expired, not
    /// issued in the future and verified no longer than `max_age` ago.
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        let now_ts = now.unix_timestamp();
        now_ts <= self.claims.exp
            && now >= self.created_at
            && now - self.created_at <= max_age
    }

    /// Persistable form.
    #[must_use]
    pub fn to_stored(&self) -> StoredDiscovery {
        StoredDiscovery {
            jwt: self.jwt.clone(),
            encryption_key: Jwk::from_public_key(&self.encryption_key),
            signing_certificate: self.signing_certificate.clone(),
            created_at: self.created_at,
        }
    }
}

/// The IDP only publishes brainpoolP256r1 encryption keys.
fn idp_encryption_key(jwk: &Jwk) -> Result<EcPublicKey, IdpError> {
    let key = jwk.to_public_key()?;
    if key.curve() != Curve::BrainpoolP256r1 {
        return Err(IdpError::invalid_discovery_document(format!(
            "encryption key on {} instead of {}",
            key.curve().jwk_name(),
            Curve::BrainpoolP256r1.jwk_name()
        )));
    }
    Ok(key)
}

/// A discovery document as persisted in the Session Token Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDiscovery {
    /// The discovery JWT.
    pub jwt: String,
    /// IDP encryption key.
    pub encryption_key: Jwk,
    /// IDP signing certificate.
    pub signing_certificate: Certificate,
    /// Local time of the first verification.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::FixedClock;
    use crate::codec::EcSecretKey;
    use crate::config::TrustConfig;
    use crate::testing::fake_idp::discovery_bundle;
    use crate::testing::pki::{PkiOcspResponder, TestPki};

    fn validator(pki: &Arc<TestPki>, clock: &Arc<FixedClock>) -> TrustValidator {
        TrustValidator::new(Arc::new(pki.anchors()), TrustConfig::default(), clock.clone())
            .with_ocsp_responder(Arc::new(PkiOcspResponder::new(pki.clone(), clock.clone())))
    }

    fn encryption_key() -> EcPublicKey {
        EcSecretKey::generate(Curve::BrainpoolP256r1)
            .and_then(|key| key.public_key())
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_and_restore() {
        let pki = Arc::new(TestPki::new());
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let disc = pki.issue_leaf("IDP Discovery");
        let sig = pki.issue_leaf("IDP Sig");
        let enc = encryption_key();
        let bundle = discovery_bundle("https://idp.test", &disc, &sig, &enc, now);

        let document = DiscoveryDocument::verify(bundle, &validator(&pki, &clock), now)
            .await
            .unwrap();
        assert_eq!(
            document.endpoint(Endpoint::Token).unwrap().as_str(),
            "https://idp.test/token"
        );
        assert_eq!(document.signing_certificate(), &sig.certificate);
        assert!(document.is_valid(now, Duration::from_secs(86_400)));
        assert!(!document.is_valid(now + time::Duration::hours(25), Duration::from_secs(86_400)));
        assert!(!document.is_valid(now - time::Duration::minutes(1), Duration::from_secs(86_400)));

        let stored = document.to_stored();
        let json = serde_json::to_string(&stored).unwrap();
        let stored: StoredDiscovery = serde_json::from_str(&json).unwrap();
        let restored = DiscoveryDocument::restore(stored, &validator(&pki, &clock), now)
            .await
            .unwrap();
        assert_eq!(restored.claims(), document.claims());
        assert_eq!(restored.encryption_key(), document.encryption_key());
    }

    #[tokio::test]
    async fn test_untrusted_signer_is_rejected() {
        let pki = Arc::new(TestPki::new());
        let other = TestPki::new();
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let disc = other.issue_leaf("Rogue Discovery");
        let sig = pki.issue_leaf("IDP Sig");
        let enc = encryption_key();
        let bundle = discovery_bundle("https://idp.test", &disc, &sig, &enc, now);

        let err = DiscoveryDocument::verify(bundle, &validator(&pki, &clock), now)
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::Trust(_)), "{err}");
    }

    #[tokio::test]
    async fn test_signing_key_without_certificate() {
        let pki = Arc::new(TestPki::new());
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let disc = pki.issue_leaf("IDP Discovery");
        let sig = pki.issue_leaf("IDP Sig");
        let enc = encryption_key();
        let mut bundle = discovery_bundle("https://idp.test", &disc, &sig, &enc, now);
        bundle.signing_key.x5c = None;

        let err = DiscoveryDocument::verify(bundle, &validator(&pki, &clock), now)
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::Trust(crate::trust::TrustError::NoCertificateFound)));
    }

    #[tokio::test]
    async fn test_encryption_key_must_be_brainpool() {
        let pki = Arc::new(TestPki::new());
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let disc = pki.issue_leaf("IDP Discovery");
        let sig = pki.issue_leaf("IDP Sig");
        let nist = EcSecretKey::generate(Curve::P256)
            .and_then(|key| key.public_key())
            .unwrap();
        let bundle = discovery_bundle("https://idp.test", &disc, &sig, &nist, now);

        let err = DiscoveryDocument::verify(bundle, &validator(&pki, &clock), now)
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::InvalidDiscoveryDocument(_)), "{err}");
    }
}
