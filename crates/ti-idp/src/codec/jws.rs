//! Compact JWS: verification of IDP-issued tokens and assembly of tokens
//! signed by external signers (smartcard, device key).

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ec::{Curve, EcPublicKey, EcSecretKey, SIGNATURE_LEN};
use super::error::CodecError;
use crate::crypto::{b64url, b64url_decode};

/// ECDSA P-256 with SHA-256, used by paired device keys.
pub const ALG_ES256: &str = "ES256";

/// ECDSA brainpoolP256r1 with SHA-256, used by the IDP and the health card.
pub const ALG_BP256R1: &str = "BP256R1";

/// Content type of a nested token.
pub const CTY_NJWT: &str = "NJWT";

/// Protected header of a compact JWS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    /// Signature algorithm.
    pub alg: String,

    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// Content type (`NJWT` for nested tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,

    /// Key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Signer certificate chain (standard base64 DER), leaf first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

impl JwsHeader {
    /// JWT header for a signature on `curve`.
    #[must_use]
    pub fn for_curve(curve: Curve) -> Self {
        Self {
            alg: curve.jws_alg().to_string(),
            typ: Some("JWT".to_string()),
            ..Self::default()
        }
    }

    /// ES256 JWT header.
    #[must_use]
    pub fn es256() -> Self {
        Self::for_curve(Curve::P256)
    }

    /// BP256R1 JWT header.
    #[must_use]
    pub fn bp256r1() -> Self {
        Self::for_curve(Curve::BrainpoolP256r1)
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_cty(mut self, cty: impl Into<String>) -> Self {
        self.cty = Some(cty.into());
        self
    }

    /// Sets the key identifier.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Sets the signer certificate chain.
    #[must_use]
    pub fn with_x5c(mut self, chain: Vec<String>) -> Self {
        self.x5c = Some(chain);
        self
    }
}

/// Something that can produce a raw ECDSA signature (`r || s`) over a
/// message: a smartcard session, a device-bound key or a software key.
#[async_trait]
pub trait JwsSigner: Send {
    /// Error type of the underlying signer.
    type Error: From<CodecError> + Send;

    /// Signs `message` and returns the 64-byte `r || s` signature.
    async fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

#[async_trait]
impl JwsSigner for SigningKey {
    type Error = CodecError;

    async fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, CodecError> {
        let signature: Signature = Signer::sign(self, message);
        Ok(signature.to_bytes().to_vec())
    }
}

#[async_trait]
impl JwsSigner for EcSecretKey {
    type Error = CodecError;

    async fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, CodecError> {
        EcSecretKey::sign(self, message)
    }
}

/// A parsed, not yet verified compact JWS.
#[derive(Debug, Clone)]
pub struct Jws {
    /// Decoded protected header.
    pub header: JwsHeader,

    /// Decoded payload bytes.
    pub payload: Vec<u8>,

    /// Raw signature bytes.
    pub signature: Vec<u8>,

    signing_input: String,
}

impl Jws {
    /// Splits and decodes a compact JWS without verifying it.
    ///
    /// # Errors
    /// Returns `Malformed` for a wrong number of parts and `Encoding` for
    /// undecodable segments.
    pub fn parse(compact: &str) -> Result<Self, CodecError> {
        let parts: Vec<&str> = compact.split('.').collect();
        if parts.len() != 3 {
            return Err(CodecError::malformed(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }
        let header_bytes = b64url_decode(parts[0]).map_err(CodecError::encoding)?;
        let header: JwsHeader = serde_json::from_slice(&header_bytes)?;
        let payload = b64url_decode(parts[1]).map_err(CodecError::encoding)?;
        let signature = b64url_decode(parts[2]).map_err(CodecError::encoding)?;
        Ok(Self {
            header,
            payload,
            signature,
            signing_input: format!("{}.{}", parts[0], parts[1]),
        })
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    /// Returns `Encoding` if the payload is not the expected JSON.
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The `header.payload` string the signature covers.
    #[must_use]
    pub fn signing_input(&self) -> &str {
        &self.signing_input
    }

    /// Builds a compact JWS signed by an external signer.
    ///
    /// # Errors
    /// Propagates the signer's error, or a codec error if the header cannot
    /// be serialized or the signature has the wrong size.
    pub async fn sign_with<S>(
        header: &JwsHeader,
        payload: &[u8],
        signer: &mut S,
    ) -> Result<String, S::Error>
    where
        S: JwsSigner + ?Sized,
    {
        let header_json = serde_json::to_vec(header).map_err(CodecError::from)?;
        let signing_input = format!("{}.{}", b64url(&header_json), b64url(payload));
        let signature = signer.sign(signing_input.as_bytes()).await?;
        if signature.len() != SIGNATURE_LEN {
            return Err(CodecError::invalid_signature(format!(
                "signer returned {} bytes",
                signature.len()
            ))
            .into());
        }
        Ok(format!("{signing_input}.{}", b64url(&signature)))
    }
}

/// A token whose signature and lifetime have been checked.
#[derive(Debug, Clone)]
pub struct VerifiedToken<T> {
    /// Protected header.
    pub header: JwsHeader,

    /// Deserialized claims.
    pub claims: T,
}

/// Verifies a token signed with `key` and checks `exp` against `now`.
///
/// The signature is checked over the raw signing input before either
/// signed segment is decoded, so any change to the header or payload is
/// reported as `InvalidSignature`. The header must name the algorithm of
/// `key`'s curve.
///
/// # Errors
/// Returns `Malformed`, `InvalidSignature`, `UnsupportedAlgorithm`,
/// `Expired` or `Encoding`.
pub fn decode_verified<T: DeserializeOwned>(
    compact: &str,
    key: &EcPublicKey,
    now: OffsetDateTime,
) -> Result<VerifiedToken<T>, CodecError> {
    let parts: Vec<&str> = compact.split('.').collect();
    let [header, payload, signature] = parts.as_slice() else {
        return Err(CodecError::malformed(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    };
    let signing_input = &compact[..header.len() + 1 + payload.len()];
    verify_signature(key, signing_input.as_bytes(), signature)?;

    let jws = Jws::parse(compact)?;
    if jws.header.alg != key.curve().jws_alg() {
        return Err(CodecError::UnsupportedAlgorithm(jws.header.alg));
    }
    let claims: serde_json::Value = jws.claims()?;
    if let Some(exp) = claims.get("exp").and_then(serde_json::Value::as_i64) {
        if now.unix_timestamp() > exp {
            return Err(CodecError::Expired);
        }
    }
    Ok(VerifiedToken {
        header: jws.header,
        claims: serde_json::from_value(claims)?,
    })
}

fn verify_signature(
    key: &EcPublicKey,
    signing_input: &[u8],
    signature: &str,
) -> Result<(), CodecError> {
    match key.curve() {
        Curve::P256 => {
            let decoding = DecodingKey::from_ec_components(&b64url(key.x()), &b64url(key.y()))?;
            match jsonwebtoken::crypto::verify(signature, signing_input, &decoding, Algorithm::ES256)
            {
                Ok(true) => Ok(()),
                _ => Err(CodecError::invalid_signature("signature mismatch")),
            }
        }
        Curve::BrainpoolP256r1 => {
            let raw = b64url_decode(signature)
                .map_err(|_| CodecError::invalid_signature("undecodable signature"))?;
            key.verify(signing_input, &raw)
        }
    }
}

/// Wraps a token as the payload of a nested token.
///
/// # Errors
/// Returns `Encoding` if serialization fails.
pub fn nest(token: &str) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&serde_json::json!({ "njwt": token }))?)
}

/// Extracts the inner token from a nested-token payload.
///
/// # Errors
/// Returns `Malformed` if the payload carries no `njwt` member.
pub fn unnest(payload: &[u8]) -> Result<String, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    value
        .get("njwt")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CodecError::malformed("nested token without njwt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

    fn signing_key() -> EcSecretKey {
        EcSecretKey::generate(Curve::BrainpoolP256r1).unwrap()
    }

    async fn signed(key: &mut EcSecretKey, payload: &[u8]) -> String {
        Jws::sign_with(&JwsHeader::bp256r1(), payload, key).await.unwrap()
    }

    fn verify(token: &str, key: &EcSecretKey) -> Result<VerifiedToken<serde_json::Value>, CodecError> {
        decode_verified(token, &key.public_key().unwrap(), NOW)
    }

    fn flip_char(segment: &str, index: usize) -> String {
        let mut chars: Vec<char> = segment.chars().collect();
        chars[index] = if chars[index] == 'A' { 'B' } else { 'A' };
        chars.into_iter().collect()
    }

    #[tokio::test]
    async fn test_sign_then_decode_preserves_payload() {
        let mut key = signing_key();
        let payload = br#"{"challenge":"abc","exp":1900000000,"iat":1700000000}"#;
        let token = signed(&mut key, payload).await;

        let parsed = Jws::parse(&token).unwrap();
        assert_eq!(parsed.payload, payload.to_vec());
        assert_eq!(parsed.header.alg, ALG_BP256R1);
        assert_eq!(parsed.signature.len(), SIGNATURE_LEN);

        let verified = verify(&token, &key).unwrap();
        assert_eq!(verified.claims["challenge"], "abc");
    }

    #[tokio::test]
    async fn test_device_key_token_verifies_as_es256() {
        let mut device = SigningKey::random(&mut OsRng);
        let public = EcPublicKey::from(&p256::PublicKey::from(device.verifying_key()));
        let token = Jws::sign_with(&JwsHeader::es256(), br#"{"a":1}"#, &mut device)
            .await
            .unwrap();

        let verified: VerifiedToken<serde_json::Value> =
            decode_verified(&token, &public, NOW).unwrap();
        assert_eq!(verified.header.alg, ALG_ES256);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_signature() {
        let mut key = signing_key();
        let token = signed(&mut key, br#"{"sub":"X110000001"}"#).await;

        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], flip_char(parts[1], 4), parts[2]);
        assert!(matches!(
            verify(&tampered, &key),
            Err(CodecError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_header_fails_signature() {
        let mut key = signing_key();
        let token = signed(&mut key, br#"{"sub":"X110000001"}"#).await;
        let parts: Vec<&str> = token.split('.').collect();

        for index in 0..parts[0].len() {
            let tampered = format!("{}.{}.{}", flip_char(parts[0], index), parts[1], parts[2]);
            assert!(
                matches!(verify(&tampered, &key), Err(CodecError::InvalidSignature(_))),
                "header position {index}"
            );
        }
    }

    #[tokio::test]
    async fn test_undecodable_signature_is_invalid() {
        let mut key = signing_key();
        let token = signed(&mut key, br#"{"a":1}"#).await;
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.!{}", parts[0], parts[1], &parts[2][1..]);
        assert!(matches!(
            verify(&tampered, &key),
            Err(CodecError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_fails_signature() {
        let mut key = signing_key();
        let token = signed(&mut key, br#"{"a":1}"#).await;
        assert!(matches!(
            verify(&token, &signing_key()),
            Err(CodecError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_algorithm_must_match_key_curve() {
        let mut key = signing_key();
        let token = Jws::sign_with(&JwsHeader::es256(), br#"{"a":1}"#, &mut key)
            .await
            .unwrap();
        assert!(matches!(
            verify(&token, &key),
            Err(CodecError::UnsupportedAlgorithm(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let mut key = signing_key();
        let token = signed(&mut key, br#"{"exp":1700000000}"#).await;
        assert!(matches!(verify(&token, &key), Err(CodecError::Expired)));
    }

    #[test]
    fn test_malformed_structure() {
        assert!(matches!(
            Jws::parse("only.two"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            verify("a.b.c.d", &signing_key()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_nested_token() {
        let payload = nest("h.p.s").unwrap();
        assert_eq!(unnest(&payload).unwrap(), "h.p.s");
        assert!(matches!(unnest(b"{}"), Err(CodecError::Malformed(_))));
    }
}
