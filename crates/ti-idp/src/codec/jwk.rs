//! EC public keys in JWK form, as published by the IDP key endpoints.

use serde::{Deserialize, Serialize};

use super::ec::{Curve, EcPublicKey};
use super::error::CodecError;
use crate::crypto::{b64url, b64url_decode};

/// An elliptic-curve public JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `EC`.
    pub kty: String,

    /// Curve name.
    pub crv: String,

    /// X coordinate (base64url).
    pub x: String,

    /// Y coordinate (base64url).
    pub y: String,

    /// Key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Intended use (`sig` or `enc`).
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Certificate chain (standard base64 DER), leaf first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
}

impl Jwk {
    /// Builds a JWK from a public key.
    #[must_use]
    pub fn from_public_key(key: &EcPublicKey) -> Self {
        Self {
            kty: "EC".to_string(),
            crv: key.curve().jwk_name().to_string(),
            x: b64url(key.x()),
            y: b64url(key.y()),
            kid: None,
            key_use: None,
            x5c: None,
        }
    }

    /// Sets the key identifier.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Sets the `use` member.
    #[must_use]
    pub fn with_use(mut self, key_use: impl Into<String>) -> Self {
        self.key_use = Some(key_use.into());
        self
    }

    /// Attaches a certificate chain.
    #[must_use]
    pub fn with_x5c(mut self, chain: Vec<String>) -> Self {
        self.x5c = Some(chain);
        self
    }

    /// Converts the JWK back into a public key.
    ///
    /// # Errors
    /// Returns `CodecError::InvalidKey` for other key types or curves, or if
    /// the point is not on the curve.
    pub fn to_public_key(&self) -> Result<EcPublicKey, CodecError> {
        let curve = Curve::from_jwk_name(&self.crv)
            .filter(|_| self.kty == "EC")
            .ok_or_else(|| {
                CodecError::invalid_key(format!("unsupported key type {}/{}", self.kty, self.crv))
            })?;
        let x = b64url_decode(&self.x).map_err(CodecError::encoding)?;
        let y = b64url_decode(&self.y).map_err(CodecError::encoding)?;
        EcPublicKey::from_coordinates(curve, &x, &y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ec::EcSecretKey;

    #[test]
    fn test_jwk_public_key_conversion() {
        let secret = EcSecretKey::generate(Curve::BrainpoolP256r1).unwrap();
        let public = secret.public_key().unwrap();
        let jwk = Jwk::from_public_key(&public).with_kid("puk_idp_enc");

        let json = serde_json::to_string(&jwk).unwrap();
        assert!(json.contains("\"crv\":\"BP-256\""));
        assert!(!json.contains("x5c"));

        let parsed: Jwk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to_public_key().unwrap(), public);
    }

    #[test]
    fn test_jwk_rejects_unknown_curve() {
        let secret = EcSecretKey::generate(Curve::BrainpoolP256r1).unwrap();
        let mut jwk = Jwk::from_public_key(&secret.public_key().unwrap());
        jwk.crv = "P-384".to_string();
        assert!(matches!(jwk.to_public_key(), Err(CodecError::InvalidKey(_))));
    }

    #[test]
    fn test_jwk_curve_must_match_point() {
        let secret = EcSecretKey::generate(Curve::BrainpoolP256r1).unwrap();
        let mut jwk = Jwk::from_public_key(&secret.public_key().unwrap());
        jwk.crv = "P-256".to_string();
        assert!(matches!(jwk.to_public_key(), Err(CodecError::InvalidKey(_))));
    }
}
