//! Parsed X.509 certificate handle.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::x509::X509;
use time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::error::TrustError;
use crate::codec::{CodecError, EcPublicKey};
use crate::crypto::sha256;

/// A DER certificate together with the fields needed for path building.
///
/// Cloning is cheap; the DER bytes are shared.
#[derive(Clone)]
pub struct Certificate {
    der: Arc<[u8]>,
    subject: String,
    subject_raw: Vec<u8>,
    issuer: String,
    issuer_raw: Vec<u8>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    is_ca: bool,
    ocsp_signer: bool,
    public_key: Vec<u8>,
    spki: Vec<u8>,
}

impl Certificate {
    /// Parses a DER-encoded certificate.
    ///
    /// # Errors
    /// Returns `TrustError::InvalidCertificate` if parsing fails.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, TrustError> {
        let der: Arc<[u8]> = Arc::from(der.into());
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| TrustError::invalid_certificate(e.to_string()))?;
        Ok(Self {
            subject: cert.subject().to_string(),
            subject_raw: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().to_string(),
            issuer_raw: cert.issuer().as_raw().to_vec(),
            serial: cert.raw_serial().to_vec(),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            is_ca: cert.is_ca(),
            ocsp_signer: cert
                .extended_key_usage()
                .ok()
                .flatten()
                .is_some_and(|eku| eku.value.ocsp_signing),
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            spki: cert.public_key().raw.to_vec(),
            der: Arc::clone(&der),
        })
    }

    /// Parses a single PEM certificate.
    ///
    /// # Errors
    /// Returns `TrustError::InvalidCertificate` if parsing fails.
    pub fn from_pem(pem: &str) -> Result<Self, TrustError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| TrustError::invalid_certificate(e.to_string()))?;
        Self::from_der(pem.contents)
    }

    /// Parses a standard-base64 DER certificate, as found in `x5c`.
    ///
    /// # Errors
    /// Returns `TrustError::InvalidCertificate` for bad base64 or DER.
    pub fn from_base64(encoded: &str) -> Result<Self, TrustError> {
        let der = STANDARD
            .decode(encoded)
            .map_err(|e| TrustError::invalid_certificate(e.to_string()))?;
        Self::from_der(der)
    }

    /// Parses an `x5c` chain.
    ///
    /// # Errors
    /// Returns `NoCertificateFound` for an empty chain.
    pub fn chain_from_x5c(x5c: &[String]) -> Result<Vec<Self>, TrustError> {
        if x5c.is_empty() {
            return Err(TrustError::NoCertificateFound);
        }
        x5c.iter().map(|c| Self::from_base64(c)).collect()
    }

    /// Standard-base64 DER, as used in `x5c`.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    /// DER bytes.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// DER encoding of the subject name.
    #[must_use]
    pub fn subject_raw(&self) -> &[u8] {
        &self.subject_raw
    }

    /// Issuer distinguished name.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// DER encoding of the issuer name.
    #[must_use]
    pub fn issuer_raw(&self) -> &[u8] {
        &self.issuer_raw
    }

    /// Raw serial number bytes.
    #[must_use]
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Serial number as lowercase hex.
    #[must_use]
    pub fn serial_hex(&self) -> String {
        hex::encode(&self.serial)
    }

    /// Start of the validity period.
    #[must_use]
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity period.
    #[must_use]
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Whether the basic constraints mark this as a CA certificate.
    #[must_use]
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether the extended key usage allows signing OCSP responses.
    #[must_use]
    pub fn is_ocsp_signer(&self) -> bool {
        self.ocsp_signer
    }

    /// Whether `now` lies inside the validity period.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Checks the validity period.
    ///
    /// # Errors
    /// Returns `Expired` or `NotYetValid`.
    pub fn check_validity(&self, now: OffsetDateTime) -> Result<(), TrustError> {
        if now < self.not_before {
            return Err(TrustError::NotYetValid {
                subject: self.subject.clone(),
            });
        }
        if now > self.not_after {
            return Err(TrustError::Expired {
                subject: self.subject.clone(),
            });
        }
        Ok(())
    }

    /// Whether the issuer name equals `issuer`'s subject name.
    #[must_use]
    pub fn names_issuer(&self, issuer: &Certificate) -> bool {
        self.issuer_raw == issuer.subject_raw
    }

    /// Verifies this certificate's signature with `issuer`'s key.
    ///
    /// # Errors
    /// Returns `TrustError::Untrusted` if the signature does not verify.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<(), TrustError> {
        let untrusted = |reason: String| {
            TrustError::untrusted(format!(
                "signature of '{}' does not verify with '{}': {reason}",
                self.subject, issuer.subject
            ))
        };
        let cert = X509::from_der(&self.der)
            .map_err(|e| TrustError::invalid_certificate(e.to_string()))?;
        let key = issuer
            .verification_key()
            .and_then(|key| key.pkey())
            .map_err(|e| untrusted(e.to_string()))?;
        match cert.verify(&key) {
            Ok(true) => Ok(()),
            Ok(false) => Err(untrusted("signature mismatch".to_string())),
            Err(e) => Err(untrusted(e.to_string())),
        }
    }

    /// Hash of the subject public key bits under `algorithm`, used to
    /// identify the issuer in OCSP responses.
    #[must_use]
    pub fn key_hash(&self, algorithm: KeyHashAlgorithm) -> Vec<u8> {
        algorithm.digest(&self.public_key)
    }

    /// Hash of the DER subject name under `algorithm`.
    #[must_use]
    pub fn subject_hash(&self, algorithm: KeyHashAlgorithm) -> Vec<u8> {
        algorithm.digest(&self.subject_raw)
    }

    /// The subject public key.
    ///
    /// # Errors
    /// Returns `InvalidCertificate` for keys that are not on a supported
    /// curve.
    pub fn public_key(&self) -> Result<EcPublicKey, TrustError> {
        EcPublicKey::from_spki_der(&self.spki)
            .map_err(|e| TrustError::invalid_certificate(e.to_string()))
    }

    /// Verification key for tokens signed by this certificate's holder.
    ///
    /// # Errors
    /// Returns `InvalidKey` for keys that are not on a supported curve.
    pub fn verification_key(&self) -> Result<EcPublicKey, CodecError> {
        EcPublicKey::from_spki_der(&self.spki)
    }
}

/// Hash algorithms accepted in OCSP certificate identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHashAlgorithm {
    /// SHA-1, still the default of most responders.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl KeyHashAlgorithm {
    /// Digest of `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => openssl::sha::sha1(data).to_vec(),
            Self::Sha256 => sha256(data).to_vec(),
        }
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial_hex())
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl serde::Serialize for Certificate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for Certificate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pki::TestPki;

    #[test]
    fn test_parse_fields() {
        let pki = TestPki::new();
        let leaf = pki.issue_leaf("IDP Sig 1");
        let cert = &leaf.certificate;

        assert!(cert.subject().contains("IDP Sig 1"));
        assert!(cert.names_issuer(&pki.ca.certificate));
        assert!(!cert.is_ca());
        assert!(pki.ca.certificate.is_ca());
        assert_eq!(cert.public_key().unwrap(), leaf.key.public_key().unwrap());
        assert!(cert.verify_signed_by(&pki.ca.certificate).is_ok());
        assert!(cert.verify_signed_by(&pki.root.certificate).is_err());
    }

    #[test]
    fn test_forged_signature_is_untrusted() {
        let pki = TestPki::new();
        let other = TestPki::new();
        let leaf = pki.issue_leaf("IDP Sig 1");
        assert!(matches!(
            leaf.certificate.verify_signed_by(&other.ca.certificate),
            Err(TrustError::Untrusted(_))
        ));
    }

    #[test]
    fn test_key_hash_algorithms() {
        let pki = TestPki::new();
        let ca = &pki.ca.certificate;
        assert_eq!(ca.key_hash(KeyHashAlgorithm::Sha1).len(), 20);
        assert_eq!(ca.key_hash(KeyHashAlgorithm::Sha256).len(), 32);
        assert_ne!(
            ca.subject_hash(KeyHashAlgorithm::Sha256),
            pki.root.certificate.subject_hash(KeyHashAlgorithm::Sha256)
        );
    }

    #[test]
    fn test_base64_and_serde() {
        let pki = TestPki::new();
        let cert = pki.issue_leaf("IDP Enc").certificate;
        let again = Certificate::from_base64(&cert.to_base64()).unwrap();
        assert_eq!(cert, again);

        let json = serde_json::to_string(&cert).unwrap();
        let parsed: Certificate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.serial(), cert.serial());
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            Certificate::from_der(vec![0x30, 0x01, 0x00]),
            Err(TrustError::InvalidCertificate(_))
        ));
        assert!(matches!(
            Certificate::chain_from_x5c(&[]),
            Err(TrustError::NoCertificateFound)
        ));
    }
}
