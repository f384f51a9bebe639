//! OCSP revocation status (RFC 6960).
//!
//! A platform adapter fetches the DER `OCSPResponse` for a certificate and
//! hands it over through [`OcspResponder`]. The signed response data is
//! decoded to locate the signer, but nothing in it is used before the
//! signature over the original DER bytes has been checked.

pub mod asn1;

use async_trait::async_trait;
use der::asn1::{GeneralizedTime, OctetString};
use der::{Decode, Encode, Tag, TagNumber, Tagged};
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use time::OffsetDateTime;

use self::asn1::{
    BasicOcspResponseAsn1, CertIdAsn1, CertStatusAsn1, ECDSA_WITH_SHA256, ID_PKIX_OCSP_BASIC,
    ID_SHA1, ID_SHA256, OcspResponseAsn1, ResponseDataAsn1, SingleResponseAsn1,
};
use super::certificate::{Certificate, KeyHashAlgorithm};
use super::error::TrustError;

pub use self::asn1::OcspResponseStatus;

/// Revocation status of a single certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertStatus {
    /// Not revoked.
    Good,
    /// Revoked at the given time.
    Revoked {
        /// Revocation time.
        revoked_at: OffsetDateTime,
    },
    /// The responder does not know the certificate.
    Unknown,
}

/// Identifies a certificate by issuer name, issuer key and serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertId {
    /// Hash algorithm of the two issuer hashes.
    pub hash_algorithm: KeyHashAlgorithm,
    /// Hash of the issuer's DER subject name.
    pub issuer_name_hash: Vec<u8>,
    /// Hash of the issuer's public key bits.
    pub issuer_key_hash: Vec<u8>,
    /// Serial number of the certificate.
    pub serial_number: Vec<u8>,
}

impl CertId {
    /// Builds the identifier for `certificate` issued by `issuer`.
    #[must_use]
    pub fn new(
        certificate: &Certificate,
        issuer: &Certificate,
        hash_algorithm: KeyHashAlgorithm,
    ) -> Self {
        Self {
            hash_algorithm,
            issuer_name_hash: issuer.subject_hash(hash_algorithm),
            issuer_key_hash: issuer.key_hash(hash_algorithm),
            serial_number: certificate.serial().to_vec(),
        }
    }

    /// Whether this identifier refers to `certificate` issued by `issuer`.
    #[must_use]
    pub fn identifies(&self, certificate: &Certificate, issuer: &Certificate) -> bool {
        *self == Self::new(certificate, issuer, self.hash_algorithm)
    }

    fn from_asn1(id: &CertIdAsn1) -> Result<Self, TrustError> {
        let hash_algorithm = match id.hash_algorithm.algorithm {
            oid if oid == ID_SHA1 => KeyHashAlgorithm::Sha1,
            oid if oid == ID_SHA256 => KeyHashAlgorithm::Sha256,
            oid => {
                return Err(TrustError::invalid_ocsp_response(format!(
                    "unsupported CertID hash algorithm {oid}"
                )));
            }
        };
        Ok(Self {
            hash_algorithm,
            issuer_name_hash: id.issuer_name_hash.as_bytes().to_vec(),
            issuer_key_hash: id.issuer_key_hash.as_bytes().to_vec(),
            serial_number: id.serial_number.as_bytes().to_vec(),
        })
    }
}

/// The `ResponderID` naming the key that signed a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderId {
    /// DER subject name of the responder certificate.
    ByName(Vec<u8>),
    /// SHA-1 of the responder's public key bits.
    ByKey(Vec<u8>),
}

impl ResponderId {
    /// Whether `certificate` is the responder this identifier names.
    #[must_use]
    pub fn identifies(&self, certificate: &Certificate) -> bool {
        match self {
            Self::ByName(name) => name.as_slice() == certificate.subject_raw(),
            Self::ByKey(hash) => *hash == certificate.key_hash(KeyHashAlgorithm::Sha1),
        }
    }

    fn from_asn1(id: &der::asn1::Any) -> Result<Self, TrustError> {
        match id.tag() {
            Tag::ContextSpecific { number, .. } if number == TagNumber::N1 => {
                Ok(Self::ByName(id.value().to_vec()))
            }
            Tag::ContextSpecific { number, .. } if number == TagNumber::N2 => {
                let hash = OctetString::from_der(id.value()).map_err(ocsp_error)?;
                Ok(Self::ByKey(hash.as_bytes().to_vec()))
            }
            tag => Err(TrustError::invalid_ocsp_response(format!(
                "unexpected ResponderID tag {tag}"
            ))),
        }
    }
}

/// Status entry for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleResponse {
    /// Certificate this entry refers to.
    pub cert_id: CertId,
    /// Revocation status.
    pub cert_status: CertStatus,
    /// Time at which the status was known to be correct.
    pub this_update: OffsetDateTime,
    /// Time at or before which newer information will be available.
    pub next_update: Option<OffsetDateTime>,
}

impl SingleResponse {
    fn from_asn1(single: &SingleResponseAsn1) -> Result<Self, TrustError> {
        let cert_status = match &single.cert_status {
            CertStatusAsn1::Good(_) => CertStatus::Good,
            CertStatusAsn1::Revoked(info) => CertStatus::Revoked {
                revoked_at: to_datetime(&info.revocation_time)?,
            },
            CertStatusAsn1::Unknown(_) => CertStatus::Unknown,
        };
        Ok(Self {
            cert_id: CertId::from_asn1(&single.cert_id)?,
            cert_status,
            this_update: to_datetime(&single.this_update)?,
            next_update: single.next_update.as_ref().map(to_datetime).transpose()?,
        })
    }
}

/// Signed part of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseData {
    /// Signer of the response.
    pub responder_id: ResponderId,
    /// Time the response was produced.
    pub produced_at: OffsetDateTime,
    /// Status entries.
    pub responses: Vec<SingleResponse>,
}

/// A `BasicOCSPResponse`.
#[derive(Debug, Clone)]
pub struct BasicResponse {
    tbs_response_data: Vec<u8>,
    data: ResponseData,
    signature: Vec<u8>,
    certs: Vec<Certificate>,
}

impl BasicResponse {
    fn from_der(der: &[u8]) -> Result<Self, TrustError> {
        let basic = BasicOcspResponseAsn1::from_der(der).map_err(ocsp_error)?;
        if basic.signature_algorithm.algorithm != ECDSA_WITH_SHA256 {
            return Err(TrustError::invalid_ocsp_response(format!(
                "unsupported signature algorithm {}",
                basic.signature_algorithm.algorithm
            )));
        }
        let signature = basic
            .signature
            .as_bytes()
            .ok_or_else(|| TrustError::invalid_ocsp_response("signature has unused bits"))?
            .to_vec();
        let tbs_response_data = basic.tbs_response_data.to_der().map_err(ocsp_error)?;
        let data = ResponseDataAsn1::from_der(&tbs_response_data).map_err(ocsp_error)?;
        let certs = basic
            .certs
            .unwrap_or_default()
            .iter()
            .map(|cert| Certificate::from_der(cert.to_der().map_err(ocsp_error)?))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrustError::invalid_ocsp_response(e.to_string()))?;

        Ok(Self {
            data: ResponseData {
                responder_id: ResponderId::from_asn1(&data.responder_id)?,
                produced_at: to_datetime(&data.produced_at)?,
                responses: data
                    .responses
                    .iter()
                    .map(SingleResponse::from_asn1)
                    .collect::<Result<_, _>>()?,
            },
            tbs_response_data,
            signature,
            certs,
        })
    }

    /// Certificates embedded by the responder.
    #[must_use]
    pub fn certs(&self) -> &[Certificate] {
        &self.certs
    }

    /// The responder named by the (not yet verified) response data.
    #[must_use]
    pub fn responder_id(&self) -> &ResponderId {
        &self.data.responder_id
    }

    /// Finds the signer certificate: `issuer` itself or an embedded
    /// delegated responder.
    #[must_use]
    pub fn signer<'a>(&'a self, issuer: &'a Certificate) -> Option<&'a Certificate> {
        let responder_id = self.responder_id();
        if responder_id.identifies(issuer) {
            return Some(issuer);
        }
        self.certs.iter().find(|cert| responder_id.identifies(cert))
    }

    /// Verifies the signature with `signer`'s key and returns the data.
    ///
    /// # Errors
    /// Returns `InvalidOcspResponse` if the signature does not verify.
    pub fn verified_data(&self, signer: &Certificate) -> Result<&ResponseData, TrustError> {
        let key = signer
            .verification_key()
            .and_then(|key| key.pkey())
            .map_err(|e| TrustError::invalid_ocsp_response(e.to_string()))?;
        let verified = Verifier::new(MessageDigest::sha256(), &key)
            .and_then(|mut verifier| {
                verifier.update(&self.tbs_response_data)?;
                verifier.verify(&self.signature)
            })
            .unwrap_or(false);
        if !verified {
            return Err(TrustError::invalid_ocsp_response(
                "signature does not verify",
            ));
        }
        Ok(&self.data)
    }
}

/// A decoded `OCSPResponse`.
#[derive(Debug, Clone)]
pub struct OcspResponse {
    /// Response status.
    pub status: OcspResponseStatus,
    /// Present when `status` is `Successful`.
    pub basic: Option<BasicResponse>,
}

impl OcspResponse {
    /// Decodes a DER `OCSPResponse`.
    ///
    /// # Errors
    /// Returns `InvalidOcspResponse` for malformed DER, a response type
    /// other than `id-pkix-ocsp-basic` or an unsupported algorithm.
    pub fn from_der(der: &[u8]) -> Result<Self, TrustError> {
        let response = OcspResponseAsn1::from_der(der).map_err(ocsp_error)?;
        let basic = match response.response_bytes {
            Some(bytes) if bytes.response_type == ID_PKIX_OCSP_BASIC => {
                Some(BasicResponse::from_der(bytes.response.as_bytes())?)
            }
            Some(bytes) => {
                return Err(TrustError::invalid_ocsp_response(format!(
                    "unsupported response type {}",
                    bytes.response_type
                )));
            }
            None => None,
        };
        Ok(Self {
            status: response.response_status,
            basic,
        })
    }
}

/// Source of revocation status information.
#[async_trait]
pub trait OcspResponder: Send + Sync {
    /// Fetches the DER `OCSPResponse` for `certificate`, issued by `issuer`.
    async fn status(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
    ) -> Result<Vec<u8>, TrustError>;
}

fn to_datetime(time: &GeneralizedTime) -> Result<OffsetDateTime, TrustError> {
    let seconds = i64::try_from(time.to_unix_duration().as_secs())
        .map_err(|e| TrustError::invalid_ocsp_response(e.to_string()))?;
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| TrustError::invalid_ocsp_response(e.to_string()))
}

fn ocsp_error(err: der::Error) -> TrustError {
    TrustError::invalid_ocsp_response(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pki::TestPki;

    #[test]
    fn test_decode_and_verify() {
        let pki = TestPki::new();
        let leaf = pki.issue_leaf("C.CH.AUT");
        let now = OffsetDateTime::now_utc();
        let der = pki.ocsp_response(&leaf.certificate, CertStatus::Good, now);

        let response = OcspResponse::from_der(&der).unwrap();
        assert_eq!(response.status, OcspResponseStatus::Successful);
        let basic = response.basic.unwrap();
        let signer = basic.signer(&pki.ca.certificate).unwrap();
        assert_eq!(signer, &pki.responder.certificate);

        let data = basic.verified_data(signer).unwrap();
        assert_eq!(data.responses.len(), 1);
        assert!(data.responses[0]
            .cert_id
            .identifies(&leaf.certificate, &pki.ca.certificate));
        assert_eq!(data.responses[0].cert_status, CertStatus::Good);
        assert_eq!(data.responses[0].this_update.unix_timestamp(), now.unix_timestamp());
    }

    #[test]
    fn test_revoked_status_and_sha1_cert_id() {
        let pki = TestPki::new();
        let leaf = pki.issue_leaf("C.CH.AUT");
        let now = OffsetDateTime::now_utc();
        let revoked_at = now - time::Duration::hours(3);
        let der = pki.ocsp_response(&leaf.certificate, CertStatus::Revoked { revoked_at }, now);

        let basic = OcspResponse::from_der(&der).unwrap().basic.unwrap();
        let data = basic.verified_data(&pki.responder.certificate).unwrap();
        let single = &data.responses[0];
        assert_eq!(single.cert_id.hash_algorithm, KeyHashAlgorithm::Sha1);
        assert_eq!(
            single.cert_status,
            CertStatus::Revoked {
                revoked_at: OffsetDateTime::from_unix_timestamp(revoked_at.unix_timestamp())
                    .unwrap()
            }
        );
    }

    #[test]
    fn test_tampered_response_data() {
        let pki = TestPki::new();
        let leaf = pki.issue_leaf("C.CH.AUT");
        let der = pki.ocsp_response(
            &leaf.certificate,
            CertStatus::Unknown,
            OffsetDateTime::now_utc(),
        );
        // `[2] IMPLICIT NULL` (unknown) becomes `[0] IMPLICIT NULL` (good).
        let position = der
            .windows(2)
            .position(|w| w == [0x82, 0x00])
            .unwrap();
        let mut tampered = der.clone();
        tampered[position] = 0x80;

        let basic = OcspResponse::from_der(&tampered).unwrap().basic.unwrap();
        assert_eq!(
            basic.responder_id(),
            OcspResponse::from_der(&der).unwrap().basic.unwrap().responder_id()
        );
        assert!(matches!(
            basic.verified_data(&pki.responder.certificate),
            Err(TrustError::InvalidOcspResponse(_))
        ));
    }

    #[test]
    fn test_unsuccessful_response_without_body() {
        let der = TestPki::unsuccessful_ocsp_response(OcspResponseStatus::TryLater);
        let response = OcspResponse::from_der(&der).unwrap();
        assert_eq!(response.status, OcspResponseStatus::TryLater);
        assert!(response.basic.is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            OcspResponse::from_der(b"\x30\x03\x0a\x01"),
            Err(TrustError::InvalidOcspResponse(_))
        ));
    }
}
