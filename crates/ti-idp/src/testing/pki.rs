//! Throwaway certificate hierarchy on brainpoolP256r1: root, one CA, an
//! OCSP responder and on-demand leaves, plus DER OCSP responses signed by
//! that responder.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use der::asn1::{Any, BitString, GeneralizedTime, Int, Null, OctetString};
use der::{Decode, Encode, Tag, TagNumber};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use time::{Duration, OffsetDateTime};

use crate::clock::SharedClock;
use crate::codec::{Curve, EcSecretKey};
use crate::crypto::random_bytes;
use crate::trust::ocsp::asn1::{
    AlgorithmIdentifier, BasicOcspResponseAsn1, CertIdAsn1, CertStatusAsn1, ECDSA_WITH_SHA256,
    ID_PKIX_OCSP_BASIC, ID_SHA1, ID_SHA256, OcspResponseAsn1, ResponseBytes, ResponseDataAsn1,
    RevokedInfo, SingleResponseAsn1,
};
use crate::trust::{
    CertId, CertStatus, Certificate, KeyHashAlgorithm, OcspResponder, OcspResponseStatus,
    TrustAnchorSet, TrustError,
};

/// A certificate with its private key.
#[derive(Clone)]
pub struct Issued {
    /// Parsed certificate.
    pub certificate: Certificate,
    /// Private key.
    pub key: EcSecretKey,
    pem: String,
}

impl Issued {
    /// BP256R1 signing key.
    #[must_use]
    pub fn signing_key(&self) -> EcSecretKey {
        self.key.clone()
    }

    /// PEM of the certificate.
    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Profile {
    Ca,
    Leaf,
    OcspResponder,
}

/// Root CA, issuing CA and OCSP responder.
pub struct TestPki {
    /// Self-signed root.
    pub root: Issued,
    /// Issuing CA below the root.
    pub ca: Issued,
    /// OCSP responder certificate issued by `ca`.
    pub responder: Issued,
    ca_x509: X509,
}

fn build_certificate(
    common_name: &str,
    profile: Profile,
    key: &EcSecretKey,
    issuer: Option<(&X509, &EcSecretKey)>,
    not_after: OffsetDateTime,
) -> X509 {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .expect("common name");
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "gematik Test-ONLY")
        .expect("organization");
    let name = name.build();

    let mut serial = random_bytes::<8>();
    serial[0] &= 0x7f;
    let serial = BigNum::from_slice(&serial)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    let not_before = OffsetDateTime::now_utc() - Duration::days(1);
    let public = key
        .public_key()
        .and_then(|k| k.pkey())
        .expect("public key");

    let mut builder = X509Builder::new().expect("builder");
    builder.set_version(2).expect("version");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder
        .set_issuer_name(issuer.map_or(&*name, |(cert, _)| cert.subject_name()))
        .expect("issuer");
    builder.set_pubkey(&public).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::from_unix(not_before.unix_timestamp()).expect("not before"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::from_unix(not_after.unix_timestamp()).expect("not after"))
        .expect("not after");

    let extensions = match profile {
        Profile::Ca => vec![
            BasicConstraints::new().critical().ca().build(),
            KeyUsage::new().critical().key_cert_sign().crl_sign().build(),
        ],
        Profile::Leaf => vec![KeyUsage::new().critical().digital_signature().build()],
        Profile::OcspResponder => vec![
            KeyUsage::new().critical().digital_signature().build(),
            ExtendedKeyUsage::new().other("OCSPSigning").build(),
        ],
    };
    for extension in extensions {
        builder
            .append_extension(extension.expect("extension"))
            .expect("append extension");
    }

    let signing = issuer.map_or(key, |(_, issuer_key)| issuer_key);
    builder
        .sign(&signing.pkey().expect("signing key"), MessageDigest::sha256())
        .expect("sign certificate");
    builder.build()
}

fn issued(cert: &X509, key: EcSecretKey) -> Issued {
    Issued {
        certificate: Certificate::from_der(cert.to_der().expect("der")).expect("parse"),
        key,
        pem: String::from_utf8(cert.to_pem().expect("pem")).expect("utf-8 pem"),
    }
}

fn fresh_key() -> EcSecretKey {
    EcSecretKey::generate(Curve::BrainpoolP256r1).expect("key")
}

impl TestPki {
    /// Creates a fresh hierarchy.
    #[must_use]
    pub fn new() -> Self {
        let far = OffsetDateTime::now_utc() + Duration::days(3650);

        let root_key = fresh_key();
        let root_x509 = build_certificate("GEM.RCA-TEST", Profile::Ca, &root_key, None, far);

        let ca_key = fresh_key();
        let ca_x509 = build_certificate(
            "GEM.KOMP-CA-TEST",
            Profile::Ca,
            &ca_key,
            Some((&root_x509, &root_key)),
            far,
        );

        let responder_key = fresh_key();
        let responder_x509 = build_certificate(
            "OCSP Responder TEST",
            Profile::OcspResponder,
            &responder_key,
            Some((&ca_x509, &ca_key)),
            OffsetDateTime::now_utc() + Duration::days(365),
        );

        Self {
            root: issued(&root_x509, root_key),
            responder: issued(&responder_x509, responder_key),
            ca: issued(&ca_x509, ca_key),
            ca_x509,
        }
    }

    /// Issues a leaf below the CA, valid for a year.
    #[must_use]
    pub fn issue_leaf(&self, common_name: &str) -> Issued {
        self.issue_leaf_until(common_name, OffsetDateTime::now_utc() + Duration::days(365))
    }

    /// Issues a leaf below the CA with an explicit end of validity.
    #[must_use]
    pub fn issue_leaf_until(&self, common_name: &str, not_after: OffsetDateTime) -> Issued {
        let key = fresh_key();
        let cert = build_certificate(
            common_name,
            Profile::Leaf,
            &key,
            Some((&self.ca_x509, &self.ca.key)),
            not_after,
        );
        issued(&cert, key)
    }

    /// Anchors pinning the root, with the CA as known intermediate.
    #[must_use]
    pub fn anchors(&self) -> TrustAnchorSet {
        TrustAnchorSet::new(vec![self.root.certificate.clone()])
            .expect("anchors")
            .with_intermediates(vec![self.ca.certificate.clone()])
    }

    /// PEM of the root.
    #[must_use]
    pub fn root_pem(&self) -> String {
        self.root.pem.clone()
    }

    /// DER `OCSPResponse` for `certificate`, assumed to be issued by the CA.
    #[must_use]
    pub fn ocsp_response(
        &self,
        certificate: &Certificate,
        status: CertStatus,
        this_update: OffsetDateTime,
    ) -> Vec<u8> {
        self.ocsp_response_for_issuer(certificate, &self.ca.certificate, status, this_update)
    }

    /// DER `OCSPResponse` for `certificate` issued by `issuer`, signed by
    /// this PKI's responder.
    #[must_use]
    pub fn ocsp_response_for_issuer(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
        status: CertStatus,
        this_update: OffsetDateTime,
    ) -> Vec<u8> {
        self.ocsp_response_signed_by(certificate, issuer, &self.responder, status, this_update)
    }

    /// DER `OCSPResponse` signed by an arbitrary key holder.
    #[must_use]
    pub fn ocsp_response_signed_by(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
        signer: &Issued,
        status: CertStatus,
        this_update: OffsetDateTime,
    ) -> Vec<u8> {
        build_ocsp_response(
            certificate,
            issuer,
            signer,
            status,
            this_update,
            KeyHashAlgorithm::Sha1,
        )
    }

    /// DER `OCSPResponse` with an error status and no response bytes.
    #[must_use]
    pub fn unsuccessful_ocsp_response(status: OcspResponseStatus) -> Vec<u8> {
        OcspResponseAsn1 {
            response_status: status,
            response_bytes: None,
        }
        .to_der()
        .expect("ocsp response")
    }
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

fn generalized(time: OffsetDateTime) -> GeneralizedTime {
    let seconds = u64::try_from(time.unix_timestamp()).expect("time after 1970");
    GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(seconds))
        .expect("generalized time")
}

fn build_ocsp_response(
    certificate: &Certificate,
    issuer: &Certificate,
    signer: &Issued,
    status: CertStatus,
    this_update: OffsetDateTime,
    hash_algorithm: KeyHashAlgorithm,
) -> Vec<u8> {
    let cert_id = CertId::new(certificate, issuer, hash_algorithm);
    let hash_oid = match hash_algorithm {
        KeyHashAlgorithm::Sha1 => ID_SHA1,
        KeyHashAlgorithm::Sha256 => ID_SHA256,
    };
    let cert_status = match status {
        CertStatus::Good => CertStatusAsn1::Good(Null),
        CertStatus::Revoked { revoked_at } => CertStatusAsn1::Revoked(RevokedInfo {
            revocation_time: generalized(revoked_at),
            revocation_reason: None,
        }),
        CertStatus::Unknown => CertStatusAsn1::Unknown(Null),
    };
    let single = SingleResponseAsn1 {
        cert_id: CertIdAsn1 {
            hash_algorithm: AlgorithmIdentifier {
                algorithm: hash_oid,
                parameters: Some(Any::null()),
            },
            issuer_name_hash: OctetString::new(cert_id.issuer_name_hash).expect("name hash"),
            issuer_key_hash: OctetString::new(cert_id.issuer_key_hash).expect("key hash"),
            serial_number: Int::new(&cert_id.serial_number).expect("serial"),
        },
        cert_status,
        this_update: generalized(this_update),
        next_update: Some(generalized(this_update + Duration::hours(24))),
        single_extensions: None,
    };

    let responder_key_hash = OctetString::new(signer.certificate.key_hash(KeyHashAlgorithm::Sha1))
        .and_then(|hash| hash.to_der())
        .expect("responder key hash");
    let data = ResponseDataAsn1 {
        version: None,
        responder_id: Any::new(
            Tag::ContextSpecific {
                constructed: true,
                number: TagNumber::N2,
            },
            responder_key_hash,
        )
        .expect("responder id"),
        produced_at: generalized(this_update),
        responses: vec![single],
        response_extensions: None,
    };
    let tbs = data.to_der().expect("response data");

    let key = signer.key.pkey().expect("responder key");
    let mut signing = Signer::new(MessageDigest::sha256(), &key).expect("signer");
    signing.update(&tbs).expect("sign");
    let signature = signing.sign_to_vec().expect("signature");

    let basic = BasicOcspResponseAsn1 {
        tbs_response_data: Any::from_der(&tbs).expect("tbs"),
        signature_algorithm: AlgorithmIdentifier {
            algorithm: ECDSA_WITH_SHA256,
            parameters: None,
        },
        signature: BitString::new(0, signature).expect("bit string"),
        certs: Some(vec![
            Any::from_der(signer.certificate.der()).expect("responder certificate"),
        ]),
    };
    OcspResponseAsn1 {
        response_status: OcspResponseStatus::Successful,
        response_bytes: Some(ResponseBytes {
            response_type: ID_PKIX_OCSP_BASIC,
            response: OctetString::new(basic.to_der().expect("basic response"))
                .expect("response bytes"),
        }),
    }
    .to_der()
    .expect("ocsp response")
}

/// Responder that always returns the same DER response.
pub struct StaticOcspResponder {
    response: Vec<u8>,
}

impl StaticOcspResponder {
    /// Creates the responder.
    #[must_use]
    pub fn new(response: Vec<u8>) -> Self {
        Self { response }
    }
}

#[async_trait]
impl OcspResponder for StaticOcspResponder {
    async fn status(
        &self,
        _certificate: &Certificate,
        _issuer: &Certificate,
    ) -> Result<Vec<u8>, TrustError> {
        Ok(self.response.clone())
    }
}

/// Responder answering for every certificate of a [`TestPki`], with a
/// revocation list that can be changed at runtime. Certificate IDs use
/// SHA-256.
#[derive(Clone)]
pub struct PkiOcspResponder {
    pki: Arc<TestPki>,
    clock: SharedClock,
    revoked: Arc<Mutex<HashSet<String>>>,
}

impl PkiOcspResponder {
    /// Creates the responder.
    #[must_use]
    pub fn new(pki: Arc<TestPki>, clock: SharedClock) -> Self {
        Self {
            pki,
            clock,
            revoked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Marks a certificate as revoked.
    pub fn revoke(&self, certificate: &Certificate) {
        self.revoked
            .lock()
            .expect("revocation list")
            .insert(certificate.serial_hex());
    }
}

#[async_trait]
impl OcspResponder for PkiOcspResponder {
    async fn status(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
    ) -> Result<Vec<u8>, TrustError> {
        let now = self.clock.now();
        let revoked = self
            .revoked
            .lock()
            .expect("revocation list")
            .contains(&certificate.serial_hex());
        let status = if revoked {
            CertStatus::Revoked { revoked_at: now }
        } else {
            CertStatus::Good
        };
        Ok(build_ocsp_response(
            certificate,
            issuer,
            &self.pki.responder,
            status,
            now,
            KeyHashAlgorithm::Sha256,
        ))
    }
}
