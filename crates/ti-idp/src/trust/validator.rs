use std::sync::Arc;

use time::OffsetDateTime;

use super::anchors::TrustAnchorSet;
use super::certificate::Certificate;
use super::error::TrustError;
use super::ocsp::{CertStatus, OcspResponder, OcspResponse, OcspResponseStatus};
use crate::clock::SharedClock;
use crate::config::TrustConfig;

/// Longest accepted path, leaf and root included.
const MAX_PATH_LEN: usize = 5;

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct Trusted {
    /// Validated end-entity certificate.
    pub leaf: Certificate,
    /// Path from the leaf (first) to the pinned root (last).
    pub path: Vec<Certificate>,
    /// Time the validation was performed at.
    pub validated_at: OffsetDateTime,
}

/// Validates certificate chains against a [`TrustAnchorSet`] and checks
/// revocation through an [`OcspResponder`].
#[derive(Clone)]
pub struct TrustValidator {
    anchors: Arc<TrustAnchorSet>,
    ocsp: Option<Arc<dyn OcspResponder>>,
    config: TrustConfig,
    clock: SharedClock,
}

impl TrustValidator {
    /// Creates a validator without a revocation source.
    #[must_use]
    pub fn new(anchors: Arc<TrustAnchorSet>, config: TrustConfig, clock: SharedClock) -> Self {
        Self {
            anchors,
            ocsp: None,
            config,
            clock,
        }
    }

    /// Sets the revocation source.
    #[must_use]
    pub fn with_ocsp_responder(mut self, responder: Arc<dyn OcspResponder>) -> Self {
        self.ocsp = Some(responder);
        self
    }

    /// The pinned anchors.
    #[must_use]
    pub fn anchors(&self) -> &TrustAnchorSet {
        &self.anchors
    }

    /// Validates `chain` (leaf first): path to a pinned root, validity
    /// periods, signatures and revocation status of the leaf.
    ///
    /// # Errors
    /// Returns `NoCertificateFound` for an empty chain, `Untrusted`,
    /// `Expired` or `NotYetValid` for path failures, and
    /// `InvalidOcspResponse` or `StatusVerificationFailed` for revocation
    /// failures.
    pub async fn validate(&self, chain: &[Certificate]) -> Result<Trusted, TrustError> {
        let trusted = self.validate_path(chain)?;
        self.check_revocation(&trusted).await?;
        tracing::debug!(
            "Certificate '{}' validated against '{}'",
            trusted.leaf.subject(),
            trusted.path.last().map(Certificate::subject).unwrap_or_default()
        );
        Ok(trusted)
    }

    /// Path validation without the revocation check.
    ///
    /// # Errors
    /// Same path errors as [`validate`](Self::validate).
    pub fn validate_path(&self, chain: &[Certificate]) -> Result<Trusted, TrustError> {
        let leaf = chain.first().ok_or(TrustError::NoCertificateFound)?;
        let now = self.clock.now();
        let mut path = vec![leaf.clone()];

        loop {
            let current = path.last().cloned().ok_or(TrustError::NoCertificateFound)?;
            current.check_validity(now)?;

            if self.anchors.is_root(&current) {
                break;
            }
            if path.len() >= MAX_PATH_LEN {
                return Err(TrustError::untrusted("path too long"));
            }

            if let Some(root) = self
                .anchors
                .root_candidates(&current)
                .find(|root| current.verify_signed_by(root).is_ok())
            {
                path.push(root.clone());
                continue;
            }

            let issuer = chain
                .iter()
                .skip(1)
                .chain(self.anchors.intermediates())
                .filter(|c| c.is_ca() && current.names_issuer(c) && !path.contains(c))
                .find(|c| current.verify_signed_by(c).is_ok())
                .cloned();
            match issuer {
                Some(issuer) => path.push(issuer),
                None => {
                    return Err(TrustError::untrusted(format!(
                        "no path from '{}' to a trust anchor",
                        current.subject()
                    )));
                }
            }
        }

        Ok(Trusted {
            leaf: leaf.clone(),
            path,
            validated_at: now,
        })
    }

    async fn check_revocation(&self, trusted: &Trusted) -> Result<(), TrustError> {
        let Some(responder) = &self.ocsp else {
            if self.config.require_ocsp {
                return Err(TrustError::status_verification_failed(
                    "no revocation source configured",
                ));
            }
            tracing::warn!(
                "Skipping revocation check for '{}': no responder configured",
                trusted.leaf.subject()
            );
            return Ok(());
        };
        let Some(issuer) = trusted.path.get(1) else {
            // A pinned root presented as leaf has no issuer to ask.
            return Ok(());
        };

        let der = responder.status(&trusted.leaf, issuer).await?;
        let response = OcspResponse::from_der(&der)?;
        if response.status != OcspResponseStatus::Successful {
            return Err(TrustError::invalid_ocsp_response(format!(
                "response status {:?}",
                response.status
            )));
        }
        let basic = response
            .basic
            .ok_or_else(|| TrustError::invalid_ocsp_response("missing basic response"))?;

        let signer = basic
            .signer(issuer)
            .ok_or_else(|| TrustError::invalid_ocsp_response("responder certificate missing"))?;
        if signer != issuer {
            self.check_delegated_responder(signer, issuer)?;
        }
        let data = basic.verified_data(signer)?;

        let single = data
            .responses
            .iter()
            .find(|r| r.cert_id.identifies(&trusted.leaf, issuer))
            .ok_or_else(|| {
                TrustError::status_verification_failed(format!(
                    "no status for serial {}",
                    trusted.leaf.serial_hex()
                ))
            })?;

        let now = self.clock.now();
        let max_age = time::Duration::try_from(self.config.ocsp_max_age)
            .map_err(|e| TrustError::unspecified(e.to_string()))?;
        if single.this_update > now || now - single.this_update > max_age {
            return Err(TrustError::status_verification_failed("stale status"));
        }
        if let Some(next_update) = single.next_update {
            if next_update < now {
                return Err(TrustError::status_verification_failed("status outdated"));
            }
        }

        match &single.cert_status {
            CertStatus::Good => Ok(()),
            CertStatus::Revoked { revoked_at } => Err(TrustError::status_verification_failed(
                format!("certificate revoked at {revoked_at}"),
            )),
            CertStatus::Unknown => Err(TrustError::status_verification_failed(
                "certificate unknown to responder",
            )),
        }
    }

    /// A delegated responder must be certified for OCSP signing by the CA
    /// that issued the certificate in question, and be valid itself.
    fn check_delegated_responder(
        &self,
        responder: &Certificate,
        issuer: &Certificate,
    ) -> Result<(), TrustError> {
        if !responder.is_ocsp_signer() {
            return Err(TrustError::invalid_ocsp_response(format!(
                "'{}' is not authorized to sign OCSP responses",
                responder.subject()
            )));
        }
        if !responder.names_issuer(issuer) || responder.verify_signed_by(issuer).is_err() {
            return Err(TrustError::invalid_ocsp_response(format!(
                "responder '{}' was not issued by '{}'",
                responder.subject(),
                issuer.subject()
            )));
        }
        self.validate_path(std::slice::from_ref(responder))
            .map(|_| ())
            .map_err(|e| TrustError::invalid_ocsp_response(format!("responder untrusted: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::testing::pki::{StaticOcspResponder, TestPki};
    use time::Duration;

    fn validator(pki: &TestPki, clock: &FixedClock) -> TrustValidator {
        TrustValidator::new(
            Arc::new(pki.anchors()),
            TrustConfig::default(),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_valid_chain_with_good_status() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let responder = StaticOcspResponder::new(pki.ocsp_response(
            &leaf.certificate,
            CertStatus::Good,
            clock.now(),
        ));
        let validator = validator(&pki, &clock).with_ocsp_responder(Arc::new(responder));

        let trusted = validator
            .validate(&[leaf.certificate.clone(), pki.ca.certificate.clone()])
            .await
            .unwrap();
        assert_eq!(trusted.path.len(), 3);
        assert_eq!(trusted.leaf, leaf.certificate);
    }

    #[tokio::test]
    async fn test_intermediate_from_anchor_set() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let trusted = validator(&pki, &clock)
            .validate_path(std::slice::from_ref(&leaf.certificate))
            .unwrap();
        assert_eq!(trusted.path.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        assert!(matches!(
            validator(&pki, &clock).validate(&[]).await,
            Err(TrustError::NoCertificateFound)
        ));
    }

    #[tokio::test]
    async fn test_foreign_root_untrusted() {
        let pki = TestPki::new();
        let other = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = other.issue_leaf("Foreign");
        assert!(matches!(
            validator(&pki, &clock)
                .validate(&[leaf.certificate, other.ca.certificate.clone()])
                .await,
            Err(TrustError::Untrusted(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_leaf() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        clock.set(leaf.certificate.not_after() + Duration::days(1));
        assert!(matches!(
            validator(&pki, &clock).validate_path(&[leaf.certificate]),
            Err(TrustError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_responder_when_required() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        assert!(matches!(
            validator(&pki, &clock).validate(&[leaf.certificate]).await,
            Err(TrustError::StatusVerificationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_and_unknown_status() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        for status in [
            CertStatus::Revoked {
                revoked_at: clock.now() - Duration::hours(1),
            },
            CertStatus::Unknown,
        ] {
            let responder =
                StaticOcspResponder::new(pki.ocsp_response(&leaf.certificate, status, clock.now()));
            let result = validator(&pki, &clock)
                .with_ocsp_responder(Arc::new(responder))
                .validate(std::slice::from_ref(&leaf.certificate))
                .await;
            assert!(matches!(result, Err(TrustError::StatusVerificationFailed(_))));
        }
    }

    #[tokio::test]
    async fn test_stale_status() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let responder = StaticOcspResponder::new(pki.ocsp_response(
            &leaf.certificate,
            CertStatus::Good,
            clock.now() - Duration::days(2),
        ));
        let result = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await;
        assert!(matches!(result, Err(TrustError::StatusVerificationFailed(_))));
    }

    #[tokio::test]
    async fn test_untrusted_responder() {
        let pki = TestPki::new();
        let other = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        // Status signed by a responder of a different PKI.
        let responder = StaticOcspResponder::new(other.ocsp_response_for_issuer(
            &leaf.certificate,
            &pki.ca.certificate,
            CertStatus::Good,
            clock.now(),
        ));
        let result = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await;
        assert!(matches!(result, Err(TrustError::InvalidOcspResponse(_))));
    }

    #[tokio::test]
    async fn test_responder_without_ocsp_signing_usage() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let impostor = pki.issue_leaf("IDP Enc");
        let responder = StaticOcspResponder::new(pki.ocsp_response_signed_by(
            &leaf.certificate,
            &pki.ca.certificate,
            &impostor,
            CertStatus::Good,
            clock.now(),
        ));
        let result = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await;
        assert!(matches!(result, Err(TrustError::InvalidOcspResponse(_))));
    }

    #[tokio::test]
    async fn test_response_signed_by_issuer() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let responder = StaticOcspResponder::new(pki.ocsp_response_signed_by(
            &leaf.certificate,
            &pki.ca.certificate,
            &pki.ca,
            CertStatus::Good,
            clock.now(),
        ));
        let trusted = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await
            .unwrap();
        assert_eq!(trusted.leaf, leaf.certificate);
    }

    #[tokio::test]
    async fn test_status_for_other_certificate() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let other = pki.issue_leaf("IDP Enc");
        let responder = StaticOcspResponder::new(pki.ocsp_response(
            &other.certificate,
            CertStatus::Good,
            clock.now(),
        ));
        let result = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await;
        assert!(matches!(result, Err(TrustError::StatusVerificationFailed(_))));
    }

    #[tokio::test]
    async fn test_unsuccessful_response_status() {
        let pki = TestPki::new();
        let clock = FixedClock::new(OffsetDateTime::now_utc());
        let leaf = pki.issue_leaf("IDP Sig");
        let responder =
            StaticOcspResponder::new(TestPki::unsuccessful_ocsp_response(OcspResponseStatus::TryLater));
        let result = validator(&pki, &clock)
            .with_ocsp_responder(Arc::new(responder))
            .validate(std::slice::from_ref(&leaf.certificate))
            .await;
        assert!(matches!(result, Err(TrustError::InvalidOcspResponse(_))));
    }
}
