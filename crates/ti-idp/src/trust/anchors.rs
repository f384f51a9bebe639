//! Pinned trust anchors.

use x509_parser::pem::Pem;

use super::certificate::Certificate;
use super::error::TrustError;

/// Immutable set of root certificates plus the CA certificates that may
/// complete a chain the IDP or a card presents incompletely.
#[derive(Debug, Clone)]
pub struct TrustAnchorSet {
    roots: Vec<Certificate>,
    intermediates: Vec<Certificate>,
}

impl TrustAnchorSet {
    /// Creates a set from root certificates.
    ///
    /// Every root must be a self-signed CA certificate.
    ///
    /// # Errors
    /// Returns `NoCertificateFound` for an empty list and `Untrusted` for a
    /// certificate that is not a valid self-signed CA.
    pub fn new(roots: Vec<Certificate>) -> Result<Self, TrustError> {
        if roots.is_empty() {
            return Err(TrustError::NoCertificateFound);
        }
        for root in &roots {
            if !root.is_ca() || !root.names_issuer(root) {
                return Err(TrustError::untrusted(format!(
                    "'{}' is not a self-signed CA",
                    root.subject()
                )));
            }
            root.verify_signed_by(root)?;
        }
        Ok(Self {
            roots,
            intermediates: Vec::new(),
        })
    }

    /// Creates a set from a PEM bundle of roots.
    ///
    /// # Errors
    /// Returns `InvalidCertificate` for unreadable PEM blocks.
    pub fn from_pem_bundle(bundle: &str) -> Result<Self, TrustError> {
        let mut roots = Vec::new();
        for pem in Pem::iter_from_buffer(bundle.as_bytes()) {
            let pem = pem.map_err(|e| TrustError::invalid_certificate(e.to_string()))?;
            if pem.label != "CERTIFICATE" {
                continue;
            }
            roots.push(Certificate::from_der(pem.contents)?);
        }
        Self::new(roots)
    }

    /// Adds CA certificates that may appear between a leaf and a root.
    ///
    /// Intermediates are not trusted on their own; a path through them must
    /// still end at a root.
    #[must_use]
    pub fn with_intermediates(mut self, intermediates: Vec<Certificate>) -> Self {
        self.intermediates
            .extend(intermediates.into_iter().filter(Certificate::is_ca));
        self
    }

    /// Pinned roots.
    #[must_use]
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// Known intermediate CA certificates.
    #[must_use]
    pub fn intermediates(&self) -> &[Certificate] {
        &self.intermediates
    }

    /// Whether `certificate` is one of the pinned roots.
    #[must_use]
    pub fn is_root(&self, certificate: &Certificate) -> bool {
        self.roots.iter().any(|r| r == certificate)
    }

    /// Roots whose subject matches `certificate`'s issuer.
    pub fn root_candidates<'a>(
        &'a self,
        certificate: &'a Certificate,
    ) -> impl Iterator<Item = &'a Certificate> + 'a {
        self.roots.iter().filter(|r| certificate.names_issuer(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pki::TestPki;

    #[test]
    fn test_rejects_non_root() {
        let pki = TestPki::new();
        assert!(matches!(
            TrustAnchorSet::new(vec![pki.ca.certificate.clone()]),
            Err(TrustError::Untrusted(_))
        ));
        assert!(matches!(
            TrustAnchorSet::new(Vec::new()),
            Err(TrustError::NoCertificateFound)
        ));
    }

    #[test]
    fn test_from_pem_bundle() {
        let pki = TestPki::new();
        let anchors = TrustAnchorSet::from_pem_bundle(&pki.root_pem()).unwrap();
        assert_eq!(anchors.roots().len(), 1);
        assert!(anchors.is_root(&pki.root.certificate));

        let anchors = anchors.with_intermediates(vec![
            pki.ca.certificate.clone(),
            pki.issue_leaf("not a CA").certificate,
        ]);
        assert_eq!(anchors.intermediates().len(), 1);
    }
}
