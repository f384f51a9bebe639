//! Trust validation errors.

/// Errors raised while validating a certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustError {
    /// No certificate was supplied, or a required certificate is absent.
    #[error("No certificate found")]
    NoCertificateFound,

    /// A certificate could not be parsed.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The chain does not lead to a pinned trust anchor.
    #[error("Certificate untrusted: {0}")]
    Untrusted(String),

    /// A certificate in the chain is expired.
    #[error("Certificate expired: {subject}")]
    Expired {
        /// Subject of the expired certificate.
        subject: String,
    },

    /// A certificate in the chain is not valid yet.
    #[error("Certificate not yet valid: {subject}")]
    NotYetValid {
        /// Subject of the certificate.
        subject: String,
    },

    /// The OCSP response is unusable (status, signer or signature).
    #[error("Invalid OCSP response: {0}")]
    InvalidOcspResponse(String),

    /// The revocation status could not be confirmed as good.
    #[error("Certificate status verification failed: {0}")]
    StatusVerificationFailed(String),

    /// Any other failure.
    #[error("Trust validation failed: {0}")]
    Unspecified(String),
}

impl TrustError {
    /// Creates a new `InvalidCertificate` error.
    #[must_use]
    pub fn invalid_certificate(message: impl Into<String>) -> Self {
        Self::InvalidCertificate(message.into())
    }

    /// Creates a new `Untrusted` error.
    #[must_use]
    pub fn untrusted(message: impl Into<String>) -> Self {
        Self::Untrusted(message.into())
    }

    /// Creates a new `InvalidOcspResponse` error.
    #[must_use]
    pub fn invalid_ocsp_response(message: impl Into<String>) -> Self {
        Self::InvalidOcspResponse(message.into())
    }

    /// Creates a new `StatusVerificationFailed` error.
    #[must_use]
    pub fn status_verification_failed(message: impl Into<String>) -> Self {
        Self::StatusVerificationFailed(message.into())
    }

    /// Creates a new `Unspecified` error.
    #[must_use]
    pub fn unspecified(message: impl Into<String>) -> Self {
        Self::Unspecified(message.into())
    }

    /// Returns `true` for errors raised by the revocation check.
    #[must_use]
    pub fn is_revocation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOcspResponse(_) | Self::StatusVerificationFailed(_)
        )
    }
}
