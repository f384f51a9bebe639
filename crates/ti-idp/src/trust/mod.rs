//! Certificate trust validation.
//!
//! # Overview
//!
//! Every certificate the protocol relies on (the discovery document signer,
//! the IDP signing and encryption keys, the card's authentication
//! certificate) passes through [`TrustValidator::validate`]:
//!
//! 1. Build a path from the leaf to a pinned root of the [`TrustAnchorSet`],
//!    using CA certificates from the presented chain or the anchor set.
//! 2. Check every validity period against the injected clock.
//! 3. Verify every signature on the path.
//! 4. Check the leaf's revocation status in the DER OCSP response an
//!    [`OcspResponder`] fetches. The response must be signed by the issuer
//!    or by a delegated responder the issuer certified for OCSP signing.
//!
//! # Security Considerations
//!
//! - Intermediates never act as anchors; only pinned roots terminate a path.
//! - A missing revocation source is a failure unless explicitly allowed by
//!   configuration.

pub mod anchors;
pub mod certificate;
pub mod error;
pub mod ocsp;
mod validator;

pub use anchors::TrustAnchorSet;
pub use certificate::{Certificate, KeyHashAlgorithm};
pub use error::TrustError;
pub use ocsp::{
    BasicResponse, CertId, CertStatus, OcspResponder, OcspResponse, OcspResponseStatus,
    ResponderId, ResponseData, SingleResponse,
};
pub use validator::{Trusted, TrustValidator};
