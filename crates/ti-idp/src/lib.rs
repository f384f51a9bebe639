//! # ti-idp
//!
//! Authentication client for the identity provider of the German
//! health telematics infrastructure.
//!
//! This crate provides:
//! - Challenge-response login with the health card, a paired device key
//!   or a delegated insurer app
//! - Token exchange, silent SSO refresh and per-profile token storage
//! - Certificate path and OCSP validation of IDP and card certificates
//! - JWS/JWE codecs for the nested and encrypted IDP tokens
//!
//! ## Modules
//!
//! - [`session`] - Login, refresh and logout of one user profile
//! - [`trust`] - Certificate validation against the TSL trust anchors
//! - [`codec`] - JWS signing and verification, JWE encryption
//! - [`card`] - Secure channel to the health card and challenge signing
//! - [`biometric`] - Device key pairing and biometric signing
//! - [`ext_auth`] - Authentication delegated to an insurer app
//! - [`store`] - Persistent session tokens and pairing records
//! - [`client`] - HTTP client for the IDP endpoints
//! - [`discovery`] - Signed discovery document
//! - [`config`] - Client configuration

pub mod biometric;
pub mod card;
pub mod challenge;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod ext_auth;
pub mod profile;
pub mod session;
pub mod store;
pub mod trust;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use challenge::{ChallengeSession, IdpChallenge, SignedChallenge};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{ConfigError, IdpConfig, LoginPolicy};
pub use discovery::DiscoveryDocument;
pub use error::{ErrorCategory, IdpError, ReauthReason};
pub use profile::{ProfileContext, ProfileId};
pub use session::{
    AccessTokenProvider, AutoRefresh, CredentialSource, IdpSession, IdpSessionBuilder, LoginRoute,
    RefreshCoordinator, SessionState,
};
pub use store::{FileTokenStore, MemoryTokenStore, SessionToken, SessionTokenStore};

/// Type alias for results of this crate.
pub type IdpResult<T> = Result<T, IdpError>;
