//! Delegated external authentication through an insurer's app.
//!
//! The engine creates a [`ChallengeSession`](crate::challenge::ChallengeSession)
//! with a fresh random `state`, registers it in the [`ExtAuthRequestStore`]
//! and hands the user over to the insurer. The callback carries the same
//! `state`; an unknown, expired or mismatched value fails with
//! [`ExtAuthError::InvalidNonce`] or [`ExtAuthError::InvalidStateParameter`]
//! and is never matched against another request.

pub mod error;
pub mod insurer;
pub mod store;

pub use error::ExtAuthError;
pub use insurer::{InsurerDirectory, InsurerEntry};
pub use store::{ExtAuthRequestStore, PendingExternalAuthRequest};
