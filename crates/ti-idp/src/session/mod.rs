//! Login, refresh and logout of one user profile against the IDP.
//!
//! An [`IdpSession`] drives the challenge-response login with any
//! [`CredentialSource`], exchanges the authorization code for tokens and
//! keeps them in the session token store. Silent renewal with the SSO
//! token is single-flight per profile through the [`RefreshCoordinator`].
//! Clients that only need a bearer token use the [`AccessTokenProvider`]
//! view of a session.

mod engine;
mod id_token;
mod policy;
mod provider;
mod refresh;
mod state;

pub use engine::{CredentialSource, IdpSession, IdpSessionBuilder};
pub use id_token::{IdTokenClaims, check_profile_binding, verify_id_token};
pub use policy::LoginRoute;
pub use provider::{AccessTokenProvider, AutoRefresh};
pub use refresh::RefreshCoordinator;
pub use state::SessionState;
