//! The IDP's HTTP surface.
//!
//! [`IdpClient`] is the seam between the session engine and the network.
//! [`HttpIdpClient`] implements it with `reqwest`; tests substitute an
//! in-process IDP. The client only moves bytes: every token it returns is
//! verified by the engine, never by the client.

pub mod error;
pub mod http;
pub mod models;

use async_trait::async_trait;
use url::Url;

pub use error::{ClientError, ServerResponse};
pub use http::HttpIdpClient;
pub use models::{
    ChallengeRequest, ChallengeResponse, ExchangeToken, ExternalAuthCallback, ExternalAuthRequest,
    PairingEntries, PairingEntry, TokenRequest, TokenResponse,
};

use crate::discovery::{DiscoveryBundle, DiscoveryDocument};

/// Operations of the IDP.
///
/// Methods that need an access token take the complete `Authorization`
/// header value.
#[async_trait]
pub trait IdpClient: Send + Sync {
    /// Fetches the discovery JWT and both IDP keys.
    async fn load_discovery_document(&self) -> Result<DiscoveryBundle, ClientError>;

    /// Requests a challenge for an authorization attempt.
    async fn request_challenge(
        &self,
        request: &ChallengeRequest,
        document: &DiscoveryDocument,
    ) -> Result<ChallengeResponse, ClientError>;

    /// Submits the encrypted signed challenge.
    async fn verify(
        &self,
        signed_challenge: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError>;

    /// Answers a challenge with an SSO token instead of a signature.
    async fn refresh_with_sso_token(
        &self,
        unsigned_challenge: &str,
        sso_token: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError>;

    /// Exchanges an authorization code for tokens.
    async fn exchange(
        &self,
        request: &TokenRequest,
        document: &DiscoveryDocument,
    ) -> Result<TokenResponse, ClientError>;

    /// Registers a paired device key.
    async fn register_device(
        &self,
        encrypted_registration: &str,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<PairingEntry, ClientError>;

    /// Removes a paired device key.
    async fn unregister_device(
        &self,
        key_identifier: &str,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<(), ClientError>;

    /// Lists the paired devices of the authenticated user.
    async fn list_devices(
        &self,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<PairingEntries, ClientError>;

    /// Submits authentication data signed by a paired device key.
    async fn alt_verify(
        &self,
        encrypted_authentication_data: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError>;

    /// Fetches the signed insurer app directory.
    async fn load_insurer_directory(&self, document: &DiscoveryDocument)
    -> Result<String, ClientError>;

    /// Starts a federated authorization and returns the insurer app URL.
    async fn start_external_authentication(
        &self,
        request: &ExternalAuthRequest,
        document: &DiscoveryDocument,
    ) -> Result<Url, ClientError>;

    /// Submits an insurer callback.
    async fn complete_external_authentication(
        &self,
        callback: &ExternalAuthCallback,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError>;
}
