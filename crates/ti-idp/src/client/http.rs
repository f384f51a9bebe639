//! `reqwest` implementation of [`IdpClient`].

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use url::Url;

use super::error::{ClientError, ServerResponse};
use super::models::{
    ChallengeRequest, ChallengeResponse, ExchangeToken, ExternalAuthCallback, ExternalAuthRequest,
    PairingEntries, PairingEntry, TokenRequest, TokenResponse,
};
use super::IdpClient;
use crate::codec::{Jwk, Jws};
use crate::config::ClientConfig;
use crate::discovery::{DiscoveryBundle, DiscoveryClaims, DiscoveryDocument, Endpoint};

/// Error text used when an error body is not the IDP's JSON.
const UNDECODABLE: &str = "Unable to decode.";

/// HTTP client for the IDP endpoints.
///
/// Redirects are never followed: the IDP answers proofs with a `302` whose
/// `Location` carries the authorization code.
#[derive(Debug, Clone)]
pub struct HttpIdpClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpIdpClient {
    /// Creates a client for the configured IDP.
    ///
    /// # Errors
    /// Returns `Network` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClientError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response, ClientError> {
        request.send().await.map_err(|e| {
            tracing::warn!(target_url = %target, error = %e, "IDP request failed");
            ClientError::from(e)
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, ClientError> {
        let response = self.send(self.http.get(url), url).await?;
        let response = ensure_success(response).await?;
        Ok(response.text().await?)
    }

    async fn get_jwk(&self, url: &str) -> Result<Jwk, ClientError> {
        let response = self
            .send(self.http.get(url).header(ACCEPT, "application/json"), url)
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn post_for_redirect(
        &self,
        url: Url,
        form: &[(&str, &str)],
    ) -> Result<ExchangeToken, ClientError> {
        let response = self
            .send(self.http.post(url.clone()).form(form), url.as_str())
            .await?;
        let location = redirect_location(response).await?;
        ExchangeToken::from_redirect(&location)
    }
}

#[async_trait]
impl IdpClient for HttpIdpClient {
    async fn load_discovery_document(&self) -> Result<DiscoveryBundle, ClientError> {
        let jwt = self.get_text(&self.config.discovery_url).await?;
        let claims: DiscoveryClaims = Jws::parse(jwt.trim())
            .and_then(|jws| jws.claims())
            .map_err(|e| ClientError::decoding(format!("discovery document: {e}")))?;
        let encryption_key = self.get_jwk(&claims.uri_puk_idp_enc).await?;
        let signing_key = self.get_jwk(&claims.uri_puk_idp_sig).await?;
        tracing::debug!(issuer = %claims.issuer, "Fetched discovery document");
        Ok(DiscoveryBundle {
            jwt: jwt.trim().to_string(),
            encryption_key,
            signing_key,
        })
    }

    async fn request_challenge(
        &self,
        request: &ChallengeRequest,
        document: &DiscoveryDocument,
    ) -> Result<ChallengeResponse, ClientError> {
        let url = document.endpoint(Endpoint::Authorization)?;
        let response = self
            .send(
                self.http
                    .get(url.clone())
                    .query(request)
                    .header(ACCEPT, "application/json"),
                url.as_str(),
            )
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn verify(
        &self,
        signed_challenge: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        let url = document.endpoint(Endpoint::Authorization)?;
        self.post_for_redirect(url, &[("signed_challenge", signed_challenge)])
            .await
    }

    async fn refresh_with_sso_token(
        &self,
        unsigned_challenge: &str,
        sso_token: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        let url = document.endpoint(Endpoint::Sso)?;
        self.post_for_redirect(
            url,
            &[
                ("unsigned_challenge", unsigned_challenge),
                ("ssotoken", sso_token),
            ],
        )
        .await
    }

    async fn exchange(
        &self,
        request: &TokenRequest,
        document: &DiscoveryDocument,
    ) -> Result<TokenResponse, ClientError> {
        let url = document.endpoint(Endpoint::Token)?;
        let response = self
            .send(
                self.http
                    .post(url.clone())
                    .form(request)
                    .header(ACCEPT, "application/json"),
                url.as_str(),
            )
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn register_device(
        &self,
        encrypted_registration: &str,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<PairingEntry, ClientError> {
        let url = document.endpoint(Endpoint::Pairing)?;
        let response = self
            .send(
                self.http
                    .post(url.clone())
                    .header(AUTHORIZATION, authorization)
                    .header(ACCEPT, "application/json")
                    .form(&[("encrypted_registration_data", encrypted_registration)]),
                url.as_str(),
            )
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn unregister_device(
        &self,
        key_identifier: &str,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<(), ClientError> {
        let mut url = document.endpoint(Endpoint::Pairing)?;
        url.path_segments_mut()
            .map_err(|()| ClientError::decoding("pairing endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(key_identifier);
        let response = self
            .send(
                self.http.delete(url.clone()).header(AUTHORIZATION, authorization),
                url.as_str(),
            )
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn list_devices(
        &self,
        authorization: &str,
        document: &DiscoveryDocument,
    ) -> Result<PairingEntries, ClientError> {
        let url = document.endpoint(Endpoint::Pairing)?;
        let response = self
            .send(
                self.http
                    .get(url.clone())
                    .header(AUTHORIZATION, authorization)
                    .header(ACCEPT, "application/json"),
                url.as_str(),
            )
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn alt_verify(
        &self,
        encrypted_authentication_data: &str,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        let url = document.endpoint(Endpoint::AuthenticationPaired)?;
        self.post_for_redirect(
            url,
            &[(
                "encrypted_signed_authentication_data",
                encrypted_authentication_data,
            )],
        )
        .await
    }

    async fn load_insurer_directory(
        &self,
        document: &DiscoveryDocument,
    ) -> Result<String, ClientError> {
        let url = document.endpoint(Endpoint::InsurerDirectory)?;
        Ok(self.get_text(url.as_str()).await?.trim().to_string())
    }

    async fn start_external_authentication(
        &self,
        request: &ExternalAuthRequest,
        document: &DiscoveryDocument,
    ) -> Result<Url, ClientError> {
        let url = document.endpoint(Endpoint::ThirdPartyAuthorization)?;
        let query = [
            ("idp_iss", request.kk_app_id.as_str()),
            ("response_type", "code"),
            ("client_id", request.client_id.as_str()),
            ("state", request.state.as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("scope", request.scope.as_str()),
            ("code_challenge", request.code_challenge.as_str()),
            ("code_challenge_method", request.code_challenge_method.as_str()),
            ("nonce", request.nonce.as_str()),
        ];
        let response = self
            .send(self.http.get(url.clone()).query(&query), url.as_str())
            .await?;
        let location = redirect_location(response).await?;
        Url::parse(&location).map_err(|e| ClientError::decoding(format!("insurer app URL: {e}")))
    }

    async fn complete_external_authentication(
        &self,
        callback: &ExternalAuthCallback,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        let url = document.endpoint(Endpoint::ThirdPartyAuthorization)?;
        self.post_for_redirect(
            url,
            &[
                ("code", callback.code.as_str()),
                ("state", callback.state.as_str()),
                ("kk_app_redirect_uri", callback.kk_app_redirect_uri.as_str()),
            ],
        )
        .await
    }
}

async fn ensure_success(response: Response) -> Result<Response, ClientError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(server_error(response).await)
    }
}

async fn redirect_location(response: Response) -> Result<String, ClientError> {
    let status = response.status();
    if status != StatusCode::FOUND && status != StatusCode::SEE_OTHER {
        if status.is_success() {
            return Err(ClientError::decoding(format!(
                "expected a redirect, got HTTP {}",
                status.as_u16()
            )));
        }
        return Err(server_error(response).await);
    }
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ClientError::decoding("redirect without Location"))
}

async fn server_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let mut parsed = serde_json::from_str::<ServerResponse>(&body)
        .unwrap_or_else(|_| ServerResponse::new(status, UNDECODABLE));
    parsed.status = status;
    tracing::debug!(status, error = ?parsed.error, code = ?parsed.gematik_code, "IDP rejected request");
    ClientError::Server(parsed)
}
