//! Wire types of the IDP endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::ClientError;
use crate::challenge::UserConsent;

/// Response of the authorization endpoint to a challenge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Signed challenge token.
    pub challenge: String,
    /// Consent information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_consent: Option<UserConsent>,
}

/// Parameters of a challenge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeRequest {
    /// Registered client identifier.
    pub client_id: String,
    /// Correlation state.
    pub state: String,
    /// Replay protection nonce.
    pub nonce: String,
    /// S256 code challenge.
    pub code_challenge: String,
    /// Always `S256`.
    pub code_challenge_method: String,
    /// Space separated scopes.
    pub scope: String,
    /// Always `code`.
    pub response_type: String,
    /// Registered redirect URI.
    pub redirect_uri: String,
}

/// Authorization code returned after a successful proof.
///
/// Consumed immediately by the token request; never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ExchangeToken {
    /// Authorization code.
    pub code: String,
    /// New SSO token, if the IDP issued one.
    pub sso: Option<String>,
    /// Echoed correlation state.
    pub state: String,
    /// Redirect location without its query.
    pub redirect: String,
}

impl std::fmt::Debug for ExchangeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeToken")
            .field("state", &self.state)
            .field("redirect", &self.redirect)
            .field("has_sso", &self.sso.is_some())
            .finish_non_exhaustive()
    }
}

impl ExchangeToken {
    /// Parses the `Location` of a 302 answer.
    ///
    /// # Errors
    /// Returns `Server` if the redirect carries an OAuth error and
    /// `Decoding` if `code` or `state` is missing.
    pub fn from_redirect(location: &str) -> Result<Self, ClientError> {
        let url = Url::parse(location).map_err(|e| ClientError::decoding(e.to_string()))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        if let Some(error) = params.get("error") {
            let mut response = super::error::ServerResponse::new(302, error.clone());
            response.gematik_error_text = params.get("error_description").cloned();
            response.gematik_code = params.get("gematik_code").cloned();
            return Err(ClientError::Server(response));
        }
        let code = params
            .get("code")
            .cloned()
            .ok_or_else(|| ClientError::decoding("redirect without code"))?;
        let state = params
            .get("state")
            .cloned()
            .ok_or_else(|| ClientError::decoding("redirect without state"))?;
        let mut redirect = url.clone();
        redirect.set_query(None);
        Ok(Self {
            code,
            sso: params.get("ssotoken").cloned(),
            state,
            redirect: redirect.to_string(),
        })
    }
}

/// Form of the token request.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TokenRequest {
    /// Authorization code.
    pub code: String,
    /// JWE carrying token key and code verifier for the IDP.
    pub key_verifier: String,
    /// PKCE verifier.
    pub code_verifier: String,
    /// Always `authorization_code`.
    pub grant_type: String,
    /// Redirect URI of the authorization request.
    pub redirect_uri: String,
    /// Client identifier.
    pub client_id: String,
}

/// Token endpoint response. Both tokens are `dir` JWEs under the token key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Encrypted access token.
    pub access_token: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
    /// Encrypted id token.
    pub id_token: String,
    /// Token type, `Bearer`.
    pub token_type: String,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &crate::crypto::fingerprint(&self.access_token))
            .field("expires_in", &self.expires_in)
            .field("id_token", &crate::crypto::fingerprint(&self.id_token))
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// A registered device as listed by the pairing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    /// Device name.
    pub name: String,
    /// Pairing data signed by the card.
    pub signed_pairing_data: String,
    /// Registration time (Unix seconds).
    pub creation_time: i64,
    /// Entry format version.
    #[serde(default)]
    pub pairing_entry_version: String,
}

/// All devices registered for the authenticated insurant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntries {
    /// Entries.
    pub pairing_entries: Vec<PairingEntry>,
}

/// Parameters that hand an authorization over to an insurer's app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalAuthRequest {
    /// Identifier of the insurer app.
    pub kk_app_id: String,
    /// Correlation state.
    pub state: String,
    /// Redirect URI for the final callback.
    pub redirect_uri: String,
    /// S256 code challenge.
    pub code_challenge: String,
    /// Always `S256`.
    pub code_challenge_method: String,
    /// Replay protection nonce.
    pub nonce: String,
    /// Client identifier.
    pub client_id: String,
    /// Space separated scopes.
    pub scope: String,
}

/// Callback an insurer's app delivers back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalAuthCallback {
    /// Authorization code issued by the insurer.
    pub code: String,
    /// Correlation state of the original request.
    pub state: String,
    /// Redirect URI the insurer used.
    pub kk_app_redirect_uri: String,
}

impl ExternalAuthCallback {
    /// Extracts the callback parameters from a universal link.
    ///
    /// # Errors
    /// Returns `Decoding` if a parameter is missing.
    pub fn from_url(url: &Url) -> Result<Self, ClientError> {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let get = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::decoding(format!("callback without {name}")))
        };
        Ok(Self {
            code: get("code")?,
            state: get("state")?,
            kk_app_redirect_uri: get("kk_app_redirect_uri")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_token_from_redirect() {
        let token = ExchangeToken::from_redirect(
            "https://redirect.gematik.de/erezept?code=abc&ssotoken=sso1&state=st",
        )
        .unwrap();
        assert_eq!(token.code, "abc");
        assert_eq!(token.sso.as_deref(), Some("sso1"));
        assert_eq!(token.state, "st");
        assert_eq!(token.redirect, "https://redirect.gematik.de/erezept");
    }

    #[test]
    fn test_token_response_debug_hides_tokens() {
        let response = TokenResponse {
            access_token: "eyJhbGciOiJkaXIi.secret-access".to_string(),
            expires_in: 300,
            id_token: "eyJhbGciOiJkaXIi.secret-id".to_string(),
            token_type: "Bearer".to_string(),
        };
        let debug = format!("{response:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-id"));
        assert!(debug.contains("expires_in: 300"));
    }

    #[test]
    fn test_redirect_errors() {
        let err = ExchangeToken::from_redirect(
            "https://redirect.gematik.de/erezept?error=access_denied&gematik_code=2020&state=st",
        )
        .unwrap_err();
        let response = err.server_response().unwrap();
        assert_eq!(response.error.as_deref(), Some("access_denied"));
        assert_eq!(response.gematik_code.as_deref(), Some("2020"));

        assert!(matches!(
            ExchangeToken::from_redirect("https://redirect.gematik.de/erezept?state=st"),
            Err(ClientError::Decoding(_))
        ));
    }

    #[test]
    fn test_external_callback_from_url() {
        let url = Url::parse(
            "https://das-e-rezept-fuer-deutschland.de/extauth?code=c1&state=s1&kk_app_redirect_uri=https%3A%2F%2Fkk.example%2Fcb",
        )
        .unwrap();
        let callback = ExternalAuthCallback::from_url(&url).unwrap();
        assert_eq!(callback.code, "c1");
        assert_eq!(callback.state, "s1");
        assert_eq!(callback.kk_app_redirect_uri, "https://kk.example/cb");

        let url = Url::parse("https://das-e-rezept-fuer-deutschland.de/extauth?code=c1").unwrap();
        assert!(ExternalAuthCallback::from_url(&url).is_err());
    }
}
