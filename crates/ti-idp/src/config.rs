//! Client configuration.
//!
//! All durations are written in humantime notation (`"60s"`, `"12h"`).
//!
//! # Example (TOML)
//!
//! ```toml
//! [client]
//! client_id = "eRezeptApp"
//! redirect_uri = "https://redirect.gematik.de/erezept"
//! discovery_url = "https://idp.app.ti-dienste.de/.well-known/openid-configuration"
//!
//! [session]
//! refresh_leeway = "60s"
//! login_policy = "prefer_silent_refresh"
//!
//! [trust]
//! require_ocsp = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration of the authentication client.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IdpConfig {
    /// IDP endpoints and client registration.
    pub client: ClientConfig,

    /// Session lifetime and refresh behavior.
    pub session: SessionConfig,

    /// Smartcard interaction limits.
    pub card: CardConfig,

    /// Delegated external authentication.
    pub ext_auth: ExtAuthConfig,

    /// Certificate trust validation.
    pub trust: TrustConfig,
}

/// Client registration and IDP location.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Registered client identifier.
    pub client_id: String,

    /// Redirect URI registered for the authorization code flow.
    pub redirect_uri: String,

    /// Redirect URI for callbacks from an insurer app.
    pub ext_auth_redirect_uri: String,

    /// Location of the discovery document.
    pub discovery_url: String,

    /// Requested scopes.
    pub scopes: Vec<String>,

    /// User agent sent with every request.
    pub user_agent: String,

    /// Per-request network timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "eRezeptApp".to_string(),
            redirect_uri: "https://redirect.gematik.de/erezept".to_string(),
            ext_auth_redirect_uri: "https://das-e-rezept-fuer-deutschland.de/extauth".to_string(),
            discovery_url: "https://idp.app.ti-dienste.de/.well-known/openid-configuration"
                .to_string(),
            scopes: vec!["e-rezept".to_string(), "openid".to_string()],
            user_agent: concat!("ti-idp/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Space separated scope string.
    #[must_use]
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Which credential path to take when a login is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginPolicy {
    /// Try the SSO token first, then a paired device key, then the card.
    #[default]
    PreferSilentRefresh,
    /// Use a paired device key whenever one exists.
    PreferBiometric,
    /// Always read the card.
    AlwaysCard,
}

/// Session lifetime and refresh behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refresh this long before the access token expires.
    #[serde(with = "humantime_serde")]
    pub refresh_leeway: Duration,

    /// Lifetime of an SSO token, counted from its issuance.
    #[serde(with = "humantime_serde")]
    pub sso_token_lifetime: Duration,

    /// Maximum age of a discovery document.
    #[serde(with = "humantime_serde")]
    pub discovery_max_age: Duration,

    /// Delay before the proactive refresh retries after a network error.
    #[serde(with = "humantime_serde")]
    pub auto_refresh_retry_delay: Duration,

    /// Credential selection policy.
    pub login_policy: LoginPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_leeway: Duration::from_secs(60),
            sso_token_lifetime: Duration::from_secs(12 * 3600),
            discovery_max_age: Duration::from_secs(24 * 3600),
            auto_refresh_retry_delay: Duration::from_secs(30),
            login_policy: LoginPolicy::default(),
        }
    }
}

/// Smartcard interaction limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CardConfig {
    /// Upper bound for one complete card interaction.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Bytes requested per READ BINARY command.
    pub read_chunk_size: u8,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            read_chunk_size: 0xDF,
        }
    }
}

/// Delegated external authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtAuthConfig {
    /// How long a pending request waits for its callback.
    #[serde(with = "humantime_serde")]
    pub pending_ttl: Duration,
}

impl Default for ExtAuthConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(600),
        }
    }
}

/// Certificate trust validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Maximum age of an OCSP status.
    #[serde(with = "humantime_serde")]
    pub ocsp_max_age: Duration,

    /// Fail validation when no revocation source is configured.
    pub require_ocsp: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            ocsp_max_age: Duration::from_secs(12 * 3600),
            require_ocsp: true,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration could not be read or parsed.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl IdpConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    /// Returns `ConfigError::Load` for syntax errors and the validation
    /// errors of [`validate`](Self::validate).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError::Load` if the file cannot be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Load(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Sets the client identifier.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client.client_id = client_id.into();
        self
    }

    /// Sets the redirect URI.
    #[must_use]
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.client.redirect_uri = redirect_uri.into();
        self
    }

    /// Sets the discovery document location.
    #[must_use]
    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.client.discovery_url = url.into();
        self
    }

    /// Sets the refresh leeway.
    #[must_use]
    pub fn with_refresh_leeway(mut self, leeway: Duration) -> Self {
        self.session.refresh_leeway = leeway;
        self
    }

    /// Sets the login policy.
    #[must_use]
    pub fn with_login_policy(mut self, policy: LoginPolicy) -> Self {
        self.session.login_policy = policy;
        self
    }

    /// Sets the trust configuration.
    #[must_use]
    pub fn with_trust(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `client_id` is empty
    /// - a URI does not parse as an absolute URL
    /// - no scope is configured
    /// - `refresh_leeway` is not shorter than `sso_token_lifetime`
    /// - `read_chunk_size` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("client.client_id".to_string()));
        }
        for (name, value) in [
            ("client.redirect_uri", &self.client.redirect_uri),
            ("client.ext_auth_redirect_uri", &self.client.ext_auth_redirect_uri),
            ("client.discovery_url", &self.client.discovery_url),
        ] {
            Url::parse(value)
                .map_err(|e| ConfigError::InvalidValue(format!("{name}: {e}")))?;
        }
        if self.client.scopes.is_empty() {
            return Err(ConfigError::InvalidValue(
                "client.scopes must not be empty".to_string(),
            ));
        }
        if self.session.refresh_leeway >= self.session.sso_token_lifetime {
            return Err(ConfigError::InvalidValue(
                "session.refresh_leeway must be shorter than session.sso_token_lifetime"
                    .to_string(),
            ));
        }
        if self.card.read_chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "card.read_chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IdpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.scope(), "e-rezept openid");
        assert_eq!(config.session.login_policy, LoginPolicy::PreferSilentRefresh);
        assert!(config.trust.require_ocsp);
    }

    #[test]
    fn test_from_toml() {
        let config = IdpConfig::from_toml_str(
            r#"
            [client]
            client_id = "testClient"
            scopes = ["openid"]

            [session]
            refresh_leeway = "2m"
            login_policy = "always_card"

            [ext_auth]
            pending_ttl = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.client_id, "testClient");
        assert_eq!(config.session.refresh_leeway, Duration::from_secs(120));
        assert_eq!(config.session.login_policy, LoginPolicy::AlwaysCard);
        assert_eq!(config.ext_auth.pending_ttl, Duration::from_secs(300));
        // untouched sections keep their defaults
        assert_eq!(config.card.read_chunk_size, 0xDF);
    }

    #[test]
    fn test_validation_errors() {
        let err = IdpConfig::default().with_client_id(" ").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let err = IdpConfig::default()
            .with_redirect_uri("not a url")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let err = IdpConfig::default()
            .with_refresh_leeway(Duration::from_secs(13 * 3600))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_toml_syntax_error() {
        let err = IdpConfig::from_toml_str("[client").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idp.toml");
        std::fs::write(&path, "[card]\nread_chunk_size = 128\n").unwrap();
        let config = IdpConfig::from_file(&path).unwrap();
        assert_eq!(config.card.read_chunk_size, 128);

        let err = IdpConfig::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
