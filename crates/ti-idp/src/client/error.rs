//! IDP client errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error body returned by the IDP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// HTTP status code.
    #[serde(default)]
    pub status: u16,

    /// OAuth error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human readable error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gematik_error_text: Option<String>,

    /// IDP-specific error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gematik_code: Option<String>,

    /// Time of the error (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gematik_timestamp: Option<i64>,

    /// Correlation identifier of the failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gematik_uuid: Option<String>,
}

impl ServerResponse {
    /// Creates a response with status and OAuth error code.
    #[must_use]
    pub fn new(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.gematik_error_text = Some(text.into());
        self
    }

    /// Sets the IDP error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.gematik_code = Some(code.into());
        self
    }
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        if let Some(error) = &self.error {
            write!(f, " {error}")?;
        }
        if let Some(code) = &self.gematik_code {
            write!(f, " [{code}]")?;
        }
        if let Some(text) = &self.gematik_error_text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

/// Errors talking to the IDP.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Transport failure or timeout. Retryable by the caller.
    #[error("Network error: {0}")]
    Network(String),

    /// The IDP rejected the request.
    #[error("Server error: {0}")]
    Server(ServerResponse),

    /// The response could not be understood.
    #[error("Response decoding error: {0}")]
    Decoding(String),

    /// An endpoint needed for the operation is not advertised.
    #[error("Endpoint not available: {0}")]
    EndpointUnavailable(String),
}

impl ClientError {
    /// Creates a new `Network` error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a new `Decoding` error.
    #[must_use]
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }

    /// Returns `true` for transport failures.
    #[must_use]
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// The server response, for `Server` errors.
    #[must_use]
    pub fn server_response(&self) -> Option<&ServerResponse> {
        match self {
            Self::Server(response) => Some(response),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decoding(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_response_display() {
        let response = ServerResponse::new(400, "invalid_request")
            .with_code("2010")
            .with_text("code_challenge missing");
        assert_eq!(
            response.to_string(),
            "HTTP 400 invalid_request [2010]: code_challenge missing"
        );
        let err = ClientError::Server(response.clone());
        assert_eq!(err.server_response(), Some(&response));
        assert!(!err.is_network_error());
        assert!(ClientError::network("timeout").is_network_error());
    }
}
