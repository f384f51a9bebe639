//! Token codec error types.

use jsonwebtoken::errors::ErrorKind;

/// Errors raised while decoding, verifying, encrypting or decrypting tokens.
///
/// Messages describe the failing step only. Key material never appears in
/// an error message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The compact serialization does not have the expected structure.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Base64 or JSON content could not be encoded or decoded.
    #[error("Token encoding error: {0}")]
    Encoding(String),

    /// The signature is missing or does not verify.
    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    /// The token's `exp` lies in the past.
    #[error("Token expired")]
    Expired,

    /// The token is not valid yet (`iat`/`nbf` in the future).
    #[error("Token not yet valid")]
    NotYetValid,

    /// Encryption of an envelope failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption of an envelope failed (wrong key or tampered content).
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The header names an algorithm this codec does not implement.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A key could not be parsed or converted.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl CodecError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates a new `Encoding` error.
    #[must_use]
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Creates a new `InvalidSignature` error.
    #[must_use]
    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::InvalidSignature(message.into())
    }

    /// Creates a new `Decryption` error.
    #[must_use]
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    /// Creates a new `Encryption` error.
    #[must_use]
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }

    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }

    /// Returns `true` for structural and serialization failures.
    #[must_use]
    pub fn is_encoding_error(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Encoding(_))
    }

    /// Returns `true` for failures of the cryptographic operation itself.
    #[must_use]
    pub fn is_cryptographic_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature(_)
                | Self::Encryption(_)
                | Self::Decryption(_)
                | Self::InvalidKey(_)
        )
    }
}

impl From<jsonwebtoken::errors::Error> for CodecError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::InvalidSignature("signature mismatch".into()),
            ErrorKind::InvalidToken => Self::Malformed("invalid token structure".into()),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                Self::UnsupportedAlgorithm(err.to_string())
            }
            ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
                Self::InvalidKey(err.to_string())
            }
            ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                Self::Encoding(err.to_string())
            }
            _ => Self::InvalidSignature(err.to_string()),
        }
    }
}

impl From<openssl::error::ErrorStack> for CodecError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::InvalidKey(err.to_string())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(CodecError::malformed("two parts").is_encoding_error());
        assert!(CodecError::encoding("bad base64").is_encoding_error());
        assert!(CodecError::decryption("tag mismatch").is_cryptographic_error());
        assert!(!CodecError::Expired.is_cryptographic_error());
        assert!(!CodecError::Expired.is_encoding_error());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(CodecError::Expired.to_string(), "Token expired");
        assert_eq!(
            CodecError::invalid_signature("signature mismatch").to_string(),
            "Invalid token signature: signature mismatch"
        );
    }
}
