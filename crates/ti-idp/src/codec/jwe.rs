//! Compact JWE envelopes.
//!
//! Two key management modes are supported:
//!
//! - `ECDH-ES` with `A256GCM`: ephemeral-static key agreement against the
//!   IDP's published encryption key (brainpoolP256r1), with the content key
//!   derived by the Concat KDF (SHA-256, one round).
//! - `dir` with `A256GCM`: a pre-shared 256-bit key, used for the token key
//!   that protects access and id tokens returned by the token endpoint.
//!
//! The additional authenticated data is always the ASCII of the base64url
//! protected header.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::ec::{EcPublicKey, EcSecretKey};
use super::error::CodecError;
use super::jwk::Jwk;
use crate::crypto::{b64url, b64url_decode, random_bytes};

/// Key agreement algorithm for envelopes addressed to the IDP.
pub const ALG_ECDH_ES: &str = "ECDH-ES";

/// Direct symmetric key algorithm.
pub const ALG_DIR: &str = "dir";

/// Content encryption algorithm.
pub const ENC_A256GCM: &str = "A256GCM";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Protected header of a compact JWE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JweHeader {
    /// Key management algorithm.
    pub alg: String,

    /// Content encryption algorithm.
    pub enc: String,

    /// Ephemeral public key (`ECDH-ES` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epk: Option<Jwk>,

    /// Content type of the plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,

    /// Expiry of the enclosed token, copied into the header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Recipient key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Optional header members for a new envelope.
#[derive(Debug, Clone, Default)]
pub struct JweOptions {
    /// Content type of the plaintext.
    pub cty: Option<String>,
    /// Expiry of the enclosed token.
    pub exp: Option<i64>,
    /// Recipient key identifier.
    pub kid: Option<String>,
}

impl JweOptions {
    /// Sets the content type.
    #[must_use]
    pub fn with_cty(mut self, cty: impl Into<String>) -> Self {
        self.cty = Some(cty.into());
        self
    }

    /// Sets the expiry.
    #[must_use]
    pub fn with_exp(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    /// Sets the recipient key identifier.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }
}

/// Compact JWE operations.
pub struct Jwe;

impl Jwe {
    /// Encrypts `payload` for the holder of `recipient`'s private key.
    ///
    /// # Errors
    /// Returns `Encryption` if the cipher fails, `Encoding` if the header
    /// cannot be serialized.
    pub fn encrypt(
        payload: &[u8],
        recipient: &EcPublicKey,
        options: JweOptions,
    ) -> Result<String, CodecError> {
        let ephemeral = EcSecretKey::generate(recipient.curve())
            .map_err(|e| CodecError::encryption(e.to_string()))?;
        let shared = ephemeral
            .diffie_hellman(recipient)
            .map_err(|e| CodecError::encryption(e.to_string()))?;
        let cek = concat_kdf(&shared);

        let header = JweHeader {
            alg: ALG_ECDH_ES.to_string(),
            enc: ENC_A256GCM.to_string(),
            epk: Some(Jwk::from_public_key(&ephemeral.public_key()?)),
            cty: options.cty,
            exp: options.exp,
            kid: options.kid,
        };
        seal(&header, payload, &cek)
    }

    /// Decrypts an `ECDH-ES` envelope with the recipient's private key.
    ///
    /// # Errors
    /// Returns `Malformed`/`Encoding` for structural problems,
    /// `UnsupportedAlgorithm` for other modes and `Decryption` if the
    /// authentication tag does not verify.
    pub fn decrypt(compact: &str, recipient: &EcSecretKey) -> Result<Vec<u8>, CodecError> {
        let parts = Parts::split(compact)?;
        if parts.header.alg != ALG_ECDH_ES {
            return Err(CodecError::UnsupportedAlgorithm(parts.header.alg));
        }
        let epk = parts
            .header
            .epk
            .as_ref()
            .ok_or_else(|| CodecError::malformed("missing epk"))?
            .to_public_key()?;
        let shared = recipient.diffie_hellman(&epk)?;
        let cek = concat_kdf(&shared);
        parts.open(&cek)
    }

    /// Encrypts `payload` under a pre-shared 256-bit key.
    ///
    /// # Errors
    /// Returns `Encryption` if the cipher fails.
    pub fn encrypt_direct(
        payload: &[u8],
        key: &[u8; 32],
        options: JweOptions,
    ) -> Result<String, CodecError> {
        let header = JweHeader {
            alg: ALG_DIR.to_string(),
            enc: ENC_A256GCM.to_string(),
            epk: None,
            cty: options.cty,
            exp: options.exp,
            kid: options.kid,
        };
        seal(&header, payload, key)
    }

    /// Decrypts a `dir` envelope.
    ///
    /// # Errors
    /// Returns `Decryption` for a wrong key or tampered content.
    pub fn decrypt_direct(compact: &str, key: &[u8; 32]) -> Result<Vec<u8>, CodecError> {
        let parts = Parts::split(compact)?;
        if parts.header.alg != ALG_DIR {
            return Err(CodecError::UnsupportedAlgorithm(parts.header.alg));
        }
        parts.open(key)
    }

    /// Reads the protected header without decrypting.
    ///
    /// # Errors
    /// Returns `Malformed` or `Encoding`.
    pub fn header(compact: &str) -> Result<JweHeader, CodecError> {
        Ok(Parts::split(compact)?.header)
    }
}

struct Parts {
    header: JweHeader,
    header_b64: String,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

impl Parts {
    fn split(compact: &str) -> Result<Self, CodecError> {
        let parts: Vec<&str> = compact.split('.').collect();
        if parts.len() != 5 {
            return Err(CodecError::malformed(format!(
                "expected 5 segments, found {}",
                parts.len()
            )));
        }
        if !parts[1].is_empty() {
            return Err(CodecError::malformed("unexpected encrypted key"));
        }
        let header_bytes = b64url_decode(parts[0]).map_err(CodecError::encoding)?;
        let header: JweHeader = serde_json::from_slice(&header_bytes)?;
        if header.enc != ENC_A256GCM {
            return Err(CodecError::UnsupportedAlgorithm(header.enc));
        }
        let iv = b64url_decode(parts[2]).map_err(CodecError::encoding)?;
        if iv.len() != IV_LEN {
            return Err(CodecError::malformed("iv length"));
        }
        let tag = b64url_decode(parts[4]).map_err(CodecError::encoding)?;
        if tag.len() != TAG_LEN {
            return Err(CodecError::malformed("tag length"));
        }
        Ok(Self {
            header,
            header_b64: parts[0].to_string(),
            iv,
            ciphertext: b64url_decode(parts[3]).map_err(CodecError::encoding)?,
            tag,
        })
    }

    fn open(self, key: &[u8; 32]) -> Result<Vec<u8>, CodecError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CodecError::decryption("content key length"))?;
        let mut sealed = self.ciphertext;
        sealed.extend_from_slice(&self.tag);
        cipher
            .decrypt(
                Nonce::from_slice(&self.iv),
                Payload {
                    msg: &sealed,
                    aad: self.header_b64.as_bytes(),
                },
            )
            .map_err(|_| CodecError::decryption("authentication tag mismatch"))
    }
}

fn seal(header: &JweHeader, payload: &[u8], key: &[u8; 32]) -> Result<String, CodecError> {
    let header_b64 = b64url(&serde_json::to_vec(header)?);
    let iv = random_bytes::<IV_LEN>();
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CodecError::encryption("content key length"))?;
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: payload,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| CodecError::encryption("cipher failure"))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(format!(
        "{header_b64}..{}.{}.{}",
        b64url(&iv),
        b64url(&sealed),
        b64url(&tag)
    ))
}

/// Concat KDF (NIST SP 800-56A) for `ECDH-ES` with `A256GCM`, empty
/// `apu`/`apv`. A single SHA-256 round yields the 256-bit content key.
fn concat_kdf(shared_secret: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(shared_secret);
    hasher.update((ENC_A256GCM.len() as u32).to_be_bytes());
    hasher.update(ENC_A256GCM.as_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(256u32.to_be_bytes());
    Zeroizing::new(hasher.finalize().into())
}
