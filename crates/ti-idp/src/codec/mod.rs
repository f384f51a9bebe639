//! Token codec for the signed and encrypted envelopes exchanged with the IDP.
//!
//! # Overview
//!
//! - [`ec`]: brainpoolP256r1 and P-256 keys.
//! - [`jws`]: compact JWS with `BP256R1` (IDP, health card) and `ES256`
//!   (device keys). Tokens signed by a smartcard or device key are
//!   assembled through the [`JwsSigner`] trait.
//! - [`jwe`]: compact JWE with `ECDH-ES`/`A256GCM` and `dir`/`A256GCM`.
//! - [`jwk`]: EC public keys as published by the IDP.
//!
//! # Example
//!
//! ```ignore
//! use ti_idp::codec::{Jwe, JweOptions, nest};
//!
//! let envelope = Jwe::encrypt(&nest(&signed_challenge)?, &idp_enc_key, JweOptions::default())?;
//! ```

pub mod ec;
pub mod error;
pub mod jwe;
pub mod jwk;
pub mod jws;

pub use ec::{Curve, EcPublicKey, EcSecretKey};
pub use error::CodecError;
pub use jwe::{Jwe, JweHeader, JweOptions};
pub use jwk::Jwk;
pub use jws::{
    ALG_BP256R1, ALG_ES256, CTY_NJWT, Jws, JwsHeader, JwsSigner, VerifiedToken, decode_verified,
    nest, unnest,
};
