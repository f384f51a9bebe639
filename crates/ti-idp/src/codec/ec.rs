//! Elliptic-curve keys on the curves the protocol uses.
//!
//! The IDP signature and encryption keys, the health card and the PKI all
//! use brainpoolP256r1. Device keys for biometric pairing use P-256.
//! Both are backed by OpenSSL so that one key type covers signing, key
//! agreement and certificate handling.

use std::fmt;

use elliptic_curve::sec1::ToEncodedPoint;
use openssl::bn::{BigNum, BigNumContext, BigNumContextRef};
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcGroupRef, EcKey, EcPoint, EcPointRef, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use zeroize::Zeroizing;

use super::error::CodecError;
use crate::crypto::sha256;

/// Byte length of a field element and of a scalar.
pub const COORDINATE_LEN: usize = 32;

/// Byte length of a raw `r || s` signature.
pub const SIGNATURE_LEN: usize = 2 * COORDINATE_LEN;

/// A supported named curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    /// NIST P-256 (device keys).
    P256,
    /// brainpoolP256r1 (IDP, health card, PKI).
    BrainpoolP256r1,
}

impl Curve {
    /// Curve name in a JWK `crv` member.
    #[must_use]
    pub const fn jwk_name(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::BrainpoolP256r1 => "BP-256",
        }
    }

    /// JWS `alg` for ECDSA with SHA-256 on this curve.
    #[must_use]
    pub const fn jws_alg(self) -> &'static str {
        match self {
            Self::P256 => "ES256",
            Self::BrainpoolP256r1 => "BP256R1",
        }
    }

    /// Looks up a curve by its JWK name.
    #[must_use]
    pub fn from_jwk_name(name: &str) -> Option<Self> {
        [Self::P256, Self::BrainpoolP256r1]
            .into_iter()
            .find(|curve| curve.jwk_name() == name)
    }

    pub(crate) const fn nid(self) -> Nid {
        match self {
            Self::P256 => Nid::X9_62_PRIME256V1,
            Self::BrainpoolP256r1 => Nid::BRAINPOOL_P256R1,
        }
    }

    fn from_nid(nid: Nid) -> Option<Self> {
        [Self::P256, Self::BrainpoolP256r1]
            .into_iter()
            .find(|curve| curve.nid() == nid)
    }

    pub(crate) fn group(self) -> Result<EcGroup, CodecError> {
        Ok(EcGroup::from_curve_name(self.nid())?)
    }
}

/// A validated public point, kept in uncompressed SEC1 form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EcPublicKey {
    curve: Curve,
    point: Vec<u8>,
}

impl EcPublicKey {
    /// Parses an uncompressed or compressed SEC1 point.
    ///
    /// # Errors
    /// Returns `InvalidKey` if the point is not on the curve.
    pub fn from_sec1(curve: Curve, bytes: &[u8]) -> Result<Self, CodecError> {
        let group = curve.group()?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, bytes, &mut ctx)
            .map_err(|_| CodecError::invalid_key("point not on curve"))?;
        Self::from_point(curve, &group, &point, &mut ctx)
    }

    /// Builds a key from big-endian affine coordinates.
    ///
    /// # Errors
    /// Returns `InvalidKey` for a wrong coordinate length or a point off
    /// the curve.
    pub fn from_coordinates(curve: Curve, x: &[u8], y: &[u8]) -> Result<Self, CodecError> {
        if x.len() != COORDINATE_LEN || y.len() != COORDINATE_LEN {
            return Err(CodecError::invalid_key("coordinate length"));
        }
        let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
        sec1.push(0x04);
        sec1.extend_from_slice(x);
        sec1.extend_from_slice(y);
        Self::from_sec1(curve, &sec1)
    }

    /// Parses a DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    /// Returns `InvalidKey` for non-EC keys and unsupported curves.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CodecError> {
        let key = PKey::public_key_from_der(der)
            .map_err(|_| CodecError::invalid_key("unreadable subject public key info"))?;
        let ec = key
            .ec_key()
            .map_err(|_| CodecError::invalid_key("not an EC key"))?;
        let curve = ec
            .group()
            .curve_name()
            .and_then(Curve::from_nid)
            .ok_or_else(|| CodecError::invalid_key("unsupported curve"))?;
        let mut ctx = BigNumContext::new()?;
        Self::from_point(curve, ec.group(), ec.public_key(), &mut ctx)
    }

    pub(crate) fn from_point(
        curve: Curve,
        group: &EcGroupRef,
        point: &EcPointRef,
        ctx: &mut BigNumContextRef,
    ) -> Result<Self, CodecError> {
        if point.is_infinity(group) {
            return Err(CodecError::invalid_key("point at infinity"));
        }
        let key = EcKey::from_public_key(group, point)?;
        key.check_key()
            .map_err(|_| CodecError::invalid_key("point not on curve"))?;
        let point = point.to_bytes(group, PointConversionForm::UNCOMPRESSED, ctx)?;
        Ok(Self { curve, point })
    }

    /// The curve this key lives on.
    #[must_use]
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Uncompressed SEC1 encoding (`04 || x || y`).
    #[must_use]
    pub fn to_sec1(&self) -> &[u8] {
        &self.point
    }

    /// Big-endian x coordinate.
    #[must_use]
    pub fn x(&self) -> &[u8] {
        &self.point[1..=COORDINATE_LEN]
    }

    /// Big-endian y coordinate.
    #[must_use]
    pub fn y(&self) -> &[u8] {
        &self.point[1 + COORDINATE_LEN..]
    }

    /// DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL rejects the key.
    pub fn to_spki_der(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.pkey()?.public_key_to_der()?)
    }

    pub(crate) fn ec_key(&self) -> Result<EcKey<Public>, CodecError> {
        let group = self.curve.group()?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, &self.point, &mut ctx)?;
        Ok(EcKey::from_public_key(&group, &point)?)
    }

    pub(crate) fn pkey(&self) -> Result<PKey<Public>, CodecError> {
        Ok(PKey::from_ec_key(self.ec_key()?)?)
    }

    /// Verifies a raw `r || s` ECDSA signature over SHA-256 of `message`.
    ///
    /// # Errors
    /// Returns `InvalidSignature` if the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CodecError> {
        self.verify_digest(&sha256(message), signature)
    }

    /// Verifies a raw `r || s` ECDSA signature over a precomputed digest.
    ///
    /// # Errors
    /// Returns `InvalidSignature` if the signature does not verify.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8]) -> Result<(), CodecError> {
        if signature.len() != SIGNATURE_LEN {
            return Err(CodecError::invalid_signature(format!(
                "expected {SIGNATURE_LEN} signature bytes, found {}",
                signature.len()
            )));
        }
        let r = BigNum::from_slice(&signature[..COORDINATE_LEN])?;
        let s = BigNum::from_slice(&signature[COORDINATE_LEN..])?;
        let signature = EcdsaSig::from_private_components(r, s)?;
        match signature.verify(digest, &*(self.ec_key()?)) {
            Ok(true) => Ok(()),
            _ => Err(CodecError::invalid_signature("signature mismatch")),
        }
    }
}

impl From<&p256::PublicKey> for EcPublicKey {
    fn from(key: &p256::PublicKey) -> Self {
        Self {
            curve: Curve::P256,
            point: key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for EcPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcPublicKey")
            .field("curve", &self.curve)
            .field("x", &hex::encode(self.x()))
            .finish()
    }
}

/// A private key on one of the supported curves.
#[derive(Clone)]
pub struct EcSecretKey {
    curve: Curve,
    key: EcKey<Private>,
}

impl EcSecretKey {
    /// Generates a fresh key.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn generate(curve: Curve) -> Result<Self, CodecError> {
        let group = curve.group()?;
        Ok(Self {
            curve,
            key: EcKey::generate(&group)?,
        })
    }

    /// Loads a key from its big-endian private scalar.
    ///
    /// # Errors
    /// Returns `InvalidKey` for a zero or out-of-range scalar.
    pub fn from_scalar(curve: Curve, scalar: &[u8]) -> Result<Self, CodecError> {
        let group = curve.group()?;
        let mut ctx = BigNumContext::new()?;
        let private = BigNum::from_slice(scalar)?;
        let mut public = EcPoint::new(&group)?;
        public.mul_generator2(&group, &private, &mut ctx)?;
        let key = EcKey::from_private_components(&group, &private, &public)?;
        key.check_key()
            .map_err(|_| CodecError::invalid_key("private scalar out of range"))?;
        Ok(Self { curve, key })
    }

    /// Big-endian private scalar, padded to the field length.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn to_scalar(&self) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        Ok(Zeroizing::new(
            self.key.private_key().to_vec_padded(COORDINATE_LEN as i32)?,
        ))
    }

    /// The curve this key lives on.
    #[must_use]
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// The matching public key.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn public_key(&self) -> Result<EcPublicKey, CodecError> {
        let mut ctx = BigNumContext::new()?;
        EcPublicKey::from_point(self.curve, self.key.group(), self.key.public_key(), &mut ctx)
    }

    /// Signs SHA-256 of `message` and returns the raw `r || s` signature.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.sign_digest(&sha256(message))
    }

    /// Signs a precomputed digest and returns the raw `r || s` signature.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CodecError> {
        let signature = EcdsaSig::sign(digest, &self.key)?;
        let mut raw = signature.r().to_vec_padded(COORDINATE_LEN as i32)?;
        raw.extend(signature.s().to_vec_padded(COORDINATE_LEN as i32)?);
        Ok(raw)
    }

    /// ECDH shared secret: the x coordinate of the shared point.
    ///
    /// # Errors
    /// Returns `InvalidKey` if `peer` lies on another curve.
    pub fn diffie_hellman(&self, peer: &EcPublicKey) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        if peer.curve() != self.curve {
            return Err(CodecError::invalid_key(format!(
                "peer key on {} instead of {}",
                peer.curve().jwk_name(),
                self.curve.jwk_name()
            )));
        }
        let own = self.pkey()?;
        let peer = peer.pkey()?;
        let mut deriver = Deriver::new(&own)?;
        deriver.set_peer(&peer)?;
        Ok(Zeroizing::new(deriver.derive_to_vec()?))
    }

    /// PKCS#8 PEM encoding.
    ///
    /// # Errors
    /// Returns `InvalidKey` if OpenSSL fails.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CodecError> {
        let pem = self.pkey()?.private_key_to_pem_pkcs8()?;
        String::from_utf8(pem)
            .map(Zeroizing::new)
            .map_err(|_| CodecError::invalid_key("PEM is not UTF-8"))
    }

    pub(crate) fn pkey(&self) -> Result<PKey<Private>, CodecError> {
        Ok(PKey::from_ec_key(self.key.clone())?)
    }
}

impl fmt::Debug for EcSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcSecretKey")
            .field("curve", &self.curve)
            .finish_non_exhaustive()
    }
}
