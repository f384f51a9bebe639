//! PACE with the CAN on brainpoolP256r1, generic mapping
//! (`id-PACE-ECDH-GM-AES-CBC-CMAC-256`).
//!
//! 1. MSE:SET AT selects the protocol, the CAN as password and the
//!    standardized domain parameters.
//! 2. The card sends `z = AES-CBC(K_pi, 0, s)` with `K_pi = KDF(CAN, 3)`;
//!    the host decrypts the nonce `s`.
//! 3. Mapping: both sides exchange ephemeral keys on `G`; `G' = s*G + H`
//!    with `H` their shared point.
//! 4. Key agreement on `G'` yields `K_enc` and `K_mac`.
//! 5. Mutual authentication: each side proves `K_mac` with a CMAC over the
//!    public key data object of the peer's ephemeral key. A wrong CAN makes
//!    the card reject the host token with `6300`.

use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use openssl::ec::{EcGroup, EcPoint, EcPointRef, PointConversionForm};
use openssl::nid::Nid;
use openssl::symm::{Cipher, Mode};
use zeroize::Zeroizing;

use super::apdu::{CommandApdu, ResponseApdu, StatusWord, find_tlv, tlv};
use super::channel::{CardChannel, transmit};
use super::credential::Can;
use super::error::CardError;
use super::secure_messaging::{SessionKeys, aes, cmac, cmac_matches, kdf};

/// id-PACE-ECDH-GM-AES-CBC-CMAC-256.
pub(crate) const PACE_OID: [u8; 10] = [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x04];
/// Password reference of the CAN.
pub(crate) const PASSWORD_CAN: u8 = 0x02;
/// Standardized domain parameter identifier of brainpoolP256r1.
pub(crate) const DOMAIN_BRAINPOOL_P256R1: u8 = 0x0D;
/// Length of the nonce `s`.
pub(crate) const NONCE_LEN: usize = 16;

/// Instruction of GENERAL AUTHENTICATE.
pub(crate) const INS_GENERAL_AUTHENTICATE: u8 = 0x86;
/// Instruction of MANAGE SECURITY ENVIRONMENT.
pub(crate) const INS_MSE: u8 = 0x22;

const TAG_DYNAMIC_AUTH: u8 = 0x7C;
pub(crate) const TAG_NONCE: u8 = 0x80;
pub(crate) const TAG_MAP_HOST: u8 = 0x81;
pub(crate) const TAG_MAP_CARD: u8 = 0x82;
pub(crate) const TAG_EPHEMERAL_HOST: u8 = 0x83;
pub(crate) const TAG_EPHEMERAL_CARD: u8 = 0x84;
pub(crate) const TAG_TOKEN_HOST: u8 = 0x85;
pub(crate) const TAG_TOKEN_CARD: u8 = 0x86;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// Password key `K_pi`.
pub(crate) fn password_key(can: &str) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(kdf(can.as_bytes(), 3))
}

/// `AES-CBC(K_pi, 0, s)`, the form in which the card sends the nonce.
pub(crate) fn encrypt_nonce(password_key: &[u8; 32], nonce: &[u8]) -> Result<Vec<u8>, CardError> {
    let encrypted = aes(
        Cipher::aes_256_cbc(),
        Mode::Encrypt,
        password_key,
        Some(ZERO_IV.as_slice()),
        nonce,
    )?;
    Ok(encrypted.to_vec())
}

/// Recovers the nonce from `z`.
pub(crate) fn decrypt_nonce(password_key: &[u8; 32], z: &[u8]) -> Result<Zeroizing<Vec<u8>>, CardError> {
    if z.len() != NONCE_LEN {
        return Err(CardError::protocol("unexpected nonce length"));
    }
    aes(Cipher::aes_256_cbc(), Mode::Decrypt, password_key, Some(ZERO_IV.as_slice()), z)
}

/// Public key data object `7F49 { 06 oid, 86 point }` authenticated by
/// the tokens.
pub(crate) fn public_key_data(point: &[u8]) -> Vec<u8> {
    let mut inner = tlv(0x06, &PACE_OID);
    inner.extend(tlv(0x86, point));
    let mut out = vec![0x7F];
    out.extend(tlv(0x49, &inner));
    out
}

/// Authentication token over the peer's ephemeral public key.
pub(crate) fn auth_token(mac_key: &[u8; 32], peer_public: &[u8]) -> Result<[u8; 8], CardError> {
    cmac(mac_key, &public_key_data(peer_public))
}

/// Constant-time check of an authentication token.
pub(crate) fn verify_token(mac_key: &[u8; 32], peer_public: &[u8], token: &[u8]) -> bool {
    cmac_matches(mac_key, &public_key_data(peer_public), token)
}

/// The curve PACE runs on, with the group arithmetic both sides need.
pub(crate) struct PaceDomain {
    group: EcGroup,
    order: BigNum,
}

impl PaceDomain {
    pub(crate) fn brainpool_p256r1() -> Result<Self, CardError> {
        let group = EcGroup::from_curve_name(Nid::BRAINPOOL_P256R1)?;
        let mut order = BigNum::new()?;
        let mut ctx = BigNumContext::new()?;
        group.order(&mut order, &mut ctx)?;
        Ok(Self { group, order })
    }

    /// A uniformly random scalar in `[1, n - 1]`.
    pub(crate) fn ephemeral(&self) -> Result<BigNum, CardError> {
        let mut upper = BigNum::new()?;
        upper.checked_sub(&self.order, &*(BigNum::from_u32(1)?))?;
        let mut scalar = BigNum::new()?;
        upper.rand_range(&mut scalar)?;
        scalar.add_word(1)?;
        Ok(scalar)
    }

    /// `scalar * G` on the standard generator.
    pub(crate) fn public_point(&self, scalar: &BigNumRef) -> Result<EcPoint, CardError> {
        let mut ctx = BigNumContext::new()?;
        let mut point = EcPoint::new(&self.group)?;
        point.mul_generator2(&self.group, scalar, &mut ctx)?;
        Ok(point)
    }

    /// `scalar * base`.
    pub(crate) fn multiply(&self, base: &EcPointRef, scalar: &BigNumRef) -> Result<EcPoint, CardError> {
        let mut ctx = BigNumContext::new()?;
        let mut point = EcPoint::new(&self.group)?;
        point.mul2(&self.group, base, scalar, &mut ctx)?;
        Ok(point)
    }

    /// Generic mapping: `G' = s*G + own * peer`.
    pub(crate) fn mapped_generator(
        &self,
        nonce: &[u8],
        own: &BigNumRef,
        peer: &EcPointRef,
    ) -> Result<EcPoint, CardError> {
        let mut ctx = BigNumContext::new()?;
        let s = BigNum::from_slice(nonce)?;
        let mut generator = EcPoint::new(&self.group)?;
        generator.mul_full(&self.group, &s, peer, own, &mut ctx)?;
        if generator.is_infinity(&self.group) {
            return Err(CardError::protocol("degenerate mapped generator"));
        }
        Ok(generator)
    }

    /// Session keys from the x coordinate of `own * peer`.
    pub(crate) fn agree(&self, own: &BigNumRef, peer: &EcPointRef) -> Result<SessionKeys, CardError> {
        let shared = self.multiply(peer, own)?;
        if shared.is_infinity(&self.group) {
            return Err(CardError::protocol("degenerate key agreement"));
        }
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        shared.affine_coordinates(&self.group, &mut x, &mut y, &mut ctx)?;
        let x = Zeroizing::new(x.to_vec_padded(32)?);
        Ok(SessionKeys::derive(&x))
    }

    /// Uncompressed SEC1 encoding.
    pub(crate) fn encode(&self, point: &EcPointRef) -> Result<Vec<u8>, CardError> {
        if point.is_infinity(&self.group) {
            return Err(CardError::protocol("identity point"));
        }
        let mut ctx = BigNumContext::new()?;
        Ok(point.to_bytes(&self.group, PointConversionForm::UNCOMPRESSED, &mut ctx)?)
    }

    /// Parses a SEC1 point and checks that it lies on the curve.
    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<EcPoint, CardError> {
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&self.group, bytes, &mut ctx)
            .map_err(|_| CardError::protocol("invalid curve point"))?;
        if point.is_infinity(&self.group) || !point.is_on_curve(&self.group, &mut ctx)? {
            return Err(CardError::protocol("invalid curve point"));
        }
        Ok(point)
    }
}

async fn general_authenticate(
    channel: &mut dyn CardChannel,
    tag: u8,
    value: &[u8],
    last: bool,
) -> Result<ResponseApdu, CardError> {
    let cla = if last { 0x00 } else { 0x10 };
    let command = CommandApdu::new(cla, INS_GENERAL_AUTHENTICATE, 0x00, 0x00)
        .with_data(tlv(TAG_DYNAMIC_AUTH, &tlv(tag, value)))
        .with_le(256);
    transmit(channel, &command).await
}

fn dynamic_auth_value(response: &ResponseApdu, tag: u8) -> Result<Vec<u8>, CardError> {
    if !response.sw.is_success() {
        return Err(CardError::UnexpectedStatus(response.sw));
    }
    let outer = find_tlv(&response.data, TAG_DYNAMIC_AUTH)?
        .ok_or_else(|| CardError::protocol("missing dynamic authentication data"))?;
    find_tlv(outer, tag)?
        .map(<[u8]>::to_vec)
        .ok_or_else(|| CardError::protocol(format!("missing data object {tag:02X}")))
}

/// Runs PACE on `channel` and returns the session keys.
///
/// # Errors
///
/// Returns `WrongCan` if the card rejects the host token,
/// `UnsupportedCard` if it does not offer PACE, and `Protocol` for any
/// deviation including a card token that does not verify.
pub(crate) async fn establish(channel: &mut dyn CardChannel, can: &Can) -> Result<SessionKeys, CardError> {
    let mut mse = tlv(0x80, &PACE_OID);
    mse.extend(tlv(0x83, &[PASSWORD_CAN]));
    mse.extend(tlv(0x84, &[DOMAIN_BRAINPOOL_P256R1]));
    let response = transmit(channel, &CommandApdu::new(0x00, INS_MSE, 0xC1, 0xA4).with_data(mse)).await?;
    if !response.sw.is_success() {
        return Err(CardError::UnsupportedCard(format!(
            "PACE not available ({})",
            response.sw
        )));
    }
    let domain = PaceDomain::brainpool_p256r1()?;

    // Encrypted nonce
    let response = general_authenticate(channel, TAG_NONCE, &[], false).await?;
    let z = dynamic_auth_value(&response, TAG_NONCE)
        .map_err(|e| CardError::UnsupportedCard(e.to_string()))?;
    let nonce = decrypt_nonce(&password_key(can.expose()), &z)?;

    // Mapping
    let map_secret = domain.ephemeral()?;
    let map_public = domain.encode(&*(domain.public_point(&map_secret)?))?;
    let response = general_authenticate(channel, TAG_MAP_HOST, &map_public, false).await?;
    let card_map = domain.decode(&dynamic_auth_value(&response, TAG_MAP_CARD)?)?;
    let generator = domain.mapped_generator(&nonce, &map_secret, &card_map)?;

    // Key agreement
    let secret = domain.ephemeral()?;
    let host_public = domain.encode(&*(domain.multiply(&generator, &secret)?))?;
    let response = general_authenticate(channel, TAG_EPHEMERAL_HOST, &host_public, false).await?;
    let card_public = dynamic_auth_value(&response, TAG_EPHEMERAL_CARD)?;
    if card_public == host_public {
        return Err(CardError::protocol("card echoed the host key"));
    }
    let keys = domain.agree(&secret, &*(domain.decode(&card_public)?))?;

    // Mutual authentication
    let token = auth_token(&keys.mac, &card_public)?;
    let response = general_authenticate(channel, TAG_TOKEN_HOST, &token, true).await?;
    if response.sw == StatusWord::AUTHENTICATION_FAILED || response.sw.retries_left().is_some() {
        tracing::warn!("Card rejected the PACE authentication token");
        return Err(CardError::WrongCan);
    }
    let card_token = dynamic_auth_value(&response, TAG_TOKEN_CARD)?;
    if !verify_token(&keys.mac, &host_public, &card_token) {
        return Err(CardError::protocol("card authentication token does not verify"));
    }
    tracing::debug!("PACE channel established");
    Ok(keys)
}
