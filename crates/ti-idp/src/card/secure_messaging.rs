//! ISO 7816-4 secure messaging with AES-256 as used after PACE.
//!
//! The send sequence counter (SSC) is a 16-byte big-endian counter starting
//! at zero; it is incremented before every command and before every
//! response. A protected command has `CLA | 0x0C` and carries
//!
//! - `87`: `01 || AES-CBC(K_enc, IV, pad(data))` with `IV = AES(K_enc, SSC)`,
//! - `97`: the plain `Le`,
//! - `8E`: the first 8 bytes of `CMAC(K_mac, pad(SSC || pad(header) || 87 || 97))`.
//!
//! A protected response carries `87`, `99` (the plain status word) and
//! `8E` over `pad(SSC || 87 || 99)`. Padding is ISO/IEC 9797-1 method 2.

use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{Cipher, Crypter, Mode};
use zeroize::Zeroizing;

use super::apdu::{CommandApdu, ResponseApdu, StatusWord, find_tlv, tlv};
use super::error::CardError;

const SM_CLA: u8 = 0x0C;
const BLOCK: usize = 16;
const MAC_LEN: usize = 8;
const PADDING_INDICATOR: u8 = 0x01;

const TAG_CRYPTOGRAM: u8 = 0x87;
const TAG_LE: u8 = 0x97;
const TAG_STATUS: u8 = 0x99;
const TAG_MAC: u8 = 0x8E;

/// Keys derived from the PACE shared secret.
pub(crate) struct SessionKeys {
    pub(crate) enc: Zeroizing<[u8; 32]>,
    pub(crate) mac: Zeroizing<[u8; 32]>,
}

impl SessionKeys {
    /// `K = SHA-256(x || counter)` with counter 1 for `K_enc`, 2 for `K_mac`.
    pub(crate) fn derive(shared_x: &[u8]) -> Self {
        Self {
            enc: Zeroizing::new(kdf(shared_x, 1)),
            mac: Zeroizing::new(kdf(shared_x, 2)),
        }
    }
}

/// Key derivation shared by the password key and the session keys.
pub(crate) fn kdf(secret: &[u8], counter: u32) -> [u8; 32] {
    let mut input = Zeroizing::new(Vec::with_capacity(secret.len() + 4));
    input.extend_from_slice(secret);
    input.extend_from_slice(&counter.to_be_bytes());
    crate::crypto::sha256(&input)
}

/// AES without implicit padding.
pub(crate) fn aes(
    cipher: Cipher,
    mode: Mode,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CardError> {
    if data.len() % BLOCK != 0 {
        return Err(CardError::protocol("AES input is not block aligned"));
    }
    let mut crypter = Crypter::new(cipher, mode, key, iv)?;
    crypter.pad(false);
    let mut out = Zeroizing::new(vec![0u8; data.len() + cipher.block_size()]);
    let mut count = crypter.update(data, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

/// AES-CMAC truncated to 8 bytes.
pub(crate) fn cmac(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN], CardError> {
    let key = PKey::cmac(&Cipher::aes_256_cbc(), key)?;
    let mut signer = Signer::new_without_digest(&key)?;
    signer.update(data)?;
    let full = signer.sign_to_vec()?;
    full.get(..MAC_LEN)
        .and_then(|mac| <[u8; MAC_LEN]>::try_from(mac).ok())
        .ok_or_else(|| CardError::protocol("short CMAC"))
}

/// Constant-time check of a truncated CMAC.
pub(crate) fn cmac_matches(key: &[u8], data: &[u8], mac: &[u8]) -> bool {
    match cmac(key, data) {
        Ok(expected) => mac.len() == MAC_LEN && memcmp::eq(&expected, mac),
        Err(_) => false,
    }
}

/// ISO/IEC 9797-1 padding method 2.
pub(crate) fn pad(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + BLOCK);
    out.extend_from_slice(data);
    out.push(0x80);
    while out.len() % BLOCK != 0 {
        out.push(0x00);
    }
    out
}

fn unpad(data: &[u8]) -> Result<&[u8], CardError> {
    let end = data
        .iter()
        .rposition(|byte| *byte != 0x00)
        .filter(|&at| data[at] == 0x80)
        .ok_or_else(|| CardError::protocol("invalid padding"))?;
    Ok(&data[..end])
}

fn encode_le(le: usize) -> Vec<u8> {
    match le {
        256 => vec![0x00],
        le if le < 256 => vec![le as u8],
        le if le >= 65536 => vec![0x00, 0x00],
        le => (le as u16).to_be_bytes().to_vec(),
    }
}

fn decode_le(bytes: &[u8]) -> Result<usize, CardError> {
    match bytes {
        [0x00] => Ok(256),
        &[le] => Ok(usize::from(le)),
        [0x00, 0x00] => Ok(65536),
        &[high, low] => Ok(usize::from(u16::from_be_bytes([high, low]))),
        _ => Err(CardError::protocol("invalid Le data object")),
    }
}

/// One side of a secure messaging channel.
pub(crate) struct SecureMessaging {
    keys: SessionKeys,
    ssc: [u8; BLOCK],
}

impl SecureMessaging {
    pub(crate) fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            ssc: [0u8; BLOCK],
        }
    }

    fn increment(&mut self) -> [u8; BLOCK] {
        for byte in self.ssc.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        self.ssc
    }

    fn iv(&self, ssc: &[u8; BLOCK]) -> Result<Zeroizing<Vec<u8>>, CardError> {
        aes(Cipher::aes_256_ecb(), Mode::Encrypt, self.keys.enc.as_slice(), None, ssc)
    }

    fn encrypt(&self, ssc: &[u8; BLOCK], data: &[u8]) -> Result<Vec<u8>, CardError> {
        let iv = self.iv(ssc)?;
        let padded = Zeroizing::new(pad(data));
        let encrypted = aes(
            Cipher::aes_256_cbc(),
            Mode::Encrypt,
            self.keys.enc.as_slice(),
            Some(iv.as_slice()),
            &padded,
        )?;
        let mut value = Vec::with_capacity(1 + encrypted.len());
        value.push(PADDING_INDICATOR);
        value.extend_from_slice(&encrypted);
        Ok(tlv(TAG_CRYPTOGRAM, &value))
    }

    fn decrypt(&self, ssc: &[u8; BLOCK], cryptogram: &[u8]) -> Result<Zeroizing<Vec<u8>>, CardError> {
        let Some((&PADDING_INDICATOR, encrypted)) = cryptogram.split_first() else {
            return Err(CardError::protocol("unsupported padding indicator"));
        };
        let iv = self.iv(ssc)?;
        let padded = aes(
            Cipher::aes_256_cbc(),
            Mode::Decrypt,
            self.keys.enc.as_slice(),
            Some(iv.as_slice()),
            encrypted,
        )?;
        Ok(Zeroizing::new(unpad(&padded)?.to_vec()))
    }

    fn mac(&self, ssc: &[u8; BLOCK], parts: &[&[u8]]) -> Result<[u8; MAC_LEN], CardError> {
        cmac(self.keys.mac.as_slice(), &pad(&mac_input(ssc, parts)))
    }

    fn check_mac(&self, ssc: &[u8; BLOCK], parts: &[&[u8]], mac: &[u8]) -> bool {
        cmac_matches(self.keys.mac.as_slice(), &pad(&mac_input(ssc, parts)), mac)
    }

    /// Host side: wraps a plain command.
    pub(crate) fn protect(&mut self, command: &CommandApdu) -> Result<CommandApdu, CardError> {
        let ssc = self.increment();
        let cla = command.cla | SM_CLA;
        let cryptogram = if command.data.is_empty() {
            Vec::new()
        } else {
            self.encrypt(&ssc, &command.data)?
        };
        let le = command
            .le
            .map(|le| tlv(TAG_LE, &encode_le(le)))
            .unwrap_or_default();
        let header = pad(&[cla, command.ins, command.p1, command.p2]);
        let mac = self.mac(&ssc, &[header.as_slice(), cryptogram.as_slice(), le.as_slice()])?;

        let mut data = cryptogram;
        data.extend_from_slice(&le);
        data.extend(tlv(TAG_MAC, &mac));
        let extended = command.le.is_some_and(|le| le > 223) || data.len() > 255;
        Ok(CommandApdu::new(cla, command.ins, command.p1, command.p2)
            .with_data(data)
            .with_le(if extended { 65536 } else { 256 }))
    }

    /// Host side: unwraps the card's answer to a protected command.
    pub(crate) fn unprotect(&mut self, response: &ResponseApdu) -> Result<ResponseApdu, CardError> {
        let ssc = self.increment();
        let Some(mac) = find_tlv(&response.data, TAG_MAC)? else {
            return Err(CardError::protocol(format!(
                "secure messaging rejected by card ({})",
                response.sw
            )));
        };
        let cryptogram = find_tlv(&response.data, TAG_CRYPTOGRAM)?;
        let status = find_tlv(&response.data, TAG_STATUS)?
            .ok_or_else(|| CardError::protocol("protected response without status"))?;
        let cryptogram_object = cryptogram
            .map(|value| tlv(TAG_CRYPTOGRAM, value))
            .unwrap_or_default();
        let status_object = tlv(TAG_STATUS, status);
        if !self.check_mac(&ssc, &[cryptogram_object.as_slice(), status_object.as_slice()], mac) {
            return Err(CardError::protocol("secure messaging authentication failed"));
        }
        let &[sw1, sw2] = status else {
            return Err(CardError::protocol("status data object of wrong length"));
        };
        let data = match cryptogram {
            Some(cryptogram) => self.decrypt(&ssc, cryptogram)?.to_vec(),
            None => Vec::new(),
        };
        Ok(ResponseApdu::new(data, StatusWord(u16::from_be_bytes([sw1, sw2]))))
    }

    /// Card side: unwraps a protected command.
    pub(crate) fn open_command(&mut self, wrapped: &CommandApdu) -> Result<CommandApdu, CardError> {
        if wrapped.cla & SM_CLA != SM_CLA {
            return Err(CardError::protocol("command is not protected"));
        }
        let ssc = self.increment();
        let mac = find_tlv(&wrapped.data, TAG_MAC)?
            .ok_or_else(|| CardError::protocol("protected command without MAC"))?;
        let cryptogram = find_tlv(&wrapped.data, TAG_CRYPTOGRAM)?;
        let le = find_tlv(&wrapped.data, TAG_LE)?;
        let cryptogram_object = cryptogram
            .map(|value| tlv(TAG_CRYPTOGRAM, value))
            .unwrap_or_default();
        let le_object = le.map(|value| tlv(TAG_LE, value)).unwrap_or_default();
        let header = pad(&[wrapped.cla, wrapped.ins, wrapped.p1, wrapped.p2]);
        let parts = [header.as_slice(), cryptogram_object.as_slice(), le_object.as_slice()];
        if !self.check_mac(&ssc, &parts, mac) {
            return Err(CardError::protocol("secure messaging authentication failed"));
        }

        let mut command = CommandApdu::new(wrapped.cla & !SM_CLA, wrapped.ins, wrapped.p1, wrapped.p2);
        if let Some(cryptogram) = cryptogram {
            command.data = self.decrypt(&ssc, cryptogram)?.to_vec();
        }
        if let Some(le) = le {
            command.le = Some(decode_le(le)?);
        }
        Ok(command)
    }

    /// Card side: seals a plain response.
    pub(crate) fn seal_response(&mut self, response: &ResponseApdu) -> Result<ResponseApdu, CardError> {
        let ssc = self.increment();
        let cryptogram = if response.data.is_empty() {
            Vec::new()
        } else {
            self.encrypt(&ssc, &response.data)?
        };
        let status = tlv(TAG_STATUS, &response.sw.to_bytes());
        let mac = self.mac(&ssc, &[cryptogram.as_slice(), status.as_slice()])?;

        let mut data = cryptogram;
        data.extend_from_slice(&status);
        data.extend(tlv(TAG_MAC, &mac));
        Ok(ResponseApdu::new(data, response.sw))
    }
}

fn mac_input(ssc: &[u8; BLOCK], parts: &[&[u8]]) -> Vec<u8> {
    let mut input = ssc.to_vec();
    for part in parts {
        input.extend_from_slice(part);
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecureMessaging, SecureMessaging) {
        (
            SecureMessaging::new(SessionKeys::derive(&[7u8; 32])),
            SecureMessaging::new(SessionKeys::derive(&[7u8; 32])),
        )
    }

    #[test]
    fn test_command_response_exchange() {
        let (mut host, mut card) = pair();
        let command = CommandApdu::new(0x00, 0x20, 0x00, 0x01).with_data(vec![0x26, 0x12, 0x34]);

        let wrapped = host.protect(&command).unwrap();
        assert_eq!(wrapped.cla, 0x0C);
        assert!(!wrapped.data.windows(3).any(|w| w == [0x26, 0x12, 0x34]));
        assert_eq!(wrapped.data[0], TAG_CRYPTOGRAM);

        let opened = card.open_command(&wrapped).unwrap();
        assert_eq!(opened, command);

        let response = ResponseApdu::new(vec![1, 2, 3], StatusWord(0x63C2));
        let sealed = card.seal_response(&response).unwrap();
        assert_eq!(sealed.sw, StatusWord(0x63C2));
        assert_eq!(host.unprotect(&sealed).unwrap(), response);
    }

    #[test]
    fn test_le_and_empty_data_survive() {
        let (mut host, mut card) = pair();
        let command = CommandApdu::new(0x00, 0xB0, 0x01, 0x00).with_le(255);
        let wrapped = host.protect(&command).unwrap();
        assert!(find_tlv(&wrapped.data, TAG_CRYPTOGRAM).unwrap().is_none());
        assert_eq!(find_tlv(&wrapped.data, TAG_LE).unwrap(), Some(&[0xFF][..]));
        assert_eq!(card.open_command(&wrapped).unwrap(), command);

        let sealed = card.seal_response(&ResponseApdu::status(StatusWord::SUCCESS)).unwrap();
        assert_eq!(
            host.unprotect(&sealed).unwrap(),
            ResponseApdu::status(StatusWord::SUCCESS)
        );
    }

    #[test]
    fn test_replayed_command_is_rejected() {
        let (mut host, mut card) = pair();
        let command = CommandApdu::new(0x00, 0xB0, 0x00, 0x00).with_le(256);
        let wrapped = host.protect(&command).unwrap();
        assert!(card.open_command(&wrapped).is_ok());
        assert!(card.open_command(&wrapped).is_err());
    }

    #[test]
    fn test_modified_header_fails_mac() {
        let (mut host, mut card) = pair();
        let mut wrapped = host
            .protect(&CommandApdu::new(0x00, 0x20, 0x00, 0x01).with_data(vec![1, 2, 3]))
            .unwrap();
        wrapped.p2 = 0x02;
        assert!(matches!(card.open_command(&wrapped), Err(CardError::Protocol(_))));
    }

    #[test]
    fn test_modified_response_status_fails_mac() {
        let (mut host, mut card) = pair();
        let wrapped = host.protect(&CommandApdu::new(0x00, 0x20, 0x00, 0x01)).unwrap();
        card.open_command(&wrapped).unwrap();
        let mut sealed = card
            .seal_response(&ResponseApdu::status(StatusWord(0x63C1)))
            .unwrap();
        let at = sealed
            .data
            .windows(2)
            .position(|w| w == [0x63, 0xC1])
            .unwrap();
        sealed.data[at + 1] = 0xC2;
        assert!(matches!(host.unprotect(&sealed), Err(CardError::Protocol(_))));
    }

    #[test]
    fn test_plain_error_response_is_rejected() {
        let (mut host, _) = pair();
        let plain = ResponseApdu::status(StatusWord::SM_DATA_INCORRECT);
        assert!(matches!(host.unprotect(&plain), Err(CardError::Protocol(_))));
    }

    #[test]
    fn test_padding() {
        assert_eq!(pad(&[]).len(), BLOCK);
        assert_eq!(pad(&[0u8; 16]).len(), 2 * BLOCK);
        let padded = pad(&[1, 2, 0]);
        assert_eq!(&padded[..4], &[1, 2, 0, 0x80]);
        assert_eq!(unpad(&padded).unwrap(), &[1, 2, 0]);
        assert!(unpad(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_ssc_carries() {
        let mut sm = SecureMessaging::new(SessionKeys::derive(b"shared"));
        sm.ssc[15] = 0xFF;
        let ssc = sm.increment();
        assert_eq!(&ssc[14..], &[0x01, 0x00]);
    }

    #[test]
    fn test_kdf_counters_differ() {
        let keys = SessionKeys::derive(b"shared");
        assert_ne!(*keys.enc, *keys.mac);
        assert_eq!(kdf(b"123123", 3), kdf(b"123123", 3));
    }

    #[test]
    fn test_cmac_truncation_and_mismatch() {
        let key = [0x2bu8; 32];
        let mac = cmac(&key, b"message").unwrap();
        assert!(cmac_matches(&key, b"message", &mac));
        assert!(!cmac_matches(&key, b"massage", &mac));
        assert!(!cmac_matches(&key, b"message", &mac[..4]));
    }
}
