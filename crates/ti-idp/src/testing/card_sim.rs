//! In-process smartcard speaking the same PACE and secure-messaging
//! protocol as the real cards, with a brainpoolP256r1 authentication key
//! and PIN and PUK counters.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use openssl::ec::EcPoint;
use zeroize::Zeroizing;

use crate::card::apdu::{CommandApdu, ResponseApdu, StatusWord, find_tlv, tlv};
use crate::card::pace::{
    self, DOMAIN_BRAINPOOL_P256R1, INS_GENERAL_AUTHENTICATE, INS_MSE, NONCE_LEN, PACE_OID,
    PaceDomain, TAG_EPHEMERAL_CARD, TAG_EPHEMERAL_HOST, TAG_MAP_CARD, TAG_MAP_HOST, TAG_NONCE,
    TAG_TOKEN_CARD, TAG_TOKEN_HOST,
};
use crate::card::secure_messaging::{SecureMessaging, SessionKeys};
use crate::card::session::{
    AID_ESIGN, FID_AUT_CERTIFICATE, INS_CHANGE_REFERENCE_DATA, INS_PSO, INS_READ_BINARY,
    INS_RESET_RETRY_COUNTER, INS_SELECT, INS_VERIFY, PIN_REFERENCE,
};
use crate::card::{CardChannel, CardError, CardReader};
use crate::codec::EcSecretKey;
use crate::crypto::random_bytes;
use crate::testing::pki::Issued;
use crate::trust::Certificate;

const PIN_ATTEMPTS: u8 = 3;
const PUK_ATTEMPTS: u8 = 3;
const PUK_USAGES: u8 = 10;

struct CardState {
    can: String,
    pin: String,
    puk: String,
    pin_retries: u8,
    puk_retries: u8,
    puk_usages: u8,
    certificate: Certificate,
    key: EcSecretKey,
    present: bool,
    delay: Option<Duration>,
    connects: usize,
    disconnects: usize,
    signatures: usize,
}

/// A simulated card presented to a simulated reader.
///
/// Clones share the same card.
#[derive(Clone)]
pub struct SimulatedCard {
    state: Arc<Mutex<CardState>>,
}

impl SimulatedCard {
    /// A card holding `issued` as authentication certificate and key.
    #[must_use]
    pub fn new(issued: &Issued, can: &str, pin: &str, puk: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                can: can.to_string(),
                pin: pin.to_string(),
                puk: puk.to_string(),
                pin_retries: PIN_ATTEMPTS,
                puk_retries: PUK_ATTEMPTS,
                puk_usages: PUK_USAGES,
                certificate: issued.certificate.clone(),
                key: issued.signing_key(),
                present: true,
                delay: None,
                connects: 0,
                disconnects: 0,
                signatures: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The card's authentication certificate.
    #[must_use]
    pub fn certificate(&self) -> Certificate {
        self.state().certificate.clone()
    }

    /// Remaining PIN attempts.
    #[must_use]
    pub fn pin_retries(&self) -> u8 {
        self.state().pin_retries
    }

    /// Remaining PUK usages.
    #[must_use]
    pub fn puk_usages(&self) -> u8 {
        self.state().puk_usages
    }

    /// Whether `pin` is the current PIN.
    #[must_use]
    pub fn has_pin(&self, pin: &str) -> bool {
        self.state().pin == pin
    }

    /// Sets the remaining PIN attempts.
    pub fn set_pin_retries(&self, retries: u8) {
        self.state().pin_retries = retries;
    }

    /// Sets the remaining PUK usages.
    pub fn set_puk_usages(&self, usages: u8) {
        self.state().puk_usages = usages;
    }

    /// Takes the card away from the reader or puts it back.
    pub fn set_present(&self, present: bool) {
        self.state().present = present;
    }

    /// Delays every response, to exercise timeouts and cancellation.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Number of channels opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Number of channels closed.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Number of signatures created.
    #[must_use]
    pub fn signatures(&self) -> usize {
        self.state().signatures
    }
}

#[async_trait]
impl CardReader for SimulatedCard {
    async fn connect(&self) -> Result<Box<dyn CardChannel>, CardError> {
        let mut state = self.state();
        if !state.present {
            return Err(CardError::connection("no card in field"));
        }
        state.connects += 1;
        Ok(Box::new(SimulatedChannel {
            card: self.clone(),
            connected: true,
            pace: PaceStep::Idle,
            sm: None,
            application_selected: false,
            certificate_selected: false,
            pin_verified: false,
            key_selected: false,
        }))
    }
}

enum PaceStep {
    Idle,
    Configured,
    NonceSent(Zeroizing<[u8; NONCE_LEN]>),
    Mapped(EcPoint),
    Agreed {
        keys: SessionKeys,
        host_public: Vec<u8>,
        card_public: Vec<u8>,
    },
    Established,
}

struct SimulatedChannel {
    card: SimulatedCard,
    connected: bool,
    pace: PaceStep,
    sm: Option<SecureMessaging>,
    application_selected: bool,
    certificate_selected: bool,
    pin_verified: bool,
    key_selected: bool,
}

#[async_trait]
impl CardChannel for SimulatedChannel {
    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, CardError> {
        let delay = self.card.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.connected || !self.card.state().present {
            return Err(CardError::connection("card left the field"));
        }
        let command = CommandApdu::parse(command)?;
        let opened = self.sm.as_mut().map(|sm| sm.open_command(&command));
        let response = match opened {
            None => self.pace(&command),
            Some(Err(_)) => status(StatusWord::SM_DATA_INCORRECT),
            Some(Ok(plain)) => {
                let response = self.process(&plain);
                match self.sm.as_mut() {
                    Some(sm) => sm.seal_response(&response)?,
                    None => response,
                }
            }
        };
        Ok(response.to_bytes())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.sm = None;
            self.card.state().disconnects += 1;
        }
    }
}

fn status(sw: StatusWord) -> ResponseApdu {
    ResponseApdu::status(sw)
}

fn dynamic_auth(tag: u8, value: &[u8]) -> ResponseApdu {
    ResponseApdu::new(tlv(0x7C, &tlv(tag, value)), StatusWord::SUCCESS)
}

/// Digits of a format-2 PIN block, or `None` if it is malformed.
fn decode_block(block: &[u8]) -> Option<String> {
    if block.len() != 8 || block[0] & 0xF0 != 0x20 {
        return None;
    }
    let len = usize::from(block[0] & 0x0F);
    let mut digits = String::with_capacity(len);
    for i in 0..len {
        let byte = *block.get(1 + i / 2)?;
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        if nibble > 9 {
            return None;
        }
        digits.push(char::from(b'0' + nibble));
    }
    Some(digits)
}

fn valid_pin(pin: &str) -> bool {
    (6..=8).contains(&pin.len())
}

impl SimulatedChannel {
    fn pace(&mut self, command: &CommandApdu) -> ResponseApdu {
        if command.ins == INS_MSE && command.p1 == 0xC1 && command.p2 == 0xA4 {
            let domain = find_tlv(&command.data, 0x84);
            return match find_tlv(&command.data, 0x80) {
                Ok(Some(oid))
                    if oid == PACE_OID && matches!(domain, Ok(Some([DOMAIN_BRAINPOOL_P256R1]))) =>
                {
                    self.pace = PaceStep::Configured;
                    status(StatusWord::SUCCESS)
                }
                _ => status(StatusWord::REFERENCED_DATA_NOT_FOUND),
            };
        }
        if command.ins != INS_GENERAL_AUTHENTICATE {
            return status(StatusWord::SECURITY_STATUS_NOT_SATISFIED);
        }
        let Ok(Some(outer)) = find_tlv(&command.data, 0x7C) else {
            return status(StatusWord::WRONG_PARAMETERS);
        };
        let outer = outer.to_vec();
        match self.pace_step(&outer) {
            Ok(response) => response,
            Err(_) => {
                self.pace = PaceStep::Idle;
                status(StatusWord::CONDITIONS_NOT_SATISFIED)
            }
        }
    }

    fn pace_step(&mut self, data: &[u8]) -> Result<ResponseApdu, CardError> {
        let step = std::mem::replace(&mut self.pace, PaceStep::Idle);
        let domain = PaceDomain::brainpool_p256r1()?;
        match step {
            PaceStep::Configured => {
                required(data, TAG_NONCE)?;
                let nonce = Zeroizing::new(random_bytes::<NONCE_LEN>());
                let can = self.card.state().can.clone();
                let z = pace::encrypt_nonce(&pace::password_key(&can), nonce.as_slice())?;
                self.pace = PaceStep::NonceSent(nonce);
                Ok(dynamic_auth(TAG_NONCE, &z))
            }
            PaceStep::NonceSent(nonce) => {
                let host = domain.decode(&required(data, TAG_MAP_HOST)?)?;
                let secret = domain.ephemeral()?;
                let card_public = domain.encode(&*(domain.public_point(&secret)?))?;
                let generator = domain.mapped_generator(nonce.as_slice(), &secret, &host)?;
                self.pace = PaceStep::Mapped(generator);
                Ok(dynamic_auth(TAG_MAP_CARD, &card_public))
            }
            PaceStep::Mapped(generator) => {
                let host_public = required(data, TAG_EPHEMERAL_HOST)?;
                let host = domain.decode(&host_public)?;
                let secret = domain.ephemeral()?;
                let card_public = domain.encode(&*(domain.multiply(&generator, &secret)?))?;
                if card_public == host_public {
                    return Err(CardError::protocol("host echoed the card key"));
                }
                let keys = domain.agree(&secret, &host)?;
                self.pace = PaceStep::Agreed {
                    keys,
                    host_public,
                    card_public: card_public.clone(),
                };
                Ok(dynamic_auth(TAG_EPHEMERAL_CARD, &card_public))
            }
            PaceStep::Agreed {
                keys,
                host_public,
                card_public,
            } => {
                let token = required(data, TAG_TOKEN_HOST)?;
                if !pace::verify_token(&keys.mac, &card_public, &token) {
                    return Ok(status(StatusWord::AUTHENTICATION_FAILED));
                }
                let card_token = pace::auth_token(&keys.mac, &host_public)?;
                self.sm = Some(SecureMessaging::new(keys));
                self.pace = PaceStep::Established;
                Ok(dynamic_auth(TAG_TOKEN_CARD, &card_token))
            }
            _ => Err(CardError::protocol("unexpected PACE step")),
        }
    }

    fn process(&mut self, command: &CommandApdu) -> ResponseApdu {
        match command.ins {
            INS_SELECT => self.select(command),
            INS_READ_BINARY => self.read_binary(command),
            INS_VERIFY if command.p2 == PIN_REFERENCE => self.verify(command),
            INS_MSE if command.p1 == 0x41 && command.p2 == 0xB6 => {
                self.key_selected = matches!(find_tlv(&command.data, 0x84), Ok(Some([0x84])));
                if self.key_selected {
                    status(StatusWord::SUCCESS)
                } else {
                    status(StatusWord::REFERENCED_DATA_NOT_FOUND)
                }
            }
            INS_PSO if command.p1 == 0x9E && command.p2 == 0x9A => self.sign(command),
            INS_CHANGE_REFERENCE_DATA if command.p2 == PIN_REFERENCE => self.change_pin(command),
            INS_RESET_RETRY_COUNTER if command.p2 == PIN_REFERENCE => self.unblock(command),
            INS_VERIFY | INS_CHANGE_REFERENCE_DATA | INS_RESET_RETRY_COUNTER => {
                status(StatusWord::REFERENCED_DATA_NOT_FOUND)
            }
            _ => status(StatusWord::INS_NOT_SUPPORTED),
        }
    }

    fn select(&mut self, command: &CommandApdu) -> ResponseApdu {
        match command.p1 {
            0x04 if command.data == AID_ESIGN => {
                self.application_selected = true;
                self.certificate_selected = false;
                status(StatusWord::SUCCESS)
            }
            0x02 if self.application_selected && command.data == FID_AUT_CERTIFICATE => {
                self.certificate_selected = true;
                status(StatusWord::SUCCESS)
            }
            _ => status(StatusWord::FILE_NOT_FOUND),
        }
    }

    fn read_binary(&self, command: &CommandApdu) -> ResponseApdu {
        if !self.certificate_selected {
            return status(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let der = self.card.state().certificate.der().to_vec();
        let offset = (usize::from(command.p1) << 8) | usize::from(command.p2);
        if offset > der.len() {
            return status(StatusWord::WRONG_PARAMETERS);
        }
        let want = command.le.unwrap_or(256);
        let end = (offset + want).min(der.len());
        let sw = if end - offset < want {
            StatusWord::END_OF_FILE
        } else {
            StatusWord::SUCCESS
        };
        ResponseApdu::new(&der[offset..end], sw)
    }

    fn verify(&mut self, command: &CommandApdu) -> ResponseApdu {
        let mut state = self.card.state();
        if state.pin_retries == 0 {
            return status(StatusWord::BLOCKED);
        }
        let Some(pin) = decode_block(&command.data) else {
            return status(StatusWord::WRONG_LENGTH);
        };
        if pin == state.pin {
            state.pin_retries = PIN_ATTEMPTS;
            self.pin_verified = true;
            status(StatusWord::SUCCESS)
        } else {
            state.pin_retries -= 1;
            self.pin_verified = false;
            status(StatusWord::wrong_secret(state.pin_retries))
        }
    }

    fn sign(&mut self, command: &CommandApdu) -> ResponseApdu {
        if !self.pin_verified {
            return status(StatusWord::SECURITY_STATUS_NOT_SATISFIED);
        }
        if !self.key_selected {
            return status(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        if command.data.len() != 32 {
            return status(StatusWord::WRONG_LENGTH);
        }
        let mut state = self.card.state();
        match state.key.sign_digest(&command.data) {
            Ok(signature) => {
                state.signatures += 1;
                ResponseApdu::new(signature, StatusWord::SUCCESS)
            }
            Err(_) => status(StatusWord::MEMORY_FAILURE),
        }
    }

    fn change_pin(&mut self, command: &CommandApdu) -> ResponseApdu {
        if command.data.len() != 16 {
            return status(StatusWord::WRONG_LENGTH);
        }
        let mut state = self.card.state();
        if state.pin_retries == 0 {
            return status(StatusWord::BLOCKED);
        }
        let (Some(old), Some(new)) = (
            decode_block(&command.data[..8]),
            decode_block(&command.data[8..]),
        ) else {
            return status(StatusWord::WRONG_LENGTH);
        };
        if old != state.pin {
            state.pin_retries -= 1;
            return status(StatusWord::wrong_secret(state.pin_retries));
        }
        if !valid_pin(&new) {
            return status(StatusWord::WRONG_LENGTH);
        }
        state.pin = new;
        state.pin_retries = PIN_ATTEMPTS;
        status(StatusWord::SUCCESS)
    }

    fn unblock(&mut self, command: &CommandApdu) -> ResponseApdu {
        let with_new_pin = match (command.p1, command.data.len()) {
            (0x00, 16) => true,
            (0x01, 8) => false,
            _ => return status(StatusWord::WRONG_LENGTH),
        };
        let mut state = self.card.state();
        if state.puk_usages == 0 || state.puk_retries == 0 {
            return status(StatusWord::BLOCKED);
        }
        let Some(puk) = decode_block(&command.data[..8]) else {
            return status(StatusWord::WRONG_LENGTH);
        };
        if puk != state.puk {
            state.puk_retries -= 1;
            return status(StatusWord::wrong_secret(state.puk_retries));
        }
        if with_new_pin {
            match decode_block(&command.data[8..]) {
                Some(pin) if valid_pin(&pin) => state.pin = pin,
                _ => return status(StatusWord::WRONG_LENGTH),
            }
        }
        state.puk_retries = PUK_ATTEMPTS;
        state.puk_usages -= 1;
        state.pin_retries = PIN_ATTEMPTS;
        status(StatusWord::SUCCESS)
    }
}

fn required(data: &[u8], tag: u8) -> Result<Vec<u8>, CardError> {
    find_tlv(data, tag)?
        .map(<[u8]>::to_vec)
        .ok_or_else(|| CardError::protocol(format!("missing data object {tag:02X}")))
}
