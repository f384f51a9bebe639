use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::apdu::{CommandApdu, ResponseApdu, StatusWord};
use super::channel::{ConnectedChannel, transmit};
use super::credential::{Can, Pin, Puk, format2_block};
use super::error::CardError;
use super::pace;
use super::secure_messaging::SecureMessaging;
use crate::codec::JwsSigner;
use crate::crypto::sha256;
use crate::trust::Certificate;

/// AID of the signature application.
pub(crate) const AID_ESIGN: [u8; 10] = [0xA0, 0x00, 0x00, 0x01, 0x67, 0x45, 0x53, 0x49, 0x47, 0x4E];
/// File identifier of the authentication certificate.
pub(crate) const FID_AUT_CERTIFICATE: [u8; 2] = [0xC5, 0x04];
/// Password reference of the cardholder PIN.
pub(crate) const PIN_REFERENCE: u8 = 0x01;
/// Key reference of the authentication key.
pub(crate) const KEY_REFERENCE_AUT: u8 = 0x84;

pub(crate) const INS_VERIFY: u8 = 0x20;
pub(crate) const INS_CHANGE_REFERENCE_DATA: u8 = 0x24;
pub(crate) const INS_RESET_RETRY_COUNTER: u8 = 0x2C;
pub(crate) const INS_SELECT: u8 = 0xA4;
pub(crate) const INS_READ_BINARY: u8 = 0xB0;
pub(crate) const INS_PSO: u8 = 0x2A;

/// Outcome of CHANGE REFERENCE DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReferenceDataResponse {
    /// The PIN was changed.
    Success,
    /// The old PIN was wrong.
    WrongSecretWarning {
        /// Remaining attempts.
        retry_count: u8,
    },
    /// Access rule evaluation failed.
    SecurityStatusNotSatisfied,
    /// The card reported a write failure.
    MemoryFailure,
    /// The PIN is blocked.
    PasswordBlocked,
    /// The new PIN has an invalid length.
    WrongPasswordLength,
    /// The referenced password does not exist.
    PasswordNotFound,
    /// Any other status.
    UnknownFailure,
}

impl From<StatusWord> for ChangeReferenceDataResponse {
    fn from(sw: StatusWord) -> Self {
        match sw {
            StatusWord::SUCCESS => Self::Success,
            sw if sw.retries_left().is_some() => Self::WrongSecretWarning {
                retry_count: sw.retries_left().unwrap_or_default(),
            },
            StatusWord::SECURITY_STATUS_NOT_SATISFIED => Self::SecurityStatusNotSatisfied,
            StatusWord::MEMORY_FAILURE => Self::MemoryFailure,
            StatusWord::BLOCKED => Self::PasswordBlocked,
            StatusWord::WRONG_LENGTH => Self::WrongPasswordLength,
            StatusWord::REFERENCED_DATA_NOT_FOUND => Self::PasswordNotFound,
            _ => Self::UnknownFailure,
        }
    }
}

/// Outcome of RESET RETRY COUNTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRetryCounterResponse {
    /// The retry counter was reset.
    Success,
    /// The PUK was wrong.
    WrongSecretWarning {
        /// Remaining attempts.
        retry_count: u8,
    },
    /// Access rule evaluation failed.
    SecurityStatusNotSatisfied,
    /// The card reported a write failure.
    MemoryFailure,
    /// The PUK cannot be used any more.
    CommandBlocked,
    /// The new PIN has an invalid length.
    WrongPasswordLength,
    /// The referenced password does not exist.
    PasswordNotFound,
    /// Any other status.
    UnknownFailure,
}

impl From<StatusWord> for ResetRetryCounterResponse {
    fn from(sw: StatusWord) -> Self {
        match sw {
            StatusWord::SUCCESS => Self::Success,
            sw if sw.retries_left().is_some() => Self::WrongSecretWarning {
                retry_count: sw.retries_left().unwrap_or_default(),
            },
            StatusWord::SECURITY_STATUS_NOT_SATISFIED => Self::SecurityStatusNotSatisfied,
            StatusWord::MEMORY_FAILURE => Self::MemoryFailure,
            StatusWord::BLOCKED => Self::CommandBlocked,
            StatusWord::WRONG_LENGTH => Self::WrongPasswordLength,
            StatusWord::REFERENCED_DATA_NOT_FOUND => Self::PasswordNotFound,
            _ => Self::UnknownFailure,
        }
    }
}

/// How RESET RETRY COUNTER treats the PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetRetryCounterMode {
    /// Only reset the counter.
    WithoutNewPin,
    /// Reset the counter and set a new PIN.
    WithNewPin(Pin),
}

/// An established secure channel to a card.
///
/// Holds the reader's single-session guard. Dropping the session closes
/// the channel and releases the guard.
pub struct SecureSession {
    channel: ConnectedChannel,
    sm: SecureMessaging,
    read_chunk_size: u8,
    signature_key_selected: bool,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession").finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Runs PACE on a freshly connected channel.
    pub(crate) async fn establish(
        mut channel: ConnectedChannel,
        can: &Can,
        read_chunk_size: u8,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Self, CardError> {
        let keys = pace::establish(channel.as_mut(), can).await?;
        tracing::debug!("Secure channel established");
        Ok(Self {
            channel,
            sm: SecureMessaging::new(keys),
            read_chunk_size,
            signature_key_selected: false,
            _guard: guard,
        })
    }

    async fn transmit(&mut self, command: CommandApdu) -> Result<ResponseApdu, CardError> {
        let wrapped = self.sm.protect(&command)?;
        let response = transmit(self.channel.as_mut(), &wrapped).await?;
        self.sm.unprotect(&response)
    }

    /// Verifies the cardholder PIN.
    ///
    /// # Errors
    ///
    /// Returns `WrongPin` with the remaining attempts, `PinBlocked` once the
    /// counter is exhausted, or the other VERIFY failures.
    pub async fn verify_pin(&mut self, pin: &Pin) -> Result<(), CardError> {
        let block = format2_block(pin.expose());
        let response = self
            .transmit(CommandApdu::new(0x00, INS_VERIFY, 0x00, PIN_REFERENCE).with_data(block.to_vec()))
            .await?;
        match CardError::from_verify_status(response.sw) {
            Ok(()) => {
                tracing::debug!("PIN verified");
                Ok(())
            }
            Err(e) => {
                tracing::info!(error = %e, "PIN verification failed");
                Err(e)
            }
        }
    }

    /// Reads the authentication certificate.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedCard` if the file is missing and `Certificate`
    /// if its content is not a certificate.
    pub async fn read_authentication_certificate(&mut self) -> Result<Certificate, CardError> {
        let response = self
            .transmit(CommandApdu::new(0x00, INS_SELECT, 0x04, 0x0C).with_data(AID_ESIGN.to_vec()))
            .await?;
        if !response.sw.is_success() {
            return Err(CardError::UnsupportedCard(format!(
                "signature application missing ({})",
                response.sw
            )));
        }
        let response = self
            .transmit(
                CommandApdu::new(0x00, INS_SELECT, 0x02, 0x0C).with_data(FID_AUT_CERTIFICATE.to_vec()),
            )
            .await?;
        if !response.sw.is_success() {
            return Err(CardError::UnsupportedCard(format!(
                "authentication certificate missing ({})",
                response.sw
            )));
        }

        let mut der = Vec::new();
        let mut expected: Option<usize> = None;
        loop {
            let offset = der.len();
            if offset > 0x7FFF {
                return Err(CardError::protocol("certificate exceeds READ BINARY range"));
            }
            let command = CommandApdu::new(0x00, INS_READ_BINARY, (offset >> 8) as u8, offset as u8)
                .with_le(usize::from(self.read_chunk_size));
            let response = self.transmit(command).await?;
            if response.sw != StatusWord::SUCCESS && response.sw != StatusWord::END_OF_FILE {
                return Err(CardError::UnexpectedStatus(response.sw));
            }
            if response.data.is_empty() {
                break;
            }
            der.extend_from_slice(&response.data);
            if expected.is_none() {
                expected = der_length(&der);
            }
            match expected {
                Some(total) if der.len() >= total => {
                    der.truncate(total);
                    break;
                }
                _ if response.sw == StatusWord::END_OF_FILE => break,
                _ => {}
            }
        }
        let certificate = Certificate::from_der(der)?;
        tracing::debug!(subject = certificate.subject(), "Card certificate read");
        Ok(certificate)
    }

    /// Signs a SHA-256 digest with the authentication key.
    ///
    /// # Errors
    ///
    /// Returns `SecurityStatusNotSatisfied` if the PIN was not verified.
    pub async fn sign_digest(&mut self, digest: &[u8; 32]) -> Result<Vec<u8>, CardError> {
        if !self.signature_key_selected {
            let mut data = vec![0x84, 0x01, KEY_REFERENCE_AUT];
            data.extend_from_slice(&[0x80, 0x01, 0x00]);
            let response = self
                .transmit(CommandApdu::new(0x00, pace::INS_MSE, 0x41, 0xB6).with_data(data))
                .await?;
            if !response.sw.is_success() {
                return Err(CardError::UnexpectedStatus(response.sw));
            }
            self.signature_key_selected = true;
        }
        let response = self
            .transmit(
                CommandApdu::new(0x00, INS_PSO, 0x9E, 0x9A)
                    .with_data(digest.to_vec())
                    .with_le(256),
            )
            .await?;
        match response.sw {
            StatusWord::SUCCESS if response.data.len() == 64 => Ok(response.data),
            StatusWord::SUCCESS => Err(CardError::protocol(format!(
                "signature of {} bytes",
                response.data.len()
            ))),
            StatusWord::SECURITY_STATUS_NOT_SATISFIED => Err(CardError::SecurityStatusNotSatisfied),
            other => Err(CardError::UnexpectedStatus(other)),
        }
    }

    /// Changes the PIN.
    ///
    /// # Errors
    ///
    /// Only transport and protocol failures are errors; card verdicts are
    /// returned as [`ChangeReferenceDataResponse`].
    pub async fn change_reference_data(
        &mut self,
        old: &Pin,
        new: &Pin,
    ) -> Result<ChangeReferenceDataResponse, CardError> {
        let mut data = zeroize::Zeroizing::new(format2_block(old.expose()).to_vec());
        data.extend_from_slice(format2_block(new.expose()).as_slice());
        let response = self
            .transmit(
                CommandApdu::new(0x00, INS_CHANGE_REFERENCE_DATA, 0x00, PIN_REFERENCE)
                    .with_data(data.to_vec()),
            )
            .await?;
        let outcome = ChangeReferenceDataResponse::from(response.sw);
        tracing::info!(?outcome, "Change reference data");
        Ok(outcome)
    }

    /// Resets the PIN retry counter with the PUK.
    ///
    /// # Errors
    ///
    /// Only transport and protocol failures are errors; card verdicts are
    /// returned as [`ResetRetryCounterResponse`].
    pub async fn reset_retry_counter(
        &mut self,
        puk: &Puk,
        mode: &ResetRetryCounterMode,
    ) -> Result<ResetRetryCounterResponse, CardError> {
        let mut data = zeroize::Zeroizing::new(format2_block(puk.expose()).to_vec());
        let p1 = match mode {
            ResetRetryCounterMode::WithoutNewPin => 0x01,
            ResetRetryCounterMode::WithNewPin(pin) => {
                data.extend_from_slice(format2_block(pin.expose()).as_slice());
                0x00
            }
        };
        let response = self
            .transmit(
                CommandApdu::new(0x00, INS_RESET_RETRY_COUNTER, p1, PIN_REFERENCE)
                    .with_data(data.to_vec()),
            )
            .await?;
        let outcome = ResetRetryCounterResponse::from(response.sw);
        tracing::info!(?outcome, "Reset retry counter");
        Ok(outcome)
    }
}

#[async_trait]
impl JwsSigner for SecureSession {
    type Error = CardError;

    async fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, CardError> {
        self.sign_digest(&sha256(message)).await
    }
}

/// Total length of a DER object from its header, if the header is complete.
fn der_length(der: &[u8]) -> Option<usize> {
    let first = *der.get(1)?;
    if first < 0x80 {
        return Some(2 + usize::from(first));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 || count > 3 || der.len() < 2 + count {
        return None;
    }
    let len = der[2..2 + count]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Some(2 + count + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_der_length() {
        assert_eq!(der_length(&[0x30, 0x05]), Some(7));
        assert_eq!(der_length(&[0x30, 0x82, 0x01, 0x00]), Some(260));
        assert_eq!(der_length(&[0x30, 0x82, 0x01]), None);
        assert_eq!(der_length(&[0x30]), None);
    }

    #[test]
    fn test_admin_status_mapping() {
        assert_eq!(
            ChangeReferenceDataResponse::from(StatusWord(0x63C1)),
            ChangeReferenceDataResponse::WrongSecretWarning { retry_count: 1 }
        );
        assert_eq!(
            ChangeReferenceDataResponse::from(StatusWord::BLOCKED),
            ChangeReferenceDataResponse::PasswordBlocked
        );
        assert_eq!(
            ResetRetryCounterResponse::from(StatusWord::BLOCKED),
            ResetRetryCounterResponse::CommandBlocked
        );
        assert_eq!(
            ResetRetryCounterResponse::from(StatusWord::WRONG_LENGTH),
            ResetRetryCounterResponse::WrongPasswordLength
        );
        assert_eq!(
            ResetRetryCounterResponse::from(StatusWord(0x6F00)),
            ResetRetryCounterResponse::UnknownFailure
        );
    }
}
