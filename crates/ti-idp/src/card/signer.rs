use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::channel::{CardReader, ConnectedChannel};
use super::credential::{Can, CardCredential, Pin, Puk};
use super::error::CardError;
use super::session::{
    ChangeReferenceDataResponse, ResetRetryCounterMode, ResetRetryCounterResponse, SecureSession,
};
use crate::biometric::{BiometricKeyCustodian, PairingSession, RegistrationData};
use crate::challenge::{IdpChallenge, SignedChallenge};
use crate::codec::{CTY_NJWT, Jws, JwsHeader, nest};
use crate::config::CardConfig;
use crate::trust::Certificate;

/// Signs IDP challenges with a smartcard.
///
/// Every operation runs in its own card session and is bounded by the
/// configured operation timeout and by the caller's cancellation token.
/// Only one session per reader can be open at a time; a second attempt
/// fails with [`CardError::SessionInProgress`] instead of queueing behind
/// the radio.
#[derive(Clone)]
pub struct SmartcardSigner {
    reader: Arc<dyn CardReader>,
    config: CardConfig,
    active: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SmartcardSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartcardSigner")
            .field("config", &self.config)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl SmartcardSigner {
    /// Creates a signer for `reader`.
    #[must_use]
    pub fn new(reader: Arc<dyn CardReader>, config: CardConfig) -> Self {
        Self {
            reader,
            config,
            active: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a card session is currently open.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.try_lock().is_err()
    }

    /// Connects to the card and establishes the secure channel with `can`.
    ///
    /// The returned session holds the reader; drop it to release the card.
    ///
    /// # Errors
    ///
    /// Returns `SessionInProgress`, `WrongCan`, `Connection`, `Timeout` or
    /// `Cancelled`.
    pub async fn open_secure_session(
        &self,
        can: &Can,
        cancel: &CancellationToken,
    ) -> Result<SecureSession, CardError> {
        self.run(cancel, self.connect(can)).await
    }

    /// Verifies the PIN and signs `challenge`.
    ///
    /// The signature is a JWS over the nested challenge token carrying the
    /// card's authentication certificate in `x5c`.
    ///
    /// # Errors
    ///
    /// Returns `WrongPin` with the remaining attempts, `PinBlocked`, any
    /// channel error of [`open_secure_session`](Self::open_secure_session)
    /// or a signing failure.
    pub async fn sign(
        &self,
        credential: CardCredential,
        challenge: &IdpChallenge,
        cancel: &CancellationToken,
    ) -> Result<SignedChallenge, CardError> {
        self.run(cancel, async move {
            let mut session = self.connect(&credential.can).await?;
            session.verify_pin(&credential.pin).await?;
            drop(credential);
            let certificate = session.read_authentication_certificate().await?;
            let signed = sign_challenge(&mut session, challenge, &certificate).await?;
            tracing::info!(subject = certificate.subject(), "Challenge signed by card");
            Ok(SignedChallenge {
                original: challenge.clone(),
                signed,
                certificate,
            })
        })
        .await
    }

    /// Signs `challenge` and the pairing data of `pairing` in one card
    /// session, binding the new device key to the card certificate.
    ///
    /// # Errors
    ///
    /// As [`sign`](Self::sign), plus `Pairing` if the registration cannot
    /// be assembled.
    pub async fn sign_for_pairing(
        &self,
        credential: CardCredential,
        challenge: &IdpChallenge,
        custodian: &BiometricKeyCustodian,
        pairing: &PairingSession,
        cancel: &CancellationToken,
    ) -> Result<(SignedChallenge, RegistrationData), CardError> {
        self.run(cancel, async move {
            let mut session = self.connect(&credential.can).await?;
            session.verify_pin(&credential.pin).await?;
            drop(credential);
            let certificate = session.read_authentication_certificate().await?;
            let signed = sign_challenge(&mut session, challenge, &certificate).await?;
            let registration = custodian
                .sign_pairing_session(pairing, &mut session, &certificate)
                .await?;
            tracing::info!(pairing = %pairing.id, "Challenge and pairing data signed by card");
            Ok((
                SignedChallenge {
                    original: challenge.clone(),
                    signed,
                    certificate,
                },
                registration,
            ))
        })
        .await
    }

    /// Changes the PIN from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Only channel failures are errors; the card's verdict is the
    /// returned response.
    pub async fn change_reference_data(
        &self,
        can: Can,
        old: Pin,
        new: Pin,
        cancel: &CancellationToken,
    ) -> Result<ChangeReferenceDataResponse, CardError> {
        self.run(cancel, async move {
            let mut session = self.connect(&can).await?;
            session.change_reference_data(&old, &new).await
        })
        .await
    }

    /// Unblocks the PIN with the PUK, optionally setting a new PIN.
    ///
    /// # Errors
    ///
    /// Only channel failures are errors; the card's verdict is the
    /// returned response.
    pub async fn reset_retry_counter(
        &self,
        can: Can,
        puk: Puk,
        mode: ResetRetryCounterMode,
        cancel: &CancellationToken,
    ) -> Result<ResetRetryCounterResponse, CardError> {
        self.run(cancel, async move {
            let mut session = self.connect(&can).await?;
            session.reset_retry_counter(&puk, &mode).await
        })
        .await
    }

    async fn connect(&self, can: &Can) -> Result<SecureSession, CardError> {
        let guard = Arc::clone(&self.active)
            .try_lock_owned()
            .map_err(|_| CardError::SessionInProgress)?;
        tracing::debug!("Connecting to card");
        let channel = ConnectedChannel::new(self.reader.connect().await?);
        SecureSession::establish(channel, can, self.config.read_chunk_size, guard).await
    }

    /// Drives `operation` until it completes, times out or is cancelled.
    /// Dropping the operation closes any channel it opened.
    async fn run<T, F>(&self, cancel: &CancellationToken, operation: F) -> Result<T, CardError>
    where
        F: Future<Output = Result<T, CardError>>,
    {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("Card operation cancelled");
                Err(CardError::Cancelled)
            }
            result = tokio::time::timeout(self.config.operation_timeout, operation) => {
                result.unwrap_or_else(|_| {
                    tracing::warn!(timeout = ?self.config.operation_timeout, "Card operation timed out");
                    Err(CardError::Timeout)
                })
            }
        }
    }
}

async fn sign_challenge(
    session: &mut SecureSession,
    challenge: &IdpChallenge,
    certificate: &Certificate,
) -> Result<String, CardError> {
    let curve = certificate.public_key()?.curve();
    let header = JwsHeader::for_curve(curve)
        .with_cty(CTY_NJWT)
        .with_x5c(vec![certificate.to_base64()]);
    let payload = nest(&challenge.challenge)?;
    Jws::sign_with(&header, &payload, session).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;
    use crate::biometric::{DeviceInformation, SoftwareKeyStore};
    use crate::challenge::ChallengeClaims;
    use crate::clock::FixedClock;
    use crate::codec::{decode_verified, unnest};
    use crate::profile::ProfileId;
    use crate::store::MemoryTokenStore;
    use crate::testing::card_sim::SimulatedCard;
    use crate::testing::pki::TestPki;

    const CAN: &str = "123123";
    const PIN: &str = "123456";
    const PUK: &str = "12345678";

    fn card() -> SimulatedCard {
        let pki = TestPki::new();
        SimulatedCard::new(&pki.issue_leaf("Erika Mustermann"), CAN, PIN, PUK)
    }

    fn signer(card: &SimulatedCard) -> SmartcardSigner {
        SmartcardSigner::new(Arc::new(card.clone()), CardConfig::default())
    }

    fn challenge() -> IdpChallenge {
        IdpChallenge {
            challenge: "challenge.token.sig".to_string(),
            claims: ChallengeClaims {
                exp: OffsetDateTime::now_utc().unix_timestamp() + 300,
                iat: None,
                token_type: Some("challenge".to_string()),
                state: None,
                nonce: None,
                code_challenge: None,
                scope: None,
                client_id: None,
                redirect_uri: None,
            },
            user_consent: None,
        }
    }

    fn credential(pin: &str) -> CardCredential {
        CardCredential::new(CAN, pin).unwrap()
    }

    #[tokio::test]
    async fn test_sign_returns_card_certificate_and_valid_signature() {
        let card = card();
        let signer = signer(&card);

        let signed = signer
            .sign(credential(PIN), &challenge(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(signed.certificate, card.certificate());
        let key = signed.certificate.verification_key().unwrap();
        let verified =
            decode_verified::<serde_json::Value>(&signed.signed, &key, OffsetDateTime::now_utc())
                .unwrap();
        assert_eq!(verified.header.cty.as_deref(), Some(CTY_NJWT));
        assert_eq!(verified.header.alg, crate::codec::ALG_BP256R1);
        assert_eq!(
            verified.header.x5c,
            Some(vec![card.certificate().to_base64()])
        );
        let payload = serde_json::to_vec(&verified.claims).unwrap();
        assert_eq!(unnest(&payload).unwrap(), "challenge.token.sig");
        assert_eq!(card.connects(), 1);
        assert_eq!(card.disconnects(), 1);
        assert!(!signer.is_busy());
    }

    #[tokio::test]
    async fn test_certificate_read_in_small_chunks() {
        let card = card();
        let config = CardConfig {
            read_chunk_size: 0x20,
            ..CardConfig::default()
        };
        let signer = SmartcardSigner::new(Arc::new(card.clone()), config);

        let signed = signer
            .sign(credential(PIN), &challenge(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(signed.certificate, card.certificate());
    }

    #[tokio::test]
    async fn test_wrong_pin_counts_down_to_blocked() {
        let card = card();
        let signer = signer(&card);
        let cancel = CancellationToken::new();

        for expected in [2u8, 1] {
            let err = signer
                .sign(credential("654321"), &challenge(), &cancel)
                .await
                .unwrap_err();
            assert_eq!(err, CardError::WrongPin { retries_left: expected });
        }
        let err = signer
            .sign(credential("654321"), &challenge(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CardError::PinBlocked);

        let err = signer
            .sign(credential(PIN), &challenge(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(card.signatures(), 0);
    }

    #[tokio::test]
    async fn test_correct_pin_resets_counter() {
        let card = card();
        let signer = signer(&card);
        let cancel = CancellationToken::new();

        let _ = signer.sign(credential("654321"), &challenge(), &cancel).await;
        assert_eq!(card.pin_retries(), 2);
        signer.sign(credential(PIN), &challenge(), &cancel).await.unwrap();
        assert_eq!(card.pin_retries(), 3);
    }

    #[tokio::test]
    async fn test_wrong_can_is_reported_and_channel_closed() {
        let card = card();
        let signer = signer(&card);

        let err = signer
            .sign(
                CardCredential::new("999999", PIN).unwrap(),
                &challenge(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err, CardError::WrongCan);
        assert_eq!(card.pin_retries(), 3);
        assert_eq!(card.connects(), card.disconnects());
    }

    #[tokio::test]
    async fn test_missing_card_is_a_connection_error() {
        let card = card();
        card.set_present(false);
        let err = signer(&card)
            .sign(credential(PIN), &challenge(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CardError::Connection(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_channel() {
        let card = card();
        card.set_response_delay(Some(Duration::from_millis(200)));
        let signer = signer(&card);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = signer
            .sign(credential(PIN), &challenge(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, CardError::Cancelled);
        assert_eq!(card.connects(), 1);
        assert_eq!(card.disconnects(), 1);
        assert!(!signer.is_busy());
    }

    #[tokio::test]
    async fn test_timeout_tears_down_channel() {
        let card = card();
        card.set_response_delay(Some(Duration::from_millis(200)));
        let config = CardConfig {
            operation_timeout: Duration::from_millis(50),
            ..CardConfig::default()
        };
        let signer = SmartcardSigner::new(Arc::new(card.clone()), config);

        let err = signer
            .sign(credential(PIN), &challenge(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, CardError::Timeout);
        assert_eq!(card.connects(), card.disconnects());
    }

    #[tokio::test]
    async fn test_only_one_session_at_a_time() {
        let card = card();
        let signer = signer(&card);
        let cancel = CancellationToken::new();

        let session = signer
            .open_secure_session(&Can::new(CAN).unwrap(), &cancel)
            .await
            .unwrap();
        assert!(signer.is_busy());
        let err = signer
            .sign(credential(PIN), &challenge(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CardError::SessionInProgress);

        drop(session);
        assert_eq!(card.disconnects(), 1);
        signer.sign(credential(PIN), &challenge(), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_signing_requires_verified_pin() {
        let card = card();
        let signer = signer(&card);
        let mut session = signer
            .open_secure_session(&Can::new(CAN).unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        let err = session.sign_digest(&[0u8; 32]).await.unwrap_err();
        assert_eq!(err, CardError::SecurityStatusNotSatisfied);
    }

    #[tokio::test]
    async fn test_change_pin() {
        let card = card();
        let signer = signer(&card);
        let cancel = CancellationToken::new();
        let can = Can::new(CAN).unwrap();

        let response = signer
            .change_reference_data(
                can.clone(),
                Pin::new("000000").unwrap(),
                Pin::new("87654321").unwrap(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ChangeReferenceDataResponse::WrongSecretWarning { retry_count: 2 }
        );

        let response = signer
            .change_reference_data(
                can,
                Pin::new(PIN).unwrap(),
                Pin::new("87654321").unwrap(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(response, ChangeReferenceDataResponse::Success);
        assert!(card.has_pin("87654321"));
        assert_eq!(card.pin_retries(), 3);
    }

    #[tokio::test]
    async fn test_change_pin_on_blocked_card() {
        let card = card();
        card.set_pin_retries(0);
        let response = signer(&card)
            .change_reference_data(
                Can::new(CAN).unwrap(),
                Pin::new(PIN).unwrap(),
                Pin::new("87654321").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response, ChangeReferenceDataResponse::PasswordBlocked);
    }

    #[tokio::test]
    async fn test_unblock_with_puk() {
        let card = card();
        card.set_pin_retries(0);
        let signer = signer(&card);
        let cancel = CancellationToken::new();

        let response = signer
            .reset_retry_counter(
                Can::new(CAN).unwrap(),
                Puk::new("87654321").unwrap(),
                ResetRetryCounterMode::WithoutNewPin,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ResetRetryCounterResponse::WrongSecretWarning { retry_count: 2 }
        );

        let response = signer
            .reset_retry_counter(
                Can::new(CAN).unwrap(),
                Puk::new(PUK).unwrap(),
                ResetRetryCounterMode::WithNewPin(Pin::new("111111").unwrap()),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(response, ResetRetryCounterResponse::Success);
        assert_eq!(card.pin_retries(), 3);
        signer
            .sign(credential("111111"), &challenge(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_puk_is_command_blocked() {
        let card = card();
        card.set_puk_usages(0);
        let response = signer(&card)
            .reset_retry_counter(
                Can::new(CAN).unwrap(),
                Puk::new(PUK).unwrap(),
                ResetRetryCounterMode::WithoutNewPin,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response, ResetRetryCounterResponse::CommandBlocked);
    }

    #[tokio::test]
    async fn test_sign_for_pairing_binds_device_key() {
        let card = card();
        let signer = signer(&card);
        let custodian = BiometricKeyCustodian::new(
            Arc::new(SoftwareKeyStore::new()),
            Arc::new(MemoryTokenStore::new()),
            ProfileId::new("p1"),
            DeviceInformation::host("test device"),
            Arc::new(FixedClock::new(OffsetDateTime::now_utc())),
        );
        let pairing = custodian.create_pairing_session().await.unwrap();

        let (signed, registration) = signer
            .sign_for_pairing(
                credential(PIN),
                &challenge(),
                &custodian,
                &pairing,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(registration.auth_cert, signed.certificate.to_base64());
        let key = signed.certificate.verification_key().unwrap();
        let pairing_data = decode_verified::<crate::biometric::PairingData>(
            &registration.signed_pairing_data,
            &key,
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        assert_eq!(pairing_data.claims.key_identifier, pairing.key_identifier);
        assert_eq!(card.signatures(), 2);
        assert_eq!(card.connects(), 1);
    }
}
