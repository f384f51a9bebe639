use std::sync::Arc;

use async_trait::async_trait;
use p256::pkcs8::EncodePublicKey;
use uuid::Uuid;

use super::error::BiometricError;
use super::keystore::SecureKeyStore;
use super::pairing::{
    AUTHENTICATION_DATA_VERSION, AuthenticationData, BIOMETRIC_AMR, DeviceInformation,
    PAIRING_DATA_VERSION, PairingData, PairingRecord, PairingSession, REGISTRATION_DATA_VERSION,
    RegistrationData, SignedAuthenticationData,
};
use crate::challenge::IdpChallenge;
use crate::clock::SharedClock;
use crate::codec::{CodecError, Jws, JwsHeader, JwsSigner};
use crate::crypto::{b64url, random_bytes, RANDOM_VALUE_BYTES};
use crate::profile::ProfileId;
use crate::store::PairingStore;
use crate::trust::Certificate;

const LOGIN_PROMPT: &str = "Sign in to the identity provider";

/// Owns the device-bound key of one profile and performs the pairing
/// ceremony and the alternative authentication with it.
#[derive(Clone)]
pub struct BiometricKeyCustodian {
    key_store: Arc<dyn SecureKeyStore>,
    pairings: Arc<dyn PairingStore>,
    profile: ProfileId,
    device: DeviceInformation,
    clock: SharedClock,
}

impl BiometricKeyCustodian {
    /// Creates a custodian for `profile`.
    #[must_use]
    pub fn new(
        key_store: Arc<dyn SecureKeyStore>,
        pairings: Arc<dyn PairingStore>,
        profile: ProfileId,
        device: DeviceInformation,
        clock: SharedClock,
    ) -> Self {
        Self {
            key_store,
            pairings,
            profile,
            device,
            clock,
        }
    }

    /// Profile the custodian acts for.
    #[must_use]
    pub fn profile(&self) -> &ProfileId {
        &self.profile
    }

    /// Starts a pairing: creates a fresh device key under a random key
    /// identifier.
    ///
    /// # Errors
    ///
    /// Returns `BiometryUnavailable` without enrolled biometry and
    /// `KeyCreation` for other key store failures.
    pub async fn create_pairing_session(&self) -> Result<PairingSession, BiometricError> {
        let key_identifier = b64url(&random_bytes::<RANDOM_VALUE_BYTES>());
        let public_key = self
            .key_store
            .create_key(&key_identifier)
            .await
            .map_err(BiometricError::from_creation)?;
        let session = PairingSession {
            id: Uuid::new_v4(),
            key_identifier,
            public_key,
            device_information: self.device.clone(),
            created_at: self.clock.now(),
        };
        tracing::info!(profile = %self.profile, pairing = %session.id, "Pairing session created");
        Ok(session)
    }

    /// Builds the registration for `session`, with the pairing data signed
    /// by `signer` (the card holding `certificate`).
    ///
    /// # Errors
    ///
    /// Propagates the signer's error; packaging failures are converted
    /// through `From<BiometricError>`.
    pub async fn sign_pairing_session<S>(
        &self,
        session: &PairingSession,
        signer: &mut S,
        certificate: &Certificate,
    ) -> Result<RegistrationData, S::Error>
    where
        S: JwsSigner + ?Sized,
        S::Error: From<BiometricError>,
    {
        let spki = session
            .public_key
            .to_public_key_der()
            .map_err(|e| BiometricError::KeyCreation(e.to_string()))?;
        let pairing_data = PairingData {
            pairing_data_version: PAIRING_DATA_VERSION.to_string(),
            se_subject_public_key_info: base64_standard(spki.as_bytes()),
            key_identifier: session.key_identifier.clone(),
            product: session.device_information.device_type.product.clone(),
            serialnumber: certificate.serial_hex(),
            issuer: b64url(certificate.issuer_raw()),
            not_after: certificate.not_after().unix_timestamp(),
        };
        let payload = serde_json::to_vec(&pairing_data)
            .map_err(|e| BiometricError::CertificatePackaging(e.to_string()))?;
        let card_curve = certificate
            .public_key()
            .map_err(|e| BiometricError::CertificatePackaging(e.to_string()))?
            .curve();
        let signed_pairing_data =
            Jws::sign_with(&JwsHeader::for_curve(card_curve), &payload, signer).await?;

        tracing::debug!(pairing = %session.id, "Pairing data signed");
        Ok(RegistrationData {
            registration_data_version: REGISTRATION_DATA_VERSION.to_string(),
            auth_cert: certificate.to_base64(),
            signed_pairing_data,
            device_information: session.device_information.clone(),
        })
    }

    /// Persists the pairing after the IDP accepted the registration.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the record cannot be written.
    pub async fn commit(
        &self,
        session: &PairingSession,
        certificate: &Certificate,
    ) -> Result<PairingRecord, BiometricError> {
        let record = PairingRecord {
            key_identifier: session.key_identifier.clone(),
            certificate: certificate.clone(),
        };
        self.pairings.save_pairing(&self.profile, &record).await?;
        tracing::info!(profile = %self.profile, pairing = %session.id, "Pairing committed");
        Ok(record)
    }

    /// Releases an uncommitted pairing attempt. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or a stale record cannot be removed.
    pub async fn abort(&self, session: &PairingSession) -> Result<(), BiometricError> {
        self.key_store
            .delete_key(&session.key_identifier)
            .await
            .map_err(BiometricError::from_creation)?;
        if let Some(record) = self.pairings.load_pairing(&self.profile).await? {
            if record.key_identifier == session.key_identifier {
                self.pairings.remove_pairing(&self.profile).await?;
            }
        }
        tracing::info!(profile = %self.profile, pairing = %session.id, "Pairing aborted");
        Ok(())
    }

    /// The committed pairing, if any.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the record cannot be read.
    pub async fn pairing_record(&self) -> Result<Option<PairingRecord>, BiometricError> {
        Ok(self.pairings.load_pairing(&self.profile).await?)
    }

    /// Whether a usable pairing exists: a record and its key.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the record cannot be read.
    pub async fn is_paired(&self) -> Result<bool, BiometricError> {
        match self.pairing_record().await? {
            Some(record) => Ok(self
                .key_store
                .public_key(&record.key_identifier)
                .await
                .ok()
                .flatten()
                .is_some()),
            None => Ok(false),
        }
    }

    /// Removes the local pairing and its key. Returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or key cannot be removed.
    pub async fn unpair(&self) -> Result<Option<PairingRecord>, BiometricError> {
        let record = self.pairings.load_pairing(&self.profile).await?;
        if let Some(record) = &record {
            self.key_store
                .delete_key(&record.key_identifier)
                .await
                .map_err(BiometricError::from_creation)?;
            self.pairings.remove_pairing(&self.profile).await?;
            tracing::info!(profile = %self.profile, "Device unpaired");
        }
        Ok(record)
    }

    /// Answers `challenge` with the paired key after a fresh user presence
    /// prompt.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the device is not paired, `UserCancelled`
    /// if the prompt was dismissed, `SigningRefused` for failed or locked
    /// biometry.
    pub async fn authentication_data(
        &self,
        challenge: &IdpChallenge,
    ) -> Result<SignedAuthenticationData, BiometricError> {
        let record = self
            .pairings
            .load_pairing(&self.profile)
            .await?
            .ok_or(BiometricError::KeyNotFound)?;
        let present = self
            .key_store
            .public_key(&record.key_identifier)
            .await
            .map_err(BiometricError::from_signing)?;
        if present.is_none() {
            tracing::warn!(profile = %self.profile, "Pairing record without device key");
            return Err(BiometricError::KeyNotFound);
        }

        let data = AuthenticationData {
            authentication_data_version: AUTHENTICATION_DATA_VERSION.to_string(),
            auth_cert: b64url(record.certificate.der()),
            challenge_token: challenge.challenge.clone(),
            device_information: self.device.clone(),
            amr: BIOMETRIC_AMR.iter().map(|s| (*s).to_string()).collect(),
            key_identifier: record.key_identifier.clone(),
            exp: record.certificate.not_after().unix_timestamp(),
        };
        let payload = serde_json::to_vec(&data)
            .map_err(|e| BiometricError::CertificatePackaging(e.to_string()))?;

        let mut signer = DeviceKeySigner {
            key_store: self.key_store.as_ref(),
            tag: &record.key_identifier,
        };
        let signed = Jws::sign_with(&JwsHeader::es256(), &payload, &mut signer).await?;
        tracing::debug!(profile = %self.profile, "Authentication data signed with device key");
        Ok(SignedAuthenticationData {
            original: challenge.clone(),
            signed,
        })
    }
}

struct DeviceKeySigner<'a> {
    key_store: &'a dyn SecureKeyStore,
    tag: &'a str,
}

#[async_trait]
impl JwsSigner for DeviceKeySigner<'_> {
    type Error = BiometricError;

    async fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, BiometricError> {
        self.key_store
            .sign(self.tag, message, LOGIN_PROMPT)
            .await
            .map_err(BiometricError::from_signing)
    }
}

fn base64_standard(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

impl From<BiometricError> for CodecError {
    fn from(err: BiometricError) -> Self {
        match err {
            BiometricError::Codec(inner) => inner,
            other => CodecError::invalid_signature(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use p256::pkcs8::DecodePublicKey;
    use time::OffsetDateTime;

    use super::*;
    use crate::biometric::{PromptOutcome, SoftwareKeyStore};
    use crate::challenge::ChallengeClaims;
    use crate::clock::FixedClock;
    use crate::codec::EcPublicKey;
    use crate::store::MemoryTokenStore;
    use crate::testing::pki::TestPki;

    struct Fixture {
        keys: Arc<SoftwareKeyStore>,
        custodian: BiometricKeyCustodian,
        pki: TestPki,
    }

    fn fixture() -> Fixture {
        let keys = Arc::new(SoftwareKeyStore::new());
        let custodian = BiometricKeyCustodian::new(
            keys.clone(),
            Arc::new(MemoryTokenStore::new()),
            ProfileId::new("p1"),
            DeviceInformation::host("test device"),
            Arc::new(FixedClock::new(OffsetDateTime::now_utc())),
        );
        Fixture {
            keys,
            custodian,
            pki: TestPki::new(),
        }
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

    #[tokio::test]
    async fn test_pairing_ceremony_and_authentication() {
        let f = fixture();
        let card = f.pki.issue_leaf("Erika Mustermann");
        let mut card_key = card.signing_key();

        let session = f.custodian.create_pairing_session().await.unwrap();
        let registration = f
            .custodian
            .sign_pairing_session(&session, &mut card_key, &card.certificate)
            .await
            .unwrap();

        let jws = Jws::parse(&registration.signed_pairing_data).unwrap();
        assert_eq!(jws.header.alg, crate::codec::ALG_BP256R1);
        let pairing: PairingData = jws.claims().unwrap();
        assert_eq!(pairing.key_identifier, session.key_identifier);
        assert_eq!(pairing.serialnumber, card.certificate.serial_hex());
        let spki = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &pairing.se_subject_public_key_info,
        )
        .unwrap();
        assert_eq!(p256::PublicKey::from_public_key_der(&spki).unwrap(), session.public_key);

        assert!(!f.custodian.is_paired().await.unwrap());
        f.custodian.commit(&session, &card.certificate).await.unwrap();
        assert!(f.custodian.is_paired().await.unwrap());

        let signed = f.custodian.authentication_data(&challenge()).await.unwrap();
        let key = EcPublicKey::from(&session.public_key);
        let verified: crate::codec::VerifiedToken<AuthenticationData> =
            crate::codec::decode_verified(&signed.signed, &key, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(verified.claims.challenge_token, "challenge.token.sig");
        assert_eq!(verified.claims.amr, vec!["mfa", "hwk", "generic-biometric"]);
        assert_eq!(verified.claims.exp, card.certificate.not_after().unix_timestamp());
    }

    #[tokio::test]
    async fn test_unpaired_device_reports_key_not_found() {
        let f = fixture();
        assert!(matches!(
            f.custodian.authentication_data(&challenge()).await,
            Err(BiometricError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_abort_releases_key_and_is_idempotent() {
        let f = fixture();
        let session = f.custodian.create_pairing_session().await.unwrap();
        assert_eq!(f.keys.key_count(), 1);

        f.custodian.abort(&session).await.unwrap();
        f.custodian.abort(&session).await.unwrap();
        assert_eq!(f.keys.key_count(), 0);
        assert!(f.custodian.pairing_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_enrollment_fails_creation() {
        let f = fixture();
        f.keys.set_enrolled(false);
        assert!(matches!(
            f.custodian.create_pairing_session().await,
            Err(BiometricError::BiometryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_prompt_is_distinct() {
        let f = fixture();
        let card = f.pki.issue_leaf("Erika Mustermann");
        let session = f.custodian.create_pairing_session().await.unwrap();
        f.custodian.commit(&session, &card.certificate).await.unwrap();

        f.keys.set_prompt_outcome(PromptOutcome::Cancel);
        let err = f.custodian.authentication_data(&challenge()).await.unwrap_err();
        assert!(err.is_cancellation());

        f.keys.set_prompt_outcome(PromptOutcome::Fail);
        assert!(matches!(
            f.custodian.authentication_data(&challenge()).await,
            Err(BiometricError::SigningRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_signer_error_is_propagated() {
        struct Refusing;

        #[async_trait]
        impl JwsSigner for Refusing {
            type Error = BiometricError;

            async fn sign(&mut self, _message: &[u8]) -> Result<Vec<u8>, BiometricError> {
                Err(BiometricError::UserCancelled)
            }
        }

        let f = fixture();
        let session = f.custodian.create_pairing_session().await.unwrap();
        let card = f.pki.issue_leaf("Erika Mustermann");
        let result = f
            .custodian
            .sign_pairing_session(&session, &mut Refusing, &card.certificate)
            .await;
        assert_eq!(result.unwrap_err(), BiometricError::UserCancelled);
    }
}
