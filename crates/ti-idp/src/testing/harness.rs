//! A complete session wired to the fake IDP, a simulated card and a
//! software key store.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::card_sim::SimulatedCard;
use super::fake_idp::FakeIdp;
use super::init_test_tracing;
use super::pki::{PkiOcspResponder, TestPki};
use crate::biometric::{BiometricKeyCustodian, DeviceInformation, SoftwareKeyStore};
use crate::card::{CardCredential, SmartcardSigner};
use crate::clock::FixedClock;
use crate::config::{CardConfig, IdpConfig, TrustConfig};
use crate::error::IdpError;
use crate::ext_auth::ExtAuthRequestStore;
use crate::profile::ProfileContext;
use crate::session::{CredentialSource, IdpSession, RefreshCoordinator};
use crate::store::{MemoryTokenStore, SessionToken, SessionTokenStore};
use crate::trust::TrustValidator;

/// CAN of the simulated card.
pub const CAN: &str = "123123";
/// PIN of the simulated card.
pub const PIN: &str = "123456";
/// PUK of the simulated card.
pub const PUK: &str = "12345678";

/// Everything a session test needs, sharing one clock.
pub struct Harness {
    pub pki: Arc<TestPki>,
    pub clock: Arc<FixedClock>,
    pub idp: FakeIdp,
    pub store: Arc<MemoryTokenStore>,
    pub validator: Arc<TrustValidator>,
    pub ext_auth: Arc<ExtAuthRequestStore>,
    pub refresh: RefreshCoordinator,
    pub card: SimulatedCard,
    pub signer: SmartcardSigner,
    pub keys: Arc<SoftwareKeyStore>,
    pub custodian: BiometricKeyCustodian,
    pub config: IdpConfig,
    pub session: IdpSession,
}

impl Harness {
    /// A harness for an unbound profile with the default configuration.
    ///
    /// # Panics
    /// Panics if the session cannot be built.
    #[must_use]
    pub fn new() -> Self {
        Self::build(IdpConfig::default(), ProfileContext::new("profile-a"))
    }

    /// A harness for `profile`.
    ///
    /// # Panics
    /// Panics if the session cannot be built.
    #[must_use]
    pub fn with_profile(profile: ProfileContext) -> Self {
        Self::build(IdpConfig::default(), profile)
    }

    /// A harness with `config`.
    ///
    /// # Panics
    /// Panics if the session cannot be built.
    #[must_use]
    pub fn with_config(config: IdpConfig) -> Self {
        Self::build(config, ProfileContext::new("profile-a"))
    }

    fn build(config: IdpConfig, profile: ProfileContext) -> Self {
        init_test_tracing();
        let pki = Arc::new(TestPki::new());
        let clock = Arc::new(FixedClock::new(OffsetDateTime::now_utc()));
        let idp = FakeIdp::new(&pki, clock.clone());
        let validator = Arc::new(
            TrustValidator::new(Arc::new(pki.anchors()), TrustConfig::default(), clock.clone())
                .with_ocsp_responder(Arc::new(PkiOcspResponder::new(pki.clone(), clock.clone()))),
        );
        let store = Arc::new(MemoryTokenStore::new());
        let ext_auth = Arc::new(ExtAuthRequestStore::new(
            config.ext_auth.pending_ttl,
            clock.clone(),
        ));
        let refresh = RefreshCoordinator::new();
        let card = SimulatedCard::new(&pki.issue_leaf("Heinz Hillbert TEST-ONLY"), CAN, PIN, PUK);
        let signer = SmartcardSigner::new(Arc::new(card.clone()), CardConfig::default());
        let keys = Arc::new(SoftwareKeyStore::new());
        let custodian = BiometricKeyCustodian::new(
            keys.clone(),
            store.clone(),
            profile.id.clone(),
            DeviceInformation::host("test device"),
            clock.clone(),
        );

        let session = wire(
            &config, profile, &idp, &store, &validator, &ext_auth, &refresh, &clock,
        );
        Self {
            pki,
            clock,
            idp,
            store,
            validator,
            ext_auth,
            refresh,
            card,
            signer,
            keys,
            custodian,
            config,
            session,
        }
    }

    /// A new session over the same store, IDP and clock, as after an
    /// application restart.
    #[must_use]
    pub fn rebuild_session(&self) -> IdpSession {
        wire(
            &self.config,
            self.session.profile().clone(),
            &self.idp,
            &self.store,
            &self.validator,
            &self.ext_auth,
            &self.refresh,
            &self.clock,
        )
    }

    /// Card credential with the card's CAN and `pin`.
    ///
    /// # Panics
    /// Panics if `pin` is not a valid PIN.
    #[must_use]
    pub fn credential(&self, pin: &str) -> CardCredential {
        CardCredential::new(CAN, pin).expect("credential")
    }

    /// Card source presenting `pin`.
    #[must_use]
    pub fn card_source(&self, pin: &str) -> CredentialSource {
        CredentialSource::Smartcard {
            signer: self.signer.clone(),
            credential: self.credential(pin),
            cancel: CancellationToken::new(),
        }
    }

    /// Full login with the correct PIN.
    ///
    /// # Errors
    /// Any login error.
    pub async fn login_with_card(&self) -> Result<SessionToken, IdpError> {
        let challenge = self.session.request_challenge().await?;
        self.session
            .prove_and_exchange(challenge, self.card_source(PIN))
            .await
    }

    /// The stored token of the session's profile.
    ///
    /// # Panics
    /// Panics if the store fails.
    pub async fn current_token(&self) -> Option<SessionToken> {
        self.store
            .load(&self.session.profile().id)
            .await
            .expect("store")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
fn wire(
    config: &IdpConfig,
    profile: ProfileContext,
    idp: &FakeIdp,
    store: &Arc<MemoryTokenStore>,
    validator: &Arc<TrustValidator>,
    ext_auth: &Arc<ExtAuthRequestStore>,
    refresh: &RefreshCoordinator,
    clock: &Arc<FixedClock>,
) -> IdpSession {
    IdpSession::builder(config.clone(), profile)
        .with_client(Arc::new(idp.clone()))
        .with_token_store(store.clone())
        .with_trust_validator(validator.clone())
        .with_ext_auth_store(ext_auth.clone())
        .with_refresh_coordinator(refresh.clone())
        .with_clock(clock.clone())
        .build()
        .expect("session")
}
