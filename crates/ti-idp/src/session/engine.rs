use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::FutureExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;
use zeroize::Zeroizing;

use super::id_token::{check_profile_binding, verify_id_token};
use super::policy::LoginRoute;
use super::refresh::RefreshCoordinator;
use super::state::SessionState;
use crate::biometric::{BiometricKeyCustodian, PairingSession};
use crate::card::{CardCredential, SmartcardSigner};
use crate::challenge::{
    CODE_CHALLENGE_METHOD, ChallengeClaims, ChallengeKind, ChallengeSession, IdpChallenge,
    SignedChallenge, code_challenge,
};
use crate::client::{
    ChallengeRequest, ChallengeResponse, ClientError, ExchangeToken, ExternalAuthCallback,
    ExternalAuthRequest, IdpClient, PairingEntries, PairingEntry, TokenRequest,
};
use crate::clock::{SharedClock, SystemClock};
use crate::codec::{CTY_NJWT, CodecError, Jwe, JweOptions, decode_verified, nest, unnest};
use crate::config::{ConfigError, IdpConfig};
use crate::crypto::{b64url, random_bytes};
use crate::discovery::DiscoveryDocument;
use crate::error::{IdpError, ReauthReason};
use crate::ext_auth::{
    ExtAuthError, ExtAuthRequestStore, InsurerDirectory, InsurerEntry, PendingExternalAuthRequest,
};
use crate::profile::ProfileContext;
use crate::store::{SessionToken, SessionTokenStore, SsoToken};
use crate::trust::TrustValidator;

const RESPONSE_TYPE_CODE: &str = "code";
const GRANT_TYPE_AUTHORIZATION_CODE: &str = "authorization_code";
const CTY_JSON: &str = "JSON";

/// Where the proof for a challenge comes from.
pub enum CredentialSource {
    /// Sign with the smartcard after PACE and PIN verification.
    Smartcard {
        /// Signer bound to the card reader.
        signer: SmartcardSigner,
        /// CAN and PIN, consumed by the card session.
        credential: CardCredential,
        /// Aborts the card interaction.
        cancel: CancellationToken,
    },
    /// Sign with the paired device key.
    BiometricKey {
        /// Custodian of the profile's device key.
        custodian: BiometricKeyCustodian,
    },
    /// The insurer app's callback for a delegated authentication.
    DelegatedExternal {
        /// Callback URL as delivered to the app.
        callback: Url,
    },
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Smartcard { .. } => f.write_str("Smartcard"),
            Self::BiometricKey { custodian } => f
                .debug_struct("BiometricKey")
                .field("profile", custodian.profile())
                .finish(),
            Self::DelegatedExternal { .. } => f.write_str("DelegatedExternal"),
        }
    }
}

#[derive(Serialize)]
struct KeyVerifier<'a> {
    token_key: &'a str,
    code_verifier: &'a str,
}

struct Inner {
    config: IdpConfig,
    profile: ProfileContext,
    client: Arc<dyn IdpClient>,
    store: Arc<dyn SessionTokenStore>,
    validator: Arc<TrustValidator>,
    ext_auth: Arc<ExtAuthRequestStore>,
    refresh: RefreshCoordinator,
    clock: SharedClock,
    discovery: ArcSwapOption<DiscoveryDocument>,
    state: watch::Sender<SessionState>,
}

/// Authentication session of one profile.
///
/// Drives challenge, proof, exchange and refresh against the IDP and keeps
/// the resulting [`SessionToken`] in the token store. Clones share the same
/// session.
#[derive(Clone)]
pub struct IdpSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdpSession")
            .field("profile", &self.inner.profile.id)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl IdpSession {
    /// Starts building a session for `profile`.
    #[must_use]
    pub fn builder(config: IdpConfig, profile: ProfileContext) -> IdpSessionBuilder {
        IdpSessionBuilder::new(config, profile)
    }

    /// The profile this session authenticates.
    #[must_use]
    pub fn profile(&self) -> &ProfileContext {
        &self.inner.profile
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &IdpConfig {
        &self.inner.config
    }

    /// Observes state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub(crate) fn token_store(&self) -> &Arc<dyn SessionTokenStore> {
        &self.inner.store
    }

    fn now(&self) -> OffsetDateTime {
        self.inner.clock.now()
    }

    /// Reads the persisted token and settles the state from it, so a
    /// restarted application continues without a new login.
    ///
    /// # Errors
    /// Returns `Store` if the token cannot be read.
    pub async fn restore(&self) -> Result<Option<SessionToken>, IdpError> {
        let token = self.current_token().await?;
        self.settle().await;
        Ok(token)
    }

    /// The stored token of this profile, live or not.
    ///
    /// # Errors
    /// Returns `Store` if the token cannot be read.
    pub async fn current_token(&self) -> Result<Option<SessionToken>, IdpError> {
        Ok(self.inner.store.load(&self.inner.profile.id).await?)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// The verified discovery document: the cached one while valid, else
    /// the persisted one after re-verification, else a fresh fetch.
    ///
    /// # Errors
    /// Returns `Client` for fetch failures and `Trust`/`InvalidDiscoveryDocument`
    /// if the document does not verify.
    pub async fn discovery_document(&self) -> Result<Arc<DiscoveryDocument>, IdpError> {
        let now = self.now();
        let max_age = self.inner.config.session.discovery_max_age;
        if let Some(document) = self.inner.discovery.load_full() {
            if document.is_valid(now, max_age) {
                return Ok(document);
            }
            tracing::debug!("Cached discovery document expired");
        }

        if let Some(stored) = self.inner.store.load_discovery().await? {
            match DiscoveryDocument::restore(stored, &self.inner.validator, now).await {
                Ok(document) if document.is_valid(now, max_age) => {
                    let document = Arc::new(document);
                    self.inner.discovery.store(Some(document.clone()));
                    return Ok(document);
                }
                Ok(_) => tracing::debug!("Stored discovery document expired"),
                Err(err) => tracing::warn!(error = %err, "Stored discovery document rejected"),
            }
        }

        let bundle = self.inner.client.load_discovery_document().await?;
        let document = Arc::new(DiscoveryDocument::verify(bundle, &self.inner.validator, now).await?);
        self.inner.store.save_discovery(&document.to_stored()).await?;
        self.inner.discovery.store(Some(document.clone()));
        Ok(document)
    }

    /// Drops the cached discovery document; the next operation fetches or
    /// restores it again.
    pub fn reset_discovery_document(&self) {
        self.inner.discovery.store(None);
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Requests a signed challenge for a new authorization attempt.
    ///
    /// # Errors
    /// Returns `Client` for network and server failures, discovery errors,
    /// `Codec` if the challenge does not verify and `ChallengeExpired` if
    /// it arrives expired.
    pub async fn request_challenge(&self) -> Result<ChallengeSession, IdpError> {
        self.set_state(SessionState::ChallengeRequested);
        let result: Result<ChallengeSession, IdpError> = async {
            let document = self.discovery_document().await?;
            self.signed_challenge(&document).await
        }
        .await;
        if let Err(err) = &result {
            self.fail(err).await;
        }
        result
    }

    async fn signed_challenge(
        &self,
        document: &DiscoveryDocument,
    ) -> Result<ChallengeSession, IdpError> {
        let (verifier, state, nonce) = ChallengeSession::generate_secrets();
        let client = &self.inner.config.client;
        let request = ChallengeRequest {
            client_id: client.client_id.clone(),
            state: state.clone(),
            nonce: nonce.clone(),
            code_challenge: code_challenge(&verifier),
            code_challenge_method: CODE_CHALLENGE_METHOD.to_string(),
            scope: client.scope(),
            response_type: RESPONSE_TYPE_CODE.to_string(),
            redirect_uri: client.redirect_uri.clone(),
        };
        let response = self.inner.client.request_challenge(&request, document).await?;
        let challenge = self.verify_challenge(response, document, &state)?;
        tracing::debug!(
            profile = %self.inner.profile.id,
            expires_at = challenge.claims.exp,
            "Challenge received"
        );
        Ok(ChallengeSession::new(
            verifier,
            state,
            nonce,
            ChallengeKind::Signed(challenge),
        ))
    }

    fn verify_challenge(
        &self,
        response: ChallengeResponse,
        document: &DiscoveryDocument,
        state: &str,
    ) -> Result<IdpChallenge, IdpError> {
        let key = document.signing_key()?;
        let claims = decode_verified::<ChallengeClaims>(&response.challenge, &key, self.now())
            .map_err(|err| match err {
                CodecError::Expired => IdpError::ChallengeExpired,
                other => other.into(),
            })?
            .claims;
        if claims.state.as_deref().is_some_and(|s| s != state) {
            return Err(IdpError::InvalidStateParameter);
        }
        Ok(IdpChallenge {
            challenge: response.challenge,
            claims,
            user_consent: response.user_consent,
        })
    }

    /// Proves `session` with `source`, exchanges the result for tokens and
    /// stores them.
    ///
    /// # Errors
    /// Returns the credential source's error (`Card`, `Biometric`,
    /// `ExtAuth`), `ChallengeExpired`, `InvalidStateParameter`,
    /// `InvalidNonce`, `ProfileMismatch`, `Trust` for an untrusted card
    /// certificate, or `Client` for network and server failures.
    pub async fn prove_and_exchange(
        &self,
        session: ChallengeSession,
        source: CredentialSource,
    ) -> Result<SessionToken, IdpError> {
        self.set_state(SessionState::ProofPending);
        let result = self.prove_and_exchange_inner(session, source).await;
        self.complete(result).await
    }

    async fn prove_and_exchange_inner(
        &self,
        session: ChallengeSession,
        source: CredentialSource,
    ) -> Result<SessionToken, IdpError> {
        let document = self.discovery_document().await?;
        let (exchange, redirect_uri) = match source {
            CredentialSource::Smartcard {
                signer,
                credential,
                cancel,
            } => {
                let challenge = self.live_challenge(&session)?;
                let signed = signer.sign(credential, challenge, &cancel).await?;
                let exchange = self.submit_card_proof(&signed, &document).await?;
                (exchange, self.inner.config.client.redirect_uri.clone())
            }
            CredentialSource::BiometricKey { custodian } => {
                self.check_custodian(&custodian)?;
                let challenge = self.live_challenge(&session)?;
                let signed = custodian.authentication_data(challenge).await?;
                self.ensure_live(&signed.original)?;
                let envelope = seal_proof(&signed.signed, &document, signed.original.claims.exp)?;
                let exchange = self.inner.client.alt_verify(&envelope, &document).await?;
                (exchange, self.inner.config.client.redirect_uri.clone())
            }
            CredentialSource::DelegatedExternal { callback } => {
                let parsed = ExternalAuthCallback::from_url(&callback)?;
                if parsed.state != session.state {
                    tracing::warn!("Insurer callback does not belong to this authorization");
                    return Err(ExtAuthError::InvalidStateParameter.into());
                }
                let pending = self.inner.ext_auth.take(&parsed.state)?;
                if pending.challenge_session != session {
                    return Err(ExtAuthError::InvalidStateParameter.into());
                }
                let exchange = self
                    .inner
                    .client
                    .complete_external_authentication(&parsed, &document)
                    .await?;
                let mut redirect = callback;
                redirect.set_query(None);
                redirect.set_fragment(None);
                (exchange, redirect.to_string())
            }
        };

        let token = self
            .exchange(&session, &exchange, redirect_uri, &document, None)
            .await?;
        self.inner.store.save(&self.inner.profile.id, &token).await?;
        tracing::info!(
            profile = %self.inner.profile.id,
            token = %token.fingerprint(),
            "Authenticated"
        );
        Ok(token)
    }

    fn live_challenge<'a>(&self, session: &'a ChallengeSession) -> Result<&'a IdpChallenge, IdpError> {
        let challenge = session
            .idp_challenge()
            .ok_or_else(|| IdpError::unsupported("challenge session has no signed challenge"))?;
        self.ensure_live(challenge)?;
        Ok(challenge)
    }

    fn ensure_live(&self, challenge: &IdpChallenge) -> Result<(), IdpError> {
        if challenge.is_expired(self.now()) {
            tracing::warn!(expired_at = challenge.claims.exp, "Challenge expired before submission");
            return Err(IdpError::ChallengeExpired);
        }
        Ok(())
    }

    fn check_custodian(&self, custodian: &BiometricKeyCustodian) -> Result<(), IdpError> {
        if custodian.profile() != &self.inner.profile.id {
            return Err(IdpError::internal(format!(
                "device key custodian belongs to profile {}",
                custodian.profile()
            )));
        }
        Ok(())
    }

    async fn submit_card_proof(
        &self,
        signed: &SignedChallenge,
        document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, IdpError> {
        self.inner
            .validator
            .validate(std::slice::from_ref(&signed.certificate))
            .await?;
        self.ensure_live(&signed.original)?;
        let envelope = seal_proof(&signed.signed, document, signed.original.claims.exp)?;
        Ok(self.inner.client.verify(&envelope, document).await?)
    }

    async fn exchange(
        &self,
        session: &ChallengeSession,
        exchange: &ExchangeToken,
        redirect_uri: String,
        document: &DiscoveryDocument,
        previous_sso: Option<SsoToken>,
    ) -> Result<SessionToken, IdpError> {
        if exchange.state != session.state {
            tracing::warn!("Authorization code issued for another request");
            return Err(IdpError::InvalidStateParameter);
        }
        self.set_state(SessionState::Exchanging);

        let token_key = Zeroizing::new(random_bytes::<32>());
        let encoded_key = Zeroizing::new(b64url(token_key.as_slice()));
        let verifier_json = Zeroizing::new(
            serde_json::to_vec(&KeyVerifier {
                token_key: &encoded_key,
                code_verifier: session.verifier(),
            })
            .map_err(CodecError::from)?,
        );
        let key_verifier = Jwe::encrypt(
            &verifier_json,
            document.encryption_key(),
            JweOptions::default().with_cty(CTY_JSON),
        )?;
        let request = TokenRequest {
            code: exchange.code.clone(),
            key_verifier,
            code_verifier: session.verifier().to_string(),
            grant_type: GRANT_TYPE_AUTHORIZATION_CODE.to_string(),
            redirect_uri,
            client_id: self.inner.config.client.client_id.clone(),
        };
        let response = self.inner.client.exchange(&request, document).await?;

        let access_token = open_token(&response.access_token, &token_key)?;
        let id_token = open_token(&response.id_token, &token_key)?;
        let now = self.now();
        let claims = verify_id_token(&id_token, document, &session.nonce, now)?;
        check_profile_binding(&claims, &self.inner.profile)?;

        let expires_at = now + time::Duration::seconds(response.expires_in);
        if expires_at <= now {
            return Err(ClientError::decoding(format!(
                "expires_in must be positive, got {}",
                response.expires_in
            ))
            .into());
        }
        let sso_token = match &exchange.sso {
            Some(value) => Some(SsoToken {
                value: value.clone(),
                expires_at: now + self.inner.config.session.sso_token_lifetime,
            }),
            None => previous_sso,
        };
        Ok(SessionToken {
            access_token,
            id_token,
            sso_token,
            expires_at,
            token_type: response.token_type,
            insurance_id: claims.id_nummer,
        })
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Obtains a new access token with the stored SSO token.
    ///
    /// Concurrent calls for the same profile share one round trip.
    ///
    /// # Errors
    /// Returns `ReauthenticationRequired` without a usable SSO token or if
    /// the IDP rejects it (the stored token is cleared in that case).
    /// Network errors are returned unchanged and leave the stored token
    /// in place.
    pub async fn refresh(&self) -> Result<SessionToken, IdpError> {
        let session = self.clone();
        self.inner
            .refresh
            .run(&self.inner.profile.id, move || {
                async move { session.refresh_now().await }.boxed()
            })
            .await
    }

    async fn refresh_now(&self) -> Result<SessionToken, IdpError> {
        self.set_state(SessionState::Refreshing);
        let result = self.refresh_with_sso_token().await;
        self.complete(result).await
    }

    async fn refresh_with_sso_token(&self) -> Result<SessionToken, IdpError> {
        let profile = &self.inner.profile.id;
        let generation = self.inner.refresh.generation(profile).await;
        let existing = self
            .inner
            .store
            .load(profile)
            .await?
            .ok_or(IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated))?;
        let sso = existing
            .sso_token
            .ok_or(IdpError::ReauthenticationRequired(ReauthReason::MissingSsoToken))?;
        if !sso.is_valid_at(self.now()) {
            return Err(IdpError::ReauthenticationRequired(ReauthReason::SsoTokenExpired));
        }

        let document = self.discovery_document().await?;
        let session = self.signed_challenge(&document).await?;
        let challenge = self.live_challenge(&session)?;
        let exchange = match self
            .inner
            .client
            .refresh_with_sso_token(&challenge.challenge, &sso.value, &document)
            .await
        {
            Ok(exchange) => exchange,
            Err(ClientError::Server(response)) => {
                tracing::warn!(profile = %profile, response = %response, "SSO token rejected");
                self.inner.store.clear(profile).await?;
                return Err(IdpError::ReauthenticationRequired(ReauthReason::SsoRejected(
                    response,
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let redirect_uri = self.inner.config.client.redirect_uri.clone();
        let token = self
            .exchange(&session, &exchange, redirect_uri, &document, Some(sso))
            .await?;
        self.inner
            .refresh
            .commit(profile, generation, async {
                self.inner.store.save(profile, &token).await?;
                Ok(())
            })
            .await?;
        tracing::info!(profile = %profile, token = %token.fingerprint(), "Session refreshed");
        Ok(token)
    }

    /// Clears the session token of this profile. Idempotent.
    ///
    /// A refresh still running for the profile is detached and cannot
    /// store its token afterwards.
    ///
    /// # Errors
    /// Returns `Store` if the token cannot be removed.
    pub async fn invalidate(&self) -> Result<(), IdpError> {
        let profile = &self.inner.profile.id;
        self.inner
            .refresh
            .invalidate(profile, async {
                self.inner.store.clear(profile).await?;
                Ok(())
            })
            .await?;
        self.set_state(SessionState::Idle);
        tracing::info!(profile = %self.inner.profile.id, "Session invalidated");
        Ok(())
    }

    /// The credential path the configured policy picks, given whether the
    /// device is paired.
    ///
    /// # Errors
    /// Returns `Store` if the token cannot be read.
    pub async fn login_route(&self, paired: bool) -> Result<LoginRoute, IdpError> {
        let now = self.now();
        let sso_available = self
            .current_token()
            .await?
            .is_some_and(|token| token.can_refresh_silently(now));
        Ok(self
            .inner
            .config
            .session
            .login_policy
            .route(sso_available, paired))
    }

    /// A token that is live for at least the refresh leeway, refreshing
    /// first if needed. A still valid token is returned when the refresh
    /// fails with a retryable error.
    pub(crate) async fn valid_token(&self) -> Result<SessionToken, IdpError> {
        let now = self.now();
        let leeway = self.inner.config.session.refresh_leeway;
        let token = self
            .current_token()
            .await?
            .ok_or(IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated))?;
        if !token.needs_refresh(now, leeway) {
            return Ok(token);
        }
        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(err) if err.is_retryable() && token.is_valid_at(now) => {
                tracing::warn!(error = %err, "Refresh failed, using the current token");
                Ok(token)
            }
            Err(err) => Err(err),
        }
    }

    /// Time until the stored token enters the refresh leeway. `None` if
    /// there is no token or it cannot be renewed silently.
    pub(crate) async fn next_refresh_delay(&self) -> Result<Option<std::time::Duration>, IdpError> {
        let now = self.now();
        let Some(token) = self.current_token().await? else {
            return Ok(None);
        };
        if !token.can_refresh_silently(now) {
            return Ok(None);
        }
        let due = token.expires_at - self.inner.config.session.refresh_leeway;
        Ok(Some((due - now).try_into().unwrap_or_default()))
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    /// Logs in with the card and registers a new device key in the same
    /// card session. The pairing is committed only after the IDP accepted
    /// the registration and aborted on any failure.
    ///
    /// # Errors
    /// Any error of [`prove_and_exchange`](Self::prove_and_exchange), the
    /// custodian's key creation errors and the registration's `Client`
    /// errors.
    pub async fn pair_device(
        &self,
        signer: &SmartcardSigner,
        credential: CardCredential,
        custodian: &BiometricKeyCustodian,
        cancel: &CancellationToken,
    ) -> Result<PairingEntry, IdpError> {
        self.check_custodian(custodian)?;
        let session = self.request_challenge().await?;
        let pairing = match custodian.create_pairing_session().await {
            Ok(pairing) => pairing,
            Err(err) => {
                let err = IdpError::from(err);
                self.fail(&err).await;
                return Err(err);
            }
        };

        self.set_state(SessionState::ProofPending);
        let result = self
            .pair_device_inner(signer, credential, custodian, &pairing, session, cancel)
            .await;
        if result.is_err() {
            if let Err(err) = custodian.abort(&pairing).await {
                tracing::warn!(error = %err, pairing = %pairing.id, "Failed to abort pairing");
            }
        }
        match result {
            Ok((token, entry)) => {
                self.complete(Ok(token)).await?;
                Ok(entry)
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn pair_device_inner(
        &self,
        signer: &SmartcardSigner,
        credential: CardCredential,
        custodian: &BiometricKeyCustodian,
        pairing: &PairingSession,
        session: ChallengeSession,
        cancel: &CancellationToken,
    ) -> Result<(SessionToken, PairingEntry), IdpError> {
        let document = self.discovery_document().await?;
        let challenge = self.live_challenge(&session)?;
        let (signed, registration) = signer
            .sign_for_pairing(credential, challenge, custodian, pairing, cancel)
            .await?;
        let exchange = self.submit_card_proof(&signed, &document).await?;
        let redirect_uri = self.inner.config.client.redirect_uri.clone();
        let token = self
            .exchange(&session, &exchange, redirect_uri, &document, None)
            .await?;
        self.inner.store.save(&self.inner.profile.id, &token).await?;

        let registration_json = serde_json::to_vec(&registration).map_err(CodecError::from)?;
        let encrypted = Jwe::encrypt(
            &registration_json,
            document.encryption_key(),
            JweOptions::default().with_cty(CTY_JSON),
        )?;
        let authorization = authorization(&token, &document)?;
        let entry = self
            .inner
            .client
            .register_device(&encrypted, &authorization, &document)
            .await?;
        custodian.commit(pairing, &signed.certificate).await?;
        tracing::info!(profile = %self.inner.profile.id, device = %entry.name, "Device paired");
        Ok((token, entry))
    }

    /// Devices paired with the authenticated user's identity.
    ///
    /// # Errors
    /// Returns `ReauthenticationRequired` without a session, else
    /// `Client` errors.
    pub async fn list_devices(&self) -> Result<PairingEntries, IdpError> {
        let token = self.valid_token().await?;
        let document = self.discovery_document().await?;
        let authorization = authorization(&token, &document)?;
        Ok(self
            .inner
            .client
            .list_devices(&authorization, &document)
            .await?)
    }

    /// Removes the device registered under `key_identifier` at the IDP.
    ///
    /// # Errors
    /// Returns `ReauthenticationRequired` without a session, else
    /// `Client` errors.
    pub async fn unregister_device(&self, key_identifier: &str) -> Result<(), IdpError> {
        let token = self.valid_token().await?;
        let document = self.discovery_document().await?;
        let authorization = authorization(&token, &document)?;
        self.inner
            .client
            .unregister_device(key_identifier, &authorization, &document)
            .await?;
        tracing::info!(profile = %self.inner.profile.id, "Device unregistered");
        Ok(())
    }

    /// Unregisters this device's pairing at the IDP and removes the local
    /// key. Returns `false` if the device was not paired.
    ///
    /// # Errors
    /// As [`unregister_device`](Self::unregister_device); the local
    /// pairing is kept if the IDP call fails.
    pub async fn unpair_device(&self, custodian: &BiometricKeyCustodian) -> Result<bool, IdpError> {
        self.check_custodian(custodian)?;
        let Some(record) = custodian.pairing_record().await? else {
            return Ok(false);
        };
        self.unregister_device(&record.key_identifier).await?;
        custodian.unpair().await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // External authentication
    // ------------------------------------------------------------------

    /// The insurers offering app-based authentication, verified against
    /// the discovery signer.
    ///
    /// # Errors
    /// Returns `Client` errors and `ExtAuth(InvalidDirectory)` if the
    /// directory does not verify.
    pub async fn load_insurer_directory(&self) -> Result<InsurerDirectory, IdpError> {
        let document = self.discovery_document().await?;
        let jwt = self.inner.client.load_insurer_directory(&document).await?;
        let key = document.discovery_certificate().verification_key()?;
        let directory = decode_verified::<InsurerDirectory>(&jwt, &key, self.now())
            .map_err(|e| ExtAuthError::InvalidDirectory(e.to_string()))?
            .claims;
        tracing::debug!(insurers = directory.entries.len(), "Insurer directory loaded");
        Ok(directory)
    }

    /// Hands the authorization over to `insurer`'s app and returns the URL
    /// to open. The request stays pending until its callback arrives.
    ///
    /// # Errors
    /// Returns `Client` errors; nothing stays pending in that case.
    pub async fn start_external_authentication(
        &self,
        insurer: &InsurerEntry,
    ) -> Result<Url, IdpError> {
        let document = self.discovery_document().await?;
        let session = ChallengeSession::external(insurer.clone());
        let state = session.state.clone();
        let client = &self.inner.config.client;
        let request = ExternalAuthRequest {
            kk_app_id: insurer.identifier.clone(),
            state: state.clone(),
            redirect_uri: client.ext_auth_redirect_uri.clone(),
            code_challenge: session.code_challenge(),
            code_challenge_method: CODE_CHALLENGE_METHOD.to_string(),
            nonce: session.nonce.clone(),
            client_id: client.client_id.clone(),
            scope: client.scope(),
        };

        let purged = self.inner.ext_auth.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Expired external authentications dropped");
        }
        self.inner.ext_auth.set(
            Some(PendingExternalAuthRequest::new(session, insurer.clone(), self.now())),
            &state,
        )?;
        match self
            .inner
            .client
            .start_external_authentication(&request, &document)
            .await
        {
            Ok(url) => Ok(url),
            Err(err) => {
                self.inner.ext_auth.set(None, &state)?;
                Err(err.into())
            }
        }
    }

    /// Finishes a delegated authentication from the insurer app's
    /// callback.
    ///
    /// # Errors
    /// Returns `ExtAuth(InvalidNonce)` if no pending request carries the
    /// callback's state, plus the errors of
    /// [`prove_and_exchange`](Self::prove_and_exchange).
    pub async fn complete_external_authentication(
        &self,
        callback: &Url,
    ) -> Result<SessionToken, IdpError> {
        let parsed = ExternalAuthCallback::from_url(callback)?;
        let pending = match self.inner.ext_auth.get(&parsed.state) {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!("Insurer callback with unknown state");
                return Err(err.into());
            }
        };
        self.prove_and_exchange(
            pending.challenge_session,
            CredentialSource::DelegatedExternal {
                callback: callback.clone(),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    fn set_state(&self, state: SessionState) {
        tracing::debug!(profile = %self.inner.profile.id, state = %state, "Session state");
        self.inner.state.send_replace(state);
    }

    async fn complete(
        &self,
        result: Result<SessionToken, IdpError>,
    ) -> Result<SessionToken, IdpError> {
        match &result {
            Ok(token) => self.set_state(SessionState::TokenObtained {
                expires_at: token.expires_at,
            }),
            Err(err) => self.fail(err).await,
        }
        result
    }

    async fn fail(&self, err: &IdpError) {
        if err.is_cancellation() {
            tracing::debug!(profile = %self.inner.profile.id, "Cancelled by the user");
            self.settle().await;
        } else {
            tracing::warn!(profile = %self.inner.profile.id, error = %err, "Authentication failed");
            self.set_state(SessionState::Failed(err.clone()));
        }
    }

    async fn settle(&self) {
        let now = self.now();
        let state = match self.inner.store.load(&self.inner.profile.id).await {
            Ok(Some(token)) if token.is_valid_at(now) => SessionState::TokenObtained {
                expires_at: token.expires_at,
            },
            _ => SessionState::Idle,
        };
        self.set_state(state);
    }
}

fn seal_proof(signed: &str, document: &DiscoveryDocument, exp: i64) -> Result<String, CodecError> {
    Jwe::encrypt(
        &nest(signed)?,
        document.encryption_key(),
        JweOptions::default().with_cty(CTY_NJWT).with_exp(exp),
    )
}

fn open_token(envelope: &str, key: &[u8; 32]) -> Result<String, CodecError> {
    unnest(&Jwe::decrypt_direct(envelope, key)?)
}

/// `Authorization` header value for the pairing endpoints: the access
/// token encrypted for the IDP.
fn authorization(token: &SessionToken, document: &DiscoveryDocument) -> Result<String, CodecError> {
    let envelope = Jwe::encrypt(
        &nest(&token.access_token)?,
        document.encryption_key(),
        JweOptions::default()
            .with_cty(CTY_NJWT)
            .with_exp(token.expires_at.unix_timestamp()),
    )?;
    Ok(format!("Bearer {envelope}"))
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`IdpSession`].
///
/// Client, token store and trust validator are required. The external
/// authentication store, refresh coordinator and clock default to fresh
/// instances; share them between sessions to share their state.
pub struct IdpSessionBuilder {
    config: IdpConfig,
    profile: ProfileContext,
    client: Option<Arc<dyn IdpClient>>,
    store: Option<Arc<dyn SessionTokenStore>>,
    validator: Option<Arc<TrustValidator>>,
    ext_auth: Option<Arc<ExtAuthRequestStore>>,
    refresh: Option<RefreshCoordinator>,
    clock: Option<SharedClock>,
}

impl IdpSessionBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: IdpConfig, profile: ProfileContext) -> Self {
        Self {
            config,
            profile,
            client: None,
            store: None,
            validator: None,
            ext_auth: None,
            refresh: None,
            clock: None,
        }
    }

    /// Sets the IDP client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn IdpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the token store.
    #[must_use]
    pub fn with_token_store(mut self, store: Arc<dyn SessionTokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the trust validator.
    #[must_use]
    pub fn with_trust_validator(mut self, validator: Arc<TrustValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the store of pending external authentications.
    #[must_use]
    pub fn with_ext_auth_store(mut self, store: Arc<ExtAuthRequestStore>) -> Self {
        self.ext_auth = Some(store);
        self
    }

    /// Sets the refresh coordinator.
    #[must_use]
    pub fn with_refresh_coordinator(mut self, refresh: RefreshCoordinator) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the session.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid or a required
    /// dependency is missing.
    pub fn build(self) -> Result<IdpSession, IdpError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ext_auth = self.ext_auth.unwrap_or_else(|| {
            Arc::new(ExtAuthRequestStore::new(
                self.config.ext_auth.pending_ttl,
                clock.clone(),
            ))
        });
        let inner = Inner {
            client: self.client.ok_or_else(|| missing("client"))?,
            store: self.store.ok_or_else(|| missing("token store"))?,
            validator: self.validator.ok_or_else(|| missing("trust validator"))?,
            ext_auth,
            refresh: self.refresh.unwrap_or_default(),
            clock,
            discovery: ArcSwapOption::empty(),
            state: watch::channel(SessionState::Idle).0,
            config: self.config,
            profile: self.profile,
        };
        Ok(IdpSession {
            inner: Arc::new(inner),
        })
    }
}

fn missing(what: &str) -> ConfigError {
    ConfigError::Missing(what.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::card::CardError;
    use crate::clock::Clock;
    use crate::testing::harness::{Harness, PIN};

    #[tokio::test]
    async fn test_card_login_stores_bound_token() {
        let h = Harness::new();
        let mut states = h.session.subscribe();

        let token = h.login_with_card().await.unwrap();

        assert!(token.expires_at > h.clock.now());
        assert_eq!(token.insurance_id.as_deref(), Some(crate::testing::fake_idp::DEFAULT_INSURANCE_ID));
        assert!(token.sso_token.is_some());
        assert_eq!(h.current_token().await, Some(token.clone()));
        assert!(matches!(
            *states.borrow_and_update(),
            SessionState::TokenObtained { expires_at } if expires_at == token.expires_at
        ));
        assert_eq!(h.idp.verifications(), 1);
        assert_eq!(h.idp.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_wrong_pin_reports_remaining_attempts() {
        let h = Harness::new();

        let challenge = h.session.request_challenge().await.unwrap();
        let err = h
            .session
            .prove_and_exchange(challenge, h.card_source("111111"))
            .await
            .unwrap_err();
        assert_eq!(err.remaining_pin_attempts(), Some(2));

        let challenge = h.session.request_challenge().await.unwrap();
        let err = h
            .session
            .prove_and_exchange(challenge, h.card_source("222222"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::Card(CardError::WrongPin { retries_left: 1 })));
        assert!(matches!(h.session.state(), SessionState::Failed(_)));
        assert_eq!(h.idp.verifications(), 0);
        assert_eq!(h.current_token().await, None);
    }

    #[tokio::test]
    async fn test_expired_challenge_is_never_submitted() {
        let h = Harness::new();
        let challenge = h.session.request_challenge().await.unwrap();

        h.clock.advance(time::Duration::seconds(181));
        let err = h
            .session
            .prove_and_exchange(challenge, h.card_source(PIN))
            .await
            .unwrap_err();

        assert!(matches!(err, IdpError::ChallengeExpired));
        assert_eq!(h.idp.verifications(), 0);
        assert_eq!(h.card.signatures(), 0);
    }

    #[tokio::test]
    async fn test_profile_mismatch_is_distinct() {
        let h = Harness::with_profile(ProfileContext::new("profile-b").with_insurance_id("X999999999"));

        let err = h.login_with_card().await.unwrap_err();

        assert!(matches!(
            err,
            IdpError::ProfileMismatch { ref expected, .. } if expected == "X999999999"
        ));
        assert_eq!(err.category(), crate::error::ErrorCategory::ProfileMismatch);
        assert_eq!(h.current_token().await, None);
    }

    #[tokio::test]
    async fn test_id_token_for_other_request_is_rejected() {
        let h = Harness::new();
        h.idp.override_id_token_nonce(Some(Some("nonce-of-another-request")));

        let err = h.login_with_card().await.unwrap_err();

        assert!(matches!(err, IdpError::InvalidNonce));
        assert_eq!(h.idp.exchanges(), 1);
        assert_eq!(h.current_token().await, None);
    }

    #[tokio::test]
    async fn test_id_token_without_nonce_is_rejected() {
        let h = Harness::new();
        h.idp.override_id_token_nonce(Some(None));

        assert!(matches!(h.login_with_card().await, Err(IdpError::InvalidNonce)));
        assert_eq!(h.current_token().await, None);
    }

    #[tokio::test]
    async fn test_cancelled_card_read_returns_to_idle() {
        let h = Harness::new();
        let challenge = h.session.request_challenge().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .session
            .prove_and_exchange(
                challenge,
                CredentialSource::Smartcard {
                    signer: h.signer.clone(),
                    credential: h.credential(PIN),
                    cancel,
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert!(matches!(h.session.state(), SessionState::Idle));
        assert!(!h.signer.is_busy());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let h = Harness::new();
        let first = h.login_with_card().await.unwrap();
        h.idp.set_latency(Some(Duration::from_millis(50)));

        let calls = (0..5).map(|_| h.session.refresh());
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(h.idp.sso_refreshes(), 1);
        let tokens: Vec<SessionToken> = results.into_iter().map(Result::unwrap).collect();
        assert!(tokens.iter().all(|t| t.access_token == tokens[0].access_token));
        assert_ne!(tokens[0].access_token, first.access_token);
        assert_eq!(tokens[0].sso_token, first.sso_token);
        assert_eq!(h.idp.discovery_fetches(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_then_refresh_requires_login() {
        let h = Harness::new();
        h.login_with_card().await.unwrap();

        h.session.invalidate().await.unwrap();
        h.session.invalidate().await.unwrap();
        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(
            err,
            IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated)
        ));
        assert_eq!(h.current_token().await, None);
        assert_eq!(h.idp.sso_refreshes(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_during_refresh_is_not_undone() {
        let h = Harness::new();
        h.login_with_card().await.unwrap();
        h.idp.set_latency(Some(Duration::from_millis(200)));

        let running = {
            let session = h.session.clone();
            tokio::spawn(async move { session.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session.invalidate().await.unwrap();

        let err = h.session.refresh().await.unwrap_err();
        assert!(matches!(
            err,
            IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated)
        ));
        let detached = running.await.unwrap().unwrap_err();
        assert!(matches!(
            detached,
            IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated)
        ));
        assert_eq!(h.current_token().await, None);
        assert!(!matches!(h.session.state(), SessionState::TokenObtained { .. }));
    }

    #[tokio::test]
    async fn test_rejected_sso_token_clears_session() {
        let h = Harness::new();
        h.login_with_card().await.unwrap();
        h.idp.set_reject_sso(true);

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(
            err,
            IdpError::ReauthenticationRequired(ReauthReason::SsoRejected(ref r)) if r.gematik_code.as_deref() == Some("2040")
        ));
        assert_eq!(h.current_token().await, None);
    }

    #[tokio::test]
    async fn test_network_error_keeps_token() {
        let h = Harness::new();
        let token = h.login_with_card().await.unwrap();
        h.idp.set_offline(true);

        let err = h.session.refresh().await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.current_token().await, Some(token));
    }

    #[tokio::test]
    async fn test_expired_sso_token_requires_login() {
        let h = Harness::new();
        h.login_with_card().await.unwrap();
        h.clock.advance(time::Duration::hours(13));

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(
            err,
            IdpError::ReauthenticationRequired(ReauthReason::SsoTokenExpired)
        ));
        assert_eq!(h.idp.sso_refreshes(), 0);
    }

    #[tokio::test]
    async fn test_pairing_then_biometric_login() {
        let h = Harness::new();

        let entry = h
            .session
            .pair_device(&h.signer, h.credential(PIN), &h.custodian, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entry.name, "test device");
        assert!(h.custodian.is_paired().await.unwrap());
        assert_eq!(h.idp.device_count(), 1);
        assert_eq!(h.session.list_devices().await.unwrap().pairing_entries.len(), 1);

        let challenge = h.session.request_challenge().await.unwrap();
        let token = h
            .session
            .prove_and_exchange(
                challenge,
                CredentialSource::BiometricKey {
                    custodian: h.custodian.clone(),
                },
            )
            .await
            .unwrap();
        assert!(token.is_valid_at(h.clock.now()));
        assert_eq!(h.idp.alt_verifications(), 1);
        assert_eq!(h.keys.prompts(), 1);

        assert!(h.session.unpair_device(&h.custodian).await.unwrap());
        assert_eq!(h.idp.device_count(), 0);
        assert!(!h.custodian.is_paired().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_pairing_is_aborted() {
        let h = Harness::new();

        let err = h
            .session
            .pair_device(&h.signer, h.credential("111111"), &h.custodian, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IdpError::Card(CardError::WrongPin { .. })));
        assert_eq!(h.keys.key_count(), 0);
        assert!(!h.custodian.is_paired().await.unwrap());
        assert_eq!(h.idp.device_count(), 0);
    }

    #[tokio::test]
    async fn test_external_authentication_round_trip() {
        let h = Harness::new();
        let directory = h.session.load_insurer_directory().await.unwrap();
        let insurer = directory.find("kk-test").unwrap().clone();

        let app_url = h.session.start_external_authentication(&insurer).await.unwrap();
        assert_eq!(h.ext_auth.pending(), 1);
        let callback = h
            .idp
            .insurer_callback(&app_url, &h.session.config().client.ext_auth_redirect_uri);
        let token = h.session.complete_external_authentication(&callback).await.unwrap();

        assert!(token.sso_token.is_some());
        assert_eq!(h.ext_auth.pending(), 0);

        let replay = h.session.complete_external_authentication(&callback).await.unwrap_err();
        assert!(matches!(replay, IdpError::ExtAuth(ExtAuthError::InvalidNonce)));
    }

    #[tokio::test]
    async fn test_external_callback_with_unknown_state() {
        let h = Harness::new();
        let insurer = InsurerEntry::new("Test BKK", "kk-test");
        h.session.start_external_authentication(&insurer).await.unwrap();

        let forged = Url::parse(
            "https://das-e-rezept-fuer-deutschland.de/extauth?code=c&state=forged&kk_app_redirect_uri=https%3A%2F%2Fkk.example",
        )
        .unwrap();
        let err = h.session.complete_external_authentication(&forged).await.unwrap_err();

        assert!(matches!(err, IdpError::ExtAuth(ExtAuthError::InvalidNonce)));
        assert_eq!(h.ext_auth.pending(), 1);
        assert_eq!(h.idp.exchanges(), 0);
    }

    #[tokio::test]
    async fn test_discovery_document_is_restored_from_store() {
        let h = Harness::new();
        h.session.discovery_document().await.unwrap();
        assert_eq!(h.idp.discovery_fetches(), 1);

        let restarted = h.rebuild_session();
        restarted.discovery_document().await.unwrap();
        assert_eq!(h.idp.discovery_fetches(), 1);

        h.clock.advance(time::Duration::hours(25));
        let later = h.rebuild_session();
        later.discovery_document().await.unwrap();
        assert_eq!(h.idp.discovery_fetches(), 2);
    }

    #[tokio::test]
    async fn test_restore_settles_state() {
        let h = Harness::new();
        let token = h.login_with_card().await.unwrap();

        let restarted = h.rebuild_session();
        assert!(matches!(restarted.state(), SessionState::Idle));
        assert_eq!(restarted.restore().await.unwrap(), Some(token));
        assert!(matches!(restarted.state(), SessionState::TokenObtained { .. }));
    }

    #[tokio::test]
    async fn test_login_route_follows_policy() {
        let h = Harness::new();
        assert_eq!(h.session.login_route(false).await.unwrap(), LoginRoute::Card);
        assert_eq!(h.session.login_route(true).await.unwrap(), LoginRoute::Biometric);

        h.login_with_card().await.unwrap();
        assert_eq!(h.session.login_route(true).await.unwrap(), LoginRoute::SilentRefresh);
    }

    #[test]
    fn test_builder_requires_dependencies() {
        let result = IdpSession::builder(IdpConfig::default(), ProfileContext::new("p1")).build();
        assert!(matches!(result, Err(IdpError::Config(ConfigError::Missing(_)))));
    }
}
