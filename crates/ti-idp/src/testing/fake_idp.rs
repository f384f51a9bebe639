//! In-process identity provider.
//!
//! Implements [`IdpClient`] with the same cryptography as the real IDP:
//! signed challenges, `ECDH-ES` envelopes for everything sent to it and
//! `dir` envelopes under the client's token key for the issued tokens.
//! Knobs simulate outages, SSO rejection and slow responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use url::Url;

use crate::biometric::{AuthenticationData, PairingData, RegistrationData};
use crate::challenge::{ChallengeClaims, code_challenge};
use crate::client::{
    ChallengeRequest, ChallengeResponse, ClientError, ExchangeToken, ExternalAuthCallback,
    ExternalAuthRequest, IdpClient, PairingEntries, PairingEntry, ServerResponse, TokenRequest,
    TokenResponse,
};
use crate::clock::SharedClock;
use crate::codec::{
    CTY_NJWT, Curve, EcPublicKey, EcSecretKey, Jwe, JweOptions, Jwk, Jws, JwsHeader, decode_verified,
    nest, unnest,
};
use crate::crypto::{b64url, b64url_decode, random_token};
use crate::discovery::{DiscoveryBundle, DiscoveryClaims, DiscoveryDocument};
use crate::ext_auth::InsurerEntry;
use crate::testing::pki::{Issued, TestPki};
use crate::trust::Certificate;

/// Redirect URI the fake answers proofs with.
pub const REDIRECT_URI: &str = "https://redirect.gematik.de/erezept";

/// Insurance identifier issued when nothing else is configured.
pub const DEFAULT_INSURANCE_ID: &str = "X110443874";

/// Signs `claims` with `key` as compact JWS.
///
/// # Panics
/// Panics if the header or claims do not serialize or signing fails.
#[must_use]
pub fn sign_jwt<T: Serialize>(key: &EcSecretKey, header: &JwsHeader, claims: &T) -> String {
    let header = serde_json::to_vec(header).expect("header");
    let payload = serde_json::to_vec(claims).expect("claims");
    let input = format!("{}.{}", b64url(&header), b64url(&payload));
    let signature = key.sign(input.as_bytes()).expect("signature");
    format!("{input}.{}", b64url(&signature))
}

/// Discovery material for an IDP at `base`, signed by `discovery` and
/// advertising `signing` and `encryption` as IDP keys.
#[must_use]
pub fn discovery_bundle(
    base: &str,
    discovery: &Issued,
    signing: &Issued,
    encryption: &EcPublicKey,
    now: OffsetDateTime,
) -> DiscoveryBundle {
    let base = base.trim_end_matches('/');
    let claims = DiscoveryClaims {
        issuer: base.to_string(),
        authorization_endpoint: format!("{base}/auth"),
        sso_endpoint: format!("{base}/auth/sso_response"),
        token_endpoint: format!("{base}/token"),
        uri_pair: Some(format!("{base}/pairings")),
        auth_pair_endpoint: Some(format!("{base}/auth/alternative")),
        uri_puk_idp_enc: format!("{base}/idpEnc/jwk.json"),
        uri_puk_idp_sig: format!("{base}/idpSig/jwk.json"),
        kk_app_list_uri: Some(format!("{base}/directory/kk_apps")),
        third_party_authorization_endpoint: Some(format!("{base}/auth/third_party")),
        exp: (now + time::Duration::hours(24)).unix_timestamp(),
        iat: now.unix_timestamp(),
    };
    let header = JwsHeader::bp256r1().with_x5c(vec![discovery.certificate.to_base64()]);
    let signing_key = Jwk::from_public_key(&signing.key.public_key().expect("signing key"))
        .with_kid("puk_idp_sig")
        .with_use("sig")
        .with_x5c(vec![signing.certificate.to_base64()]);
    DiscoveryBundle {
        jwt: sign_jwt(&discovery.signing_key(), &header, &claims),
        encryption_key: Jwk::from_public_key(encryption)
            .with_kid("puk_idp_enc")
            .with_use("enc"),
        signing_key,
    }
}

struct PendingChallenge {
    code_challenge: String,
    nonce: String,
}

struct IssuedCode {
    code_challenge: String,
    nonce: String,
    insurance_id: String,
    amr: Vec<String>,
}

struct Device {
    entry: PairingEntry,
    public_key: EcPublicKey,
    insurance_id: String,
}

#[derive(Default)]
struct FakeState {
    challenges: HashMap<String, PendingChallenge>,
    external: HashMap<String, PendingChallenge>,
    codes: HashMap<String, IssuedCode>,
    sso_tokens: HashMap<String, String>,
    devices: HashMap<String, Device>,
    insurers: Vec<InsurerEntry>,
    insurance_id: String,
    offline: bool,
    reject_sso: bool,
    latency: Option<Duration>,
    expires_in: i64,
    challenge_lifetime: i64,
    id_token_nonce: Option<Option<String>>,
}

#[derive(Default)]
struct Counters {
    discovery: AtomicUsize,
    challenges: AtomicUsize,
    verifications: AtomicUsize,
    sso_refreshes: AtomicUsize,
    exchanges: AtomicUsize,
    alt_verifications: AtomicUsize,
}

#[derive(Deserialize)]
struct KeyVerifier {
    token_key: String,
    code_verifier: String,
}

/// In-process IDP. Clones share state.
#[derive(Clone)]
pub struct FakeIdp {
    base: String,
    discovery: Issued,
    signing: Issued,
    encryption: EcSecretKey,
    clock: SharedClock,
    state: Arc<Mutex<FakeState>>,
    counters: Arc<Counters>,
}

impl FakeIdp {
    /// Creates an IDP whose certificates are issued by `pki`.
    #[must_use]
    pub fn new(pki: &TestPki, clock: SharedClock) -> Self {
        Self {
            base: "https://idp.test".to_string(),
            discovery: pki.issue_leaf("IDP Discovery TEST"),
            signing: pki.issue_leaf("IDP Sig TEST"),
            encryption: EcSecretKey::generate(Curve::BrainpoolP256r1).expect("encryption key"),
            clock,
            state: Arc::new(Mutex::new(FakeState {
                insurers: vec![InsurerEntry::new("Test BKK", "kk-test")],
                insurance_id: DEFAULT_INSURANCE_ID.to_string(),
                expires_in: 300,
                challenge_lifetime: 180,
                ..FakeState::default()
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Certificate of the discovery signature.
    #[must_use]
    pub fn discovery_certificate(&self) -> &Certificate {
        &self.discovery.certificate
    }

    /// Certificate of the token signing key.
    #[must_use]
    pub fn signing_certificate(&self) -> &Certificate {
        &self.signing.certificate
    }

    /// Fails every request with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Rejects SSO tokens while set.
    pub fn set_reject_sso(&self, reject: bool) {
        self.state().reject_sso = reject;
    }

    /// Delays SSO refreshes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Insurance identifier put into issued tokens.
    pub fn set_insurance_id(&self, insurance_id: &str) {
        self.state().insurance_id = insurance_id.to_string();
    }

    /// Lifetime of issued access tokens in seconds.
    pub fn set_expires_in(&self, seconds: i64) {
        self.state().expires_in = seconds;
    }

    /// Lifetime of issued challenges in seconds.
    pub fn set_challenge_lifetime(&self, seconds: i64) {
        self.state().challenge_lifetime = seconds;
    }

    /// Replaces the `nonce` claim of issued ID tokens; `Some(None)` omits
    /// it. `None` restores the nonce of the authorization request.
    pub fn override_id_token_nonce(&self, nonce: Option<Option<&str>>) {
        self.state().id_token_nonce = nonce.map(|nonce| nonce.map(str::to_string));
    }

    /// Number of discovery fetches.
    #[must_use]
    pub fn discovery_fetches(&self) -> usize {
        self.counters.discovery.load(Ordering::SeqCst)
    }

    /// Number of challenge requests.
    #[must_use]
    pub fn challenge_requests(&self) -> usize {
        self.counters.challenges.load(Ordering::SeqCst)
    }

    /// Number of accepted or rejected signed challenges.
    #[must_use]
    pub fn verifications(&self) -> usize {
        self.counters.verifications.load(Ordering::SeqCst)
    }

    /// Number of SSO refresh round trips.
    #[must_use]
    pub fn sso_refreshes(&self) -> usize {
        self.counters.sso_refreshes.load(Ordering::SeqCst)
    }

    /// Number of token requests.
    #[must_use]
    pub fn exchanges(&self) -> usize {
        self.counters.exchanges.load(Ordering::SeqCst)
    }

    /// Number of paired-device authentications.
    #[must_use]
    pub fn alt_verifications(&self) -> usize {
        self.counters.alt_verifications.load(Ordering::SeqCst)
    }

    /// Number of registered devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.state().devices.len()
    }

    /// The callback an insurer app would deliver for a handoff started at
    /// `app_url`.
    ///
    /// # Panics
    /// Panics if `app_url` carries no `state`.
    #[must_use]
    pub fn insurer_callback(&self, app_url: &Url, redirect_uri: &str) -> Url {
        let state = app_url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state");
        let mut url = Url::parse(redirect_uri).expect("redirect uri");
        url.query_pairs_mut()
            .append_pair("code", "kk-code")
            .append_pair("state", &state)
            .append_pair("kk_app_redirect_uri", "https://kk.example/callback");
        url
    }

    fn check_online(&self) -> Result<(), ClientError> {
        if self.state().offline {
            return Err(ClientError::network("connection refused"));
        }
        Ok(())
    }

    fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    fn verify_own_token<T: serde::de::DeserializeOwned>(&self, token: &str) -> Result<T, ClientError> {
        let key = self
            .signing
            .certificate
            .verification_key()
            .map_err(|e| bad_request("2000", e.to_string()))?;
        decode_verified::<T>(token, &key, self.now())
            .map(|verified| verified.claims)
            .map_err(|e| bad_request("2032", format!("challenge invalid: {e}")))
    }

    fn open_nested(&self, envelope: &str) -> Result<String, ClientError> {
        let payload =
            Jwe::decrypt(envelope, &self.encryption).map_err(|e| bad_request("2030", e.to_string()))?;
        unnest(&payload).map_err(|e| bad_request("2030", e.to_string()))
    }

    fn issue_code(&self, challenge: &PendingChallenge, amr: &[&str], with_sso: bool) -> (String, Option<String>) {
        let mut state = self.state();
        let code = random_token();
        let insurance_id = state.insurance_id.clone();
        state.codes.insert(
            code.clone(),
            IssuedCode {
                code_challenge: challenge.code_challenge.clone(),
                nonce: challenge.nonce.clone(),
                insurance_id: insurance_id.clone(),
                amr: amr.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        let sso = with_sso.then(|| {
            let sso = random_token();
            state.sso_tokens.insert(sso.clone(), insurance_id);
            sso
        });
        (code, sso)
    }

    fn take_challenge(&self, challenge_token: &str) -> Result<(String, PendingChallenge), ClientError> {
        let claims: ChallengeClaims = self.verify_own_token(challenge_token)?;
        let state = claims
            .state
            .ok_or_else(|| bad_request("2030", "challenge without state"))?;
        let pending = self
            .state()
            .challenges
            .remove(&state)
            .ok_or_else(|| bad_request("2033", "challenge already used"))?;
        Ok((state, pending))
    }

    fn insurance_id_from_authorization(&self, authorization: &str) -> Result<String, ClientError> {
        let envelope = authorization
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("missing bearer token"))?;
        let access_token = self.open_nested(envelope).map_err(|_| unauthorized("undecryptable token"))?;
        let claims: serde_json::Value = self
            .verify_own_token(&access_token)
            .map_err(|_| unauthorized("invalid access token"))?;
        claims
            .get("idNummer")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| unauthorized("access token without idNummer"))
    }

    fn exchange_token(state: String, code: String, sso: Option<String>) -> ExchangeToken {
        ExchangeToken {
            code,
            sso,
            state,
            redirect: REDIRECT_URI.to_string(),
        }
    }
}

fn bad_request(code: &str, text: impl Into<String>) -> ClientError {
    ClientError::Server(
        ServerResponse::new(400, "invalid_request")
            .with_code(code)
            .with_text(text),
    )
}

fn unauthorized(text: &str) -> ClientError {
    ClientError::Server(ServerResponse::new(401, "invalid_token").with_text(text))
}

fn verify_signature(jws: &Jws, key: &EcPublicKey) -> Result<(), ClientError> {
    key.verify(jws.signing_input().as_bytes(), &jws.signature)
        .map_err(|_| bad_request("2031", "signature invalid"))
}

#[async_trait]
impl IdpClient for FakeIdp {
    async fn load_discovery_document(&self) -> Result<DiscoveryBundle, ClientError> {
        self.check_online()?;
        self.counters.discovery.fetch_add(1, Ordering::SeqCst);
        Ok(discovery_bundle(
            &self.base,
            &self.discovery,
            &self.signing,
            &self.encryption.public_key().expect("encryption key"),
            self.now(),
        ))
    }

    async fn request_challenge(
        &self,
        request: &ChallengeRequest,
        _document: &DiscoveryDocument,
    ) -> Result<ChallengeResponse, ClientError> {
        self.check_online()?;
        self.counters.challenges.fetch_add(1, Ordering::SeqCst);
        if request.code_challenge_method != "S256" {
            return Err(bad_request("2008", "code_challenge_method must be S256"));
        }
        let now = self.now();
        let lifetime = self.state().challenge_lifetime;
        let claims = ChallengeClaims {
            exp: now.unix_timestamp() + lifetime,
            iat: Some(now.unix_timestamp()),
            token_type: Some("challenge".to_string()),
            state: Some(request.state.clone()),
            nonce: Some(request.nonce.clone()),
            code_challenge: Some(request.code_challenge.clone()),
            scope: Some(request.scope.clone()),
            client_id: Some(request.client_id.clone()),
            redirect_uri: Some(request.redirect_uri.clone()),
        };
        let challenge = sign_jwt(
            &self.signing.signing_key(),
            &JwsHeader::bp256r1().with_kid("puk_idp_sig"),
            &claims,
        );
        self.state().challenges.insert(
            request.state.clone(),
            PendingChallenge {
                code_challenge: request.code_challenge.clone(),
                nonce: request.nonce.clone(),
            },
        );
        Ok(ChallengeResponse {
            challenge,
            user_consent: None,
        })
    }

    async fn verify(
        &self,
        signed_challenge: &str,
        _document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        self.check_online()?;
        self.counters.verifications.fetch_add(1, Ordering::SeqCst);
        let signed = self.open_nested(signed_challenge)?;
        let jws = Jws::parse(&signed).map_err(|e| bad_request("2030", e.to_string()))?;
        let certificate = jws
            .header
            .x5c
            .as_ref()
            .and_then(|chain| chain.first())
            .ok_or_else(|| bad_request("2030", "signed challenge without x5c"))
            .and_then(|der| {
                Certificate::from_base64(der).map_err(|e| bad_request("2030", e.to_string()))
            })?;
        let key = certificate
            .public_key()
            .map_err(|e| bad_request("2030", e.to_string()))?;
        verify_signature(&jws, &key)?;
        let challenge = unnest(&jws.payload).map_err(|e| bad_request("2030", e.to_string()))?;
        let (state, pending) = self.take_challenge(&challenge)?;
        let (code, sso) = self.issue_code(&pending, &["mfa", "sc", "pin"], true);
        Ok(Self::exchange_token(state, code, sso))
    }

    async fn refresh_with_sso_token(
        &self,
        unsigned_challenge: &str,
        sso_token: &str,
        _document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_online()?;
        self.counters.sso_refreshes.fetch_add(1, Ordering::SeqCst);
        {
            let state = self.state();
            if state.reject_sso || !state.sso_tokens.contains_key(sso_token) {
                return Err(bad_request("2040", "SSO token not accepted"));
            }
        }
        let (state, pending) = self.take_challenge(unsigned_challenge)?;
        let (code, _) = self.issue_code(&pending, &["mfa", "sc", "pin"], false);
        Ok(Self::exchange_token(state, code, None))
    }

    async fn exchange(
        &self,
        request: &TokenRequest,
        _document: &DiscoveryDocument,
    ) -> Result<TokenResponse, ClientError> {
        self.check_online()?;
        self.counters.exchanges.fetch_add(1, Ordering::SeqCst);
        if request.grant_type != "authorization_code" {
            return Err(bad_request("3014", "unsupported grant_type"));
        }
        let issued = self
            .state()
            .codes
            .remove(&request.code)
            .ok_or_else(|| bad_request("3011", "unknown authorization code"))?;
        let verifier_json = Jwe::decrypt(&request.key_verifier, &self.encryption)
            .map_err(|e| bad_request("3015", e.to_string()))?;
        let verifier: KeyVerifier = serde_json::from_slice(&verifier_json)
            .map_err(|e| bad_request("3015", e.to_string()))?;
        if verifier.code_verifier != request.code_verifier
            || code_challenge(&verifier.code_verifier) != issued.code_challenge
        {
            return Err(bad_request("3016", "code_verifier does not match"));
        }
        let token_key: [u8; 32] = b64url_decode(&verifier.token_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| bad_request("3015", "token_key must be 32 bytes"))?;

        let now = self.now().unix_timestamp();
        let expires_in = self.state().expires_in;
        let key = self.signing.signing_key();
        let header = JwsHeader::bp256r1().with_kid("puk_idp_sig");
        let access_token = sign_jwt(
            &key,
            &header,
            &json!({
                "iss": self.base,
                "iat": now,
                "exp": now + expires_in,
                "idNummer": issued.insurance_id,
                "amr": issued.amr,
                "client_id": request.client_id,
                "jti": random_token(),
            }),
        );
        let mut id_claims = json!({
            "iss": self.base,
            "aud": request.client_id,
            "iat": now,
            "auth_time": now,
            "exp": now + expires_in,
            "nonce": issued.nonce,
            "idNummer": issued.insurance_id,
            "given_name": "Heinz",
            "family_name": "Hillbert",
            "acr": "gematik-ehealth-loa-high",
            "amr": issued.amr,
            "sub": b64url(&crate::crypto::sha256(issued.insurance_id.as_bytes())),
        });
        let nonce_override = self.state().id_token_nonce.clone();
        if let (Some(nonce), Some(claims)) = (nonce_override, id_claims.as_object_mut()) {
            match nonce {
                Some(nonce) => claims.insert("nonce".to_string(), nonce.into()),
                None => claims.remove("nonce"),
            };
        }
        let id_token = sign_jwt(&key, &header, &id_claims);
        let seal = |token: &str| {
            nest(token)
                .and_then(|payload| {
                    Jwe::encrypt_direct(&payload, &token_key, JweOptions::default().with_cty(CTY_NJWT))
                })
                .map_err(|e| ClientError::decoding(e.to_string()))
        };
        Ok(TokenResponse {
            access_token: seal(&access_token)?,
            expires_in,
            id_token: seal(&id_token)?,
            token_type: "Bearer".to_string(),
        })
    }

    async fn register_device(
        &self,
        encrypted_registration: &str,
        authorization: &str,
        _document: &DiscoveryDocument,
    ) -> Result<PairingEntry, ClientError> {
        self.check_online()?;
        let insurance_id = self.insurance_id_from_authorization(authorization)?;
        let registration_json = Jwe::decrypt(encrypted_registration, &self.encryption)
            .map_err(|e| bad_request("4001", e.to_string()))?;
        let registration: RegistrationData = serde_json::from_slice(&registration_json)
            .map_err(|e| bad_request("4001", e.to_string()))?;
        let certificate = Certificate::from_base64(&registration.auth_cert)
            .map_err(|e| bad_request("4001", e.to_string()))?;
        let card_key = certificate
            .public_key()
            .map_err(|e| bad_request("4001", e.to_string()))?;
        let jws = Jws::parse(&registration.signed_pairing_data)
            .map_err(|e| bad_request("4001", e.to_string()))?;
        verify_signature(&jws, &card_key)?;
        let pairing: PairingData = jws
            .claims()
            .map_err(|e| bad_request("4001", e.to_string()))?;
        if pairing.serialnumber != certificate.serial_hex() {
            return Err(bad_request("4002", "pairing data does not match the certificate"));
        }
        let spki = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&pairing.se_subject_public_key_info)
                .map_err(|e| bad_request("4001", e.to_string()))?
        };
        let public_key =
            EcPublicKey::from_spki_der(&spki).map_err(|e| bad_request("4001", e.to_string()))?;

        let entry = PairingEntry {
            name: registration.device_information.name.clone(),
            signed_pairing_data: registration.signed_pairing_data.clone(),
            creation_time: self.now().unix_timestamp(),
            pairing_entry_version: "1.0".to_string(),
        };
        self.state().devices.insert(
            pairing.key_identifier,
            Device {
                entry: entry.clone(),
                public_key,
                insurance_id,
            },
        );
        Ok(entry)
    }

    async fn unregister_device(
        &self,
        key_identifier: &str,
        authorization: &str,
        _document: &DiscoveryDocument,
    ) -> Result<(), ClientError> {
        self.check_online()?;
        let insurance_id = self.insurance_id_from_authorization(authorization)?;
        let mut state = self.state();
        let owned = state
            .devices
            .get(key_identifier)
            .is_some_and(|device| device.insurance_id == insurance_id);
        if !owned {
            return Err(ClientError::Server(ServerResponse::new(404, "not_found")));
        }
        state.devices.remove(key_identifier);
        Ok(())
    }

    async fn list_devices(
        &self,
        authorization: &str,
        _document: &DiscoveryDocument,
    ) -> Result<PairingEntries, ClientError> {
        self.check_online()?;
        let insurance_id = self.insurance_id_from_authorization(authorization)?;
        let state = self.state();
        let mut pairing_entries: Vec<PairingEntry> = state
            .devices
            .values()
            .filter(|device| device.insurance_id == insurance_id)
            .map(|device| device.entry.clone())
            .collect();
        pairing_entries.sort_by_key(|entry| entry.creation_time);
        Ok(PairingEntries { pairing_entries })
    }

    async fn alt_verify(
        &self,
        encrypted_authentication_data: &str,
        _document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        self.check_online()?;
        self.counters.alt_verifications.fetch_add(1, Ordering::SeqCst);
        let signed = self.open_nested(encrypted_authentication_data)?;
        let jws = Jws::parse(&signed).map_err(|e| bad_request("2030", e.to_string()))?;
        let data: AuthenticationData = jws
            .claims()
            .map_err(|e| bad_request("2030", e.to_string()))?;
        let key = self
            .state()
            .devices
            .get(&data.key_identifier)
            .map(|device| device.public_key.clone())
            .ok_or_else(|| bad_request("2000", "device not registered"))?;
        verify_signature(&jws, &key)?;
        let (state, pending) = self.take_challenge(&data.challenge_token)?;
        let amr: Vec<&str> = data.amr.iter().map(String::as_str).collect();
        let (code, sso) = self.issue_code(&pending, &amr, true);
        Ok(Self::exchange_token(state, code, sso))
    }

    async fn load_insurer_directory(
        &self,
        _document: &DiscoveryDocument,
    ) -> Result<String, ClientError> {
        self.check_online()?;
        let now = self.now().unix_timestamp();
        let insurers = self.state().insurers.clone();
        Ok(sign_jwt(
            &self.discovery.signing_key(),
            &JwsHeader::bp256r1().with_x5c(vec![self.discovery.certificate.to_base64()]),
            &json!({
                "kk_app_list": insurers,
                "iat": now,
                "exp": now + 86_400,
            }),
        ))
    }

    async fn start_external_authentication(
        &self,
        request: &ExternalAuthRequest,
        _document: &DiscoveryDocument,
    ) -> Result<Url, ClientError> {
        self.check_online()?;
        if !self
            .state()
            .insurers
            .iter()
            .any(|entry| entry.identifier == request.kk_app_id)
        {
            return Err(bad_request("2012", "unknown kk_app_id"));
        }
        self.state().external.insert(
            request.state.clone(),
            PendingChallenge {
                code_challenge: request.code_challenge.clone(),
                nonce: request.nonce.clone(),
            },
        );
        let mut url = Url::parse("https://kk.example/app").map_err(|e| ClientError::decoding(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("kk_app_id", &request.kk_app_id)
            .append_pair("state", &request.state);
        Ok(url)
    }

    async fn complete_external_authentication(
        &self,
        callback: &ExternalAuthCallback,
        _document: &DiscoveryDocument,
    ) -> Result<ExchangeToken, ClientError> {
        self.check_online()?;
        let pending = self
            .state()
            .external
            .remove(&callback.state)
            .ok_or_else(|| bad_request("2033", "unknown state"))?;
        let (code, sso) = self.issue_code(&pending, &["mfa", "ext"], true);
        Ok(Self::exchange_token(callback.state.clone(), code, sso))
    }
}
