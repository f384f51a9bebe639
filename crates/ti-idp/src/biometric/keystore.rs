//! Platform key store boundary and a portable software implementation.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use p256::PublicKey;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;

use super::error::KeyStoreError;

/// Device-resident key storage gated by user presence.
///
/// Private keys never leave the store; callers only see public keys and
/// signatures.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Creates a P-256 key under `tag`, replacing any existing key.
    ///
    /// # Errors
    ///
    /// Returns `BiometryNotEnrolled` if no biometry is enrolled.
    async fn create_key(&self, tag: &str) -> Result<PublicKey, KeyStoreError>;

    /// Public key stored under `tag`, if any.
    ///
    /// # Errors
    ///
    /// Returns a platform error if the store cannot be queried.
    async fn public_key(&self, tag: &str) -> Result<Option<PublicKey>, KeyStoreError>;

    /// Deletes the key under `tag`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a platform error if the key cannot be deleted.
    async fn delete_key(&self, tag: &str) -> Result<(), KeyStoreError>;

    /// Prompts the user with `reason` and signs `message` (ES256, `r || s`).
    ///
    /// # Errors
    ///
    /// Returns `UserCancelled`, `AuthenticationFailed`, `Lockout` or
    /// `KeyNotFound`.
    async fn sign(&self, tag: &str, message: &[u8], reason: &str) -> Result<Vec<u8>, KeyStoreError>;
}

/// How the simulated user answers the presence prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptOutcome {
    /// The user authenticates.
    #[default]
    Approve,
    /// The user dismisses the prompt.
    Cancel,
    /// The biometric match fails.
    Fail,
    /// The biometry is locked out.
    Lockout,
}

/// Software key store holding P-256 keys in memory.
///
/// Prompts are serialized, like on real platforms.
pub struct SoftwareKeyStore {
    keys: DashMap<String, SigningKey>,
    enrolled: AtomicBool,
    outcome: Mutex<PromptOutcome>,
    prompt: tokio::sync::Mutex<()>,
    prompts: AtomicUsize,
}

impl Default for SoftwareKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareKeyStore {
    /// Creates an enrolled store that approves every prompt.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            enrolled: AtomicBool::new(true),
            outcome: Mutex::new(PromptOutcome::Approve),
            prompt: tokio::sync::Mutex::new(()),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Changes the enrollment. Removing enrollment invalidates all keys.
    pub fn set_enrolled(&self, enrolled: bool) {
        self.enrolled.store(enrolled, Ordering::SeqCst);
        if !enrolled {
            self.keys.clear();
        }
    }

    /// Sets the answer to subsequent prompts.
    pub fn set_prompt_outcome(&self, outcome: PromptOutcome) {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
    }

    /// Number of prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Number of keys held.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl SecureKeyStore for SoftwareKeyStore {
    async fn create_key(&self, tag: &str) -> Result<PublicKey, KeyStoreError> {
        if !self.enrolled.load(Ordering::SeqCst) {
            return Err(KeyStoreError::BiometryNotEnrolled);
        }
        let key = SigningKey::random(&mut OsRng);
        let public = PublicKey::from(key.verifying_key());
        self.keys.insert(tag.to_string(), key);
        Ok(public)
    }

    async fn public_key(&self, tag: &str) -> Result<Option<PublicKey>, KeyStoreError> {
        Ok(self
            .keys
            .get(tag)
            .map(|key| PublicKey::from(key.verifying_key())))
    }

    async fn delete_key(&self, tag: &str) -> Result<(), KeyStoreError> {
        self.keys.remove(tag);
        Ok(())
    }

    async fn sign(&self, tag: &str, message: &[u8], reason: &str) -> Result<Vec<u8>, KeyStoreError> {
        let _prompt = self.prompt.lock().await;
        self.prompts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(reason, "User presence prompt");

        if !self.enrolled.load(Ordering::SeqCst) {
            return Err(KeyStoreError::BiometryNotEnrolled);
        }
        let outcome = *self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            PromptOutcome::Approve => {}
            PromptOutcome::Cancel => return Err(KeyStoreError::UserCancelled),
            PromptOutcome::Fail => return Err(KeyStoreError::AuthenticationFailed),
            PromptOutcome::Lockout => return Err(KeyStoreError::Lockout),
        }
        let key = self.keys.get(tag).ok_or(KeyStoreError::KeyNotFound)?;
        let signature: Signature = key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::VerifyingKey;
    use p256::ecdsa::signature::Verifier;

    use super::*;

    #[tokio::test]
    async fn test_sign_verifies_with_public_key() {
        let store = SoftwareKeyStore::new();
        let public = store.create_key("k1").await.unwrap();
        let signature = store.sign("k1", b"message", "login").await.unwrap();
        assert_eq!(signature.len(), 64);

        let signature = Signature::from_slice(&signature).unwrap();
        VerifyingKey::from(&public)
            .verify(b"message", &signature)
            .unwrap();
        assert_eq!(store.prompts(), 1);
    }

    #[tokio::test]
    async fn test_prompt_outcomes() {
        let store = SoftwareKeyStore::new();
        store.create_key("k1").await.unwrap();

        store.set_prompt_outcome(PromptOutcome::Cancel);
        assert_eq!(store.sign("k1", b"m", "r").await, Err(KeyStoreError::UserCancelled));
        store.set_prompt_outcome(PromptOutcome::Lockout);
        assert_eq!(store.sign("k1", b"m", "r").await, Err(KeyStoreError::Lockout));
        store.set_prompt_outcome(PromptOutcome::Approve);
        assert_eq!(store.sign("k2", b"m", "r").await, Err(KeyStoreError::KeyNotFound));
    }

    #[tokio::test]
    async fn test_enrollment_removal_invalidates_keys() {
        let store = SoftwareKeyStore::new();
        store.create_key("k1").await.unwrap();
        store.set_enrolled(false);
        assert_eq!(store.public_key("k1").await.unwrap(), None);
        assert_eq!(store.create_key("k2").await, Err(KeyStoreError::BiometryNotEnrolled));
    }
}
