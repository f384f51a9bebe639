//! In-memory store, for tests and for platforms that persist elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use super::{PairingStore, SessionToken, SessionTokenStore, StoreError, TokenWatchers};
use crate::biometric::PairingRecord;
use crate::discovery::StoredDiscovery;
use crate::profile::ProfileId;

/// Store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<ProfileId, SessionToken>>,
    pairings: RwLock<HashMap<ProfileId, PairingRecord>>,
    discovery: RwLock<Option<StoredDiscovery>>,
    watchers: TokenWatchers,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionTokenStore for MemoryTokenStore {
    async fn load(&self, profile: &ProfileId) -> Result<Option<SessionToken>, StoreError> {
        Ok(self.tokens.read().await.get(profile).cloned())
    }

    async fn save(&self, profile: &ProfileId, token: &SessionToken) -> Result<(), StoreError> {
        // Publish under the write lock so watchers see writes in store order.
        let mut tokens = self.tokens.write().await;
        tokens.insert(profile.clone(), token.clone());
        self.watchers.publish(profile, Some(token.clone()));
        drop(tokens);
        tracing::debug!(profile = %profile, token = %token.fingerprint(), "Session token stored");
        Ok(())
    }

    async fn clear(&self, profile: &ProfileId) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        let removed = tokens.remove(profile).is_some();
        self.watchers.publish(profile, None);
        drop(tokens);
        if removed {
            tracing::debug!(profile = %profile, "Session token cleared");
        }
        Ok(())
    }

    async fn load_discovery(&self) -> Result<Option<StoredDiscovery>, StoreError> {
        Ok(self.discovery.read().await.clone())
    }

    async fn save_discovery(&self, discovery: &StoredDiscovery) -> Result<(), StoreError> {
        *self.discovery.write().await = Some(discovery.clone());
        Ok(())
    }

    fn subscribe(&self, profile: &ProfileId) -> watch::Receiver<Option<SessionToken>> {
        self.watchers.subscribe(profile)
    }
}

#[async_trait]
impl PairingStore for MemoryTokenStore {
    async fn load_pairing(&self, profile: &ProfileId) -> Result<Option<PairingRecord>, StoreError> {
        Ok(self.pairings.read().await.get(profile).cloned())
    }

    async fn save_pairing(&self, profile: &ProfileId, record: &PairingRecord) -> Result<(), StoreError> {
        self.pairings
            .write()
            .await
            .insert(profile.clone(), record.clone());
        Ok(())
    }

    async fn remove_pairing(&self, profile: &ProfileId) -> Result<(), StoreError> {
        self.pairings.write().await.remove(profile);
        Ok(())
    }
}
