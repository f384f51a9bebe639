//! Session Token Store.
//!
//! Durable, profile-scoped storage of the live [`SessionToken`], the last
//! known discovery document and the device pairing records.
//!
//! # Invariants
//!
//! - At most one live token per profile. Every `save` replaces the previous
//!   token and every `clear` removes it; both notify the profile's
//!   subscribers, which is how a transport layer learns that its binding is
//!   stale.
//! - Concurrent reads are allowed; writes for one profile are serialized.

pub mod error;
pub mod file;
pub mod memory;
pub mod token;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

pub use error::StoreError;
pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;
pub use token::{SessionToken, SsoToken};

use crate::biometric::PairingRecord;
use crate::discovery::StoredDiscovery;
use crate::profile::ProfileId;

/// Persistence of session tokens and discovery metadata.
#[async_trait]
pub trait SessionTokenStore: Send + Sync {
    /// Loads the live token of a profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium fails or the record is corrupt.
    async fn load(&self, profile: &ProfileId) -> Result<Option<SessionToken>, StoreError>;

    /// Replaces the live token of a profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be written.
    async fn save(&self, profile: &ProfileId, token: &SessionToken) -> Result<(), StoreError>;

    /// Removes the live token of a profile. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium fails.
    async fn clear(&self, profile: &ProfileId) -> Result<(), StoreError>;

    /// Loads the last known discovery document.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium fails or the record is corrupt.
    async fn load_discovery(&self) -> Result<Option<StoredDiscovery>, StoreError>;

    /// Persists the discovery document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    async fn save_discovery(&self, discovery: &StoredDiscovery) -> Result<(), StoreError>;

    /// Observes token changes of a profile. The receiver starts with the
    /// current in-memory view, which is `None` until the first load or save.
    fn subscribe(&self, profile: &ProfileId) -> watch::Receiver<Option<SessionToken>>;
}

/// Persistence of device pairing records.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Loads the pairing record of a profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium fails.
    async fn load_pairing(&self, profile: &ProfileId) -> Result<Option<PairingRecord>, StoreError>;

    /// Stores the pairing record of a profile, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    async fn save_pairing(&self, profile: &ProfileId, record: &PairingRecord) -> Result<(), StoreError>;

    /// Removes the pairing record of a profile. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium fails.
    async fn remove_pairing(&self, profile: &ProfileId) -> Result<(), StoreError>;
}

/// Per-profile watch channels shared by the store implementations.
#[derive(Default)]
pub(crate) struct TokenWatchers {
    senders: DashMap<ProfileId, watch::Sender<Option<SessionToken>>>,
}

impl TokenWatchers {
    pub(crate) fn subscribe(&self, profile: &ProfileId) -> watch::Receiver<Option<SessionToken>> {
        self.senders
            .entry(profile.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub(crate) fn publish(&self, profile: &ProfileId, token: Option<SessionToken>) {
        self.senders
            .entry(profile.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(token);
    }
}
