//! File-backed store writing one JSON document per record.
//!
//! Layout below the root directory:
//!
//! ```text
//! discovery.json
//! tokens/<sha256(profile)>.json
//! pairings/<sha256(profile)>.json
//! ```
//!
//! Every write goes to a temporary file in the same directory and is then
//! renamed over the target, so readers never observe a partial record.
//!
//! # Security Considerations
//!
//! Without a record key the files hold the access, ID and SSO tokens as
//! plaintext JSON; their protection is then the file system's. With
//! [`FileTokenStore::with_record_key`] every record is sealed as a `dir`
//! A256GCM JWE whose `kid` names the record's slot, so a sealed record
//! copied to another profile's slot does not open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use zeroize::Zeroizing;

use super::{PairingStore, SessionToken, SessionTokenStore, StoreError, TokenWatchers};
use crate::biometric::PairingRecord;
use crate::codec::{Jwe, JweOptions};
use crate::discovery::StoredDiscovery;
use crate::profile::ProfileId;

const TOKENS_DIR: &str = "tokens";
const PAIRINGS_DIR: &str = "pairings";
const DISCOVERY_FILE: &str = "discovery.json";

/// Store persisting records as JSON files below a root directory.
pub struct FileTokenStore {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    watchers: TokenWatchers,
    record_key: Option<Zeroizing<[u8; 32]>>,
}

impl FileTokenStore {
    /// Creates a store below `root`. Directories are created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
            watchers: TokenWatchers::default(),
            record_key: None,
        }
    }

    /// Seals every record with `key` (AES-256-GCM). Records written
    /// without a key can no longer be read.
    #[must_use]
    pub fn with_record_key(mut self, key: [u8; 32]) -> Self {
        self.record_key = Some(Zeroizing::new(key));
        self
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_path(&self, dir: &str, profile: &ProfileId) -> PathBuf {
        let name = hex::encode(crate::crypto::sha256(profile.as_str().as_bytes()));
        self.root.join(dir).join(format!("{name}.json"))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = match &self.record_key {
            Some(key) => Zeroizing::new(open_record(&bytes, key, &slot(path))?),
            None => Zeroizing::new(bytes),
        };
        Ok(Some(serde_json::from_slice(&json)?))
    }

    fn encode<T: Serialize>(&self, path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
        let json = Zeroizing::new(serde_json::to_vec_pretty(value)?);
        match &self.record_key {
            Some(key) => Jwe::encrypt_direct(&json, key, JweOptions::default().with_kid(slot(path)))
                .map(String::into_bytes)
                .map_err(|e| StoreError::Encryption(e.to_string())),
            None => Ok(json.to_vec()),
        }
    }

    async fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = self.encode(path, value)?;
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        self.replace(path, &bytes).await
    }

    /// Atomically replaces `path`. The caller holds the path lock.
    async fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::io(format!("{} has no parent", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool, StoreError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        Self::unlink(path).await
    }

    async fn unlink(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Name of the record slot a sealed record is bound to.
fn slot(path: &Path) -> String {
    let name = |p: Option<&std::ffi::OsStr>| p.map(|n| n.to_string_lossy().into_owned());
    let dir = name(path.parent().and_then(Path::file_name)).unwrap_or_default();
    let stem = name(path.file_stem()).unwrap_or_default();
    format!("{dir}/{stem}")
}

fn open_record(bytes: &[u8], key: &[u8; 32], slot: &str) -> Result<Vec<u8>, StoreError> {
    let compact = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Encryption("sealed record is not text".to_string()))?
        .trim();
    let header = Jwe::header(compact).map_err(|e| StoreError::Encryption(e.to_string()))?;
    if header.kid.as_deref() != Some(slot) {
        return Err(StoreError::Encryption("record sealed for another slot".to_string()));
    }
    Jwe::decrypt_direct(compact, key).map_err(|e| StoreError::Encryption(e.to_string()))
}

#[async_trait]
impl SessionTokenStore for FileTokenStore {
    async fn load(&self, profile: &ProfileId) -> Result<Option<SessionToken>, StoreError> {
        self.read(&self.profile_path(TOKENS_DIR, profile)).await
    }

    async fn save(&self, profile: &ProfileId, token: &SessionToken) -> Result<(), StoreError> {
        let path = self.profile_path(TOKENS_DIR, profile);
        let bytes = self.encode(&path, token)?;
        // Publish under the path lock so watchers see writes in file order.
        let lock = self.lock_for(&path);
        let guard = lock.lock().await;
        self.replace(&path, &bytes).await?;
        self.watchers.publish(profile, Some(token.clone()));
        drop(guard);
        tracing::debug!(profile = %profile, token = %token.fingerprint(), "Session token persisted");
        Ok(())
    }

    async fn clear(&self, profile: &ProfileId) -> Result<(), StoreError> {
        let path = self.profile_path(TOKENS_DIR, profile);
        let lock = self.lock_for(&path);
        let guard = lock.lock().await;
        let removed = Self::unlink(&path).await?;
        self.watchers.publish(profile, None);
        drop(guard);
        if removed {
            tracing::debug!(profile = %profile, "Persisted session token removed");
        }
        Ok(())
    }

    async fn load_discovery(&self) -> Result<Option<StoredDiscovery>, StoreError> {
        self.read(&self.root.join(DISCOVERY_FILE)).await
    }

    async fn save_discovery(&self, discovery: &StoredDiscovery) -> Result<(), StoreError> {
        self.write(&self.root.join(DISCOVERY_FILE), discovery).await
    }

    fn subscribe(&self, profile: &ProfileId) -> watch::Receiver<Option<SessionToken>> {
        self.watchers.subscribe(profile)
    }
}

#[async_trait]
impl PairingStore for FileTokenStore {
    async fn load_pairing(&self, profile: &ProfileId) -> Result<Option<PairingRecord>, StoreError> {
        self.read(&self.profile_path(PAIRINGS_DIR, profile)).await
    }

    async fn save_pairing(&self, profile: &ProfileId, record: &PairingRecord) -> Result<(), StoreError> {
        self.write(&self.profile_path(PAIRINGS_DIR, profile), record)
            .await
    }

    async fn remove_pairing(&self, profile: &ProfileId) -> Result<(), StoreError> {
        self.remove(&self.profile_path(PAIRINGS_DIR, profile))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::store::SsoToken;

    fn token() -> SessionToken {
        SessionToken {
            access_token: "access".to_string(),
            id_token: "id".to_string(),
            sso_token: Some(SsoToken {
                value: "sso".to_string(),
                expires_at: datetime!(2024-05-01 22:00 UTC),
            }),
            expires_at: datetime!(2024-05-01 10:05 UTC),
            token_type: "Bearer".to_string(),
            insurance_id: Some("X110000001".to_string()),
        }
    }

    #[tokio::test]
    async fn test_token_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let profile = ProfileId::new("profile-1");

        let store = FileTokenStore::new(dir.path());
        store.save(&profile, &token()).await.unwrap();

        let reopened = FileTokenStore::new(dir.path());
        assert_eq!(reopened.load(&profile).await.unwrap(), Some(token()));
        assert_eq!(reopened.load(&ProfileId::new("other")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let profile = ProfileId::new("profile-1");

        store.clear(&profile).await.unwrap();
        store.save(&profile, &token()).await.unwrap();
        store.clear(&profile).await.unwrap();
        store.clear(&profile).await.unwrap();
        assert_eq!(store.load(&profile).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let profile = ProfileId::new("profile-1");
        store.save(&profile, &token()).await.unwrap();
        store.save(&profile, &token()).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join(TOKENS_DIR)).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
        assert!(!names[0].contains("profile-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_published_value_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileTokenStore::new(dir.path()));
        let profile = ProfileId::new("profile-1");
        let rx = store.subscribe(&profile);

        for _ in 0..20 {
            let saving = {
                let store = store.clone();
                let profile = profile.clone();
                tokio::spawn(async move { store.save(&profile, &token()).await.unwrap() })
            };
            let clearing = {
                let store = store.clone();
                let profile = profile.clone();
                tokio::spawn(async move { store.clear(&profile).await.unwrap() })
            };
            saving.await.unwrap();
            clearing.await.unwrap();

            assert_eq!(*rx.borrow(), store.load(&profile).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_plaintext_records_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let profile = ProfileId::new("profile-1");
        store.save(&profile, &token()).await.unwrap();

        let raw = tokio::fs::read_to_string(store.profile_path(TOKENS_DIR, &profile))
            .await
            .unwrap();
        assert!(raw.contains("\"access\""));
    }

    #[tokio::test]
    async fn test_sealed_records_hide_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let key = [0x11u8; 32];
        let profile = ProfileId::new("profile-1");
        let store = FileTokenStore::new(dir.path()).with_record_key(key);
        store.save(&profile, &token()).await.unwrap();

        let raw = tokio::fs::read_to_string(store.profile_path(TOKENS_DIR, &profile))
            .await
            .unwrap();
        assert!(!raw.contains("access_token"));
        assert!(!raw.contains("X110000001"));

        let reopened = FileTokenStore::new(dir.path()).with_record_key(key);
        assert_eq!(reopened.load(&profile).await.unwrap(), Some(token()));

        let wrong_key = FileTokenStore::new(dir.path()).with_record_key([0x22u8; 32]);
        assert!(matches!(
            wrong_key.load(&profile).await,
            Err(StoreError::Encryption(_))
        ));
        let without_key = FileTokenStore::new(dir.path());
        assert!(matches!(
            without_key.load(&profile).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_sealed_record_does_not_open_in_other_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path()).with_record_key([0x11u8; 32]);
        let victim = ProfileId::new("profile-1");
        let attacker = ProfileId::new("profile-2");
        store.save(&attacker, &token()).await.unwrap();

        tokio::fs::copy(
            store.profile_path(TOKENS_DIR, &attacker),
            store.profile_path(TOKENS_DIR, &victim),
        )
        .await
        .unwrap();
        assert!(matches!(
            store.load(&victim).await,
            Err(StoreError::Encryption(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let profile = ProfileId::new("profile-1");
        let path = store.profile_path(TOKENS_DIR, &profile);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(matches!(
            store.load(&profile).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
