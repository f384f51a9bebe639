use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use super::error::ExtAuthError;
use super::insurer::InsurerEntry;
use crate::challenge::ChallengeSession;
use crate::clock::SharedClock;

/// An authorization handed off to an insurer's app, waiting for its
/// callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExternalAuthRequest {
    /// Correlation state, cryptographically random.
    pub state: String,
    /// Secrets needed to finish the exchange.
    pub challenge_session: ChallengeSession,
    /// Insurer the user was handed off to.
    pub insurer: InsurerEntry,
    /// Creation time, for expiry.
    pub created_at: OffsetDateTime,
}

impl PendingExternalAuthRequest {
    /// Creates a request keyed by the session's own state.
    #[must_use]
    pub fn new(challenge_session: ChallengeSession, insurer: InsurerEntry, now: OffsetDateTime) -> Self {
        Self {
            state: challenge_session.state.clone(),
            challenge_session,
            insurer,
            created_at: now,
        }
    }
}

/// Keyed store of pending delegated authentications.
///
/// Reads are concurrent; writes are serialized per state by the map's
/// shard locks.
pub struct ExtAuthRequestStore {
    pending: DashMap<String, PendingExternalAuthRequest>,
    ttl: Duration,
    clock: SharedClock,
}

impl ExtAuthRequestStore {
    /// Creates an empty store whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Registers or removes the request for `state`.
    ///
    /// # Errors
    /// Returns `InvalidStateParameter` if `request` is keyed by a different
    /// state, or if `state` is already taken by another request.
    pub fn set(
        &self,
        request: Option<PendingExternalAuthRequest>,
        state: &str,
    ) -> Result<(), ExtAuthError> {
        match request {
            None => {
                self.pending.remove(state);
                tracing::debug!("Pending external authentication removed");
                Ok(())
            }
            Some(request) => {
                if request.state != state || request.challenge_session.state != state {
                    tracing::warn!("Rejected external authentication request with mismatched state");
                    return Err(ExtAuthError::InvalidStateParameter);
                }
                match self.pending.entry(state.to_string()) {
                    Entry::Occupied(existing) if existing.get() != &request => {
                        Err(ExtAuthError::InvalidStateParameter)
                    }
                    Entry::Occupied(_) => Ok(()),
                    Entry::Vacant(slot) => {
                        tracing::info!(
                            insurer = %request.insurer.identifier,
                            "External authentication pending"
                        );
                        slot.insert(request);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Looks up the request for `state` without consuming it.
    ///
    /// # Errors
    /// Returns `InvalidNonce` for an unknown or expired state.
    pub fn get(&self, state: &str) -> Result<PendingExternalAuthRequest, ExtAuthError> {
        let request = self
            .pending
            .get(state)
            .map(|entry| entry.value().clone())
            .ok_or(ExtAuthError::InvalidNonce)?;
        if self.is_expired(&request) {
            self.pending.remove(state);
            return Err(ExtAuthError::InvalidNonce);
        }
        Ok(request)
    }

    /// Removes and returns the request for `state`.
    ///
    /// # Errors
    /// Returns `InvalidNonce` for an unknown or expired state.
    pub fn take(&self, state: &str) -> Result<PendingExternalAuthRequest, ExtAuthError> {
        let (_, request) = self.pending.remove(state).ok_or(ExtAuthError::InvalidNonce)?;
        if self.is_expired(&request) {
            return Err(ExtAuthError::InvalidNonce);
        }
        Ok(request)
    }

    /// Drops every pending request.
    pub fn reset(&self) {
        let count = self.pending.len();
        self.pending.clear();
        tracing::debug!(count, "Pending external authentications reset");
    }

    /// Drops expired requests and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.pending.len();
        let now = self.clock.now();
        self.pending
            .retain(|_, request| !expired_at(request, self.ttl, now));
        before.saturating_sub(self.pending.len())
    }

    /// Number of requests currently held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn is_expired(&self, request: &PendingExternalAuthRequest) -> bool {
        expired_at(request, self.ttl, self.clock.now())
    }
}

fn expired_at(request: &PendingExternalAuthRequest, ttl: Duration, now: OffsetDateTime) -> bool {
    now - request.created_at >= ttl
}
