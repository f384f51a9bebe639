//! Single-flight refresh per profile.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use tokio::sync::Mutex;

use crate::error::{IdpError, ReauthReason};
use crate::profile::ProfileId;
use crate::store::SessionToken;

type InFlight = Shared<BoxFuture<'static, Result<SessionToken, IdpError>>>;

/// Collapses concurrent refreshes of one profile into a single round trip.
///
/// The first caller starts the refresh; every caller arriving while it
/// runs awaits the same future and observes the same token or error.
/// Shared between all sessions of a process, keyed by profile.
///
/// Each profile also carries a generation that [`invalidate`] bumps. A
/// refresh started under an older generation must not store its token.
///
/// [`invalidate`]: RefreshCoordinator::invalidate
#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    in_flight: Arc<DashMap<ProfileId, InFlight>>,
    generations: Arc<DashMap<ProfileId, Arc<Mutex<u64>>>>,
}

/// Removes the in-flight entry when the last waiting caller goes away.
struct Waiter<'a> {
    in_flight: &'a DashMap<ProfileId, InFlight>,
    profile: &'a ProfileId,
    shared: InFlight,
    finished: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let finished = self.finished;
        let shared = &self.shared;
        self.in_flight.remove_if(self.profile, |_, current| {
            // The map and this waiter hold the only references left.
            current.ptr_eq(shared) && (finished || current.strong_count() == Some(2))
        });
    }
}

impl RefreshCoordinator {
    /// Creates a coordinator with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the refresh in flight for `profile`, or starts one with
    /// `start`.
    pub async fn run<F>(&self, profile: &ProfileId, start: F) -> Result<SessionToken, IdpError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<SessionToken, IdpError>>,
    {
        let shared = match self.in_flight.entry(profile.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(profile = %profile, "Joining refresh in flight");
                entry.get().clone()
            }
            Entry::Vacant(slot) => {
                let shared = start().shared();
                slot.insert(shared.clone());
                shared
            }
        };
        let mut waiter = Waiter {
            in_flight: &self.in_flight,
            profile,
            shared,
            finished: false,
        };
        let result = waiter.shared.clone().await;
        waiter.finished = true;
        result
    }

    fn fence(&self, profile: &ProfileId) -> Arc<Mutex<u64>> {
        self.generations
            .entry(profile.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Current generation of `profile`.
    pub async fn generation(&self, profile: &ProfileId) -> u64 {
        *self.fence(profile).lock().await
    }

    /// Runs `store` unless `profile` was invalidated after `generation`
    /// was read. Invalidation waits until `store` has finished.
    ///
    /// # Errors
    /// Returns `ReauthenticationRequired(NotAuthenticated)` for a stale
    /// generation, otherwise the error of `store`.
    pub async fn commit<F, T>(
        &self,
        profile: &ProfileId,
        generation: u64,
        store: F,
    ) -> Result<T, IdpError>
    where
        F: Future<Output = Result<T, IdpError>>,
    {
        let fence = self.fence(profile);
        let current = fence.lock().await;
        if *current != generation {
            tracing::info!(profile = %profile, "Discarding refresh of an invalidated session");
            return Err(IdpError::ReauthenticationRequired(
                ReauthReason::NotAuthenticated,
            ));
        }
        store.await
    }

    /// Starts a new generation for `profile`, detaches the refresh in
    /// flight and runs `clear` before any refresh can commit again.
    ///
    /// # Errors
    /// Returns the error of `clear`.
    pub async fn invalidate<F>(&self, profile: &ProfileId, clear: F) -> Result<(), IdpError>
    where
        F: Future<Output = Result<(), IdpError>>,
    {
        let fence = self.fence(profile);
        let mut current = fence.lock().await;
        *current += 1;
        self.in_flight.remove(profile);
        clear.await
    }

    /// Whether a refresh is in flight for `profile`.
    #[must_use]
    pub fn is_in_flight(&self, profile: &ProfileId) -> bool {
        self.in_flight.contains_key(profile)
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &self.in_flight.len())
            .field("profiles", &self.generations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;

    fn token(value: &str) -> SessionToken {
        SessionToken {
            access_token: value.to_string(),
            id_token: "id".to_string(),
            sso_token: None,
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(5),
            token_type: "Bearer".to_string(),
            insurance_id: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");
        let started = Arc::new(AtomicUsize::new(0));

        let calls = (0..8).map(|_| {
            let coordinator = coordinator.clone();
            let profile = profile.clone();
            let started = started.clone();
            async move {
                coordinator
                    .run(&profile, move || {
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(token("fresh"))
                        }
                        .boxed()
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().access_token == "fresh"));
        assert!(!coordinator.is_in_flight(&profile));
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_cached() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");

        let first = coordinator
            .run(&profile, || async { Err(IdpError::ChallengeExpired) }.boxed())
            .await;
        assert!(matches!(first, Err(IdpError::ChallengeExpired)));

        let second = coordinator
            .run(&profile, || async { Ok(token("next")) }.boxed())
            .await
            .unwrap();
        assert_eq!(second.access_token, "next");
    }

    #[tokio::test]
    async fn test_profiles_refresh_independently() {
        let coordinator = RefreshCoordinator::new();
        let started = Arc::new(AtomicUsize::new(0));
        let run = |name: &'static str| {
            let coordinator = coordinator.clone();
            let started = started.clone();
            async move {
                coordinator
                    .run(&ProfileId::new(name), move || {
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(token(name))
                        }
                        .boxed()
                    })
                    .await
            }
        };
        let (a, b) = tokio::join!(run("a"), run("b"));
        assert_eq!(a.unwrap().access_token, "a");
        assert_eq!(b.unwrap().access_token, "b");
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_refresh_is_removed() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");

        let slow = coordinator.run(&profile, || {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(token("late"))
            }
            .boxed()
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), slow).await;
        assert!(timed_out.is_err());
        assert!(!coordinator.is_in_flight(&profile));

        let next = coordinator
            .run(&profile, || async { Ok(token("next")) }.boxed())
            .await
            .unwrap();
        assert_eq!(next.access_token, "next");
    }

    #[tokio::test]
    async fn test_abandoning_one_caller_keeps_shared_refresh() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");
        let started = Arc::new(AtomicUsize::new(0));
        let start = |started: Arc<AtomicUsize>| {
            move || {
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(token("shared"))
                }
                .boxed()
            }
        };

        let patient = {
            let coordinator = coordinator.clone();
            let profile = profile.clone();
            let started = started.clone();
            tokio::spawn(async move { coordinator.run(&profile, start(started)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let impatient = coordinator.run(&profile, start(started.clone()));
        let _ = tokio::time::timeout(Duration::from_millis(10), impatient).await;
        assert!(coordinator.is_in_flight(&profile));

        let joined = coordinator
            .run(&profile, start(started.clone()))
            .await
            .unwrap();
        assert_eq!(joined.access_token, "shared");
        assert_eq!(patient.await.unwrap().unwrap().access_token, "shared");
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_rejected_after_invalidate() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");
        let generation = coordinator.generation(&profile).await;

        coordinator.invalidate(&profile, async { Ok(()) }).await.unwrap();

        let stored = Arc::new(AtomicUsize::new(0));
        let counter = stored.clone();
        let result = coordinator
            .commit(&profile, generation, async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(IdpError::ReauthenticationRequired(ReauthReason::NotAuthenticated))
        ));
        assert_eq!(stored.load(Ordering::SeqCst), 0);

        let fresh = coordinator.generation(&profile).await;
        assert_eq!(fresh, generation + 1);
        coordinator
            .commit(&profile, fresh, async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_detaches_refresh_in_flight() {
        let coordinator = RefreshCoordinator::new();
        let profile = ProfileId::new("p1");

        let running = {
            let coordinator = coordinator.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                coordinator
                    .run(&profile, || {
                        async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(token("old"))
                        }
                        .boxed()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_in_flight(&profile));

        coordinator.invalidate(&profile, async { Ok(()) }).await.unwrap();
        assert!(!coordinator.is_in_flight(&profile));

        let next = coordinator
            .run(&profile, || async { Ok(token("new")) }.boxed())
            .await
            .unwrap();
        assert_eq!(next.access_token, "new");
        let _ = running.await;
    }
}
