//! Bearer tokens for API clients and background renewal.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::IdpSession;
use crate::error::IdpError;

/// Source of access tokens for outgoing requests.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A live access token, renewed first if it is about to expire.
    async fn access_token(&self) -> Result<String, IdpError>;

    /// Called after the resource server answered 401. Forces a refresh and
    /// returns the new token.
    async fn on_unauthorized(&self) -> Result<String, IdpError>;
}

#[async_trait]
impl AccessTokenProvider for IdpSession {
    async fn access_token(&self) -> Result<String, IdpError> {
        Ok(self.valid_token().await?.access_token)
    }

    async fn on_unauthorized(&self) -> Result<String, IdpError> {
        tracing::debug!(profile = %self.profile().id, "Access token rejected, refreshing");
        Ok(self.refresh().await?.access_token)
    }
}

/// Handle of a background refresh task. Dropping it stops the task.
#[derive(Debug)]
pub struct AutoRefresh {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl AutoRefresh {
    /// Signals the task to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the task and waits until it has exited.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl IdpSession {
    /// Spawns a task that renews the token silently when it enters the
    /// refresh leeway.
    ///
    /// Retryable failures are retried after `auto_refresh_retry_delay`.
    /// Other failures park the task until the stored token changes, e.g.
    /// after the next interactive login.
    #[must_use]
    pub fn spawn_auto_refresh(&self) -> AutoRefresh {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let session = self.clone();
        let mut tokens = self.token_store().subscribe(&self.profile().id);
        let retry_delay = self.config().session.auto_refresh_retry_delay;

        let handle = tokio::spawn(async move {
            tracing::info!(profile = %session.profile().id, "Auto refresh started");
            let mut backoff: Option<Duration> = None;
            let mut parked = false;

            loop {
                let _ = tokens.borrow_and_update();
                let delay = if let Some(delay) = backoff.take() {
                    Some(delay)
                } else if parked {
                    None
                } else {
                    match session.next_refresh_delay().await {
                        Ok(delay) => delay,
                        Err(err) => {
                            tracing::warn!(error = %err, "Cannot read the session token");
                            Some(retry_delay)
                        }
                    }
                };

                let sleep = async {
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    changed = tokens.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        parked = false;
                    }
                    () = sleep => {
                        match session.refresh().await {
                            Ok(token) => {
                                tracing::debug!(token = %token.fingerprint(), "Auto refresh succeeded");
                            }
                            Err(err) if err.is_retryable() => {
                                tracing::warn!(error = %err, retry_in = ?retry_delay, "Auto refresh failed");
                                backoff = Some(retry_delay);
                            }
                            Err(err) => {
                                tracing::info!(error = %err, "Auto refresh paused until the next login");
                                parked = true;
                            }
                        }
                    }
                }
            }

            tracing::info!(profile = %session.profile().id, "Auto refresh stopped");
        });

        AutoRefresh {
            shutdown,
            handle: Some(handle),
        }
    }
}
