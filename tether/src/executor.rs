//! Performs credential refreshes under a global concurrency bound
//!
//! Each accepted refresh holds one permit from a shared semaphore for as long
//! as it is in flight. The permit and the entry's `is_refreshing` flag are
//! owned by an [`InFlight`] guard, so both are released on every path out of
//! [`RefreshExecutor::refresh()`]: success, failure, a panicking
//! collaborator, or the caller dropping the future.

use std::{error, fmt, sync::Arc, time::Duration};

use tether_clock::{Clock, UnixMillis};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{
    metrics::{Gauge, MetricEvent, SessionMetrics},
    provider::{CredentialRefresher, CredentialValidator, RefreshedCredential},
    registry::{SessionRegistry, SessionStore},
    retry::{RetryHandler, RetryPolicy, WithRetry},
    ConnectionId, ConnectionIdRef, ErrorKind, RefreshToken, SessionError, UserId,
};

/// The result of a successful refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// The refreshed connection
    pub connection_id: ConnectionId,
    /// When the new access token expires
    pub token_expiry: UnixMillis,
    /// Whether the provider rotated the refresh token
    pub refresh_token_rotated: bool,
    /// Calls made to the identity provider, including retries
    pub provider_attempts: u32,
}

struct Ticket {
    registration: u64,
    user_id: UserId,
    refresh_token: RefreshToken,
    permit: OwnedSemaphorePermit,
}

/// Runs single-connection refreshes against the identity provider
pub struct RefreshExecutor<S, C> {
    registry: Arc<SessionRegistry<S, C>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    refresher: Arc<dyn CredentialRefresher>,
    validator: Arc<dyn CredentialValidator>,
    retry_policy: RetryPolicy,
    grace_period: Duration,
    metrics: Arc<dyn SessionMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl<S, C> fmt::Debug for RefreshExecutor<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshExecutor")
            .field("max_concurrent", &self.max_concurrent)
            .field("available_permits", &self.permits.available_permits())
            .field("retry_policy", &self.retry_policy)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl<S, C> RefreshExecutor<S, C>
where
    S: SessionStore,
    C: Clock + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<SessionRegistry<S, C>>,
        max_concurrent: usize,
        refresher: Arc<dyn CredentialRefresher>,
        validator: Arc<dyn CredentialValidator>,
        retry_policy: RetryPolicy,
        grace_period: Duration,
        metrics: Arc<dyn SessionMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            refresher,
            validator,
            retry_policy,
            grace_period,
            metrics,
            shutdown,
        }
    }

    /// Refreshes currently in flight
    pub fn active_refreshes(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// The bound on refreshes in flight
    pub fn max_concurrent_refreshes(&self) -> usize {
        self.max_concurrent
    }

    /// Stops accepting new refreshes
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    /// Refreshes the credential of one connection
    ///
    /// # Errors
    ///
    /// The connection must be registered, valid, and not already refreshing,
    /// and a slot under the concurrency bound must be free; otherwise the call
    /// fails immediately without contacting the provider. Failures reported
    /// by the provider or validator are mapped onto [`SessionError`].
    #[tracing::instrument(skip(self, connection_id), fields(connection.id = %connection_id))]
    pub async fn refresh(
        &self,
        connection_id: &ConnectionIdRef,
    ) -> Result<RefreshOutcome, SessionError> {
        if *self.shutdown.borrow() {
            return Err(SessionError::System("session engine is shut down".into()));
        }

        let ticket = self.begin(connection_id).map_err(|err| {
            if err.kind() == ErrorKind::ConcurrencyLimitDeferred {
                tracing::debug!(limit = self.max_concurrent, "refresh deferred");
                self.metrics.increment(MetricEvent::RefreshDeferred);
            }
            err
        })?;
        self.metrics
            .gauge(Gauge::ActiveRefreshes, self.active_refreshes() as u64);

        let user_id = ticket.user_id.clone();
        let refresh_token = ticket.refresh_token.clone();
        let guard = InFlight {
            registry: Arc::clone(&self.registry),
            connection_id: connection_id.to_owned(),
            registration: ticket.registration,
            settled: false,
            _permit: ticket.permit,
        };

        let exchanged = self.exchange(&guard.connection_id, &refresh_token).await;
        let result = match exchanged {
            Ok((credential, attempts)) => {
                self.confirm(guard, &user_id, credential, attempts).await
            }
            Err(err) => {
                guard.fail(&err);
                Err(err)
            }
        };

        self.metrics
            .gauge(Gauge::ActiveRefreshes, self.active_refreshes() as u64);

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    token_expiry = outcome.token_expiry.0,
                    provider_attempts = outcome.provider_attempts,
                    "credential refreshed"
                );
                self.metrics.increment(MetricEvent::RefreshSuccess);
            }
            Err(error) => {
                tracing::warn!(
                    error = (error as &dyn error::Error),
                    kind = ?error.kind(),
                    "credential refresh failed"
                );
                self.metrics.increment(MetricEvent::RefreshFailure);
            }
        }

        result
    }

    fn begin(&self, connection_id: &ConnectionIdRef) -> Result<Ticket, SessionError> {
        let now = self.registry.now();
        let grace_period_expiry = now + self.grace_period;
        let limit = self.max_concurrent;

        self.registry
            .store()
            .update(connection_id, |e| {
                if e.is_refreshing {
                    return Err(SessionError::AlreadyRefreshing(e.connection_id.clone()));
                }
                if !e.session_valid {
                    return Err(SessionError::SessionInvalid {
                        connection_id: e.connection_id.clone(),
                        source: None,
                    });
                }

                let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(TryAcquireError::NoPermits) => {
                        return Err(SessionError::ConcurrencyLimitDeferred { limit })
                    }
                    Err(TryAcquireError::Closed) => {
                        return Err(SessionError::System("session engine is shut down".into()))
                    }
                };

                e.is_refreshing = true;
                e.refresh_start_time = Some(now);
                e.last_refresh_attempt = Some(now);
                e.grace_period_expiry = Some(grace_period_expiry);
                e.refresh_attempts = e.refresh_attempts.saturating_add(1);

                Ok(Ticket {
                    registration: e.registration,
                    user_id: e.user_id.clone(),
                    refresh_token: e.refresh_token.clone(),
                    permit,
                })
            })
            .unwrap_or_else(|| Err(SessionError::NotRegistered(connection_id.to_owned())))
    }

    async fn exchange(
        &self,
        connection_id: &ConnectionId,
        refresh_token: &RefreshToken,
    ) -> Result<(RefreshedCredential, u32), SessionError> {
        let mut handler = RetryHandler::new(self.retry_policy);
        let mut shutdown = self.shutdown.clone();

        loop {
            tracing::debug!(attempt = handler.attempts() + 1, "requesting refreshed credential");
            match self
                .refresher
                .refresh(refresh_token)
                .await
                .with_retry(&mut handler)
            {
                Ok(credential) => return Ok((credential, handler.attempts())),
                Err((error, Some(delay))) if error.is_transient() => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        attempt = handler.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "error refreshing credential, will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        Ok(_) = shutdown.wait_for(|stop| *stop) => {
                            return Err(SessionError::System(
                                "session engine shut down during refresh".into(),
                            ));
                        }
                    }
                }
                Err((error, _)) => {
                    return Err(SessionError::from_provider(connection_id.clone(), error))
                }
            }
        }
    }

    async fn confirm(
        &self,
        guard: InFlight<S, C>,
        user_id: &UserId,
        credential: RefreshedCredential,
        provider_attempts: u32,
    ) -> Result<RefreshOutcome, SessionError> {
        let claims = match self.validator.validate(&credential.access_token).await {
            Ok(claims) => claims,
            Err(error) => {
                let err = SessionError::from_provider(guard.connection_id.clone(), error);
                guard.fail(&err);
                return Err(err);
            }
        };

        if let Some(subject) = &claims.subject {
            if subject != user_id {
                let err = SessionError::validation(format!(
                    "refreshed token subject {} does not match session user {}",
                    subject, user_id
                ));
                guard.fail(&err);
                return Err(err);
            }
        }

        let token_expiry = claims
            .expires_at
            .unwrap_or_else(|| self.registry.now() + credential.expires_in);
        let refresh_token_rotated = credential.refresh_token.is_some();
        let connection_id = guard.connection_id.clone();

        guard.succeed(credential, token_expiry)?;

        Ok(RefreshOutcome {
            connection_id,
            token_expiry,
            refresh_token_rotated,
            provider_attempts,
        })
    }
}

/// Ownership of one in-flight refresh
///
/// Dropping the guard without settling it clears the entry's refreshing
/// state. The semaphore permit is released after the entry is updated.
struct InFlight<S: SessionStore, C: Clock> {
    registry: Arc<SessionRegistry<S, C>>,
    connection_id: ConnectionId,
    registration: u64,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S: SessionStore, C: Clock> InFlight<S, C> {
    fn succeed(
        mut self,
        credential: RefreshedCredential,
        token_expiry: UnixMillis,
    ) -> Result<(), SessionError> {
        self.settled = true;
        let registration = self.registration;
        let connection_id = &self.connection_id;

        self.registry
            .store()
            .update(connection_id, |e| {
                if e.registration != registration {
                    tracing::info!("connection was replaced during refresh, discarding credential");
                    return Err(SessionError::NotRegistered(connection_id.clone()));
                }

                e.is_refreshing = false;
                e.refresh_start_time = None;

                if !e.session_valid {
                    tracing::info!("session was invalidated during refresh, discarding credential");
                    return Err(SessionError::SessionInvalid {
                        connection_id: connection_id.clone(),
                        source: None,
                    });
                }

                e.current_token = credential.access_token;
                if let Some(rotated) = credential.refresh_token {
                    e.refresh_token = rotated;
                }
                e.token_expiry = Some(token_expiry);
                e.refresh_attempts = 0;
                e.grace_period_expiry = None;
                Ok(())
            })
            .unwrap_or_else(|| {
                tracing::info!("connection was removed during refresh, discarding credential");
                Err(SessionError::NotRegistered(connection_id.clone()))
            })
    }

    fn fail(mut self, error: &SessionError) {
        self.settled = true;
        let revoked = error.kind() == ErrorKind::SessionInvalid;
        let registration = self.registration;

        self.registry.store().update(&self.connection_id, |e| {
            if e.registration == registration {
                e.is_refreshing = false;
                e.refresh_start_time = None;
                if revoked {
                    e.session_valid = false;
                }
            }
        });
    }
}

impl<S: SessionStore, C: Clock> Drop for InFlight<S, C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        tracing::warn!(connection.id = %self.connection_id, "refresh abandoned before completing");
        let registration = self.registration;
        self.registry.store().update(&self.connection_id, |e| {
            if e.registration == registration {
                e.is_refreshing = false;
                e.refresh_start_time = None;
            }
        });
    }
}
