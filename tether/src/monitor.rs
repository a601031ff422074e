//! Proactive refresh of credentials that are about to expire

use std::{fmt, sync::Arc};

use tether_clock::Clock;

use crate::{
    executor::RefreshExecutor,
    registry::{SessionRegistry, SessionStore},
    ConnectionId, ErrorKind,
};

/// Finds sessions nearing expiry and starts their refreshes
pub struct RefreshMonitor<S, C> {
    registry: Arc<SessionRegistry<S, C>>,
    executor: Arc<RefreshExecutor<S, C>>,
}

impl<S, C> fmt::Debug for RefreshMonitor<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshMonitor")
            .field("executor", &self.executor)
            .finish()
    }
}

impl<S, C> RefreshMonitor<S, C>
where
    S: SessionStore,
    C: Clock + Send + Sync + 'static,
{
    pub(crate) fn new(
        registry: Arc<SessionRegistry<S, C>>,
        executor: Arc<RefreshExecutor<S, C>>,
    ) -> Self {
        Self { registry, executor }
    }

    /// Connections whose credentials are due for a refresh
    ///
    /// Sessions already marked invalid or past their grace period are left
    /// for the sweeper.
    pub fn due(&self) -> Vec<ConnectionId> {
        let now = self.registry.now();
        let threshold = self.registry.refresh_threshold();

        self.registry
            .snapshot()
            .into_iter()
            .filter(|e| {
                e.session_valid()
                    && !e.grace_period_passed_at(now)
                    && e.needs_refresh_at(now, threshold)
            })
            .map(|e| e.connection_id)
            .collect()
    }

    /// Starts a refresh task for every due connection
    ///
    /// The tasks are not awaited. Each one logs its own outcome, and a
    /// failing refresh has no effect on the others. Must be called from
    /// within a Tokio runtime.
    pub fn scan_once(&self) -> usize {
        let due = self.due();
        let scheduled = due.len();

        for connection_id in due {
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                match executor.refresh(&connection_id).await {
                    Ok(_) => {}
                    Err(err) => match err.kind() {
                        ErrorKind::ConcurrencyLimitDeferred | ErrorKind::AlreadyRefreshing => {
                            tracing::debug!(connection.id = %connection_id, "proactive refresh skipped, will retry next scan");
                        }
                        ErrorKind::NotRegistered => {
                            tracing::debug!(connection.id = %connection_id, "connection went away before proactive refresh");
                        }
                        _ => {}
                    },
                }
            });
        }

        if scheduled > 0 {
            tracing::debug!(scheduled, "scheduled proactive refreshes");
        }

        scheduled
    }
}
