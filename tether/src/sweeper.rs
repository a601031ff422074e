//! Periodic removal of expired, abandoned, and broken sessions

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tether_clock::{Clock, UnixMillis};

use crate::{
    config::SessionConfig,
    metrics::{Gauge, MetricEvent, SessionMetrics},
    registry::{SessionEntry, SessionRegistry, SessionStore},
    stats, ConnectionId,
};

/// Why the sweeper removed a session
///
/// Variants are listed in the order they are checked; a session is removed
/// for the first reason that applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The session was marked invalid
    Invalidated,
    /// A refresh grace period ran out without a successful refresh
    GracePeriodExpired,
    /// The last refresh attempt is older than the maximum session age
    RefreshAttemptTooOld,
    /// A refresh has been outstanding longer than the refresh timeout
    StuckRefresh,
    /// A never-refreshed token expired more than the maximum session age ago
    TokenLongExpired,
    /// The session has not been accessed within the maximum session age
    Idle,
}

impl RemovalReason {
    /// A short, stable name for the reason
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalidated => "invalidated",
            Self::GracePeriodExpired => "grace_period_expired",
            Self::RefreshAttemptTooOld => "refresh_attempt_too_old",
            Self::StuckRefresh => "stuck_refresh",
            Self::TokenLongExpired => "token_long_expired",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sweep did
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    /// Sessions removed, with the reason for each
    pub removed: Vec<(ConnectionId, RemovalReason)>,
    /// Sessions left after the sweep
    pub remaining: usize,
    /// Process memory sampled during the sweep
    pub memory_bytes: Option<u64>,
}

/// Thresholds a session is judged against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryRules {
    /// Maximum age since last refresh attempt, token expiry, or last access
    pub max_session_age: Duration,
    /// How long a refresh may be outstanding
    pub refresh_timeout: Duration,
}

impl ExpiryRules {
    /// Decides whether, and why, `entry` should be removed at `now`
    pub fn removal_reason(&self, entry: &SessionEntry, now: UnixMillis) -> Option<RemovalReason> {
        let max_age = self.max_session_age;

        if !entry.session_valid() {
            Some(RemovalReason::Invalidated)
        } else if entry.grace_period_passed_at(now) {
            Some(RemovalReason::GracePeriodExpired)
        } else if entry
            .last_refresh_attempt()
            .map_or(false, |t| now - t > max_age)
        {
            Some(RemovalReason::RefreshAttemptTooOld)
        } else if entry.is_refreshing()
            && entry
                .refresh_start_time()
                .map_or(false, |t| now - t > self.refresh_timeout)
        {
            Some(RemovalReason::StuckRefresh)
        } else if entry.last_refresh_attempt().is_none()
            && entry.token_expiry().map_or(false, |exp| now > exp + max_age)
        {
            Some(RemovalReason::TokenLongExpired)
        } else if now - entry.last_accessed() > max_age {
            Some(RemovalReason::Idle)
        } else {
            None
        }
    }
}

/// Scans the registry and removes sessions that should no longer be held
pub struct CleanupSweeper<S, C> {
    registry: Arc<SessionRegistry<S, C>>,
    rules: ExpiryRules,
    memory_warning_threshold: u64,
    memory_probe: fn() -> Option<u64>,
    metrics: Arc<dyn SessionMetrics>,
}

impl<S, C> fmt::Debug for CleanupSweeper<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CleanupSweeper")
            .field("rules", &self.rules)
            .field("memory_warning_threshold", &self.memory_warning_threshold)
            .finish()
    }
}

impl<S, C> CleanupSweeper<S, C>
where
    S: SessionStore,
    C: Clock,
{
    pub(crate) fn new(
        registry: Arc<SessionRegistry<S, C>>,
        config: &SessionConfig,
        memory_probe: fn() -> Option<u64>,
        metrics: Arc<dyn SessionMetrics>,
    ) -> Self {
        Self {
            registry,
            rules: ExpiryRules {
                max_session_age: config.max_session_age(),
                refresh_timeout: config.refresh_timeout(),
            },
            memory_warning_threshold: config.memory_warning_threshold(),
            memory_probe,
            metrics,
        }
    }

    /// The thresholds sessions are judged against
    pub fn rules(&self) -> ExpiryRules {
        self.rules
    }

    /// Runs one sweep over the registry
    ///
    /// Each candidate is re-checked under the store's lock before removal, so
    /// a session that was refreshed or replaced since the scan began is left
    /// alone. A session removed for a stuck refresh is marked invalid first.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.registry.now();
        let rules = self.rules;
        let mut report = SweepReport::default();

        for candidate in self.registry.snapshot() {
            if rules.removal_reason(&candidate, now).is_none() {
                continue;
            }

            let registration = candidate.registration();
            let mut reason = None;
            let removed = self
                .registry
                .store()
                .remove_if(candidate.connection_id(), |e| {
                    if e.registration() != registration {
                        return false;
                    }
                    reason = rules.removal_reason(e, now);
                    if reason == Some(RemovalReason::StuckRefresh) {
                        e.session_valid = false;
                    }
                    reason.is_some()
                });

            if let (Some(removed), Some(reason)) = (removed, reason) {
                tracing::info!(
                    connection.id = %removed.connection_id(),
                    user.id = %removed.user_id(),
                    %reason,
                    refresh_attempts = removed.refresh_attempts(),
                    "removed session"
                );
                self.metrics.increment(MetricEvent::SessionRemoved);
                report.removed.push((removed.connection_id, reason));
            }
        }

        report.remaining = self.registry.len();
        self.metrics.gauge(Gauge::Sessions, report.remaining as u64);

        report.memory_bytes = (self.memory_probe)();
        if let Some(bytes) = report.memory_bytes {
            self.metrics.gauge(Gauge::MemoryUsage, bytes);
            if bytes > self.memory_warning_threshold {
                tracing::warn!(
                    memory_bytes = bytes,
                    threshold = self.memory_warning_threshold,
                    sessions = report.remaining,
                    "process memory above warning threshold"
                );
            }
        }

        tracing::debug!(
            removed = report.removed.len(),
            remaining = report.remaining,
            "session sweep complete"
        );

        report
    }
}

pub(crate) fn default_memory_probe() -> Option<u64> {
    stats::process_memory_bytes()
}

#[cfg(test)]
mod tests {
    use tether_clock::TestClock;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        metrics::RecordingMetrics,
        registry::{
            tests::{auth, T0},
            InMemorySessionStore,
        },
        ConnectionIdRef,
    };

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Harness {
        registry: Arc<SessionRegistry<InMemorySessionStore, TestClock>>,
        sweeper: CleanupSweeper<InMemorySessionStore, TestClock>,
        clock: TestClock,
        metrics: Arc<RecordingMetrics>,
    }

    fn harness_with_probe(memory_probe: fn() -> Option<u64>) -> Harness {
        let clock = TestClock::new(T0);
        let metrics = Arc::new(RecordingMetrics::default());
        let registry = Arc::new(SessionRegistry::new(
            InMemorySessionStore::new(),
            clock.clone(),
            100,
            Duration::from_secs(300),
            metrics.clone(),
        ));
        let sweeper = CleanupSweeper::new(
            Arc::clone(&registry),
            &SessionConfig::default(),
            memory_probe,
            metrics.clone(),
        );
        Harness {
            registry,
            sweeper,
            clock,
            metrics,
        }
    }

    fn harness() -> Harness {
        harness_with_probe(|| None)
    }

    impl Harness {
        fn register(&self, connection: &str) -> ConnectionId {
            let id = ConnectionId::new(connection.to_owned());
            self.registry.register(id.clone(), auth(connection)).unwrap();
            id
        }

        fn edit(&self, id: &ConnectionIdRef, f: impl FnOnce(&mut SessionEntry)) {
            self.registry.store().update(id, f).unwrap();
        }

        fn reasons(report: &SweepReport) -> Vec<(&str, RemovalReason)> {
            let mut reasons: Vec<_> = report
                .removed
                .iter()
                .map(|(id, reason)| (id.as_str(), *reason))
                .collect();
            reasons.sort_by_key(|(id, _)| *id);
            reasons
        }
    }

    #[test]
    fn healthy_sessions_are_kept() {
        let h = harness();
        h.register("conn-1");
        h.clock.advance(Duration::from_secs(60 * 60));

        let report = h.sweeper.sweep_once();

        assert!(report.removed.is_empty());
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn idle_sessions_are_removed() {
        let h = harness();
        h.register("idle");
        let active = h.register("active");
        h.clock.advance(DAY - Duration::from_secs(60));
        h.registry.get(&active);
        h.clock.advance(Duration::from_secs(120));

        let report = h.sweeper.sweep_once();

        assert_eq!(
            Harness::reasons(&report),
            vec![("idle", RemovalReason::Idle)]
        );
        assert_eq!(report.remaining, 1);
        assert_eq!(h.metrics.count(MetricEvent::SessionRemoved), 1);
        assert_eq!(h.metrics.last(Gauge::Sessions), Some(1));
    }

    #[test]
    fn invalidation_is_reported_before_other_reasons() {
        let h = harness();
        let id = h.register("conn-1");
        h.edit(&id, |e| e.session_valid = false);
        h.clock.advance(DAY * 2);

        let report = h.sweeper.sweep_once();

        assert_eq!(
            Harness::reasons(&report),
            vec![("conn-1", RemovalReason::Invalidated)]
        );
    }

    #[test]
    fn expired_grace_period_is_removed() {
        let h = harness();
        let id = h.register("conn-1");
        h.edit(&id, |e| e.grace_period_expiry = Some(T0 + Duration::from_secs(60)));

        h.clock.advance(Duration::from_secs(60));
        assert!(h.sweeper.sweep_once().removed.is_empty());

        h.clock.advance(Duration::from_secs(1));
        let report = h.sweeper.sweep_once();
        assert_eq!(
            Harness::reasons(&report),
            vec![("conn-1", RemovalReason::GracePeriodExpired)]
        );
    }

    #[test]
    fn stale_refresh_attempt_is_reported_before_idleness() {
        let h = harness();
        let id = h.register("conn-1");
        h.edit(&id, |e| e.last_refresh_attempt = Some(T0));
        h.clock.advance(DAY + Duration::from_secs(1));

        let report = h.sweeper.sweep_once();

        assert_eq!(
            Harness::reasons(&report),
            vec![("conn-1", RemovalReason::RefreshAttemptTooOld)]
        );
    }

    #[test]
    #[traced_test]
    fn stuck_refresh_is_invalidated_and_removed() {
        let h = harness();
        let id = h.register("conn-1");
        h.edit(&id, |e| {
            e.is_refreshing = true;
            e.refresh_start_time = Some(T0);
        });

        h.clock.advance(Duration::from_secs(30));
        assert!(h.sweeper.sweep_once().removed.is_empty());

        h.clock.advance(Duration::from_secs(1));
        let report = h.sweeper.sweep_once();

        assert_eq!(
            Harness::reasons(&report),
            vec![("conn-1", RemovalReason::StuckRefresh)]
        );
        assert!(h.registry.get(&id).is_none());
        assert!(logs_contain("reason=stuck_refresh"));

        h.registry.register(id.clone(), auth("conn-1")).unwrap();
        assert!(h.registry.is_valid(&id));
    }

    #[test]
    fn long_expired_token_is_removed_if_never_refreshed() {
        let h = harness();
        let id = ConnectionId::new("conn-1".to_owned());
        h.registry
            .register(
                id.clone(),
                auth("conn-1").with_expiry(T0 + Duration::from_secs(1)),
            )
            .unwrap();
        h.clock.advance(DAY + Duration::from_secs(2));

        let report = h.sweeper.sweep_once();

        assert_eq!(
            Harness::reasons(&report),
            vec![("conn-1", RemovalReason::TokenLongExpired)]
        );
    }

    #[test]
    fn rules_follow_priority_order() {
        let h = harness();
        let id = h.register("conn-1");
        let rules = h.sweeper.rules();
        h.edit(&id, |e| {
            e.grace_period_expiry = Some(T0);
            e.last_refresh_attempt = Some(T0);
            e.is_refreshing = true;
            e.refresh_start_time = Some(T0);
        });
        let now = T0 + DAY * 2;

        let mut entry = h.registry.snapshot().remove(0);
        assert_eq!(
            rules.removal_reason(&entry, now),
            Some(RemovalReason::GracePeriodExpired)
        );

        entry.grace_period_expiry = None;
        assert_eq!(
            rules.removal_reason(&entry, now),
            Some(RemovalReason::RefreshAttemptTooOld)
        );

        entry.last_refresh_attempt = Some(now);
        assert_eq!(
            rules.removal_reason(&entry, now),
            Some(RemovalReason::StuckRefresh)
        );

        entry.is_refreshing = false;
        assert_eq!(rules.removal_reason(&entry, now), Some(RemovalReason::Idle));

        entry.last_accessed = now;
        assert_eq!(rules.removal_reason(&entry, now), None);
    }

    #[test]
    #[traced_test]
    fn high_memory_use_is_reported() {
        let h = harness_with_probe(|| Some(u64::MAX));
        h.register("conn-1");

        let report = h.sweeper.sweep_once();

        assert_eq!(report.memory_bytes, Some(u64::MAX));
        assert_eq!(h.metrics.last(Gauge::MemoryUsage), Some(u64::MAX));
        assert!(logs_contain("process memory above warning threshold"));
    }

    #[test]
    fn reasons_have_stable_names() {
        assert_eq!(RemovalReason::StuckRefresh.to_string(), "stuck_refresh");
        assert_eq!(
            serde_json::to_value(RemovalReason::TokenLongExpired).unwrap(),
            serde_json::json!("token_long_expired")
        );
    }
}
