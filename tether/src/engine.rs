//! The session engine: a registry with its refresh machinery and background tasks

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tether_clock::{Clock, System};
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time::MissedTickBehavior,
};

use crate::{
    config::SessionConfig,
    executor::{RefreshExecutor, RefreshOutcome},
    metrics::{SessionMetrics, TracingMetrics},
    monitor::RefreshMonitor,
    provider::{CredentialRefresher, CredentialValidator, UnverifiedClaimsValidator},
    registry::{InMemorySessionStore, InitialAuthState, SessionEntry, SessionRegistry, SessionStore},
    stats::{EngineGauges, SessionStats},
    sweeper::{self, CleanupSweeper, SweepReport},
    ConnectionId, ConnectionIdRef, SessionError,
};

/// Keeps connection-bound credentials fresh
///
/// Handles are cheap to clone and share one engine. The background sweeper
/// and refresh monitor stop when [`shutdown()`][Self::shutdown()] is called or
/// when the last handle is dropped.
pub struct SessionEngine<S = InMemorySessionStore, C = System> {
    inner: Arc<EngineInner<S, C>>,
}

struct EngineInner<S, C> {
    config: SessionConfig,
    registry: Arc<SessionRegistry<S, C>>,
    executor: Arc<RefreshExecutor<S, C>>,
    sweeper: CleanupSweeper<S, C>,
    monitor: RefreshMonitor<S, C>,
    memory_probe: fn() -> Option<u64>,
    shutdown_tx: watch::Sender<bool>,
    /// Held for reading across a registration so that `shutdown` cannot
    /// clear the registry in the middle of one
    shut_down: RwLock<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<S, C> Clone for SessionEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> fmt::Debug for SessionEngine<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionEngine")
            .field("config", &self.inner.config)
            .field("executor", &self.inner.executor)
            .field("shut_down", &*self.inner.shut_down.read())
            .finish()
    }
}

/// Assembles a [`SessionEngine`]
pub struct SessionEngineBuilder<S = InMemorySessionStore, C = System> {
    config: SessionConfig,
    refresher: Arc<dyn CredentialRefresher>,
    validator: Arc<dyn CredentialValidator>,
    metrics: Arc<dyn SessionMetrics>,
    store: S,
    clock: C,
    memory_probe: fn() -> Option<u64>,
}

impl<S, C> fmt::Debug for SessionEngineBuilder<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionEngineBuilder")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl SessionEngine {
    /// Starts assembling an engine that refreshes credentials with `refresher`
    ///
    /// By default, sessions are held in memory, refreshed credentials are
    /// checked with an [`UnverifiedClaimsValidator`], and metrics are emitted
    /// as tracing events.
    pub fn builder(
        config: SessionConfig,
        refresher: impl CredentialRefresher + 'static,
    ) -> SessionEngineBuilder {
        SessionEngineBuilder {
            config,
            refresher: Arc::new(refresher),
            validator: Arc::new(UnverifiedClaimsValidator::new()),
            metrics: Arc::new(TracingMetrics),
            store: InMemorySessionStore::new(),
            clock: System,
            memory_probe: sweeper::default_memory_probe,
        }
    }
}

impl<S, C> SessionEngineBuilder<S, C> {
    /// Sets the validator used to confirm refreshed credentials
    pub fn with_validator(mut self, validator: impl CredentialValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Sets the metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn SessionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets a custom function for sampling process memory
    pub fn with_memory_probe(mut self, probe: fn() -> Option<u64>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Sets the store that holds session entries
    pub fn with_store<T>(self, store: T) -> SessionEngineBuilder<T, C> {
        SessionEngineBuilder {
            config: self.config,
            refresher: self.refresher,
            validator: self.validator,
            metrics: self.metrics,
            store,
            clock: self.clock,
            memory_probe: self.memory_probe,
        }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SessionEngineBuilder<S, D> {
        SessionEngineBuilder {
            config: self.config,
            refresher: self.refresher,
            validator: self.validator,
            metrics: self.metrics,
            store: self.store,
            clock,
            memory_probe: self.memory_probe,
        }
    }
}

impl<S, C> SessionEngineBuilder<S, C>
where
    S: SessionStore,
    C: Clock + Send + Sync + 'static,
{
    /// Builds the engine and starts its background tasks
    ///
    /// The sweeper and refresh monitor are only started if automatic refresh
    /// is enabled in the configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime while automatic refresh is
    /// enabled.
    pub fn spawn(self) -> SessionEngine<S, C> {
        let config = self.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(SessionRegistry::new(
            self.store,
            self.clock,
            config.max_sessions(),
            config.refresh_threshold(),
            Arc::clone(&self.metrics),
        ));
        let executor = Arc::new(RefreshExecutor::new(
            Arc::clone(&registry),
            config.max_concurrent_refreshes(),
            self.refresher,
            self.validator,
            config.retry_policy(),
            config.refresh_grace_period(),
            Arc::clone(&self.metrics),
            shutdown_rx.clone(),
        ));
        let sweeper = CleanupSweeper::new(
            Arc::clone(&registry),
            &config,
            self.memory_probe,
            Arc::clone(&self.metrics),
        );
        let monitor = RefreshMonitor::new(Arc::clone(&registry), Arc::clone(&executor));

        let inner = Arc::new(EngineInner {
            config,
            registry,
            executor,
            sweeper,
            monitor,
            memory_probe: self.memory_probe,
            shutdown_tx,
            shut_down: RwLock::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        if inner.config.enable_auto_refresh() {
            let weak = Arc::downgrade(&inner);
            let sweep = tokio::spawn(run_periodically(
                weak.clone(),
                inner.config.cleanup_interval(),
                shutdown_rx.clone(),
                |engine| {
                    engine.sweeper.sweep_once();
                },
            ));
            let scan = tokio::spawn(run_periodically(
                weak,
                inner.config.check_interval(),
                shutdown_rx,
                |engine| {
                    engine.monitor.scan_once();
                },
            ));

            let mut tasks = inner.tasks.lock();
            tasks.push(supervise("cleanup sweeper", sweep));
            tasks.push(supervise("refresh monitor", scan));
        }

        tracing::info!(
            max_sessions = inner.config.max_sessions(),
            max_concurrent_refreshes = inner.config.max_concurrent_refreshes(),
            auto_refresh = inner.config.enable_auto_refresh(),
            "session engine started"
        );

        SessionEngine { inner }
    }
}

fn supervise(task: &'static str, join: JoinHandle<()>) -> AbortHandle {
    let abort = join.abort_handle();

    tokio::spawn(async move {
        if let Err(err) = join.await {
            if err.is_panic() {
                tracing::error!(task, "background task panicked!")
            } else if err.is_cancelled() {
                tracing::debug!(task, "background task was cancelled")
            }
        } else {
            tracing::debug!(task, "background task stopped")
        }
    });

    abort
}

async fn run_periodically<S, C>(
    engine: Weak<EngineInner<S, C>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    work: fn(&EngineInner<S, C>),
) where
    S: SessionStore,
    C: Clock + Send + Sync + 'static,
{
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        match engine.upgrade() {
            Some(engine) => work(&engine),
            None => return,
        }
    }
}

impl<S, C> SessionEngine<S, C>
where
    S: SessionStore,
    C: Clock + Send + Sync + 'static,
{
    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.is_shut_down() {
            Err(SessionError::System("session engine is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Registers a connection with its initial credentials
    ///
    /// Registering a connection that is already present replaces its
    /// session. If the registry is full, the least recently accessed
    /// sessions are evicted to make room.
    ///
    /// # Errors
    ///
    /// Fails if the engine has been shut down, if an identifier is empty, or
    /// if eviction could not make room.
    pub fn register_connection(
        &self,
        connection_id: ConnectionId,
        state: InitialAuthState,
    ) -> Result<(), SessionError> {
        let shut_down = self.inner.shut_down.read();
        if *shut_down {
            return Err(SessionError::System("session engine is shut down".into()));
        }
        self.inner.registry.register(connection_id, state)
    }

    /// Forgets a connection; unknown connections are ignored
    pub fn unregister_connection(&self, connection_id: &ConnectionIdRef) {
        self.inner.registry.unregister(connection_id)
    }

    /// Whether a connection's credential should be refreshed now
    pub fn needs_refresh(&self, connection_id: &ConnectionIdRef) -> bool {
        self.inner.registry.needs_refresh(connection_id)
    }

    /// Refreshes a connection's credential
    ///
    /// # Errors
    ///
    /// See [`RefreshExecutor::refresh()`]. A refresh that would exceed the
    /// concurrency bound is deferred rather than queued.
    pub async fn refresh_connection_token(
        &self,
        connection_id: &ConnectionIdRef,
    ) -> Result<RefreshOutcome, SessionError> {
        self.ensure_running()?;
        self.inner.executor.refresh(connection_id).await
    }

    /// Whether a connection's session may still be used
    pub fn is_session_valid(&self, connection_id: &ConnectionIdRef) -> bool {
        self.inner.registry.is_valid(connection_id)
    }

    /// A copy of a connection's current state
    pub fn get_session_state(&self, connection_id: &ConnectionIdRef) -> Option<SessionEntry> {
        self.inner.registry.get(connection_id)
    }

    /// A snapshot of engine state
    pub fn stats(&self) -> SessionStats {
        let registry = &self.inner.registry;
        SessionStats::collect(
            &registry.snapshot(),
            registry.now(),
            EngineGauges {
                active_refreshes: self.inner.executor.active_refreshes(),
                max_concurrent_refreshes: self.inner.executor.max_concurrent_refreshes(),
                max_sessions: registry.max_sessions(),
                memory_usage_bytes: (self.inner.memory_probe)(),
                shut_down: self.is_shut_down(),
            },
        )
    }

    /// Runs a cleanup sweep immediately
    pub fn sweep_now(&self) -> SweepReport {
        self.inner.sweeper.sweep_once()
    }

    /// Schedules refreshes for every due connection immediately
    ///
    /// Returns the number of refreshes scheduled.
    pub fn refresh_due_now(&self) -> usize {
        if self.is_shut_down() {
            return 0;
        }
        self.inner.monitor.scan_once()
    }

    /// The configuration the engine was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Whether [`shutdown()`][Self::shutdown()] has been called
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shut_down.read()
    }

    /// Stops the background tasks and forgets every session
    ///
    /// In-flight refreshes stop retrying and their results are discarded.
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let mut shut_down = self.inner.shut_down.write();
        if *shut_down {
            return;
        }
        *shut_down = true;

        self.inner.shutdown_tx.send_replace(true);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.executor.close();
        self.inner.registry.clear();

        tracing::info!("session engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use tether_clock::TestClock;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        metrics::{MetricEvent, RecordingMetrics},
        registry::tests::{auth, T0},
        sweeper::RemovalReason,
        test_support::{ScriptedRefresher, Step},
        ErrorKind,
    };

    const PROVIDER_DELAY: Duration = Duration::from_millis(50);

    fn manual_config(max_concurrent_refreshes: usize) -> SessionConfig {
        SessionConfig::builder()
            .enable_auto_refresh(false)
            .max_concurrent_refreshes(max_concurrent_refreshes)
            .build()
            .unwrap()
    }

    fn engine(
        config: SessionConfig,
        refresher: &Arc<ScriptedRefresher>,
    ) -> (SessionEngine<InMemorySessionStore, TestClock>, TestClock) {
        let clock = TestClock::new(T0);
        let engine = SessionEngine::builder(config, Arc::clone(refresher))
            .with_clock(clock.clone())
            .with_memory_probe(|| Some(64 * 1024 * 1024))
            .spawn();
        (engine, clock)
    }

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::new(s.to_owned())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_never_exceed_the_bound() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let metrics = Arc::new(RecordingMetrics::default());
        let engine = SessionEngine::builder(manual_config(3), Arc::clone(&refresher))
            .with_clock(TestClock::new(T0))
            .with_metrics(metrics.clone())
            .spawn();

        let ids: Vec<_> = (0..10).map(|i| cid(&format!("conn-{}", i))).collect();
        for (i, id) in ids.iter().enumerate() {
            engine
                .register_connection(id.clone(), auth(&format!("user-{}", i)))
                .unwrap();
        }

        let tasks: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    loop {
                        match engine.refresh_connection_token(&id).await {
                            Ok(outcome) => return outcome,
                            Err(err) if err.kind() == ErrorKind::ConcurrencyLimitDeferred => {
                                tokio::time::sleep(Duration::from_millis(10)).await
                            }
                            Err(err) => panic!("unexpected refresh failure: {}", err),
                        }
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(refresher.max_in_flight() <= 3);
        assert_eq!(refresher.max_in_flight(), 3);
        assert_eq!(refresher.calls(), 10);
        assert_eq!(refresher.in_flight(), 0);
        assert_eq!(metrics.count(MetricEvent::RefreshSuccess), 10);
        assert!(metrics.count(MetricEvent::RefreshDeferred) > 0);

        let stats = engine.stats();
        assert_eq!(stats.active_refreshes, 0);
        assert_eq!(stats.refreshing_sessions, 0);
        assert_eq!(stats.total_sessions, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_refresh_per_connection_proceeds() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let (engine, _) = engine(manual_config(10), &refresher);
        let id = cid("conn-1");
        engine.register_connection(id.clone(), auth("alice")).unwrap();

        let (first, second) = tokio::join!(
            engine.refresh_connection_token(&id),
            engine.refresh_connection_token(&id),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r.as_ref().map_err(SessionError::kind),
            Err(ErrorKind::AlreadyRefreshing)
        )));
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_provider_conserves_the_counter() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY).then(Step::Panic));
        let (engine, _) = engine(manual_config(1), &refresher);
        let id = cid("conn-1");
        engine.register_connection(id.clone(), auth("alice")).unwrap();

        let task = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.refresh_connection_token(&id).await })
        };

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(engine.stats().active_refreshes, 0);
        assert!(!engine.get_session_state(&id).unwrap().is_refreshing());
        engine.refresh_connection_token(&id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_refresh_is_swept_and_connection_can_re_register() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(Duration::from_secs(120)));
        let (engine, clock) = engine(manual_config(10), &refresher);
        let id = cid("conn-1");
        engine.register_connection(id.clone(), auth("alice")).unwrap();

        let stuck = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.refresh_connection_token(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.stats().active_refreshes, 1);

        clock.advance(Duration::from_secs(31));
        let report = engine.sweep_now();
        assert_eq!(report.removed, vec![(id.clone(), RemovalReason::StuckRefresh)]);
        assert!(engine.get_session_state(&id).is_none());

        engine.register_connection(id.clone(), auth("alice")).unwrap();
        assert!(engine.is_session_valid(&id));

        let late = stuck.await.unwrap().unwrap_err();
        assert_eq!(late.kind(), ErrorKind::NotRegistered);
        let entry = engine.get_session_state(&id).unwrap();
        assert_eq!(entry.current_token().as_str(), "access-alice");
        assert!(entry.session_valid());
        assert_eq!(engine.stats().active_refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_credentials_are_refreshed_in_the_background() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let (engine, _) = engine(SessionConfig::default(), &refresher);
        let id = cid("conn-1");
        engine
            .register_connection(
                id.clone(),
                auth("alice").with_expiry(T0 + Duration::from_secs(200)),
            )
            .unwrap();
        assert!(engine.needs_refresh(&id));

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(refresher.calls(), 1);
        assert!(!engine.needs_refresh(&id));
        let entry = engine.get_session_state(&id).unwrap();
        assert_eq!(entry.current_token().as_str(), "refreshed-1");
        assert_eq!(entry.token_expiry(), Some(T0 + Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_summarize_sessions() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY).then(Step::Revoke));
        let (engine, _) = engine(manual_config(4), &refresher);
        for name in ["a", "b", "c"] {
            engine.register_connection(cid(name), auth(name)).unwrap();
        }
        engine.refresh_connection_token(&cid("a")).await.unwrap_err();

        let stats = engine.stats();

        assert_eq!(stats.taken_at, T0);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.invalid_sessions, 1);
        assert_eq!(stats.refreshing_sessions, 0);
        assert!((stats.average_refresh_attempts - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.max_concurrent_refreshes, 4);
        assert_eq!(stats.max_sessions, 1000);
        assert_eq!(stats.memory_usage_bytes, Some(64 * 1024 * 1024));
        assert!(!stats.shut_down);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["invalid_sessions"], 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn shutdown_is_idempotent_and_refuses_work() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let (engine, _) = engine(SessionConfig::default(), &refresher);
        let id = cid("conn-1");
        engine.register_connection(id.clone(), auth("alice")).unwrap();

        engine.shutdown();
        engine.shutdown();

        assert!(engine.is_shut_down());
        let stats = engine.stats();
        assert!(stats.shut_down);
        assert_eq!(stats.total_sessions, 0);

        let err = engine
            .register_connection(id.clone(), auth("alice"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
        let err = engine.refresh_connection_token(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(engine.refresh_due_now(), 0);
        assert!(!engine.is_session_valid(&id));
        engine.unregister_connection(&id);
        assert_eq!(refresher.calls(), 0);

        assert!(logs_contain("session engine shut down"));
    }

    #[derive(Debug, Default)]
    struct SlowAdmissionStore(InMemorySessionStore);

    impl SessionStore for SlowAdmissionStore {
        fn insert_bounded(
            &self,
            entry: SessionEntry,
            limit: crate::registry::CapacityLimit,
        ) -> crate::registry::Admission {
            std::thread::sleep(Duration::from_millis(100));
            self.0.insert_bounded(entry, limit)
        }

        fn remove(&self, id: &ConnectionIdRef) -> Option<SessionEntry> {
            self.0.remove(id)
        }

        fn remove_if<F>(&self, id: &ConnectionIdRef, predicate: F) -> Option<SessionEntry>
        where
            F: FnOnce(&mut SessionEntry) -> bool,
        {
            self.0.remove_if(id, predicate)
        }

        fn update<F, R>(&self, id: &ConnectionIdRef, f: F) -> Option<R>
        where
            F: FnOnce(&mut SessionEntry) -> R,
        {
            self.0.update(id, f)
        }

        fn snapshot(&self) -> Vec<SessionEntry> {
            self.0.snapshot()
        }

        fn len(&self) -> usize {
            self.0.len()
        }

        fn clear(&self) {
            self.0.clear()
        }
    }

    #[test]
    fn shutdown_during_registration_leaves_no_session_behind() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let engine = SessionEngine::builder(manual_config(10), refresher)
            .with_store(SlowAdmissionStore::default())
            .with_clock(TestClock::new(T0))
            .spawn();
        let id = cid("conn-1");

        std::thread::scope(|scope| {
            let registering = scope.spawn(|| engine.register_connection(id.clone(), auth("alice")));
            std::thread::sleep(Duration::from_millis(20));
            engine.shutdown();
            registering.join().unwrap().unwrap();
        });

        assert!(engine.is_shut_down());
        assert_eq!(engine.stats().total_sessions, 0);
        assert!(engine.get_session_state(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_do_not_keep_the_engine_alive() {
        let refresher = Arc::new(ScriptedRefresher::succeeding(PROVIDER_DELAY));
        let (engine, _) = engine(SessionConfig::default(), &refresher);
        assert_eq!(Arc::strong_count(&refresher), 2);

        drop(engine);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(Arc::strong_count(&refresher), 1);
        assert_eq!(refresher.calls(), 0);
    }
}
