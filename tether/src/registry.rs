//! The session registry and its backing store
//!
//! All session state lives behind a [`SessionStore`]. The store owns the
//! synchronization: every read-modify-write of an entry goes through
//! [`SessionStore::update()`], and admission under capacity pressure goes
//! through [`SessionStore::insert_bounded()`], so the registry never observes
//! a half-applied change.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tether_clock::{Clock, UnixMillis};

use crate::{
    claims,
    metrics::{Gauge, MetricEvent, SessionMetrics},
    AccessToken, ConnectionId, ConnectionIdRef, RefreshToken, SessionError, UserId,
};

/// The credential state a connection is registered with
#[derive(Clone, Debug)]
pub struct InitialAuthState {
    /// The user who owns the session
    pub user_id: UserId,
    /// The access token presented when the connection was accepted
    pub access_token: AccessToken,
    /// The refresh token paired with the access token
    pub refresh_token: RefreshToken,
    /// When the access token expires
    ///
    /// If not given, it is read from the token's `exp` claim when the access
    /// token is a JWT.
    pub token_expiry: Option<UnixMillis>,
}

impl InitialAuthState {
    /// Constructs a new initial state, deriving the expiry from the token
    pub fn new(user_id: UserId, access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            user_id,
            access_token,
            refresh_token,
            token_expiry: None,
        }
    }

    /// Sets an explicit expiry for the access token
    pub fn with_expiry(mut self, token_expiry: UnixMillis) -> Self {
        self.token_expiry = Some(token_expiry);
        self
    }
}

/// The refresh state of one registered connection
#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub(crate) connection_id: ConnectionId,
    pub(crate) user_id: UserId,
    pub(crate) current_token: AccessToken,
    pub(crate) refresh_token: RefreshToken,
    pub(crate) token_expiry: Option<UnixMillis>,
    pub(crate) registered_at: UnixMillis,
    pub(crate) registration: u64,
    pub(crate) last_refresh_attempt: Option<UnixMillis>,
    pub(crate) refresh_start_time: Option<UnixMillis>,
    pub(crate) last_accessed: UnixMillis,
    pub(crate) access_seq: u64,
    pub(crate) refresh_attempts: u32,
    pub(crate) is_refreshing: bool,
    pub(crate) session_valid: bool,
    pub(crate) grace_period_expiry: Option<UnixMillis>,
}

impl SessionEntry {
    /// The connection this entry belongs to
    #[inline]
    pub fn connection_id(&self) -> &ConnectionIdRef {
        &self.connection_id
    }

    /// The user who owns the session
    #[inline]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The current access token
    #[inline]
    pub fn current_token(&self) -> &AccessToken {
        &self.current_token
    }

    /// The current refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshToken {
        &self.refresh_token
    }

    /// When the current access token expires, if known
    #[inline]
    pub fn token_expiry(&self) -> Option<UnixMillis> {
        self.token_expiry
    }

    /// When the connection was registered
    #[inline]
    pub fn registered_at(&self) -> UnixMillis {
        self.registered_at
    }

    /// A number unique to this registration within the process
    ///
    /// Re-registering the same connection yields a new number.
    #[inline]
    pub fn registration(&self) -> u64 {
        self.registration
    }

    /// When a refresh was last started
    #[inline]
    pub fn last_refresh_attempt(&self) -> Option<UnixMillis> {
        self.last_refresh_attempt
    }

    /// When the outstanding refresh started
    #[inline]
    pub fn refresh_start_time(&self) -> Option<UnixMillis> {
        self.refresh_start_time
    }

    /// When the entry was last read by a caller
    #[inline]
    pub fn last_accessed(&self) -> UnixMillis {
        self.last_accessed
    }

    /// A monotonically increasing stamp of the last access
    ///
    /// Orders accesses that happened within the same millisecond.
    #[inline]
    pub fn access_seq(&self) -> u64 {
        self.access_seq
    }

    /// Refreshes attempted since the last success
    #[inline]
    pub fn refresh_attempts(&self) -> u32 {
        self.refresh_attempts
    }

    /// Whether a refresh is outstanding
    #[inline]
    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing
    }

    /// Whether the session is still usable
    #[inline]
    pub fn session_valid(&self) -> bool {
        self.session_valid
    }

    /// When the pending state of an unsuccessful refresh runs out
    #[inline]
    pub fn grace_period_expiry(&self) -> Option<UnixMillis> {
        self.grace_period_expiry
    }

    /// Whether the credential is close enough to expiry to be refreshed at `now`
    pub fn needs_refresh_at(&self, now: UnixMillis, threshold: Duration) -> bool {
        match self.token_expiry {
            Some(expiry) => !self.is_refreshing && now >= expiry - threshold,
            None => false,
        }
    }

    /// Whether the grace period has run out at `now`
    #[inline]
    pub fn grace_period_passed_at(&self, now: UnixMillis) -> bool {
        self.grace_period_expiry.map_or(false, |g| now > g)
    }

    fn touch(&mut self, now: UnixMillis, seq: u64) {
        self.last_accessed = now;
        self.access_seq = seq;
    }
}

/// How a store should make room when it is full
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityLimit {
    /// The most entries the store may hold
    pub max_sessions: usize,
    /// The size that emergency eviction shrinks the store to
    pub evict_to: usize,
}

impl CapacityLimit {
    /// A limit that evicts down to 80% of `max_sessions`
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            evict_to: max_sessions * 4 / 5,
        }
    }
}

/// The outcome of offering an entry to a store
#[derive(Debug)]
pub enum Admission {
    /// The entry was added
    Inserted,
    /// The entry replaced one with the same connection ID
    Replaced(SessionEntry),
    /// The entry was added after evicting the least recently accessed entries
    InsertedAfterEviction(Vec<SessionEntry>),
    /// The store is full and could not make room
    Rejected,
}

/// Storage for session entries
///
/// Implementations must apply each call atomically with respect to every
/// other call on the same store.
pub trait SessionStore: Send + Sync + 'static {
    /// Inserts `entry`, replacing any entry with the same connection ID
    ///
    /// If the entry is new and the store already holds
    /// `limit.max_sessions` entries, the least recently accessed entries
    /// (by `last_accessed`, then `access_seq`) are removed until at most
    /// `limit.evict_to` remain. If that still leaves the store full, the
    /// entry is rejected.
    fn insert_bounded(&self, entry: SessionEntry, limit: CapacityLimit) -> Admission;

    /// Removes and returns an entry
    fn remove(&self, id: &ConnectionIdRef) -> Option<SessionEntry>;

    /// Removes and returns an entry if `predicate` accepts it
    ///
    /// The predicate may modify the entry before it is removed.
    fn remove_if<F>(&self, id: &ConnectionIdRef, predicate: F) -> Option<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry) -> bool;

    /// Applies `f` to an entry in place
    fn update<F, R>(&self, id: &ConnectionIdRef, f: F) -> Option<R>
    where
        F: FnOnce(&mut SessionEntry) -> R;

    /// Copies out every entry
    fn snapshot(&self) -> Vec<SessionEntry>;

    /// The number of entries
    fn len(&self) -> usize;

    /// Whether the store holds no entries
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry
    fn clear(&self);
}

/// A session store held in process memory
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<ConnectionId, SessionEntry>>,
}

impl InMemorySessionStore {
    /// Constructs a new, empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn evict_least_recent(
    entries: &mut HashMap<ConnectionId, SessionEntry>,
    evict_to: usize,
) -> Vec<SessionEntry> {
    let excess = entries.len().saturating_sub(evict_to);
    if excess == 0 {
        return Vec::new();
    }

    let mut by_age: Vec<(UnixMillis, u64, ConnectionId)> = entries
        .values()
        .map(|e| (e.last_accessed, e.access_seq, e.connection_id.clone()))
        .collect();
    by_age.sort_unstable();

    by_age
        .into_iter()
        .take(excess)
        .filter_map(|(_, _, id)| entries.remove(&id))
        .collect()
}

impl SessionStore for InMemorySessionStore {
    fn insert_bounded(&self, entry: SessionEntry, limit: CapacityLimit) -> Admission {
        let mut entries = self.entries.lock();

        if entries.contains_key(&entry.connection_id) {
            let previous = entries.insert(entry.connection_id.clone(), entry);
            return match previous {
                Some(previous) => Admission::Replaced(previous),
                None => Admission::Inserted,
            };
        }

        if entries.len() < limit.max_sessions {
            entries.insert(entry.connection_id.clone(), entry);
            return Admission::Inserted;
        }

        let evicted = evict_least_recent(&mut entries, limit.evict_to);
        if entries.len() >= limit.max_sessions {
            return Admission::Rejected;
        }

        entries.insert(entry.connection_id.clone(), entry);
        Admission::InsertedAfterEviction(evicted)
    }

    fn remove(&self, id: &ConnectionIdRef) -> Option<SessionEntry> {
        self.entries.lock().remove(id)
    }

    fn remove_if<F>(&self, id: &ConnectionIdRef, predicate: F) -> Option<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry) -> bool,
    {
        let mut entries = self.entries.lock();
        let remove = entries.get_mut(id).map_or(false, predicate);
        if remove {
            entries.remove(id)
        } else {
            None
        }
    }

    fn update<F, R>(&self, id: &ConnectionIdRef, f: F) -> Option<R>
    where
        F: FnOnce(&mut SessionEntry) -> R,
    {
        self.entries.lock().get_mut(id).map(f)
    }

    fn snapshot(&self) -> Vec<SessionEntry> {
        self.entries.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// The registry of connection-bound sessions
///
/// Reads made on behalf of callers count as accesses for the purposes of
/// emergency eviction. Reads made by the background tasks go through
/// [`snapshot()`][Self::snapshot()] and do not.
#[derive(Debug)]
pub struct SessionRegistry<S, C> {
    store: S,
    clock: C,
    limit: CapacityLimit,
    refresh_threshold: Duration,
    registrations: AtomicU64,
    access_seq: AtomicU64,
    metrics: Arc<dyn SessionMetrics>,
}

impl<S, C> SessionRegistry<S, C>
where
    S: SessionStore,
    C: Clock,
{
    /// Constructs a registry over `store`
    pub fn new(
        store: S,
        clock: C,
        max_sessions: usize,
        refresh_threshold: Duration,
        metrics: Arc<dyn SessionMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            limit: CapacityLimit::new(max_sessions),
            refresh_threshold,
            registrations: AtomicU64::new(0),
            access_seq: AtomicU64::new(0),
            metrics,
        }
    }

    #[inline]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    /// The current time according to the registry's clock
    #[inline]
    pub fn now(&self) -> UnixMillis {
        self.clock.now()
    }

    fn next_access(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a connection
    ///
    /// Registering a connection that is already present replaces its state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CapacityExceeded`] if the registry is full and
    /// emergency eviction could not make room, or a validation error if an
    /// identifier is empty.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        state: InitialAuthState,
    ) -> Result<(), SessionError> {
        if connection_id.as_str().is_empty() {
            return Err(SessionError::validation("connection ID must not be empty"));
        }
        if state.user_id.as_str().is_empty() {
            return Err(SessionError::validation("user ID must not be empty"));
        }

        let now = self.clock.now();
        let token_expiry = state
            .token_expiry
            .or_else(|| claims::peek_expiry(&state.access_token));

        let entry = SessionEntry {
            connection_id: connection_id.clone(),
            user_id: state.user_id,
            current_token: state.access_token,
            refresh_token: state.refresh_token,
            token_expiry,
            registered_at: now,
            registration: self.registrations.fetch_add(1, Ordering::Relaxed) + 1,
            last_refresh_attempt: None,
            refresh_start_time: None,
            last_accessed: now,
            access_seq: self.next_access(),
            refresh_attempts: 0,
            is_refreshing: false,
            session_valid: true,
            grace_period_expiry: None,
        };

        match self.store.insert_bounded(entry, self.limit) {
            Admission::Inserted => {
                tracing::debug!(connection.id = %connection_id, token_expiry = ?token_expiry.map(|t| t.0), "registered connection");
            }
            Admission::Replaced(previous) => {
                tracing::debug!(
                    connection.id = %connection_id,
                    previous_registration = previous.registration,
                    "re-registered connection, replacing previous session"
                );
            }
            Admission::InsertedAfterEviction(evicted) => {
                tracing::warn!(
                    connection.id = %connection_id,
                    evicted = evicted.len(),
                    max_sessions = self.limit.max_sessions,
                    "session limit reached, evicted least recently accessed sessions"
                );
                for e in &evicted {
                    tracing::debug!(connection.id = %e.connection_id, "evicted session");
                }
                self.metrics.increment(MetricEvent::SessionLimitReached);
                self.metrics.increment(MetricEvent::EmergencyCleanup);
            }
            Admission::Rejected => {
                tracing::error!(
                    connection.id = %connection_id,
                    max_sessions = self.limit.max_sessions,
                    "session limit reached and eviction could not make room"
                );
                self.metrics.increment(MetricEvent::SessionLimitReached);
                return Err(SessionError::CapacityExceeded {
                    max_sessions: self.limit.max_sessions,
                });
            }
        }

        self.metrics.increment(MetricEvent::Registration);
        self.metrics.gauge(Gauge::Sessions, self.store.len() as u64);
        Ok(())
    }

    /// Removes a connection
    ///
    /// Removing an unknown connection does nothing.
    pub fn unregister(&self, connection_id: &ConnectionIdRef) {
        if self.store.remove(connection_id).is_some() {
            tracing::debug!(connection.id = %connection_id, "unregistered connection");
            self.metrics.increment(MetricEvent::Unregistration);
            self.metrics.gauge(Gauge::Sessions, self.store.len() as u64);
        }
    }

    /// Looks up a connection, marking it as accessed
    pub fn get(&self, connection_id: &ConnectionIdRef) -> Option<SessionEntry> {
        let now = self.clock.now();
        let seq = self.next_access();
        self.store.update(connection_id, |e| {
            e.touch(now, seq);
            e.clone()
        })
    }

    /// Whether a connection's credential is due for a proactive refresh
    pub fn needs_refresh(&self, connection_id: &ConnectionIdRef) -> bool {
        let now = self.clock.now();
        let seq = self.next_access();
        let threshold = self.refresh_threshold;
        self.store
            .update(connection_id, |e| {
                e.touch(now, seq);
                e.needs_refresh_at(now, threshold)
            })
            .unwrap_or(false)
    }

    /// Whether a connection's session may still be used
    ///
    /// A session whose refresh grace period ran out without a successful
    /// refresh is marked invalid by this check.
    pub fn is_valid(&self, connection_id: &ConnectionIdRef) -> bool {
        let now = self.clock.now();
        let seq = self.next_access();
        self.store
            .update(connection_id, |e| {
                e.touch(now, seq);
                if !e.session_valid {
                    false
                } else if e.grace_period_passed_at(now) {
                    tracing::info!(connection.id = %e.connection_id, "refresh grace period expired, invalidating session");
                    e.session_valid = false;
                    false
                } else {
                    true
                }
            })
            .unwrap_or(false)
    }

    /// Copies out every entry without marking any as accessed
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        self.store.snapshot()
    }

    /// The number of registered connections
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no connections are registered
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The registry capacity
    pub fn max_sessions(&self) -> usize {
        self.limit.max_sessions
    }

    /// The proactive refresh threshold
    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    pub(crate) fn clear(&self) {
        self.store.clear();
        self.metrics.gauge(Gauge::Sessions, 0);
    }
}
