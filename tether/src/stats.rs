//! Point-in-time snapshots of engine state

use serde::Serialize;
use tether_clock::UnixMillis;

use crate::registry::SessionEntry;

/// Reads the resident memory of the current process, in bytes
pub fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory())
}

/// A snapshot of the registry and refresh machinery
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionStats {
    /// When the snapshot was taken
    pub taken_at: UnixMillis,
    /// Registered sessions
    pub total_sessions: usize,
    /// Valid sessions with no expired grace period
    pub active_sessions: usize,
    /// Sessions with a refresh in flight
    pub refreshing_sessions: usize,
    /// Sessions marked invalid but not yet swept
    pub invalid_sessions: usize,
    /// Mean refresh attempts since each session's last success
    pub average_refresh_attempts: f64,
    /// Refreshes currently holding a concurrency slot
    pub active_refreshes: usize,
    /// The concurrency bound
    pub max_concurrent_refreshes: usize,
    /// Resident process memory, if it could be read
    pub memory_usage_bytes: Option<u64>,
    /// Registry capacity
    pub max_sessions: usize,
    /// Whether the engine has been shut down
    pub shut_down: bool,
}

/// The parts of a snapshot that do not come from the registry
#[derive(Clone, Copy, Debug)]
pub(crate) struct EngineGauges {
    pub active_refreshes: usize,
    pub max_concurrent_refreshes: usize,
    pub max_sessions: usize,
    pub memory_usage_bytes: Option<u64>,
    pub shut_down: bool,
}

impl SessionStats {
    pub(crate) fn collect(entries: &[SessionEntry], now: UnixMillis, gauges: EngineGauges) -> Self {
        let mut active_sessions = 0;
        let mut refreshing_sessions = 0;
        let mut invalid_sessions = 0;
        let mut total_attempts = 0u64;

        for e in entries {
            if !e.session_valid() {
                invalid_sessions += 1;
            } else if !e.grace_period_passed_at(now) {
                active_sessions += 1;
            }
            if e.is_refreshing() {
                refreshing_sessions += 1;
            }
            total_attempts += u64::from(e.refresh_attempts());
        }

        let average_refresh_attempts = if entries.is_empty() {
            0.0
        } else {
            total_attempts as f64 / entries.len() as f64
        };

        Self {
            taken_at: now,
            total_sessions: entries.len(),
            active_sessions,
            refreshing_sessions,
            invalid_sessions,
            average_refresh_attempts,
            active_refreshes: gauges.active_refreshes,
            max_concurrent_refreshes: gauges.max_concurrent_refreshes,
            memory_usage_bytes: gauges.memory_usage_bytes,
            max_sessions: gauges.max_sessions,
            shut_down: gauges.shut_down,
        }
    }
}
