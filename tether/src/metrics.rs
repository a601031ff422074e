//! Counters and gauges emitted by the engine

use std::fmt;

/// A countable engine event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    /// A connection was registered
    Registration,
    /// A connection was unregistered by the caller
    Unregistration,
    /// A credential refresh succeeded
    RefreshSuccess,
    /// A credential refresh failed
    RefreshFailure,
    /// A credential refresh was turned away by the concurrency limit
    RefreshDeferred,
    /// Emergency eviction ran to make room for a registration
    EmergencyCleanup,
    /// A registration was refused because the registry is full
    SessionLimitReached,
    /// The sweeper removed a session
    SessionRemoved,
}

impl MetricEvent {
    /// A stable, dotted name for the event
    pub const fn name(self) -> &'static str {
        match self {
            Self::Registration => "session.registration",
            Self::Unregistration => "session.unregistration",
            Self::RefreshSuccess => "session.refresh.success",
            Self::RefreshFailure => "session.refresh.failure",
            Self::RefreshDeferred => "session.refresh.deferred",
            Self::EmergencyCleanup => "session.emergency_cleanup",
            Self::SessionLimitReached => "session.limit_reached",
            Self::SessionRemoved => "session.removed",
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A sampled engine measurement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Gauge {
    /// Refreshes currently in flight
    ActiveRefreshes,
    /// Process memory in bytes
    MemoryUsage,
    /// Sessions currently registered
    Sessions,
}

impl Gauge {
    /// A stable, dotted name for the gauge
    pub const fn name(self) -> &'static str {
        match self {
            Self::ActiveRefreshes => "session.refresh.active",
            Self::MemoryUsage => "process.memory_bytes",
            Self::Sessions => "session.count",
        }
    }
}

impl fmt::Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A sink for engine metrics
pub trait SessionMetrics: Send + Sync + fmt::Debug {
    /// Counts one occurrence of `event`
    fn increment(&self, event: MetricEvent);

    /// Records the current value of `gauge`
    fn gauge(&self, gauge: Gauge, value: u64);
}

/// Reports metrics as `tracing` events at the `trace` level
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetrics;

impl SessionMetrics for TracingMetrics {
    fn increment(&self, event: MetricEvent) {
        tracing::trace!(metric = event.name(), "counter incremented");
    }

    fn gauge(&self, gauge: Gauge, value: u64) {
        tracing::trace!(metric = gauge.name(), value, "gauge recorded");
    }
}

/// Discards all metrics
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl SessionMetrics for NoopMetrics {
    #[inline]
    fn increment(&self, _: MetricEvent) {}

    #[inline]
    fn gauge(&self, _: Gauge, _: u64) {}
}

#[cfg(test)]
pub(crate) use recording::RecordingMetrics;
