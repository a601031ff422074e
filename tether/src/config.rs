//! Engine configuration and its validation
//!
//! A [`SessionConfig`] can only be obtained already validated. Partial
//! configurations, for example deserialized from a settings file, are merged
//! over the defaults and then checked as a whole, so that every problem is
//! reported at once.

use std::{fmt, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;

const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 300;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_REFRESH_GRACE_PERIOD_MS: u64 = 60_000;
const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 10;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 300_000;
const DEFAULT_MAX_SESSION_AGE_MS: u64 = 24 * 60 * 60 * 1_000;
const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_SESSIONS: usize = 1_000;
const DEFAULT_MEMORY_WARNING_THRESHOLD: u64 = 512 * 1024 * 1024;

const MIN_REFRESH_THRESHOLD_SECS: u64 = 60;
const MAX_RETRY_ATTEMPTS_RANGE: (u32, u32) = (1, 10);
const MIN_RETRY_DELAY_MS: u64 = 100;
const MIN_CLEANUP_INTERVAL_MS: u64 = 60_000;
const MAX_SESSIONS_RANGE: (usize, usize) = (10, 10_000);

/// Validated, immutable engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    refresh_threshold_secs: u64,
    max_retry_attempts: u32,
    retry_delay_ms: u64,
    enable_auto_refresh: bool,
    check_interval_ms: u64,
    refresh_grace_period_ms: u64,
    max_concurrent_refreshes: usize,
    cleanup_interval_ms: u64,
    max_session_age_ms: u64,
    refresh_timeout_ms: u64,
    max_sessions: usize,
    memory_warning_threshold: u64,
}

impl Default for SessionConfig {
    /// Default configuration
    ///
    /// Refreshes credentials 5 minutes before they expire with up to 10
    /// refreshes in flight, sweeps every 5 minutes, and holds at most 1000
    /// sessions for no longer than a day.
    fn default() -> Self {
        Self {
            refresh_threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            enable_auto_refresh: true,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            refresh_grace_period_ms: DEFAULT_REFRESH_GRACE_PERIOD_MS,
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            max_session_age_ms: DEFAULT_MAX_SESSION_AGE_MS,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            memory_warning_threshold: DEFAULT_MEMORY_WARNING_THRESHOLD,
        }
    }
}

impl SessionConfig {
    /// Starts building a configuration from the defaults
    pub fn builder() -> PartialSessionConfig {
        PartialSessionConfig::default()
    }

    /// Merges `partial` over the defaults and validates the result
    ///
    /// # Errors
    ///
    /// Returns every violated bound and cross-field invariant.
    pub fn from_partial(partial: PartialSessionConfig) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            refresh_threshold_secs: partial
                .refresh_threshold_secs
                .unwrap_or(d.refresh_threshold_secs),
            max_retry_attempts: partial.max_retry_attempts.unwrap_or(d.max_retry_attempts),
            retry_delay_ms: partial.retry_delay_ms.unwrap_or(d.retry_delay_ms),
            enable_auto_refresh: partial.enable_auto_refresh.unwrap_or(d.enable_auto_refresh),
            check_interval_ms: partial.check_interval_ms.unwrap_or(d.check_interval_ms),
            refresh_grace_period_ms: partial
                .refresh_grace_period_ms
                .unwrap_or(d.refresh_grace_period_ms),
            max_concurrent_refreshes: partial
                .max_concurrent_refreshes
                .unwrap_or(d.max_concurrent_refreshes),
            cleanup_interval_ms: partial.cleanup_interval_ms.unwrap_or(d.cleanup_interval_ms),
            max_session_age_ms: partial.max_session_age_ms.unwrap_or(d.max_session_age_ms),
            refresh_timeout_ms: partial.refresh_timeout_ms.unwrap_or(d.refresh_timeout_ms),
            max_sessions: partial.max_sessions.unwrap_or(d.max_sessions),
            memory_warning_threshold: partial
                .memory_warning_threshold
                .unwrap_or(d.memory_warning_threshold),
        };

        let violations = config.violations();
        if violations.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError { violations })
        }
    }

    fn violations(&self) -> Vec<ConfigViolation> {
        let mut v = Vec::new();
        let mut check = |ok: bool, field: &'static str, message: String| {
            if !ok {
                v.push(ConfigViolation { field, message });
            }
        };

        check(
            self.refresh_threshold_secs >= MIN_REFRESH_THRESHOLD_SECS,
            "refresh_threshold_secs",
            format!("must be at least {}", MIN_REFRESH_THRESHOLD_SECS),
        );
        check(
            (MAX_RETRY_ATTEMPTS_RANGE.0..=MAX_RETRY_ATTEMPTS_RANGE.1)
                .contains(&self.max_retry_attempts),
            "max_retry_attempts",
            format!(
                "must be between {} and {}",
                MAX_RETRY_ATTEMPTS_RANGE.0, MAX_RETRY_ATTEMPTS_RANGE.1
            ),
        );
        check(
            self.retry_delay_ms >= MIN_RETRY_DELAY_MS,
            "retry_delay_ms",
            format!("must be at least {}", MIN_RETRY_DELAY_MS),
        );
        check(
            self.check_interval_ms > 0,
            "check_interval_ms",
            "must be greater than 0".into(),
        );
        check(
            self.check_interval_ms <= self.refresh_threshold_secs.saturating_mul(1_000),
            "check_interval_ms",
            format!(
                "must not exceed refresh_threshold_secs ({} ms)",
                self.refresh_threshold_secs.saturating_mul(1_000)
            ),
        );
        check(
            self.max_concurrent_refreshes >= 1,
            "max_concurrent_refreshes",
            "must be at least 1".into(),
        );
        check(
            self.cleanup_interval_ms >= MIN_CLEANUP_INTERVAL_MS,
            "cleanup_interval_ms",
            format!("must be at least {}", MIN_CLEANUP_INTERVAL_MS),
        );
        check(
            self.max_session_age_ms > self.cleanup_interval_ms,
            "max_session_age_ms",
            format!(
                "must be greater than cleanup_interval_ms ({})",
                self.cleanup_interval_ms
            ),
        );
        check(
            self.refresh_timeout_ms > 0,
            "refresh_timeout_ms",
            "must be greater than 0".into(),
        );
        check(
            self.refresh_timeout_ms < self.refresh_grace_period_ms,
            "refresh_timeout_ms",
            format!(
                "must be less than refresh_grace_period_ms ({})",
                self.refresh_grace_period_ms
            ),
        );
        check(
            (MAX_SESSIONS_RANGE.0..=MAX_SESSIONS_RANGE.1).contains(&self.max_sessions),
            "max_sessions",
            format!(
                "must be between {} and {}",
                MAX_SESSIONS_RANGE.0, MAX_SESSIONS_RANGE.1
            ),
        );
        check(
            self.memory_warning_threshold > 0,
            "memory_warning_threshold",
            "must be greater than 0".into(),
        );

        v
    }

    /// How long before expiry a credential is refreshed proactively
    #[inline]
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    /// Attempts made per refresh call
    #[inline]
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// Delay between attempts of a refresh call
    #[inline]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The retry policy applied to identity provider calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retry_attempts, self.retry_delay())
    }

    /// Whether the background monitor and sweeper run
    #[inline]
    pub fn enable_auto_refresh(&self) -> bool {
        self.enable_auto_refresh
    }

    /// Period of the proactive refresh monitor
    #[inline]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// How long a session stays pending while its refresh is outstanding
    #[inline]
    pub fn refresh_grace_period(&self) -> Duration {
        Duration::from_millis(self.refresh_grace_period_ms)
    }

    /// Bound on refreshes in flight across all sessions
    #[inline]
    pub fn max_concurrent_refreshes(&self) -> usize {
        self.max_concurrent_refreshes
    }

    /// Period of the cleanup sweeper
    #[inline]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Maximum age of a session before it is removed
    #[inline]
    pub fn max_session_age(&self) -> Duration {
        Duration::from_millis(self.max_session_age_ms)
    }

    /// How long a refresh may be outstanding before it is considered stuck
    #[inline]
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    /// Registry capacity
    #[inline]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Process memory, in bytes, above which the sweeper warns
    #[inline]
    pub fn memory_warning_threshold(&self) -> u64 {
        self.memory_warning_threshold
    }
}

/// A configuration where any field may be left to its default
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PartialSessionConfig {
    /// Seconds before expiry to trigger a proactive refresh
    pub refresh_threshold_secs: Option<u64>,
    /// Attempts per refresh call
    pub max_retry_attempts: Option<u32>,
    /// Milliseconds between attempts
    pub retry_delay_ms: Option<u64>,
    /// Whether the monitor and sweeper run
    pub enable_auto_refresh: Option<bool>,
    /// Monitor period in milliseconds
    pub check_interval_ms: Option<u64>,
    /// Milliseconds a session stays pending during a refresh
    pub refresh_grace_period_ms: Option<u64>,
    /// Global bound on refreshes in flight
    pub max_concurrent_refreshes: Option<usize>,
    /// Sweeper period in milliseconds
    pub cleanup_interval_ms: Option<u64>,
    /// Maximum session age in milliseconds
    pub max_session_age_ms: Option<u64>,
    /// Milliseconds before an outstanding refresh is considered stuck
    pub refresh_timeout_ms: Option<u64>,
    /// Registry capacity
    pub max_sessions: Option<usize>,
    /// Process memory warning threshold in bytes
    pub memory_warning_threshold: Option<u64>,
}

macro_rules! setter {
    ($name:ident: $ty:ty) => {
        #[doc = concat!("Sets `", stringify!($name), "`")]
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = Some(value);
            self
        }
    };
}

impl PartialSessionConfig {
    setter!(refresh_threshold_secs: u64);
    setter!(max_retry_attempts: u32);
    setter!(retry_delay_ms: u64);
    setter!(enable_auto_refresh: bool);
    setter!(check_interval_ms: u64);
    setter!(refresh_grace_period_ms: u64);
    setter!(max_concurrent_refreshes: usize);
    setter!(cleanup_interval_ms: u64);
    setter!(max_session_age_ms: u64);
    setter!(refresh_timeout_ms: u64);
    setter!(max_sessions: usize);
    setter!(memory_warning_threshold: u64);

    /// Merges over the defaults and validates
    ///
    /// # Errors
    ///
    /// See [`SessionConfig::from_partial()`].
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        SessionConfig::from_partial(self)
    }
}

/// A single violated configuration constraint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigViolation {
    /// The offending field
    pub field: &'static str,
    /// What the field must satisfy
    pub message: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// The configuration was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid session configuration: {}", DisplayViolations(&self.violations))]
pub struct ConfigError {
    violations: Vec<ConfigViolation>,
}

impl ConfigError {
    /// Every violated constraint
    pub fn violations(&self) -> &[ConfigViolation] {
        &self.violations
    }

    /// Whether `field` was among the violations
    pub fn involves(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

struct DisplayViolations<'a>(&'a [ConfigViolation]);

impl fmt::Display for DisplayViolations<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, v) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(v, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::builder().build().unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn partial_values_override_defaults() {
        let config = SessionConfig::builder()
            .max_sessions(50)
            .max_concurrent_refreshes(3)
            .build()
            .unwrap();

        assert_eq!(config.max_sessions(), 50);
        assert_eq!(config.max_concurrent_refreshes(), 3);
        assert_eq!(config.refresh_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn retry_policy_follows_settings() {
        let config = SessionConfig::builder()
            .max_retry_attempts(5)
            .retry_delay_ms(250)
            .build()
            .unwrap();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(250));
    }

    #[test]
    fn every_violation_is_reported() {
        let err = SessionConfig::builder()
            .refresh_threshold_secs(30)
            .max_retry_attempts(0)
            .retry_delay_ms(10)
            .max_concurrent_refreshes(0)
            .cleanup_interval_ms(1_000)
            .max_sessions(5)
            .build()
            .unwrap_err();

        for field in [
            "refresh_threshold_secs",
            "max_retry_attempts",
            "retry_delay_ms",
            "max_concurrent_refreshes",
            "cleanup_interval_ms",
            "max_sessions",
            // 60 s of checking is longer than the 30 s threshold
            "check_interval_ms",
        ] {
            assert!(err.involves(field), "expected violation for {}", field);
        }
        assert!(!err.involves("max_session_age_ms"));
    }

    #[test]
    fn cross_field_invariants_are_checked() {
        let err = SessionConfig::builder()
            .refresh_timeout_ms(60_000)
            .refresh_grace_period_ms(60_000)
            .max_session_age_ms(300_000)
            .build()
            .unwrap_err();

        assert!(err.involves("refresh_timeout_ms"));
        assert!(err.involves("max_session_age_ms"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn error_message_lists_each_field() {
        let err = SessionConfig::builder()
            .max_sessions(20_000)
            .max_retry_attempts(11)
            .build()
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("max_retry_attempts must be between 1 and 10"));
        assert!(msg.contains("max_sessions must be between 10 and 10000"));
    }

    #[test]
    fn deserializes_partial_settings() {
        let partial: PartialSessionConfig =
            serde_json::from_str(r#"{ "max_sessions": 200, "enable_auto_refresh": false }"#)
                .unwrap();
        let config = partial.build().unwrap();

        assert_eq!(config.max_sessions(), 200);
        assert!(!config.enable_auto_refresh());
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let res = serde_json::from_str::<PartialSessionConfig>(r#"{ "max_session": 200 }"#);
        assert!(res.is_err());
    }
}
