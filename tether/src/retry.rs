//! Bounded retry handling for calls to the identity provider

use std::time::Duration;

/// Configuration for how many times, and how far apart, a failed call is retried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    /// Default retry policy
    ///
    /// Makes up to 3 attempts, waiting 1 second between each.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// A policy that waits the same `delay` between each of `max_attempts` attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// The total number of attempts, including the first
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The wait between attempts
    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Utility trait for extending types with a retry handler
pub trait WithRetry {
    /// The output of applying the retry policy
    type Output;

    /// Applies the retry policy to the current value
    fn with_retry(self, handler: &mut RetryHandler) -> Self::Output;
}

impl<T, E> WithRetry for Result<T, E> {
    type Output = Result<T, (E, Option<Duration>)>;

    /// On error, also reports the delay before the next attempt, or `None`
    /// once attempts are exhausted
    fn with_retry(self, handler: &mut RetryHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that tracks attempts against a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryHandler {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryHandler {
    /// Constructs a new handler from a [`RetryPolicy`]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// The number of attempts made so far
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reports a success
    pub fn success(&mut self) {
        self.attempts += 1;
    }

    /// Reports a failure and returns the delay before the next attempt
    ///
    /// Returns `None` once the policy's attempts have been used up.
    pub fn error(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay)
        }
    }
}
