//! Tuning knobs for the engine, gateway and recovery manager.

use std::time::Duration;

/// Retry ceilings and concurrency settings of the saga engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Forward dispatches per step before the step is declared failed.
    pub max_step_attempts: u32,
    /// Compensating dispatches per step before the saga is escalated.
    pub max_compensation_attempts: u32,
    /// Reload-and-retry cycles allowed when the store reports a version conflict.
    pub max_conflict_retries: u32,
    /// How long a claimed idempotency key blocks a resend of the same attempt.
    pub dispatch_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            max_compensation_attempts: 10,
            max_conflict_retries: 5,
            dispatch_window: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> RetryLimits {
        RetryLimits {
            max_step_attempts: self.max_step_attempts.max(1),
            max_compensation_attempts: self.max_compensation_attempts.max(1),
        }
    }
}

/// The retry ceilings the state machine enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub max_step_attempts: u32,
    pub max_compensation_attempts: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        EngineConfig::default().limits()
    }
}

/// Capped exponential delay applied before re-dispatching a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// No delay at all; used by tests and the in-process demo.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
        }
    }

    /// Returns the delay before sending `attempt`.
    ///
    /// The first attempt is sent immediately; attempt `n >= 2` waits
    /// `initial * multiplier^(n - 2)`, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// Delivery settings of the transport gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backoff: BackoffPolicy,
    /// Extra sends after a `TransportError::Unavailable` before giving up.
    pub transport_retries: u32,
    pub transport_retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            transport_retries: 2,
            transport_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Settings of the recovery manager.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Period of the stuck-instance sweep.
    pub interval: Duration,
    /// In-flight instances untouched for longer than this are expired.
    pub stuck_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stuck_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn no_backoff_never_waits() {
        let policy = BackoffPolicy::none();
        assert_eq!(policy.delay_for(7), Duration::ZERO);
    }

    #[test]
    fn limits_are_at_least_one() {
        let config = EngineConfig {
            max_step_attempts: 0,
            max_compensation_attempts: 0,
            ..Default::default()
        };
        let limits = config.limits();
        assert_eq!(limits.max_step_attempts, 1);
        assert_eq!(limits.max_compensation_attempts, 1);
    }
}
