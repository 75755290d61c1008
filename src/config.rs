// SPDX-License-Identifier: Apache-2.0

//! Value-passed configuration for building a [`Domain`](crate::domain::Domain). See
//! [`DomainConfig`] and [`RestartPolicy`].
//!
//! The runtime persists no state of its own; a CLI/config collaborator (out of scope
//! here) is responsible for turning flags or files into a [`DomainConfig`] and handing
//! it to [`Domain::build`](crate::domain::Domain::build).

use std::time::Duration;

/// Restart behavior for a dedicated helper thread (the dispatcher's blocking-syscall
/// helpers, §4.8) that dies and must be relaunched.
///
/// Adapted from the teacher's worker-restart policy: bounded attempts with optional
/// exponential backoff between them, so transient resource exhaustion (fd limits, a
/// port still in `TIME_WAIT`) has time to clear before the runtime gives up.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum restart attempts before giving up. `0` means never restart.
    pub max_restarts: u8,
    /// Delay before the first restart attempt. `None` means no delay.
    pub initial_delay: Option<Duration>,
    /// Multiplier applied to the delay after each attempt. `None` means constant delay.
    pub backoff_multiplier: Option<f64>,
    /// Cap on delay growth. `None` means unbounded growth.
    pub max_delay: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_delay: Some(Duration::from_millis(100)),
            backoff_multiplier: Some(2.0),
            max_delay: Some(Duration::from_secs(5)),
        }
    }
}

impl RestartPolicy {
    /// Computes the delay before attempt number `attempt` (1-indexed), clamped to
    /// `max_delay` if set.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(initial) = self.initial_delay else {
            return Duration::ZERO;
        };
        let multiplier = self.backoff_multiplier.unwrap_or(1.0);
        let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
        let scaled = initial.mul_f64(factor.max(0.0));
        match self.max_delay {
            Some(cap) => scaled.min(cap),
            None => scaled,
        }
    }
}

/// Configuration for a [`Domain`](crate::domain::Domain), passed by value at
/// construction. Every field has a sensible default; callers typically override only
/// `worker_count` and `core_ids`.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Number of worker OS threads (one context each). Defaults to the number of
    /// available parallelism hints from the OS, or 1 if that cannot be determined.
    pub worker_count: usize,
    /// Optional CPU core ids to pin worker threads to, one per worker. When shorter
    /// than `worker_count`, the remaining workers are left unpinned. When `None`, no
    /// pinning is attempted.
    pub core_ids: Option<Vec<usize>>,
    /// Default fiber stack size in 4 KiB pages (the spec's "seven pages" default).
    pub default_stack_pages: usize,
    /// Capacity (must be a power of two) of each context's async-call inbox ring.
    pub async_inbox_capacity: usize,
    /// Capacity (must be a power of two) of a combiner's backing ring, when not
    /// explicitly overridden at construction.
    pub default_combiner_capacity: usize,
    /// Maximum entries a combiner's executor drains per critical-section entry.
    pub default_combiner_handoff: usize,
    /// Capacity of each listener's per-target forward buffer.
    pub forward_buffer_capacity: usize,
    /// Restart policy applied to blocking-syscall helper threads.
    pub helper_restart_policy: RestartPolicy,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            core_ids: None,
            default_stack_pages: 7,
            async_inbox_capacity: 1024,
            default_combiner_capacity: 256,
            default_combiner_handoff: 16,
            forward_buffer_capacity: 256,
            helper_restart_policy: RestartPolicy::default(),
        }
    }
}

impl DomainConfig {
    /// Validates invariants that the rest of the runtime assumes hold (power-of-two
    /// ring capacities, `handoff >= 4`, at least one worker).
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.worker_count == 0 {
            return Err("worker_count must be at least 1");
        }
        if !self.async_inbox_capacity.is_power_of_two() {
            return Err("async_inbox_capacity must be a power of two");
        }
        if !self.default_combiner_capacity.is_power_of_two() {
            return Err("default_combiner_capacity must be a power of two");
        }
        if self.default_combiner_handoff < 4 {
            return Err("default_combiner_handoff must be at least 4");
        }
        if self.default_stack_pages == 0 {
            return Err("default_stack_pages must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(DomainConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let mut config = DomainConfig::default();
        config.async_inbox_capacity = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_small_handoff() {
        let mut config = DomainConfig::default();
        config.default_combiner_handoff = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn restart_policy_backoff_grows_and_caps() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn no_initial_delay_means_zero() {
        let policy = RestartPolicy {
            initial_delay: None,
            ..RestartPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::ZERO);
    }
}
