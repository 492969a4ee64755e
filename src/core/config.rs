//! # Container configuration.
//!
//! Provides [`ContainerConfig`], the settings of a [`ServiceContainer`](crate::ServiceContainer).
//!
//! ## Sentinel values
//! - `max_concurrent = 0` → unlimited (no semaphore created)
//! - `shutdown_grace = 0s` → `shutdown` waits without a limit

use std::time::Duration;

/// Configuration for a service container.
///
/// ## Field semantics
/// - `max_concurrent`: cap on concurrently running task callbacks (`0` = unlimited)
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `shutdown_grace`: how long `shutdown` waits for every service to settle
///
/// ## Notes
/// All fields are public. Prefer the helper accessors to avoid sprinkling
/// sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Maximum number of task callbacks running at once, across all transactions.
    ///
    /// - `0` = unlimited (no semaphore)
    /// - `n > 0` = at most `n` callbacks run simultaneously
    pub max_concurrent: usize,

    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// Subscribers lagging more than `bus_capacity` events behind skip older items.
    pub bus_capacity: usize,

    /// Maximum time `shutdown` waits for removal to finish.
    pub shutdown_grace: Duration,
}

impl ContainerConfig {
    /// Returns the concurrency limit as an `Option`.
    ///
    /// - `None` → unlimited (no semaphore)
    /// - `Some(n)` → at most `n` concurrent callbacks
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent == 0 {
            None
        } else {
            Some(self.max_concurrent)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns the shutdown grace period, `None` meaning no limit.
    #[inline]
    pub fn grace(&self) -> Option<Duration> {
        if self.shutdown_grace == Duration::ZERO {
            None
        } else {
            Some(self.shutdown_grace)
        }
    }
}

impl Default for ContainerConfig {
    /// Default configuration:
    ///
    /// - `max_concurrent = 0` (unlimited)
    /// - `bus_capacity = 1024`
    /// - `shutdown_grace = 30s`
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            bus_capacity: 1024,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
