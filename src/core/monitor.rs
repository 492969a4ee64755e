//! # Stability monitor.
//!
//! Tracks how many of its controllers are not yet settled. Controllers adjust the
//! counter under their own lock whenever they enter or leave a stable state, so a
//! waiter released at zero never observes a controller mid-transition.
//!
//! ```text
//! ServiceController::with_inner ──► note_stability() ──► MonitorShared::adjust(±1)
//!                                                            │ watch::Sender<usize>
//! await_stability() ◄── wait_for(n == 0) ────────────────────┘
//! ```
//!
//! Stable means DOWN, UP, START_FAILED, REMOVED or CANCELLED with no task in flight.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ContainerError;
use crate::service::{Mode, ServiceName, State};

use super::controller::ServiceController;

pub(crate) struct MonitorShared {
    unstable: watch::Sender<usize>,
    controllers: Mutex<Vec<Weak<ServiceController>>>,
}

impl MonitorShared {
    /// Called under the controller lock.
    pub(crate) fn adjust(&self, became_stable: bool) {
        self.unstable.send_modify(|n| {
            if became_stable {
                *n = n.saturating_sub(1);
            } else {
                *n += 1;
            }
        });
    }

    fn live(&self) -> Vec<Arc<ServiceController>> {
        let mut controllers = self.controllers.lock();
        controllers.retain(|w| w.strong_count() > 0);
        controllers.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Outcome of a stability wait.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StabilityReport {
    /// Services in START_FAILED.
    pub failed: Vec<ServiceName>,
    /// Services with a required dependency nobody provides.
    pub missing_dependencies: Vec<ServiceName>,
}

impl StabilityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing_dependencies.is_empty()
    }
}

/// Snapshot of the monitored set.
#[derive(Clone, Debug, Default)]
pub struct StabilityStatistics {
    pub total: usize,
    pub unstable: usize,
    pub by_mode: HashMap<Mode, usize>,
    pub by_state: HashMap<State, usize>,
}

impl StabilityStatistics {
    pub fn in_state(&self, state: State) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn in_mode(&self, mode: Mode) -> usize {
        self.by_mode.get(&mode).copied().unwrap_or(0)
    }
}

/// Waits for a set of controllers to settle.
///
/// # Example
/// ```no_run
/// # async fn demo(container: std::sync::Arc<svcgraph::ServiceContainer>) -> Result<(), svcgraph::ContainerError> {
/// use svcgraph::StabilityMonitor;
///
/// let monitor = StabilityMonitor::new();
/// let txn = container.begin().await?;
/// let mut target = container.registry().target(&txn);
/// target.add_monitor(&monitor)?;
/// // ... install services ...
/// txn.prepare().await?;
/// txn.commit().await?;
/// let report = monitor.await_stability().await;
/// assert!(report.is_clean());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StabilityMonitor {
    shared: Arc<MonitorShared>,
}

impl StabilityMonitor {
    pub fn new() -> Self {
        let (unstable, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(MonitorShared {
                unstable,
                controllers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts tracking `controller`; adding it twice is a no-op.
    pub fn add_controller(&self, controller: &Arc<ServiceController>) {
        if controller.attach_monitor(&self.shared) {
            self.shared.controllers.lock().push(Arc::downgrade(controller));
        }
    }

    pub fn remove_controller(&self, controller: &Arc<ServiceController>) {
        if controller.detach_monitor(&self.shared) {
            self.shared
                .controllers
                .lock()
                .retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(controller)));
        }
    }

    /// Number of tracked controllers not yet stable.
    pub fn unstable_count(&self) -> usize {
        *self.shared.unstable.borrow()
    }

    /// Waits until every tracked controller is stable.
    pub async fn await_stability(&self) -> StabilityReport {
        let mut rx = self.shared.unstable.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        self.report()
    }

    /// Same as [`await_stability`](Self::await_stability), bounded by `timeout`.
    pub async fn await_stability_timeout(
        &self,
        timeout: Duration,
    ) -> Result<StabilityReport, ContainerError> {
        match tokio::time::timeout(timeout, self.await_stability()).await {
            Ok(report) => Ok(report),
            Err(_) => {
                let mut unstable: Vec<ServiceName> = self
                    .shared
                    .live()
                    .iter()
                    .filter(|c| !c.is_stable())
                    .map(|c| c.name().clone())
                    .collect();
                unstable.sort();
                Err(ContainerError::StabilityTimeout { timeout, unstable })
            }
        }
    }

    pub fn statistics(&self) -> StabilityStatistics {
        let mut stats = StabilityStatistics::default();
        for c in self.shared.live() {
            stats.total += 1;
            if !c.is_stable() {
                stats.unstable += 1;
            }
            *stats.by_mode.entry(c.mode()).or_default() += 1;
            *stats.by_state.entry(c.state()).or_default() += 1;
        }
        stats
    }

    fn report(&self) -> StabilityReport {
        let mut report = StabilityReport::default();
        for c in self.shared.live() {
            if c.state() == State::StartFailed {
                report.failed.push(c.name().clone());
            }
            if !c.state().is_gone() && !c.unavailable_dependencies().is_empty() {
                report.missing_dependencies.push(c.name().clone());
            }
        }
        report.failed.sort();
        report.missing_dependencies.sort();
        report
    }
}

impl Default for StabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
