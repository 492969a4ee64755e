//! # Events emitted by the container, its controllers and the transaction engine.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Service events**: install, state transitions, dependency failures, removal
//! - **Transaction events**: task failures, problems, prepare/commit/rollback outcomes
//! - **Subscriber events**: overflow and panics in subscriber workers
//!
//! The [`Event`] struct carries metadata such as timestamps, the service name,
//! transaction id, state transition and reason.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Events about one controller are published in the order its transitions happened.
//!
//! ## Example
//! ```rust
//! use svcgraph::{Event, EventKind, State};
//!
//! let ev = Event::new(EventKind::ServiceTransition)
//!     .with_service("db")
//!     .with_transition(State::Starting, State::Up);
//!
//! assert_eq!(ev.kind, EventKind::ServiceTransition);
//! assert_eq!(ev.service.as_deref(), Some("db"));
//! assert_eq!(ev.to, Some(State::Up));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::service::State;
use crate::txn::{Severity, TransactionId};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of container events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `task`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `task`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Service events ===
    /// A controller was wired into its registry (install task executed).
    ///
    /// Sets:
    /// - `service`, `txn`
    ServiceInstalled,

    /// A controller changed state.
    ///
    /// Sets:
    /// - `service`, `txn`
    /// - `from`, `to`: the transition
    ServiceTransition,

    /// A service failed to start.
    ///
    /// Sets:
    /// - `service`, `txn`
    /// - `reason`: start error message
    StartFailed,

    /// A required dependency entered a failed state (first failure of an episode).
    ///
    /// Sets:
    /// - `service`, `txn`
    DependencyFailed,

    /// The last failed required dependency recovered.
    ///
    /// Sets:
    /// - `service`, `txn`
    DependencyFailureCleared,

    /// A removal was committed; the controller is gone from the registry.
    ///
    /// Sets:
    /// - `service`, `txn`
    ServiceRemoved,

    /// An install was rolled back before it was committed.
    ///
    /// Sets:
    /// - `service`, `txn`
    ServiceCancelled,

    // === Transaction events ===
    /// A task's execute callback failed or panicked.
    ///
    /// Sets:
    /// - `task`: task name
    /// - `txn`
    /// - `reason`: failure message
    TaskFailed,

    /// A problem was recorded on a transaction.
    ///
    /// Sets:
    /// - `txn`, `severity`, `reason`
    /// - `service` or `task` when the problem has a subject
    ProblemReported,

    /// Prepare finished (successfully or not).
    ///
    /// Sets:
    /// - `txn`
    /// - `reason`: `"prepared"` or `"prepare_failed"`
    TransactionPrepared,

    /// Commit finished.
    ///
    /// Sets:
    /// - `txn`
    TransactionCommitted,

    /// Rollback finished.
    ///
    /// Sets:
    /// - `txn`
    TransactionRolledBack,
}

impl EventKind {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::SubscriberPanicked => "subscriber_panicked",
            EventKind::SubscriberOverflow => "subscriber_overflow",
            EventKind::ServiceInstalled => "service_installed",
            EventKind::ServiceTransition => "service_transition",
            EventKind::StartFailed => "start_failed",
            EventKind::DependencyFailed => "dependency_failed",
            EventKind::DependencyFailureCleared => "dependency_failure_cleared",
            EventKind::ServiceRemoved => "service_removed",
            EventKind::ServiceCancelled => "service_cancelled",
            EventKind::TaskFailed => "task_failed",
            EventKind::ProblemReported => "problem_reported",
            EventKind::TransactionPrepared => "transaction_prepared",
            EventKind::TransactionCommitted => "transaction_committed",
            EventKind::TransactionRolledBack => "transaction_rolled_back",
        }
    }
}

/// Container event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Canonical name of the service, if applicable.
    pub service: Option<Arc<str>>,
    /// Name of the task or subscriber, if applicable.
    pub task: Option<Arc<str>>,
    /// Transaction the event belongs to.
    pub txn: Option<TransactionId>,
    /// Previous controller state.
    pub from: Option<State>,
    /// New controller state.
    pub to: Option<State>,
    /// Problem severity.
    pub severity: Option<Severity>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            service: None,
            task: None,
            txn: None,
            from: None,
            to: None,
            severity: None,
            reason: None,
        }
    }

    /// Attaches a service name.
    #[inline]
    pub fn with_service(mut self, service: impl Into<Arc<str>>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Attaches a task or subscriber name.
    #[inline]
    pub fn with_task(mut self, task: impl Into<Arc<str>>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Attaches the owning transaction.
    #[inline]
    pub fn with_txn(mut self, txn: TransactionId) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Attaches a state transition.
    #[inline]
    pub fn with_transition(mut self, from: State, to: State) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Attaches a problem severity.
    #[inline]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_task(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_task(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::TransactionCommitted);
        let b = Event::new(EventKind::TransactionCommitted);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn overflow_event_names_the_subscriber() {
        let ev = Event::subscriber_overflow("log", "full");
        assert!(ev.is_subscriber_overflow());
        assert!(!ev.is_subscriber_panic());
        assert_eq!(ev.task.as_deref(), Some("log"));
        assert_eq!(ev.reason.as_deref(), Some("subscriber=log reason=full"));
    }
}
