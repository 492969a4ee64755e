//! Error types used by the container, the transaction engine and services.
//!
//! - [`ContainerError`]: structural errors raised synchronously by the service API
//!   (duplicate names, cycles, builder misuse, lookups).
//! - [`TransactionError`]: misuse of the transaction engine and prepare/commit outcomes.
//! - [`StartError`]: a service failed to start (lifecycle error).
//! - [`TaskError`]: a task's execute callback failed (engine error).
//!
//! Every enum provides `as_label` for logs/metrics.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::service::ServiceName;
use crate::txn::{Phase, ProblemReport};

/// # Structural errors of the service API.
///
/// These reject the offending call and leave the service graph unchanged.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ContainerError {
    /// A live service (or a pending install in the same transaction) already uses this name.
    #[error("duplicate service name: {name}")]
    DuplicateService {
        /// The conflicting name.
        name: ServiceName,
    },

    /// Installing the service would close a cycle over required/parent dependencies.
    #[error("circular dependency while installing {name}: {}", render_cycle(cycle))]
    CircularDependency {
        /// The service being installed.
        name: ServiceName,
        /// The cycle, starting and ending at `name`.
        cycle: Vec<ServiceName>,
    },

    /// No service is installed under this name.
    #[error("service not found: {name}")]
    ServiceNotFound {
        /// The requested name.
        name: ServiceName,
    },

    /// The API was used in a way its current state does not allow.
    #[error("illegal state: {reason}")]
    IllegalState {
        /// What went wrong.
        reason: String,
    },

    /// A mutation came from a thread other than the transaction owner.
    #[error("concurrent modification: transaction is owned by another thread")]
    ConcurrentModification,

    /// A service name could not be parsed.
    #[error("invalid service name {input:?}: {reason}")]
    InvalidName {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Monitored services did not settle within the given time.
    #[error("stability not reached within {timeout:?}; unstable: {}", render_names(unstable))]
    StabilityTimeout {
        /// The configured wait.
        timeout: Duration,
        /// Services still in transition.
        unstable: Vec<ServiceName>,
    },

    /// Container shutdown did not finish within its grace period.
    #[error("shutdown exceeded grace period {grace:?}")]
    ShutdownTimeout {
        /// The configured grace period.
        grace: Duration,
    },

    /// The underlying transaction rejected the operation.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl ContainerError {
    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        ContainerError::IllegalState {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use svcgraph::{ContainerError, ServiceName};
    ///
    /// let err = ContainerError::ServiceNotFound { name: ServiceName::of("db") };
    /// assert_eq!(err.as_label(), "service_not_found");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ContainerError::DuplicateService { .. } => "duplicate_service",
            ContainerError::CircularDependency { .. } => "circular_dependency",
            ContainerError::ServiceNotFound { .. } => "service_not_found",
            ContainerError::IllegalState { .. } => "illegal_state",
            ContainerError::ConcurrentModification => "concurrent_modification",
            ContainerError::InvalidName { .. } => "invalid_name",
            ContainerError::StabilityTimeout { .. } => "stability_timeout",
            ContainerError::ShutdownTimeout { .. } => "shutdown_timeout",
            ContainerError::Transaction(e) => e.as_label(),
        }
    }
}

/// # Errors produced by the transaction engine.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    /// The operation is not allowed in the transaction's current phase.
    #[error("cannot {op} in phase {phase}")]
    InvalidState {
        /// The rejected operation.
        op: &'static str,
        /// The phase the transaction was in.
        phase: Phase,
    },

    /// A mutation came from a thread other than the one that created the transaction.
    #[error("concurrent modification: transaction is owned by another thread")]
    ConcurrentModification,

    /// A task dependency belongs to a different transaction.
    #[error("task dependency belongs to another transaction")]
    ForeignTask,

    /// Validation reported an error; the transaction can only be rolled back.
    #[error("prepare failed: {report}")]
    PrepareFailed {
        /// Every problem recorded so far.
        report: ProblemReport,
    },

    /// The transaction is prepared but carries a critical problem.
    #[error("cannot commit: {report}")]
    CannotCommit {
        /// Every problem recorded so far.
        report: ProblemReport,
    },

    /// The container was shut down; no new transactions are accepted.
    #[error("container is shut down")]
    ContainerShutdown,
}

impl TransactionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransactionError::InvalidState { .. } => "txn_invalid_state",
            TransactionError::ConcurrentModification => "txn_concurrent_modification",
            TransactionError::ForeignTask => "txn_foreign_task",
            TransactionError::PrepareFailed { .. } => "txn_prepare_failed",
            TransactionError::CannotCommit { .. } => "txn_cannot_commit",
            TransactionError::ContainerShutdown => "txn_container_shutdown",
        }
    }
}

/// # A service failed to start.
///
/// Returned by [`Service::start`](crate::Service::start). The controller records it
/// as an ERROR problem on the owning transaction and enters `START_FAILED`.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct StartError {
    message: String,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl StartError {
    /// Creates a start error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Creates a start error wrapping an underlying cause.
    pub fn with_cause<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying cause, if any.
    pub fn cause(&self) -> Option<&Arc<dyn std::error::Error + Send + Sync>> {
        self.cause.as_ref()
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        "service_start_failed"
    }
}

/// # Errors produced by task execution.
///
/// A failed task does not stop independent tasks; its dependents are cancelled.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// Execution failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// The task gave up because rollback was requested.
    #[error("context cancelled")]
    Canceled,
}

impl TaskError {
    /// Convenience constructor for [`TaskError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        TaskError::Fail {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use svcgraph::TaskError;
    ///
    /// assert_eq!(TaskError::fail("boom").as_label(), "task_failed");
    /// assert_eq!(TaskError::Canceled.as_label(), "task_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fail { .. } => "task_failed",
            TaskError::Canceled => "task_canceled",
        }
    }
}

fn render_cycle(cycle: &[ServiceName]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_names(names: &[ServiceName]) -> String {
    format!(
        "[{}]",
        names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    )
}
