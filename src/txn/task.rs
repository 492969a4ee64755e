//! # Executable units of a transaction.
//!
//! An [`Executable`] is submitted to a [`Transaction`] together with the tasks it
//! depends on. The transaction drives it through up to four callbacks:
//!
//! ```text
//! execute ──► validate ──► commit          (prepare + commit)
//!    │            │
//!    └────────────┴──────► rollback        (only when execute ran)
//!
//! never executed ───────► cancelled        (dependency failed / rollback first)
//! ```
//!
//! [`TaskController`] is the handle returned on submission. It exposes the task's
//! [`TaskStatus`] and its published result, and is used as a dependency when
//! submitting further tasks.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TransactionError};

use super::problem::Problem;
use super::transaction::{Transaction, TransactionId, TxnShared};

/// # A unit of work inside a transaction.
///
/// Only [`execute`](Executable::execute) is mandatory. `rollback` must undo whatever
/// `execute` did; it is called only for tasks whose execute ran, in reverse
/// dependency order.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use svcgraph::{Executable, ExecuteContext, TaskError, Transaction};
///
/// struct CreateDir;
///
/// #[async_trait]
/// impl Executable for CreateDir {
///     async fn execute(&self, _ctx: &ExecuteContext) -> Result<(), TaskError> {
///         // mkdir ...
///         Ok(())
///     }
///
///     async fn rollback(&self, _txn: &Transaction) {
///         // rmdir ...
///     }
/// }
/// ```
#[async_trait]
pub trait Executable: Send + Sync + 'static {
    /// Performs the work. A failure cancels every dependent task.
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError>;

    /// Checks the outcome after all execution finished; may report problems.
    async fn validate(&self, ctx: &ValidateContext) {
        let _ = ctx;
    }

    /// Makes the work permanent. Runs in dependency order.
    async fn commit(&self, txn: &Transaction) {
        let _ = txn;
    }

    /// Undoes the work. Runs in reverse dependency order.
    async fn rollback(&self, txn: &Transaction) {
        let _ = txn;
    }

    /// Called instead of everything else when the task will never execute.
    fn cancelled(&self) {}
}

/// Shared handle to an executable.
pub type ExecutableRef = Arc<dyn Executable>;

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for dependencies (or for `prepare`).
    Pending,
    /// Handed to the runtime; `execute` is queued or running.
    Running,
    Succeeded,
    Failed,
    /// Will never execute.
    Cancelled,
}

impl TaskStatus {
    /// True once the task can no longer change status during execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Handle to a submitted task.
///
/// Holds the transaction weakly; once the transaction is gone, status and result
/// queries return `None`.
#[derive(Clone)]
pub struct TaskController {
    pub(crate) txn: Weak<TxnShared>,
    pub(crate) txn_id: TransactionId,
    pub(crate) index: usize,
    pub(crate) name: Arc<str>,
}

impl TaskController {
    /// Position of the task in its transaction, in submission order.
    pub fn id(&self) -> usize {
        self.index
    }

    /// Name given at submission.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transaction that owns this task.
    pub fn transaction_id(&self) -> TransactionId {
        self.txn_id
    }

    /// Current status, `None` if the transaction was dropped.
    pub fn status(&self) -> Option<TaskStatus> {
        self.txn.upgrade().map(|t| t.task_status(self.index))
    }

    /// Value published by the task through [`ExecuteContext::set_result`].
    ///
    /// `None` if nothing was published, the type does not match, or the transaction is gone.
    pub fn result<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let shared = self.txn.upgrade()?;
        shared.task_result(self.index)?.downcast::<T>().ok()
    }

    pub(crate) fn same_task(&self, other: &TaskController) -> bool {
        self.txn_id == other.txn_id && self.index == other.index
    }
}

impl fmt::Debug for TaskController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskController")
            .field("txn", &self.txn_id)
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

/// Context passed to [`Executable::execute`].
///
/// Tasks may submit child tasks and report problems from any thread; the owner
/// thread check applies only to mutations made directly on the [`Transaction`].
#[derive(Clone)]
pub struct ExecuteContext {
    txn: Transaction,
    task: TaskController,
}

impl ExecuteContext {
    pub(crate) fn new(txn: Transaction, task: TaskController) -> Self {
        Self { txn, task }
    }

    /// The owning transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// The running task.
    pub fn task(&self) -> &TaskController {
        &self.task
    }

    /// Submits a follow-up task in the same transaction.
    pub fn new_task<E: Executable>(
        &self,
        name: impl Into<Arc<str>>,
        exec: E,
        deps: &[TaskController],
    ) -> Result<TaskController, TransactionError> {
        self.txn.submit(name.into(), Arc::new(exec), deps, false)
    }

    /// Same as [`new_task`](Self::new_task) for an already shared executable.
    pub fn new_task_ref(
        &self,
        name: impl Into<Arc<str>>,
        exec: ExecutableRef,
        deps: &[TaskController],
    ) -> Result<TaskController, TransactionError> {
        self.txn.submit(name.into(), exec, deps, false)
    }

    /// Records a problem on the transaction.
    pub fn add_problem(&self, problem: Problem) {
        self.txn.record_problem(problem);
    }

    /// Publishes a value readable through [`TaskController::result`].
    pub fn set_result<T: Any + Send + Sync>(&self, value: T) {
        self.txn.set_task_result(self.task.index, Arc::new(value));
    }

    /// Cancelled as soon as rollback is requested.
    pub fn cancellation(&self) -> CancellationToken {
        self.txn.cancellation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.txn.cancellation().is_cancelled()
    }
}

/// Context passed to [`Executable::validate`].
pub struct ValidateContext {
    txn: Transaction,
    task: TaskController,
}

impl ValidateContext {
    pub(crate) fn new(txn: Transaction, task: TaskController) -> Self {
        Self { txn, task }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    pub fn task(&self) -> &TaskController {
        &self.task
    }

    /// Records a problem; an ERROR or worse fails `prepare`.
    pub fn add_problem(&self, problem: Problem) {
        self.txn.record_problem(problem);
    }
}

/// # Function-backed executable (`TaskFn`)
///
/// Wraps a closure `F: Fn(ExecuteContext) -> Fut`, producing a fresh future per
/// execution. Validate, commit and rollback are no-ops.
///
/// ## Example
/// ```rust
/// use svcgraph::{ExecuteContext, TaskError, TaskFn};
///
/// let task = TaskFn::new(|ctx: ExecuteContext| async move {
///     ctx.set_result(42u32);
///     Ok::<_, TaskError>(())
/// });
/// # let _ = task;
/// ```
pub struct TaskFn<F> {
    f: F,
}

impl<F> TaskFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Executable for TaskFn<F>
where
    F: Fn(ExecuteContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        (self.f)(ctx.clone()).await
    }
}
