//! # Transaction: a DAG of tasks driven through prepare, commit and rollback.
//!
//! ```text
//!  CREATED ──prepare──► EXECUTING ──► VALIDATING ──► PREPARED ──commit──► COMMITTING ──► COMMITTED
//!     │                     │              │             │
//!     │                     │              └─► PREPARE_FAILED
//!     │                     │                        │
//!     └─────────────────────┴──────rollback──────────┴──► ROLLING_BACK ──► ROLLED_BACK
//! ```
//!
//! ## Rules
//! - A task is submitted to the runtime the instant its last dependency succeeds
//!   (parallel Kahn walk). A failed or cancelled dependency cancels the dependent.
//! - Execute failures become problems (`ERROR` for `Err`, `CRITICAL` for panics).
//! - `prepare` fails when validation reports an `ERROR` or worse.
//! - `commit` is refused while a `CRITICAL` problem is recorded.
//! - Rollback never runs a task's rollback before the rollbacks of its dependents.
//! - Mutations through this handle must come from the thread that created it;
//!   tasks submit follow-ups through their [`ExecuteContext`] instead.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::TransactionError;
use crate::events::{Bus, Event, EventKind};
use crate::subscribers::panic_message;

use super::problem::{Problem, ProblemReport, Severity};
use super::scheduler::{self, WalkKind, WalkNode};
use super::task::{ExecutableRef, ExecuteContext, TaskController, TaskStatus, ValidateContext};

/// Identifier of a transaction, unique within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Transaction phase. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Created,
    Executing,
    Validating,
    Prepared,
    PrepareFailed,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl Phase {
    /// Returns a short stable label for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Phase::Created => "CREATED",
            Phase::Executing => "EXECUTING",
            Phase::Validating => "VALIDATING",
            Phase::Prepared => "PREPARED",
            Phase::PrepareFailed => "PREPARE_FAILED",
            Phase::Committing => "COMMITTING",
            Phase::Committed => "COMMITTED",
            Phase::RollingBack => "ROLLING_BACK",
            Phase::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Committed | Phase::RolledBack)
    }

    /// True while new tasks may still be submitted.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Phase::Created | Phase::Executing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Everything a transaction borrows from its container.
pub(crate) struct TxnSettings {
    pub(crate) id: TransactionId,
    pub(crate) bus: Bus,
    pub(crate) limit: Option<Arc<Semaphore>>,
    pub(crate) gate: Option<OwnedSemaphorePermit>,
}

struct TaskNode {
    name: Arc<str>,
    exec: ExecutableRef,
    deps: Vec<usize>,
    dependents: Vec<usize>,
    waiting: usize,
    status: TaskStatus,
    executed: bool,
    result: Option<Arc<dyn Any + Send + Sync>>,
}

struct TxnState {
    phase: Phase,
    nodes: Vec<TaskNode>,
    problems: Vec<Problem>,
    unfinished: usize,
}

enum Outcome {
    Succeeded,
    Failed(String),
    Panicked(String),
    Cancelled,
}

pub(crate) struct TxnShared {
    id: TransactionId,
    owner: ThreadId,
    bus: Bus,
    limit: Option<Arc<Semaphore>>,
    handle: Handle,
    token: CancellationToken,
    state: Mutex<TxnState>,
    idle: watch::Sender<usize>,
    gate: Mutex<Option<OwnedSemaphorePermit>>,
}

impl TxnShared {
    pub(crate) fn task_status(&self, index: usize) -> TaskStatus {
        self.state
            .lock()
            .nodes
            .get(index)
            .map(|n| n.status)
            .unwrap_or(TaskStatus::Cancelled)
    }

    pub(crate) fn task_result(&self, index: usize) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state.lock().nodes.get(index)?.result.clone()
    }

    fn controller(self: &Arc<Self>, index: usize, name: Arc<str>) -> TaskController {
        TaskController {
            txn: Arc::downgrade(self),
            txn_id: self.id,
            index,
            name,
        }
    }

    fn spawn(self: &Arc<Self>, index: usize) {
        let shared = Arc::clone(self);
        self.handle.spawn(async move {
            shared.run_task(index).await;
        });
    }

    async fn run_task(self: Arc<Self>, index: usize) {
        let _permit = match &self.limit {
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };

        let started = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.phase == Phase::RollingBack {
                None
            } else {
                let node = &st.nodes[index];
                Some((Arc::clone(&node.exec), Arc::clone(&node.name)))
            }
        };
        let Some((exec, name)) = started else {
            self.finish(index, Outcome::Cancelled);
            return;
        };

        tracing::trace!(txn = %self.id, task = %name, "executing");
        let ctx = ExecuteContext::new(
            Transaction {
                shared: Arc::clone(&self),
            },
            self.controller(index, name),
        );
        let res = AssertUnwindSafe(exec.execute(&ctx)).catch_unwind().await;
        drop(ctx);

        let outcome = match res {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(panic) => Outcome::Panicked(panic_message(&*panic)),
        };
        self.finish(index, outcome);
    }

    /// Records the outcome, releases or cancels dependents and updates the idle count.
    fn finish(self: &Arc<Self>, index: usize, outcome: Outcome) {
        let mut cancelled: Vec<ExecutableRef> = Vec::new();
        let mut ready = Vec::new();
        let mut failure: Option<(Arc<str>, Problem)> = None;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let halted = st.phase == Phase::RollingBack;
            st.unfinished = st.unfinished.saturating_sub(1);

            let name = Arc::clone(&st.nodes[index].name);
            let dependents = st.nodes[index].dependents.clone();
            match outcome {
                Outcome::Succeeded => {
                    let node = &mut st.nodes[index];
                    node.status = TaskStatus::Succeeded;
                    node.executed = true;
                    for d in dependents {
                        let dn = &mut st.nodes[d];
                        if dn.status != TaskStatus::Pending {
                            continue;
                        }
                        dn.waiting = dn.waiting.saturating_sub(1);
                        if dn.waiting == 0 {
                            if halted {
                                cancel_cascade(st, d, &mut cancelled);
                            } else {
                                dn.status = TaskStatus::Running;
                                ready.push(d);
                            }
                        }
                    }
                }
                Outcome::Failed(msg) => {
                    let problem = Problem::error(msg).with_subject(Arc::clone(&name));
                    record_failure(st, index, &problem, &mut cancelled);
                    failure = Some((name, problem));
                }
                Outcome::Panicked(info) => {
                    let problem = Problem::critical(format!("execute panicked: {info}"))
                        .with_subject(Arc::clone(&name));
                    record_failure(st, index, &problem, &mut cancelled);
                    failure = Some((name, problem));
                }
                Outcome::Cancelled => {
                    let node = &mut st.nodes[index];
                    node.status = TaskStatus::Cancelled;
                    cancelled.push(Arc::clone(&node.exec));
                    for d in dependents {
                        cancel_cascade(st, d, &mut cancelled);
                    }
                }
            }
            self.idle.send_replace(st.unfinished);
        }

        if let Some((task, problem)) = failure {
            tracing::debug!(txn = %self.id, task = %task, %problem, "task failed");
            self.bus.publish(
                Event::new(EventKind::TaskFailed)
                    .with_task(task)
                    .with_txn(self.id)
                    .with_reason(problem.message()),
            );
            self.publish_problem(&problem);
        }
        for exec in cancelled {
            notify_cancelled(&exec);
        }
        for r in ready {
            self.spawn(r);
        }
    }

    fn publish_problem(&self, problem: &Problem) {
        let mut ev = Event::new(EventKind::ProblemReported)
            .with_txn(self.id)
            .with_severity(problem.severity())
            .with_reason(problem.message());
        if let Some(subject) = problem.subject() {
            ev = ev.with_service(subject);
        }
        self.bus.publish(ev);
    }

    fn release_gate(&self) {
        self.gate.lock().take();
    }
}

impl Drop for TxnShared {
    fn drop(&mut self) {
        let phase = self.state.get_mut().phase;
        if !phase.is_terminal() && phase != Phase::Created {
            tracing::warn!(txn = %self.id, %phase, "transaction dropped before commit or rollback");
        }
    }
}

fn record_failure(
    st: &mut TxnState,
    index: usize,
    problem: &Problem,
    cancelled: &mut Vec<ExecutableRef>,
) {
    let node = &mut st.nodes[index];
    node.status = TaskStatus::Failed;
    node.executed = true;
    let dependents = node.dependents.clone();
    st.problems.push(problem.clone());
    for d in dependents {
        cancel_cascade(st, d, cancelled);
    }
}

/// Cancels a pending task and, transitively, every pending task depending on it.
fn cancel_cascade(st: &mut TxnState, index: usize, out: &mut Vec<ExecutableRef>) {
    let mut stack = vec![index];
    while let Some(i) = stack.pop() {
        let node = &mut st.nodes[i];
        if node.status != TaskStatus::Pending {
            continue;
        }
        node.status = TaskStatus::Cancelled;
        out.push(Arc::clone(&node.exec));
        stack.extend(node.dependents.iter().copied());
        st.unfinished = st.unfinished.saturating_sub(1);
    }
}

fn notify_cancelled(exec: &ExecutableRef) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| exec.cancelled())) {
        tracing::error!(info = %panic_message(&*panic), "cancelled callback panicked");
    }
}

/// Handle to a transaction. Cheap to clone.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) shared: Arc<TxnShared>,
}

impl Transaction {
    /// Creates a transaction owned by the calling thread.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(settings: TxnSettings) -> Self {
        let (idle, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(TxnShared {
                id: settings.id,
                owner: thread::current().id(),
                bus: settings.bus,
                limit: settings.limit,
                handle: Handle::current(),
                token: CancellationToken::new(),
                state: Mutex::new(TxnState {
                    phase: Phase::Created,
                    nodes: Vec::new(),
                    problems: Vec::new(),
                    unfinished: 0,
                }),
                idle,
                gate: Mutex::new(settings.gate),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Snapshot of every problem recorded so far.
    pub fn problem_report(&self) -> ProblemReport {
        ProblemReport::new(self.shared.state.lock().problems.clone())
    }

    /// True only in `PREPARED` without a `CRITICAL` problem.
    pub fn can_commit(&self) -> bool {
        let st = self.shared.state.lock();
        st.phase == Phase::Prepared
            && !st.problems.iter().any(|p| p.severity() >= Severity::Critical)
    }

    /// Cancelled as soon as rollback is requested.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Submits a task depending on `deps`.
    ///
    /// Fails with `ConcurrentModification` off the owner thread, `ForeignTask` if a
    /// dependency belongs to another transaction and `InvalidState` once execution
    /// is over.
    pub fn new_task<E: super::Executable>(
        &self,
        name: impl Into<Arc<str>>,
        exec: E,
        deps: &[TaskController],
    ) -> Result<TaskController, TransactionError> {
        self.submit(name.into(), Arc::new(exec), deps, true)
    }

    /// Same as [`new_task`](Self::new_task) for an already shared executable.
    pub fn new_task_ref(
        &self,
        name: impl Into<Arc<str>>,
        exec: ExecutableRef,
        deps: &[TaskController],
    ) -> Result<TaskController, TransactionError> {
        self.submit(name.into(), exec, deps, true)
    }

    /// Runs every task, then validation.
    ///
    /// Returns once all tasks (including follow-ups submitted while executing) are
    /// finished and validated. On `PrepareFailed` only [`rollback`](Self::rollback)
    /// remains possible.
    pub async fn prepare(&self) -> Result<(), TransactionError> {
        let ready: Vec<usize> = {
            let mut st = self.shared.state.lock();
            if st.phase != Phase::Created {
                return Err(TransactionError::InvalidState {
                    op: "prepare",
                    phase: st.phase,
                });
            }
            st.phase = Phase::Executing;
            let mut ready = Vec::new();
            for (i, node) in st.nodes.iter_mut().enumerate() {
                if node.status == TaskStatus::Pending && node.waiting == 0 {
                    node.status = TaskStatus::Running;
                    ready.push(i);
                }
            }
            ready
        };
        tracing::debug!(txn = %self.id(), tasks = ready.len(), "prepare");
        for index in ready {
            self.shared.spawn(index);
        }
        self.wait_idle().await;

        let (executed, first_new) = {
            let mut st = self.shared.state.lock();
            if st.phase != Phase::Executing {
                return Err(TransactionError::InvalidState {
                    op: "prepare",
                    phase: st.phase,
                });
            }
            st.phase = Phase::Validating;
            let executed: Vec<(usize, ExecutableRef, Arc<str>)> = st
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.executed)
                .map(|(i, n)| (i, Arc::clone(&n.exec), Arc::clone(&n.name)))
                .collect();
            (executed, st.problems.len())
        };

        let mut validations = JoinSet::new();
        for (index, exec, name) in executed {
            let ctx = ValidateContext::new(self.clone(), self.shared.controller(index, name));
            validations.spawn(async move {
                if let Err(panic) = AssertUnwindSafe(exec.validate(&ctx)).catch_unwind().await {
                    ctx.add_problem(
                        Problem::critical(format!("validate panicked: {}", panic_message(&*panic)))
                            .with_subject(ctx.task().name()),
                    );
                }
            });
        }
        while validations.join_next().await.is_some() {}

        let outcome = {
            let mut st = self.shared.state.lock();
            if st.phase != Phase::Validating {
                return Err(TransactionError::InvalidState {
                    op: "prepare",
                    phase: st.phase,
                });
            }
            let failed = st.problems[first_new..]
                .iter()
                .any(|p| p.severity() >= Severity::Error);
            if failed {
                st.phase = Phase::PrepareFailed;
                Err(TransactionError::PrepareFailed {
                    report: ProblemReport::new(st.problems.clone()),
                })
            } else {
                st.phase = Phase::Prepared;
                Ok(())
            }
        };
        self.shared.bus.publish(
            Event::new(EventKind::TransactionPrepared)
                .with_txn(self.id())
                .with_reason(if outcome.is_ok() {
                    "prepared"
                } else {
                    "prepare_failed"
                }),
        );
        outcome
    }

    /// Runs commit callbacks in dependency order and finishes the transaction.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        let plan = {
            let mut st = self.shared.state.lock();
            if st.phase != Phase::Prepared {
                return Err(TransactionError::InvalidState {
                    op: "commit",
                    phase: st.phase,
                });
            }
            if st
                .problems
                .iter()
                .any(|p| p.severity() >= Severity::Critical)
            {
                return Err(TransactionError::CannotCommit {
                    report: ProblemReport::new(st.problems.clone()),
                });
            }
            st.phase = Phase::Committing;
            commit_plan(&st.nodes)
        };

        scheduler::walk(self, plan, WalkKind::Commit).await;

        self.shared.state.lock().phase = Phase::Committed;
        self.shared.release_gate();
        tracing::debug!(txn = %self.id(), "committed");
        self.shared
            .bus
            .publish(Event::new(EventKind::TransactionCommitted).with_txn(self.id()));
        Ok(())
    }

    /// Cancels pending work, waits for running tasks and undoes every executed task.
    ///
    /// Allowed from any thread in every non-terminal phase except `COMMITTING`.
    pub async fn rollback(&self) -> Result<(), TransactionError> {
        let cancelled = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            match st.phase {
                Phase::Created
                | Phase::Executing
                | Phase::Validating
                | Phase::Prepared
                | Phase::PrepareFailed => {}
                phase => {
                    return Err(TransactionError::InvalidState {
                        op: "rollback",
                        phase,
                    })
                }
            }
            st.phase = Phase::RollingBack;
            let mut cancelled = Vec::new();
            for i in 0..st.nodes.len() {
                cancel_cascade(st, i, &mut cancelled);
            }
            self.shared.idle.send_replace(st.unfinished);
            cancelled
        };
        self.shared.token.cancel();
        for exec in cancelled {
            notify_cancelled(&exec);
        }
        self.wait_idle().await;

        let plan = rollback_plan(&self.shared.state.lock().nodes);
        scheduler::walk(self, plan, WalkKind::Rollback).await;

        self.shared.state.lock().phase = Phase::RolledBack;
        self.shared.release_gate();
        tracing::debug!(txn = %self.id(), "rolled back");
        self.shared
            .bus
            .publish(Event::new(EventKind::TransactionRolledBack).with_txn(self.id()));
        Ok(())
    }

    pub(crate) fn ensure_owner(&self) -> Result<(), TransactionError> {
        if thread::current().id() == self.shared.owner {
            Ok(())
        } else {
            Err(TransactionError::ConcurrentModification)
        }
    }

    /// Fails unless new tasks may still be submitted.
    pub(crate) fn ensure_accepts_tasks(&self, op: &'static str) -> Result<(), TransactionError> {
        let phase = self.phase();
        if phase.accepts_tasks() {
            Ok(())
        } else {
            Err(TransactionError::InvalidState { op, phase })
        }
    }

    pub(crate) fn is_rolling_back(&self) -> bool {
        self.phase() == Phase::RollingBack
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.shared.bus
    }

    pub(crate) fn submit(
        &self,
        name: Arc<str>,
        exec: ExecutableRef,
        deps: &[TaskController],
        check_owner: bool,
    ) -> Result<TaskController, TransactionError> {
        if check_owner {
            self.ensure_owner()?;
        }
        if deps.iter().any(|d| d.txn_id != self.shared.id) {
            return Err(TransactionError::ForeignTask);
        }

        enum Next {
            Run,
            Wait,
            Cancelled,
        }

        let (index, next) = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            if !st.phase.accepts_tasks() {
                return Err(TransactionError::InvalidState {
                    op: "new_task",
                    phase: st.phase,
                });
            }
            let index = st.nodes.len();
            let mut dep_idx: Vec<usize> = deps.iter().map(|d| d.index).collect();
            dep_idx.sort_unstable();
            dep_idx.dedup();

            let mut waiting = 0;
            let mut doomed = false;
            for &d in &dep_idx {
                match st.nodes[d].status {
                    TaskStatus::Succeeded => {}
                    TaskStatus::Failed | TaskStatus::Cancelled => doomed = true,
                    TaskStatus::Pending | TaskStatus::Running => waiting += 1,
                }
                st.nodes[d].dependents.push(index);
            }

            let next = if doomed {
                Next::Cancelled
            } else {
                st.unfinished += 1;
                self.shared.idle.send_replace(st.unfinished);
                if st.phase == Phase::Executing && waiting == 0 {
                    Next::Run
                } else {
                    Next::Wait
                }
            };
            st.nodes.push(TaskNode {
                name: Arc::clone(&name),
                exec: Arc::clone(&exec),
                deps: dep_idx,
                dependents: Vec::new(),
                waiting,
                status: match next {
                    Next::Run => TaskStatus::Running,
                    Next::Wait => TaskStatus::Pending,
                    Next::Cancelled => TaskStatus::Cancelled,
                },
                executed: false,
                result: None,
            });
            (index, next)
        };

        tracing::trace!(txn = %self.id(), task = %name, index, "task submitted");
        match next {
            Next::Run => self.shared.spawn(index),
            Next::Wait => {}
            Next::Cancelled => notify_cancelled(&exec),
        }
        Ok(self.shared.controller(index, name))
    }

    pub(crate) fn record_problem(&self, problem: Problem) {
        self.shared.state.lock().problems.push(problem.clone());
        self.shared.publish_problem(&problem);
    }

    pub(crate) fn set_task_result(&self, index: usize, value: Arc<dyn Any + Send + Sync>) {
        if let Some(node) = self.shared.state.lock().nodes.get_mut(index) {
            node.result = Some(value);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction(Arc::downgrade(&self.shared))
    }

    pub(crate) fn limit(&self) -> Option<Arc<Semaphore>> {
        self.shared.limit.clone()
    }

    async fn wait_idle(&self) {
        let mut rx = self.shared.idle.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Non-owning handle, held by executables that must reach their transaction
/// from a `cancelled` hook.
#[derive(Clone)]
pub(crate) struct WeakTransaction(Weak<TxnShared>);

impl WeakTransaction {
    pub(crate) fn upgrade(&self) -> Option<Transaction> {
        self.0.upgrade().map(|shared| Transaction { shared })
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Succeeded tasks; each waits for its succeeded dependencies.
fn commit_plan(nodes: &[TaskNode]) -> Vec<WalkNode> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.status == TaskStatus::Succeeded)
        .map(|(i, n)| WalkNode {
            index: i,
            name: Arc::clone(&n.name),
            exec: Arc::clone(&n.exec),
            after: n.deps.clone(),
        })
        .collect()
}

/// Executed tasks; each waits for its executed dependents.
fn rollback_plan(nodes: &[TaskNode]) -> Vec<WalkNode> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.executed)
        .map(|(i, n)| WalkNode {
            index: i,
            name: Arc::clone(&n.name),
            exec: Arc::clone(&n.exec),
            after: n.dependents.clone(),
        })
        .collect()
}
