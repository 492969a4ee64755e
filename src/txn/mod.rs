//! Transaction engine: task DAG, problems and the ordered walks.
//!
//! ## Contents
//! - [`Transaction`], [`Phase`], [`TransactionId`] the unit of atomicity
//! - [`Executable`], [`TaskFn`], [`TaskController`], [`TaskStatus`] units of work
//! - [`ExecuteContext`], [`ValidateContext`] callback contexts
//! - [`Problem`], [`Severity`], [`ProblemReport`] diagnostics gating prepare/commit
//!
//! The engine knows nothing about services; controllers are ordinary executables.

mod problem;
mod scheduler;
mod task;
mod transaction;

pub use problem::{Problem, ProblemReport, Severity};
pub use task::{
    Executable, ExecutableRef, ExecuteContext, TaskController, TaskFn, TaskStatus, ValidateContext,
};
pub use transaction::{Phase, Transaction, TransactionId};

pub(crate) use transaction::{TxnSettings, WeakTransaction};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::{Transaction, TransactionId, TxnSettings};
    use crate::events::Bus;

    static NEXT: AtomicU64 = AtomicU64::new(1);

    /// A standalone transaction without a container.
    pub(crate) fn transaction() -> Transaction {
        Transaction::new(TxnSettings {
            id: TransactionId::new(NEXT.fetch_add(1, Ordering::Relaxed)),
            bus: Bus::new(64),
            limit: None,
            gate: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::testing::transaction;
    use super::*;
    use crate::error::{TaskError, TransactionError};

    #[derive(Default)]
    struct Counters {
        executed: AtomicUsize,
        rolled_back: AtomicUsize,
        cancelled: AtomicUsize,
    }

    struct Counted {
        counters: Arc<Counters>,
        fail: bool,
    }

    #[async_trait]
    impl Executable for Counted {
        async fn execute(&self, _ctx: &ExecuteContext) -> Result<(), TaskError> {
            self.counters.executed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TaskError::fail("boom"))
            } else {
                Ok(())
            }
        }

        async fn rollback(&self, _txn: &Transaction) {
            self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }

        fn cancelled(&self) {
            self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(counters: &Arc<Counters>, fail: bool) -> Counted {
        Counted {
            counters: Arc::clone(counters),
            fail,
        }
    }

    #[tokio::test]
    async fn failed_task_cancels_dependents_but_not_siblings() {
        let counters = Arc::new(Counters::default());
        let txn = transaction();

        let bad = txn.new_task("bad", counted(&counters, true), &[]).unwrap();
        let child = txn
            .new_task("child", counted(&counters, false), &[bad.clone()])
            .unwrap();
        let sibling = txn.new_task("sibling", counted(&counters, false), &[]).unwrap();

        txn.prepare().await.unwrap();

        assert_eq!(bad.status(), Some(TaskStatus::Failed));
        assert_eq!(child.status(), Some(TaskStatus::Cancelled));
        assert_eq!(sibling.status(), Some(TaskStatus::Succeeded));
        assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);

        let report = txn.problem_report();
        assert_eq!(report.max_severity(), Some(Severity::Error));
        assert!(txn.can_commit());

        txn.rollback().await.unwrap();
        // bad and sibling executed; child never did.
        assert_eq!(counters.rolled_back.load(Ordering::SeqCst), 2);
        assert_eq!(txn.phase(), Phase::RolledBack);
    }

    #[tokio::test]
    async fn panicking_execute_is_critical_and_blocks_commit() {
        let txn = transaction();
        txn.new_task(
            "panics",
            TaskFn::new(|_ctx: ExecuteContext| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, TaskError>(())
            }),
            &[],
        )
        .unwrap();

        txn.prepare().await.unwrap();
        assert!(!txn.can_commit());
        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::CannotCommit { .. }));
        assert_eq!(txn.phase(), Phase::Prepared);
        txn.rollback().await.unwrap();
    }

    struct Rejects;

    #[async_trait]
    impl Executable for Rejects {
        async fn execute(&self, _ctx: &ExecuteContext) -> Result<(), TaskError> {
            Ok(())
        }

        async fn validate(&self, ctx: &ValidateContext) {
            ctx.add_problem(Problem::error("invalid").with_subject("rejects"));
        }
    }

    #[tokio::test]
    async fn validation_error_fails_prepare() {
        let txn = transaction();
        txn.new_task("rejects", Rejects, &[]).unwrap();

        let err = txn.prepare().await.unwrap_err();
        match err {
            TransactionError::PrepareFailed { report } => {
                assert_eq!(report.len(), 1);
                assert_eq!(report.problems()[0].subject(), Some("rejects"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(txn.phase(), Phase::PrepareFailed);
        assert!(matches!(
            txn.commit().await,
            Err(TransactionError::InvalidState { op: "commit", .. })
        ));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn tasks_submitted_while_executing_join_the_walk() {
        let txn = transaction();
        let spawned = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&spawned);

        let parent = txn
            .new_task(
                "parent",
                TaskFn::new(move |ctx: ExecuteContext| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let me = ctx.task().clone();
                        ctx.new_task(
                            "child",
                            TaskFn::new(move |ctx: ExecuteContext| {
                                let seen = Arc::clone(&seen);
                                async move {
                                    seen.fetch_add(1, Ordering::SeqCst);
                                    ctx.set_result(7u32);
                                    Ok::<_, TaskError>(())
                                }
                            }),
                            &[me],
                        )
                        .map_err(|e| TaskError::fail(e.to_string()))?;
                        Ok(())
                    }
                }),
                &[],
            )
            .unwrap();

        txn.prepare().await.unwrap();
        assert_eq!(parent.status(), Some(TaskStatus::Succeeded));
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn results_are_typed() {
        let txn = transaction();
        let task = txn
            .new_task(
                "answer",
                TaskFn::new(|ctx: ExecuteContext| async move {
                    ctx.set_result(42u64);
                    Ok::<_, TaskError>(())
                }),
                &[],
            )
            .unwrap();
        txn.prepare().await.unwrap();

        assert_eq!(task.result::<u64>().as_deref(), Some(&42));
        assert!(task.result::<String>().is_none());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn depending_on_a_failed_task_cancels_at_creation() {
        let counters = Arc::new(Counters::default());
        let txn = transaction();
        let bad = txn.new_task("bad", counted(&counters, true), &[]).unwrap();
        let holder = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&holder);
        let late_counters = Arc::clone(&counters);

        txn.new_task(
            "late",
            TaskFn::new(move |ctx: ExecuteContext| {
                let bad = bad.clone();
                let slot = Arc::clone(&slot);
                let counters = Arc::clone(&late_counters);
                async move {
                    let task = ctx
                        .new_task(
                            "doomed",
                            Counted {
                                counters,
                                fail: false,
                            },
                            &[bad],
                        )
                        .map_err(|e| TaskError::fail(e.to_string()))?;
                    *slot.lock() = Some(task);
                    Ok(())
                }
            }),
            &[],
        )
        .unwrap();

        txn.prepare().await.unwrap();
        let doomed = holder.lock().clone().expect("doomed task submitted");
        // The late task may have run before or after "bad" failed; either way "doomed" never executes.
        assert_eq!(doomed.status(), Some(TaskStatus::Cancelled));
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_before_prepare_cancels_everything() {
        let counters = Arc::new(Counters::default());
        let txn = transaction();
        let a = txn.new_task("a", counted(&counters, false), &[]).unwrap();
        txn.new_task("b", counted(&counters, false), &[a]).unwrap();

        txn.rollback().await.unwrap();

        assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(counters.rolled_back.load(Ordering::SeqCst), 0);
        assert!(txn.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn terminal_transactions_reject_everything() {
        let counters = Arc::new(Counters::default());
        let txn = transaction();
        txn.prepare().await.unwrap();
        txn.commit().await.unwrap();

        assert!(matches!(
            txn.new_task("x", counted(&counters, false), &[]),
            Err(TransactionError::InvalidState { op: "new_task", phase: Phase::Committed })
        ));
        assert!(matches!(
            txn.rollback().await,
            Err(TransactionError::InvalidState { op: "rollback", .. })
        ));
        assert!(matches!(
            txn.prepare().await,
            Err(TransactionError::InvalidState { op: "prepare", .. })
        ));
    }

    #[tokio::test]
    async fn dependencies_must_belong_to_the_same_transaction() {
        let counters = Arc::new(Counters::default());
        let first = transaction();
        let second = transaction();
        let foreign = first.new_task("a", counted(&counters, false), &[]).unwrap();

        let err = second
            .new_task("b", counted(&counters, false), &[foreign])
            .unwrap_err();
        assert!(matches!(err, TransactionError::ForeignTask));
    }

    #[tokio::test]
    async fn other_threads_cannot_mutate() {
        let counters = Arc::new(Counters::default());
        let txn = transaction();
        let remote = txn.clone();
        let remote_counters = Arc::clone(&counters);

        let res = std::thread::spawn(move || {
            remote
                .new_task("intruder", counted(&remote_counters, false), &[])
                .map(|_| ())
        })
        .join()
        .expect("thread joined");

        assert!(matches!(res, Err(TransactionError::ConcurrentModification)));
        txn.prepare().await.unwrap();
        txn.commit().await.unwrap();
    }
}
