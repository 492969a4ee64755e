//! # Parallel ordered walks over finished tasks.
//!
//! Commit and rollback both visit a set of tasks in a topological order, running
//! every callback whose predecessors are done concurrently:
//!
//! ```text
//! commit:   predecessors = succeeded dependencies   (forward order)
//! rollback: predecessors = executed dependents      (reverse order)
//! ```
//!
//! ## Rules
//! - Callbacks run on the runtime via a `JoinSet`, capped by the container's
//!   concurrency limit when one is configured.
//! - Panics are caught and logged; a panicking callback still counts as done.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;

use crate::subscribers::panic_message;

use super::task::ExecutableRef;
use super::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkKind {
    Commit,
    Rollback,
}

impl WalkKind {
    fn as_label(&self) -> &'static str {
        match self {
            WalkKind::Commit => "commit",
            WalkKind::Rollback => "rollback",
        }
    }
}

pub(crate) struct WalkNode {
    pub(crate) index: usize,
    pub(crate) name: Arc<str>,
    pub(crate) exec: ExecutableRef,
    /// Tasks (by transaction index) that must be visited first.
    pub(crate) after: Vec<usize>,
}

/// Visits every node once, each only after all of its predecessors in the plan.
pub(crate) async fn walk(txn: &Transaction, nodes: Vec<WalkNode>, kind: WalkKind) {
    if nodes.is_empty() {
        return;
    }
    let position: HashMap<usize, usize> = nodes
        .iter()
        .enumerate()
        .map(|(pos, n)| (n.index, pos))
        .collect();

    let mut remaining = vec![0usize; nodes.len()];
    let mut followers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (pos, node) in nodes.iter().enumerate() {
        for before in &node.after {
            if let Some(&b) = position.get(before) {
                remaining[pos] += 1;
                followers[b].push(pos);
            }
        }
    }

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&p| remaining[p] == 0).collect();
    let mut running = JoinSet::new();
    let limit = txn.limit();

    loop {
        for pos in ready.drain(..) {
            let exec = Arc::clone(&nodes[pos].exec);
            let name = Arc::clone(&nodes[pos].name);
            let txn = txn.clone();
            let limit = limit.clone();
            running.spawn(async move {
                let _permit = match limit {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let fut = async {
                    match kind {
                        WalkKind::Commit => exec.commit(&txn).await,
                        WalkKind::Rollback => exec.rollback(&txn).await,
                    }
                };
                if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                    tracing::error!(
                        txn = %txn.id(),
                        task = %name,
                        phase = kind.as_label(),
                        info = %panic_message(&*panic),
                        "callback panicked"
                    );
                }
                pos
            });
        }

        match running.join_next().await {
            Some(Ok(pos)) => {
                for &f in &followers[pos] {
                    remaining[f] -= 1;
                    if remaining[f] == 0 {
                        ready.push(f);
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(txn = %txn.id(), phase = kind.as_label(), %err, "callback aborted");
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::error::TaskError;
    use crate::txn::testing::transaction;
    use crate::txn::{Executable, ExecuteContext, Transaction};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Executable for Recorder {
        async fn execute(&self, _ctx: &ExecuteContext) -> Result<(), TaskError> {
            self.log.lock().push(format!("execute:{}", self.name));
            Ok(())
        }

        async fn commit(&self, _txn: &Transaction) {
            self.log.lock().push(format!("commit:{}", self.name));
        }

        async fn rollback(&self, _txn: &Transaction) {
            self.log.lock().push(format!("rollback:{}", self.name));
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing {entry} in {log:?}"))
    }

    #[tokio::test]
    async fn commit_follows_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let txn = transaction();
        let rec = |name| Recorder {
            name,
            log: Arc::clone(&log),
        };

        let a = txn.new_task("a", rec("a"), &[]).unwrap();
        let b = txn.new_task("b", rec("b"), &[a.clone()]).unwrap();
        txn.new_task("c", rec("c"), &[a, b]).unwrap();

        txn.prepare().await.unwrap();
        txn.commit().await.unwrap();

        let log = log.lock().clone();
        assert!(position(&log, "commit:a") < position(&log, "commit:b"));
        assert!(position(&log, "commit:b") < position(&log, "commit:c"));
    }

    #[tokio::test]
    async fn rollback_runs_dependents_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let txn = transaction();
        let rec = |name| Recorder {
            name,
            log: Arc::clone(&log),
        };

        let a = txn.new_task("a", rec("a"), &[]).unwrap();
        let b = txn.new_task("b", rec("b"), &[a.clone()]).unwrap();
        let c = txn.new_task("c", rec("c"), &[a]).unwrap();
        txn.new_task("d", rec("d"), &[b, c]).unwrap();

        txn.prepare().await.unwrap();
        txn.rollback().await.unwrap();

        let log = log.lock().clone();
        assert!(position(&log, "rollback:d") < position(&log, "rollback:b"));
        assert!(position(&log, "rollback:d") < position(&log, "rollback:c"));
        assert!(position(&log, "rollback:b") < position(&log, "rollback:a"));
        assert!(position(&log, "rollback:c") < position(&log, "rollback:a"));
    }
}
