//! # Logging subscriber for debugging and demos.
//!
//! [`LogWriter`] forwards container events to `tracing`, one line per event.
//!
//! ## Output format
//! ```text
//! INFO  transition service=db txn=txn-3 from=STARTING to=UP
//! WARN  start failed service=cache txn=txn-3 reason="connection refused"
//! WARN  problem txn=txn-3 severity=ERROR reason="..."
//! INFO  committed txn=txn-3
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// `tracing`-backed logging subscriber.
///
/// Enabled via the `logging` feature. Install a `tracing` subscriber
/// (e.g. `tracing_subscriber::fmt`) to see the output.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let service = e.service.as_deref().unwrap_or("-");
        let txn = e.txn.map(|t| t.to_string()).unwrap_or_default();
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::ServiceTransition => {
                if let (Some(from), Some(to)) = (e.from, e.to) {
                    tracing::info!(service, txn, %from, %to, "transition");
                }
            }
            EventKind::StartFailed => tracing::warn!(service, txn, reason, "start failed"),
            EventKind::DependencyFailed => tracing::warn!(service, txn, "dependency failed"),
            EventKind::DependencyFailureCleared => {
                tracing::info!(service, txn, "dependency failure cleared")
            }
            EventKind::ServiceInstalled => tracing::info!(service, txn, "installed"),
            EventKind::ServiceRemoved => tracing::info!(service, txn, "removed"),
            EventKind::ServiceCancelled => tracing::info!(service, txn, "install cancelled"),
            EventKind::TaskFailed => {
                let task = e.task.as_deref().unwrap_or("-");
                tracing::warn!(task, txn, reason, "task failed")
            }
            EventKind::ProblemReported => {
                let severity = e.severity.map(|s| s.as_label()).unwrap_or("-");
                tracing::warn!(service, txn, severity, reason, "problem")
            }
            EventKind::TransactionPrepared => tracing::info!(txn, reason, "prepared"),
            EventKind::TransactionCommitted => tracing::info!(txn, "committed"),
            EventKind::TransactionRolledBack => tracing::info!(txn, "rolled back"),
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                let subscriber = e.task.as_deref().unwrap_or("-");
                tracing::warn!(subscriber, reason, kind = e.kind.as_label(), "subscriber")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
