//! # Controller tasks.
//!
//! Each lifecycle step a controller takes inside a transaction is one of these
//! executables. Execute moves the controller forward; rollback puts it back;
//! commit finalizes what cannot be undone (registry removal).
//!
//! | Task    | execute                    | rollback                 | commit             |
//! |---------|----------------------------|--------------------------|--------------------|
//! | install | wire, NEW → DOWN           | unwire, CANCELLED        | `ServiceInstalled` |
//! | mode    | set mode, clear failure    | restore mode and failure | -                  |
//! | start   | `Service::start`           | `Service::stop`          | -                  |
//! | stop    | `Service::stop`            | `Service::start`         | -                  |
//! | remove  | stay REMOVING              | back to DOWN             | REMOVED, unregister|
//!
//! Lifecycle failures are not task failures: a failed start is recorded as an
//! ERROR problem and the task still succeeds, so later tasks of the same
//! controller keep running.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{StartError, TaskError};
use crate::service::Mode;
use crate::txn::{Executable, ExecuteContext, Transaction, ValidateContext, WeakTransaction};

use super::controller::{ServiceController, TaskKind};

pub(crate) struct InstallTask {
    ctl: Arc<ServiceController>,
}

impl InstallTask {
    pub(crate) fn new(ctl: Arc<ServiceController>) -> Self {
        Self { ctl }
    }
}

#[async_trait]
impl Executable for InstallTask {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        self.ctl.wire(ctx.transaction());
        Ok(())
    }

    async fn validate(&self, ctx: &ValidateContext) {
        let mut problems = Vec::new();
        self.ctl.validate_install(&mut problems);
        for p in problems {
            ctx.add_problem(p);
        }
    }

    async fn commit(&self, txn: &Transaction) {
        self.ctl.publish_installed(txn);
    }

    async fn rollback(&self, txn: &Transaction) {
        self.ctl.uninstall(txn);
    }

    fn cancelled(&self) {
        self.ctl.discard();
    }
}

pub(crate) struct ModeTask {
    ctl: Arc<ServiceController>,
    /// `None` keeps the mode and only clears a start failure.
    mode: Option<Mode>,
    previous: Mutex<Option<(Mode, Option<StartError>)>>,
}

impl ModeTask {
    pub(crate) fn new(ctl: Arc<ServiceController>, mode: Option<Mode>) -> Self {
        Self {
            ctl,
            mode,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Executable for ModeTask {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        self.ctl.mark_task(ctx.transaction().id(), ctx.task(), false);
        let previous = self.ctl.apply_mode(ctx.transaction(), self.mode);
        *self.previous.lock() = previous;
        Ok(())
    }

    async fn rollback(&self, txn: &Transaction) {
        let previous = self.previous.lock().take();
        if let Some(previous) = previous {
            self.ctl.restore_mode(txn, self.mode, previous);
        }
    }

    fn cancelled(&self) {
        self.ctl.mode_cancelled(self.mode);
    }
}

pub(crate) struct StartTask {
    ctl: Arc<ServiceController>,
    txn: WeakTransaction,
}

impl StartTask {
    pub(crate) fn new(ctl: Arc<ServiceController>, txn: WeakTransaction) -> Self {
        Self { ctl, txn }
    }
}

#[async_trait]
impl Executable for StartTask {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        self.ctl.mark_task(ctx.transaction().id(), ctx.task(), true);
        self.ctl.start_service(ctx).await;
        Ok(())
    }

    async fn rollback(&self, txn: &Transaction) {
        self.ctl.undo_start(txn).await;
    }

    fn cancelled(&self) {
        if let Some(txn) = self.txn.upgrade() {
            self.ctl.task_cancelled(TaskKind::Start, &txn);
        }
    }
}

pub(crate) struct StopTask {
    ctl: Arc<ServiceController>,
    txn: WeakTransaction,
}

impl StopTask {
    pub(crate) fn new(ctl: Arc<ServiceController>, txn: WeakTransaction) -> Self {
        Self { ctl, txn }
    }
}

#[async_trait]
impl Executable for StopTask {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        self.ctl.mark_task(ctx.transaction().id(), ctx.task(), false);
        self.ctl.stop_service(ctx).await;
        Ok(())
    }

    async fn rollback(&self, txn: &Transaction) {
        self.ctl.undo_stop(txn).await;
    }

    fn cancelled(&self) {
        if let Some(txn) = self.txn.upgrade() {
            self.ctl.task_cancelled(TaskKind::Stop, &txn);
        }
    }
}

pub(crate) struct RemoveTask {
    ctl: Arc<ServiceController>,
    txn: WeakTransaction,
}

impl RemoveTask {
    pub(crate) fn new(ctl: Arc<ServiceController>, txn: WeakTransaction) -> Self {
        Self { ctl, txn }
    }
}

#[async_trait]
impl Executable for RemoveTask {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<(), TaskError> {
        self.ctl.mark_task(ctx.transaction().id(), ctx.task(), false);
        self.ctl.removal_executed();
        Ok(())
    }

    async fn commit(&self, txn: &Transaction) {
        self.ctl.finish_removal(txn);
    }

    async fn rollback(&self, txn: &Transaction) {
        self.ctl.undo_removal(txn);
    }

    fn cancelled(&self) {
        if let Some(txn) = self.txn.upgrade() {
            self.ctl.task_cancelled(TaskKind::Remove, &txn);
        }
    }
}
