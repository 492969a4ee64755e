//! # ServiceContainer: owns the registries, the event bus and the update gate.
//!
//! The [`ServiceContainer`] hands out update transactions one at a time, fans
//! events out to subscribers and shuts every service down on request.
//!
//! ## High-level architecture
//! ```text
//! ServiceContainer::builder(cfg).with_subscribers(subs).build()
//!   ├─ Bus (broadcast)
//!   ├─ subscriber_listener(): Bus.subscribe() ─► SubscriberSet::emit(&Event)
//!   ├─ gate: Semaphore(1)          one update transaction at a time
//!   ├─ limit: Option<Semaphore>    cap on running task callbacks
//!   └─ registries: primary + new_registry()
//!
//! begin().await ──► gate permit ──► Transaction (permit released at COMMITTED / ROLLED_BACK)
//!
//! shutdown():
//!   begin() ─► close gate ─► set_mode(REMOVE) on every service
//!           ─► prepare + commit ─► await stability   (bounded by cfg.grace())
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use crate::error::{ContainerError, TransactionError};
use crate::events::{Bus, Event};
use crate::service::Mode;
use crate::subscribers::SubscriberSet;
use crate::txn::{Transaction, TransactionId, TxnSettings};

use super::builder::ContainerBuilder;
use super::config::ContainerConfig;
use super::monitor::StabilityMonitor;
use super::registry::ServiceRegistry;

/// Container of service registries.
///
/// # Example
/// ```no_run
/// use svcgraph::{ContainerConfig, NullService, ServiceContainer, ServiceName};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), svcgraph::ContainerError> {
///     let container = ServiceContainer::builder(ContainerConfig::default()).build();
///
///     let txn = container.begin().await?;
///     let mut target = container.registry().target(&txn);
///     target
///         .add_service(ServiceName::of("db"))?
///         .set_service(NullService)?
///         .install()?;
///     txn.prepare().await?;
///     txn.commit().await?;
///
///     container.shutdown().await
/// }
/// ```
pub struct ServiceContainer {
    cfg: ContainerConfig,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    gate: Arc<Semaphore>,
    limit: Option<Arc<Semaphore>>,
    next_txn: AtomicU64,
    registry: Arc<ServiceRegistry>,
    registries: Mutex<Vec<Weak<ServiceRegistry>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Starts configuring a container.
    pub fn builder(cfg: ContainerConfig) -> ContainerBuilder {
        ContainerBuilder::new(cfg)
    }

    pub(crate) fn new_internal(cfg: ContainerConfig, bus: Bus, subs: Arc<SubscriberSet>) -> Self {
        let limit = cfg
            .concurrency_limit()
            .map(Semaphore::new)
            .map(Arc::new);
        let registry = ServiceRegistry::new(bus.clone());
        Self {
            cfg,
            registries: Mutex::new(vec![Arc::downgrade(&registry)]),
            registry,
            bus,
            subs,
            gate: Arc::new(Semaphore::new(1)),
            limit,
            next_txn: AtomicU64::new(1),
            listener: Mutex::new(None),
        }
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    pub(crate) fn subscriber_listener(&self) {
        if self.subs.is_empty() {
            return;
        }
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock() = Some(handle);
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.cfg
    }

    /// The primary registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// A fresh registry: its own namespace, sharing the container's bus and gate.
    pub fn new_registry(&self) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(self.bus.clone());
        let mut all = self.registries.lock();
        all.retain(|w| w.strong_count() > 0);
        all.push(Arc::downgrade(&registry));
        registry
    }

    /// Live container events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Opens an update transaction, waiting for the previous one to finish.
    ///
    /// The transaction is owned by the calling thread. Fails with
    /// `ContainerShutdown` once [`shutdown`](Self::shutdown) has begun.
    pub async fn begin(&self) -> Result<Transaction, TransactionError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| TransactionError::ContainerShutdown)?;
        Ok(self.open(permit))
    }

    /// Opens an update transaction if none is in progress.
    ///
    /// Fails with `ConcurrentModification` while another one is open.
    pub fn try_begin(&self) -> Result<Transaction, TransactionError> {
        match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => Ok(self.open(permit)),
            Err(TryAcquireError::Closed) => Err(TransactionError::ContainerShutdown),
            Err(TryAcquireError::NoPermits) => Err(TransactionError::ConcurrentModification),
        }
    }

    fn open(&self, gate: OwnedSemaphorePermit) -> Transaction {
        let id = TransactionId::new(self.next_txn.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(txn = %id, "transaction opened");
        Transaction::new(TxnSettings {
            id,
            bus: self.bus.clone(),
            limit: self.limit.clone(),
            gate: Some(gate),
        })
    }

    fn registries(&self) -> Vec<Arc<ServiceRegistry>> {
        self.registries
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Removes every service and refuses further transactions.
    ///
    /// Waits up to `cfg.grace()` for the removal to settle; fails with
    /// `ShutdownTimeout` when the grace period is exceeded.
    pub async fn shutdown(&self) -> Result<(), ContainerError> {
        let txn = self.begin().await?;
        self.gate.close();

        let monitor = StabilityMonitor::new();
        for registry in self.registries() {
            for ctl in registry.services() {
                monitor.add_controller(&ctl);
                if ctl.mode() == Mode::Remove {
                    continue;
                }
                if let Err(e) = ctl.remove(&txn) {
                    tracing::debug!(service = %ctl.name(), error = %e, "skipped during shutdown");
                }
            }
        }

        let work = async {
            if let Err(e) = txn.prepare().await {
                rollback_after_failure(&txn, "prepare").await;
                return Err(ContainerError::from(e));
            }
            if let Err(e) = txn.commit().await {
                rollback_after_failure(&txn, "commit").await;
                return Err(ContainerError::from(e));
            }
            monitor.await_stability().await;
            Ok(())
        };
        match self.cfg.grace() {
            Some(grace) => tokio::time::timeout(grace, work)
                .await
                .map_err(|_| ContainerError::ShutdownTimeout { grace })?,
            None => work.await,
        }?;
        tracing::info!("container shut down");
        Ok(())
    }

    /// Human-readable listing of every service.
    pub fn dump_services(&self) -> String {
        let mut out = String::new();
        for (i, registry) in self.registries().iter().enumerate() {
            let services = registry.services();
            let _ = writeln!(out, "registry {i}: {} service(s)", services.len());
            for ctl in services {
                let deps: Vec<String> = ctl
                    .dependencies()
                    .iter()
                    .map(|d| {
                        let flags: Vec<&str> = d.flags().iter_names().map(|(n, _)| n).collect();
                        format!("{} ({})", d.name(), flags.join("|"))
                    })
                    .collect();
                let _ = write!(out, "  {} mode={} state={}", ctl.name(), ctl.mode(), ctl.state());
                if !ctl.aliases().is_empty() {
                    let aliases: Vec<String> = ctl.aliases().iter().map(ToString::to_string).collect();
                    let _ = write!(out, " aliases=[{}]", aliases.join(", "));
                }
                let _ = writeln!(out, " deps=[{}]", deps.join(", "));
                if let Some(err) = ctl.start_error() {
                    let _ = writeln!(out, "    start error: {err}");
                }
            }
        }
        out
    }
}

/// Best-effort rollback once prepare or commit has failed.
async fn rollback_after_failure(txn: &Transaction, stage: &'static str) {
    if let Err(e) = txn.rollback().await {
        tracing::warn!(txn = %txn.id(), stage, error = %e, "rollback after failed shutdown step failed");
    }
}

impl Drop for ServiceContainer {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}
