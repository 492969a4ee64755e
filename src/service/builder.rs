//! # Installing services: targets and builders.
//!
//! A [`ServiceTarget`] binds a registry to an update transaction and carries
//! settings shared by every service installed through it. A [`ServiceBuilder`]
//! collects one service's definition; [`ServiceBuilder::install`] validates it
//! and queues the install task.
//!
//! ```text
//! registry.target(&txn)
//!   ├─ add_dependency / add_listener / add_monitor   (applied to every builder)
//!   └─ add_service(name) ──► ServiceBuilder
//!                              ├─ set_service, set_mode, add_dependency, add_alias
//!                              ├─ requires::<V>(dep)   ──► Supplier<V>
//!                              ├─ provides::<V>(names) ──► Consumer<V>
//!                              └─ install() ──► Arc<ServiceController> (NEW)
//! ```
//!
//! Every mutation is checked against the transaction owner thread.

use std::sync::{Arc, Weak};

use crate::core::{
    ensure_owner, ControllerParts, ListenerRef, ServiceController, ServiceRegistry,
    StabilityMonitor,
};
use crate::error::ContainerError;
use crate::txn::Transaction;

use super::dependency::{Dependency, DependencyFlags};
use super::mode::Mode;
use super::name::ServiceName;
use super::service::{NullService, Service, ServiceRef};
use super::value::{Consumer, Supplier, ValueSlot};

fn upgrade(registry: &Weak<ServiceRegistry>) -> Result<Arc<ServiceRegistry>, ContainerError> {
    registry
        .upgrade()
        .ok_or_else(|| ContainerError::illegal("registry was dropped"))
}

fn push_dependency(deps: &mut Vec<Dependency>, dep: Dependency) {
    match deps.iter_mut().find(|d| d.name() == dep.name()) {
        Some(existing) => *existing = dep,
        None => deps.push(dep),
    }
}

/// Installation context bound to one registry and one transaction.
pub struct ServiceTarget {
    registry: Weak<ServiceRegistry>,
    txn: Transaction,
    dependencies: Vec<Dependency>,
    listeners: Vec<ListenerRef>,
    monitors: Vec<StabilityMonitor>,
}

impl ServiceTarget {
    pub(crate) fn new(registry: Weak<ServiceRegistry>, txn: Transaction) -> Self {
        Self {
            registry,
            txn,
            dependencies: Vec::new(),
            listeners: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// A dependency added to every service installed through this target.
    pub fn add_dependency(
        &mut self,
        name: ServiceName,
        flags: DependencyFlags,
    ) -> Result<&mut Self, ContainerError> {
        ensure_owner(&self.txn)?;
        push_dependency(&mut self.dependencies, Dependency::new(name, flags)?);
        Ok(self)
    }

    /// A listener attached to every service installed through this target.
    pub fn add_listener(&mut self, listener: ListenerRef) -> Result<&mut Self, ContainerError> {
        ensure_owner(&self.txn)?;
        self.listeners.push(listener);
        Ok(self)
    }

    /// A monitor tracking every service installed through this target.
    pub fn add_monitor(&mut self, monitor: &StabilityMonitor) -> Result<&mut Self, ContainerError> {
        ensure_owner(&self.txn)?;
        self.monitors.push(monitor.clone());
        Ok(self)
    }

    /// Starts the definition of a service named `name`.
    pub fn add_service(&self, name: ServiceName) -> Result<ServiceBuilder, ContainerError> {
        ensure_owner(&self.txn)?;
        self.txn.ensure_accepts_tasks("add_service")?;
        Ok(ServiceBuilder {
            registry: self.registry.clone(),
            txn: self.txn.clone(),
            name,
            aliases: Vec::new(),
            service: Arc::new(NullService),
            mode: Mode::Active,
            dependencies: self.dependencies.clone(),
            listeners: self.listeners.clone(),
            monitors: self.monitors.clone(),
            provided: Vec::new(),
            installed: false,
        })
    }

    /// Queues removal of the service providing `name`.
    pub fn remove_service(&self, name: &ServiceName) -> Result<(), ContainerError> {
        ensure_owner(&self.txn)?;
        upgrade(&self.registry)?
            .get_required_service(name)?
            .remove(&self.txn)
    }

    /// Queues a mode change of the service providing `name`.
    pub fn set_mode(&self, name: &ServiceName, mode: Mode) -> Result<(), ContainerError> {
        ensure_owner(&self.txn)?;
        upgrade(&self.registry)?
            .get_required_service(name)?
            .set_mode(&self.txn, mode)
    }
}

/// Definition of one service, consumed by [`install`](Self::install).
///
/// # Example
/// ```no_run
/// # async fn demo(container: std::sync::Arc<svcgraph::ServiceContainer>) -> Result<(), svcgraph::ContainerError> {
/// use svcgraph::{DependencyFlags, Mode, NullService, ServiceName};
///
/// let txn = container.begin().await?;
/// let target = container.registry().target(&txn);
///
/// let mut db = target.add_service(ServiceName::of("db"))?;
/// let pool = db.provides::<String>([ServiceName::of("db").append("pool")])?;
/// db.set_mode(Mode::OnDemand)?.install()?;
///
/// let mut web = target.add_service(ServiceName::of("web"))?;
/// let url = web.requires::<String>(ServiceName::of("db").append("pool"))?;
/// web.add_dependency(ServiceName::of("cache"), DependencyFlags::OPTIONAL)?
///     .set_service(NullService)?
///     .install()?;
/// # let _ = (pool, url);
/// txn.prepare().await?;
/// txn.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBuilder {
    registry: Weak<ServiceRegistry>,
    txn: Transaction,
    name: ServiceName,
    aliases: Vec<ServiceName>,
    service: ServiceRef,
    mode: Mode,
    dependencies: Vec<Dependency>,
    listeners: Vec<ListenerRef>,
    monitors: Vec<StabilityMonitor>,
    provided: Vec<(ServiceName, Arc<ValueSlot>)>,
    installed: bool,
}

impl ServiceBuilder {
    fn check(&self) -> Result<(), ContainerError> {
        ensure_owner(&self.txn)?;
        if self.installed {
            return Err(ContainerError::illegal(format!(
                "builder for {} was already installed",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn set_service<S: Service>(&mut self, service: S) -> Result<&mut Self, ContainerError> {
        self.set_service_ref(Arc::new(service))
    }

    pub fn set_service_ref(&mut self, service: ServiceRef) -> Result<&mut Self, ContainerError> {
        self.check()?;
        self.service = service;
        Ok(self)
    }

    /// Initial mode; `REMOVE` is not a valid initial mode.
    pub fn set_mode(&mut self, mode: Mode) -> Result<&mut Self, ContainerError> {
        self.check()?;
        if mode == Mode::Remove {
            return Err(ContainerError::illegal("REMOVE is not an initial mode"));
        }
        self.mode = mode;
        Ok(self)
    }

    /// Adds a dependency; a second call for the same name replaces the flags.
    pub fn add_dependency(
        &mut self,
        name: ServiceName,
        flags: DependencyFlags,
    ) -> Result<&mut Self, ContainerError> {
        self.check()?;
        push_dependency(&mut self.dependencies, Dependency::new(name, flags)?);
        Ok(self)
    }

    /// An additional name this service is known by.
    pub fn add_alias(&mut self, alias: ServiceName) -> Result<&mut Self, ContainerError> {
        self.check()?;
        if alias != self.name && !self.aliases.contains(&alias) {
            self.aliases.push(alias);
        }
        Ok(self)
    }

    /// Requires `name` and returns a handle to the value it provides.
    ///
    /// Keeps the flags of an existing dependency on `name`.
    pub fn requires<V>(&mut self, name: ServiceName) -> Result<Supplier<V>, ContainerError>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.check()?;
        if !self.dependencies.iter().any(|d| d.name() == &name) {
            self.dependencies.push(Dependency::required(name.clone()));
        }
        Ok(Supplier::new(name, self.registry.clone()))
    }

    /// Provides a value under each of `names` (the service name when empty).
    ///
    /// Names other than the service name become aliases.
    pub fn provides<V>(
        &mut self,
        names: impl IntoIterator<Item = ServiceName>,
    ) -> Result<Consumer<V>, ContainerError>
    where
        V: Send + Sync + 'static,
    {
        self.check()?;
        let mut names: Vec<ServiceName> = names.into_iter().collect();
        if names.is_empty() {
            names.push(self.name.clone());
        }
        let mut slots = Vec::with_capacity(names.len());
        for name in names {
            if name != self.name && !self.aliases.contains(&name) {
                self.aliases.push(name.clone());
            }
            let slot = match self.provided.iter().find(|(n, _)| n == &name) {
                Some((_, slot)) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(ValueSlot::default());
                    self.provided.push((name, Arc::clone(&slot)));
                    slot
                }
            };
            slots.push(slot);
        }
        Ok(Consumer::new(slots))
    }

    pub fn add_listener(&mut self, listener: ListenerRef) -> Result<&mut Self, ContainerError> {
        self.check()?;
        self.listeners.push(listener);
        Ok(self)
    }

    pub fn add_monitor(&mut self, monitor: &StabilityMonitor) -> Result<&mut Self, ContainerError> {
        self.check()?;
        self.monitors.push(monitor.clone());
        Ok(self)
    }

    /// Installs the service into the transaction.
    ///
    /// Fails with `DuplicateService` when the name (or an alias) is taken and with
    /// `CircularDependency` when the new edges close a cycle; nothing is installed
    /// then. The builder cannot be used afterwards.
    pub fn install(&mut self) -> Result<Arc<ServiceController>, ContainerError> {
        self.check()?;
        self.installed = true;
        let registry = upgrade(&self.registry)?;
        let parts = ControllerParts {
            name: self.name.clone(),
            aliases: std::mem::take(&mut self.aliases),
            service: Arc::clone(&self.service),
            dependencies: std::mem::take(&mut self.dependencies),
            mode: self.mode,
            listeners: std::mem::take(&mut self.listeners),
            provided: std::mem::take(&mut self.provided),
        };
        let ctl = ServiceController::install(&registry, &self.txn, parts)?;
        for monitor in &self.monitors {
            monitor.add_controller(&ctl);
        }
        Ok(ctl)
    }
}
