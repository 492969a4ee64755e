//! # Service registry: names, registrations and cycle detection.
//!
//! Every name that is provided, depended upon or demanded has a [`Registration`].
//! A registration remembers who provides the name, who depends on it, whether the
//! provider is UP or failed and how much demand it receives, so a provider
//! installed later picks up the state its dependents already built.
//!
//! ```text
//! ServiceRegistry
//!   └─ HashMap<ServiceName, Arc<Registration>>
//!         Registration { controller, dependents[], up, failed, demand, slot }
//!                          ▲                │
//!          claim()/unclaim │                │ sync_up / sync_failed / sync_demand
//!                          │                ▼
//!                  ServiceController ◄── adjust_*() under registration lock
//! ```
//!
//! ## Rules
//! - Lock order: registry map → registration → controller. A controller never takes
//!   a registration lock while holding its own.
//! - Counters are adjusted under the registration lock; the follow-up `drive` of
//!   each affected controller runs after it is released.
//! - Published state is never taken from the caller: the `sync_*` functions read the
//!   controller's current flags under the registration lock, so effects applied late
//!   by another thread cannot overwrite a newer value.
//! - Empty registrations (no provider, no dependents, no demand) are pruned.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::ContainerError;
use crate::events::Bus;
use crate::service::{DependencyFlags, ServiceName, ServiceTarget, ValueSlot};
use crate::txn::Transaction;

use super::controller::ServiceController;

pub(crate) struct Dependent {
    controller: Weak<ServiceController>,
    flags: DependencyFlags,
    /// Whether this dependent's demand is counted in `RegState::demand`.
    demanding: bool,
}

#[derive(Default)]
struct RegState {
    controller: Option<Arc<ServiceController>>,
    dependents: Vec<Dependent>,
    up: bool,
    failed: bool,
    demand: usize,
    slot: Option<Arc<ValueSlot>>,
}

/// Bookkeeping for one name.
pub(crate) struct Registration {
    name: ServiceName,
    state: Mutex<RegState>,
}

impl Registration {
    fn new(name: ServiceName) -> Self {
        Self {
            name,
            state: Mutex::new(RegState::default()),
        }
    }

    pub(crate) fn name(&self) -> &ServiceName {
        &self.name
    }

    /// The current provider, if any (including NEW ones).
    pub(crate) fn controller(&self) -> Option<Arc<ServiceController>> {
        self.state.lock().controller.clone()
    }

    /// The provider unless it is gone.
    pub(crate) fn live_controller(&self) -> Option<Arc<ServiceController>> {
        self.controller().filter(|c| !c.state().is_gone())
    }

    /// Snapshot of dependents declared with `flags`.
    pub(crate) fn dependents_with(&self, flags: DependencyFlags) -> Vec<Arc<ServiceController>> {
        self.state
            .lock()
            .dependents
            .iter()
            .filter(|d| d.flags.contains(flags))
            .filter_map(|d| d.controller.upgrade())
            .collect()
    }

    /// Links `dependent` and seeds its counters from the current state.
    pub(crate) fn add_dependent(&self, dependent: &Arc<ServiceController>, flags: DependencyFlags) {
        let mut st = self.state.lock();
        st.dependents.push(Dependent {
            controller: Arc::downgrade(dependent),
            flags,
            demanding: false,
        });
        dependent.seed_dependency(flags, st.up, st.failed);
    }

    /// Unlinks `dependent`; called once it is gone, so its counters are left alone.
    pub(crate) fn remove_dependent(&self, dependent: &Arc<ServiceController>) {
        self.state
            .lock()
            .dependents
            .retain(|d| !std::ptr::eq(d.controller.as_ptr(), Arc::as_ptr(dependent)));
    }

    fn provided_by(st: &RegState, provider: &ServiceController) -> bool {
        st.controller
            .as_ref()
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), provider))
    }

    /// Brings the published UP state in line with `provider` and notifies dependents.
    ///
    /// The provider's flag is read under the registration lock, so two threads
    /// syncing the same provider always leave the latest value behind.
    pub(crate) fn sync_up(&self, provider: &ServiceController, txn: &Transaction) {
        let affected = {
            let mut st = self.state.lock();
            if !Self::provided_by(&st, provider) {
                return;
            }
            let up = provider.up_published();
            if st.up == up {
                return;
            }
            st.up = up;
            let mut affected = Vec::new();
            for d in &st.dependents {
                if let Some(c) = d.controller.upgrade() {
                    c.dependency_up_changed(d.flags, up);
                    affected.push(c);
                }
            }
            affected
        };
        for c in affected {
            c.drive(txn);
        }
    }

    /// Brings the published failure in line with `provider` and notifies blocking dependents.
    pub(crate) fn sync_failed(&self, provider: &ServiceController, txn: &Transaction) {
        let affected = {
            let mut st = self.state.lock();
            if !Self::provided_by(&st, provider) {
                return;
            }
            let failed = provider.failure_published();
            if st.failed == failed {
                return;
            }
            st.failed = failed;
            let mut affected = Vec::new();
            for d in &st.dependents {
                if !d.flags.is_blocking() {
                    continue;
                }
                if let Some(c) = d.controller.upgrade() {
                    c.dependency_failure_changed(failed);
                    affected.push(c);
                }
            }
            affected
        };
        for c in affected {
            c.drive(txn);
        }
    }

    /// Brings the demand `dependent` places on this name in line with its current
    /// wish, forwarding the difference to the provider.
    pub(crate) fn sync_demand(&self, dependent: &ServiceController, txn: &Transaction) {
        let provider = {
            let mut st = self.state.lock();
            let Some(entry) = st
                .dependents
                .iter_mut()
                .find(|d| std::ptr::eq(d.controller.as_ptr(), dependent))
            else {
                return;
            };
            let wanted = entry.flags.is_demanded() && dependent.demanding();
            if entry.demanding == wanted {
                return;
            }
            entry.demanding = wanted;
            if wanted {
                st.demand += 1;
            } else {
                st.demand = st.demand.saturating_sub(1);
            }
            let provider = st.controller.clone();
            if let Some(c) = &provider {
                c.adjust_demand(if wanted { 1 } else { -1 });
            }
            provider
        };
        if let Some(c) = provider {
            c.drive(txn);
        }
    }

    fn is_empty(&self) -> bool {
        let st = self.state.lock();
        st.controller.is_none() && st.dependents.is_empty() && st.demand == 0
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("up", &st.up)
            .field("failed", &st.failed)
            .field("demand", &st.demand)
            .field("dependents", &st.dependents.len())
            .finish()
    }
}

/// A namespace of services.
///
/// Obtained from [`ServiceContainer::registry`](crate::ServiceContainer::registry)
/// or [`ServiceContainer::new_registry`](crate::ServiceContainer::new_registry).
/// Lookups are safe from any thread at any time.
pub struct ServiceRegistry {
    entries: Mutex<HashMap<ServiceName, Arc<Registration>>>,
    bus: Bus,
    me: Weak<ServiceRegistry>,
}

impl ServiceRegistry {
    pub(crate) fn new(bus: Bus) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            me: me.clone(),
        })
    }

    /// A target installing into this registry within `txn`.
    pub fn target(&self, txn: &Transaction) -> ServiceTarget {
        ServiceTarget::new(self.me.clone(), txn.clone())
    }

    /// The installed service providing `name`, if any.
    ///
    /// Services not yet executed (NEW) or gone (REMOVED/CANCELLED) are invisible.
    pub fn get_service(&self, name: &ServiceName) -> Option<Arc<ServiceController>> {
        self.lookup(name)?
            .controller()
            .filter(|c| c.is_installed())
    }

    /// Same as [`get_service`](Self::get_service), failing with `ServiceNotFound`.
    pub fn get_required_service(
        &self,
        name: &ServiceName,
    ) -> Result<Arc<ServiceController>, ContainerError> {
        self.get_service(name)
            .ok_or_else(|| ContainerError::ServiceNotFound { name: name.clone() })
    }

    /// Every provided name (primary names and aliases), sorted.
    pub fn service_names(&self) -> Vec<ServiceName> {
        let regs: Vec<Arc<Registration>> = self.entries.lock().values().cloned().collect();
        let mut names: Vec<ServiceName> = regs
            .iter()
            .filter(|r| r.controller().is_some_and(|c| c.is_installed()))
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Installed services, by primary name.
    pub fn services(&self) -> Vec<Arc<ServiceController>> {
        let regs: Vec<Arc<Registration>> = self.entries.lock().values().cloned().collect();
        let mut services: Vec<Arc<ServiceController>> = regs
            .iter()
            .filter_map(|r| r.controller().filter(|c| c.is_installed() && c.name() == &r.name))
            .collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    pub fn len(&self) -> usize {
        self.services().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn lookup(&self, name: &ServiceName) -> Option<Arc<Registration>> {
        self.entries.lock().get(name).cloned()
    }

    /// Returns the registration for `name`, creating it if needed.
    pub(crate) fn registration(&self, name: &ServiceName) -> Arc<Registration> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Registration::new(name.clone()))),
        )
    }

    /// Drops the registration for `name` if nothing refers to it any more.
    pub(crate) fn prune(&self, name: &ServiceName) {
        let mut entries = self.entries.lock();
        if entries.get(name).is_some_and(|r| r.is_empty()) {
            entries.remove(name);
        }
    }

    /// Makes `controller` the provider of each of `names`.
    ///
    /// Fails with `DuplicateService` if a live controller (installed or pending in
    /// the current transaction) already provides one of them; nothing is claimed then.
    pub(crate) fn claim(
        &self,
        controller: &Arc<ServiceController>,
        names: &[ServiceName],
    ) -> Result<Vec<Arc<Registration>>, ContainerError> {
        let mut claimed: Vec<Arc<Registration>> = Vec::with_capacity(names.len());
        for name in names {
            let reg = self.registration(name);
            let mut st = reg.state.lock();
            if st.controller.as_ref().is_some_and(|c| !c.state().is_gone()) {
                drop(st);
                self.unclaim(controller, &claimed);
                self.prune(name);
                return Err(ContainerError::DuplicateService { name: name.clone() });
            }
            st.controller = Some(Arc::clone(controller));
            st.slot = controller.slot_for(name);
            if st.demand > 0 {
                controller.adjust_demand(st.demand as isize);
            }
            drop(st);
            claimed.push(reg);
        }
        Ok(claimed)
    }

    /// Releases names claimed by `controller`, then prunes them.
    pub(crate) fn unclaim(&self, controller: &Arc<ServiceController>, regs: &[Arc<Registration>]) {
        for reg in regs {
            {
                let mut st = reg.state.lock();
                if st.controller.as_ref().is_some_and(|c| Arc::ptr_eq(c, controller)) {
                    st.controller = None;
                    st.slot = None;
                }
            }
            self.prune(&reg.name);
        }
    }

    /// Value published under `name` by its provider.
    pub(crate) fn provided_value(&self, name: &ServiceName) -> Option<Arc<dyn Any + Send + Sync>> {
        let slot = self.lookup(name)?.state.lock().slot.clone()?;
        slot.get()
    }

    /// Finds a cycle through `root` over REQUIRED/PARENT edges.
    ///
    /// Walks installed controllers and pending installs; gone controllers are
    /// skipped. Returns the path `root -> .. -> root`.
    pub(crate) fn find_cycle(&self, root: &Arc<ServiceController>) -> Option<Vec<ServiceName>> {
        let mut path = vec![root.name().clone()];
        let mut visited: HashSet<*const ServiceController> = HashSet::new();
        visited.insert(Arc::as_ptr(root));
        self.visit(root, root, &mut path, &mut visited)
    }

    fn visit(
        &self,
        root: &Arc<ServiceController>,
        current: &Arc<ServiceController>,
        path: &mut Vec<ServiceName>,
        visited: &mut HashSet<*const ServiceController>,
    ) -> Option<Vec<ServiceName>> {
        for dep in current.dependencies() {
            if !dep.flags().is_blocking() {
                continue;
            }
            let Some(next) = self.lookup(dep.name()).and_then(|r| r.live_controller()) else {
                continue;
            };
            path.push(dep.name().clone());
            if Arc::ptr_eq(&next, root) {
                return Some(path.clone());
            }
            if visited.insert(Arc::as_ptr(&next)) {
                if let Some(cycle) = self.visit(root, &next, path, visited) {
                    return Some(cycle);
                }
            }
            path.pop();
        }
        None
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.entries.lock().len())
            .finish()
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        // Registrations and controllers point at each other.
        for reg in self.entries.get_mut().values() {
            let mut st = reg.state.lock();
            st.controller = None;
            st.dependents.clear();
            st.slot = None;
        }
    }
}
