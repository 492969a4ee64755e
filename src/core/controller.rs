//! # ServiceController: the lifecycle state machine of one service.
//!
//! A controller reacts to its inputs (mode, demand, dependency state) by moving
//! between states and, when real work is needed, submitting a task to the current
//! transaction. All decisions are taken under the controller lock; everything that
//! touches another controller runs after the lock is released.
//!
//! ```text
//! input (demand, dependency up/failed, mode, task completion)
//!    └─► adjust counters under lock
//!    └─► drive(txn)
//!          loop {
//!            with_inner(step)  ── decides the next transition, returns effects
//!            listeners.drain() ── FIFO listener delivery, lock released
//!            apply(effects)    ── demand / publish / retain / schedule task
//!          }
//! ```
//!
//! ## Rules
//! - Tasks of one controller are chained: each depends on the previous one.
//! - A start task depends on the start tasks of the dependencies it retained in the
//!   same transaction; a stop task depends on the stop tasks of the dependents
//!   that released it. Rollback therefore undoes them in the right order.
//! - While the transaction rolls back, controllers only settle: they never start,
//!   stop or remove on their own; the task rollbacks restore the previous state.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ContainerError, StartError};
use crate::events::{Bus, Event, EventKind};
use crate::service::{
    Dependency, DependencyFlags, Mode, ServiceName, ServiceRef, StartContext, State, StopContext,
    ValueSlot,
};
use crate::subscribers::panic_message;
use crate::txn::{ExecutableRef, ExecuteContext, Problem, TaskController, Transaction, TransactionId};

use super::listener::{ListenerQueue, ListenerRef, Notice};
use super::monitor::MonitorShared;
use super::registry::{Registration, ServiceRegistry};
use super::tasks::{InstallTask, ModeTask, RemoveTask, StartTask, StopTask};

/// Everything a builder hands over to create a controller.
pub(crate) struct ControllerParts {
    pub(crate) name: ServiceName,
    pub(crate) aliases: Vec<ServiceName>,
    pub(crate) service: ServiceRef,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) mode: Mode,
    pub(crate) listeners: Vec<ListenerRef>,
    pub(crate) provided: Vec<(ServiceName, Arc<ValueSlot>)>,
}

struct Link {
    dependency: Dependency,
    registration: Arc<Registration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Start,
    Stop,
    Remove,
}

impl TaskKind {
    fn as_label(&self) -> &'static str {
        match self {
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Remove => "remove",
        }
    }
}

/// Work decided under the controller lock and carried out after it is released.
///
/// Publishing effects carry no value: the registrations read the controller's
/// current flags when they apply them.
enum Effect {
    Demand,
    PublishUp(Vec<Arc<Registration>>),
    PublishFailure(Vec<Arc<Registration>>),
    Retain,
    Schedule(TaskKind),
}

/// Tasks this controller submitted to one transaction.
struct TxnLink {
    id: TransactionId,
    last: Option<TaskController>,
    start: Option<TaskController>,
    wait_for: Vec<TaskController>,
    released_by: Vec<TaskController>,
}

impl TxnLink {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            last: None,
            start: None,
            wait_for: Vec::new(),
            released_by: Vec::new(),
        }
    }
}

struct Inner {
    mode: Mode,
    state: State,
    /// Demand received from dependents.
    demand: usize,
    /// Blocking dependencies not UP plus anti dependencies UP.
    unsatisfied: usize,
    failed_deps: usize,
    /// Dependents currently holding a retain on this controller.
    running_dependents: usize,
    demanding: bool,
    retained: bool,
    retain_rejected: bool,
    up_published: bool,
    failure_published: bool,
    removal_requested: bool,
    in_flight: bool,
    start_error: Option<StartError>,
    own: Vec<Arc<Registration>>,
    monitors: Vec<Arc<MonitorShared>>,
    stable: bool,
    txn: Option<TxnLink>,
}

fn txn_link(inner: &mut Inner, id: TransactionId) -> &mut TxnLink {
    if inner.txn.as_ref().is_some_and(|l| l.id != id) {
        inner.txn = None;
    }
    inner.txn.get_or_insert_with(|| TxnLink::new(id))
}

/// Handle to one installed service.
///
/// Obtained from [`ServiceBuilder::install`](crate::ServiceBuilder::install) or a
/// registry lookup. Queries are safe from any thread; mode changes go through a
/// transaction and are owner-thread checked.
pub struct ServiceController {
    name: ServiceName,
    aliases: Vec<ServiceName>,
    service: ServiceRef,
    links: Vec<Link>,
    provided: Vec<(ServiceName, Arc<ValueSlot>)>,
    registry: Weak<ServiceRegistry>,
    bus: Bus,
    inner: Mutex<Inner>,
    listeners: ListenerQueue,
}

impl ServiceController {
    fn new(parts: ControllerParts, registry: &Arc<ServiceRegistry>) -> Arc<Self> {
        let links = parts
            .dependencies
            .into_iter()
            .map(|dependency| Link {
                registration: registry.registration(dependency.name()),
                dependency,
            })
            .collect();
        let listeners = ListenerQueue::default();
        for l in parts.listeners {
            listeners.add(l);
        }
        Arc::new(Self {
            name: parts.name,
            aliases: parts.aliases,
            service: parts.service,
            links,
            provided: parts.provided,
            registry: Arc::downgrade(registry),
            bus: registry.bus().clone(),
            inner: Mutex::new(Inner {
                mode: parts.mode,
                state: State::New,
                demand: 0,
                unsatisfied: 0,
                failed_deps: 0,
                running_dependents: 0,
                demanding: false,
                retained: false,
                retain_rejected: false,
                up_published: false,
                failure_published: false,
                removal_requested: false,
                in_flight: false,
                start_error: None,
                own: Vec::new(),
                monitors: Vec::new(),
                stable: false,
                txn: None,
            }),
            listeners,
        })
    }

    /// Claims the names, checks for cycles and submits the install task.
    pub(crate) fn install(
        registry: &Arc<ServiceRegistry>,
        txn: &Transaction,
        parts: ControllerParts,
    ) -> Result<Arc<Self>, ContainerError> {
        let ctl = Self::new(parts, registry);
        let names: Vec<ServiceName> = std::iter::once(ctl.name.clone())
            .chain(ctl.aliases.iter().cloned())
            .collect();

        let own = match registry.claim(&ctl, &names) {
            Ok(own) => own,
            Err(e) => {
                ctl.prune_links(registry);
                return Err(e);
            }
        };
        ctl.inner.lock().own = own.clone();

        if let Some(cycle) = registry.find_cycle(&ctl) {
            ctl.abandon(registry, &own);
            return Err(ContainerError::CircularDependency {
                name: ctl.name.clone(),
                cycle,
            });
        }

        let exec: ExecutableRef = Arc::new(InstallTask::new(Arc::clone(&ctl)));
        let task = match txn.submit(format!("{}:install", ctl.name).into(), exec, &[], false) {
            Ok(task) => task,
            Err(e) => {
                ctl.abandon(registry, &own);
                return Err(e.into());
            }
        };
        ctl.mark_task(txn.id(), &task, false);
        tracing::debug!(service = %ctl.name, txn = %txn.id(), "service install submitted");
        Ok(ctl)
    }

    fn abandon(self: &Arc<Self>, registry: &ServiceRegistry, own: &[Arc<Registration>]) {
        self.inner.lock().own.clear();
        registry.unclaim(self, own);
        self.prune_links(registry);
    }

    fn prune_links(&self, registry: &ServiceRegistry) {
        for link in &self.links {
            registry.prune(link.registration.name());
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn aliases(&self) -> &[ServiceName] {
        &self.aliases
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The error of the last failed start, until cleared by retry, mode change or removal.
    pub fn start_error(&self) -> Option<StartError> {
        self.inner.lock().start_error.clone()
    }

    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.links.iter().map(|l| l.dependency.clone()).collect()
    }

    /// Required dependencies nobody provides.
    pub fn unavailable_dependencies(&self) -> Vec<ServiceName> {
        self.links
            .iter()
            .filter(|l| l.dependency.flags().is_blocking())
            .filter(|l| !l.registration.controller().is_some_and(|c| c.is_installed()))
            .map(|l| l.dependency.name().clone())
            .collect()
    }

    /// Stable state and no task in flight.
    pub fn is_stable(&self) -> bool {
        self.inner.lock().stable
    }

    pub(crate) fn demanding(&self) -> bool {
        self.inner.lock().demanding
    }

    pub(crate) fn up_published(&self) -> bool {
        self.inner.lock().up_published
    }

    pub(crate) fn failure_published(&self) -> bool {
        self.inner.lock().failure_published
    }

    pub fn add_listener(&self, listener: ListenerRef) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &ListenerRef) {
        self.listeners.remove(listener);
    }

    /// Changes the mode within `txn`.
    ///
    /// Takes effect when the queued mode task executes. Fails with
    /// `ConcurrentModification` off the transaction owner thread and with
    /// `IllegalState` once the service is removed or removal is pending.
    pub fn set_mode(self: &Arc<Self>, txn: &Transaction, mode: Mode) -> Result<(), ContainerError> {
        super::ensure_owner(txn)?;
        self.request_mode(txn, Some(mode))
    }

    /// Shorthand for `set_mode(txn, Mode::Remove)`.
    pub fn remove(self: &Arc<Self>, txn: &Transaction) -> Result<(), ContainerError> {
        self.set_mode(txn, Mode::Remove)
    }

    /// Clears a start failure so the controller tries again.
    pub fn retry(self: &Arc<Self>, txn: &Transaction) -> Result<(), ContainerError> {
        super::ensure_owner(txn)?;
        self.request_mode(txn, None)
    }

    fn request_mode(self: &Arc<Self>, txn: &Transaction, mode: Option<Mode>) -> Result<(), ContainerError> {
        txn.ensure_accepts_tasks("set_mode")?;
        self.with_inner(|inner| {
            if inner.state.is_gone() {
                return Err(ContainerError::illegal(format!("service {} is gone", self.name)));
            }
            if inner.removal_requested {
                return Err(ContainerError::illegal(format!(
                    "service {} is being removed",
                    self.name
                )));
            }
            if mode == Some(Mode::Remove) {
                inner.removal_requested = true;
            }
            Ok(())
        })?;
        if let Err(e) = self.schedule_mode(txn, mode) {
            if mode == Some(Mode::Remove) {
                self.inner.lock().removal_requested = false;
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn schedule_mode(
        self: &Arc<Self>,
        txn: &Transaction,
        mode: Option<Mode>,
    ) -> Result<TaskController, crate::error::TransactionError> {
        let deps: Vec<TaskController> = self
            .with_inner(|inner| txn_link(inner, txn.id()).last.clone())
            .into_iter()
            .collect();
        let label = mode.map_or("retry", |m| m.as_label());
        let exec: ExecutableRef = Arc::new(ModeTask::new(Arc::clone(self), mode));
        let task = txn.submit(format!("{}:mode:{label}", self.name).into(), exec, &deps, false)?;
        self.mark_task(txn.id(), &task, false);
        Ok(task)
    }

    /// Records `task` as the latest of this controller in `txn`.
    pub(crate) fn mark_task(&self, id: TransactionId, task: &TaskController, is_start: bool) {
        self.with_inner(|inner| {
            let link = txn_link(inner, id);
            if link.last.as_ref().map_or(true, |l| l.id() < task.id()) {
                link.last = Some(task.clone());
            }
            if is_start && link.start.as_ref().map_or(true, |s| s.id() < task.id()) {
                link.start = Some(task.clone());
            }
        });
    }

    pub(crate) fn is_installed(&self) -> bool {
        let state = self.state();
        state != State::New && !state.is_gone()
    }

    pub(crate) fn slot_for(&self, name: &ServiceName) -> Option<Arc<ValueSlot>> {
        self.provided
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| Arc::clone(slot))
    }

    fn clear_values(&self) {
        for (_, slot) in &self.provided {
            slot.clear();
        }
    }

    // ---------------------------
    // Lock discipline
    // ---------------------------

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock();
        let out = f(&mut inner);
        self.note_stability(&mut inner);
        out
    }

    fn note_stability(&self, inner: &mut Inner) {
        let stable = inner.state.is_stable() && !inner.in_flight;
        if stable != inner.stable {
            inner.stable = stable;
            for m in &inner.monitors {
                m.adjust(stable);
            }
        }
    }

    fn set_state(&self, inner: &mut Inner, to: State, txn: Option<TransactionId>) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(service = %self.name, %from, %to, "service transition");
        self.listeners.push(Notice::Transition(from, to));
        let mut ev = Event::new(EventKind::ServiceTransition)
            .with_service(&self.name)
            .with_transition(from, to);
        if let Some(id) = txn {
            ev = ev.with_txn(id);
        }
        self.bus.publish(ev);
    }

    pub(crate) fn attach_monitor(&self, monitor: &Arc<MonitorShared>) -> bool {
        self.with_inner(|inner| {
            if inner.monitors.iter().any(|m| Arc::ptr_eq(m, monitor)) {
                return false;
            }
            if !inner.stable {
                monitor.adjust(false);
            }
            inner.monitors.push(Arc::clone(monitor));
            true
        })
    }

    pub(crate) fn detach_monitor(&self, monitor: &Arc<MonitorShared>) -> bool {
        self.with_inner(|inner| {
            let Some(pos) = inner.monitors.iter().position(|m| Arc::ptr_eq(m, monitor)) else {
                return false;
            };
            inner.monitors.remove(pos);
            if !inner.stable {
                monitor.adjust(true);
            }
            true
        })
    }

    // ---------------------------
    // Inputs, called under a registration lock
    // ---------------------------

    pub(crate) fn seed_dependency(&self, flags: DependencyFlags, up: bool, failed: bool) {
        self.with_inner(|inner| {
            if (flags.is_blocking() && !up) || (flags.is_anti() && up) {
                inner.unsatisfied += 1;
            }
            if flags.is_blocking() && failed {
                self.count_failure(inner, true);
            }
            inner.retain_rejected = false;
        });
    }

    pub(crate) fn dependency_up_changed(&self, flags: DependencyFlags, up: bool) {
        self.with_inner(|inner| {
            let blocks = if flags.is_blocking() {
                !up
            } else if flags.is_anti() {
                up
            } else {
                return;
            };
            if blocks {
                inner.unsatisfied += 1;
            } else {
                inner.unsatisfied = inner.unsatisfied.saturating_sub(1);
            }
            inner.retain_rejected = false;
        });
    }

    pub(crate) fn dependency_failure_changed(&self, failed: bool) {
        self.with_inner(|inner| {
            self.count_failure(inner, failed);
            inner.retain_rejected = false;
        });
    }

    pub(crate) fn adjust_demand(&self, delta: isize) {
        self.with_inner(|inner| {
            inner.demand = inner.demand.saturating_add_signed(delta);
            inner.retain_rejected = false;
        });
    }

    /// Counts failed dependencies; listeners hear only the 0→1 and 1→0 edges.
    fn count_failure(&self, inner: &mut Inner, failed: bool) {
        let notice = if failed {
            inner.failed_deps += 1;
            (inner.failed_deps == 1).then_some((Notice::DependencyFailed, EventKind::DependencyFailed))
        } else {
            if inner.failed_deps == 0 {
                return;
            }
            inner.failed_deps -= 1;
            (inner.failed_deps == 0).then_some((
                Notice::DependencyFailureCleared,
                EventKind::DependencyFailureCleared,
            ))
        };
        if let Some((notice, kind)) = notice {
            if inner.state.is_gone() {
                return;
            }
            self.listeners.push(notice);
            self.bus.publish(Event::new(kind).with_service(&self.name));
        }
    }

    // ---------------------------
    // Retain / release protocol
    // ---------------------------

    /// Registers a running dependent; `None` unless this controller is UP.
    ///
    /// On success returns this controller's start task in `txn`, if any.
    fn try_retain(&self, txn: TransactionId) -> Option<Option<TaskController>> {
        self.with_inner(|inner| {
            if inner.state != State::Up {
                return None;
            }
            inner.running_dependents += 1;
            Some(
                inner
                    .txn
                    .as_ref()
                    .filter(|l| l.id == txn)
                    .and_then(|l| l.start.clone()),
            )
        })
    }

    fn release(self: &Arc<Self>, txn: &Transaction, by: Option<TaskController>) {
        self.with_inner(|inner| {
            inner.running_dependents = inner.running_dependents.saturating_sub(1);
            if let Some(by) = by {
                txn_link(inner, txn.id()).released_by.push(by);
            }
        });
        self.drive(txn);
    }

    fn blocking_providers(&self) -> impl Iterator<Item = Option<Arc<ServiceController>>> + '_ {
        self.links
            .iter()
            .filter(|l| l.dependency.flags().is_blocking())
            .map(|l| l.registration.controller())
    }

    /// Retains every blocking dependency, or none of them.
    fn retain_all(&self, txn: &Transaction) -> Option<Vec<TaskController>> {
        let mut retained: Vec<Arc<ServiceController>> = Vec::new();
        let mut started = Vec::new();
        for provider in self.blocking_providers() {
            match provider.and_then(|p| p.try_retain(txn.id()).map(|s| (p, s))) {
                Some((p, s)) => {
                    started.extend(s);
                    retained.push(p);
                }
                None => {
                    for p in retained {
                        p.release(txn, None);
                    }
                    return None;
                }
            }
        }
        Some(started)
    }

    fn release_dependencies(self: &Arc<Self>, txn: &Transaction, by: Option<&TaskController>) {
        let was = self.with_inner(|inner| std::mem::replace(&mut inner.retained, false));
        if !was {
            return;
        }
        let providers: Vec<Arc<ServiceController>> = self.blocking_providers().flatten().collect();
        for p in providers {
            p.release(txn, by.cloned());
        }
    }

    fn retain_dependencies(self: &Arc<Self>, txn: &Transaction) {
        let started = self.retain_all(txn);
        let ok = started.is_some();
        let proceed = self.with_inner(|inner| {
            if inner.state != State::StartRequested {
                return false;
            }
            match started {
                Some(started) => {
                    inner.retained = true;
                    inner.in_flight = true;
                    txn_link(inner, txn.id()).wait_for = started;
                    self.set_state(inner, State::Starting, Some(txn.id()));
                    true
                }
                None => {
                    inner.retain_rejected = true;
                    self.set_state(inner, State::Down, Some(txn.id()));
                    false
                }
            }
        });
        if proceed {
            self.schedule(TaskKind::Start, txn);
        } else if ok {
            // Moved on while retaining; give the retains back.
            self.with_inner(|inner| inner.retained = true);
            self.release_dependencies(txn, None);
        }
    }

    // ---------------------------
    // State machine
    // ---------------------------

    fn should_start(inner: &Inner) -> bool {
        match inner.mode {
            Mode::Active => true,
            Mode::OnDemand => inner.demand > 0,
            Mode::Lazy => {
                inner.demand > 0
                    || matches!(
                        inner.state,
                        State::StartRequested | State::Starting | State::Up | State::StopRequested
                    )
            }
            Mode::Passive => inner.demand > 0 || (inner.unsatisfied == 0 && inner.failed_deps == 0),
            Mode::Never | Mode::Remove => false,
        }
    }

    fn should_demand(inner: &Inner) -> bool {
        match inner.mode {
            Mode::Active => true,
            Mode::Lazy => Self::should_start(inner),
            Mode::OnDemand | Mode::Passive => inner.demand > 0,
            Mode::Never | Mode::Remove => false,
        }
    }

    /// Decides one transition. Returns the effects to apply outside the lock and
    /// whether the state changed.
    fn step(&self, inner: &mut Inner, txn: &Transaction) -> (Vec<Effect>, bool) {
        let mut fx = Vec::new();
        if inner.state == State::New || inner.state.is_gone() {
            return (fx, false);
        }
        let rolling_back = txn.is_rolling_back();

        let demand = Self::should_demand(inner);
        if demand != inner.demanding {
            inner.demanding = demand;
            fx.push(Effect::Demand);
        }
        let up = inner.state == State::Up;
        if up != inner.up_published {
            inner.up_published = up;
            fx.push(Effect::PublishUp(inner.own.clone()));
        }
        let failed = inner.state == State::StartFailed;
        if failed != inner.failure_published {
            inner.failure_published = failed;
            fx.push(Effect::PublishFailure(inner.own.clone()));
        }
        if inner.in_flight {
            return (fx, false);
        }

        let wants = Self::should_start(inner);
        let next = match inner.state {
            State::Down if !rolling_back => {
                if inner.mode == Mode::Remove {
                    Some(State::Removing)
                } else if wants && inner.failed_deps > 0 {
                    Some(State::StartFailed)
                } else if wants && inner.unsatisfied == 0 && !inner.retain_rejected {
                    Some(State::StartRequested)
                } else {
                    None
                }
            }
            State::Up if !rolling_back && (!wants || inner.unsatisfied > 0) => Some(State::StopRequested),
            State::StopRequested => {
                if wants && inner.unsatisfied == 0 {
                    Some(State::Up)
                } else if !rolling_back && inner.running_dependents == 0 {
                    Some(State::Stopping)
                } else {
                    None
                }
            }
            State::StartFailed => {
                let clear = if inner.start_error.is_some() {
                    !rolling_back && !wants
                } else {
                    inner.failed_deps == 0 || !wants
                };
                clear.then_some(State::Down)
            }
            _ => None,
        };
        let Some(to) = next else {
            return (fx, false);
        };

        match to {
            State::Removing => {
                inner.in_flight = true;
                fx.push(Effect::Schedule(TaskKind::Remove));
            }
            State::Stopping => {
                inner.in_flight = true;
                fx.push(Effect::Schedule(TaskKind::Stop));
            }
            State::StartRequested => fx.push(Effect::Retain),
            State::Down => inner.start_error = None,
            _ => {}
        }
        self.set_state(inner, to, Some(txn.id()));
        (fx, true)
    }

    /// Re-evaluates until nothing changes.
    pub(crate) fn drive(self: &Arc<Self>, txn: &Transaction) {
        loop {
            let (effects, progressed) = self.with_inner(|inner| self.step(inner, txn));
            self.listeners.drain(self);
            if effects.is_empty() && !progressed {
                return;
            }
            for effect in effects {
                self.apply(effect, txn);
            }
        }
    }

    fn apply(self: &Arc<Self>, effect: Effect, txn: &Transaction) {
        match effect {
            Effect::Demand => {
                for link in &self.links {
                    link.registration.sync_demand(self, txn);
                }
            }
            Effect::PublishUp(regs) => {
                for reg in regs {
                    reg.sync_up(self, txn);
                }
            }
            Effect::PublishFailure(regs) => {
                for reg in regs {
                    reg.sync_failed(self, txn);
                }
            }
            Effect::Retain => self.retain_dependencies(txn),
            Effect::Schedule(kind) => self.schedule(kind, txn),
        }
    }

    fn schedule(self: &Arc<Self>, kind: TaskKind, txn: &Transaction) {
        let deps = self.with_inner(|inner| {
            let link = txn_link(inner, txn.id());
            let mut deps: Vec<TaskController> = link.last.iter().cloned().collect();
            match kind {
                TaskKind::Start => deps.append(&mut link.wait_for),
                TaskKind::Stop => deps.append(&mut link.released_by),
                TaskKind::Remove => {}
            }
            deps
        });
        let owner = txn.downgrade();
        let exec: ExecutableRef = match kind {
            TaskKind::Start => Arc::new(StartTask::new(Arc::clone(self), owner)),
            TaskKind::Stop => Arc::new(StopTask::new(Arc::clone(self), owner)),
            TaskKind::Remove => Arc::new(RemoveTask::new(Arc::clone(self), owner)),
        };
        let name = format!("{}:{}", self.name, kind.as_label());
        match txn.submit(name.into(), exec, &deps, false) {
            Ok(task) => self.mark_task(txn.id(), &task, kind == TaskKind::Start),
            Err(e) => {
                tracing::debug!(service = %self.name, task = kind.as_label(), error = %e, "task not scheduled");
                self.task_cancelled(kind, txn);
            }
        }
    }

    /// Undoes the transition that scheduled a task which never ran.
    pub(crate) fn task_cancelled(self: &Arc<Self>, kind: TaskKind, txn: &Transaction) {
        let release = self.with_inner(|inner| {
            let (expected, back) = match kind {
                TaskKind::Start => (State::Starting, State::Down),
                TaskKind::Stop => (State::Stopping, State::StopRequested),
                TaskKind::Remove => (State::Removing, State::Down),
            };
            if inner.state != expected {
                return false;
            }
            inner.in_flight = false;
            self.set_state(inner, back, Some(txn.id()));
            kind == TaskKind::Start
        });
        if release {
            self.release_dependencies(txn, None);
        }
        self.drive(txn);
    }

    // ---------------------------
    // Task bodies
    // ---------------------------

    /// Install execute: links to dependencies and leaves NEW.
    pub(crate) fn wire(self: &Arc<Self>, txn: &Transaction) {
        for link in &self.links {
            link.registration.add_dependent(self, link.dependency.flags());
        }
        self.with_inner(|inner| {
            if inner.state == State::New {
                self.set_state(inner, State::Down, Some(txn.id()));
            }
        });
        self.drive(txn);
    }

    pub(crate) fn validate_install(self: &Arc<Self>, problems: &mut Vec<Problem>) {
        for link in &self.links {
            let flags = link.dependency.flags();
            if !flags.reports_missing() {
                continue;
            }
            if !link.registration.controller().is_some_and(|c| c.is_installed()) {
                problems.push(
                    Problem::warning(format!("missing dependency {}", link.dependency.name()))
                        .with_subject(&self.name),
                );
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            if let Some(cycle) = registry.find_cycle(self) {
                let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
                problems.push(
                    Problem::error(format!("dependency cycle {}", path.join(" -> ")))
                        .with_subject(&self.name),
                );
            }
        }
    }

    /// Install rollback: unlinks everything and becomes CANCELLED.
    pub(crate) fn uninstall(self: &Arc<Self>, txn: &Transaction) {
        let Some((own, effects)) = self.with_inner(|inner| {
            if inner.state.is_gone() {
                return None;
            }
            let mut fx = Vec::new();
            if std::mem::replace(&mut inner.demanding, false) {
                fx.push(Effect::Demand);
            }
            if std::mem::replace(&mut inner.up_published, false) {
                fx.push(Effect::PublishUp(inner.own.clone()));
            }
            if std::mem::replace(&mut inner.failure_published, false) {
                fx.push(Effect::PublishFailure(inner.own.clone()));
            }
            inner.in_flight = false;
            self.set_state(inner, State::Cancelled, Some(txn.id()));
            Some((std::mem::take(&mut inner.own), fx))
        }) else {
            return;
        };
        for effect in effects {
            self.apply(effect, txn);
        }
        self.clear_values();
        self.unregister(&own);
        self.bus.publish(
            Event::new(EventKind::ServiceCancelled)
                .with_service(&self.name)
                .with_txn(txn.id()),
        );
        self.listeners.drain(self);
    }

    /// Install cancelled before it ran.
    pub(crate) fn discard(self: &Arc<Self>) {
        let Some(own) = self.with_inner(|inner| {
            if inner.state != State::New {
                return None;
            }
            self.set_state(inner, State::Cancelled, None);
            Some(std::mem::take(&mut inner.own))
        }) else {
            return;
        };
        if let Some(registry) = self.registry.upgrade() {
            registry.unclaim(self, &own);
            self.prune_links(&registry);
        }
        self.bus
            .publish(Event::new(EventKind::ServiceCancelled).with_service(&self.name));
        self.listeners.drain(self);
    }

    fn unregister(self: &Arc<Self>, own: &[Arc<Registration>]) {
        for link in &self.links {
            link.registration.remove_dependent(self);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unclaim(self, own);
            self.prune_links(&registry);
        }
    }

    /// Mode task execute. Returns what to restore on rollback.
    pub(crate) fn apply_mode(
        self: &Arc<Self>,
        txn: &Transaction,
        mode: Option<Mode>,
    ) -> Option<(Mode, Option<StartError>)> {
        let (previous, own) = self.with_inner(|inner| {
            if inner.state.is_gone() {
                return (None, Vec::new());
            }
            let previous = (inner.mode, inner.start_error.take());
            if let Some(mode) = mode {
                inner.mode = mode;
            }
            inner.retain_rejected = false;
            if previous.1.is_some() && inner.state == State::StartFailed {
                self.set_state(inner, State::Down, Some(txn.id()));
            }
            (Some(previous), inner.own.clone())
        });
        if previous.is_some() && mode == Some(Mode::Remove) {
            for reg in &own {
                for child in reg.dependents_with(DependencyFlags::PARENT) {
                    child.cascade_removal(txn);
                }
            }
        }
        self.drive(txn);
        previous
    }

    fn cascade_removal(self: &Arc<Self>, txn: &Transaction) {
        let first = self.with_inner(|inner| {
            !inner.state.is_gone() && !std::mem::replace(&mut inner.removal_requested, true)
        });
        if !first {
            return;
        }
        tracing::debug!(service = %self.name, "parent removed, removing child");
        if let Err(e) = self.schedule_mode(txn, Some(Mode::Remove)) {
            self.inner.lock().removal_requested = false;
            tracing::warn!(service = %self.name, error = %e, "child removal not scheduled");
        }
    }

    /// Mode task cancelled before it ran.
    pub(crate) fn mode_cancelled(&self, requested: Option<Mode>) {
        if requested == Some(Mode::Remove) {
            self.inner.lock().removal_requested = false;
        }
    }

    /// Mode task rollback.
    pub(crate) fn restore_mode(
        self: &Arc<Self>,
        txn: &Transaction,
        requested: Option<Mode>,
        previous: (Mode, Option<StartError>),
    ) {
        self.with_inner(|inner| {
            if inner.state.is_gone() {
                return;
            }
            inner.mode = previous.0;
            if requested == Some(Mode::Remove) {
                inner.removal_requested = false;
            }
            inner.retain_rejected = false;
            if let Some(error) = previous.1 {
                inner.start_error = Some(error);
                if inner.state == State::Down {
                    self.set_state(inner, State::StartFailed, Some(txn.id()));
                }
            }
        });
        self.drive(txn);
    }

    async fn run_start(&self, token: CancellationToken, txn: TransactionId) -> Result<(), StartError> {
        let ctx = StartContext::new(self.name.clone(), txn, token);
        match AssertUnwindSafe(self.service.start(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StartError::new(format!(
                "start panicked: {}",
                panic_message(&*panic)
            ))),
        }
    }

    async fn run_stop(&self, txn: TransactionId) {
        let ctx = StopContext::new(self.name.clone(), txn);
        if let Err(panic) = AssertUnwindSafe(self.service.stop(&ctx)).catch_unwind().await {
            tracing::error!(service = %self.name, panic = %panic_message(&*panic), "stop panicked");
        }
        self.clear_values();
    }

    /// Start task execute.
    pub(crate) async fn start_service(self: &Arc<Self>, ctx: &ExecuteContext) {
        let txn = ctx.transaction();
        let result = self.run_start(ctx.cancellation(), txn.id()).await;
        self.with_inner(|inner| {
            inner.in_flight = false;
            match &result {
                Ok(()) => self.set_state(inner, State::Up, Some(txn.id())),
                Err(e) => {
                    inner.start_error = Some(e.clone());
                    self.set_state(inner, State::StartFailed, Some(txn.id()));
                }
            }
        });
        if let Err(e) = result {
            tracing::warn!(service = %self.name, error = %e, "service failed to start");
            self.bus.publish(
                Event::new(EventKind::StartFailed)
                    .with_service(&self.name)
                    .with_txn(txn.id())
                    .with_reason(e.message()),
            );
            ctx.add_problem(
                Problem::error(format!("service {} failed to start", self.name))
                    .with_subject(&self.name)
                    .with_cause(Arc::new(e)),
            );
            self.clear_values();
            self.release_dependencies(txn, Some(ctx.task()));
        }
        self.drive(txn);
    }

    /// Start task rollback: stops the service again.
    pub(crate) async fn undo_start(self: &Arc<Self>, txn: &Transaction) {
        let stop = self.with_inner(|inner| match inner.state {
            State::Up | State::StopRequested => {
                inner.in_flight = true;
                self.set_state(inner, State::Stopping, Some(txn.id()));
                true
            }
            State::StartFailed if inner.start_error.is_some() => {
                inner.start_error = None;
                self.set_state(inner, State::Down, Some(txn.id()));
                false
            }
            _ => false,
        });
        self.drive(txn);
        if stop {
            self.run_stop(txn.id()).await;
            self.with_inner(|inner| {
                inner.in_flight = false;
                self.set_state(inner, State::Down, Some(txn.id()));
            });
            self.release_dependencies(txn, None);
            self.drive(txn);
        }
    }

    /// Stop task execute.
    pub(crate) async fn stop_service(self: &Arc<Self>, ctx: &ExecuteContext) {
        let txn = ctx.transaction();
        self.run_stop(txn.id()).await;
        self.with_inner(|inner| {
            inner.in_flight = false;
            self.set_state(inner, State::Down, Some(txn.id()));
        });
        self.release_dependencies(txn, Some(ctx.task()));
        self.drive(txn);
    }

    /// Stop task rollback: starts the service again if its dependencies allow.
    pub(crate) async fn undo_stop(self: &Arc<Self>, txn: &Transaction) {
        let go = self.with_inner(|inner| {
            if inner.state != State::Down || inner.unsatisfied > 0 || inner.failed_deps > 0 {
                return false;
            }
            inner.in_flight = true;
            self.set_state(inner, State::Starting, Some(txn.id()));
            true
        });
        if !go {
            tracing::debug!(service = %self.name, "stop not undone, dependencies are down");
            return;
        }
        if self.retain_all(txn).is_none() {
            self.with_inner(|inner| {
                inner.in_flight = false;
                self.set_state(inner, State::Down, Some(txn.id()));
            });
            self.drive(txn);
            return;
        }
        self.with_inner(|inner| inner.retained = true);

        // The transaction token is already cancelled here.
        let result = self.run_start(CancellationToken::new(), txn.id()).await;
        let failed = result.is_err();
        self.with_inner(|inner| {
            inner.in_flight = false;
            match result {
                Ok(()) => self.set_state(inner, State::Up, Some(txn.id())),
                Err(e) => {
                    tracing::warn!(service = %self.name, error = %e, "restart during rollback failed");
                    inner.start_error = Some(e);
                    self.set_state(inner, State::StartFailed, Some(txn.id()));
                }
            }
        });
        if failed {
            self.release_dependencies(txn, None);
        }
        self.drive(txn);
    }

    /// Remove task execute.
    pub(crate) fn removal_executed(&self) {
        self.with_inner(|inner| inner.in_flight = false);
    }

    /// Remove task rollback.
    pub(crate) fn undo_removal(self: &Arc<Self>, txn: &Transaction) {
        self.with_inner(|inner| {
            if inner.state == State::Removing {
                inner.in_flight = false;
                self.set_state(inner, State::Down, Some(txn.id()));
            }
        });
        self.drive(txn);
    }

    /// Remove task commit: leaves the registry for good.
    pub(crate) fn finish_removal(self: &Arc<Self>, txn: &Transaction) {
        let Some(own) = self.with_inner(|inner| {
            if inner.state != State::Removing {
                return None;
            }
            self.set_state(inner, State::Removed, Some(txn.id()));
            Some(std::mem::take(&mut inner.own))
        }) else {
            return;
        };
        self.unregister(&own);
        self.listeners.push(Notice::Removed);
        self.listeners.drain(self);
        tracing::debug!(service = %self.name, "service removed");
        self.bus.publish(
            Event::new(EventKind::ServiceRemoved)
                .with_service(&self.name)
                .with_txn(txn.id()),
        );
    }

    pub(crate) fn publish_installed(&self, txn: &Transaction) {
        self.bus.publish(
            Event::new(EventKind::ServiceInstalled)
                .with_service(&self.name)
                .with_txn(txn.id()),
        );
    }
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServiceController")
            .field("name", &self.name)
            .field("mode", &inner.mode)
            .field("state", &inner.state)
            .field("demand", &inner.demand)
            .field("unsatisfied", &inner.unsatisfied)
            .field("failed_deps", &inner.failed_deps)
            .field("running_dependents", &inner.running_dependents)
            .finish()
    }
}
