//! # svcgraph
//!
//! **svcgraph** is a dependency-aware service lifecycle container for Rust.
//!
//! Services are installed into named registries, declare dependencies on each
//! other and are started and stopped automatically as their modes, demand and
//! dependencies change. Every change happens inside a transaction that can be
//! prepared, committed or rolled back as a unit.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!            ┌───────────────┐  ┌───────────────┐  ┌───────────────┐
//!            │ServiceBuilder │  │ServiceBuilder │  │ServiceBuilder │
//!            │ (user svc #1) │  │ (user svc #2) │  │ (user svc #3) │
//!            └──────┬────────┘  └──────┬────────┘  └──────┬────────┘
//!                   ▼ install()        ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ServiceRegistry (names → registrations, duplicates, cycles)      │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐
//!  │ServiceControl.│◄─┤ServiceControl.│◄─┤ServiceControl.│  demand / up / failed
//!  │ state machine │  │ state machine │  │ state machine │  flow along dependencies
//!  └──────┬────────┘  └──────┬────────┘  └──────┬────────┘
//!         │ install/start/stop/remove tasks     │
//!         ▼                                     ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Transaction (task DAG: prepare ─► commit | rollback)             │
//! │  - forward walk in dependency order, reverse walk on rollback     │
//! │  - problems (INFO..CRITICAL) gate prepare and commit              │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                 Bus (broadcast) ──► SubscriberSet ──► Subscribe workers
//! ```
//!
//! ### Lifecycle
//! ```text
//! container.begin().await            one update transaction at a time
//!   ├─ registry.target(&txn).add_service(name)...install()
//!   ├─ controller.set_mode(&txn, mode) / remove / retry
//!   ├─ txn.prepare().await           runs every task, then validation
//!   └─ txn.commit().await            or txn.rollback().await
//!
//! StabilityMonitor::await_stability() resolves once every tracked
//! controller is DOWN, UP, START_FAILED, REMOVED or CANCELLED with no task in flight.
//! ```
//!
//! ## Features
//! | Area              | Description                                                    | Key types / traits                              |
//! |-------------------|----------------------------------------------------------------|-------------------------------------------------|
//! | **Container**     | Registries, update gate, shutdown.                             | [`ServiceContainer`], [`ContainerConfig`]       |
//! | **Services**      | User start/stop logic and installation.                        | [`Service`], [`ServiceBuilder`], [`ServiceTarget`] |
//! | **Lifecycle**     | Modes, states, listeners, stability waits.                     | [`Mode`], [`State`], [`LifecycleListener`], [`StabilityMonitor`] |
//! | **Transactions**  | Task DAG with prepare/commit/rollback and problem reports.     | [`Transaction`], [`Executable`], [`Problem`]    |
//! | **Values**        | Values handed from providers to dependents.                    | [`Supplier`], [`Consumer`], [`Value`]           |
//! | **Subscriber API**| Hook into container events (logging, metrics, custom).         | [`Subscribe`], [`Event`]                        |
//! | **Errors**        | Typed errors for the API, transactions and services.           | [`ContainerError`], [`TransactionError`], [`StartError`] |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use svcgraph::{
//!     ContainerConfig, DependencyFlags, ServiceContainer, ServiceFn, ServiceName,
//!     StabilityMonitor, StartContext, StartError, State,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = ServiceContainer::builder(ContainerConfig::default()).build();
//!     let monitor = StabilityMonitor::new();
//!
//!     let txn = container.begin().await?;
//!     let mut target = container.registry().target(&txn);
//!     target.add_monitor(&monitor)?;
//!
//!     target
//!         .add_service(ServiceName::of("db"))?
//!         .set_service(ServiceFn::new(|ctx: StartContext| async move {
//!             println!("starting {}", ctx.name());
//!             Ok::<_, StartError>(())
//!         }))?
//!         .install()?;
//!     let web = target
//!         .add_service(ServiceName::of("web"))?
//!         .add_dependency(ServiceName::of("db"), DependencyFlags::REQUIRED)?
//!         .install()?;
//!
//!     txn.prepare().await?;
//!     txn.commit().await?;
//!     assert!(monitor.await_stability().await.is_clean());
//!     assert_eq!(web.state(), State::Up);
//!
//!     container.shutdown().await?;
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod service;
mod subscribers;
mod txn;

// ---- Public re-exports ----

pub use core::{
    ContainerBuilder, ContainerConfig, LifecycleListener, ListenerRef, ServiceContainer,
    ServiceController, ServiceRegistry, StabilityMonitor, StabilityReport, StabilityStatistics,
};
pub use error::{ContainerError, StartError, TaskError, TransactionError};
pub use events::{Bus, Event, EventKind};
pub use service::{
    CachedValue, CompositeValue, Consumer, Dependency, DependencyFlags, Mode, NullService,
    Service, ServiceBuilder, ServiceFn, ServiceName, ServiceRef, ServiceTarget, StartContext,
    State, StopContext, Supplier, Value,
};
pub use subscribers::{Subscribe, SubscriberSet};
pub use txn::{
    Executable, ExecutableRef, ExecuteContext, Phase, Problem, ProblemReport, Severity,
    TaskController, TaskFn, TaskStatus, Transaction, TransactionId, ValidateContext,
};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
