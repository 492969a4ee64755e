//! Runtime core: container, registry and the controller state machine.
//!
//! Internal modules:
//! - [`container`]: owns registries and the bus, hands out transactions, shuts down;
//! - [`registry`]: names → registrations, duplicate and cycle detection;
//! - [`controller`]: one service's lifecycle, driven by demand and dependencies;
//! - [`tasks`]: the transaction tasks a controller submits;
//! - [`listener`]: per-controller FIFO listener delivery;
//! - [`monitor`]: stability waits.

mod builder;
mod config;
mod container;
mod controller;
mod listener;
mod monitor;
mod registry;
mod tasks;

#[cfg(test)]
mod tests;

pub use builder::ContainerBuilder;
pub use config::ContainerConfig;
pub use container::ServiceContainer;
pub use controller::ServiceController;
pub use listener::{LifecycleListener, ListenerRef};
pub use monitor::{StabilityMonitor, StabilityReport, StabilityStatistics};
pub use registry::ServiceRegistry;

pub(crate) use controller::ControllerParts;

use crate::error::ContainerError;
use crate::txn::Transaction;

/// Owner-thread check for structural mutations.
pub(crate) fn ensure_owner(txn: &Transaction) -> Result<(), ContainerError> {
    txn.ensure_owner()
        .map_err(|_| ContainerError::ConcurrentModification)
}
