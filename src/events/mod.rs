//! Container events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by service controllers, transactions
//! and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ServiceController` (transitions, failures, removal),
//!   `Transaction` (task failures, problems, outcomes), `SubscriberSet` workers
//!   (overflow/panic).
//! - **Consumers**: the container's subscriber listener (fans out to `SubscriberSet`)
//!   and any receiver obtained from `ServiceContainer::events()`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
