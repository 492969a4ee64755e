//! # Event subscribers
//!
//! A [`Subscribe`] implementation receives the container's event stream: state
//! transitions, start failures, dependency failure notices and transaction
//! outcomes. The [`SubscriberSet`](crate::SubscriberSet) gives each subscriber
//! its own bounded queue and worker task, so a subscriber that writes to disk or
//! the network never holds up a controller.
//!
//! A full queue drops the event for that subscriber only and publishes a
//! `SubscriberOverflow` event in its place.
//!
//! ## Example
//! ```rust
//! use svcgraph::{Event, EventKind, Subscribe};
//!
//! struct RemovalAudit;
//!
//! #[async_trait::async_trait]
//! impl Subscribe for RemovalAudit {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.kind == EventKind::ServiceRemoved {
//!             println!("removed {:?} in txn {:?}", ev.service, ev.txn);
//!         }
//!     }
//!     fn name(&self) -> &'static str { "removal-audit" }
//!     fn queue_capacity(&self) -> usize { 512 }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Consumer of container events, driven by its own worker task.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &Event);

    /// Name used in overflow/panic events and logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this subscriber's queue (at least 1 is used).
    fn queue_capacity(&self) -> usize {
        1024
    }
}
