//! Service definitions: names, dependencies, modes, values and builders.
//!
//! ## Contents
//! - [`ServiceName`] dotted hierarchical names
//! - [`Dependency`], [`DependencyFlags`] edges between services
//! - [`Mode`], [`State`] what a controller is asked to do and where it is
//! - [`Service`], [`ServiceFn`], [`NullService`] the user's start/stop logic
//! - [`Supplier`], [`Consumer`], [`Value`] values passed between services
//! - [`ServiceTarget`], [`ServiceBuilder`] installation inside a transaction

mod builder;
mod dependency;
mod mode;
mod name;
mod service;
mod value;

pub use builder::{ServiceBuilder, ServiceTarget};
pub use dependency::{Dependency, DependencyFlags};
pub use mode::{Mode, State};
pub use name::ServiceName;
pub use service::{NullService, Service, ServiceFn, ServiceRef, StartContext, StopContext};
pub use value::{CachedValue, CompositeValue, Consumer, Supplier, Value};

pub(crate) use value::ValueSlot;
