//! # The service contract.
//!
//! A [`Service`] is started and stopped by its controller from inside transaction
//! tasks. Start may fail with a [`StartError`]; stop cannot fail.
//!
//! Values a service consumes or provides are wired through the
//! [`Supplier`](crate::Supplier)/[`Consumer`](crate::Consumer) handles returned by
//! the builder, captured by the service itself.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StartError;
use crate::txn::TransactionId;

use super::name::ServiceName;

/// Passed to [`Service::start`].
#[derive(Clone, Debug)]
pub struct StartContext {
    name: ServiceName,
    txn: TransactionId,
    token: CancellationToken,
}

impl StartContext {
    pub(crate) fn new(name: ServiceName, txn: TransactionId, token: CancellationToken) -> Self {
        Self { name, txn, token }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }

    /// Fires when rollback of the owning transaction is requested.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

/// Passed to [`Service::stop`].
#[derive(Clone, Debug)]
pub struct StopContext {
    name: ServiceName,
    txn: TransactionId,
}

impl StopContext {
    pub(crate) fn new(name: ServiceName, txn: TransactionId) -> Self {
        Self { name, txn }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }
}

/// # A managed service.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use svcgraph::{Service, StartContext, StartError, StopContext};
///
/// struct Listener;
///
/// #[async_trait]
/// impl Service for Listener {
///     async fn start(&self, ctx: &StartContext) -> Result<(), StartError> {
///         if ctx.cancellation().is_cancelled() {
///             return Err(StartError::new("rolled back"));
///         }
///         Ok(())
///     }
///
///     async fn stop(&self, _ctx: &StopContext) {}
/// }
/// ```
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn start(&self, ctx: &StartContext) -> Result<(), StartError>;

    async fn stop(&self, ctx: &StopContext) {
        let _ = ctx;
    }
}

/// Shared handle to a service.
pub type ServiceRef = Arc<dyn Service>;

/// A service that does nothing; the default instance of a builder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullService;

#[async_trait]
impl Service for NullService {
    async fn start(&self, _ctx: &StartContext) -> Result<(), StartError> {
        Ok(())
    }
}

/// Function-backed service: a closure producing a fresh start future; stop is a no-op.
///
/// ```
/// use svcgraph::{ServiceFn, StartContext, StartError};
///
/// let svc = ServiceFn::new(|ctx: StartContext| async move {
///     tracing::info!(service = %ctx.name(), "starting");
///     Ok::<_, StartError>(())
/// });
/// # let _ = svc;
/// ```
pub struct ServiceFn<F> {
    f: F,
}

impl<F> ServiceFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(StartContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StartError>> + Send + 'static,
{
    async fn start(&self, ctx: &StartContext) -> Result<(), StartError> {
        (self.f)(ctx.clone()).await
    }
}
