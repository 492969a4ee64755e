use std::sync::Arc;

use crate::{
    events::Bus,
    subscribers::{Subscribe, SubscriberSet},
};

use super::{config::ContainerConfig, container::ServiceContainer};

/// Builder for constructing a [`ServiceContainer`].
pub struct ContainerBuilder {
    cfg: ContainerConfig,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl ContainerBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: ContainerConfig) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
        }
    }

    /// Replaces the event subscribers.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Adds one event subscriber.
    pub fn with_subscriber<S: Subscribe>(mut self, subscriber: S) -> Self {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    /// Builds the container.
    ///
    /// Must be called inside a tokio runtime: subscriber workers are spawned here.
    pub fn build(self) -> Arc<ServiceContainer> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));

        let container = Arc::new(ServiceContainer::new_internal(self.cfg, bus, subs));
        container.subscriber_listener();
        container
    }
}
