//! # Example: lifecycle_demo
//!
//! Installs a small service graph, watches it settle, breaks one service and
//! shuts everything down.
//!
//! Shows how to:
//! - Install services with dependencies through a [`ServiceTarget`].
//! - Pass a value from a provider to its dependent with `provides`/`requires`.
//! - Wait for the graph to settle with a [`StabilityMonitor`].
//! - React to a failed start with a [`LifecycleListener`] and `retry`.
//!
//! ## Flow
//! ```text
//! txn 1: install config ◄── db ◄── api        (api also needs cache, ON_DEMAND)
//!        prepare + commit ──► db START_FAILED, api blocked
//! retry: db              ──► db UP, api UP
//! txn 2: api NEVER       ──► api stops; cache loses its demand and stops
//! txn 3: api ACTIVE      ──► everything UP again
//! shutdown()             ──► REMOVE everything in dependency order
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=info cargo run --example lifecycle_demo --features logging
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svcgraph::{
    ContainerConfig, DependencyFlags, LifecycleListener, LogWriter, Mode, Service,
    ServiceContainer, ServiceController, ServiceFn, ServiceName, StabilityMonitor, StartContext,
    StartError, State, StopContext, Subscribe, Supplier,
};

/// Database that needs the connection string published by `config`.
struct Database {
    url: Supplier<String>,
    attempts: AtomicUsize,
}

#[async_trait]
impl Service for Database {
    async fn start(&self, ctx: &StartContext) -> Result<(), StartError> {
        let url = self
            .url
            .get()
            .ok_or_else(|| StartError::new("connection string missing"))?;
        // The first attempt fails to show retry.
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StartError::new(format!("{url}: connection refused")));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        println!("[db] connected to {url} (txn {})", ctx.transaction_id());
        Ok(())
    }

    async fn stop(&self, _ctx: &StopContext) {
        println!("[db] disconnected");
    }
}

struct Console;

impl LifecycleListener for Console {
    fn transition(&self, controller: &ServiceController, from: State, to: State) {
        println!("[{}] {from} -> {to}", controller.name());
    }

    fn dependency_failed(&self, controller: &ServiceController) {
        println!("[{}] a dependency failed to start", controller.name());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter)];
    let container = ServiceContainer::builder(ContainerConfig {
        max_concurrent: 4,
        ..ContainerConfig::default()
    })
    .with_subscribers(subs)
    .build();
    let monitor = StabilityMonitor::new();

    // txn 1: install the graph.
    let txn = container.begin().await?;
    let mut target = container.registry().target(&txn);
    target.add_monitor(&monitor)?;
    target.add_listener(Arc::new(Console))?;

    let mut config = target.add_service(ServiceName::of("config"))?;
    let url = config.provides::<String>([ServiceName::of("config").append("db-url")])?;
    config.set_service(ServiceFn::new(move |_ctx: StartContext| {
        let url = url.clone();
        async move {
            url.accept("postgres://localhost/app".to_owned());
            Ok::<_, StartError>(())
        }
    }))?;
    config.install()?;

    let mut db = target.add_service(ServiceName::of("db"))?;
    let db_url = db.requires::<String>(ServiceName::of("config").append("db-url"))?;
    db.set_service(Database {
        url: db_url,
        attempts: AtomicUsize::new(0),
    })?;
    let db = db.install()?;

    target
        .add_service(ServiceName::of("cache"))?
        .set_mode(Mode::OnDemand)?
        .install()?;

    let api = target
        .add_service(ServiceName::of("api"))?
        .add_dependency(ServiceName::of("db"), DependencyFlags::REQUIRED)?
        .add_dependency(ServiceName::of("cache"), DependencyFlags::REQUIRED)?
        .install()?;

    txn.prepare().await?;
    txn.commit().await?;
    let report = monitor.await_stability().await;
    println!("after install: failed={:?}", report.failed);

    // db refused its first start; retry it.
    let txn = container.begin().await?;
    db.retry(&txn)?;
    txn.prepare().await?;
    txn.commit().await?;
    monitor.await_stability_timeout(Duration::from_secs(5)).await?;
    println!("api is {}", api.state());

    // txn 2: park the api.
    let txn = container.begin().await?;
    api.set_mode(&txn, Mode::Never)?;
    txn.prepare().await?;
    txn.commit().await?;
    monitor.await_stability().await;

    // txn 3: bring it back.
    let txn = container.begin().await?;
    api.set_mode(&txn, Mode::Active)?;
    txn.prepare().await?;
    txn.commit().await?;
    monitor.await_stability().await;

    print!("{}", container.dump_services());

    container.shutdown().await?;
    println!("shutdown complete");
    Ok(())
}
