use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ContainerError, StartError, TransactionError};
use crate::events::EventKind;
use crate::service::{
    DependencyFlags, Mode, NullService, Service, ServiceFn, ServiceName, StartContext, State,
    StopContext,
};
use crate::txn::{Severity, Transaction};

use super::*;

fn name(s: &str) -> ServiceName {
    ServiceName::of(s)
}

fn container() -> Arc<ServiceContainer> {
    ServiceContainer::builder(ContainerConfig::default()).build()
}

async fn settle(txn: &Transaction) {
    txn.prepare().await.unwrap();
    txn.commit().await.unwrap();
}

/// Counts calls and records start order into a shared log.
struct Traced {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    /// Number of leading start attempts that fail.
    failures: usize,
}

impl Traced {
    fn new(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Self::failing(label, log, 0)
    }

    fn failing(label: &'static str, log: &Arc<Mutex<Vec<String>>>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            failures,
        })
    }
}

#[async_trait]
impl Service for Traced {
    async fn start(&self, _ctx: &StartContext) -> Result<(), StartError> {
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(StartError::new(format!("{} refused", self.label)));
        }
        self.log.lock().push(format!("start {}", self.label));
        Ok(())
    }

    async fn stop(&self, _ctx: &StopContext) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("stop {}", self.label));
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    failed: AtomicUsize,
    cleared: AtomicUsize,
    removed: AtomicUsize,
}

impl LifecycleListener for Recorder {
    fn transition(&self, _controller: &ServiceController, from: State, to: State) {
        self.seen.lock().push(format!("{from}->{to}"));
    }

    fn dependency_failed(&self, _controller: &ServiceController) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn dependency_failure_cleared(&self, _controller: &ServiceController) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn removed(&self, _controller: &ServiceController) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn install_chain(order: &[&'static str]) -> (Arc<ServiceContainer>, Arc<Mutex<Vec<String>>>) {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    for &svc in order {
        let mut b = target.add_service(name(svc)).unwrap();
        b.set_service_ref(Traced::new(svc, &log)).unwrap();
        match svc {
            "web" => b.add_dependency(name("app"), DependencyFlags::REQUIRED).unwrap(),
            "app" => b.add_dependency(name("db"), DependencyFlags::REQUIRED).unwrap(),
            _ => &mut b,
        };
        b.install().unwrap();
    }
    settle(&txn).await;
    (c, log)
}

#[tokio::test]
async fn install_order_does_not_change_the_outcome() {
    for order in [["db", "app", "web"], ["web", "app", "db"], ["app", "web", "db"]] {
        let (c, log) = install_chain(&order).await;
        for svc in ["db", "app", "web"] {
            let ctl = c.registry().get_required_service(&name(svc)).unwrap();
            assert_eq!(ctl.state(), State::Up, "{svc} after {order:?}");
        }
        assert_eq!(*log.lock(), vec!["start db", "start app", "start web"]);
    }
}

#[tokio::test]
async fn cycle_is_rejected_and_leaves_the_graph_alone() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);

    target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    let err = target
        .add_service(name("b"))
        .unwrap()
        .add_dependency(name("a"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap_err();
    match err {
        ContainerError::CircularDependency { name: n, cycle } => {
            assert_eq!(n, name("b"));
            assert_eq!(cycle, vec![name("b"), name("a"), name("b")]);
        }
        other => panic!("unexpected {other:?}"),
    }

    // The name is free again.
    target
        .add_service(name("b"))
        .unwrap()
        .set_service(NullService)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    assert_eq!(c.registry().service_names(), vec![name("a"), name("b")]);
    assert_eq!(c.registry().get_required_service(&name("a")).unwrap().state(), State::Up);
}

#[tokio::test]
async fn optional_edges_do_not_form_cycles() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::OPTIONAL)
        .unwrap()
        .install()
        .unwrap();
    target
        .add_service(name("b"))
        .unwrap()
        .add_dependency(name("a"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(c.registry().len(), 2);
}

#[tokio::test]
async fn cancelled_install_does_not_count_towards_cycles() {
    let container = container();
    let first = container.begin().await.unwrap();
    let target = container.registry().target(&first);
    let a = target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .add_dependency(name("c"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();

    // While a's install is live, b closes a real cycle.
    let err = target
        .add_service(name("b"))
        .unwrap()
        .add_dependency(name("a"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap_err();
    assert!(matches!(
        err,
        ContainerError::CircularDependency { ref cycle, .. }
            if cycle == &[name("b"), name("a"), name("b")]
    ));

    first.rollback().await.unwrap();
    assert_eq!(a.state(), State::Cancelled);

    // Once a is cancelled, c requiring a is no cycle.
    let second = container.begin().await.unwrap();
    let c = container
        .registry()
        .target(&second)
        .add_service(name("c"))
        .unwrap()
        .add_dependency(name("a"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    settle(&second).await;

    assert!(container.registry().get_service(&name("a")).is_none());
    assert!(container.registry().get_service(&name("b")).is_none());
    assert_eq!(c.state(), State::Down);
    assert_eq!(c.unavailable_dependencies(), vec![name("a")]);
}

#[tokio::test]
async fn stability_wait_reports_settled_services() {
    let c = container();
    let monitor = StabilityMonitor::new();
    let txn = c.begin().await.unwrap();
    let mut target = c.registry().target(&txn);
    target.add_monitor(&monitor).unwrap();

    for svc in ["one", "two", "three"] {
        target.add_service(name(svc)).unwrap().install().unwrap();
    }
    target
        .add_service(name("orphan"))
        .unwrap()
        .add_dependency(name("ghost"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    assert_eq!(monitor.unstable_count(), 4);

    settle(&txn).await;
    let report = monitor
        .await_stability_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.missing_dependencies, vec![name("orphan")]);
    let stats = monitor.statistics();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.unstable, 0);
    assert_eq!(stats.in_state(State::Up), 3);
    assert_eq!(stats.in_state(State::Down), 1);
    assert_eq!(stats.in_mode(Mode::Active), 4);
}

#[tokio::test]
async fn stability_wait_times_out_on_pending_installs() {
    let c = container();
    let monitor = StabilityMonitor::new();
    let txn = c.begin().await.unwrap();
    let ctl = c
        .registry()
        .target(&txn)
        .add_service(name("pending"))
        .unwrap()
        .install()
        .unwrap();
    monitor.add_controller(&ctl);
    monitor.add_controller(&ctl);
    assert_eq!(monitor.unstable_count(), 1);

    let err = monitor
        .await_stability_timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ContainerError::StabilityTimeout { ref unstable, .. } if unstable == &vec![name("pending")]
    ));

    monitor.remove_controller(&ctl);
    assert_eq!(monitor.unstable_count(), 0);
    txn.rollback().await.unwrap();
}

#[tokio::test]
async fn dependency_failure_is_reported_once_per_episode() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::new(Recorder::default());

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    for svc in ["b1", "b2"] {
        target
            .add_service(name(svc))
            .unwrap()
            .set_service_ref(Traced::failing(svc, &log, usize::MAX))
            .unwrap()
            .install()
            .unwrap();
    }
    let a = target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b1"), DependencyFlags::REQUIRED)
        .unwrap()
        .add_dependency(name("b2"), DependencyFlags::REQUIRED)
        .unwrap()
        .add_listener(recorder.clone())
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    assert_eq!(a.state(), State::StartFailed);
    assert!(a.start_error().is_none());
    assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.cleared.load(Ordering::SeqCst), 0);

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    target.set_mode(&name("b1"), Mode::Never).unwrap();
    target.set_mode(&name("b2"), Mode::Never).unwrap();
    settle(&txn).await;

    assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(a.state(), State::Down);
}

#[tokio::test]
async fn install_then_remove_round_trip() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let mut events = c.events();

    let txn = c.begin().await.unwrap();
    let ctl = c
        .registry()
        .target(&txn)
        .add_service(name("svc"))
        .unwrap()
        .set_service_ref(Traced::new("svc", &log))
        .unwrap()
        .add_listener(recorder.clone())
        .unwrap()
        .install()
        .unwrap();
    assert!(c.registry().get_service(&name("svc")).is_none());
    settle(&txn).await;

    assert_eq!(
        *recorder.seen.lock(),
        vec!["NEW->DOWN", "DOWN->START_REQUESTED", "START_REQUESTED->STARTING", "STARTING->UP"]
    );
    assert!(ctl.is_stable());

    recorder.seen.lock().clear();
    let txn = c.begin().await.unwrap();
    c.registry().target(&txn).remove_service(&name("svc")).unwrap();
    assert!(matches!(ctl.remove(&txn), Err(ContainerError::IllegalState { .. })));
    settle(&txn).await;

    assert_eq!(
        *recorder.seen.lock(),
        vec![
            "UP->STOP_REQUESTED",
            "STOP_REQUESTED->STOPPING",
            "STOPPING->DOWN",
            "DOWN->REMOVING",
            "REMOVING->REMOVED",
        ]
    );
    assert_eq!(recorder.removed.load(Ordering::SeqCst), 1);
    assert_eq!(*log.lock(), vec!["start svc", "stop svc"]);
    assert!(c.registry().is_empty());

    let mut kinds = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.service.as_deref() == Some("svc") {
            kinds.push(ev.kind);
        }
    }
    assert!(kinds.contains(&EventKind::ServiceInstalled));
    assert_eq!(kinds.last(), Some(&EventKind::ServiceRemoved));

    // The name can be reused.
    let txn = c.begin().await.unwrap();
    c.registry()
        .target(&txn)
        .add_service(name("svc"))
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(c.registry().len(), 1);
}

#[tokio::test]
async fn on_demand_dependency_follows_its_dependent() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let a = target
        .add_service(name("a"))
        .unwrap()
        .set_service_ref(Traced::new("a", &log))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    let b = target
        .add_service(name("b"))
        .unwrap()
        .set_service_ref(Traced::new("b", &log))
        .unwrap()
        .set_mode(Mode::OnDemand)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!((a.state(), b.state()), (State::Up, State::Up));

    let txn = c.begin().await.unwrap();
    a.remove(&txn).unwrap();
    settle(&txn).await;

    assert_eq!(a.state(), State::Removed);
    assert_eq!(b.state(), State::Down);
    assert_eq!(*log.lock(), vec!["start b", "start a", "stop a", "stop b"]);
}

#[tokio::test]
async fn lazy_dependency_stays_up_once_started() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let a = target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    let b = target
        .add_service(name("b"))
        .unwrap()
        .set_mode(Mode::Lazy)
        .unwrap()
        .install()
        .unwrap();
    let idle = target
        .add_service(name("idle"))
        .unwrap()
        .set_mode(Mode::Lazy)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(b.state(), State::Up);
    assert_eq!(idle.state(), State::Down);

    let txn = c.begin().await.unwrap();
    a.remove(&txn).unwrap();
    settle(&txn).await;
    assert_eq!(b.state(), State::Up);
}

#[tokio::test]
async fn failed_dependency_blocks_dependent_until_removed() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let a = target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    let b = target
        .add_service(name("b"))
        .unwrap()
        .set_service_ref(Traced::failing("b", &log, usize::MAX))
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    assert_eq!(b.state(), State::StartFailed);
    assert_eq!(b.start_error().map(|e| e.message().to_owned()).as_deref(), Some("b refused"));
    assert_eq!(a.state(), State::StartFailed);
    let report = txn.problem_report();
    assert!(report
        .iter()
        .any(|p| p.severity() == Severity::Error && p.subject() == Some("b")));

    let txn = c.begin().await.unwrap();
    b.remove(&txn).unwrap();
    settle(&txn).await;

    assert_eq!(b.state(), State::Removed);
    assert!(b.start_error().is_none());
    assert_eq!(a.state(), State::Down);
    assert_eq!(a.unavailable_dependencies(), vec![name("b")]);
}

#[tokio::test]
async fn retry_clears_a_start_failure() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));
    let traced = Traced::failing("flaky", &log, 1);

    let txn = c.begin().await.unwrap();
    let ctl = c
        .registry()
        .target(&txn)
        .add_service(name("flaky"))
        .unwrap()
        .set_service_ref(traced.clone())
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(ctl.state(), State::StartFailed);

    let txn = c.begin().await.unwrap();
    ctl.retry(&txn).unwrap();
    settle(&txn).await;

    assert_eq!(ctl.state(), State::Up);
    assert!(ctl.start_error().is_none());
    assert_eq!(traced.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rollback_restores_the_previous_lifecycle() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));
    let traced = Traced::new("svc", &log);

    let txn = c.begin().await.unwrap();
    let ctl = c
        .registry()
        .target(&txn)
        .add_service(name("svc"))
        .unwrap()
        .set_service_ref(traced.clone())
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    let txn = c.begin().await.unwrap();
    ctl.set_mode(&txn, Mode::Never).unwrap();
    txn.prepare().await.unwrap();
    assert_eq!(ctl.state(), State::Down);

    txn.rollback().await.unwrap();
    assert_eq!(ctl.state(), State::Up);
    assert_eq!(ctl.mode(), Mode::Active);
    assert_eq!(traced.starts.load(Ordering::SeqCst), 2);
    assert_eq!(traced.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rollback_undoes_installs() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let db = target
        .add_service(name("db"))
        .unwrap()
        .set_service_ref(Traced::new("db", &log))
        .unwrap()
        .install()
        .unwrap();
    let app = target
        .add_service(name("app"))
        .unwrap()
        .set_service_ref(Traced::new("app", &log))
        .unwrap()
        .add_dependency(name("db"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    txn.prepare().await.unwrap();
    assert_eq!(app.state(), State::Up);

    txn.rollback().await.unwrap();
    assert_eq!(db.state(), State::Cancelled);
    assert_eq!(app.state(), State::Cancelled);
    assert!(c.registry().is_empty());
    assert_eq!(
        *log.lock(),
        vec!["start db", "start app", "stop app", "stop db"]
    );
}

#[tokio::test]
async fn other_threads_are_rejected() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let ctl = c
        .registry()
        .target(&txn)
        .add_service(name("svc"))
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    let txn = c.begin().await.unwrap();
    let registry = Arc::clone(c.registry());
    let remote = txn.clone();
    let remote_ctl = Arc::clone(&ctl);
    let (install, mode) = std::thread::spawn(move || {
        let install = registry
            .target(&remote)
            .add_service(ServiceName::of("intruder"))
            .map(|_| ());
        let mode = remote_ctl.set_mode(&remote, Mode::Never);
        (install, mode)
    })
    .join()
    .expect("thread joined");

    assert!(matches!(install, Err(ContainerError::ConcurrentModification)));
    assert!(matches!(mode, Err(ContainerError::ConcurrentModification)));
    assert!(matches!(
        c.try_begin(),
        Err(TransactionError::ConcurrentModification)
    ));
    settle(&txn).await;
    assert_eq!(ctl.mode(), Mode::Active);
}

#[tokio::test]
async fn duplicate_names_and_aliases_are_rejected() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    target
        .add_service(name("a"))
        .unwrap()
        .add_alias(name("alpha"))
        .unwrap()
        .install()
        .unwrap();

    let same = target.add_service(name("a")).unwrap().install().unwrap_err();
    assert!(matches!(same, ContainerError::DuplicateService { name: ref n } if n == &name("a")));

    let via_alias = target
        .add_service(name("b"))
        .unwrap()
        .add_alias(name("alpha"))
        .unwrap()
        .install()
        .unwrap_err();
    assert!(matches!(via_alias, ContainerError::DuplicateService { name: ref n } if n == &name("alpha")));
    settle(&txn).await;

    assert_eq!(c.registry().service_names(), vec![name("a"), name("alpha")]);
    let by_alias = c.registry().get_required_service(&name("alpha")).unwrap();
    assert_eq!(by_alias.name(), &name("a"));
    assert!(matches!(
        c.registry().get_required_service(&name("b")),
        Err(ContainerError::ServiceNotFound { .. })
    ));
}

#[tokio::test]
async fn builder_is_single_use() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let mut b = target.add_service(name("once")).unwrap();
    assert!(matches!(b.set_mode(Mode::Remove), Err(ContainerError::IllegalState { .. })));
    b.install().unwrap();
    assert!(matches!(b.install(), Err(ContainerError::IllegalState { .. })));
    assert!(matches!(
        b.add_alias(name("again")),
        Err(ContainerError::IllegalState { .. })
    ));
    settle(&txn).await;
}

#[tokio::test]
async fn values_flow_from_provider_to_dependent() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);

    let mut db = target.add_service(name("db")).unwrap();
    let url = db.provides::<String>([name("db").append("url")]).unwrap();
    let publish = url.clone();
    db.set_service(ServiceFn::new(move |_ctx: StartContext| {
        let publish = publish.clone();
        async move {
            publish.accept("postgres://localhost".to_owned());
            Ok::<_, StartError>(())
        }
    }))
    .unwrap();
    let db = db.install().unwrap();

    let mut app = target.add_service(name("app")).unwrap();
    let supplier = app.requires::<String>(name("db").append("url")).unwrap();
    app.install().unwrap();
    assert_eq!(supplier.get(), None);
    settle(&txn).await;

    assert_eq!(supplier.get().as_deref(), Some("postgres://localhost"));
    assert_eq!(db.aliases(), &[name("db").append("url")]);

    let txn = c.begin().await.unwrap();
    db.set_mode(&txn, Mode::Never).unwrap();
    settle(&txn).await;
    assert_eq!(supplier.get(), None);
    assert_eq!(
        c.registry().get_required_service(&name("app")).unwrap().state(),
        State::Down
    );
}

#[tokio::test]
async fn parent_removal_removes_children() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let parent = target.add_service(name("parent")).unwrap().install().unwrap();
    let child = target
        .add_service(name("parent").append("child"))
        .unwrap()
        .add_dependency(name("parent"), DependencyFlags::PARENT)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(child.state(), State::Up);

    let txn = c.begin().await.unwrap();
    parent.remove(&txn).unwrap();
    settle(&txn).await;
    assert_eq!(parent.state(), State::Removed);
    assert_eq!(child.state(), State::Removed);
    assert!(c.registry().is_empty());
}

#[tokio::test]
async fn shutdown_removes_everything_and_closes_the_gate() {
    let (c, log) = install_chain(&["db", "app", "web"]).await;
    let extra = c.new_registry();
    let txn = c.begin().await.unwrap();
    extra.target(&txn).add_service(name("side")).unwrap().install().unwrap();
    settle(&txn).await;
    assert!(c.dump_services().contains("side mode=ACTIVE state=UP"));

    c.shutdown().await.unwrap();

    assert!(c.registry().is_empty());
    assert!(extra.is_empty());
    assert_eq!(
        log.lock()[3..].to_vec(),
        vec!["stop web", "stop app", "stop db"]
    );
    assert!(matches!(
        c.begin().await,
        Err(TransactionError::ContainerShutdown)
    ));
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tree_converges_on_many_threads() {
    init_tracing();
    let c = ServiceContainer::builder(ContainerConfig {
        max_concurrent: 8,
        ..ContainerConfig::default()
    })
    .build();
    let monitor = StabilityMonitor::new();
    let started = Arc::new(AtomicUsize::new(0));

    let txn = c.begin().await.unwrap();
    let mut target = c.registry().target(&txn);
    target.add_monitor(&monitor).unwrap();
    // Node i requires node (i - 1) / 2; installed leaves first.
    let mut root = None;
    for i in (0..40usize).rev() {
        let mut b = target.add_service(name("node").append(i.to_string())).unwrap();
        if i > 0 {
            b.add_dependency(name("node").append(((i - 1) / 2).to_string()), DependencyFlags::REQUIRED)
                .unwrap();
        }
        let counter = Arc::clone(&started);
        b.set_service(ServiceFn::new(move |_ctx: StartContext| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StartError>(())
            }
        }))
        .unwrap();
        root = Some(b.install().unwrap());
    }
    settle(&txn).await;
    let report = tokio::time::timeout(Duration::from_secs(5), monitor.await_stability())
        .await
        .expect("graph settles");
    assert!(report.is_clean());
    assert_eq!(monitor.statistics().in_state(State::Up), 40);
    assert_eq!(started.load(Ordering::SeqCst), 40);

    let root = root.expect("root installed");
    let txn = c.begin().await.unwrap();
    root.remove(&txn).unwrap();
    settle(&txn).await;
    monitor.await_stability().await;

    let stats = monitor.statistics();
    assert_eq!(stats.in_state(State::Removed), 1);
    assert_eq!(stats.in_state(State::Down), 39);
}

struct Forward(tokio::sync::mpsc::UnboundedSender<EventKind>);

#[async_trait]
impl crate::subscribers::Subscribe for Forward {
    async fn on_event(&self, ev: &crate::events::Event) {
        let _ = self.0.send(ev.kind);
    }
}

#[tokio::test]
async fn subscribers_receive_install_and_commit_events() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let c = ServiceContainer::builder(ContainerConfig::default())
        .with_subscriber(Forward(tx))
        .build();

    let txn = c.begin().await.unwrap();
    c.registry()
        .target(&txn)
        .add_service(name("db"))
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;

    let mut kinds = Vec::new();
    while !kinds.contains(&EventKind::TransactionCommitted) {
        let kind = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("subscriber alive");
        kinds.push(kind);
    }
    assert!(kinds.contains(&EventKind::ServiceInstalled));
    assert!(kinds.contains(&EventKind::ServiceTransition));
}

struct Gated(Arc<tokio::sync::Notify>);

#[async_trait]
impl Service for Gated {
    async fn start(&self, _ctx: &StartContext) -> Result<(), StartError> {
        self.0.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn stability_waits_for_a_start_in_flight() {
    let c = container();
    let monitor = StabilityMonitor::new();
    let gate = Arc::new(tokio::sync::Notify::new());

    let txn = c.begin().await.unwrap();
    let mut target = c.registry().target(&txn);
    target.add_monitor(&monitor).unwrap();
    let slow = target
        .add_service(name("slow"))
        .unwrap()
        .set_service(Gated(Arc::clone(&gate)))
        .unwrap()
        .install()
        .unwrap();

    let observe = async {
        tokio::time::timeout(Duration::from_secs(2), async {
            while slow.state() != State::Starting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("start in flight");

        let err = monitor
            .await_stability_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContainerError::StabilityTimeout { ref unstable, .. } if unstable == &[name("slow")]
        ));
        gate.notify_one();
    };
    let (prepared, ()) = tokio::join!(txn.prepare(), observe);
    prepared.unwrap();
    txn.commit().await.unwrap();
    assert!(monitor.await_stability().await.is_clean());
    assert_eq!(slow.state(), State::Up);
}

#[tokio::test]
async fn passive_service_follows_its_dependencies_without_demanding_them() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let db = target
        .add_service(name("db"))
        .unwrap()
        .set_service_ref(Traced::new("db", &log))
        .unwrap()
        .set_mode(Mode::OnDemand)
        .unwrap()
        .install()
        .unwrap();
    let report = target
        .add_service(name("report"))
        .unwrap()
        .set_service_ref(Traced::new("report", &log))
        .unwrap()
        .set_mode(Mode::Passive)
        .unwrap()
        .add_dependency(name("db"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(db.state(), State::Down);
    assert_eq!(report.state(), State::Down);

    let txn = c.begin().await.unwrap();
    db.set_mode(&txn, Mode::Active).unwrap();
    settle(&txn).await;
    assert_eq!(report.state(), State::Up);

    let txn = c.begin().await.unwrap();
    db.set_mode(&txn, Mode::OnDemand).unwrap();
    settle(&txn).await;
    assert_eq!(db.state(), State::Down);
    assert_eq!(report.state(), State::Down);

    // Demanded, the passive service demands its own dependencies.
    let txn = c.begin().await.unwrap();
    let web = c
        .registry()
        .target(&txn)
        .add_service(name("web"))
        .unwrap()
        .set_service_ref(Traced::new("web", &log))
        .unwrap()
        .add_dependency(name("report"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(web.state(), State::Up);
    assert_eq!(report.state(), State::Up);
    assert_eq!(db.state(), State::Up);

    assert_eq!(
        *log.lock(),
        vec![
            "start db",
            "start report",
            "stop report",
            "stop db",
            "start db",
            "start report",
            "start web",
        ]
    );
}

#[tokio::test]
async fn anti_dependency_keeps_services_apart() {
    let c = container();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let primary = target
        .add_service(name("primary"))
        .unwrap()
        .set_service_ref(Traced::new("primary", &log))
        .unwrap()
        .set_mode(Mode::Never)
        .unwrap()
        .install()
        .unwrap();
    let standby = target
        .add_service(name("standby"))
        .unwrap()
        .set_service_ref(Traced::new("standby", &log))
        .unwrap()
        .add_dependency(name("primary"), DependencyFlags::ANTI)
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(primary.state(), State::Down);
    assert_eq!(standby.state(), State::Up);

    let txn = c.begin().await.unwrap();
    primary.set_mode(&txn, Mode::Active).unwrap();
    settle(&txn).await;
    assert_eq!(primary.state(), State::Up);
    assert_eq!(standby.state(), State::Down);
    assert_eq!(*log.lock(), vec!["start standby", "start primary", "stop standby"]);

    let txn = c.begin().await.unwrap();
    primary.set_mode(&txn, Mode::Never).unwrap();
    settle(&txn).await;
    assert_eq!(primary.state(), State::Down);
    assert_eq!(standby.state(), State::Up);
}

#[tokio::test]
async fn replace_dependency_is_not_reported_missing() {
    let c = container();
    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let plain = target
        .add_service(name("plain"))
        .unwrap()
        .add_dependency(name("legacy"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();
    let swap = target
        .add_service(name("swap"))
        .unwrap()
        .add_dependency(name("legacy"), DependencyFlags::REPLACE)
        .unwrap()
        .install()
        .unwrap();
    txn.prepare().await.unwrap();

    let report = txn.problem_report();
    let missing: Vec<&str> = report
        .iter()
        .filter(|p| p.severity() == Severity::Warning)
        .filter_map(|p| p.subject())
        .collect();
    assert_eq!(missing, vec!["plain"]);
    txn.commit().await.unwrap();
    assert_eq!(swap.state(), State::Down);

    let txn = c.begin().await.unwrap();
    c.registry()
        .target(&txn)
        .add_service(name("legacy"))
        .unwrap()
        .install()
        .unwrap();
    settle(&txn).await;
    assert_eq!(plain.state(), State::Up);
    assert_eq!(swap.state(), State::Up);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_notices_are_exactly_once_across_threads() {
    init_tracing();
    let c = ServiceContainer::builder(ContainerConfig {
        max_concurrent: 8,
        ..ContainerConfig::default()
    })
    .build();
    let log = Arc::new(Mutex::new(Vec::new()));

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let db = target
        .add_service(name("db"))
        .unwrap()
        .set_service_ref(Traced::failing("db", &log, 1))
        .unwrap()
        .install()
        .unwrap();
    let mut clients = Vec::new();
    for i in 0..16usize {
        let recorder = Arc::new(Recorder::default());
        let ctl = target
            .add_service(name("client").append(i.to_string()))
            .unwrap()
            .add_dependency(name("db"), DependencyFlags::REQUIRED)
            .unwrap()
            .add_listener(recorder.clone())
            .unwrap()
            .install()
            .unwrap();
        clients.push((ctl, recorder));
    }
    settle(&txn).await;
    assert_eq!(db.state(), State::StartFailed);
    for (ctl, recorder) in &clients {
        assert_eq!(ctl.state(), State::StartFailed, "{}", ctl.name());
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1, "{}", ctl.name());
    }

    // Recovery and removals race on the worker threads.
    let txn = c.begin().await.unwrap();
    db.retry(&txn).unwrap();
    for (ctl, _) in &clients[..8] {
        ctl.remove(&txn).unwrap();
    }
    settle(&txn).await;

    assert_eq!(db.state(), State::Up);
    for (i, (ctl, recorder)) in clients.iter().enumerate() {
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1, "{}", ctl.name());
        assert_eq!(recorder.cleared.load(Ordering::SeqCst), 1, "{}", ctl.name());
        if i < 8 {
            assert_eq!(ctl.state(), State::Removed, "{}", ctl.name());
            assert_eq!(recorder.removed.load(Ordering::SeqCst), 1, "{}", ctl.name());
        } else {
            assert_eq!(ctl.state(), State::Up, "{}", ctl.name());
        }
    }
}

/// Parks the thread that ran the start while it delivers `STARTING->UP`, with
/// the UP publication still pending on that thread.
#[derive(Default)]
struct HoldUp {
    starter: Mutex<Option<std::thread::ThreadId>>,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    parked: tokio::sync::Notify,
}

impl LifecycleListener for HoldUp {
    fn transition(&self, _controller: &ServiceController, from: State, to: State) {
        if (from, to) != (State::Starting, State::Up) {
            return;
        }
        let Some(gate) = self.gate.lock().take() else {
            return;
        };
        self.parked.notify_one();
        // Another thread delivering means nothing is pending here.
        if *self.starter.lock() == Some(std::thread::current().id()) {
            let _ = gate.recv();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_up_publication_does_not_outlive_a_stop() {
    init_tracing();
    let c = container();
    let (release, gate) = std::sync::mpsc::sync_channel(0);
    let hold = Arc::new(HoldUp::default());
    *hold.gate.lock() = Some(gate);

    let starter = Arc::clone(&hold);
    let service = ServiceFn::new(move |_ctx: StartContext| {
        let hold = Arc::clone(&starter);
        async move {
            *hold.starter.lock() = Some(std::thread::current().id());
            Ok::<_, StartError>(())
        }
    });

    let txn = c.begin().await.unwrap();
    let target = c.registry().target(&txn);
    let b = target
        .add_service(name("b"))
        .unwrap()
        .set_service(service)
        .unwrap()
        .set_mode(Mode::OnDemand)
        .unwrap()
        .add_listener(hold.clone())
        .unwrap()
        .install()
        .unwrap();
    let a = target
        .add_service(name("a"))
        .unwrap()
        .add_dependency(name("b"), DependencyFlags::REQUIRED)
        .unwrap()
        .install()
        .unwrap();

    // b is UP but its publication is stuck behind the parked listener while
    // a stops demanding it from another worker.
    let interleave = async {
        tokio::time::timeout(Duration::from_secs(5), hold.parked.notified())
            .await
            .expect("b parked on its way up");
        a.set_mode(&txn, Mode::Never).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(b.state(), State::Stopping | State::Down) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("b stopping");
        let _ = release.send(());
    };
    let (prepared, ()) = tokio::join!(txn.prepare(), interleave);
    prepared.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(a.state(), State::Down);
    assert_eq!(b.state(), State::Down);

    let txn = c.begin().await.unwrap();
    a.set_mode(&txn, Mode::Active).unwrap();
    settle(&txn).await;
    assert_eq!(b.state(), State::Up);
    assert_eq!(a.state(), State::Up);
}
