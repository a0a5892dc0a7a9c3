use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use svcgraph::{Container, InstallError, Mode, Service, ServiceBuilder, StartContext, Substate};

struct NoopService;
impl Service for NoopService {
    fn start(&self, ctx: &StartContext) -> Result<(), svcgraph::StartCause> {
        let names: Vec<_> = ctx.provided_names().cloned().collect();
        for name in names {
            ctx.provide(&name, ()).expect("declared name");
        }
        Ok(())
    }
}

struct AlwaysFails;
impl Service for AlwaysFails {
    fn start(&self, _ctx: &StartContext) -> Result<(), svcgraph::StartCause> {
        Err(Arc::new(std::io::Error::other("boom")))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn trivial_service_reaches_up_with_no_dependencies() {
    let container = Container::new();
    let ctrl = container
        .install(ServiceBuilder::new().provides("clock").instance(NoopService).mode(Mode::Active))
        .unwrap();

    container.await_stability(None).await.unwrap();

    assert_eq!(ctrl.state(), Substate::Up);
}

#[tokio::test(flavor = "multi_thread")]
async fn on_demand_service_starts_only_once_demanded_and_stops_when_its_dependent_is_removed() {
    let container = Container::new();

    let b = container
        .install(ServiceBuilder::new().provides("b").instance(NoopService).mode(Mode::OnDemand))
        .unwrap();
    assert_eq!(b.state(), Substate::Down);

    let a = container
        .install(ServiceBuilder::new().provides("a").requires("b").instance(NoopService).mode(Mode::Active))
        .unwrap();

    container.await_stability(None).await.unwrap();
    assert_eq!(a.state(), Substate::Up);
    assert_eq!(b.state(), Substate::Up);

    a.set_mode(Mode::Remove);
    container.await_stability(None).await.unwrap();

    assert_eq!(a.state(), Substate::Removed);
    assert_eq!(b.state(), Substate::Removed);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_dependency_that_always_fails_leaves_its_dependent_in_problem_with_nothing_missing() {
    let container = Container::new();

    container
        .install(ServiceBuilder::new().provides("b").instance(AlwaysFails).mode(Mode::Active))
        .unwrap();
    let a = container
        .install(ServiceBuilder::new().provides("a").requires("b").instance(NoopService).mode(Mode::Active))
        .unwrap();

    container.await_stability(None).await.unwrap();

    assert_eq!(a.state(), Substate::Problem);
    assert!(a.missing().is_empty());

    let report = container.await_stability(None).await.unwrap();
    assert!(report.problem.contains(&svcgraph::ServiceName::single("a")));
    assert!(report.failed.contains(&svcgraph::ServiceName::single("b")));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_missing_dependency_resolves_once_it_is_later_installed() {
    let container = Container::new();

    let a = container
        .install(ServiceBuilder::new().provides("a").requires("x").instance(NoopService).mode(Mode::Active))
        .unwrap();
    container.await_stability(None).await.unwrap();
    assert_eq!(a.state(), Substate::Problem);
    assert_eq!(a.missing(), vec![svcgraph::ServiceName::single("x")]);

    container
        .install(ServiceBuilder::new().provides("x").instance(NoopService).mode(Mode::Active))
        .unwrap();
    container.await_stability(None).await.unwrap();

    assert_eq!(a.state(), Substate::Up);
    assert!(a.missing().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn installing_a_service_that_closes_a_cycle_is_rejected_and_nothing_sticks() {
    let container = Container::new();
    container
        .install(ServiceBuilder::new().provides("a").requires("b").instance(NoopService).mode(Mode::Active))
        .unwrap();

    let err = container
        .install(ServiceBuilder::new().provides("b").requires("a").instance(NoopService).mode(Mode::Active))
        .unwrap_err();

    match err {
        InstallError::CycleDetected { cycle } => assert_eq!(cycle.len(), 2),
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert!(container.controller_of_value(&svcgraph::ServiceName::single("b")).is_none());
    assert!(container.controller_of_value(&svcgraph::ServiceName::single("a")).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_tears_a_three_node_chain_down_and_completes_termination() {
    let container = Container::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let next = Arc::new(AtomicUsize::new(0));

    struct Recording {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        label: &'static str,
    }
    impl Service for Recording {
        fn start(&self, ctx: &StartContext) -> Result<(), svcgraph::StartCause> {
            self.order.lock().unwrap().push(self.label);
            let names: Vec<_> = ctx.provided_names().cloned().collect();
            for name in names {
                ctx.provide(&name, ()).expect("declared name");
            }
            Ok(())
        }
    }
    let _ = &next;

    let c = container
        .install(
            ServiceBuilder::new()
                .provides("c")
                .instance(Recording { order: order.clone(), label: "c" })
                .mode(Mode::Active),
        )
        .unwrap();
    let b = container
        .install(
            ServiceBuilder::new()
                .provides("b")
                .requires("c")
                .instance(Recording { order: order.clone(), label: "b" })
                .mode(Mode::Active),
        )
        .unwrap();
    let a = container
        .install(
            ServiceBuilder::new()
                .provides("a")
                .requires("b")
                .instance(Recording { order: order.clone(), label: "a" })
                .mode(Mode::Active),
        )
        .unwrap();

    container.await_stability(None).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);

    assert!(!container.is_shutdown());
    container.shutdown();
    assert!(container.is_shutdown());

    container.await_termination(None).await.unwrap();
    assert!(container.is_shutdown_complete());

    assert_eq!(a.state(), Substate::Removed);
    assert_eq!(b.state(), Substate::Removed);
    assert_eq!(c.state(), Substate::Removed);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_provided_value_is_readable_through_the_provider_once_up() {
    struct ConfigService;
    impl Service for ConfigService {
        fn start(&self, ctx: &StartContext) -> Result<(), svcgraph::StartCause> {
            ctx.provide(&svcgraph::ServiceName::single("port"), 8080u16).unwrap();
            Ok(())
        }
    }

    struct ReadsConfig;
    impl Service for ReadsConfig {
        fn start(&self, ctx: &StartContext) -> Result<(), svcgraph::StartCause> {
            let names: Vec<_> = ctx.provided_names().cloned().collect();
            for name in names {
                ctx.provide(&name, ()).expect("declared name");
            }
            Ok(())
        }
    }

    let container = Container::new();
    container
        .install(ServiceBuilder::new().provides("port").instance(ConfigService).mode(Mode::Active))
        .unwrap();
    let consumer = container
        .install(
            ServiceBuilder::new()
                .provides("consumer")
                .requires("port")
                .instance(ReadsConfig)
                .mode(Mode::Active),
        )
        .unwrap();

    container.await_stability(None).await.unwrap();
    assert_eq!(consumer.state(), Substate::Up);

    let port_name = svcgraph::ServiceName::single("port");
    let provider = container.controller_of_value(&port_name).unwrap();
    assert_eq!(provider.state(), Substate::Up);
    assert_eq!(provider.value::<u16>(&port_name).unwrap(), 8080);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_second_shutdown_call_is_a_no_op() {
    let container = Container::new();
    container.install(ServiceBuilder::new().provides("a").instance(NoopService)).unwrap();
    container.await_stability(None).await.unwrap();

    container.shutdown();
    container.shutdown();
    container.await_termination(None).await.unwrap();
    assert!(container.is_shutdown_complete());
}
