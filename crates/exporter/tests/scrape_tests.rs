//! End-to-end scrapes against the in-process fake router.

use std::sync::Arc;
use std::time::Duration;

use qdmetrics_amqp::Value;
use qdmetrics_config::{MetricsConfig, StatGroup};
use qdmetrics_exporter::{ScrapeHandler, ScrapeOrchestrator, ScrapeResponse};
use qdmetrics_management::testing::FakeRouter;
use qdmetrics_management::{LinkSession, RouterId, RouterKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    orchestrator: Arc<ScrapeOrchestrator>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

fn config(cache: bool) -> MetricsConfig {
    let mut config = MetricsConfig {
        local: true,
        edge: false,
        cache,
        stats: vec![StatGroup::new("router", ["deliveriesIngress"])],
        ..MetricsConfig::default()
    };
    config.connect.setup_timeout_ms = 500;
    config.connect.request_timeout_ms = 2000;
    config
}

fn router_with_deliveries(value: u64) -> FakeRouter {
    let r1 = RouterId::from_name("R1", RouterKind::Interior);
    FakeRouter::new("R1").with_entity(
        &r1,
        "router",
        &["name", "deliveriesIngress"],
        vec![vec![Value::from("R1"), Value::Ulong(value)]],
    )
}

fn start(router: &FakeRouter, config: MetricsConfig) -> Running {
    let session = LinkSession::new(Arc::new(router.clone()));
    let orchestrator = Arc::new(ScrapeOrchestrator::new(session, config));
    let (stop, stopped) = watch::channel(false);
    let runner = orchestrator.clone();
    let task = tokio::spawn(async move {
        let _ = runner.run(stopped).await;
    });
    Running {
        orchestrator,
        stop,
        task,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn body(response: ScrapeResponse) -> String {
    match response {
        ScrapeResponse::Metrics { content_type, body } => {
            assert!(content_type.starts_with("text/plain"));
            String::from_utf8(body).unwrap()
        }
        ScrapeResponse::ServiceUnavailable => panic!("scrape was unavailable"),
    }
}

#[tokio::test]
async fn test_live_scrape_single_router() {
    let router = router_with_deliveries(42);
    let running = start(&router, config(false));
    let orchestrator = running.orchestrator.clone();
    eventually("topology", || orchestrator.topology().is_some()).await;

    let topology = orchestrator.topology().unwrap();
    assert_eq!(topology.routers.len(), 1);
    assert_eq!(topology.routers[0].name(), "R1");

    let text = body(orchestrator.on_scrape_request().await);
    assert!(text.contains("qdmetrics_deliveriesIngress{router=\"R1\"} 42"));
    assert_eq!(
        text.lines()
            .filter(|l| l.starts_with("qdmetrics_deliveriesIngress{"))
            .count(),
        1
    );

    running.shutdown().await;
}

#[tokio::test]
async fn test_live_scrape_reflects_new_values() {
    let router = router_with_deliveries(1);
    let running = start(&router, config(false));
    let orchestrator = running.orchestrator.clone();
    eventually("topology", || orchestrator.topology().is_some()).await;

    assert!(body(orchestrator.on_scrape_request().await).contains("} 1"));

    let r1 = RouterId::from_name("R1", RouterKind::Interior);
    router.set_entity(
        &r1,
        "router",
        &["name", "deliveriesIngress"],
        vec![vec![Value::from("R1"), Value::Ulong(7)]],
    );
    assert!(body(orchestrator.on_scrape_request().await).contains("qdmetrics_deliveriesIngress{router=\"R1\"} 7"));

    running.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_mid_collection_without_cache() {
    let router = router_with_deliveries(42);
    let running = start(&router, config(false));
    let orchestrator = running.orchestrator.clone();
    eventually("topology", || orchestrator.topology().is_some()).await;

    router.refuse_connections(true);
    router.silence(&RouterId::from_name("R1", RouterKind::Interior));

    let scraping = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.on_scrape_request().await })
    };
    let session = orchestrator.session().clone();
    eventually("request in flight", || session.available_queue_depth() > 0).await;

    router.drop_connections("router killed");

    let in_flight = tokio::time::timeout(Duration::from_secs(1), scraping)
        .await
        .expect("scrape hung after disconnect")
        .unwrap();
    assert_eq!(in_flight, ScrapeResponse::ServiceUnavailable);
    assert_eq!(
        orchestrator.on_scrape_request().await,
        ScrapeResponse::ServiceUnavailable
    );
    assert_eq!(session.available_queue_depth(), 0);

    running.shutdown().await;
}

#[tokio::test]
async fn test_cache_serves_last_snapshot_while_disconnected() {
    let router = router_with_deliveries(42);
    let running = start(&router, config(true));
    let orchestrator = running.orchestrator.clone();
    eventually("first poll", || orchestrator.last_stats().is_some()).await;

    let before = body(orchestrator.on_scrape_request().await);
    assert!(before.contains("qdmetrics_deliveriesIngress{router=\"R1\"} 42"));

    router.refuse_connections(true);
    router.drop_connections("router killed");
    let session = orchestrator.session().clone();
    eventually("disconnect", || !session.is_connected()).await;

    let after = body(orchestrator.on_scrape_request().await);
    assert_eq!(before, after);

    running.shutdown().await;
}

#[tokio::test]
async fn test_cache_without_snapshot_is_unavailable() {
    let router = router_with_deliveries(42);
    router.refuse_connections(true);
    let running = start(&router, config(true));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        running.orchestrator.on_scrape_request().await,
        ScrapeResponse::ServiceUnavailable
    );

    running.shutdown().await;
}

#[tokio::test]
async fn test_scrape_before_connect_is_unavailable() {
    let router = router_with_deliveries(42);
    router.refuse_connections(true);
    let running = start(&router, config(false));

    assert_eq!(
        running.orchestrator.on_scrape_request().await,
        ScrapeResponse::ServiceUnavailable
    );

    running.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_and_refetches_schema() {
    let router = router_with_deliveries(42);
    let running = start(&router, config(false));
    let orchestrator = running.orchestrator.clone();
    eventually("topology", || orchestrator.topology().is_some()).await;
    let first_generation = orchestrator.topology().unwrap().generation;

    router.drop_connections("restart");
    eventually("reconnect", || router.connection_count() == 2).await;
    let session = orchestrator.session().clone();
    eventually("connected", || session.is_connected()).await;
    eventually("new topology", || {
        orchestrator
            .topology()
            .map_or(false, |t| t.generation > first_generation)
    })
    .await;

    let schema_fetches = router
        .requests()
        .iter()
        .filter(|r| r.operation == "GET-SCHEMA")
        .count();
    assert_eq!(schema_fetches, 2);
    assert!(body(orchestrator.on_scrape_request().await).contains("} 42"));

    running.shutdown().await;
}

#[tokio::test]
async fn test_edges_are_scraped() {
    let r1 = RouterId::from_name("R1", RouterKind::Interior);
    let e1 = RouterId::from_name("E1", RouterKind::Edge);
    let router = FakeRouter::new("R1")
        .with_edge(&r1, "E1")
        .with_entity(
            &r1,
            "router",
            &["name", "deliveriesIngress"],
            vec![vec![Value::from("R1"), Value::Ulong(1)]],
        )
        .with_entity(
            &e1,
            "router",
            &["name", "deliveriesIngress"],
            vec![vec![Value::from("E1"), Value::Ulong(2)]],
        );
    let mut config = config(false);
    config.edge = true;

    let running = start(&router, config);
    let orchestrator = running.orchestrator.clone();
    eventually("topology", || orchestrator.topology().is_some()).await;

    let text = body(orchestrator.on_scrape_request().await);
    assert!(text.contains("qdmetrics_deliveriesIngress{router=\"R1\"} 1"));
    assert!(text.contains("qdmetrics_deliveriesIngress{router=\"E1\"} 2"));

    running.shutdown().await;
}
