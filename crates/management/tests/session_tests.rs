//! Link session, discovery and collection against the in-process fake router.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qdmetrics_amqp::Value;
use qdmetrics_config::{ConnectOptions, StatGroup};
use qdmetrics_management::testing::FakeRouter;
use qdmetrics_management::*;

fn options() -> ConnectOptions {
    ConnectOptions::default()
        .with_setup_timeout(Duration::from_millis(500))
        .with_request_timeout(Duration::from_secs(2))
}

async fn connected(router: &FakeRouter) -> LinkSession {
    let session = LinkSession::new(Arc::new(router.clone()));
    session.connect(&options()).await.unwrap();
    session.fetch_schema().await.unwrap();
    session
}

async fn wait_for_depth(session: &LinkSession, depth: usize) {
    for _ in 0..200 {
        if session.available_queue_depth() == depth {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue depth never reached {depth}");
}

fn interior(name: &str) -> RouterId {
    RouterId::from_name(name, RouterKind::Interior)
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let router = FakeRouter::new("R1");
    let session = LinkSession::new(Arc::new(router.clone()));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connected());

    session.connect(&options()).await.unwrap();

    assert!(session.is_connected());
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.connected_node().unwrap(), interior("R1"));
    assert_eq!(session.reply_to().unwrap(), "amqp:/_topo/0/R1/temp.1");
    assert_eq!(session.version(), DEFAULT_ROUTER_VERSION);
    assert_eq!(router.connection_count(), 1);
}

#[tokio::test]
async fn test_router_version_from_open_properties() {
    let router = FakeRouter::new("R1").with_version("1.19.0");
    let session = LinkSession::new(Arc::new(router));
    session.connect(&options()).await.unwrap();
    assert_eq!(session.version(), "1.19.0");
    assert_eq!(
        session.remote_properties().unwrap().get("version"),
        Some(&Value::from("1.19.0"))
    );
}

#[tokio::test]
async fn test_schema_fetch_and_lookup_errors() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;

    let schema = session.schema().unwrap();
    assert!(schema.entity("container").is_none());
    assert_eq!(
        schema.fully_qualified_type("router").unwrap(),
        "org.apache.qpid.dispatch.router"
    );

    router.clear_requests();
    let result = session
        .send_query(&interior("R1"), "container", &["name".to_string()])
        .await;
    assert!(matches!(
        result,
        Err(ManagementError::Schema(SchemaError::UnknownEntity { .. }))
    ));
    assert!(router.requests().is_empty());
}

#[tokio::test]
async fn test_unknown_attribute_fails_without_request() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;
    router.clear_requests();

    let attributes = with_name_attribute(&["noSuchAttribute".to_string()]);
    let result = session.send_query(&interior("R1"), "router", &attributes).await;
    match result {
        Err(ManagementError::Schema(SchemaError::UnknownAttribute { entity, attribute })) => {
            assert_eq!(entity, "router");
            assert_eq!(attribute, "noSuchAttribute");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(router.requests().is_empty());
    assert_eq!(session.available_queue_depth(), 0);
}

#[tokio::test]
async fn test_query_before_schema_fails_fast() {
    let router = FakeRouter::new("R1");
    let session = LinkSession::new(Arc::new(router.clone()));
    session.connect(&options()).await.unwrap();

    let result = session
        .send_query(&interior("R1"), "router", &["name".to_string()])
        .await;
    assert!(matches!(
        result,
        Err(ManagementError::Schema(SchemaError::NotLoaded))
    ));
    assert!(router.requests().is_empty());
}

#[tokio::test]
async fn test_query_while_disconnected_sends_nothing() {
    let router = FakeRouter::new("R1");
    let session = LinkSession::new(Arc::new(router.clone()));

    let result = session
        .send_query(&interior("R1"), "router", &["name".to_string()])
        .await;
    assert!(matches!(result, Err(ManagementError::NotConnected)));
    assert!(matches!(
        session
            .send_management_query(ManagementOperation::GetMgmtNodes)
            .await,
        Err(ManagementError::NotConnected)
    ));
    assert_eq!(router.connection_count(), 0);
}

#[tokio::test]
async fn test_query_round_trip_and_wire_shape() {
    let r1 = interior("R1");
    let router = FakeRouter::new("R1").with_entity(
        &r1,
        "router",
        &["name", "deliveriesIngress", "linkCount"],
        vec![vec![Value::from("R1"), Value::Ulong(17), Value::Ulong(3)]],
    );
    let session = connected(&router).await;
    router.clear_requests();

    let attributes = with_name_attribute(&["deliveriesIngress".to_string()]);
    let result = session.send_query(&r1, "router", &attributes).await.unwrap();

    assert_eq!(result.attribute_names, vec!["deliveriesIngress", "name"]);
    let records = result.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("deliveriesIngress"), Some(&Value::Ulong(17)));
    assert_eq!(records[0].get("name"), Some(&Value::from("R1")));

    let requests = router.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].operation, "QUERY");
    assert_eq!(requests[0].to.as_deref(), Some("_topo/0/R1/$management"));
    assert_eq!(
        requests[0].entity_type.as_deref(),
        Some("org.apache.qpid.dispatch.router")
    );
    assert_eq!(session.available_queue_depth(), 0);
}

#[tokio::test]
async fn test_unknown_router_is_remote_error() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;
    let result = session
        .send_query(&interior("nowhere"), "router", &["name".to_string()])
        .await;
    assert!(matches!(
        result,
        Err(ManagementError::Remote {
            status_code: 404,
            ..
        })
    ));
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let r1 = interior("R1");
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;

    let reason = Arc::new(Mutex::new(None));
    let captured = reason.clone();
    session.on_disconnect(move |r| *captured.lock() = Some(r.to_string()));

    router.silence(&r1);
    let pending: Vec<_> = (0..3)
        .map(|_| {
            let session = session.clone();
            let r1 = r1.clone();
            tokio::spawn(async move {
                session
                    .send_query(&r1, "router", &["name".to_string()])
                    .await
            })
        })
        .collect();
    wait_for_depth(&session, 3).await;

    router.drop_connections("router restarting");

    for task in pending {
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pending request was left hanging")
            .unwrap();
        match outcome {
            Err(ManagementError::Disconnected { reason }) => assert_eq!(reason, "router restarting"),
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(session.available_queue_depth(), 0);
    assert!(!session.is_connected());
    assert!(session.schema().is_none());
    assert_eq!(reason.lock().as_deref(), Some("router restarting"));
}

#[tokio::test]
async fn test_request_timeout_removes_entry() {
    let router = FakeRouter::new("R1");
    let session = LinkSession::new(Arc::new(router.clone()));
    session
        .connect(&options().with_request_timeout(Duration::from_millis(100)))
        .await
        .unwrap();

    router.silence(&interior("R1"));
    let result = session.fetch_schema().await;
    assert!(matches!(result, Err(ManagementError::Timeout { .. })));
    assert_eq!(session.available_queue_depth(), 0);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_setup_timeout() {
    let router = FakeRouter::new("R1");
    router.stall_links(true);
    let session = LinkSession::new(Arc::new(router.clone()));

    let result = session
        .connect(&options().with_setup_timeout(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(ManagementError::Timeout { .. })));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_refused_connection() {
    let router = FakeRouter::new("R1");
    router.refuse_connections(true);
    let session = LinkSession::new(Arc::new(router));

    let err = session.connect(&options()).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_after_drop() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;

    let connects = Arc::new(Mutex::new(0));
    let counter = connects.clone();
    session.subscribe(HookKind::Connect, move |_| {
        *counter.lock() += 1;
        HookAction::Keep
    });

    router.drop_connections("restart");
    for _ in 0..100 {
        if !session.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!session.is_connected());

    session.connect(&options()).await.unwrap();
    session.fetch_schema().await.unwrap();
    assert!(session.is_connected());
    assert_eq!(router.connection_count(), 2);
    assert_eq!(*connects.lock(), 1);
    assert_eq!(session.reply_to().unwrap(), "amqp:/_topo/0/R1/temp.2");
}

#[tokio::test]
async fn test_explicit_disconnect() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;

    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    session.on_disconnect(move |_| *flag.lock() = true);

    session.disconnect();
    assert!(!session.is_connected());
    assert!(*fired.lock());
    assert!(matches!(
        session
            .send_management_query(ManagementOperation::GetSchema)
            .await,
        Err(ManagementError::NotConnected)
    ));

    // A second disconnect is a no-op.
    session.disconnect();
}

#[tokio::test]
async fn test_single_router_discovery() {
    let router = FakeRouter::new("R1");
    let session = connected(&router).await;

    let routers = TopologyResolver::new(&session)
        .discover(DiscoveryOptions::new(false, false))
        .await
        .unwrap();
    assert_eq!(routers, vec![interior("R1")]);
}

#[tokio::test]
async fn test_network_discovery_with_edges() {
    let (r1, r2) = (interior("R1"), interior("R2"));
    let router = FakeRouter::new("R1")
        .with_nodes(&["R1", "R2"])
        .with_edge(&r1, "E1")
        .with_edge(&r2, "E2")
        .with_edge(&r2, "E3");
    let session = connected(&router).await;

    let routers = TopologyResolver::new(&session)
        .discover(DiscoveryOptions::new(false, true))
        .await
        .unwrap();

    let names: Vec<_> = routers.iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["R1", "R2", "E1", "E2", "E3"]);
    assert_eq!(routers[2].address(), "amqp:/_edge/E1/$management");
}

#[tokio::test]
async fn test_collect_across_topology() {
    let (r1, e1) = (interior("R1"), RouterId::from_name("E1", RouterKind::Edge));
    let router = FakeRouter::new("R1")
        .with_edge(&r1, "E1")
        .with_entity(
            &r1,
            "router",
            &["name", "deliveriesIngress"],
            vec![vec![Value::from("R1"), Value::Ulong(5)]],
        )
        .with_entity(
            &e1,
            "router",
            &["name", "deliveriesIngress"],
            vec![vec![Value::from("E1"), Value::Ulong(9)]],
        );
    let session = connected(&router).await;

    let topology = TopologyResolver::new(&session)
        .discover(DiscoveryOptions::new(true, true))
        .await
        .unwrap();
    assert_eq!(topology, vec![r1.clone(), e1.clone()]);

    let groups = vec![StatGroup::new("router", ["deliveriesIngress"])];
    let stats = StatsCollector::new(&session)
        .collect(&topology, &groups)
        .await
        .unwrap();

    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].len(), 2);
    assert_eq!(
        stats[0][0].records()[0].get("deliveriesIngress"),
        Some(&Value::Ulong(5))
    );
    assert_eq!(
        stats[0][1].records()[0].get("deliveriesIngress"),
        Some(&Value::Ulong(9))
    );
}
