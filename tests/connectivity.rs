//! Integration tests for node connectivity.
//!
//! Nodes run on the in-memory network, mostly with public-looking hosts;
//! one test puts two nodes on the same private LAN. The last test runs two
//! nodes over real TCP on loopback.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test connectivity -- --nocapture

use std::sync::{Arc, Once};
use std::time::Duration;

use peerlink::pending::RequestKind;
use peerlink::task::{NeutralTrust, TaskEvent};
use peerlink::transport::{DialError, DialFault, MemoryNetwork, SessionRef};
use peerlink::{AddressCandidate, Keypair, NatType, Node, NodeConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(name: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.name = name.to_string();
    config.overlay.port_start = 40100;
    config.overlay.port_end = 40199;
    config.overlay.sync_interval = Duration::from_millis(100);
    config.task.port_start = 40200;
    config.task.port_end = 40299;
    config.connections.tick_interval = Duration::from_millis(20);
    config.connections.dial_timeout = Duration::from_millis(500);
    config.challenge.enabled = false;
    config
}

async fn memory_node(network: &MemoryNetwork, host: &str, config: NodeConfig) -> Node {
    let transport = Arc::new(network.host(host));
    Node::with_transport(
        Keypair::generate(),
        config,
        transport.clone(),
        transport,
        host,
        Arc::new(NeutralTrust),
    )
    .await
    .expect("node failed to start")
}

async fn overlay_addr(node: &Node) -> AddressCandidate {
    node.node_info()
        .await
        .p2p_candidates()
        .into_iter()
        .next()
        .expect("node has no overlay address")
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn connect_overlay(from: &Node, to: &Node) {
    from.add_seed(overlay_addr(to).await).await.expect("dial failed");
    let (a, b) = (from.identity(), to.identity());
    wait_for("overlay handshake", || async { from.is_connected(&b).await && to.is_connected(&a).await }).await;
}

async fn next_event(events: &mut mpsc::Receiver<TaskEvent>) -> TaskEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("no task event in time")
        .expect("task event channel closed")
}

async fn recv_frame(session: &SessionRef) -> Vec<u8> {
    timeout(TEST_TIMEOUT, session.recv())
        .await
        .expect("no frame in time")
        .expect("session closed")
}

/// Waits for both ends of one task session and checks they talk to each other.
async fn expect_session(
    requestor: &mut mpsc::Receiver<TaskEvent>,
    provider: &mut mpsc::Receiver<TaskEvent>,
    request: peerlink::RequestId,
    payload: &[u8],
) -> (SessionRef, SessionRef) {
    let requestor_side = match next_event(requestor).await {
        TaskEvent::SessionReady { request: ready, session, .. } => {
            assert_eq!(ready, request);
            session
        }
        other => panic!("expected SessionReady, got {other:?}"),
    };
    let provider_side = match next_event(provider).await {
        TaskEvent::IncomingSession { request: seen, kind, session, .. } => {
            assert_eq!(seen, request);
            assert_eq!(kind, RequestKind::TaskRequest);
            session
        }
        other => panic!("expected IncomingSession, got {other:?}"),
    };

    assert_eq!(recv_frame(&provider_side).await, payload);
    provider_side.send(b"accepted".to_vec()).await.expect("reply failed");
    assert_eq!(recv_frame(&requestor_side).await, b"accepted".to_vec());
    (requestor_side, provider_side)
}

#[tokio::test]
async fn challenged_handshake_connects_both_sides() {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut config = test_config("a");
    config.challenge.enabled = true;
    let a = memory_node(&network, "198.51.100.1", config.clone()).await;
    let b = memory_node(&network, "198.51.100.2", config).await;

    connect_overlay(&b, &a).await;

    let seen = a.peers().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].identity, b.identity());
    assert!(seen[0].task_prv_port.is_some(), "peer record carries the task port");

    a.quit().await;
    b.quit().await;
}

#[tokio::test]
async fn direct_task_session() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = memory_node(&network, "198.51.100.1", test_config("requestor")).await;
    let b = memory_node(&network, "198.51.100.2", test_config("provider")).await;
    let mut a_events = a.task_events().await.unwrap();
    let mut b_events = b.task_events().await.unwrap();
    assert!(a.task_events().await.is_err(), "events can be taken once");

    let request = a
        .connect_task(RequestKind::TaskRequest, b.node_info().await, None, vec![b"job".to_vec()])
        .await
        .unwrap();
    expect_session(&mut a_events, &mut b_events, request, b"job").await;
}

#[tokio::test]
async fn nodes_on_the_same_lan_connect() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = memory_node(&network, "192.168.1.2", test_config("requestor")).await;
    let b = memory_node(&network, "192.168.1.3", test_config("provider")).await;
    let mut a_events = a.task_events().await.unwrap();
    let mut b_events = b.task_events().await.unwrap();

    connect_overlay(&b, &a).await;

    let request = a
        .connect_task(RequestKind::TaskRequest, b.node_info().await, None, vec![b"job".to_vec()])
        .await
        .unwrap();
    expect_session(&mut a_events, &mut b_events, request, b"job").await;
}

#[tokio::test]
async fn unreachable_provider_dials_back() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = memory_node(&network, "198.51.100.1", test_config("requestor")).await;
    let b = memory_node(&network, "198.51.100.2", test_config("provider")).await;
    let mut a_events = a.task_events().await.unwrap();
    let mut b_events = b.task_events().await.unwrap();
    connect_overlay(&b, &a).await;

    let provider = b.node_info().await;
    let blocked = provider.task_candidates();
    for addr in &blocked {
        network.set_fault(addr, DialFault::Fail(DialError::Refused));
    }

    let request = a
        .connect_task(RequestKind::TaskRequest, provider, None, vec![b"job".to_vec()])
        .await
        .unwrap();
    expect_session(&mut a_events, &mut b_events, request, b"job").await;

    assert_eq!(network.dial_count(&blocked[0]), 1);
    assert_eq!(a.tasks().forwarded_count().await, 0);
}

/// Supernode `s`, requestor `a` and a provider `d` behind a NAT of the
/// given class whose task port nobody can dial.
struct Mediated {
    network: MemoryNetwork,
    s: Node,
    a: Node,
    d: Node,
}

async fn mediated(nat: NatType) -> Mediated {
    let network = MemoryNetwork::new();
    let mut s_config = test_config("supernode");
    s_config.public_addr = Some("203.0.113.1".into());
    s_config.nat_type = NatType::OpenInternet;
    let s = memory_node(&network, "203.0.113.1", s_config).await;
    assert!(s.node_info().await.is_supernode());

    let a = memory_node(&network, "198.51.100.1", test_config("requestor")).await;
    let mut d_config = test_config("provider");
    d_config.nat_type = nat;
    let d = memory_node(&network, "198.51.100.3", d_config).await;

    connect_overlay(&a, &s).await;
    connect_overlay(&d, &s).await;
    for addr in d.node_info().await.task_candidates() {
        network.set_fault(&addr, DialFault::Fail(DialError::Refused));
    }
    Mediated { network, s, a, d }
}

#[tokio::test]
async fn symmetric_nat_provider_is_relayed() {
    init_tracing();
    let Mediated { network, s, a, d } = mediated(NatType::Symmetric).await;
    let mut a_events = a.task_events().await.unwrap();
    let mut d_events = d.task_events().await.unwrap();

    let supernode = s.node_info().await;
    let request = a
        .connect_task(RequestKind::TaskRequest, d.node_info().await, Some(supernode), vec![b"job".to_vec()])
        .await
        .unwrap();
    let (a_side, d_side) = expect_session(&mut a_events, &mut d_events, request, b"job").await;

    assert_eq!(s.relay().session_count().await, 1);
    let rendezvous = a.tasks().rendezvous_for(request).await;
    assert!(rendezvous.is_none(), "finished rendezvous is no longer active");

    // Closing one leg tears down the other.
    a_side.close().await;
    let closed = timeout(TEST_TIMEOUT, d_side.recv()).await.expect("relay kept the leg open");
    assert!(closed.is_none());
    wait_for("relay teardown", || async { s.relay().session_count().await == 0 }).await;
    drop(network);
}

#[tokio::test]
async fn full_cone_provider_is_reached_through_punch() {
    init_tracing();
    let Mediated { s, a, d, .. } = mediated(NatType::FullCone).await;
    let mut a_events = a.task_events().await.unwrap();
    let mut d_events = d.task_events().await.unwrap();

    let supernode = s.node_info().await;
    let request = a
        .connect_task(RequestKind::TaskRequest, d.node_info().await, Some(supernode), vec![b"job".to_vec()])
        .await
        .unwrap();
    expect_session(&mut a_events, &mut d_events, request, b"job").await;

    assert_eq!(s.relay().session_count().await, 0, "punch never falls back to the relay");
}

#[tokio::test]
async fn provider_without_any_route_fails_once() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = memory_node(&network, "198.51.100.1", test_config("requestor")).await;
    let mut a_events = a.task_events().await.unwrap();

    let mut ghost = peerlink::NodeInfo::new(Keypair::generate().identity(), "ghost");
    ghost.prv_addr = Some("198.51.100.77".into());
    ghost.task_prv_port = Some(40200);

    let request = a
        .connect_task(RequestKind::TaskRequest, ghost.clone(), None, Vec::new())
        .await
        .unwrap();
    match next_event(&mut a_events).await {
        TaskEvent::RequestFailed { request: failed, peer, .. } => {
            assert_eq!(failed, request);
            assert_eq!(peer, ghost.identity);
        }
        other => panic!("expected RequestFailed, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(300), a_events.recv()).await.is_err());
}

#[tokio::test]
async fn tcp_loopback_session() {
    init_tracing();
    let mut config = NodeConfig::default();
    config.overlay.port_start = 47200;
    config.overlay.port_end = 47299;
    config.task.port_start = 47300;
    config.task.port_end = 47399;
    config.connections.tick_interval = Duration::from_millis(20);

    let a = Node::bind(config.clone(), "127.0.0.1").await.expect("bind failed");
    let b = Node::bind(config, "127.0.0.1").await.expect("bind failed");
    let mut a_events = a.task_events().await.unwrap();
    let mut b_events = b.task_events().await.unwrap();

    connect_overlay(&b, &a).await;

    let request = a
        .connect_task(RequestKind::TaskRequest, b.node_info().await, None, vec![b"over tcp".to_vec()])
        .await
        .unwrap();
    expect_session(&mut a_events, &mut b_events, request, b"over tcp").await;

    a.quit().await;
    b.quit().await;
}
