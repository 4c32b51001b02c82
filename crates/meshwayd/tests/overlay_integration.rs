//! End-to-end forwarding tests over loopback.
//!
//! Wires a real origin server, a relay, and an access proxy together on
//! ephemeral ports and drives requests through the overlay. Hop-list
//! entries embed their ports so every node can live on 127.0.0.1.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use meshway_forward::{
    AccessConfig, AccessProxy, BufferConfig, DomainResolver, PeerTransport, RelayConfig,
    RelayProxy,
};
use meshway_routing::{PathManager, RouteParams, TopologyGraph};

struct StaticResolver {
    origin: String,
}

impl DomainResolver for StaticResolver {
    fn origin_ip(&self, domain: &str) -> Option<String> {
        (domain == "example.com").then(|| self.origin.clone())
    }
}

/// Reserve an ephemeral port.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve a tiny origin returning a recognizable body.
async fn start_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/hello", get(|| async { "origin says hi" }))
        .route(
            "/echo",
            axum::routing::post(|body: String| async move { format!("echo:{body}") }),
        );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn wait_for_port(port: u16) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("port {port} never came up");
}

struct Overlay {
    http_port: u16,
    access: Arc<AccessProxy>,
    relay: Arc<RelayProxy>,
    _shutdown: watch::Sender<bool>,
}

/// Build access → relay → origin with the given origin port.
async fn start_overlay(origin_port: u16, response_timeout: Duration) -> Overlay {
    let http_port = free_port().await;
    let access_response_port = free_port().await;
    let relay_request_port = free_port().await;
    let relay_response_port = free_port().await;

    let origin_entry = format!("127.0.0.1:{origin_port}");
    let relay_entry = format!("127.0.0.1:{relay_request_port}");

    // Two-hop route: ingress → relay → origin.
    let mut topology = TopologyGraph::new();
    topology.add_link("127.0.0.1", &relay_entry, 1.0);
    topology.add_link(&relay_entry, &origin_entry, 1.0);
    let paths = Arc::new(PathManager::new(RouteParams::default()));
    paths
        .calculate_paths(&topology, "127.0.0.1", &origin_entry)
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = RelayProxy::new(
        RelayConfig {
            request_port: relay_request_port,
            response_port: relay_response_port,
            relay_request_port,
            access_response_port,
            relay_response_port,
            origin_port,
        },
        BufferConfig::default(),
        Arc::new(PeerTransport::new()),
    );
    tokio::spawn(Arc::clone(&relay).serve(shutdown_rx.clone()));

    let access = AccessProxy::new(
        AccessConfig {
            node_ip: "127.0.0.1".to_string(),
            http_port,
            response_port: access_response_port,
            relay_request_port,
            origin_port,
            response_timeout,
        },
        BufferConfig::default(),
        paths,
        Arc::new(StaticResolver {
            origin: origin_entry,
        }),
        Arc::new(PeerTransport::new()),
    );
    tokio::spawn(Arc::clone(&access).serve(shutdown_rx));

    wait_for_port(http_port).await;
    wait_for_port(relay_request_port).await;

    Overlay {
        http_port,
        access,
        relay,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn multi_hop_request_reaches_the_origin_and_back() {
    let origin_port = start_origin().await;
    let overlay = start_overlay(origin_port, Duration::from_secs(10)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/hello", overlay.http_port))
        .header("host", "example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "origin says hi");

    // Every tracked state on both nodes ended terminal, none stuck.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!overlay.access.states().is_empty());
    assert!(!overlay.relay.states().is_empty());
}

#[tokio::test]
async fn post_bodies_survive_the_overlay_roundtrip() {
    let origin_port = start_origin().await;
    let overlay = start_overlay(origin_port, Duration::from_secs(10)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/echo", overlay.http_port))
        .header("host", "example.com")
        .body("payload-123")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "echo:payload-123");
}

#[tokio::test]
async fn concurrent_requests_multiplex_over_the_same_route() {
    let origin_port = start_origin().await;
    let overlay = start_overlay(origin_port, Duration::from_secs(10)).await;

    let client = reqwest::Client::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let port = overlay.http_port;
        handles.push(tokio::spawn(async move {
            client
                .get(format!("http://127.0.0.1:{port}/hello"))
                .header("host", "example.com")
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), "origin says hi");
    }
}

#[tokio::test]
async fn no_path_yields_503_immediately() {
    let http_port = free_port().await;
    let response_port = free_port().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let access = AccessProxy::new(
        AccessConfig {
            node_ip: "127.0.0.1".to_string(),
            http_port,
            response_port,
            relay_request_port: 50056,
            origin_port: 8080,
            response_timeout: Duration::from_secs(5),
        },
        BufferConfig::default(),
        Arc::new(PathManager::new(RouteParams::default())),
        Arc::new(StaticResolver {
            origin: "127.0.0.1:1".to_string(),
        }),
        Arc::new(PeerTransport::new()),
    );
    tokio::spawn(Arc::clone(&access).serve(shutdown_rx));
    wait_for_port(http_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{http_port}/hello"))
        .header("host", "example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    drop(shutdown_tx);
}

#[tokio::test]
async fn dead_relay_yields_504_after_the_response_timeout() {
    let origin_port = start_origin().await;
    // Point the route at a relay port nobody listens on.
    let http_port = free_port().await;
    let response_port = free_port().await;
    let dead_relay = format!("127.0.0.1:{}", free_port().await);
    let origin_entry = format!("127.0.0.1:{origin_port}");

    let mut topology = TopologyGraph::new();
    topology.add_link("127.0.0.1", &dead_relay, 1.0);
    topology.add_link(&dead_relay, &origin_entry, 1.0);
    let paths = Arc::new(PathManager::new(RouteParams::default()));
    paths
        .calculate_paths(&topology, "127.0.0.1", &origin_entry)
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let access = AccessProxy::new(
        AccessConfig {
            node_ip: "127.0.0.1".to_string(),
            http_port,
            response_port,
            relay_request_port: 50056,
            origin_port,
            response_timeout: Duration::from_millis(700),
        },
        BufferConfig::default(),
        paths,
        Arc::new(StaticResolver {
            origin: origin_entry,
        }),
        Arc::new(PeerTransport::new()),
    );
    tokio::spawn(Arc::clone(&access).serve(shutdown_rx));
    wait_for_port(http_port).await;

    let started = std::time::Instant::now();
    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{http_port}/hello"))
        .header("host", "example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(shutdown_tx);
}

#[tokio::test]
async fn single_hop_route_uses_the_direct_proxy() {
    let origin_port = start_origin().await;
    let http_port = free_port().await;
    let response_port = free_port().await;
    let origin_entry = format!("127.0.0.1:{origin_port}");

    // One edge: ingress → origin, no relay involved.
    let mut topology = TopologyGraph::new();
    topology.add_link("127.0.0.1", &origin_entry, 1.0);
    let paths = Arc::new(PathManager::new(RouteParams::default()));
    paths
        .calculate_paths(&topology, "127.0.0.1", &origin_entry)
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let access = AccessProxy::new(
        AccessConfig {
            node_ip: "127.0.0.1".to_string(),
            http_port,
            response_port,
            relay_request_port: 50056,
            origin_port,
            response_timeout: Duration::from_secs(5),
        },
        BufferConfig::default(),
        paths,
        Arc::new(StaticResolver {
            origin: origin_entry,
        }),
        Arc::new(PeerTransport::new()),
    );
    tokio::spawn(Arc::clone(&access).serve(shutdown_rx));
    wait_for_port(http_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{http_port}/hello"))
        .header("host", "example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "origin says hi");
    drop(shutdown_tx);
}
