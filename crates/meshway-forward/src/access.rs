//! Access proxy — overlay ingress.
//!
//! Accepts end-user HTTP requests, picks a path via the weighted
//! round-robin over the current path set, and either proxies directly to
//! the origin (single-hop path) or serializes the request into the buffer
//! manager for batched relay forwarding. Responses arrive on a separate
//! framed listener and are matched back to waiting callers by request ID.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use meshway_frame::FrameHeader;
use meshway_routing::{PathManager, WeightedRoundRobin};

use crate::buffer::{BatchEntry, BufferConfig, BufferManager, SendOps};
use crate::error::{ForwardError, ForwardResult};
use crate::http::{parse_response, serialize_request};
use crate::state::{Direction, RequestState, RequestStateManager, RequestStatus};
use crate::transport::{run_frame_listener, InboundFrame, PeerTransport};

/// Maximum request body accepted at ingress.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
/// Deadline for handing a request to the buffer manager.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL for in-flight request states.
const STATE_EXPIRATION: Duration = Duration::from_secs(15 * 60);
/// Interval of the state TTL sweep.
const STATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Resolves the origin server for a requested domain.
pub trait DomainResolver: Send + Sync + 'static {
    fn origin_ip(&self, domain: &str) -> Option<String>;
}

/// Access proxy configuration; every port is explicit.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// This node's overlay IP (paths start here).
    pub node_ip: String,
    /// End-user HTTP ingress port.
    pub http_port: u16,
    /// Framed response ingress port.
    pub response_port: u16,
    /// Relay request port on next hops.
    pub relay_request_port: u16,
    /// Origin HTTP port for single-hop direct proxying.
    pub origin_port: u16,
    /// How long a caller waits for its response.
    pub response_timeout: Duration,
}

/// Outbound send capabilities handed to the buffer manager.
struct AccessSendOps {
    transport: Arc<PeerTransport>,
    relay_request_port: u16,
}

#[async_trait::async_trait]
impl SendOps for AccessSendOps {
    async fn send_single(&self, entry: &BatchEntry, next_hop_ip: &str) -> ForwardResult<()> {
        let mut header =
            FrameHeader::new(vec![entry.request_id], entry.hop_list.clone(), &[entry.data.len()])?;
        header.hop_counter = entry.hop_counter;

        let header_bytes = header.pack()?;
        let mut frame = Vec::with_capacity(header_bytes.len() + entry.data.len());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&entry.data);

        let addr = join_host_port(next_hop_ip, self.relay_request_port);
        self.transport.send(&addr, Bytes::from(frame)).await
    }

    async fn send_merged(&self, frame: Bytes, next_hop_ip: &str) -> ForwardResult<()> {
        let addr = join_host_port(next_hop_ip, self.relay_request_port);
        self.transport.send(&addr, frame).await
    }

    async fn forward_response(&self, _frame: Bytes) -> ForwardResult<()> {
        Err(ForwardError::InvariantViolation(
            "access proxy has no previous hop".to_string(),
        ))
    }
}

/// The overlay ingress server.
pub struct AccessProxy {
    config: AccessConfig,
    states: Arc<RequestStateManager>,
    buffer: Arc<BufferManager<AccessSendOps>>,
    paths: Arc<PathManager>,
    resolver: Arc<dyn DomainResolver>,
    client: reqwest::Client,
    counter: AtomicU32,
}

impl AccessProxy {
    pub fn new(
        config: AccessConfig,
        buffer_config: BufferConfig,
        paths: Arc<PathManager>,
        resolver: Arc<dyn DomainResolver>,
        transport: Arc<PeerTransport>,
    ) -> Arc<Self> {
        let states = Arc::new(RequestStateManager::new(
            STATE_EXPIRATION,
            STATE_SWEEP_INTERVAL,
        ));
        let ops = AccessSendOps {
            transport,
            relay_request_port: config.relay_request_port,
        };
        let buffer = Arc::new(BufferManager::new(buffer_config, ops, Arc::clone(&states)));

        Arc::new(Self {
            config,
            states,
            buffer,
            paths,
            resolver,
            client: reqwest::Client::new(),
            counter: AtomicU32::new(0),
        })
    }

    pub fn states(&self) -> Arc<RequestStateManager> {
        Arc::clone(&self.states)
    }

    /// Run the ingress HTTP server, the response listener, and the state
    /// sweeper until shutdown.
    pub async fn serve(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> ForwardResult<()> {
        tokio::spawn(Arc::clone(&self.states).run_sweeper(shutdown.clone()));

        let response_listener = TcpListener::bind(("0.0.0.0", self.config.response_port)).await?;
        let (frame_tx, frame_rx) = mpsc::channel::<InboundFrame>(256);
        tokio::spawn(run_frame_listener(
            response_listener,
            frame_tx,
            shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(&self).run_response_loop(frame_rx, shutdown.clone()));

        let http_listener = TcpListener::bind(("0.0.0.0", self.config.http_port)).await?;
        info!(port = self.config.http_port, "access proxy listening");

        let router: Router = Router::new()
            .fallback(handle_ingress)
            .with_state(Arc::clone(&self));

        let mut shutdown = shutdown;
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        // Drain pending batches on the way out.
        self.buffer.flush_all().await;
        info!("access proxy stopped");
        Ok(())
    }

    /// Unique 32-bit request ID from a monotonic counter, wall-clock
    /// seconds/nanos, and a small random component.
    fn mint_request_id(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let time_component = (now.as_secs() as u32) ^ now.subsec_nanos();
        let random_component: u32 = rand::thread_rng().gen_range(0..1000);
        time_component ^ (counter << 10) ^ random_component
    }

    /// Pick a path for the requested domain.
    fn select_path(&self, domain: Option<&str>) -> Option<Vec<String>> {
        let origin = match domain.and_then(|d| self.resolver.origin_ip(d)) {
            Some(origin) => origin,
            None => {
                // No mapping for the Host header; a single known
                // destination is unambiguous.
                let mut destinations = self.paths.destinations();
                if destinations.len() == 1 {
                    destinations.remove(0)
                } else {
                    return None;
                }
            }
        };

        let snapshot = self.paths.paths_for(&origin);
        let wrr = WeightedRoundRobin::new(snapshot);
        let chosen = wrr.next()?;

        // The hop list excludes this node; it starts at the first relay
        // and ends at the origin.
        let hop_list: Vec<String> = if chosen.ips.first() == Some(&self.config.node_ip) {
            chosen.ips[1..].to_vec()
        } else {
            chosen.ips.clone()
        };
        (!hop_list.is_empty()).then_some(hop_list)
    }

    /// Forward directly to the origin when this node is the last hop.
    async fn direct_proxy(
        &self,
        request_id: u32,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        origin_ip: &str,
    ) -> ForwardResult<Response> {
        self.states.update_status(request_id, RequestStatus::Sent)?;

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!(
            "http://{}{}",
            join_host_port(origin_ip, self.config.origin_port),
            path
        );

        let mut request = self
            .client
            .request(
                reqwest::Method::from_bytes(method.as_str().as_bytes())
                    .map_err(|e| ForwardError::HttpParse(e.to_string()))?,
                &url,
            )
            .timeout(self.config.response_timeout)
            .body(body);
        for (name, value) in headers {
            if name == axum::http::header::HOST {
                continue;
            }
            if let Ok(v) = value.to_str() {
                request = request.header(name.as_str(), v);
            }
        }

        let origin_response = request.send().await?;
        self.states
            .update_status(request_id, RequestStatus::Responding)?;

        let status = origin_response.status();
        let response_headers = origin_response.headers().clone();
        let body = origin_response.bytes().await?;
        self.states
            .update_status(request_id, RequestStatus::Completed)?;

        let mut response = Response::builder().status(status.as_u16());
        for (name, value) in &response_headers {
            if name == reqwest::header::TRANSFER_ENCODING || name == reqwest::header::CONNECTION {
                continue;
            }
            response = response.header(name.as_str(), value.as_bytes());
        }
        response
            .body(Body::from(body))
            .map_err(|e| ForwardError::HttpParse(e.to_string()))
    }

    /// Submit a request into the buffer and wait for its response frame.
    async fn relay_and_wait(
        &self,
        buffer: &Arc<BufferManager<AccessSendOps>>,
        request_id: u32,
        hop_list: Vec<String>,
        data: Bytes,
        rx: oneshot::Receiver<Bytes>,
    ) -> ForwardResult<Response> {
        let submit = buffer.process_request(BatchEntry {
            request_id,
            data,
            hop_list,
            hop_counter: 0,
        });
        match tokio::time::timeout(SUBMIT_TIMEOUT, submit).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = self.states.update_status(request_id, RequestStatus::Failed);
                return Err(ForwardError::QueueFull);
            }
        }

        let raw = match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => {
                let _ = self.states.update_status(request_id, RequestStatus::Failed);
                return Err(ForwardError::PeerSend("response channel closed".to_string()));
            }
            Err(_) => {
                let _ = self.states.update_status(request_id, RequestStatus::Failed);
                return Err(ForwardError::ResponseTimeout);
            }
        };

        let parsed = parse_response(&raw)?;
        let mut response = Response::builder().status(parsed.status);
        for (name, value) in &parsed.headers {
            if name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response = response.header(n, v);
            }
        }
        response
            .body(Body::from(parsed.body))
            .map_err(|e| ForwardError::HttpParse(e.to_string()))
    }

    /// Consume inbound response frames and wake the matching callers.
    async fn run_response_loop(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<InboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = self.handle_response_frame(&frame.data) {
                        warn!(peer = %frame.peer, error = %e, "response frame dropped");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn handle_response_frame(&self, data: &[u8]) -> ForwardResult<()> {
        let header = FrameHeader::unpack(data)?;
        let header_len = FrameHeader::peek_header_len(data)?;
        let payload = &data[header_len..];
        let positions = header.request_positions();

        debug!(
            packets = header.packet_count(),
            "response frame received"
        );

        for (i, &request_id) in header.packet_ids.iter().enumerate() {
            let slice = &payload[positions[i]..positions[i + 1]];
            if self
                .states
                .update_status(request_id, RequestStatus::Responding)
                .is_err()
            {
                warn!(request_id, "response for unknown request discarded");
                continue;
            }
            match self.states.take_notifier(request_id) {
                Some(notifier) => {
                    let _ = notifier.send(Bytes::copy_from_slice(slice));
                    let _ = self
                        .states
                        .update_status(request_id, RequestStatus::Completed);
                }
                None => {
                    warn!(request_id, "no caller waiting, response discarded");
                    let _ = self.states.update_status(request_id, RequestStatus::Failed);
                }
            }
        }
        Ok(())
    }
}

/// The catch-all ingress handler.
async fn handle_ingress(
    State(proxy): State<Arc<AccessProxy>>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return plain(StatusCode::BAD_REQUEST, "request body too large"),
    };

    let domain = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());

    let Some(hop_list) = proxy.select_path(domain.as_deref()) else {
        debug!(?domain, "no path available for request");
        return plain(StatusCode::SERVICE_UNAVAILABLE, "no path available");
    };

    let request_id = proxy.mint_request_id();
    let next_hop = hop_list[0].clone();
    let is_last = hop_list.len() == 1;
    debug!(request_id, %next_hop, is_last, "request admitted");

    if is_last {
        let mut state = RequestState::new(
            request_id,
            Direction::Ingress,
            true,
            next_hop.clone(),
            hop_list,
            Bytes::new(),
        );
        state.notifier = None;
        proxy.states.insert(state);

        return match proxy
            .direct_proxy(
                request_id,
                parts.method,
                &parts.uri,
                &parts.headers,
                body,
                &next_hop,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id, error = %e, "direct proxy failed");
                let _ = proxy
                    .states
                    .update_status(request_id, RequestStatus::Failed);
                plain(StatusCode::INTERNAL_SERVER_ERROR, "upstream request failed")
            }
        };
    }

    // Multi-hop: serialize the request and travel the overlay.
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let header_pairs: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();
    let raw = serialize_request(parts.method.as_str(), path, &header_pairs, &body);

    let (tx, rx) = oneshot::channel();
    let mut state = RequestState::new(
        request_id,
        Direction::Ingress,
        false,
        next_hop,
        hop_list.clone(),
        raw.clone(),
    );
    state.notifier = Some(tx);
    proxy.states.insert(state);

    match proxy
        .relay_and_wait(&proxy.buffer, request_id, hop_list, raw, rx)
        .await
    {
        Ok(response) => response,
        Err(ForwardError::ResponseTimeout) => {
            warn!(request_id, "response wait timed out");
            plain(StatusCode::GATEWAY_TIMEOUT, "no response from overlay")
        }
        Err(ForwardError::QueueFull) => {
            warn!(request_id, "buffer submission timed out");
            plain(StatusCode::SERVICE_UNAVAILABLE, "overlay is overloaded")
        }
        Err(e) => {
            warn!(request_id, error = %e, "relay submission failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "forwarding failed")
        }
    }
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

fn join_host_port(host: &str, default_port: u16) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshway_routing::RouteParams;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, String>);

    impl DomainResolver for MapResolver {
        fn origin_ip(&self, domain: &str) -> Option<String> {
            self.0.get(domain).cloned()
        }
    }

    fn test_proxy(paths: Arc<PathManager>) -> Arc<AccessProxy> {
        let resolver = MapResolver(HashMap::from([(
            "example.com".to_string(),
            "203.0.113.10".to_string(),
        )]));
        AccessProxy::new(
            AccessConfig {
                node_ip: "10.0.0.1".to_string(),
                http_port: 0,
                response_port: 0,
                relay_request_port: 50056,
                origin_port: 8080,
                response_timeout: Duration::from_secs(30),
            },
            BufferConfig::default(),
            paths,
            Arc::new(resolver),
            Arc::new(PeerTransport::new()),
        )
    }

    fn seeded_paths() -> Arc<PathManager> {
        let manager = PathManager::new(RouteParams::default());
        let mut topo = meshway_routing::TopologyGraph::new();
        topo.add_link("10.0.0.1", "10.0.0.2", 10.0);
        topo.add_link("10.0.0.2", "203.0.113.10", 10.0);
        topo.add_link("10.0.0.1", "203.0.113.10", 40.0);
        manager
            .calculate_paths(&topo, "10.0.0.1", "203.0.113.10")
            .unwrap();
        Arc::new(manager)
    }

    #[test]
    fn request_ids_are_unique_enough() {
        let proxy = test_proxy(Arc::new(PathManager::new(RouteParams::default())));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            seen.insert(proxy.mint_request_id());
        }
        // The counter component guarantees spread even within one tick.
        assert!(seen.len() > 990);
    }

    #[test]
    fn select_path_strips_self_from_hop_list() {
        let proxy = test_proxy(seeded_paths());
        let hop_list = proxy.select_path(Some("example.com")).unwrap();
        assert_ne!(hop_list[0], "10.0.0.1");
        assert_eq!(hop_list.last().map(String::as_str), Some("203.0.113.10"));
    }

    #[test]
    fn select_path_without_mapping_falls_back_to_single_destination() {
        let proxy = test_proxy(seeded_paths());
        assert!(proxy.select_path(Some("unmapped.com")).is_some());
        assert!(proxy.select_path(None).is_some());
    }

    #[test]
    fn select_path_with_no_routes_is_none() {
        let proxy = test_proxy(Arc::new(PathManager::new(RouteParams::default())));
        assert!(proxy.select_path(Some("example.com")).is_none());
    }

    #[tokio::test]
    async fn response_frame_wakes_the_waiting_caller() {
        let proxy = test_proxy(seeded_paths());

        let (tx, mut rx) = oneshot::channel();
        let mut state = RequestState::new(
            42,
            Direction::Ingress,
            false,
            "10.0.0.2".to_string(),
            vec!["10.0.0.2".to_string(), "203.0.113.10".to_string()],
            Bytes::new(),
        );
        state.notifier = Some(tx);
        proxy.states.insert(state);
        proxy.states.update_status(42, RequestStatus::Buffered).unwrap();
        proxy.states.update_status(42, RequestStatus::Sent).unwrap();

        let body = crate::http::serialize_response(200, &[], b"hi");
        let mut header = FrameHeader::new(
            vec![42],
            vec!["10.0.0.2".to_string(), "203.0.113.10".to_string()],
            &[body.len()],
        )
        .unwrap();
        header.hop_counter = 0;
        let mut frame = header.pack().unwrap();
        frame.extend_from_slice(&body);

        proxy.handle_response_frame(&frame).unwrap();

        let raw = rx.try_recv().unwrap();
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body.as_ref(), b"hi");
        assert_eq!(proxy.states.status(42), Some(RequestStatus::Completed));
    }

    #[tokio::test]
    async fn response_for_unknown_request_is_discarded() {
        let proxy = test_proxy(seeded_paths());
        let body = crate::http::serialize_response(200, &[], b"hi");
        let mut frame = FrameHeader::new(vec![999], vec!["x".to_string()], &[body.len()])
            .unwrap()
            .pack()
            .unwrap();
        frame.extend_from_slice(&body);

        // Unknown IDs are logged and skipped; the frame itself is fine.
        proxy.handle_response_frame(&frame).unwrap();
    }

    #[tokio::test]
    async fn malformed_response_frame_is_rejected() {
        let proxy = test_proxy(seeded_paths());
        assert!(proxy.handle_response_frame(&[1, 2]).is_err());
    }
}
