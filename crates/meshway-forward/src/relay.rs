//! Relay proxy — mid-path and terminal forwarding.
//!
//! Request frames arrive on the request listener: the relay increments the
//! hop counter and either forwards the re-packed frame to the next hop or,
//! at the terminal hop, reconstructs each contained HTTP request, issues it
//! against the origin, and batches the serialized responses for the return
//! trip. Response frames arrive on the response listener, get their hop
//! counter decremented, and continue towards the previous hop — the
//! ingress's response port when the counter reaches zero, another relay's
//! otherwise.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use meshway_frame::{FrameHeader, PreviousHop};

use crate::buffer::{BatchEntry, BufferConfig, BufferManager, ResponseEntry, SendOps};
use crate::error::{ForwardError, ForwardResult};
use crate::http::{parse_request, serialize_response};
use crate::state::{Direction, RequestState, RequestStateManager, RequestStatus};
use crate::transport::{run_frame_listener, InboundFrame, PeerTransport};

/// TTL for in-flight request states.
const STATE_EXPIRATION: Duration = Duration::from_secs(15 * 60);
/// Interval of the state TTL sweep.
const STATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Deadline for a terminal origin request.
const ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay configuration; every port is explicit.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Framed request ingress port.
    pub request_port: u16,
    /// Framed response ingress port.
    pub response_port: u16,
    /// Request port of downstream relays.
    pub relay_request_port: u16,
    /// Response port of the ingress node.
    pub access_response_port: u16,
    /// Response port of upstream relays.
    pub relay_response_port: u16,
    /// Origin HTTP port for terminal requests.
    pub origin_port: u16,
}

/// Send capabilities for the relay's buffer manager.
struct RelaySendOps {
    transport: Arc<PeerTransport>,
    states: Arc<RequestStateManager>,
    relay_request_port: u16,
    access_response_port: u16,
    relay_response_port: u16,
}

#[async_trait::async_trait]
impl SendOps for RelaySendOps {
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

    /// Decrement the hop counter and continue the response towards the
    /// previous hop.
    async fn forward_response(&self, frame: Bytes) -> ForwardResult<()> {
        let mut header = FrameHeader::unpack(&frame)?;
        let header_len = FrameHeader::peek_header_len(&frame)?;
        let payload = &frame[header_len..];

        header.decrement_hop()?;

        let addr = match header.previous_hop() {
            // Hop entries may embed their request port; responses always go
            // to the relay's response listener.
            PreviousHop::Relay { ip, .. } => {
                format!("{}:{}", host_of(&ip), self.relay_response_port)
            }
            PreviousHop::Ingress => {
                // The ingress is not carried in the hop list; it was
                // recorded when the request batch arrived.
                let ingress = header
                    .packet_ids
                    .iter()
                    .find_map(|id| self.states.meta(*id).and_then(|m| m.ingress_ip))
                    .ok_or_else(|| {
                        ForwardError::InvariantViolation(
                            "response reached hop zero with no recorded ingress".to_string(),
                        )
                    })?;
                format!("{}:{}", host_of(&ingress), self.access_response_port)
            }
        };

        let header_bytes = header.pack()?;
        let mut out = Vec::with_capacity(header_bytes.len() + payload.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);

        debug!(
            %addr,
            packets = header.packet_count(),
            hop_counter = header.hop_counter,
            "response forwarded to previous hop"
        );
        self.transport.send(&addr, Bytes::from(out)).await
    }
}

/// The mid-path relay server.
pub struct RelayProxy {
    config: RelayConfig,
    states: Arc<RequestStateManager>,
    buffer: Arc<BufferManager<RelaySendOps>>,
    transport: Arc<PeerTransport>,
    client: reqwest::Client,
}

impl RelayProxy {
    pub fn new(
        config: RelayConfig,
        buffer_config: BufferConfig,
        transport: Arc<PeerTransport>,
    ) -> Arc<Self> {
        let states = Arc::new(RequestStateManager::new(
            STATE_EXPIRATION,
            STATE_SWEEP_INTERVAL,
        ));
        let ops = RelaySendOps {
            transport: Arc::clone(&transport),
            states: Arc::clone(&states),
            relay_request_port: config.relay_request_port,
            access_response_port: config.access_response_port,
            relay_response_port: config.relay_response_port,
        };
        let buffer = Arc::new(BufferManager::new(buffer_config, ops, Arc::clone(&states)));

        Arc::new(Self {
            config,
            states,
            buffer,
            transport,
            client: reqwest::Client::new(),
        })
    }

    pub fn states(&self) -> Arc<RequestStateManager> {
        Arc::clone(&self.states)
    }

    /// Run the request and response listeners until shutdown.
    pub async fn serve(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> ForwardResult<()> {
        tokio::spawn(Arc::clone(&self.states).run_sweeper(shutdown.clone()));

        let request_listener = TcpListener::bind(("0.0.0.0", self.config.request_port)).await?;
        let (request_tx, request_rx) = mpsc::channel::<InboundFrame>(256);
        tokio::spawn(run_frame_listener(
            request_listener,
            request_tx,
            shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(&self).run_request_loop(request_rx, shutdown.clone()));

        let response_listener = TcpListener::bind(("0.0.0.0", self.config.response_port)).await?;
        let (response_tx, response_rx) = mpsc::channel::<InboundFrame>(256);
        tokio::spawn(run_frame_listener(
            response_listener,
            response_tx,
            shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(&self).run_response_loop(response_rx, shutdown.clone()));

        info!(
            request_port = self.config.request_port,
            response_port = self.config.response_port,
            "relay proxy listening"
        );

        let mut shutdown = shutdown;
        let _ = shutdown.changed().await;
        self.buffer.flush_all().await;
        info!("relay proxy stopped");
        Ok(())
    }

    async fn run_request_loop(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<InboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { return };
                    let relay = Arc::clone(&self);
                    let peer_ip = frame.peer.ip().to_string();
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_request_frame(frame.data, &peer_ip).await {
                            warn!(peer = %peer_ip, error = %e, "request frame dropped");
                        }
                    });
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_response_loop(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<InboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { return };
                    let relay = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_response_frame(frame.data).await {
                            warn!(error = %e, "response frame dropped");
                        }
                    });
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Process one inbound request batch.
    async fn handle_request_frame(
        self: &Arc<Self>,
        data: Bytes,
        peer_ip: &str,
    ) -> ForwardResult<()> {
        let mut header = FrameHeader::unpack(&data)?;
        let header_len = FrameHeader::peek_header_len(&data)?;
        let payload = data.slice(header_len..);

        header.increment_hop()?;
        let (next_hop, is_last) = {
            let (hop, last) = header.next_hop()?;
            (hop.to_string(), last)
        };
        debug!(
            packets = header.packet_count(),
            hop_counter = header.hop_counter,
            %next_hop,
            is_last,
            "request frame received"
        );

        let positions = header.request_positions();
        for (i, &request_id) in header.packet_ids.iter().enumerate() {
            let slice = payload.slice(positions[i]..positions[i + 1]);
            let mut state = RequestState::new(
                request_id,
                Direction::Transit,
                is_last,
                next_hop.clone(),
                header.hop_list.clone(),
                slice,
            );
            state.ingress_ip = Some(peer_ip.to_string());
            self.states.insert(state);
        }

        if is_last {
            // Terminal hop: every contained request becomes an origin call.
            for &request_id in &header.packet_ids {
                let relay = Arc::clone(self);
                let hop_list = header.hop_list.clone();
                let hop_counter = header.hop_counter;
                let next_hop = next_hop.clone();
                tokio::spawn(async move {
                    match relay.handle_terminal_request(request_id, &next_hop).await {
                        Ok(response_data) => {
                            relay
                                .buffer
                                .process_response(ResponseEntry {
                                    request_id,
                                    data: response_data,
                                    hop_list,
                                    hop_counter,
                                })
                                .await;
                        }
                        Err(e) => {
                            warn!(request_id, error = %e, "terminal request failed");
                            let _ = relay
                                .states
                                .update_status(request_id, RequestStatus::Failed);
                        }
                    }
                });
            }
        } else {
            // Mid-path: forward the whole batch with the bumped counter.
            let header_bytes = header.pack()?;
            let mut out = Vec::with_capacity(header_bytes.len() + payload.len());
            out.extend_from_slice(&header_bytes);
            out.extend_from_slice(&payload);

            let addr = join_host_port(&next_hop, self.config.relay_request_port);
            match self.transport.send(&addr, Bytes::from(out)).await {
                Ok(()) => {
                    for &request_id in &header.packet_ids {
                        let _ = self.states.update_status(request_id, RequestStatus::Sent);
                    }
                }
                Err(e) => {
                    for &request_id in &header.packet_ids {
                        let _ = self.states.update_status(request_id, RequestStatus::Failed);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reconstruct one contained request and execute it against the origin.
    async fn handle_terminal_request(
        &self,
        request_id: u32,
        origin_ip: &str,
    ) -> ForwardResult<Bytes> {
        self.states.update_status(request_id, RequestStatus::Sent)?;
        let meta = self
            .states
            .meta(request_id)
            .ok_or(ForwardError::UnknownRequest(request_id))?;

        let parsed = parse_request(&meta.data)?;
        let url = format!(
            "http://{}{}",
            join_host_port(origin_ip, self.config.origin_port),
            parsed.path
        );
        debug!(request_id, %url, "terminal origin request");

        let mut request = self
            .client
            .request(
                reqwest::Method::from_bytes(parsed.method.as_bytes())
                    .map_err(|e| ForwardError::HttpParse(e.to_string()))?,
                &url,
            )
            .timeout(ORIGIN_TIMEOUT)
            .body(parsed.body.clone());
        for (name, value) in &parsed.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        self.states
            .update_status(request_id, RequestStatus::Responding)?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?;

        self.states
            .update_status(request_id, RequestStatus::Completed)?;
        Ok(serialize_response(status, &headers, &body))
    }

    /// Pass a transit response towards the previous hop.
    async fn handle_response_frame(self: &Arc<Self>, data: Bytes) -> ForwardResult<()> {
        // Completion of any locally tracked requests is bookkeeping only;
        // the response routes purely on its header.
        if let Ok(header) = FrameHeader::unpack(&data) {
            for &request_id in &header.packet_ids {
                if self.states.status(request_id).is_some() {
                    let _ = self
                        .states
                        .update_status(request_id, RequestStatus::Responding);
                    let _ = self
                        .states
                        .update_status(request_id, RequestStatus::Completed);
                }
            }
        }
        self.buffer.ops().forward_response(data).await
    }
}

fn join_host_port(host: &str, default_port: u16) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    }
}

fn host_of(addr: &str) -> &str {
    addr.split(':').next().unwrap_or(addr)
}
