//! Request batching towards the next hop.
//!
//! Requests that travel the same remaining route within a short window are
//! merged into one framed batch, amortizing connection and framing cost.
//! A batch flushes when it reaches the count cap, the byte cap, or when
//! its first-insert age hits the merge window. The response side mirrors
//! the grouping on the way back.
//!
//! The manager never talks to the proxies directly: the send capabilities
//! are injected at construction, which keeps the proxy → buffer → proxy
//! cycle out of the type graph.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use meshway_frame::FrameHeader;

use crate::error::ForwardResult;
use crate::state::{RequestStateManager, RequestStatus};

/// Batching thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Maximum age of a batch before a timed flush.
    pub merge_window: Duration,
    /// Flush when a batch holds this many requests.
    pub max_merge_count: usize,
    /// Flush when a batch holds this many payload bytes.
    pub max_merge_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            merge_window: Duration::from_millis(10),
            max_merge_count: 10,
            max_merge_bytes: 64 * 1024,
        }
    }
}

/// Send capabilities injected by the owning proxy.
#[async_trait::async_trait]
pub trait SendOps: Send + Sync + 'static {
    /// Ship a single request towards its next hop.
    async fn send_single(&self, entry: &BatchEntry, next_hop_ip: &str) -> ForwardResult<()>;

    /// Ship a prebuilt merged frame towards the next hop.
    async fn send_merged(&self, frame: Bytes, next_hop_ip: &str) -> ForwardResult<()>;

    /// Ship a prebuilt response frame back towards the previous hop.
    async fn forward_response(&self, frame: Bytes) -> ForwardResult<()>;
}

/// One buffered outbound request.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub request_id: u32,
    pub data: Bytes,
    pub hop_list: Vec<String>,
    pub hop_counter: u8,
}

/// One buffered response awaiting the return trip.
#[derive(Debug, Clone)]
pub struct ResponseEntry {
    pub request_id: u32,
    pub data: Bytes,
    pub hop_list: Vec<String>,
    pub hop_counter: u8,
}

/// Requests merge only when their remaining route is identical, which
/// also pins the next hop.
type RouteKey = (Vec<String>, u8);

struct Pending<T> {
    entries: Vec<T>,
    bytes: usize,
    generation: u64,
}

/// Merges requests and responses into framed batches.
pub struct BufferManager<S: SendOps> {
    config: BufferConfig,
    ops: S,
    states: Arc<RequestStateManager>,
    forward: Mutex<HashMap<RouteKey, Pending<BatchEntry>>>,
    response: Mutex<HashMap<RouteKey, Pending<ResponseEntry>>>,
    generation: AtomicU64,
}

impl<S: SendOps> BufferManager<S> {
    pub fn new(config: BufferConfig, ops: S, states: Arc<RequestStateManager>) -> Self {
        Self {
            config,
            ops,
            states,
            forward: Mutex::new(HashMap::new()),
            response: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ops(&self) -> &S {
        &self.ops
    }

    /// Accept an outbound request into its route batch.
    pub async fn process_request(self: &Arc<Self>, entry: BatchEntry) -> ForwardResult<()> {
        self.states
            .update_status(entry.request_id, RequestStatus::Buffered)?;

        let key: RouteKey = (entry.hop_list.clone(), entry.hop_counter);
        let flush_now = {
            let mut forward = self.forward.lock().expect("forward lock poisoned");
            let batch = forward.entry(key.clone()).or_insert_with(|| {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                self.spawn_forward_timer(key.clone(), generation);
                Pending {
                    entries: Vec::new(),
                    bytes: 0,
                    generation,
                }
            });
            batch.bytes += entry.data.len();
            batch.entries.push(entry);
            batch.entries.len() >= self.config.max_merge_count
                || batch.bytes >= self.config.max_merge_bytes
        };

        if flush_now {
            self.flush_forward(&key, None).await;
        }
        Ok(())
    }

    /// Accept a completed response into its route batch.
    pub async fn process_response(self: &Arc<Self>, entry: ResponseEntry) {
        let key: RouteKey = (entry.hop_list.clone(), entry.hop_counter);
        let flush_now = {
            let mut response = self.response.lock().expect("response lock poisoned");
            let batch = response.entry(key.clone()).or_insert_with(|| {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                self.spawn_response_timer(key.clone(), generation);
                Pending {
                    entries: Vec::new(),
                    bytes: 0,
                    generation,
                }
            });
            batch.bytes += entry.data.len();
            batch.entries.push(entry);
            batch.entries.len() >= self.config.max_merge_count
                || batch.bytes >= self.config.max_merge_bytes
        };

        if flush_now {
            self.flush_response(&key, None).await;
        }
    }

    /// Flush every pending batch immediately (shutdown path).
    pub async fn flush_all(self: &Arc<Self>) {
        let forward_keys: Vec<RouteKey> = self
            .forward
            .lock()
            .expect("forward lock poisoned")
            .keys()
            .cloned()
            .collect();
        for key in forward_keys {
            self.flush_forward(&key, None).await;
        }

        let response_keys: Vec<RouteKey> = self
            .response
            .lock()
            .expect("response lock poisoned")
            .keys()
            .cloned()
            .collect();
        for key in response_keys {
            self.flush_response(&key, None).await;
        }
    }

    fn spawn_forward_timer(self: &Arc<Self>, key: RouteKey, generation: u64) {
        let manager = Arc::clone(self);
        let window = self.config.merge_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            manager.flush_forward(&key, Some(generation)).await;
        });
    }

    fn spawn_response_timer(self: &Arc<Self>, key: RouteKey, generation: u64) {
        let manager = Arc::clone(self);
        let window = self.config.merge_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            manager.flush_response(&key, Some(generation)).await;
        });
    }

    /// Flush one forward batch. `expected_generation` guards timed flushes
    /// against batches that were already flushed and replaced.
    async fn flush_forward(&self, key: &RouteKey, expected_generation: Option<u64>) {
        let batch = {
            let mut forward = self.forward.lock().expect("forward lock poisoned");
            match forward.get(key) {
                Some(b) if expected_generation.is_none_or(|g| g == b.generation) => {
                    forward.remove(key).expect("entry present")
                }
                _ => return,
            }
        };
        if batch.entries.is_empty() {
            return;
        }

        let next_hop = key.0[usize::from(key.1)].clone();
        for entry in &batch.entries {
            if let Err(e) = self
                .states
                .update_status(entry.request_id, RequestStatus::Sent)
            {
                warn!(request_id = entry.request_id, error = %e, "state missing at flush");
            }
        }

        debug!(
            next_hop = %next_hop,
            requests = batch.entries.len(),
            bytes = batch.bytes,
            "forward batch flushing"
        );

        let result = if batch.entries.len() == 1 {
            self.ops.send_single(&batch.entries[0], &next_hop).await
        } else {
            match merge_requests(&batch.entries) {
                Ok(frame) => self.ops.send_merged(frame, &next_hop).await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            warn!(next_hop = %next_hop, error = %e, "batch send failed");
            for entry in &batch.entries {
                let _ = self
                    .states
                    .update_status(entry.request_id, RequestStatus::Failed);
            }
        }
    }

    async fn flush_response(&self, key: &RouteKey, expected_generation: Option<u64>) {
        let batch = {
            let mut response = self.response.lock().expect("response lock poisoned");
            match response.get(key) {
                Some(b) if expected_generation.is_none_or(|g| g == b.generation) => {
                    response.remove(key).expect("entry present")
                }
                _ => return,
            }
        };
        if batch.entries.is_empty() {
            return;
        }

        debug!(
            responses = batch.entries.len(),
            bytes = batch.bytes,
            "response batch flushing"
        );

        match merge_responses(&batch.entries) {
            Ok(frame) => {
                if let Err(e) = self.ops.forward_response(frame).await {
                    warn!(error = %e, "response batch send failed");
                }
            }
            Err(e) => warn!(error = %e, "response batch framing failed"),
        }
    }
}

/// Build one frame (header + concatenated payloads) from a request batch.
fn merge_requests(entries: &[BatchEntry]) -> ForwardResult<Bytes> {
    let ids: Vec<u32> = entries.iter().map(|e| e.request_id).collect();
    let sizes: Vec<usize> = entries.iter().map(|e| e.data.len()).collect();
    let mut header = FrameHeader::new(ids, entries[0].hop_list.clone(), &sizes)?;
    header.hop_counter = entries[0].hop_counter;
    assemble(&header, entries.iter().map(|e| &e.data))
}

/// Build one response frame from a response batch.
fn merge_responses(entries: &[ResponseEntry]) -> ForwardResult<Bytes> {
    let ids: Vec<u32> = entries.iter().map(|e| e.request_id).collect();
    let sizes: Vec<usize> = entries.iter().map(|e| e.data.len()).collect();
    let mut header = FrameHeader::new(ids, entries[0].hop_list.clone(), &sizes)?;
    header.hop_counter = entries[0].hop_counter;
    assemble(&header, entries.iter().map(|e| &e.data))
}

fn assemble<'a>(
    header: &FrameHeader,
    payloads: impl Iterator<Item = &'a Bytes>,
) -> ForwardResult<Bytes> {
    let header_bytes = header.pack()?;
    let mut out = BytesMut::with_capacity(header_bytes.len() + header.payload_len());
    out.extend_from_slice(&header_bytes);
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    Ok(out.freeze())
}
