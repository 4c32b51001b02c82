//! In-flight request state tracking.
//!
//! Every request passing through a node — entering at the access proxy or
//! arriving inside a relayed batch — gets a state entry keyed by its
//! request ID. The state machine only moves forward:
//!
//! ```text
//! Created → Buffered → Sent → Responding → Completed
//!    └────────┴─────────┴─────────┴──▶ Failed
//! ```
//!
//! Entries that stop being updated are reaped by a periodic TTL sweep.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, ForwardResult};

/// Lifecycle status of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Buffered,
    Sent,
    Responding,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Created, Buffered) | (Buffered, Sent) | (Created, Sent) => true,
            (Sent, Responding) | (Responding, Completed) => true,
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Where the request entered this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from an end-user at the access proxy.
    Ingress,
    /// Arrived inside a relayed batch.
    Transit,
}

/// One tracked request.
pub struct RequestState {
    pub request_id: u32,
    pub direction: Direction,
    pub is_last_hop: bool,
    pub next_hop_ip: String,
    pub hop_list: Vec<String>,
    pub data: Bytes,
    pub status: RequestStatus,
    pub created_at: Instant,
    pub last_updated_at: Instant,
    /// Transit only: address the batch arrived from, used to route the
    /// response when the previous hop is the ingress.
    pub ingress_ip: Option<String>,
    /// Ingress only: signalled with the raw response bytes.
    pub notifier: Option<oneshot::Sender<Bytes>>,
}

impl RequestState {
    pub fn new(
        request_id: u32,
        direction: Direction,
        is_last_hop: bool,
        next_hop_ip: String,
        hop_list: Vec<String>,
        data: Bytes,
    ) -> Self {
        let now = Instant::now();
        Self {
            request_id,
            direction,
            is_last_hop,
            next_hop_ip,
            hop_list,
            data,
            status: RequestStatus::Created,
            created_at: now,
            last_updated_at: now,
            ingress_ip: None,
            notifier: None,
        }
    }
}

/// Cloneable view of a state entry without its notifier.
#[derive(Debug, Clone)]
pub struct StateMeta {
    pub request_id: u32,
    pub direction: Direction,
    pub is_last_hop: bool,
    pub next_hop_ip: String,
    pub hop_list: Vec<String>,
    pub data: Bytes,
    pub status: RequestStatus,
    pub ingress_ip: Option<String>,
}

/// Concurrent table of in-flight request states with TTL eviction.
pub struct RequestStateManager {
    states: DashMap<u32, RequestState>,
    expiration: Duration,
    sweep_interval: Duration,
}

impl RequestStateManager {
    pub fn new(expiration: Duration, sweep_interval: Duration) -> Self {
        Self {
            states: DashMap::new(),
            expiration,
            sweep_interval,
        }
    }

    pub fn insert(&self, state: RequestState) {
        self.states.insert(state.request_id, state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn status(&self, request_id: u32) -> Option<RequestStatus> {
        self.states.get(&request_id).map(|s| s.status)
    }

    pub fn meta(&self, request_id: u32) -> Option<StateMeta> {
        self.states.get(&request_id).map(|s| StateMeta {
            request_id: s.request_id,
            direction: s.direction,
            is_last_hop: s.is_last_hop,
            next_hop_ip: s.next_hop_ip.clone(),
            hop_list: s.hop_list.clone(),
            data: s.data.clone(),
            status: s.status,
            ingress_ip: s.ingress_ip.clone(),
        })
    }

    /// Advance a request's status.
    ///
    /// Illegal transitions are invariant violations: the request is failed
    /// and the process carries on.
    pub fn update_status(&self, request_id: u32, next: RequestStatus) -> ForwardResult<()> {
        let mut entry = self
            .states
            .get_mut(&request_id)
            .ok_or(ForwardError::UnknownRequest(request_id))?;

        if !entry.status.can_transition(next) {
            let violation = format!(
                "request {request_id}: {:?} -> {next:?} is not a legal transition",
                entry.status
            );
            warn!(%violation, "request failed");
            if !entry.status.is_terminal() {
                entry.status = RequestStatus::Failed;
                entry.last_updated_at = Instant::now();
            }
            return Err(ForwardError::InvariantViolation(violation));
        }

        entry.status = next;
        entry.last_updated_at = Instant::now();
        Ok(())
    }

    /// Take the response notifier for an ingress request, if still armed.
    pub fn take_notifier(&self, request_id: u32) -> Option<oneshot::Sender<Bytes>> {
        self.states
            .get_mut(&request_id)
            .and_then(|mut s| s.notifier.take())
    }

    pub fn remove(&self, request_id: u32) {
        self.states.remove(&request_id);
    }

    /// Drop entries that have not been touched within the expiration.
    pub fn sweep(&self) -> usize {
        let cutoff = Instant::now();
        let expiration = self.expiration;
        let before = self.states.len();
        self.states
            .retain(|_, s| cutoff.duration_since(s.last_updated_at) < expiration);
        let reaped = before - self.states.len();
        if reaped > 0 {
            debug!(reaped, remaining = self.states.len(), "expired request states reaped");
        }
        reaped
    }

    /// Run the sweep loop until shutdown.
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    info!("state sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: u32) -> RequestState {
        RequestState::new(
            id,
            Direction::Ingress,
            false,
            "10.0.0.2".to_string(),
            vec!["10.0.0.2".to_string(), "origin".to_string()],
            Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
        )
    }

    #[test]
    fn forward_transitions_are_accepted() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        mgr.insert(state(1));

        for next in [
            RequestStatus::Buffered,
            RequestStatus::Sent,
            RequestStatus::Responding,
            RequestStatus::Completed,
        ] {
            mgr.update_status(1, next).unwrap();
        }
        assert_eq!(mgr.status(1), Some(RequestStatus::Completed));
    }

    #[test]
    fn direct_proxy_skips_buffered() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        mgr.insert(state(1));
        mgr.update_status(1, RequestStatus::Sent).unwrap();
        assert_eq!(mgr.status(1), Some(RequestStatus::Sent));
    }

    #[test]
    fn backward_transition_fails_the_request() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        mgr.insert(state(1));
        mgr.update_status(1, RequestStatus::Buffered).unwrap();
        mgr.update_status(1, RequestStatus::Sent).unwrap();

        let err = mgr.update_status(1, RequestStatus::Buffered);
        assert!(matches!(err, Err(ForwardError::InvariantViolation(_))));
        assert_eq!(mgr.status(1), Some(RequestStatus::Failed));
    }

    #[test]
    fn any_live_state_can_fail() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        for id in [1, 2, 3] {
            mgr.insert(state(id));
        }
        mgr.update_status(2, RequestStatus::Buffered).unwrap();
        mgr.update_status(3, RequestStatus::Buffered).unwrap();
        mgr.update_status(3, RequestStatus::Sent).unwrap();

        for id in [1, 2, 3] {
            mgr.update_status(id, RequestStatus::Failed).unwrap();
            assert_eq!(mgr.status(id), Some(RequestStatus::Failed));
        }
    }

    #[test]
    fn terminal_states_are_frozen() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        mgr.insert(state(1));
        mgr.update_status(1, RequestStatus::Failed).unwrap();

        assert!(mgr.update_status(1, RequestStatus::Sent).is_err());
        // A failed request stays failed, it does not re-fail into anything.
        assert_eq!(mgr.status(1), Some(RequestStatus::Failed));
    }

    #[test]
    fn unknown_request_is_an_error() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        assert!(matches!(
            mgr.update_status(99, RequestStatus::Sent),
            Err(ForwardError::UnknownRequest(99))
        ));
    }

    #[test]
    fn notifier_is_taken_once() {
        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        let mut s = state(1);
        let (tx, mut rx) = oneshot::channel();
        s.notifier = Some(tx);
        mgr.insert(s);

        let notifier = mgr.take_notifier(1).unwrap();
        assert!(mgr.take_notifier(1).is_none());

        notifier.send(Bytes::from_static(b"response")).unwrap();
        assert_eq!(rx.try_recv().unwrap().as_ref(), b"response");
    }

    #[test]
    fn sweep_reaps_only_stale_entries() {
        let mgr = RequestStateManager::new(Duration::from_millis(0), Duration::from_secs(60));
        mgr.insert(state(1));
        // Zero TTL: everything is immediately stale.
        assert_eq!(mgr.sweep(), 1);
        assert!(mgr.is_empty());

        let mgr = RequestStateManager::new(Duration::from_secs(900), Duration::from_secs(60));
        mgr.insert(state(1));
        assert_eq!(mgr.sweep(), 0);
        assert_eq!(mgr.len(), 1);
    }
}
