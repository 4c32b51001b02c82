//! Publisher loop and HTTP poll endpoint.
//!
//! The publisher rebuilds the routing document from the allocation cache
//! on a short interval; the axum router serves it at
//! `GET /traefik-dynamic-config` together with read-only inspection views
//! of the store and caches.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, info};

use meshway_assess::AssessmentEngine;
use meshway_bpr::BprResultCache;
use meshway_state::StateStore;

use crate::document::{build_document, DynamicConfig};

/// Rebuilds the routing document from the allocation cache periodically.
pub struct RoutePublisher {
    cache: Arc<BprResultCache>,
    redirect_port: u16,
    interval: Duration,
    current: Arc<RwLock<DynamicConfig>>,
}

impl RoutePublisher {
    pub fn new(cache: Arc<BprResultCache>, redirect_port: u16, interval: Duration) -> Self {
        Self {
            cache,
            redirect_port,
            interval,
            current: Arc::new(RwLock::new(DynamicConfig::default())),
        }
    }

    /// Handle to the current document, shared with the HTTP layer.
    pub fn document(&self) -> Arc<RwLock<DynamicConfig>> {
        Arc::clone(&self.current)
    }

    /// Rebuild the document from the cache snapshot.
    pub fn refresh(&self) {
        let allocations = self.cache.all();
        let document = build_document(&allocations, self.redirect_port);
        let domains = document.http.routers.len();
        *self.current.write().expect("document lock poisoned") = document;
        debug!(domains, "routing document refreshed");
    }

    /// Run the refresh loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval = ?self.interval, "route publisher started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh(),
                _ = shutdown.changed() => {
                    info!("route publisher shutting down");
                    return;
                }
            }
        }
    }
}

/// Shared state for the publisher HTTP handlers.
#[derive(Clone)]
pub struct PublishState {
    pub store: StateStore,
    pub engine: Arc<AssessmentEngine>,
    pub cache: Arc<BprResultCache>,
    pub document: Arc<RwLock<DynamicConfig>>,
}

/// Build the publisher + inspection router.
pub fn publisher_router(state: PublishState) -> Router {
    Router::new()
        .route("/traefik-dynamic-config", get(dynamic_config))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/assessments", get(list_assessments))
        .route("/api/v1/allocations", get(list_allocations))
        .with_state(state)
}

/// GET /traefik-dynamic-config
async fn dynamic_config(State(state): State<PublishState>) -> impl IntoResponse {
    let document = state
        .document
        .read()
        .expect("document lock poisoned")
        .clone();
    Json(document)
}

/// GET /api/v1/nodes
async fn list_nodes(State(state): State<PublishState>) -> impl IntoResponse {
    match state.store.list_node_regions() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// GET /api/v1/assessments
async fn list_assessments(State(state): State<PublishState>) -> impl IntoResponse {
    Json(state.engine.cached_assessments().await)
}

/// GET /api/v1/allocations
async fn list_allocations(State(state): State<PublishState>) -> impl IntoResponse {
    Json(state.cache.all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshway_bpr::cache::Allocation;

    #[test]
    fn refresh_picks_up_cache_changes() {
        let cache = Arc::new(BprResultCache::new());
        let publisher = RoutePublisher::new(Arc::clone(&cache), 50055, Duration::from_secs(5));

        publisher.refresh();
        assert!(publisher
            .document()
            .read()
            .unwrap()
            .http
            .routers
            .is_empty());

        cache.set(
            "example.com",
            Allocation::from([("10.0.0.1".to_string(), 30)]),
        );
        publisher.refresh();

        let document = publisher.document().read().unwrap().clone();
        assert_eq!(document.http.routers.len(), 1);
        assert!(document
            .http
            .routers
            .contains_key("router-for-example.com"));
    }

    #[test]
    fn document_handle_is_shared() {
        let cache = Arc::new(BprResultCache::new());
        let publisher = RoutePublisher::new(Arc::clone(&cache), 50055, Duration::from_secs(5));
        let handle = publisher.document();

        cache.set("a.com", Allocation::from([("10.0.0.1".to_string(), 1)]));
        publisher.refresh();

        // The handle observes the refresh without re-fetching.
        assert_eq!(handle.read().unwrap().http.routers.len(), 1);
    }
}
