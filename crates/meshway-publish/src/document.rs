//! The routing configuration document.
//!
//! Shape expected by the edge router's provider poll:
//! `{http: {routers: {...}, middlewares: {...}, services: {...}}}` with one
//! router and one middleware per domain and a single shared no-op service.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use meshway_bpr::cache::Allocation;

/// Name of the shared no-op backend.
const NOOP_SERVICE: &str = "noop-service";
/// Registration name of the weighted-redirector plugin.
const PLUGIN_NAME: &str = "weightedRedirector";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub http: HttpConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfiguration {
    pub routers: BTreeMap<String, Router>,
    pub middlewares: BTreeMap<String, Middleware>,
    pub services: BTreeMap<String, Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub rule: String,
    pub service: String,
    pub entry_points: Vec<String>,
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Middleware {
    pub plugin: BTreeMap<String, RedirectorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectorConfig {
    pub default_scheme: String,
    pub default_port: u16,
    pub preserve_path_and_query: bool,
    pub permanent_redirect: bool,
    pub targets: Vec<TargetEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub ip: String,
    pub weight: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

/// Build the document from the current per-domain allocations.
///
/// Domains with an empty allocation are omitted — the edge router keeps
/// resolving them however it already does rather than receiving fabricated
/// weights. `redirect_port` is the access-proxy ingress port the targets
/// serve on.
pub fn build_document(
    allocations: &HashMap<String, Allocation>,
    redirect_port: u16,
) -> DynamicConfig {
    let mut config = DynamicConfig::default();

    config.http.services.insert(
        NOOP_SERVICE.to_string(),
        Service {
            load_balancer: LoadBalancer {
                // Never called; the middleware answers before proxying.
                servers: vec![Server {
                    url: "http://127.0.0.1:1".to_string(),
                }],
            },
        },
    );

    for (domain, allocation) in allocations {
        if allocation.is_empty() {
            continue;
        }
        let mut targets: Vec<TargetEntry> = allocation
            .iter()
            .map(|(ip, &weight)| TargetEntry {
                ip: ip.clone(),
                weight,
            })
            .collect();
        targets.sort_by(|a, b| a.ip.cmp(&b.ip));

        let router_name = format!("router-for-{domain}");
        let middleware_name = format!("weighted-redirect-for-{domain}");

        config.http.routers.insert(
            router_name,
            Router {
                rule: format!("Path(`/resolve/{domain}`)"),
                service: NOOP_SERVICE.to_string(),
                entry_points: vec!["web".to_string()],
                middlewares: vec![middleware_name.clone()],
            },
        );
        config.http.middlewares.insert(
            middleware_name,
            Middleware {
                plugin: BTreeMap::from([(
                    PLUGIN_NAME.to_string(),
                    RedirectorConfig {
                        default_scheme: "http".to_string(),
                        default_port: redirect_port,
                        preserve_path_and_query: false,
                        permanent_redirect: false,
                        targets,
                    },
                )]),
            },
        );
    }

    config
}
