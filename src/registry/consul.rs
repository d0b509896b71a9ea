//! Discovery-backed registry.
//!
//! [`DiscoveryRegistry`] wraps any [`ServiceDiscovery`] source with a TTL
//! cache for resolved endpoints and a negative-cache blacklist, and serves
//! rings built from the combination. [`ConsulDiscovery`] is the shipped
//! source: it queries the Consul health API for passing instances of a
//! service, optionally filtered by datacenter and cluster tag.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Blacklist, ServerEndpoint, ServerRegistry, DEFAULT_BLACKLIST_EXPIRY};
use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::ring::HashRing;

/// How long resolved endpoints are served before re-resolving.
pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(10);

/// An external source of upstream endpoints.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn resolve(&self, ctx: &Context) -> Result<Vec<ServerEndpoint>>;
}

#[derive(Debug, Default)]
struct DiscoveryState {
    endpoints: Vec<ServerEndpoint>,
    fetched_at: Option<Instant>,
    blacklist: Blacklist,
    version: u64,
    cached: Option<(u64, Arc<HashRing>)>,
}

/// Registry over a [`ServiceDiscovery`] source with TTL caching.
pub struct DiscoveryRegistry {
    source: Box<dyn ServiceDiscovery>,
    ttl: Duration,
    blacklist_expiry: Duration,
    state: Mutex<DiscoveryState>,
}

impl DiscoveryRegistry {
    pub fn new(source: Box<dyn ServiceDiscovery>) -> Self {
        Self {
            source,
            ttl: DEFAULT_DISCOVERY_TTL,
            blacklist_expiry: DEFAULT_BLACKLIST_EXPIRY,
            state: Mutex::new(DiscoveryState::default()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_blacklist_expiry(mut self, expiry: Duration) -> Self {
        self.blacklist_expiry = expiry;
        self
    }
}

#[async_trait]
impl ServerRegistry for DiscoveryRegistry {
    async fn lookup_servers(&self, ctx: &Context) -> Result<Arc<HashRing>> {
        ctx.check()?;

        let mut state = self.state.lock().await;

        if state.blacklist.prune() {
            state.version += 1;
        }

        let stale = match state.fetched_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };

        if stale {
            match self.source.resolve(ctx).await {
                Ok(endpoints) => {
                    if endpoints != state.endpoints {
                        state.version += 1;
                    }
                    state.endpoints = endpoints;
                    state.fetched_at = Some(Instant::now());
                    debug!(count = state.endpoints.len(), "resolved upstream services");
                }
                Err(err) if state.fetched_at.is_some() => {
                    // Keep serving the previous membership rather than
                    // failing every request during a discovery outage.
                    warn!(error = %err, "service discovery failed, serving cached endpoints");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some((version, ring)) = &state.cached {
            if *version == state.version {
                return Ok(ring.clone());
            }
        }

        let active: Vec<ServerEndpoint> = state
            .endpoints
            .iter()
            .filter(|endpoint| !state.blacklist.contains(&endpoint.addr))
            .cloned()
            .collect();

        if active.is_empty() {
            return Err(ProxyError::routing("no upstream servers available"));
        }

        let ring = Arc::new(HashRing::new(&active));
        state.cached = Some((state.version, ring.clone()));
        Ok(ring)
    }

    fn blacklist_server(&self, endpoint: &ServerEndpoint) {
        // Registry lookups take the async lock; blacklisting is called from
        // sync contexts, so it only needs a fast best-effort acquisition.
        if let Ok(mut state) = self.state.try_lock() {
            state.blacklist.insert(&endpoint.addr, self.blacklist_expiry);
            state.version += 1;
            debug!(addr = %endpoint.addr, "endpoint blacklisted");
        } else {
            warn!(addr = %endpoint.addr, "registry busy, blacklist request dropped");
        }
    }
}

/// Consul health-API discovery source.
pub struct ConsulDiscovery {
    client: reqwest::Client,
    base: String,
    service: String,
    datacenter: Option<String>,
    cluster: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

impl ConsulDiscovery {
    pub fn new(
        host: impl Into<String>,
        service: impl Into<String>,
        datacenter: Option<String>,
        cluster: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{}", host.into()),
            service: service.into(),
            datacenter,
            cluster,
        }
    }

    fn url(&self) -> String {
        let mut url = format!("{}/v1/health/service/{}?passing=true", self.base, self.service);
        if let Some(dc) = &self.datacenter {
            url.push_str("&dc=");
            url.push_str(dc);
        }
        if let Some(cluster) = &self.cluster {
            url.push_str("&tag=redis-cluster:");
            url.push_str(cluster);
        }
        url
    }
}

#[async_trait]
impl ServiceDiscovery for ConsulDiscovery {
    async fn resolve(&self, ctx: &Context) -> Result<Vec<ServerEndpoint>> {
        let url = self.url();

        let entries: Vec<HealthEntry> = ctx
            .run("querying the consul catalog", async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| ProxyError::routing(format!("consul lookup failed: {e}")))?;

                response
                    .json()
                    .await
                    .map_err(|e| ProxyError::routing(format!("invalid consul payload: {e}")))
            })
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let host = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                ServerEndpoint::new(entry.service.id, format!("{host}:{}", entry.service.port))
            })
            .collect())
    }
}
