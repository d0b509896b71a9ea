//! Upstream server registries.
//!
//! A registry exposes the (potentially changing) set of backend servers as a
//! consistent-hash ring. Implementations may additionally support
//! blacklisting, which temporarily suppresses an endpoint from subsequent
//! lookups — the proxy blacklists an endpoint whenever connecting to it
//! fails.
//!
//! Built rings are cached keyed by a version counter that is bumped on every
//! membership or blacklist change, so steady-state lookups are a clone of an
//! `Arc` instead of a rebuild.

pub mod consul;

use async_trait::async_trait;
use fnv::FnvHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::ring::HashRing;

pub use consul::{ConsulDiscovery, DiscoveryRegistry, ServiceDiscovery};

/// How long a blacklisted endpoint stays suppressed by default.
pub const DEFAULT_BLACKLIST_EXPIRY: Duration = Duration::from_secs(30);

/// A single backend redis server.
///
/// Endpoints compare (and hash) by address only; the name is a logical label
/// carried along for logging and discovery.
#[derive(Debug, Clone, Eq)]
pub struct ServerEndpoint {
    pub name: String,
    pub addr: String,
}

impl ServerEndpoint {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }

    /// An endpoint known only by address.
    pub fn anonymous(addr: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            addr: addr.into(),
        }
    }
}

impl PartialEq for ServerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Hash for ServerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}@{}", self.name, self.addr)
        }
    }
}

/// Source of the current upstream membership.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Returns a ring describing the current membership, or the context's
    /// cancellation cause if the context was already cancelled.
    async fn lookup_servers(&self, ctx: &Context) -> Result<Arc<HashRing>>;

    /// Temporarily suppress `endpoint` from subsequent lookups. The default
    /// implementation ignores the request.
    fn blacklist_server(&self, _endpoint: &ServerEndpoint) {}
}

/// Expiring address blacklist shared by the registry implementations.
#[derive(Debug, Default)]
pub(crate) struct Blacklist {
    entries: FnvHashMap<String, Instant>,
}

impl Blacklist {
    /// Drop expired entries; reports whether anything changed.
    pub(crate) fn prune(&mut self) -> bool {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        self.entries.len() != before
    }

    pub(crate) fn insert(&mut self, addr: &str, expiry: Duration) {
        self.entries
            .insert(addr.to_string(), Instant::now() + expiry);
    }

    pub(crate) fn contains(&self, addr: &str) -> bool {
        self.entries.contains_key(addr)
    }
}

#[derive(Debug)]
struct StaticState {
    blacklist: Blacklist,
    version: u64,
    cached: Option<(u64, Arc<HashRing>)>,
}

/// Registry over a fixed endpoint list.
///
/// Lookups return a ring over the configured set minus the live blacklist
/// entries; a blacklisted endpoint rejoins the ring once its entry expires.
#[derive(Debug)]
pub struct StaticRegistry {
    endpoints: Vec<ServerEndpoint>,
    blacklist_expiry: Duration,
    state: Mutex<StaticState>,
}

impl StaticRegistry {
    pub fn new(endpoints: Vec<ServerEndpoint>) -> Self {
        Self {
            endpoints,
            blacklist_expiry: DEFAULT_BLACKLIST_EXPIRY,
            state: Mutex::new(StaticState {
                blacklist: Blacklist::default(),
                version: 0,
                cached: None,
            }),
        }
    }

    pub fn with_blacklist_expiry(mut self, expiry: Duration) -> Self {
        self.blacklist_expiry = expiry;
        self
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }
}

#[async_trait]
impl ServerRegistry for StaticRegistry {
    async fn lookup_servers(&self, ctx: &Context) -> Result<Arc<HashRing>> {
        ctx.check()?;

        let mut state = self.state.lock().expect("registry state poisoned");
        if state.blacklist.prune() {
            state.version += 1;
        }

        if let Some((version, ring)) = &state.cached {
            if *version == state.version {
                return Ok(ring.clone());
            }
        }

        let active: Vec<ServerEndpoint> = self
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
        let mut state = self.state.lock().expect("registry state poisoned");
        state.blacklist.insert(&endpoint.addr, self.blacklist_expiry);
        state.version += 1;
        debug!(addr = %endpoint.addr, "endpoint blacklisted");
    }
}
