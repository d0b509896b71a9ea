//! Configuration management for redgate.
//!
//! Settings come from an optional TOML file merged with command-line
//! overrides. The `upstream` field accepts either a comma-separated
//! `[name@]host:port` list (a static registry) or a discovery URL such as
//! `consul://host/service?dc=…&cluster=…`; unknown URL schemes fail startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::{
    ConsulDiscovery, DiscoveryRegistry, ServerEndpoint, ServerRegistry, StaticRegistry,
};
use crate::server::ServerConfig;
use crate::transport::TransportConfig;

/// Main redgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub proxy: ProxySection,
    pub logging: LoggingSection,
}

/// Frontend server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to listen on.
    pub bind: String,
    pub read_timeout_sec: u64,
    pub write_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    /// Batch pipelined commands into one dispatch.
    pub enable_pipeline: bool,
    /// Reissue requests once on `MOVED` replies.
    pub enable_retry: bool,
}

/// Upstream routing and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Comma-separated `[name@]host:port` list or a `consul://` URL.
    pub upstream: String,
    pub conns_per_host: usize,
    pub max_idle_conns: usize,
    pub ping_timeout_sec: u64,
    pub ping_interval_sec: u64,
    /// How long a failed endpoint stays out of the ring.
    pub blacklist_expiry_sec: u64,
    /// How long discovered endpoints are cached.
    pub discovery_ttl_sec: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
    /// Log format (json, text).
    pub format: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:6479".to_string(),
            read_timeout_sec: 30,
            write_timeout_sec: 30,
            idle_timeout_sec: 90,
            enable_pipeline: false,
            enable_retry: false,
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            upstream: String::new(),
            conns_per_host: 4,
            max_idle_conns: 100,
            ping_timeout_sec: 10,
            ping_interval_sec: 15,
            blacklist_expiry_sec: 30,
            discovery_ttl_sec: 10,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            proxy: ProxySection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Validation("bind address cannot be empty".into()));
        }
        if self.proxy.conns_per_host == 0 {
            return Err(ConfigError::Validation(
                "conns_per_host must be greater than 0".into(),
            ));
        }
        if self.proxy.upstream.trim().is_empty() {
            return Err(ConfigError::Validation("upstream cannot be empty".into()));
        }
        parse_upstream(&self.proxy.upstream).map(|_| ())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.server.bind.clone(),
            read_timeout: Duration::from_secs(self.server.read_timeout_sec),
            write_timeout: Duration::from_secs(self.server.write_timeout_sec),
            idle_timeout: Duration::from_secs(self.server.idle_timeout_sec),
            enable_pipeline: self.server.enable_pipeline,
            enable_retry: self.server.enable_retry,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            conns_per_host: self.proxy.conns_per_host,
            max_idle_conns: self.proxy.max_idle_conns,
            ping_interval: Duration::from_secs(self.proxy.ping_interval_sec),
            ping_timeout: Duration::from_secs(self.proxy.ping_timeout_sec),
        }
    }

    /// Build the registry the `upstream` setting describes.
    pub fn build_registry(&self) -> Result<Arc<dyn ServerRegistry>, ConfigError> {
        let blacklist_expiry = Duration::from_secs(self.proxy.blacklist_expiry_sec);

        match parse_upstream(&self.proxy.upstream)? {
            UpstreamConfig::Static(endpoints) => Ok(Arc::new(
                StaticRegistry::new(endpoints).with_blacklist_expiry(blacklist_expiry),
            )),
            UpstreamConfig::Consul {
                host,
                service,
                datacenter,
                cluster,
            } => {
                let source = ConsulDiscovery::new(host, service, datacenter, cluster);
                Ok(Arc::new(
                    DiscoveryRegistry::new(Box::new(source))
                        .with_ttl(Duration::from_secs(self.proxy.discovery_ttl_sec))
                        .with_blacklist_expiry(blacklist_expiry),
                ))
            }
        }
    }
}

/// Parsed `upstream` setting.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamConfig {
    Static(Vec<ServerEndpoint>),
    Consul {
        host: String,
        service: String,
        datacenter: Option<String>,
        cluster: Option<String>,
    },
}

/// Parse the `upstream` setting: a plain endpoint list, or a registry URL.
pub fn parse_upstream(upstream: &str) -> Result<UpstreamConfig, ConfigError> {
    let upstream = upstream.trim();

    if let Some((scheme, rest)) = upstream.split_once("://") {
        if scheme != "consul" {
            return Err(ConfigError::UnsupportedRegistry(scheme.to_string()));
        }
        return parse_consul_url(rest);
    }

    let mut endpoints = Vec::new();
    for entry in upstream.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, addr) = match entry.split_once('@') {
            Some((name, addr)) => (name, addr),
            None => ("", entry),
        };

        if addr.is_empty() || !addr.contains(':') {
            return Err(ConfigError::Validation(format!(
                "invalid upstream address {entry:?}, expected [name@]host:port"
            )));
        }

        endpoints.push(ServerEndpoint::new(name, addr));
    }

    if endpoints.is_empty() {
        return Err(ConfigError::Validation(
            "upstream holds no usable endpoints".into(),
        ));
    }

    Ok(UpstreamConfig::Static(endpoints))
}

/// Parse `host/service?dc=…&cluster=…` (everything after `consul://`).
fn parse_consul_url(rest: &str) -> Result<UpstreamConfig, ConfigError> {
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };

    if authority.is_empty() {
        return Err(ConfigError::Validation("consul URL is missing a host".into()));
    }

    let (service, query) = match path.split_once('?') {
        Some((service, query)) => (service, query),
        None => (path, ""),
    };

    if service.is_empty() {
        return Err(ConfigError::Validation(
            "consul URL is missing a service name".into(),
        ));
    }

    let mut datacenter = None;
    let mut cluster = None;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("dc", value)) if !value.is_empty() => datacenter = Some(value.to_string()),
            Some(("cluster", value)) if !value.is_empty() => cluster = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(UpstreamConfig::Consul {
        host: authority.to_string(),
        service: service.to_string(),
        datacenter,
        cluster,
    })
}
