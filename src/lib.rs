//! redgate — a RESP reverse proxy for sharded Redis fleets.
//!
//! The proxy terminates client connections speaking the Redis Serialization
//! Protocol, routes each command to one of N backend servers chosen by
//! consistent hashing of the command's key, and streams the backend's reply
//! back to the client. The crate splits into:
//!
//! 1. [`resp`] — a bidirectional streaming RESP codec.
//! 2. [`server`] — the connection-oriented frontend: accept loop, per
//!    connection read/dispatch/write orchestration, `MULTI`/`EXEC`
//!    collection, pipelining, graceful shutdown.
//! 3. [`ring`] / [`registry`] — consistent-hash routing over a dynamic
//!    membership with blacklisting and ring caching.
//! 4. [`transport`] — pooled, pipelined client connections to the backends
//!    with health pings and lazy reply streams.
//! 5. [`proxy`] — the reverse-proxy handler tying it all together.
//!
//! Pub/Sub is not implemented: the hijack surface exists on the response
//! writer, but subscription semantics are out of scope.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod resp;
pub mod ring;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::Client;
pub use config::Config;
pub use context::Context;
pub use error::{ConfigError, ProxyError, Result};
pub use proxy::ReverseProxy;
pub use registry::{ServerEndpoint, ServerRegistry, StaticRegistry};
pub use resp::{FromResp, RespValue};
pub use ring::HashRing;
pub use server::{Command, Handler, HandlerFunc, Request, ResponseWriter, Server, ServerConfig};
pub use transport::{Response, Transport, TransportConfig};
