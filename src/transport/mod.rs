//! Client-side transport to the backend servers.
//!
//! The transport maintains one bounded connection pool per endpoint and
//! performs request round trips over it: acquire (or dial) a connection,
//! write the request's commands back-to-back with a single flush, then
//! expose the replies as a lazy [`Response`]. Stale pooled connections are
//! `PING`-checked before reuse and closed on ping failure.
//!
//! The transport never multiplexes unrelated requests over one connection;
//! the pool provides horizontal concurrency instead.

pub mod pool;
pub mod response;

use fnv::FnvHashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::resp::{ReplyHeader, RespValue};
use crate::server::Request;

use pool::{BackendConn, Pool, PooledConn, Shared, TransportStats};
pub use response::Response;

/// Transport construction options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Established connections per endpoint.
    pub conns_per_host: usize,
    /// Idle connections across all endpoints.
    pub max_idle_conns: usize,
    /// A connection whose last successful `PING` is older than this is
    /// re-pinged before reuse.
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            conns_per_host: 4,
            max_idle_conns: 100,
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Pooled, pipelined client transport.
pub struct Transport {
    config: TransportConfig,
    shared: Arc<Shared>,
    pools: Mutex<FnvHashMap<String, Arc<Pool>>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

enum TxOutcome {
    Replies(response::TxReplies),
    Scalar(RespValue),
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let shared = Arc::new(Shared {
            max_idle_conns: config.max_idle_conns,
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            idle_total: AtomicUsize::new(0),
            stats: TransportStats::default(),
        });

        Self {
            config,
            shared,
            pools: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.shared.stats
    }

    /// Close every idle pooled connection.
    pub fn close_idle_connections(&self) {
        let pools = self.pools.lock().expect("pool map poisoned");
        for pool in pools.values() {
            pool.drain_idle(&self.shared);
        }
    }

    /// Perform one request round trip against `req.addr`.
    ///
    /// The returned [`Response`] owns the connection; it returns to the pool
    /// when the response is fully consumed or closed in a clean state.
    pub async fn round_trip(&self, req: Request) -> Result<Response> {
        req.ctx.check()?;

        if req.addr.is_empty() {
            return Err(ProxyError::routing("request has no upstream address"));
        }
        if req.is_retried() {
            self.shared.stats.count_retry();
        }

        let mut conn = self.acquire(&req.addr, &req.ctx).await?;

        if req.is_transaction() {
            return self.round_trip_tx(conn, req).await;
        }

        let count = req.cmds.len();
        if count == 1 {
            if let Err(err) = conn.send(&req.cmds, &req.ctx).await {
                conn.discard();
                return Err(err);
            }
        } else {
            // Pipelined writes run on their own task while replies stream
            // back; the pair quiesces before the connection is pooled again.
            if let Err(err) = conn.spawn_send(req.cmds.clone(), &req.ctx) {
                conn.discard();
                return Err(err);
            }
        }

        Response::stream(conn, req, count).await
    }

    /// Write a full transaction and buffer the `EXEC` outcome.
    async fn round_trip_tx(&self, mut conn: PooledConn, req: Request) -> Result<Response> {
        if let Err(err) = conn.spawn_send(req.cmds.clone(), &req.ctx) {
            conn.discard();
            return Err(err);
        }

        let outcome = match read_tx_outcome(&mut conn, &req).await {
            Ok(outcome) => outcome,
            Err(err) => {
                conn.discard();
                return Err(err);
            }
        };

        // Every reply was consumed; the connection can go straight back.
        conn.release().await;

        match outcome {
            TxOutcome::Replies(replies) => Ok(Response::tx(replies, req)),
            TxOutcome::Scalar(value) => Ok(Response::memory(value, req)),
        }
    }

    /// Check a connection out of the endpoint's pool, dialing if necessary.
    async fn acquire(&self, addr: &str, ctx: &Context) -> Result<PooledConn> {
        let pool = self.pool(addr);
        let permit = pool.slot(ctx).await?;

        while let Some(mut conn) = pool.pop_idle(&self.shared) {
            if conn.ping_fresh(self.shared.ping_interval) {
                self.shared.stats.count_reuse();
                return Ok(PooledConn::new(conn, pool, self.shared.clone(), permit));
            }

            self.shared.stats.count_ping();
            match conn.ping(self.shared.ping_timeout).await {
                Ok(()) => {
                    self.shared.stats.count_reuse();
                    return Ok(PooledConn::new(conn, pool, self.shared.clone(), permit));
                }
                Err(err) => {
                    self.shared.stats.count_ping_failure();
                    debug!(addr = %addr, error = %err, "pooled connection failed its ping");
                }
            }
        }

        let stream = ctx
            .run("dialing the upstream", async {
                TcpStream::connect(addr).await.map_err(ProxyError::from)
            })
            .await?;

        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %addr, error = %err, "failed to disable nagling");
        }

        self.shared.stats.count_dial();
        Ok(PooledConn::new(
            BackendConn::new(stream),
            pool,
            self.shared.clone(),
            permit,
        ))
    }

    fn pool(&self, addr: &str) -> Arc<Pool> {
        let mut pools = self.pools.lock().expect("pool map poisoned");
        pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Pool::new(addr.to_string(), self.config.conns_per_host)))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self, addr: &str) -> usize {
        self.pool(addr).idle_len()
    }
}

/// Consume the `MULTI` and per-command `QUEUED` replies, then read the
/// final reply: an array of sub-replies for `EXEC`, a scalar for `DISCARD`.
async fn read_tx_outcome(conn: &mut PooledConn, req: &Request) -> Result<TxOutcome> {
    // One preamble reply per command before the closing EXEC/DISCARD.
    for _ in 0..req.cmds.len() - 1 {
        match conn.read_header(&req.ctx).await? {
            ReplyHeader::Value(RespValue::Error(msg)) => {
                // A command failed to queue; the EXEC reply reports it.
                debug!(error = %msg, "transaction command refused during queueing");
            }
            ReplyHeader::Value(_) => {}
            ReplyHeader::Array(n) => {
                for _ in 0..n {
                    conn.read_value(&req.ctx).await?;
                }
            }
        }
    }

    match conn.read_header(&req.ctx).await? {
        ReplyHeader::Array(n) => {
            let mut elements = Vec::with_capacity(n);
            for _ in 0..n {
                elements.push(conn.read_value(&req.ctx).await?);
            }
            Ok(TxOutcome::Replies(response::TxReplies::new(elements)))
        }
        ReplyHeader::Value(RespValue::Array(None)) => {
            Ok(TxOutcome::Replies(response::TxReplies::aborted()))
        }
        ReplyHeader::Value(RespValue::Error(msg)) => {
            Ok(TxOutcome::Replies(response::TxReplies::failed(msg)))
        }
        ReplyHeader::Value(value) => Ok(TxOutcome::Scalar(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Command;
    use crate::testutil;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn set_cmd(key: &str, value: &str) -> Command {
        Command::new(
            "SET",
            vec![
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            ],
        )
    }

    fn get_cmd(key: &str) -> Command {
        Command::new("GET", vec![Bytes::copy_from_slice(key.as_bytes())])
    }

    #[tokio::test]
    async fn single_round_trip_reuses_the_connection() {
        let backend = testutil::spawn_store_backend().await;
        let transport = Transport::default();

        for i in 0..3 {
            let req = Request::single(set_cmd("k", "v")).with_addr(backend.addr());
            let mut res = transport.round_trip(req).await.unwrap();
            assert!(!res.is_resp_error());
            assert_eq!(res.values().await.unwrap(), vec![RespValue::ok()]);
            res.close().await.unwrap();

            assert_eq!(transport.idle_len(&backend.addr()), 1, "iteration {i}");
        }

        assert_eq!(transport.stats().dials(), 1);
        assert_eq!(transport.stats().reused(), 2);
    }

    #[tokio::test]
    async fn pipelined_replies_come_back_in_order() {
        let backend = testutil::spawn_store_backend().await;
        let transport = Transport::default();

        let req = Request::new(vec![
            set_cmd("pipe", "v1"),
            get_cmd("pipe"),
            Command::new("DEL", vec![Bytes::from("pipe")]),
        ])
        .with_addr(backend.addr());

        let mut res = transport.round_trip(req).await.unwrap();
        let values = res.values().await.unwrap();
        assert_eq!(
            values,
            vec![
                RespValue::ok(),
                RespValue::bulk(Bytes::from("v1")),
                RespValue::Integer(1),
            ]
        );
        res.close().await.unwrap();

        // All three replies rode one connection.
        assert_eq!(transport.stats().dials(), 1);
    }

    #[tokio::test]
    async fn moved_replies_surface_for_retry() {
        let target = "10.9.8.7:6381";
        let backend = testutil::spawn_script_backend(move |_cmd| {
            RespValue::error(format!("MOVED 42 {target}"))
        })
        .await;

        let transport = Transport::default();
        let req = Request::single(set_cmd("k", "v"))
            .with_addr(backend.addr())
            .retryable();

        let res = transport.round_trip(req).await.unwrap();
        assert!(res.is_resp_error());

        let rebuilt = res.retry().await.unwrap();
        assert_eq!(rebuilt.addr, target);
        assert_eq!(rebuilt.cmds[0].name, "SET");
    }

    #[tokio::test]
    async fn retried_requests_are_counted() {
        let backend = testutil::spawn_store_backend().await;
        let transport = Transport::default();

        let req = Request::single(set_cmd("k", "v"))
            .with_addr(backend.addr())
            .retryable();
        let rebuilt = req.rebuild(backend.addr()).unwrap();

        let mut res = transport.round_trip(rebuilt).await.unwrap();
        res.close().await.unwrap();
        assert_eq!(transport.stats().retries(), 1);
    }

    #[tokio::test]
    async fn pool_cap_serialises_checkouts() {
        let backend = testutil::spawn_store_backend().await;
        let transport = Arc::new(Transport::new(TransportConfig {
            conns_per_host: 1,
            ..TransportConfig::default()
        }));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let transport = transport.clone();
            let addr = backend.addr();
            tasks.push(tokio::spawn(async move {
                let req = Request::single(set_cmd(&format!("k{i}"), "v")).with_addr(addr);
                let mut res = transport.round_trip(req).await.unwrap();
                let values = res.values().await.unwrap();
                res.close().await.unwrap();
                values
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), vec![RespValue::ok()]);
        }

        // A single connection served every request.
        assert_eq!(transport.stats().dials(), 1);
    }

    #[tokio::test]
    async fn stale_connections_are_pinged_before_reuse() {
        let pings = Arc::new(AtomicU64::new(0));
        let seen = pings.clone();
        let backend = testutil::spawn_script_backend(move |cmd| {
            if cmd.name == "PING" {
                seen.fetch_add(1, Ordering::SeqCst);
                RespValue::SimpleString("PONG".to_string())
            } else {
                RespValue::ok()
            }
        })
        .await;

        let transport = Transport::new(TransportConfig {
            ping_interval: Duration::ZERO,
            ..TransportConfig::default()
        });

        for _ in 0..2 {
            let req = Request::single(set_cmd("k", "v")).with_addr(backend.addr());
            let mut res = transport.round_trip(req).await.unwrap();
            res.close().await.unwrap();
        }

        // The second checkout found a stale connection and pinged it.
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().pings(), 1);
        assert_eq!(transport.stats().reused(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoints_fail_the_round_trip() {
        let transport = Transport::default();
        let req = Request::single(set_cmd("k", "v")).with_addr("127.0.0.1:1");

        let err = transport.round_trip(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_) | ProxyError::Canceled(_)));
    }

    #[tokio::test]
    async fn expired_contexts_abort_before_dialing() {
        let transport = Transport::default();
        let req = Request::single(set_cmd("k", "v"))
            .with_addr("127.0.0.1:1")
            .with_context(Context::with_timeout(Duration::ZERO));

        assert!(matches!(
            transport.round_trip(req).await,
            Err(ProxyError::Canceled(_))
        ));
    }

    #[tokio::test]
    async fn transactions_buffer_the_exec_outcome() {
        let backend = testutil::spawn_store_backend().await;
        let transport = Transport::default();

        let req = Request::new(vec![
            Command::new("MULTI", vec![]),
            set_cmd("t", "1"),
            get_cmd("t"),
            Command::new("EXEC", vec![]),
        ])
        .with_addr(backend.addr());

        let mut res = transport.round_trip(req).await.unwrap();
        assert!(!res.is_resp_error());

        let values = res.values().await.unwrap();
        assert_eq!(
            values,
            vec![
                RespValue::Array(Some(vec![RespValue::ok()])),
                RespValue::Array(Some(vec![RespValue::bulk(Bytes::from("1"))])),
            ]
        );
        res.close().await.unwrap();

        assert_eq!(transport.idle_len(&backend.addr()), 1);
    }
}
