//! Connection-oriented RESP server.
//!
//! The server owns the accept loop, spawns one task per client connection
//! and coordinates graceful shutdown: stop accepting, wake every idle
//! connection, then wait for in-flight handlers up to the caller's deadline.

pub mod connection;
pub mod request;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{ProxyError, Result};

pub use connection::{BoxedIo, Handler, HandlerFunc, Io, ResponseWriter};
pub use request::{Command, Request};

use connection::ConnConfig;

/// Server construction options. The defaults mirror the deployment defaults:
/// 30 s read/write timeouts, a 90 s idle timeout, pipelining and retry off.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (`host:port`).
    pub bind: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// Batch sequentially-available commands into one handler call.
    pub enable_pipeline: bool,
    /// Keep request arguments replayable for `MOVED` reissue.
    pub enable_retry: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:6479".to_string(),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            enable_pipeline: false,
            enable_retry: false,
        }
    }
}

/// Accept-loop backoff bounds for transient errors.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A RESP server bound to a [`Handler`].
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    shutdown: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            handler,
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(addr = %self.config.bind, "listening for incoming connections");
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`.
    ///
    /// Returns [`ProxyError::ServerClosed`] after a graceful stop; callers
    /// treat that as success. Transient accept errors are retried with
    /// exponential backoff, permanent ones terminate the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(ProxyError::ServerClosed);
        }
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => return Err(ProxyError::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = ACCEPT_BACKOFF_MIN;

                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(error = %err, "failed to disable nagling");
                    }

                    let handler = self.handler.clone();
                    let conn_config = self.conn_config();
                    let shutdown_rx = self.shutdown.subscribe();
                    let guard = ConnGuard::register(&self.active, &self.drained);

                    tokio::spawn(async move {
                        let _guard = guard;
                        connection::serve_connection(
                            stream,
                            peer.to_string(),
                            handler,
                            conn_config,
                            shutdown_rx,
                        )
                        .await;
                    });
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = %err, delay_ms = backoff.as_millis() as u64,
                        "transient accept error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Gracefully stop: close the listener, unblock idle connections and
    /// wait for in-flight handlers until the context's deadline.
    pub async fn shutdown(&self, ctx: Context) -> Result<()> {
        ctx.check()?;

        let _ = self.shutdown.send(true);

        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match ctx.remaining() {
            None => {
                drained.await;
                Ok(())
            }
            Some(rem) => tokio::time::timeout(rem, drained)
                .await
                .map_err(|_| ProxyError::ShutdownTimeout),
        }
    }

    fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
            idle_timeout: self.config.idle_timeout,
            pipeline: self.config.enable_pipeline,
            retry: self.config.enable_retry,
        }
    }
}

/// Tracks one live connection; the last one out wakes the shutdown waiter.
struct ConnGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ConnGuard {
    fn register(active: &Arc<AtomicUsize>, drained: &Arc<Notify>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: active.clone(),
            drained: drained.clone(),
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::RespValue;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn ok_handler() -> Arc<dyn Handler> {
        Arc::new(HandlerFunc(|w: &mut dyn ResponseWriter, _req: Request| {
            w.write(RespValue::ok())
        }))
    }

    async fn start(handler: Arc<dyn Handler>) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::new(ServerConfig::default(), handler));
        let serving = server.clone();
        tokio::spawn(async move {
            match serving.serve(listener).await {
                Err(ProxyError::ServerClosed) => {}
                other => panic!("serve ended unexpectedly: {other:?}"),
            }
        });

        (server, addr)
    }

    #[tokio::test]
    async fn shutdown_with_no_connections_is_immediate() {
        let (server, _addr) = start(ok_handler()).await;
        server.shutdown(Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_a_cancelled_context_reports_cancellation() {
        let (server, _addr) = start(ok_handler()).await;
        let err = server
            .shutdown(Context::with_timeout(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Canceled(_)));
    }

    #[tokio::test]
    async fn serves_over_real_sockets_and_drains_on_shutdown() {
        let (server, addr) = start(ok_handler()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap();

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"+OK\r\n");

        server
            .shutdown(Context::with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();

        // The idle connection was woken and closed cleanly.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn accepting_stops_after_shutdown() {
        let (server, addr) = start(ok_handler()).await;
        server.shutdown(Context::background()).await.unwrap();

        // The listener is gone; new connections are refused or dropped
        // without ever being served.
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut conn) => {
                conn.write_all(b"*1\r\n$4\r\nPING\r\n").await.ok();
                let mut out = Vec::new();
                let n = conn.read_to_end(&mut out).await.unwrap_or(0);
                assert_eq!(n, 0);
            }
        }
    }

    #[tokio::test]
    async fn transient_error_classification() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "aborted"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }
}
