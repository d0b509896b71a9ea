//! Per-endpoint connection pools.
//!
//! Each endpoint gets a bounded pool: at most `conns_per_host` established
//! connections, enforced by a semaphore whose waiters are served in FIFO
//! order, with idle connections reused LIFO to keep warm sockets hot. A
//! global idle cap bounds idle connections across all endpoints.
//!
//! Ownership of a connection transfers from the pool to the in-flight
//! request: a [`PooledConn`] that is dropped without being released simply
//! closes its socket, which is the required behavior for cancelled requests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::resp::{ReplyHeader, RespReader, RespValue, RespWriter};
use crate::server::Command;

/// Monotonic transport counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    dials: AtomicU64,
    reused: AtomicU64,
    pings: AtomicU64,
    ping_failures: AtomicU64,
    retries: AtomicU64,
    discarded: AtomicU64,
}

impl TransportStats {
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn ping_failures(&self) -> u64 {
        self.ping_failures.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }

    pub(crate) fn count_dial(&self) {
        self.dials.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_reuse(&self) {
        self.reused.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_ping_failure(&self) {
        self.ping_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_discard(&self) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// State shared by every pool of one transport.
#[derive(Debug)]
pub(crate) struct Shared {
    pub max_idle_conns: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub idle_total: AtomicUsize,
    pub stats: TransportStats,
}

/// An established backend connection: split stream halves behind the codec.
pub(crate) struct BackendConn {
    pub reader: RespReader<OwnedReadHalf>,
    pub writer: RespWriter<OwnedWriteHalf>,
    pub last_ping: Instant,
}

impl BackendConn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: RespReader::new(r),
            writer: RespWriter::new(w),
            last_ping: Instant::now(),
        }
    }

    /// Round-trip a `PING`; any non-error scalar reply counts as healthy.
    pub(crate) async fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.writer.write_command("PING", &[]);
        self.writer.flush(Some(timeout)).await?;

        match self.reader.read_header(Some(timeout)).await? {
            ReplyHeader::Value(RespValue::Error(msg)) => Err(ProxyError::Resp(msg)),
            ReplyHeader::Value(_) => {
                self.last_ping = Instant::now();
                Ok(())
            }
            ReplyHeader::Array(_) => Err(ProxyError::protocol("unexpected PING reply shape")),
        }
    }

    /// Healthy without re-pinging if the last ping is recent enough.
    pub(crate) fn ping_fresh(&self, interval: Duration) -> bool {
        self.last_ping.elapsed() < interval
    }
}

impl std::fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConn").finish_non_exhaustive()
    }
}

/// Pool of connections to one endpoint.
#[derive(Debug)]
pub(crate) struct Pool {
    pub addr: String,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<BackendConn>>,
}

impl Pool {
    pub(crate) fn new(addr: String, conns_per_host: usize) -> Self {
        Self {
            addr,
            slots: Arc::new(Semaphore::new(conns_per_host)),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Wait for a connection slot; waiters are woken in FIFO order.
    pub(crate) async fn slot(&self, ctx: &Context) -> Result<OwnedSemaphorePermit> {
        let slots = self.slots.clone();
        ctx.run("waiting for a connection slot", async move {
            slots
                .acquire_owned()
                .await
                .map_err(|_| ProxyError::routing("connection pool closed"))
        })
        .await
    }

    /// Most recently parked connection first.
    pub(crate) fn pop_idle(&self, shared: &Shared) -> Option<BackendConn> {
        let conn = self.idle.lock().expect("pool poisoned").pop();
        if conn.is_some() {
            shared.idle_total.fetch_sub(1, Ordering::SeqCst);
        }
        conn
    }

    /// Park a connection, unless the global idle cap is reached.
    pub(crate) fn put_idle(&self, conn: BackendConn, shared: &Shared) {
        let total = shared.idle_total.fetch_add(1, Ordering::SeqCst);
        if total >= shared.max_idle_conns {
            shared.idle_total.fetch_sub(1, Ordering::SeqCst);
            shared.stats.count_discard();
            debug!(addr = %self.addr, "idle cap reached, closing connection");
            return;
        }
        self.idle.lock().expect("pool poisoned").push(conn);
    }

    pub(crate) fn drain_idle(&self, shared: &Shared) {
        let mut idle = self.idle.lock().expect("pool poisoned");
        shared
            .idle_total
            .fetch_sub(idle.len(), Ordering::SeqCst);
        idle.clear();
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().expect("pool poisoned").len()
    }
}

/// Write half of a checked-out connection.
///
/// While a pipelined request is in flight the writer is driven by its own
/// task; the connection may only return to the pool after that task has
/// quiesced.
enum WriterState {
    Idle(RespWriter<OwnedWriteHalf>),
    Flushing(JoinHandle<Result<RespWriter<OwnedWriteHalf>>>),
    Gone,
}

/// A connection checked out of a pool, owned by one in-flight request.
pub(crate) struct PooledConn {
    reader: RespReader<OwnedReadHalf>,
    writer: WriterState,
    last_ping: Instant,
    dirty: bool,
    pool: Arc<Pool>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub(crate) fn new(
        conn: BackendConn,
        pool: Arc<Pool>,
        shared: Arc<Shared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            reader: conn.reader,
            writer: WriterState::Idle(conn.writer),
            last_ping: conn.last_ping,
            dirty: false,
            pool,
            shared,
            _permit: permit,
        }
    }

    /// Write `cmds` back-to-back and flush once, inline on this task.
    pub(crate) async fn send(&mut self, cmds: &[Command], ctx: &Context) -> Result<()> {
        let WriterState::Idle(writer) = &mut self.writer else {
            return Err(ProxyError::protocol("connection writer is busy"));
        };

        for cmd in cmds {
            writer.write_command(&cmd.name, &cmd.args);
        }

        let timeout = ctx.remaining();
        match writer.flush(timeout).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    /// Hand the writer to a dedicated task that writes `cmds` atomically
    /// while the caller starts reading replies.
    pub(crate) fn spawn_send(&mut self, cmds: Vec<Command>, ctx: &Context) -> Result<()> {
        match std::mem::replace(&mut self.writer, WriterState::Gone) {
            WriterState::Idle(mut writer) => {
                let timeout = ctx.remaining();
                let handle = tokio::spawn(async move {
                    for cmd in &cmds {
                        writer.write_command(&cmd.name, &cmd.args);
                    }
                    writer.flush(timeout).await?;
                    Ok(writer)
                });

                self.writer = WriterState::Flushing(handle);
                Ok(())
            }
            other => {
                self.writer = other;
                Err(ProxyError::protocol("connection writer is busy"))
            }
        }
    }

    /// Wait for an in-flight writer task to finish.
    pub(crate) async fn quiesce(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.writer, WriterState::Gone) {
            WriterState::Flushing(handle) => match handle.await {
                Ok(Ok(writer)) => {
                    self.writer = WriterState::Idle(writer);
                    Ok(())
                }
                Ok(Err(err)) => {
                    self.dirty = true;
                    Err(err)
                }
                Err(join) => {
                    self.dirty = true;
                    Err(ProxyError::protocol(format!("writer task failed: {join}")))
                }
            },
            other => {
                self.writer = other;
                Ok(())
            }
        }
    }

    pub(crate) async fn read_header(&mut self, ctx: &Context) -> Result<ReplyHeader> {
        match self.reader.read_header(ctx.remaining()).await {
            Ok(header) => Ok(header),
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    pub(crate) async fn read_value(&mut self, ctx: &Context) -> Result<RespValue> {
        match self.reader.read_value(ctx.remaining()).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    /// Return the connection to its pool if the codec is in a clean state,
    /// otherwise close it.
    pub(crate) async fn release(mut self) {
        let clean = self.quiesce().await.is_ok() && !self.dirty && !self.reader.has_buffered_data();
        if !clean {
            self.discard();
            return;
        }

        let PooledConn {
            reader,
            writer,
            last_ping,
            pool,
            shared,
            _permit,
            ..
        } = self;

        let WriterState::Idle(writer) = writer else {
            shared.stats.count_discard();
            return;
        };

        let conn = BackendConn {
            reader,
            writer,
            last_ping,
        };
        pool.put_idle(conn, &shared);

        // The slot permit is released here, after the connection is parked.
        drop(_permit);
    }

    /// Close the connection outright.
    pub(crate) fn discard(self) {
        self.shared.stats.count_discard();
    }
}
