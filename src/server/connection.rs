//! Per-connection serving: the read/dispatch/write state machine.
//!
//! Every accepted client connection is driven by one task. The task reads a
//! command (or collects a `MULTI…EXEC` transaction, or a pipeline batch when
//! enabled), invokes the handler exactly once for the batch, enforces the
//! reply-write discipline and flushes before reading the next command.
//!
//! The handler is invoked behind an unwind boundary: a panicking handler
//! closes its own client connection and nothing else.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::request::{Command, Request};
use crate::error::{ProxyError, Result};
use crate::resp::{RespReader, RespValue, RespWriter};

/// Byte stream a client connection runs over. Blanket-implemented so the
/// server can be exercised over in-memory pipes in tests.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A raw connection reclaimed from the server via hijacking.
pub type BoxedIo = Box<dyn Io>;

/// Write side of one handler invocation.
///
/// `write_stream(n)` declares an array reply of exactly `n` elements; the
/// declaration must precede any `write` and may only be made once per reply
/// unit. A `flush` at a completed reply boundary closes the unit and arms the
/// discipline for the next one.
#[async_trait]
pub trait ResponseWriter: Send {
    fn write_stream(&mut self, n: i64) -> Result<()>;

    fn write(&mut self, value: RespValue) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Claim exclusive ownership of the raw client connection. After a
    /// successful hijack every other method fails with
    /// [`ProxyError::Hijacked`].
    fn hijack(&mut self) -> Result<BoxedIo> {
        Err(ProxyError::NotHijackable)
    }
}

/// A handler responds to one request batch.
///
/// Returning signals the request is finished; the server flushes buffered
/// writes on return. An error return closes the client connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()>;
}

/// Adapter to use a plain function as a [`Handler`].
pub struct HandlerFunc<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFunc<F>
where
    F: Fn(&mut dyn ResponseWriter, Request) -> Result<()> + Send + Sync,
{
    async fn serve(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()> {
        (self.0)(w, req)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConnConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub pipeline: bool,
    pub retry: bool,
}

struct ConnIo<S: Io> {
    reader: RespReader<ReadHalf<S>>,
    writer: RespWriter<WriteHalf<S>>,
}

/// One client connection plus its reply-write discipline.
pub(crate) struct ServerConn<S: Io> {
    io: Option<ConnIo<S>>,
    config: ConnConfig,
    stream_remaining: Option<i64>,
    wrote: bool,
}

impl<S: Io> ServerConn<S> {
    pub(crate) fn new(stream: S, config: ConnConfig) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            io: Some(ConnIo {
                reader: RespReader::new(r),
                writer: RespWriter::new(w),
            }),
            config,
            stream_remaining: None,
            wrote: false,
        }
    }

    fn io_mut(&mut self) -> Result<&mut ConnIo<S>> {
        self.io.as_mut().ok_or(ProxyError::Hijacked)
    }

    pub(crate) fn is_hijacked(&self) -> bool {
        self.io.is_none()
    }

    /// Read the next command frame. `idle` selects the idle timeout for the
    /// initial wait, otherwise the read timeout applies throughout.
    async fn read_value(&mut self, idle: bool) -> Result<Option<RespValue>> {
        let first_wait = if idle {
            self.config.idle_timeout
        } else {
            self.config.read_timeout
        };
        let read_timeout = self.config.read_timeout;

        self.io_mut()?
            .reader
            .read_value_idle(Some(first_wait), Some(read_timeout))
            .await
    }

    fn peek_buffered(&self) -> Result<Option<(RespValue, usize)>> {
        match &self.io {
            Some(io) => io.reader.peek_buffered(),
            None => Err(ProxyError::Hijacked),
        }
    }

    fn consume_buffered(&mut self, n: usize) {
        if let Some(io) = self.io.as_mut() {
            io.reader.consume_buffered(n);
        }
    }

    fn rw_write_stream(&mut self, n: i64) -> Result<()> {
        if self.is_hijacked() {
            return Err(ProxyError::Hijacked);
        }
        if n < 0 {
            return Err(ProxyError::NegativeStreamCount);
        }
        if self.wrote {
            return Err(ProxyError::WriteStreamAfterWrite);
        }
        if self.stream_remaining.is_some() {
            return Err(ProxyError::WriteStreamTwice);
        }

        self.io_mut()?.writer.write_array_header(n);
        self.stream_remaining = Some(n);
        Ok(())
    }

    fn rw_write(&mut self, value: RespValue) -> Result<()> {
        if self.is_hijacked() {
            return Err(ProxyError::Hijacked);
        }
        if let Some(remaining) = self.stream_remaining {
            if remaining == 0 {
                return Err(ProxyError::TooManyWrites);
            }
            self.stream_remaining = Some(remaining - 1);
        }

        self.wrote = true;
        self.io_mut()?.writer.write_value(&value);
        Ok(())
    }

    async fn rw_flush(&mut self) -> Result<()> {
        if self.is_hijacked() {
            return Err(ProxyError::Hijacked);
        }

        let timeout = self.config.write_timeout;
        self.io_mut()?.writer.flush(Some(timeout)).await?;

        // A flush at a reply boundary completes the unit and re-arms the
        // write discipline; flushing mid-stream keeps the remaining count.
        match self.stream_remaining {
            Some(n) if n > 0 => {}
            _ => {
                self.stream_remaining = None;
                self.wrote = false;
            }
        }
        Ok(())
    }

    fn rw_hijack(&mut self) -> Result<BoxedIo>
    where
        S: 'static,
    {
        let io = self.io.take().ok_or(ProxyError::Hijacked)?;
        let stream = io.reader.into_inner().unsplit(io.writer.into_inner());
        Ok(Box::new(stream))
    }

    /// Called when the handler returns: verifies any declared stream was
    /// fully written, then flushes.
    async fn finish_reply(&mut self) -> Result<()> {
        if let Some(remaining) = self.stream_remaining {
            if remaining > 0 {
                return Err(ProxyError::NotEnoughWrites);
            }
        }
        self.rw_flush().await
    }
}

/// [`ResponseWriter`] handed to the handler; borrows the connection for the
/// duration of one invocation.
pub(crate) struct ConnWriter<'a, S: Io + 'static> {
    conn: &'a mut ServerConn<S>,
}

#[async_trait]
impl<'a, S: Io + 'static> ResponseWriter for ConnWriter<'a, S> {
    fn write_stream(&mut self, n: i64) -> Result<()> {
        self.conn.rw_write_stream(n)
    }

    fn write(&mut self, value: RespValue) -> Result<()> {
        self.conn.rw_write(value)
    }

    async fn flush(&mut self) -> Result<()> {
        self.conn.rw_flush().await
    }

    fn hijack(&mut self) -> Result<BoxedIo> {
        self.conn.rw_hijack()
    }
}

/// Drive one client connection to completion.
pub(crate) async fn serve_connection<S: Io + 'static>(
    stream: S,
    peer: String,
    handler: Arc<dyn Handler>,
    config: ConnConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn = ServerConn::new(stream, config.clone());

    loop {
        let first = tokio::select! {
            _ = shutdown.changed() => {
                debug!(remote_addr = %peer, "closing idle connection for shutdown");
                break;
            }
            value = conn.read_value(true) => value,
        };

        let value = match first {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(err) => {
                log_close(&peer, &err);
                break;
            }
        };

        let mut cmds = match Command::from_value(value) {
            Ok(cmd) => vec![cmd],
            Err(err) => {
                log_close(&peer, &err);
                break;
            }
        };

        if let Err(err) = collect_batch(&mut conn, &mut cmds).await {
            log_close(&peer, &err);
            break;
        }

        let mut req = Request::new(std::mem::take(&mut cmds));
        if config.retry {
            req = req.retryable();
        }

        let outcome = {
            let mut writer = ConnWriter { conn: &mut conn };
            AssertUnwindSafe(handler.serve(&mut writer, req))
                .catch_unwind()
                .await
        };

        match outcome {
            Err(_) => {
                error!(remote_addr = %peer, "handler panicked, closing connection");
                break;
            }
            Ok(Err(err)) => {
                log_close(&peer, &err);
                break;
            }
            Ok(Ok(())) => {}
        }

        if conn.is_hijacked() {
            debug!(remote_addr = %peer, "connection hijacked");
            break;
        }

        if let Err(err) = conn.finish_reply().await {
            log_close(&peer, &err);
            break;
        }
    }
}

/// Grow the initial command into a full transaction or a pipeline batch.
async fn collect_batch<S: Io + 'static>(
    conn: &mut ServerConn<S>,
    cmds: &mut Vec<Command>,
) -> Result<()> {
    if cmds[0].is_multi() {
        loop {
            match conn.read_value(false).await? {
                Some(value) => {
                    let cmd = Command::from_value(value)?;
                    let done = cmd.ends_transaction();
                    cmds.push(cmd);
                    if done {
                        return Ok(());
                    }
                }
                None => {
                    return Err(ProxyError::protocol(
                        "client closed the connection inside a transaction",
                    ));
                }
            }
        }
    }

    if conn.config.pipeline {
        // Batch every command already sitting in the decoder buffer; stop as
        // soon as the decoder would block or a transaction begins.
        while let Some((value, consumed)) = conn.peek_buffered()? {
            let cmd = Command::from_value(value)?;
            if cmd.is_multi() {
                break;
            }
            conn.consume_buffered(consumed);
            cmds.push(cmd);
        }
    }

    Ok(())
}

fn log_close(peer: &str, err: &ProxyError) {
    if err.is_eof() {
        return;
    }
    if let ProxyError::Io(io) = err {
        if io.kind() == std::io::ErrorKind::TimedOut {
            debug!(remote_addr = %peer, "connection timed out");
            return;
        }
    }
    warn!(remote_addr = %peer, error = %err, "closing client connection");
}
