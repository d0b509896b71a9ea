//! Buffered RESP encoding.
//!
//! All writes land in an in-memory buffer and reach the socket only on an
//! explicit [`RespWriter::flush`]. Handlers therefore assemble a complete
//! reply (or a batch of replies) and pay for one syscall.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::value::RespValue;
use crate::error::Result;

/// Buffered RESP writer.
#[derive(Debug)]
pub struct RespWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> RespWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn write_value(&mut self, value: &RespValue) {
        value.encode_into(&mut self.buf);
    }

    /// Emit an array header (`*n\r\n`). The caller is responsible for
    /// writing exactly `n` elements afterwards.
    pub fn write_array_header(&mut self, n: i64) {
        self.buf.put_u8(b'*');
        self.buf.extend_from_slice(n.to_string().as_bytes());
        self.buf.put_slice(b"\r\n");
    }

    /// Encode a command as an array of bulk strings, the only request shape
    /// a Redis server accepts.
    pub fn write_command(&mut self, name: &str, args: &[Bytes]) {
        self.write_array_header(1 + args.len() as i64);

        self.buf.put_u8(b'$');
        self.buf.extend_from_slice(name.len().to_string().as_bytes());
        self.buf.put_slice(b"\r\n");
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.put_slice(b"\r\n");

        for arg in args {
            self.buf.put_u8(b'$');
            self.buf.extend_from_slice(arg.len().to_string().as_bytes());
            self.buf.put_slice(b"\r\n");
            self.buf.extend_from_slice(arg);
            self.buf.put_slice(b"\r\n");
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Write all buffered bytes to the underlying stream. `timeout` bounds
    /// each write syscall.
    pub async fn flush(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let data = self.buf.split();
        let write = async {
            self.io.write_all(&data).await?;
            self.io.flush().await
        };

        match timeout {
            None => write.await?,
            Some(t) => tokio::time::timeout(t, write)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??,
        }

        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.io
    }
}
