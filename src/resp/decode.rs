//! Streaming RESP decoding.
//!
//! [`RespReader`] wraps a socket (or any `AsyncRead`) behind a growable byte
//! buffer and parses frames incrementally: a frame is only consumed from the
//! buffer once it is complete, so a short read never corrupts decoder state.
//! Array replies can be consumed element-by-element through
//! [`RespReader::read_header`] so large backend replies are streamed instead
//! of buffered.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::str;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::value::RespValue;
use crate::error::{ProxyError, Result};

/// Minimum amount of buffer space reserved ahead of every socket read.
const READ_CHUNK: usize = 1024;

/// The first frame of a reply.
///
/// Scalar replies (and the null bulk/null array) arrive complete; array
/// replies arrive as a header whose `n` elements are read afterwards, one by
/// one.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyHeader {
    Value(RespValue),
    Array(usize),
}

/// Buffered, incremental RESP reader.
#[derive(Debug)]
pub struct RespReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * READ_CHUNK),
        }
    }

    /// True if the buffer holds unparsed bytes (possibly a partial frame).
    pub fn has_buffered_data(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    /// Parse one complete value out of the buffer without touching the
    /// socket. Used to batch pipelined commands: returns `None` as soon as
    /// the decoder would have to block.
    pub fn buffered_value(&mut self) -> Result<Option<RespValue>> {
        match parse_value(&self.buf)? {
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse the value at the head of the buffer without consuming it,
    /// returning it together with its encoded length.
    pub(crate) fn peek_buffered(&self) -> Result<Option<(RespValue, usize)>> {
        parse_value(&self.buf)
    }

    pub(crate) fn consume_buffered(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Read one complete value. `idle` bounds the wait for the first byte
    /// when the buffer is empty, `read` bounds every subsequent socket read.
    /// Returns `None` on a clean EOF at a frame boundary.
    pub async fn read_value_idle(
        &mut self,
        idle: Option<Duration>,
        read: Option<Duration>,
    ) -> Result<Option<RespValue>> {
        loop {
            if let Some(value) = self.buffered_value()? {
                return Ok(Some(value));
            }

            let timeout = if self.buf.is_empty() { idle } else { read };
            if self.fill(timeout).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(eof("connection closed mid-frame"));
            }
        }
    }

    /// Read one complete value, treating EOF as an error.
    pub async fn read_value(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        match self.read_value_idle(timeout, timeout).await? {
            Some(value) => Ok(value),
            None => Err(eof("connection closed while awaiting a reply")),
        }
    }

    /// Read a reply header: either a complete scalar value or the element
    /// count of an array whose elements follow.
    pub async fn read_header(&mut self, timeout: Option<Duration>) -> Result<ReplyHeader> {
        loop {
            match parse_header(&self.buf)? {
                Some((header, consumed)) => {
                    self.buf.advance(consumed);
                    return Ok(header);
                }
                None => {
                    if self.fill(timeout).await? == 0 {
                        return Err(eof("connection closed while awaiting a reply"));
                    }
                }
            }
        }
    }

    async fn fill(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.buf.reserve(READ_CHUNK);
        let read = self.io.read_buf(&mut self.buf);
        let n = match timeout {
            None => read.await?,
            Some(t) => tokio::time::timeout(t, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??,
        };
        Ok(n)
    }
}

fn eof(msg: &str) -> ProxyError {
    ProxyError::from(io::Error::new(io::ErrorKind::UnexpectedEof, msg.to_string()))
}

/// Parse one value at the start of `buf`. Returns the value and the number
/// of bytes it occupied, or `None` if the frame is not complete yet.
pub(crate) fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    let Some((line, header_len)) = read_line(buf)? else {
        return Ok(None);
    };

    let (tag, rest) = split_tag(line)?;
    match tag {
        b'+' => Ok(Some((
            RespValue::SimpleString(line_str(rest)?.to_string()),
            header_len,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(line_str(rest)?.to_string()),
            header_len,
        ))),
        b':' => Ok(Some((RespValue::Integer(parse_int(rest)?), header_len))),
        b'$' => {
            let len = parse_int(rest)?;
            if len == -1 {
                return Ok(Some((RespValue::BulkString(None), header_len)));
            }
            if len < 0 {
                return Err(ProxyError::protocol(format!("invalid bulk length {len}")));
            }

            let len = len as usize;
            let total = header_len + len + 2;
            if buf.len() < total {
                return Ok(None);
            }

            let payload = &buf[header_len..header_len + len];
            if &buf[header_len + len..total] != b"\r\n" {
                return Err(ProxyError::protocol("bulk string missing trailing CRLF"));
            }

            Ok(Some((
                RespValue::BulkString(Some(Bytes::copy_from_slice(payload))),
                total,
            )))
        }
        b'*' => {
            let count = parse_int(rest)?;
            if count == -1 {
                return Ok(Some((RespValue::Array(None), header_len)));
            }
            if count < 0 {
                return Err(ProxyError::protocol(format!("invalid array length {count}")));
            }

            let mut elements = Vec::with_capacity(count as usize);
            let mut consumed = header_len;

            for _ in 0..count {
                match parse_value(&buf[consumed..])? {
                    Some((element, n)) => {
                        elements.push(element);
                        consumed += n;
                    }
                    None => return Ok(None),
                }
            }

            Ok(Some((RespValue::Array(Some(elements)), consumed)))
        }
        other => Err(ProxyError::protocol(format!(
            "unknown RESP type tag {:?}",
            other as char
        ))),
    }
}

/// Parse a reply header at the start of `buf`. Scalars and bulk strings are
/// parsed whole; non-null arrays yield only their element count.
pub(crate) fn parse_header(buf: &[u8]) -> Result<Option<(ReplyHeader, usize)>> {
    let Some((line, header_len)) = read_line(buf)? else {
        return Ok(None);
    };

    if line.first() == Some(&b'*') {
        let count = parse_int(&line[1..])?;
        if count >= 0 {
            return Ok(Some((ReplyHeader::Array(count as usize), header_len)));
        }
        if count == -1 {
            return Ok(Some((ReplyHeader::Value(RespValue::Array(None)), header_len)));
        }
        return Err(ProxyError::protocol(format!("invalid array length {count}")));
    }

    match parse_value(buf)? {
        Some((value, consumed)) => Ok(Some((ReplyHeader::Value(value), consumed))),
        None => Ok(None),
    }
}

/// Find the CRLF-terminated line at the start of `buf`; returns the line
/// without its terminator plus the terminated length.
fn read_line(buf: &[u8]) -> Result<Option<(&[u8], usize)>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(at) => Ok(Some((&buf[..at], at + 2))),
        None => Ok(None),
    }
}

fn split_tag(line: &[u8]) -> Result<(u8, &[u8])> {
    match line.split_first() {
        Some((tag, rest)) => Ok((*tag, rest)),
        None => Err(ProxyError::protocol("empty RESP line")),
    }
}

fn parse_int(data: &[u8]) -> Result<i64> {
    btoi::btoi(data).map_err(|_| {
        ProxyError::protocol(format!(
            "invalid RESP integer {:?}",
            String::from_utf8_lossy(data)
        ))
    })
}

fn line_str(data: &[u8]) -> Result<&str> {
    str::from_utf8(data).map_err(|e| ProxyError::protocol(format!("invalid utf-8 line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &str) -> RespValue {
        let (value, consumed) = parse_value(input.as_bytes()).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        value
    }

    #[test]
    fn parse_simple_string() {
        assert_eq!(parse_one("+OK\r\n"), RespValue::SimpleString("OK".into()));
    }

    #[test]
    fn parse_error() {
        assert_eq!(
            parse_one("-ERR unknown command\r\n"),
            RespValue::Error("ERR unknown command".into())
        );
    }

    #[test]
    fn parse_integer() {
        assert_eq!(parse_one(":1000\r\n"), RespValue::Integer(1000));
    }

    #[test]
    fn parse_bulk_string() {
        assert_eq!(
            parse_one("$5\r\nhello\r\n"),
            RespValue::BulkString(Some(Bytes::from("hello")))
        );
    }

    #[test]
    fn parse_empty_bulk_string() {
        assert_eq!(
            parse_one("$0\r\n\r\n"),
            RespValue::BulkString(Some(Bytes::new()))
        );
    }

    #[test]
    fn parse_nulls() {
        assert_eq!(parse_one("$-1\r\n"), RespValue::BulkString(None));
        assert_eq!(parse_one("*-1\r\n"), RespValue::Array(None));
    }

    #[test]
    fn parse_array() {
        let value = parse_one("*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n");
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::bulk(Bytes::from("hello")),
                RespValue::bulk(Bytes::from("world")),
            ]))
        );
    }

    #[test]
    fn incomplete_frames_do_not_consume() {
        assert!(parse_value(b"+OK\r").unwrap().is_none());
        assert!(parse_value(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_value(b"*2\r\n$5\r\nhello\r\n").unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        assert!(matches!(
            parse_value(b"%3\r\n"),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn round_trip_all_types() {
        let values = vec![
            RespValue::SimpleString("OK".into()),
            RespValue::Error("ERR boom".into()),
            RespValue::Integer(-7),
            RespValue::bulk(Bytes::from("payload")),
            RespValue::BulkString(None),
            RespValue::Array(None),
            RespValue::Array(Some(vec![
                RespValue::Integer(1),
                RespValue::Array(Some(vec![RespValue::bulk(Bytes::from("x"))])),
            ])),
        ];

        for value in values {
            let encoded = value.encode();
            let (decoded, consumed) = parse_value(&encoded).unwrap().unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, value, "round trip of {value:?}");
            assert_eq!(decoded.encode(), encoded, "byte-identical re-encode");
        }
    }

    #[test]
    fn header_splits_arrays_for_streaming() {
        let (header, consumed) = parse_header(b"*3\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(header, ReplyHeader::Array(3));
        assert_eq!(consumed, 4);

        let (header, _) = parse_header(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(header, ReplyHeader::Value(RespValue::Array(None)));

        let (header, _) = parse_header(b"+PONG\r\n").unwrap().unwrap();
        assert_eq!(header, ReplyHeader::Value(RespValue::SimpleString("PONG".into())));
    }

    #[tokio::test]
    async fn reader_streams_pipelined_frames() {
        let (client, server) = tokio::io::duplex(256);
        let mut reader = RespReader::new(server);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(b"+OK\r\n:12\r\n$1\r\nv\r\n").await.unwrap();
            drop(client);
        });

        assert_eq!(
            reader.read_value(None).await.unwrap(),
            RespValue::SimpleString("OK".into())
        );
        assert_eq!(reader.read_value(None).await.unwrap(), RespValue::Integer(12));
        assert_eq!(
            reader.read_value(None).await.unwrap(),
            RespValue::bulk(Bytes::from("v"))
        );
        assert!(reader.read_value_idle(None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_times_out_on_idle_socket() {
        let (_client, server) = tokio::io::duplex(256);
        let mut reader = RespReader::new(server);

        let err = reader
            .read_value(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        match err {
            ProxyError::Io(io) => assert_eq!(io.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other}"),
        }
    }
}
