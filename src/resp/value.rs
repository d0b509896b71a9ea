//! RESP values and conversions into caller types.

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

use crate::error::{ProxyError, Result};

/// A single RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (`+OK\r\n`)
    SimpleString(String),
    /// Error (`-ERR message\r\n`)
    Error(String),
    /// Integer (`:123\r\n`)
    Integer(i64),
    /// Bulk String (`$5\r\nhello\r\n`); `None` is the null bulk (`$-1\r\n`)
    BulkString(Option<Bytes>),
    /// Array (`*2\r\n...`); `None` is the null array (`*-1\r\n`)
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Build the RESP array frame for a command and its arguments, each
    /// encoded as a bulk string.
    pub fn command(name: &str, args: &[Bytes]) -> Self {
        let mut elements = Vec::with_capacity(1 + args.len());
        elements.push(RespValue::bulk(Bytes::copy_from_slice(name.as_bytes())));
        for arg in args {
            elements.push(RespValue::BulkString(Some(arg.clone())));
        }
        RespValue::Array(Some(elements))
    }

    /// Serialize this value into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    element.encode_into(buf);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Conversion of a RESP value into a caller-owned slot.
///
/// An `Error` value surfaces as [`ProxyError::Resp`] for every target type
/// except `RespValue` itself, which carries it through unchanged.
pub trait FromResp: Sized {
    fn from_resp(value: RespValue) -> Result<Self>;
}

fn reject_error(value: RespValue) -> Result<RespValue> {
    match value {
        RespValue::Error(msg) => Err(ProxyError::Resp(msg)),
        other => Ok(other),
    }
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromResp for Bytes {
    fn from_resp(value: RespValue) -> Result<Self> {
        match reject_error(value)? {
            RespValue::BulkString(Some(data)) => Ok(data),
            RespValue::BulkString(None) => Ok(Bytes::new()),
            RespValue::SimpleString(s) => Ok(Bytes::from(s)),
            RespValue::Integer(n) => Ok(Bytes::from(n.to_string())),
            other => Err(ProxyError::protocol(format!(
                "cannot read bytes out of {other:?}"
            ))),
        }
    }
}

impl FromResp for Vec<u8> {
    fn from_resp(value: RespValue) -> Result<Self> {
        Bytes::from_resp(value).map(|b| b.to_vec())
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> Result<Self> {
        let bytes = Bytes::from_resp(value)?;
        str::from_utf8(&bytes)
            .map(|s| s.to_string())
            .map_err(|e| ProxyError::protocol(format!("invalid utf-8 argument: {e}")))
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match reject_error(value)? {
            RespValue::Integer(n) => Ok(n),
            RespValue::BulkString(Some(data)) => btoi::btoi(&data)
                .map_err(|e| ProxyError::protocol(format!("invalid integer argument: {e}"))),
            RespValue::SimpleString(s) => btoi::btoi(s.as_bytes())
                .map_err(|e| ProxyError::protocol(format!("invalid integer argument: {e}"))),
            other => Err(ProxyError::protocol(format!(
                "cannot read an integer out of {other:?}"
            ))),
        }
    }
}

impl FromResp for u64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        let n = i64::from_resp(value)?;
        u64::try_from(n).map_err(|_| ProxyError::protocol("negative value for unsigned argument"))
    }
}

impl FromResp for f64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        let s = String::from_resp(value)?;
        s.parse()
            .map_err(|e| ProxyError::protocol(format!("invalid float argument: {e}")))
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> Result<Self> {
        Ok(i64::from_resp(value)? != 0)
    }
}
