//! Commands and requests.
//!
//! A [`Request`] is what one handler invocation sees: a single command, a
//! full `MULTI…EXEC`/`MULTI…DISCARD` transaction, or a pipeline batch.
//! Command arguments are refcounted byte slices, so a retry-enabled request
//! can be rebuilt for reissue without copying argument data.

use bytes::Bytes;

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::resp::{FromResp, RespValue};

pub const CMD_MULTI: &str = "MULTI";
pub const CMD_EXEC: &str = "EXEC";
pub const CMD_DISCARD: &str = "DISCARD";

/// A single Redis command: an upper-cased name plus binary arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<Bytes>) -> Self {
        let mut name = name.into();
        name.make_ascii_uppercase();
        Self { name, args }
    }

    /// Interpret a decoded RESP frame as a command. Clients send commands as
    /// arrays of bulk strings; simple strings and integers are tolerated the
    /// way real servers tolerate them.
    pub fn from_value(value: RespValue) -> Result<Self> {
        let elements = match value {
            RespValue::Array(Some(elements)) if !elements.is_empty() => elements,
            RespValue::Array(_) => {
                return Err(ProxyError::protocol("empty command array"));
            }
            other => {
                return Err(ProxyError::protocol(format!(
                    "expected a command array, got {other:?}"
                )));
            }
        };

        let mut iter = elements.into_iter();
        let Some(first) = iter.next() else {
            return Err(ProxyError::protocol("empty command array"));
        };
        let name = String::from_resp(first)
            .map_err(|_| ProxyError::protocol("command name is not a string"))?;

        let mut args = Vec::with_capacity(iter.len());
        for element in iter {
            args.push(Bytes::from_resp(element).map_err(|_| {
                ProxyError::protocol("command argument is not a scalar value")
            })?);
        }

        Ok(Self::new(name, args))
    }

    /// The routing key: the first argument. Multi-key commands (`MGET`,
    /// `MSET`, `DEL k1 k2 …`) are routed by their first key only.
    pub fn key(&self) -> Option<&Bytes> {
        self.args.first()
    }

    /// Parse argument `index` into a caller type.
    pub fn arg<T: FromResp>(&self, index: usize) -> Result<T> {
        match self.args.get(index) {
            Some(arg) => T::from_resp(RespValue::BulkString(Some(arg.clone()))),
            None => Err(ProxyError::protocol(format!(
                "command {} has no argument {index}",
                self.name
            ))),
        }
    }

    pub fn is_multi(&self) -> bool {
        self.name == CMD_MULTI
    }

    pub fn ends_transaction(&self) -> bool {
        self.name == CMD_EXEC || self.name == CMD_DISCARD
    }
}

/// An ordered, non-empty list of commands dispatched as one unit.
#[derive(Debug, Clone)]
pub struct Request {
    /// The commands of the request. For a transaction this includes the
    /// bracketing `MULTI` and `EXEC`/`DISCARD`.
    pub cmds: Vec<Command>,

    /// Target backend address, filled in by the proxy before the transport
    /// round trip.
    pub addr: String,

    /// Cancellation scope.
    pub ctx: Context,

    retryable: bool,
    retried: bool,
}

impl Request {
    pub fn new(cmds: Vec<Command>) -> Self {
        debug_assert!(!cmds.is_empty(), "a request carries at least one command");
        Self {
            cmds,
            addr: String::new(),
            ctx: Context::background(),
            retryable: false,
            retried: false,
        }
    }

    pub fn single(cmd: Command) -> Self {
        Self::new(vec![cmd])
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Mark the request replayable for `MOVED` reissue.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// True if this request was rebuilt from a `MOVED` reply.
    pub(crate) fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn is_transaction(&self) -> bool {
        self.cmds.first().map(Command::is_multi).unwrap_or(false)
    }

    /// The commands between `MULTI` and `EXEC` of a transaction.
    pub fn inner_cmds(&self) -> &[Command] {
        if self.is_transaction() && self.cmds.len() >= 2 {
            &self.cmds[1..self.cmds.len() - 1]
        } else {
            &self.cmds
        }
    }

    /// Rebuild this request against a new address. Only retry-enabled
    /// requests can be rebuilt; argument buffers are shared, not copied.
    pub fn rebuild(&self, addr: impl Into<String>) -> Result<Request> {
        if !self.retryable {
            return Err(ProxyError::NotRetryable);
        }

        Ok(Request {
            cmds: self.cmds.clone(),
            addr: addr.into(),
            ctx: self.ctx.clone(),
            retryable: false,
            retried: true,
        })
    }
}
