//! Lazy response streams.
//!
//! A [`Response`] owns the request that produced it and, for streamed
//! bodies, the pooled connection the replies are being read from. Replies
//! are exposed lazily: scalar and in-memory values are queued, array replies
//! stream element-by-element off the connection. A response must be fully
//! consumed or closed before its connection can return to the pool; closing
//! drains unread replies and releases the connection only if the codec ended
//! in a clean state.

use std::collections::VecDeque;

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::proxy::redirect;
use crate::resp::{ReplyHeader, RespValue};
use crate::server::Request;

use super::pool::PooledConn;

/// Response to one round trip.
pub struct Response {
    body: Body,
    resp_err: bool,
    request: Request,
    closed: Option<Result<()>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("resp_err", &self.resp_err)
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

pub(crate) enum Body {
    /// Replies streamed off a pooled connection (single commands and
    /// pipelines), or queued in memory.
    Stream(ReplyStream),
    /// Buffered per-command sub-replies of a transaction.
    Tx(TxReplies),
}

impl Response {
    /// Build a streaming response over `count` command replies. The first
    /// reply header is read eagerly so the error flag is known up front.
    pub(crate) async fn stream(conn: PooledConn, request: Request, count: usize) -> Result<Self> {
        let mut stream = ReplyStream {
            conn: Some(conn),
            ctx: request.ctx.clone(),
            pending: count,
            state: None,
            unhandled_error: None,
        };

        if stream.pending > 0 {
            stream.pending -= 1;
            match header_from_conn(&mut stream.conn, &stream.ctx).await {
                Ok(header) => stream.state = Some(ReplyState::from_header(header)),
                Err(err) => {
                    if let Some(conn) = stream.conn.take() {
                        conn.discard();
                    }
                    return Err(err);
                }
            }
        }

        let resp_err = stream
            .state
            .as_ref()
            .is_some_and(|state| state.error.is_some());

        Ok(Self {
            body: Body::Stream(stream),
            resp_err,
            request,
            closed: None,
        })
    }

    /// A response whose single reply is already in memory.
    pub(crate) fn memory(value: RespValue, request: Request) -> Self {
        let resp_err = value.is_error();
        Self {
            body: Body::Stream(ReplyStream::memory(value)),
            resp_err,
            request,
            closed: None,
        }
    }

    pub(crate) fn tx(replies: TxReplies, request: Request) -> Self {
        let resp_err = replies.error.is_some();
        Self {
            body: Body::Tx(replies),
            resp_err,
            request,
            closed: None,
        }
    }

    /// True if the top-level RESP value of the reply was an error
    /// (`-<msg>`). The message itself is surfaced by [`Response::close`].
    pub fn is_resp_error(&self) -> bool {
        self.resp_err
    }

    /// The buffered error message of an error reply, when one is already
    /// known without consuming the stream.
    pub fn resp_error_message(&self) -> Option<&str> {
        match &self.body {
            Body::Stream(stream) => stream.current_error(),
            Body::Tx(replies) => replies.error.as_deref(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Collect the values of every remaining reply. An error reply surfaces
    /// as `Err`.
    pub async fn values(&mut self) -> Result<Vec<RespValue>> {
        match &mut self.body {
            Body::Stream(stream) => {
                let mut out = Vec::new();
                while stream.begin().await?.is_some() {
                    while let Some(value) = stream.next_value().await? {
                        out.push(value);
                    }
                    if let Some(msg) = stream.take_error() {
                        return Err(ProxyError::Resp(msg));
                    }
                }
                Ok(out)
            }
            Body::Tx(replies) => {
                if let Some(msg) = replies.take_error() {
                    return Err(ProxyError::Resp(msg));
                }
                let mut out = Vec::new();
                while let Some(sub) = replies.next_sub() {
                    out.push(RespValue::Array(Some(sub)));
                }
                Ok(out)
            }
        }
    }

    /// Close the response: drain unread replies and hand the connection
    /// back. Closing twice returns the same first result.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(previous) = &self.closed {
            return previous.clone();
        }

        let result = match &mut self.body {
            Body::Stream(stream) => stream.close().await,
            Body::Tx(replies) => replies.close(),
        };

        self.closed = Some(result.clone());
        result
    }

    /// Close the response and, if it carried a retryable `MOVED` reply,
    /// rebuild the originating request against the redirection target.
    pub async fn retry(mut self) -> Result<Request> {
        if !self.resp_err {
            let _ = self.close().await;
            return Err(ProxyError::NotRetryable);
        }

        let Err(ProxyError::Resp(msg)) = self.close().await else {
            return Err(ProxyError::NotRetryable);
        };

        let Some(addr) = redirect::moved_target(&msg) else {
            return Err(ProxyError::NotRetryable);
        };

        self.request.rebuild(addr)
    }
}

/// One reply being consumed: queued values plus elements still on the wire.
struct ReplyState {
    started: bool,
    queued: VecDeque<RespValue>,
    streaming: usize,
    is_array: bool,
    error: Option<String>,
}

impl ReplyState {
    fn from_header(header: ReplyHeader) -> Self {
        match header {
            ReplyHeader::Array(n) => Self {
                started: false,
                queued: VecDeque::new(),
                streaming: n,
                is_array: true,
                error: None,
            },
            ReplyHeader::Value(RespValue::Error(msg)) => Self {
                started: false,
                queued: VecDeque::new(),
                streaming: 0,
                is_array: false,
                error: Some(msg),
            },
            ReplyHeader::Value(value) => Self {
                started: false,
                queued: VecDeque::from([value]),
                streaming: 0,
                is_array: false,
                error: None,
            },
        }
    }

    fn from_value(value: RespValue) -> Self {
        match value {
            RespValue::Array(Some(elements)) => Self {
                started: false,
                queued: elements.into(),
                streaming: 0,
                is_array: true,
                error: None,
            },
            other => Self::from_header(ReplyHeader::Value(other)),
        }
    }

    fn len(&self) -> usize {
        self.queued.len() + self.streaming
    }
}

/// Sequential reply stream over a checked-out connection.
pub(crate) struct ReplyStream {
    conn: Option<PooledConn>,
    ctx: Context,
    /// Command replies whose header has not been read yet.
    pending: usize,
    state: Option<ReplyState>,
    /// First error reply that was never surfaced through `take_error`;
    /// reported by `close`.
    unhandled_error: Option<String>,
}

impl ReplyStream {
    /// A stream with one in-memory reply and no connection.
    pub(crate) fn memory(value: RespValue) -> Self {
        Self {
            conn: None,
            ctx: Context::background(),
            pending: 0,
            state: Some(ReplyState::from_value(value)),
            unhandled_error: None,
        }
    }

    /// Advance to the next command reply. Returns its element count and
    /// whether it arrived as an array, or `None` once every reply was seen.
    pub(crate) async fn begin(&mut self) -> Result<Option<(usize, bool)>> {
        if let Some(state) = &mut self.state {
            if !state.started {
                state.started = true;
                return Ok(Some((state.len(), state.is_array)));
            }
            self.finish_current().await?;
        }

        if self.pending == 0 {
            return Ok(None);
        }
        self.pending -= 1;

        let header = header_from_conn(&mut self.conn, &self.ctx).await?;
        let mut state = ReplyState::from_header(header);
        state.started = true;
        let info = (state.len(), state.is_array);
        self.state = Some(state);
        Ok(Some(info))
    }

    /// Next value of the current reply. Returns `None` at the end of the
    /// reply or when an error value is reached; the error is then available
    /// through [`ReplyStream::take_error`].
    pub(crate) async fn next_value(&mut self) -> Result<Option<RespValue>> {
        match self.state.as_mut() {
            None => return Ok(None),
            Some(state) => {
                if let Some(value) = state.queued.pop_front() {
                    return Ok(Some(value));
                }
                if state.error.is_some() || state.streaming == 0 {
                    return Ok(None);
                }
                state.streaming -= 1;
            }
        }

        let value = value_from_conn(&mut self.conn, &self.ctx).await?;
        if let RespValue::Error(msg) = value {
            if let Some(state) = self.state.as_mut() {
                state.error = Some(msg);
            }
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// The current reply's error, handing responsibility to the caller.
    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.state.as_mut().and_then(|state| state.error.take())
    }

    pub(crate) fn current_error(&self) -> Option<&str> {
        self.state.as_ref().and_then(|state| state.error.as_deref())
    }

    /// Drain the remainder of the current reply.
    async fn finish_current(&mut self) -> Result<()> {
        if let Some(mut state) = self.state.take() {
            while state.streaming > 0 {
                state.streaming -= 1;
                let value = value_from_conn(&mut self.conn, &self.ctx).await?;
                if let RespValue::Error(msg) = value {
                    if state.error.is_none() {
                        state.error = Some(msg);
                    }
                }
            }
            if let Some(msg) = state.error {
                self.unhandled_error.get_or_insert(msg);
            }
        }
        Ok(())
    }

    /// Drain everything and return the connection to the pool if clean.
    pub(crate) async fn close(&mut self) -> Result<()> {
        let drained: Result<()> = async {
            self.finish_current().await?;
            while self.pending > 0 {
                self.pending -= 1;
                let header = header_from_conn(&mut self.conn, &self.ctx).await?;
                self.state = Some(ReplyState::from_header(header));
                self.finish_current().await?;
            }
            Ok(())
        }
        .await;

        if let Some(conn) = self.conn.take() {
            match &drained {
                Ok(()) => conn.release().await,
                Err(_) => conn.discard(),
            }
        }

        drained?;

        match self.unhandled_error.take() {
            Some(msg) => Err(ProxyError::Resp(msg)),
            None => Ok(()),
        }
    }
}

async fn header_from_conn(conn: &mut Option<PooledConn>, ctx: &Context) -> Result<ReplyHeader> {
    match conn {
        Some(conn) => conn.read_header(ctx).await,
        None => Err(ProxyError::protocol("reply stream has no connection")),
    }
}

async fn value_from_conn(conn: &mut Option<PooledConn>, ctx: &Context) -> Result<RespValue> {
    match conn {
        Some(conn) => conn.read_value(ctx).await,
        None => Err(ProxyError::protocol("reply stream has no connection")),
    }
}

/// Buffered transaction sub-replies: the `EXEC` array split per command.
pub(crate) struct TxReplies {
    subs: VecDeque<Vec<RespValue>>,
    aborted: bool,
    error: Option<String>,
}

impl TxReplies {
    pub(crate) fn new(elements: Vec<RespValue>) -> Self {
        Self {
            subs: elements.into_iter().map(sub_values).collect(),
            aborted: false,
            error: None,
        }
    }

    /// The backend answered `EXEC` with a null array: the transaction was
    /// aborted and is forwarded as `*-1`.
    pub(crate) fn aborted() -> Self {
        Self {
            subs: VecDeque::new(),
            aborted: true,
            error: None,
        }
    }

    pub(crate) fn failed(msg: String) -> Self {
        Self {
            subs: VecDeque::new(),
            aborted: false,
            error: Some(msg),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn next_sub(&mut self) -> Option<Vec<RespValue>> {
        self.subs.pop_front()
    }

    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    fn close(&mut self) -> Result<()> {
        self.subs.clear();
        match self.error.take() {
            Some(msg) => Err(ProxyError::Resp(msg)),
            None => Ok(()),
        }
    }
}

/// A transaction sub-reply rendered as the elements of one array: scalars
/// wrap into a single element, errors become a trailing error element.
fn sub_values(element: RespValue) -> Vec<RespValue> {
    match element {
        RespValue::Array(Some(elements)) => elements,
        other => vec![other],
    }
}
