//! Reverse proxy handler.
//!
//! For every request the proxy extracts the routing keys (the first argument
//! of each command), resolves the current hash ring from the registry, checks
//! that all keys agree on one backend, performs the transport round trip and
//! streams the reply back to the client. Connection failures blacklist the
//! endpoint; with retry enabled a `MOVED` reply is reissued once against the
//! address the backend named.

pub mod redirect;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::registry::{ServerEndpoint, ServerRegistry};
use crate::resp::RespValue;
use crate::server::{Handler, Request, ResponseWriter};
use crate::transport::response::Body;
use crate::transport::{Response, Transport};

/// Reply when the registry has no usable membership.
pub const ERR_NO_UPSTREAM: &str = "ERR No upstream server was found for the request.";

/// Reply when a transaction's keys span backends.
pub const ERR_CROSS_SLOT: &str =
    "EXECABORT The transaction contains keys that hash to different upstream servers.";

fn err_connect_failed(addr: &str) -> String {
    format!("ERR Connecting to the upstream ({addr}) server failed.")
}

/// A RESP reverse proxy: routes each request to a backend chosen by
/// consistent hashing and forwards the reply.
pub struct ReverseProxy {
    transport: Arc<Transport>,
    registry: Arc<dyn ServerRegistry>,
}

impl ReverseProxy {
    pub fn new(transport: Arc<Transport>, registry: Arc<dyn ServerRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    async fn serve_request(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()> {
        let keys: Vec<Bytes> = req.cmds.iter().filter_map(|cmd| cmd.key().cloned()).collect();

        let ring = match self.registry.lookup_servers(&req.ctx).await {
            Ok(ring) => ring,
            Err(err) => {
                self.log(&err);
                w.write(RespValue::error(ERR_NO_UPSTREAM))?;
                return w.flush().await;
            }
        };

        // Every key of the request must land on the same backend.
        let mut upstream: Option<String> = None;
        for key in &keys {
            let Some(endpoint) = ring.lookup_server(key) else {
                w.write(RespValue::error(ERR_NO_UPSTREAM))?;
                return w.flush().await;
            };

            match &upstream {
                None => upstream = Some(endpoint.addr.clone()),
                Some(addr) if *addr != endpoint.addr => {
                    w.write(RespValue::error(ERR_CROSS_SLOT))?;
                    return w.flush().await;
                }
                Some(_) => {}
            }
        }

        // Keyless requests (a bare PING) still get a deterministic backend.
        let upstream = match upstream {
            Some(addr) => addr,
            None => match ring.lookup_server(b"") {
                Some(endpoint) => endpoint.addr.clone(),
                None => {
                    w.write(RespValue::error(ERR_NO_UPSTREAM))?;
                    return w.flush().await;
                }
            },
        };

        let retry_enabled = req.is_retryable();
        let req = req.with_addr(&upstream);

        let mut res = match self.transport.round_trip(req).await {
            Ok(res) => res,
            Err(err) => {
                return self.reply_connect_failed(w, &upstream, err).await;
            }
        };

        if retry_enabled && res.is_resp_error() {
            let moved = res
                .resp_error_message()
                .and_then(redirect::moved_target)
                .is_some();

            if moved {
                match res.retry().await {
                    Ok(rebuilt) => {
                        let addr = rebuilt.addr.clone();
                        res = match self.transport.round_trip(rebuilt).await {
                            Ok(res) => res,
                            Err(err) => {
                                return self.reply_connect_failed(w, &addr, err).await;
                            }
                        };
                    }
                    Err(err) => {
                        // The reply named a target we could not reissue to;
                        // nothing is left to forward.
                        self.log(&err);
                        w.write(RespValue::error(ERR_NO_UPSTREAM))?;
                        return w.flush().await;
                    }
                }
            }
        }

        self.forward_response(w, res).await
    }

    async fn reply_connect_failed(
        &self,
        w: &mut dyn ResponseWriter,
        addr: &str,
        err: ProxyError,
    ) -> Result<()> {
        self.log(&err);
        self.registry
            .blacklist_server(&ServerEndpoint::anonymous(addr));

        w.write(RespValue::error(err_connect_failed(addr)))?;
        w.flush().await
    }

    /// Stream a transport response back to the client.
    async fn forward_response(
        &self,
        w: &mut dyn ResponseWriter,
        mut res: Response,
    ) -> Result<()> {
        match res.body_mut() {
            Body::Tx(replies) => {
                if let Some(msg) = replies.take_error() {
                    w.write(RespValue::error(msg))?;
                } else if replies.is_aborted() {
                    w.write(RespValue::Array(None))?;
                } else {
                    w.write_stream(replies.len() as i64)?;
                    while let Some(sub) = replies.next_sub() {
                        w.write(RespValue::Array(Some(sub)))?;
                    }
                }
                w.flush().await?;
            }
            Body::Stream(stream) => {
                while let Some((len, is_array)) = stream.begin().await? {
                    if is_array && len != 1 {
                        w.write_stream(len as i64)?;
                        while let Some(value) = stream.next_value().await? {
                            w.write(value)?;
                        }
                        if let Some(msg) = stream.take_error() {
                            w.write(RespValue::error(msg))?;
                        }
                    } else {
                        if let Some(value) = stream.next_value().await? {
                            w.write(value)?;
                        }
                        if let Some(msg) = stream.take_error() {
                            w.write(RespValue::error(msg))?;
                        }
                    }
                    w.flush().await?;
                }
            }
        }

        if let Err(err) = res.close().await {
            // Reply errors were forwarded above; anything else means the
            // backend connection was discarded, which close already did.
            if !err.is_resp() {
                self.log(&err);
            }
        }
        Ok(())
    }

    fn log(&self, err: &ProxyError) {
        if err.is_eof() {
            return;
        }
        warn!(error = %err, "proxy request failed");
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn serve(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()> {
        self.serve_request(w, req).await
    }
}
