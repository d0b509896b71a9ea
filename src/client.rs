//! Thin client over the transport.
//!
//! `Client` targets a single address and is what the test-suites (and
//! embedders that want a raw RESP client) drive servers with. It shares a
//! [`Transport`], and with it the connection pools.

use bytes::Bytes;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::server::{Command, Request};
use crate::transport::{Response, Transport};

/// A RESP client bound to one server address.
#[derive(Clone)]
pub struct Client {
    pub addr: String,
    transport: Arc<Transport>,
}

impl Client {
    pub fn new(addr: impl Into<String>, transport: Arc<Transport>) -> Self {
        Self {
            addr: addr.into(),
            transport,
        }
    }

    /// Issue a command and check the reply for errors, discarding values.
    pub async fn exec(&self, ctx: Context, name: &str, args: &[Bytes]) -> Result<()> {
        let mut res = self.round_trip(ctx, name, args).await?;
        let outcome = res.values().await.map(|_| ());
        res.close().await?;
        outcome
    }

    /// Issue a command and return its lazy response.
    pub async fn query(&self, ctx: Context, name: &str, args: &[Bytes]) -> Result<Response> {
        self.round_trip(ctx, name, args).await
    }

    async fn round_trip(&self, ctx: Context, name: &str, args: &[Bytes]) -> Result<Response> {
        let req = Request::single(Command::new(name, args.to_vec()))
            .with_addr(&self.addr)
            .with_context(ctx);
        self.transport.round_trip(req).await
    }
}
