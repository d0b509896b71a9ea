//! Deadline-based cancellation scopes.
//!
//! Every [`Request`](crate::server::Request) carries a `Context`. Cancelling a
//! context (by letting its deadline pass) aborts pending pool acquisition and
//! in-flight backend I/O, and `Transport::round_trip` returns the
//! cancellation cause. A cancelled request's connection is closed rather than
//! returned to the pool.

use std::time::{Duration, Instant};

use crate::error::{ProxyError, Result};

/// A cancellation scope with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before expiry. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }

    /// Returns the cancellation cause if the context has already expired.
    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(ProxyError::Canceled("context deadline exceeded".into()))
        } else {
            Ok(())
        }
    }

    /// Awaits `fut`, bounded by this context's deadline.
    pub async fn run<F, T>(&self, what: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match self.remaining() {
            None => fut.await,
            Some(rem) => match tokio::time::timeout(rem, fut).await {
                Ok(out) => out,
                Err(_) => Err(ProxyError::Canceled(format!(
                    "context deadline exceeded while {what}"
                ))),
            },
        }
    }
}
