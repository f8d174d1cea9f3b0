//! Per-request exchange state.
//!
//! An [`Exchange`] is one request/reply pair crossing the worker channel. It is
//! created when an HTTP request arrives and dropped once the response has
//! been produced; nothing about it outlives the request.

use std::time::{Duration, Instant};

use tokio_util::bytes::Bytes;
pub use tokio_util::sync::CancellationToken;

use crate::bridge::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("exchange was cancelled by the caller")]
    Cancelled,

    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("exchange task ended without a result")]
    TaskLost,
}

impl ExchangeError {
    /// True when the request never made it onto the channel intact.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::Write(_)))
    }

    /// True when the caller stopped waiting before a reply arrived.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

/// One request on its way to the worker.
#[derive(Debug)]
pub struct Exchange {
    id: u64,
    request: Bytes,
    cancel_token: CancellationToken,
    started_at: Instant,
}

impl Exchange {
    pub fn new(id: u64, request: Bytes) -> Self {
        Self {
            id,
            request,
            cancel_token: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Bytes {
        &self.request
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Create a guard that cancels this exchange on drop.
    ///
    /// When the HTTP connection drops, axum drops the handler future and with
    /// it the guard, which tells the in-flight read its caller is gone.
    pub fn guard(&self) -> ExchangeGuard {
        ExchangeGuard {
            id: self.id,
            cancel_token: Some(self.cancel_token.clone()),
        }
    }

    pub(crate) fn into_parts(self) -> (u64, Bytes, CancellationToken) {
        (self.id, self.request, self.cancel_token)
    }
}

/// Guard for an exchange awaited by a caller - cancels on drop unless disarmed.
pub struct ExchangeGuard {
    id: u64,
    cancel_token: Option<CancellationToken>,
}

impl ExchangeGuard {
    pub fn disarm(&mut self) {
        self.cancel_token = None;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take()
            && !token.is_cancelled()
        {
            tracing::debug!(exchange_id = self.id, "Caller went away, cancelling exchange");
            token.cancel();
        }
    }
}
