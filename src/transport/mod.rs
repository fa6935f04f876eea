//! Blocking chunk-stream seam between a generation and the network.
//!
//! A generation runs on the caller's thread and pulls body chunks one at a
//! time. Aborting an [`AbortHandle`] from any thread ends the stream and
//! releases the connection.
mod http_transport;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::CompletionError;

pub use http_transport::HttpTransport;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// Clonable abort signal shared by a stream and whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// An open response body.
pub trait ChunkStream: Send {
    /// Next body chunk; `None` at end of body or once aborted.
    fn next_chunk(&mut self) -> Option<Result<Bytes, CompletionError>>;
}

pub trait Transport: Send + Sync {
    /// Send `request` and return its body stream once the status is known.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Transport`] for connection failures and
    /// aborts before the response arrives, and [`CompletionError::Upstream`]
    /// for non-success statuses.
    fn open(
        &self,
        request: &HttpRequest,
        abort: &AbortHandle,
    ) -> Result<Box<dyn ChunkStream>, CompletionError>;
}
