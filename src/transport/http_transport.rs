use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::runtime::Runtime;

use crate::config::TransportConfig;
use crate::error::CompletionError;

use super::{AbortHandle, ChunkStream, HttpRequest, Transport};

/// Error bodies are truncated to this many bytes.
const MAX_ERROR_BODY: usize = 4096;

fn build_reqwest_client(config: &TransportConfig) -> Result<reqwest::Client, CompletionError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());
    if !config.use_env_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| CompletionError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn build_runtime(config: &TransportConfig) -> Result<Runtime, CompletionError> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("completion-http");
    if let Some(threads) = config.runtime_worker_threads {
        builder.worker_threads(threads);
    }
    builder
        .build()
        .map_err(|err| CompletionError::Transport(format!("Failed to start HTTP runtime: {err}")))
}

/// reqwest-backed [`Transport`] driving its own tokio runtime.
///
/// Calls block the current thread and must not be made from inside an
/// async context.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    runtime: Arc<Runtime>,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`CompletionError::Transport`] when the client or runtime
    /// cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, CompletionError> {
        Ok(Self {
            client: build_reqwest_client(config)?,
            runtime: Arc::new(build_runtime(config)?),
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl Transport for HttpTransport {
    fn open(
        &self,
        request: &HttpRequest,
        abort: &AbortHandle,
    ) -> Result<Box<dyn ChunkStream>, CompletionError> {
        let send = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send();
        let token = abort.token().clone();
        let sent = self.runtime.block_on(async {
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                result = send => Some(result),
            }
        });
        let response = match sent {
            None => return Err(CompletionError::Transport("request aborted".into())),
            Some(Err(err)) => {
                tracing::warn!(url = %request.url, error = %err, "upstream request failed");
                return Err(CompletionError::Transport(err.to_string()));
            }
            Some(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = self
                .runtime
                .block_on(response.bytes())
                .map(|bytes| {
                    let end = bytes.len().min(MAX_ERROR_BODY);
                    String::from_utf8_lossy(&bytes[..end]).into_owned()
                })
                .unwrap_or_default();
            tracing::warn!(url = %request.url, status = status.as_u16(), "upstream returned an error status");
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(Box::new(HttpChunkStream {
            runtime: Arc::clone(&self.runtime),
            body: Some(response.bytes_stream().boxed()),
            abort: abort.clone(),
        }))
    }
}

struct HttpChunkStream {
    runtime: Arc<Runtime>,
    /// Dropped on end, error or abort, which closes the connection.
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    abort: AbortHandle,
}

impl ChunkStream for HttpChunkStream {
    fn next_chunk(&mut self) -> Option<Result<Bytes, CompletionError>> {
        if self.abort.is_aborted() {
            self.body = None;
            return None;
        }
        let body = self.body.as_mut()?;
        let token = self.abort.token().clone();
        let next = self.runtime.block_on(async {
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                chunk = body.next() => chunk,
            }
        });
        match next {
            Some(Ok(bytes)) => Some(Ok(bytes)),
            None => {
                self.body = None;
                None
            }
            Some(Err(err)) => {
                self.body = None;
                Some(Err(CompletionError::Transport(err.to_string())))
            }
        }
    }
}
