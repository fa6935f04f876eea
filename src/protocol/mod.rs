//! Vendor wire dialects and the processors that normalize their streams.
//!
//! Each dialect contributes a typed event schema, a pure mapping from one
//! wire event to [`WireDelta`]s, and a request encoder. The shared
//! [`StreamAccumulator`] turns deltas into [`UnifiedEvent`]s. Dialects are
//! picked once through [`Dialect::spec`].
pub mod accumulator;
pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod ollama;
pub mod openai_chat;
pub mod request;

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CompletionError;
use crate::routing::ModelEndpoint;
use crate::stream::Framing;
use crate::tool::ToolDefinition;
use crate::transport::HttpRequest;

pub use accumulator::{StreamAccumulator, REDACTED_SIGNATURE_KEY};
pub use canonical::{ProviderMetadata, Thinking, ToolCall, UnifiedEvent, Usage, WireDelta, WireDeltas};
pub use request::EncodeRequest;

// ---------------------------------------------------------------------------
// Processor traits
// ---------------------------------------------------------------------------

/// Stateful consumer of decoded vendor messages.
pub trait MessageProcessor: Send {
    fn process_into(&mut self, message: &Value, out: &mut Vec<UnifiedEvent>);

    fn process_streamed_message(&mut self, message: &Value) -> Vec<UnifiedEvent> {
        let mut out = Vec::new();
        self.process_into(message, &mut out);
        out
    }

    /// Finalize open thinking and tool blocks.
    fn finish_into(&mut self, out: &mut Vec<UnifiedEvent>);

    fn finish(&mut self) -> Vec<UnifiedEvent> {
        let mut out = Vec::new();
        self.finish_into(&mut out);
        out
    }

    fn usage(&self) -> Usage;
}

/// Typed wire schema of one vendor stream.
pub trait WireDialect {
    type Event: DeserializeOwned;

    fn map_event(event: Self::Event, out: &mut WireDeltas);
}

/// [`MessageProcessor`] for any [`WireDialect`].
pub struct StreamProcessor<D> {
    accumulator: StreamAccumulator,
    deltas: WireDeltas,
    _dialect: PhantomData<fn() -> D>,
}

impl<D: WireDialect> StreamProcessor<D> {
    #[must_use]
    pub fn new(partial_tool_calls: bool, tool_definitions: Option<Vec<ToolDefinition>>) -> Self {
        Self {
            accumulator: StreamAccumulator::new(partial_tool_calls, tool_definitions),
            deltas: WireDeltas::new(),
            _dialect: PhantomData,
        }
    }
}

impl<D: WireDialect> MessageProcessor for StreamProcessor<D> {
    fn process_into(&mut self, message: &Value, out: &mut Vec<UnifiedEvent>) {
        let event = match D::Event::deserialize(message) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring message that does not match the wire schema");
                return;
            }
        };
        D::map_event(event, &mut self.deltas);
        for delta in self.deltas.drain(..) {
            self.accumulator.apply(delta, out);
        }
    }

    fn finish_into(&mut self, out: &mut Vec<UnifiedEvent>) {
        self.accumulator.finish_into(out);
    }

    fn usage(&self) -> Usage {
        self.accumulator.usage()
    }
}

fn make_processor<D: WireDialect + 'static>(
    partial_tool_calls: bool,
    tool_definitions: Option<Vec<ToolDefinition>>,
) -> Box<dyn MessageProcessor> {
    Box::new(StreamProcessor::<D>::new(partial_tool_calls, tool_definitions))
}

// ---------------------------------------------------------------------------
// Dialect table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
}

type ProcessorFactory = fn(bool, Option<Vec<ToolDefinition>>) -> Box<dyn MessageProcessor>;
type RequestEncoder = fn(&EncodeRequest<'_>) -> Result<Value, CompletionError>;
type UrlBuilder = fn(&str, &str) -> String;
type HeaderBuilder = fn(&mut http::HeaderMap, &ModelEndpoint);

/// Static per-dialect behavior.
pub struct DialectSpec {
    pub dialect: Dialect,
    pub name: &'static str,
    pub framing: Framing,
    /// Whether tools are sent natively unless the endpoint overrides it.
    pub native_tools: bool,
    make_processor: ProcessorFactory,
    encode: RequestEncoder,
    url: UrlBuilder,
    headers: HeaderBuilder,
}

static DIALECTS: [DialectSpec; 4] = [
    DialectSpec {
        dialect: Dialect::OpenAi,
        name: "openai",
        framing: Framing::Sse,
        native_tools: true,
        make_processor: make_processor::<openai_chat::OpenAiChatWire>,
        encode: openai_chat::encode_openai_chat_request,
        url: openai_chat::request_url,
        headers: openai_chat::request_headers,
    },
    DialectSpec {
        dialect: Dialect::Anthropic,
        name: "anthropic",
        framing: Framing::Sse,
        native_tools: true,
        make_processor: make_processor::<anthropic::AnthropicWire>,
        encode: anthropic::encode_anthropic_request,
        url: anthropic::request_url,
        headers: anthropic::request_headers,
    },
    DialectSpec {
        dialect: Dialect::Gemini,
        name: "gemini",
        framing: Framing::Sse,
        native_tools: true,
        make_processor: make_processor::<gemini::GeminiWire>,
        encode: gemini::encode_gemini_request,
        url: gemini::request_url,
        headers: gemini::request_headers,
    },
    DialectSpec {
        dialect: Dialect::Ollama,
        name: "ollama",
        framing: Framing::Ndjson,
        native_tools: false,
        make_processor: make_processor::<ollama::OllamaWire>,
        encode: ollama::encode_ollama_request,
        url: ollama::request_url,
        headers: ollama::request_headers,
    },
];

impl Dialect {
    pub const ALL: [Dialect; 4] = [
        Dialect::OpenAi,
        Dialect::Anthropic,
        Dialect::Gemini,
        Dialect::Ollama,
    ];

    #[must_use]
    pub fn spec(self) -> &'static DialectSpec {
        match self {
            Dialect::OpenAi => &DIALECTS[0],
            Dialect::Anthropic => &DIALECTS[1],
            Dialect::Gemini => &DIALECTS[2],
            Dialect::Ollama => &DIALECTS[3],
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Case-insensitive lookup by configured name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|dialect| dialect.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Fresh processor for one response stream.
    #[must_use]
    pub fn processor(
        self,
        partial_tool_calls: bool,
        tool_definitions: Option<Vec<ToolDefinition>>,
    ) -> Box<dyn MessageProcessor> {
        (self.spec().make_processor)(partial_tool_calls, tool_definitions)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl DialectSpec {
    /// Encode the request body only.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Encode`] or upload failures.
    pub fn encode(&self, request: &EncodeRequest<'_>) -> Result<Value, CompletionError> {
        (self.encode)(request)
    }

    /// Full streaming HTTP request for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Encode`] when the body cannot be serialized,
    /// or upload failures raised while resolving content.
    pub fn build_request(
        &self,
        endpoint: &ModelEndpoint,
        request: &EncodeRequest<'_>,
    ) -> Result<HttpRequest, CompletionError> {
        let body = self.encode(request)?;
        let body = serde_json::to_vec(&body).map_err(|err| CompletionError::Encode(err.to_string()))?;

        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        (self.headers)(&mut headers, endpoint);

        Ok(HttpRequest {
            method: http::Method::POST,
            url: (self.url)(endpoint.base_url.trim_end_matches('/'), &endpoint.upstream_model),
            headers,
            body: body.into(),
        })
    }
}

/// Insert a header, skipping values that are not valid header text.
pub(crate) fn insert_header(headers: &mut http::HeaderMap, name: &'static str, value: &str) {
    match http::HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = name, "header value is not valid; skipping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dialect_names_round_trip() {
        for dialect in Dialect::ALL {
            assert_eq!(Dialect::from_name(dialect.name()), Some(dialect));
            assert_eq!(dialect.spec().dialect, dialect);
        }
        assert_eq!(Dialect::from_name("OpenAI"), Some(Dialect::OpenAi));
        assert_eq!(Dialect::from_name("cohere"), None);
    }

    #[test]
    fn test_dialect_serde_names() {
        assert_eq!(serde_json::to_value(Dialect::OpenAi).unwrap(), json!("openai"));
        let parsed: Dialect = serde_json::from_value(json!("ollama")).unwrap();
        assert_eq!(parsed, Dialect::Ollama);
    }

    #[test]
    fn test_framing_per_dialect() {
        assert_eq!(Dialect::Ollama.spec().framing, Framing::Ndjson);
        assert_eq!(Dialect::Gemini.spec().framing, Framing::Sse);
    }

    #[test]
    fn test_processor_ignores_foreign_shapes() {
        let mut processor = Dialect::Anthropic.processor(false, None);
        let events = processor.process_streamed_message(&json!({"choices": []}));
        assert!(events.is_empty());
        assert!(processor.finish().is_empty());
    }
}
