//! Streaming generation facade.
//!
//! [`Llm::generate`] resolves a model, encodes the prompt in the endpoint's
//! dialect, and drives one response body through the stage chain:
//!
//! ```text
//! chunks -> ChunkDecoder -> MessageProcessor -> XmlToolProcessor -> TagStripper -> StructuredOutput
//! ```
//!
//! Every stage is finished in the same order once the body ends.
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelManager;
use crate::config::FeaturesConfig;
use crate::error::CompletionError;
use crate::fc::{XmlOutput, XmlToolProcessor};
use crate::observability::{AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
use crate::prompt::{Prompt, ResponsePart, ToolChoice, UploadOptions, UploadStore};
use crate::protocol::{EncodeRequest, MessageProcessor, Thinking, ToolCall, UnifiedEvent, Usage};
use crate::routing::DialectRegistry;
use crate::stream::{ChunkDecoder, StructuredOutput, TagStripper};
use crate::transport::{AbortHandle, ChunkStream, HttpRequest, Transport};

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// Capped by the endpoint's `max_output_tokens`.
    pub max_tokens: Option<u64>,
    pub stop_sequences: Vec<String>,
    /// Label copied into the audit record.
    pub feature_name: Option<String>,
    /// Deliver growing tool calls and thinking to the callback.
    pub partial_tool_calls: bool,
    /// Request reasoning and deliver thinking events to the callback.
    pub output_thinking: bool,
    /// JSON schema for structured output.
    pub response_format: Option<Value>,
    /// Tags whose content never reaches the caller.
    pub strip_tags: Vec<String>,
    pub upload_options: UploadOptions,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
            feature_name: None,
            partial_tool_calls: false,
            output_thinking: false,
            response_format: None,
            strip_tags: Vec::new(),
            upload_options: UploadOptions::default(),
        }
    }
}

impl GenerateOptions {
    /// Defaults taken from the `features` section of the config.
    #[must_use]
    pub fn from_features(features: &FeaturesConfig) -> Self {
        Self {
            partial_tool_calls: features.partial_tool_calls,
            output_thinking: features.output_thinking,
            strip_tags: features.strip_tags.clone(),
            upload_options: UploadOptions {
                max_pixels: Some(features.max_pixels),
                allow_documents: features.allow_documents,
            },
            ..Self::default()
        }
    }
}

/// Everything a finished generation produced.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Visible text, after XML tool blocks and sensitive tags are removed.
    pub text: String,
    pub thinking: Vec<Thinking>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// Present when the request carried a `response_format`.
    pub structured: Option<StructuredOutput>,
}

impl Completion {
    /// Parts suitable for [`Prompt::push_model_response`]: thinking, then
    /// text, then tool calls.
    #[must_use]
    pub fn response_parts(&self) -> Vec<ResponsePart> {
        let mut parts: Vec<ResponsePart> =
            self.thinking.iter().cloned().map(ResponsePart::Thinking).collect();
        if !self.text.is_empty() {
            parts.push(ResponsePart::Text(self.text.clone()));
        }
        parts.extend(self.tool_calls.iter().cloned().map(ResponsePart::ToolCall));
        parts
    }
}

type EventCallback<'cb> = &'cb mut dyn FnMut(&UnifiedEvent);

/// Generation entry point bound to a registry and a transport.
pub struct Llm<'a> {
    registry: &'a DialectRegistry,
    transport: &'a dyn Transport,
    audit: &'a dyn AuditSink,
    uploads: Option<&'a dyn UploadStore>,
}

static DEFAULT_AUDIT: TracingAuditSink = TracingAuditSink;

impl<'a> Llm<'a> {
    #[must_use]
    pub fn new(registry: &'a DialectRegistry, transport: &'a dyn Transport) -> Self {
        Self {
            registry,
            transport,
            audit: &DEFAULT_AUDIT,
            uploads: None,
        }
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: &'a dyn AuditSink) -> Self {
        self.audit = sink;
        self
    }

    #[must_use]
    pub fn with_upload_store(mut self, store: &'a dyn UploadStore) -> Self {
        self.uploads = Some(store);
        self
    }

    /// Stream one completion of `prompt` from `model`.
    ///
    /// Events are handed to `on_event` as they arrive. Returns `Ok(None)`
    /// when the generation was cancelled or the transport failed; both are
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::UnknownModel`] before any I/O when `model`
    /// is not registered, and encoding or upload errors raised while
    /// building the request.
    pub fn generate(
        &self,
        prompt: &Prompt,
        model: &str,
        options: &GenerateOptions,
        cancel: Option<&CancelManager>,
        on_event: Option<&mut dyn FnMut(&UnifiedEvent)>,
    ) -> Result<Option<Completion>, CompletionError> {
        let endpoint = self.registry.resolve(model)?;
        if cancel.is_some_and(CancelManager::is_cancelled) {
            debug!(model, "generation skipped: already cancelled");
            return Ok(None);
        }

        let spec = endpoint.dialect.spec();
        let max_tokens = match (options.max_tokens, endpoint.max_output_tokens) {
            (Some(requested), Some(cap)) => Some(requested.min(cap)),
            (requested, cap) => requested.or(cap),
        };
        let request = EncodeRequest {
            prompt,
            model: &endpoint.upstream_model,
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens,
            stop_sequences: &options.stop_sequences,
            response_format: options.response_format.as_ref(),
            thinking: options.output_thinking,
            native_tools: endpoint.native_tools,
            uploads: self.uploads,
            upload_options: options.upload_options,
        };
        let http_request = spec.build_request(&endpoint, &request)?;

        let xml_tools = !endpoint.native_tools
            && !prompt.tools().is_empty()
            && !matches!(prompt.tool_choice(), Some(ToolChoice::None));
        let tool_definitions = (!prompt.tools().is_empty()).then(|| prompt.tools().to_vec());

        let mut record = AuditRecord::new(model, endpoint.dialect);
        record.feature_name.clone_from(&options.feature_name);
        let started = Instant::now();
        debug!(
            request_id = %record.request_id,
            model,
            dialect = %endpoint.dialect,
            xml_tools,
            "generation started"
        );

        let abort = AbortHandle::new();
        let callback_id = cancel.map(|manager| {
            let abort = abort.clone();
            manager.add_callback(move || abort.abort())
        });

        let pipeline = Pipeline {
            decoder: ChunkDecoder::with_framing(spec.framing),
            processor: endpoint
                .dialect
                .processor(options.partial_tool_calls, tool_definitions.clone()),
            xml: xml_tools.then(|| XmlToolProcessor::new(options.partial_tool_calls, tool_definitions)),
            stripper: (!options.strip_tags.is_empty())
                .then(|| TagStripper::new(options.strip_tags.iter().cloned())),
            structured: options.response_format.as_ref().map(StructuredOutput::from_schema),
            partial_tool_calls: options.partial_tool_calls,
            output_thinking: options.output_thinking,
            completion: Completion::default(),
            messages: Vec::new(),
            events: Vec::new(),
            xml_out: Vec::new(),
            on_event,
        };
        let result = self.stream(pipeline, &http_request, &abort);

        if let (Some(manager), Some(id)) = (cancel, callback_id) {
            manager.remove_callback(id);
        }
        let cancelled = abort.is_aborted() || cancel.is_some_and(CancelManager::is_cancelled);

        let outcome = match result {
            Ok(completion) if !cancelled => {
                record.usage = completion.usage;
                record.outcome = AuditOutcome::Completed;
                Some(completion)
            }
            Ok(completion) => {
                debug!(request_id = %record.request_id, "generation cancelled");
                record.usage = completion.usage;
                record.outcome = AuditOutcome::Cancelled;
                None
            }
            Err(_) if cancelled => {
                debug!(request_id = %record.request_id, "generation cancelled before the response arrived");
                record.outcome = AuditOutcome::Cancelled;
                None
            }
            Err(err) => {
                warn!(request_id = %record.request_id, model, error = %err, "generation failed");
                record.outcome = AuditOutcome::Failed;
                None
            }
        };
        record.duration = started.elapsed();
        self.audit.record(&record);
        Ok(outcome)
    }

    fn stream(
        &self,
        mut pipeline: Pipeline<'_>,
        request: &HttpRequest,
        abort: &AbortHandle,
    ) -> Result<Completion, CompletionError> {
        let mut body: Box<dyn ChunkStream> = self.transport.open(request, abort)?;
        while let Some(chunk) = body.next_chunk() {
            let chunk = chunk?;
            pipeline.feed(&chunk);
            if pipeline.stop_requested() {
                debug!("tool call block complete; closing the response early");
                break;
            }
            if pipeline.decoder.is_done() {
                break;
            }
        }
        drop(body);
        Ok(pipeline.finish())
    }
}

impl std::fmt::Debug for Llm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llm")
            .field("models", &self.registry.len())
            .field("uploads", &self.uploads.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stage chain
// ---------------------------------------------------------------------------

struct Pipeline<'cb> {
    decoder: ChunkDecoder,
    processor: Box<dyn MessageProcessor>,
    xml: Option<XmlToolProcessor>,
    stripper: Option<TagStripper>,
    structured: Option<StructuredOutput>,
    partial_tool_calls: bool,
    output_thinking: bool,
    completion: Completion,
    messages: Vec<Value>,
    events: Vec<UnifiedEvent>,
    xml_out: Vec<XmlOutput>,
    on_event: Option<EventCallback<'cb>>,
}

impl Pipeline<'_> {
    fn feed(&mut self, chunk: &[u8]) {
        let mut messages = std::mem::take(&mut self.messages);
        self.decoder.feed_bytes_into(chunk, &mut messages);
        for message in messages.drain(..) {
            let mut events = std::mem::take(&mut self.events);
            self.processor.process_into(&message, &mut events);
            self.route_events(&mut events);
            self.events = events;
            if self.stop_requested() {
                break;
            }
        }
        self.messages = messages;
    }

    fn stop_requested(&self) -> bool {
        self.xml.as_ref().is_some_and(XmlToolProcessor::should_cancel)
    }

    fn finish(mut self) -> Completion {
        let mut messages = std::mem::take(&mut self.messages);
        if !self.stop_requested() {
            self.decoder.finish_into(&mut messages);
        }
        for message in messages.drain(..) {
            let mut events = std::mem::take(&mut self.events);
            self.processor.process_into(&message, &mut events);
            self.route_events(&mut events);
            self.events = events;
        }

        let mut events = std::mem::take(&mut self.events);
        self.processor.finish_into(&mut events);
        self.route_events(&mut events);

        if let Some(xml) = self.xml.as_mut() {
            let outputs = xml.finish();
            self.route_xml(outputs);
        }
        if let Some(stripper) = self.stripper.as_mut() {
            let tail = stripper.finish();
            if !tail.is_empty() {
                self.deliver_text(tail);
            }
        }
        if let Some(structured) = self.structured.as_mut() {
            structured.finish();
        }

        self.completion.usage = self.processor.usage();
        self.completion.structured = self.structured.take();
        self.completion
    }

    fn route_events(&mut self, events: &mut Vec<UnifiedEvent>) {
        for event in events.drain(..) {
            match event {
                UnifiedEvent::TextDelta(text) => match self.xml.as_mut() {
                    Some(xml) => {
                        let mut outputs = std::mem::take(&mut self.xml_out);
                        xml.feed_into(&text, &mut outputs);
                        self.route_xml(outputs.drain(..));
                        self.xml_out = outputs;
                    }
                    None => self.filter_text(&text),
                },
                UnifiedEvent::ToolCall(call) => self.deliver_tool_call(call),
                UnifiedEvent::Thinking(thinking) => self.deliver_thinking(thinking),
            }
        }
    }

    fn route_xml(&mut self, outputs: impl IntoIterator<Item = XmlOutput>) {
        for output in outputs {
            match output {
                XmlOutput::Text(text) => self.filter_text(&text),
                XmlOutput::ToolCall(call) => self.deliver_tool_call(call),
            }
        }
    }

    fn filter_text(&mut self, text: &str) {
        let visible = match self.stripper.as_mut() {
            Some(stripper) => stripper.filter(text),
            None => text.to_owned(),
        };
        if !visible.is_empty() {
            self.deliver_text(visible);
        }
    }

    fn deliver_text(&mut self, text: String) {
        if let Some(structured) = self.structured.as_mut() {
            structured.append(&text);
        }
        self.completion.text.push_str(&text);
        self.emit(&UnifiedEvent::TextDelta(text));
    }

    fn deliver_tool_call(&mut self, call: ToolCall) {
        if call.partial {
            if self.partial_tool_calls {
                self.emit(&UnifiedEvent::ToolCall(call));
            }
            return;
        }
        self.emit(&UnifiedEvent::ToolCall(call.clone()));
        self.completion.tool_calls.push(call);
    }

    fn deliver_thinking(&mut self, thinking: Thinking) {
        if self.output_thinking {
            self.emit(&UnifiedEvent::Thinking(thinking.clone()));
        }
        if !thinking.partial {
            self.completion.thinking.push(thinking);
        }
    }

    fn emit(&mut self, event: &UnifiedEvent) {
        if let Some(callback) = self.on_event.as_mut() {
            callback(event);
        }
    }
}
