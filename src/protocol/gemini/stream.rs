use crate::protocol::canonical::{Usage, WireDelta, WireDeltas};
use crate::protocol::gemini::{GeminiPart, GeminiStreamChunk};
use crate::protocol::WireDialect;

/// Gemini `streamGenerateContent?alt=sse` dialect.
pub struct GeminiWire;

impl WireDialect for GeminiWire {
    type Event = GeminiStreamChunk;

    fn map_event(event: Self::Event, out: &mut WireDeltas) {
        map_gemini_chunk(event, out);
    }
}

/// Map one streamed response into wire deltas.
///
/// Function calls arrive whole. A `thoughtSignature` is attached to the
/// reasoning it follows, opening an empty thinking block when none is open.
pub fn map_gemini_chunk(chunk: GeminiStreamChunk, out: &mut WireDeltas) {
    if let Some(error) = chunk.error {
        out.push(WireDelta::Error(error.message));
    }

    let mut finished = false;
    if let Some(candidate) = chunk
        .candidates
        .into_iter()
        .find(|c| c.index.unwrap_or(0) == 0)
    {
        for part in candidate.content.into_iter().flat_map(|c| c.parts) {
            map_part(part, out);
        }
        finished = candidate.finish_reason.is_some();
    }

    if let Some(usage) = chunk.usage_metadata {
        let output = match (usage.candidates_token_count, usage.thoughts_token_count) {
            (None, None) => None,
            (candidates, thoughts) => Some(candidates.unwrap_or(0) + thoughts.unwrap_or(0)),
        };
        out.push(WireDelta::Usage(Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: output,
            cached_tokens: usage.cached_content_token_count,
        }));
    }

    if finished {
        out.push(WireDelta::Stop);
    }
}

fn map_part(part: GeminiPart, out: &mut WireDeltas) {
    let is_thought = part.thought == Some(true);
    if is_thought {
        out.push(WireDelta::Thinking {
            slot: None,
            text: part.text.unwrap_or_default(),
        });
        if let Some(signature) = part.thought_signature {
            out.push(WireDelta::ThinkingSignature(signature));
        }
        return;
    }

    if let Some(signature) = part.thought_signature {
        out.push(WireDelta::Thinking {
            slot: None,
            text: String::new(),
        });
        out.push(WireDelta::ThinkingSignature(signature));
    }
    if let Some(text) = part.text.filter(|t| !t.is_empty()) {
        out.push(WireDelta::Text(text));
    }
    if let Some(call) = part.function_call {
        out.push(WireDelta::ToolCall {
            id: call.id,
            name: call.name,
            arguments: call.args,
        });
    }
}
