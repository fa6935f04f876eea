use crate::protocol::canonical::{Usage, WireDelta, WireDeltas};
use crate::protocol::openai_chat::OpenAiStreamChunk;
use crate::protocol::WireDialect;

/// `OpenAI` chat completions streaming dialect.
pub struct OpenAiChatWire;

impl WireDialect for OpenAiChatWire {
    type Event = OpenAiStreamChunk;

    fn map_event(event: Self::Event, out: &mut WireDeltas) {
        map_openai_chat_chunk(event, out);
    }
}

/// Map one chat completion chunk into wire deltas.
///
/// Only the first choice is read. Tool calls are keyed by their `index`;
/// reasoning has no explicit close and ends at the next text or tool delta.
pub fn map_openai_chat_chunk(chunk: OpenAiStreamChunk, out: &mut WireDeltas) {
    if let Some(error) = chunk.error {
        out.push(WireDelta::Error(error.message));
    }

    if let Some(choice) = chunk.choices.into_iter().find(|c| c.index == 0) {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            out.push(WireDelta::Thinking {
                slot: None,
                text: reasoning,
            });
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            out.push(WireDelta::Text(content));
        }
        for call in delta.tool_calls.into_iter().flatten() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            let id = call.id.filter(|id| !id.is_empty());
            if id.is_some() || name.is_some() {
                out.push(WireDelta::ToolStart {
                    slot: call.index,
                    id,
                    name,
                });
            }
            if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
                out.push(WireDelta::ToolArgs {
                    slot: call.index,
                    fragment,
                });
            }
        }
        if choice.finish_reason.is_some() {
            out.push(WireDelta::Stop);
        }
    }

    if let Some(usage) = chunk.usage {
        out.push(WireDelta::Usage(Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::UnifiedEvent;
    use crate::protocol::{MessageProcessor, StreamProcessor};
    use serde_json::{json, Value};

    fn run(partial: bool, chunks: &[Value]) -> (Vec<UnifiedEvent>, Usage) {
        let mut processor = StreamProcessor::<OpenAiChatWire>::new(partial, None);
        let mut out = Vec::new();
        for chunk in chunks {
            processor.process_into(chunk, &mut out);
        }
        processor.finish_into(&mut out);
        (out, processor.usage())
    }

    fn delta(delta: Value) -> Value {
        json!({"id": "c", "object": "chat.completion.chunk", "choices": [{"index": 0, "delta": delta}]})
    }

    #[test]
    fn test_reasoning_then_content() {
        let (events, _) = run(
            false,
            &[
                delta(json!({"role": "assistant", "reasoning_content": "Hmm, "})),
                delta(json!({"reasoning_content": "ok."})),
                delta(json!({"content": "Answer"})),
            ],
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], UnifiedEvent::Thinking(t) if t.text == "Hmm, ok." && !t.partial));
        assert_eq!(events[1], UnifiedEvent::TextDelta("Answer".into()));
    }

    #[test]
    fn test_parallel_tool_calls_finalize_on_slot_switch() {
        let (events, _) = run(
            false,
            &[
                delta(json!({"tool_calls": [{"index": 0, "id": "call_a", "type": "function", "function": {"name": "search", "arguments": ""}}]})),
                delta(json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"query\":"}}]})),
                delta(json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"cats\"}"}}]})),
                delta(json!({"tool_calls": [{"index": 1, "id": "call_b", "type": "function", "function": {"name": "read", "arguments": "{\"id\": 4}"}}]})),
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            ],
        );
        assert_eq!(events.len(), 2);
        let UnifiedEvent::ToolCall(first) = &events[0] else {
            panic!("expected tool call");
        };
        assert_eq!(first.id, "call_a");
        assert_eq!(first.parameters["query"], json!("cats"));
        let UnifiedEvent::ToolCall(second) = &events[1] else {
            panic!("expected tool call");
        };
        assert_eq!(second.name, "read");
        assert_eq!(second.parameters["id"], json!(4));
    }

    #[test]
    fn test_tool_calls_without_index_split_on_id() {
        let (events, _) = run(
            false,
            &[
                delta(json!({"tool_calls": [{"id": "call_a", "function": {"name": "search", "arguments": "{\"query\": \"cats\"}"}}]})),
                delta(json!({"tool_calls": [{"id": "call_a", "function": {"arguments": ""}}]})),
                delta(json!({"tool_calls": [{"id": "call_b", "function": {"name": "read", "arguments": "{\"id\": "}}]})),
                delta(json!({"tool_calls": [{"function": {"arguments": "4}"}}]})),
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            ],
        );
        let calls: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|e| match e {
                UnifiedEvent::ToolCall(c) => Some((c.id.as_str(), c.name.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec![("call_a", "search"), ("call_b", "read")]);
        let UnifiedEvent::ToolCall(second) = &events[1] else {
            panic!("expected tool call");
        };
        assert_eq!(second.parameters["id"], json!(4));
    }

    #[test]
    fn test_usage_chunk_with_cached_tokens() {
        let (events, usage) = run(
            false,
            &[json!({
                "choices": [],
                "usage": {"prompt_tokens": 30, "completion_tokens": 9, "total_tokens": 39,
                          "prompt_tokens_details": {"cached_tokens": 16}}
            })],
        );
        assert!(events.is_empty());
        assert_eq!(usage.input_tokens, Some(30));
        assert_eq!(usage.output_tokens, Some(9));
        assert_eq!(usage.cached_tokens, Some(16));
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let (events, _) = run(
            false,
            &[delta(json!({"tool_calls": [{"index": 0, "function": {"name": "ping", "arguments": "{}"}}]}))],
        );
        let UnifiedEvent::ToolCall(call) = &events[0] else {
            panic!("expected tool call");
        };
        assert!(call.id.starts_with("call_"));
    }
}
