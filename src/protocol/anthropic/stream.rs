use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicStreamEvent, AnthropicUsage,
};
use crate::protocol::canonical::{Usage, WireDelta, WireDeltas};
use crate::protocol::WireDialect;

/// Anthropic Messages streaming dialect.
pub struct AnthropicWire;

impl WireDialect for AnthropicWire {
    type Event = AnthropicStreamEvent;

    fn map_event(event: Self::Event, out: &mut WireDeltas) {
        map_anthropic_event(event, out);
    }
}

/// Map one Anthropic stream event into wire deltas.
///
/// Content block indexes become slots; thinking and tool blocks close on
/// `content_block_stop`.
pub fn map_anthropic_event(event: AnthropicStreamEvent, out: &mut WireDeltas) {
    match event {
        AnthropicStreamEvent::MessageStart { message } => push_usage(&message.usage, out),
        AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            AnthropicContentBlock::Text { text } => {
                if !text.is_empty() {
                    out.push(WireDelta::Text(text));
                }
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => {
                out.push(WireDelta::Thinking {
                    slot: Some(index),
                    text: thinking,
                });
                if let Some(signature) = signature.filter(|s| !s.is_empty()) {
                    out.push(WireDelta::ThinkingSignature(signature));
                }
            }
            AnthropicContentBlock::RedactedThinking { data } => {
                out.push(WireDelta::RedactedThinking { data });
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                out.push(WireDelta::ToolStart {
                    slot: index,
                    id: Some(id),
                    name: Some(name),
                });
                // Start events carry `{}`; real arguments arrive as deltas.
                if input.as_object().is_some_and(|obj| !obj.is_empty()) {
                    out.push(WireDelta::ToolArgs {
                        slot: index,
                        fragment: input.to_string(),
                    });
                }
            }
            AnthropicContentBlock::Image { .. }
            | AnthropicContentBlock::Document { .. }
            | AnthropicContentBlock::ToolResult { .. }
            | AnthropicContentBlock::Unknown => {}
        },
        AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
            AnthropicDelta::TextDelta { text } => out.push(WireDelta::Text(text)),
            AnthropicDelta::ThinkingDelta { thinking } => out.push(WireDelta::Thinking {
                slot: Some(index),
                text: thinking,
            }),
            AnthropicDelta::SignatureDelta { signature } => {
                out.push(WireDelta::ThinkingSignature(signature));
            }
            AnthropicDelta::InputJsonDelta { partial_json } => out.push(WireDelta::ToolArgs {
                slot: index,
                fragment: partial_json,
            }),
            AnthropicDelta::Unknown => {}
        },
        AnthropicStreamEvent::ContentBlockStop { index } => {
            out.push(WireDelta::BlockStop { slot: index });
        }
        AnthropicStreamEvent::MessageDelta { usage } => push_usage(&usage, out),
        AnthropicStreamEvent::MessageStop => out.push(WireDelta::Stop),
        AnthropicStreamEvent::Error { error } => {
            out.push(WireDelta::Error(format!("{}: {}", error.type_, error.message)));
        }
        AnthropicStreamEvent::Unknown => {}
    }
}

fn push_usage(usage: &AnthropicUsage, out: &mut WireDeltas) {
    let usage = Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_tokens: usage.cache_read_input_tokens,
    };
    if !usage.is_empty() {
        out.push(WireDelta::Usage(usage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::UnifiedEvent;
    use crate::protocol::{MessageProcessor, StreamProcessor};
    use serde_json::json;

    fn run(partial: bool, events: &[serde_json::Value]) -> (Vec<UnifiedEvent>, Usage) {
        let mut processor = StreamProcessor::<AnthropicWire>::new(partial, None);
        let mut out = Vec::new();
        for event in events {
            processor.process_into(event, &mut out);
        }
        processor.finish_into(&mut out);
        (out, processor.usage())
    }

    #[test]
    fn test_text_and_usage() {
        let (events, usage) = run(
            false,
            &[
                json!({"type": "message_start", "message": {"id": "m", "usage": {"input_tokens": 12, "output_tokens": 1, "cache_read_input_tokens": 4}}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
                json!({"type": "content_block_stop", "index": 0}),
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}),
                json!({"type": "message_stop"}),
            ],
        );
        assert_eq!(
            events,
            vec![
                UnifiedEvent::TextDelta("Hel".into()),
                UnifiedEvent::TextDelta("lo".into())
            ]
        );
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(7));
        assert_eq!(usage.cached_tokens, Some(4));
    }

    #[test]
    fn test_thinking_with_signature() {
        let (events, _) = run(
            false,
            &[
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "Let me "}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "think"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig=="}}),
                json!({"type": "content_block_stop", "index": 0}),
                json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Done"}}),
            ],
        );
        assert_eq!(events.len(), 2);
        let UnifiedEvent::Thinking(thinking) = &events[0] else {
            panic!("expected thinking, got {:?}", events[0]);
        };
        assert_eq!(thinking.text, "Let me think");
        assert_eq!(thinking.signature.as_deref(), Some("sig=="));
        assert!(!thinking.partial);
        assert_eq!(events[1], UnifiedEvent::TextDelta("Done".into()));
    }

    #[test]
    fn test_redacted_thinking() {
        let (events, _) = run(
            false,
            &[
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "redacted_thinking", "data": "opaque"}}),
                json!({"type": "content_block_stop", "index": 0}),
            ],
        );
        let UnifiedEvent::Thinking(thinking) = &events[0] else {
            panic!("expected thinking");
        };
        assert!(thinking.text.is_empty());
        assert_eq!(thinking.provider_metadata["redacted_signature"], json!("opaque"));
    }

    #[test]
    fn test_tool_use_streams_arguments() {
        let (events, _) = run(
            true,
            &[
                json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {}}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"query\": \"ca"}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "ts\"}"}}),
                json!({"type": "content_block_stop", "index": 1}),
            ],
        );
        let calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UnifiedEvent::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect();
        let last = calls.last().unwrap();
        assert!(!last.partial);
        assert_eq!(last.id, "toolu_1");
        assert_eq!(last.parameters["query"], json!("cats"));
        assert!(calls[..calls.len() - 1].iter().all(|c| c.partial));
        assert!(calls.iter().any(|c| c.parameters.get("query") == Some(&json!("ca"))));
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let (events, usage) = run(
            false,
            &[
                json!({"type": "ping"}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "citations_delta", "citation": {}}}),
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            ],
        );
        assert!(events.is_empty());
        assert!(usage.is_empty());
    }
}
