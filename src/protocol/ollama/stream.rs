use crate::protocol::canonical::{Usage, WireDelta, WireDeltas};
use crate::protocol::ollama::OllamaStreamChunk;
use crate::protocol::WireDialect;

/// Ollama newline-delimited chat stream.
pub struct OllamaWire;

impl WireDialect for OllamaWire {
    type Event = OllamaStreamChunk;

    fn map_event(event: Self::Event, out: &mut WireDeltas) {
        map_ollama_chunk(event, out);
    }
}

pub fn map_ollama_chunk(chunk: OllamaStreamChunk, out: &mut WireDeltas) {
    if let Some(error) = chunk.error {
        out.push(WireDelta::Error(error));
    }
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            out.push(WireDelta::Thinking {
                slot: None,
                text: thinking,
            });
        }
        if !message.content.is_empty() {
            out.push(WireDelta::Text(message.content));
        }
        for call in message.tool_calls.into_iter().flatten() {
            out.push(WireDelta::ToolCall {
                id: None,
                name: call.function.name,
                arguments: call.function.arguments,
            });
        }
    }
    if chunk.done {
        out.push(WireDelta::Usage(Usage {
            input_tokens: chunk.prompt_eval_count,
            output_tokens: chunk.eval_count,
            cached_tokens: None,
        }));
        out.push(WireDelta::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::UnifiedEvent;
    use crate::protocol::{MessageProcessor, StreamProcessor};
    use serde_json::json;

    #[test]
    fn test_thinking_text_tools_and_usage() {
        let mut processor = StreamProcessor::<OllamaWire>::new(false, None);
        let mut out = Vec::new();
        for line in [
            json!({"model": "llama", "message": {"role": "assistant", "content": "", "thinking": "plan"}, "done": false}),
            json!({"message": {"role": "assistant", "content": "On it."}, "done": false}),
            json!({"message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "search", "arguments": {"query": "cats"}}}
            ]}, "done": false}),
            json!({"message": {"role": "assistant", "content": ""}, "done": true,
                   "prompt_eval_count": 26, "eval_count": 12}),
        ] {
            processor.process_into(&line, &mut out);
        }
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], UnifiedEvent::Thinking(t) if t.text == "plan"));
        assert_eq!(out[1], UnifiedEvent::TextDelta("On it.".into()));
        let UnifiedEvent::ToolCall(call) = &out[2] else {
            panic!("expected tool call");
        };
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.parameters["query"], json!("cats"));
        let usage = processor.usage();
        assert_eq!((usage.input_tokens, usage.output_tokens), (Some(26), Some(12)));
    }
}
