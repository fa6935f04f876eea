//! Dialect-neutral state machine turning [`WireDelta`]s into unified events.
//!
//! Holds at most one open thinking block and one open tool slot at a time.
//! Vendors do not reliably close tool slots, so opening a new slot finalizes
//! the previous one.
use serde_json::{Map, Value};

use crate::json_scan::repair_partial_json;
use crate::protocol::canonical::{ProviderMetadata, Thinking, ToolCall, UnifiedEvent, Usage, WireDelta};
use crate::tool::{find_tool, ToolDefinition};
use crate::util::next_call_id;

/// Metadata key carrying the opaque payload of a redacted thinking block.
pub const REDACTED_SIGNATURE_KEY: &str = "redacted_signature";

#[derive(Debug, Default)]
struct OpenThinking {
    slot: Option<usize>,
    text: String,
    signature: Option<String>,
    metadata: ProviderMetadata,
}

#[derive(Debug)]
struct OpenTool {
    slot: usize,
    id: Option<String>,
    /// `id` came from the wire rather than being synthesized.
    wire_id: bool,
    name: Option<String>,
    arguments: String,
    last_emitted: Option<Map<String, Value>>,
}

impl OpenTool {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            id: None,
            wire_id: false,
            name: None,
            arguments: String::new(),
            last_emitted: None,
        }
    }
}

pub struct StreamAccumulator {
    partial: bool,
    tool_definitions: Option<Vec<ToolDefinition>>,
    thinking: Option<OpenThinking>,
    tool: Option<OpenTool>,
    usage: Usage,
}

impl StreamAccumulator {
    #[must_use]
    pub fn new(partial: bool, tool_definitions: Option<Vec<ToolDefinition>>) -> Self {
        Self {
            partial,
            tool_definitions,
            thinking: None,
            tool: None,
            usage: Usage::default(),
        }
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn apply(&mut self, delta: WireDelta, out: &mut Vec<UnifiedEvent>) {
        match delta {
            WireDelta::Text(text) => {
                self.close_thinking(out);
                if !text.is_empty() {
                    out.push(UnifiedEvent::TextDelta(text));
                }
            }
            WireDelta::Thinking { slot, text } => self.push_thinking(slot, &text, out),
            WireDelta::ThinkingSignature(signature) => match self.thinking.as_mut() {
                Some(open) => open
                    .signature
                    .get_or_insert_with(String::new)
                    .push_str(&signature),
                None => tracing::debug!("thinking signature without an open thinking block"),
            },
            WireDelta::ThinkingMetadata(metadata) => {
                if let Some(open) = self.thinking.as_mut() {
                    open.metadata.extend(metadata);
                }
            }
            WireDelta::RedactedThinking { data } => {
                self.close_thinking(out);
                let mut provider_metadata = ProviderMetadata::new();
                provider_metadata.insert(REDACTED_SIGNATURE_KEY.into(), Value::String(data));
                out.push(UnifiedEvent::Thinking(Thinking {
                    text: String::new(),
                    signature: None,
                    partial: false,
                    provider_metadata,
                }));
            }
            WireDelta::ToolStart { slot, id, name } => {
                self.close_thinking(out);
                // A different wire id starts a new call even within one slot.
                if let Some(new_id) = id.as_deref() {
                    if self
                        .tool
                        .as_ref()
                        .is_some_and(|t| t.wire_id && t.id.as_deref() != Some(new_id))
                    {
                        self.finalize_tool(out);
                    }
                }
                let open = self.open_slot(slot, out);
                if id.is_some() && open.id.is_none() {
                    open.id = id;
                    open.wire_id = true;
                }
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    open.name = Some(name);
                }
                self.emit_partial_tool(out);
            }
            WireDelta::ToolArgs { slot, fragment } => {
                self.close_thinking(out);
                self.open_slot(slot, out).arguments.push_str(&fragment);
                self.emit_partial_tool(out);
            }
            WireDelta::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.close_thinking(out);
                self.finalize_tool(out);
                if name.is_empty() {
                    tracing::warn!("dropping tool call without a name");
                    return;
                }
                let parameters = self.coerce(&name, arguments);
                out.push(UnifiedEvent::ToolCall(ToolCall {
                    id: id.filter(|id| !id.is_empty()).unwrap_or_else(next_call_id),
                    name,
                    parameters,
                    partial: false,
                }));
            }
            WireDelta::BlockStop { slot } => {
                if self
                    .thinking
                    .as_ref()
                    .is_some_and(|t| t.slot.is_none_or(|s| s == slot))
                {
                    self.close_thinking(out);
                }
                if self.tool.as_ref().is_some_and(|t| t.slot == slot) {
                    self.finalize_tool(out);
                }
            }
            WireDelta::Usage(usage) => self.usage.merge(&usage),
            WireDelta::Stop => self.finish_into(out),
            WireDelta::Error(message) => {
                tracing::warn!(message = %message, "upstream reported a stream error");
            }
        }
    }

    /// Finalize whatever is still open.
    pub fn finish_into(&mut self, out: &mut Vec<UnifiedEvent>) {
        self.close_thinking(out);
        self.finalize_tool(out);
    }

    fn push_thinking(&mut self, slot: Option<usize>, text: &str, out: &mut Vec<UnifiedEvent>) {
        let switched = self
            .thinking
            .as_ref()
            .is_some_and(|open| open.slot.is_some() && slot.is_some() && open.slot != slot);
        if switched {
            self.close_thinking(out);
        }
        let open = self.thinking.get_or_insert_with(|| OpenThinking {
            slot,
            ..OpenThinking::default()
        });
        open.text.push_str(text);
        if self.partial && !text.is_empty() {
            out.push(UnifiedEvent::Thinking(Thinking {
                text: open.text.clone(),
                signature: None,
                partial: true,
                provider_metadata: open.metadata.clone(),
            }));
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<UnifiedEvent>) {
        let Some(open) = self.thinking.take() else {
            return;
        };
        if open.text.is_empty() && open.signature.is_none() && open.metadata.is_empty() {
            return;
        }
        out.push(UnifiedEvent::Thinking(Thinking {
            text: open.text,
            signature: open.signature,
            partial: false,
            provider_metadata: open.metadata,
        }));
    }

    /// The open tool for `slot`, finalizing a different open slot first.
    fn open_slot(&mut self, slot: usize, out: &mut Vec<UnifiedEvent>) -> &mut OpenTool {
        if self.tool.as_ref().is_some_and(|t| t.slot != slot) {
            self.finalize_tool(out);
        }
        self.tool.get_or_insert_with(|| OpenTool::new(slot))
    }

    fn emit_partial_tool(&mut self, out: &mut Vec<UnifiedEvent>) {
        if !self.partial {
            return;
        }
        let Some(open) = self.tool.as_mut() else {
            return;
        };
        let Some(name) = open.name.clone() else {
            return;
        };
        let raw = parse_arguments(&open.arguments).unwrap_or_default();
        if open.last_emitted.as_ref() == Some(&raw) {
            return;
        }
        open.last_emitted = Some(raw.clone());
        let id = open.id.get_or_insert_with(next_call_id).clone();
        let parameters = self.coerce(&name, raw);
        out.push(UnifiedEvent::ToolCall(ToolCall {
            id,
            name,
            parameters,
            partial: true,
        }));
    }

    fn finalize_tool(&mut self, out: &mut Vec<UnifiedEvent>) {
        let Some(open) = self.tool.take() else {
            return;
        };
        let Some(name) = open.name.filter(|n| !n.is_empty()) else {
            tracing::warn!(slot = open.slot, "dropping tool call without a name");
            return;
        };
        let raw = parse_arguments(&open.arguments).unwrap_or_else(|| {
            tracing::debug!(
                slot = open.slot,
                bytes = open.arguments.len(),
                "tool arguments did not parse; using empty parameters"
            );
            Map::new()
        });
        let parameters = self.coerce(&name, raw);
        out.push(UnifiedEvent::ToolCall(ToolCall {
            id: open.id.unwrap_or_else(next_call_id),
            name,
            parameters,
            partial: false,
        }));
    }

    fn coerce(&self, name: &str, raw: Map<String, Value>) -> Map<String, Value> {
        match self
            .tool_definitions
            .as_deref()
            .and_then(|defs| find_tool(defs, name))
        {
            Some(def) => def.coerce_parameters(&raw),
            None => raw,
        }
    }
}

/// Parse accumulated argument text, repairing a truncated tail.
fn parse_arguments(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(Map::new());
    }
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    match repair_partial_json(trimmed) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(acc: &mut StreamAccumulator, deltas: Vec<WireDelta>) -> Vec<UnifiedEvent> {
        let mut out = Vec::new();
        for delta in deltas {
            acc.apply(delta, &mut out);
        }
        out
    }

    fn calls(events: &[UnifiedEvent]) -> Vec<&ToolCall> {
        events
            .iter()
            .filter_map(|e| match e {
                UnifiedEvent::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_slot_switch_finalizes_previous() {
        let mut acc = StreamAccumulator::new(false, None);
        let events = run(
            &mut acc,
            vec![
                WireDelta::ToolStart {
                    slot: 0,
                    id: Some("a".into()),
                    name: Some("first".into()),
                },
                WireDelta::ToolArgs {
                    slot: 0,
                    fragment: "{\"x\": 1, \"y\": \"te".into(),
                },
                WireDelta::ToolArgs {
                    slot: 0,
                    fragment: "xt\"}".into(),
                },
                WireDelta::ToolStart {
                    slot: 1,
                    id: Some("b".into()),
                    name: Some("second".into()),
                },
            ],
        );
        let calls = calls(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].name, "first");
        assert!(!calls[0].partial);
        assert_eq!(
            Value::Object(calls[0].parameters.clone()),
            json!({"x": 1, "y": "text"})
        );

        let mut out = Vec::new();
        acc.finish_into(&mut out);
        assert_eq!(calls_owned(&out), vec!["second".to_owned()]);
    }

    fn calls_owned(events: &[UnifiedEvent]) -> Vec<String> {
        calls(events).iter().map(|c| c.name.clone()).collect()
    }

    #[test]
    fn test_partial_tool_updates() {
        let mut acc = StreamAccumulator::new(true, None);
        let events = run(
            &mut acc,
            vec![
                WireDelta::ToolStart {
                    slot: 0,
                    id: None,
                    name: Some("search".into()),
                },
                WireDelta::ToolArgs {
                    slot: 0,
                    fragment: "{\"q\": \"ca".into(),
                },
                WireDelta::ToolArgs {
                    slot: 0,
                    fragment: "ts\"}".into(),
                },
                WireDelta::BlockStop { slot: 0 },
            ],
        );
        let calls = calls(&events);
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|c| c.partial));
        assert_eq!(calls[1].parameters.get("q"), Some(&json!("ca")));
        assert!(!calls[3].partial);
        assert!(calls.iter().all(|c| c.id == calls[0].id));
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_thinking_closes_with_signature() {
        let mut acc = StreamAccumulator::new(true, None);
        let events = run(
            &mut acc,
            vec![
                WireDelta::Thinking {
                    slot: Some(0),
                    text: "Let me ".into(),
                },
                WireDelta::Thinking {
                    slot: Some(0),
                    text: "think".into(),
                },
                WireDelta::ThinkingSignature("sig".into()),
                WireDelta::BlockStop { slot: 0 },
                WireDelta::Text("answer".into()),
            ],
        );
        assert_eq!(events.len(), 4);
        let UnifiedEvent::Thinking(last) = &events[2] else {
            panic!("expected thinking, got {:?}", events[2]);
        };
        assert_eq!(last.text, "Let me think");
        assert_eq!(last.signature.as_deref(), Some("sig"));
        assert!(!last.partial);
        assert_eq!(events[3], UnifiedEvent::TextDelta("answer".into()));
    }

    #[test]
    fn test_text_closes_thinking_without_block_stop() {
        let mut acc = StreamAccumulator::new(false, None);
        let events = run(
            &mut acc,
            vec![
                WireDelta::Thinking {
                    slot: None,
                    text: "hmm".into(),
                },
                WireDelta::Text("hi".into()),
            ],
        );
        assert!(matches!(&events[0], UnifiedEvent::Thinking(t) if t.text == "hmm" && !t.partial));
        assert_eq!(events[1], UnifiedEvent::TextDelta("hi".into()));
    }

    #[test]
    fn test_redacted_thinking() {
        let mut acc = StreamAccumulator::new(false, None);
        let events = run(
            &mut acc,
            vec![WireDelta::RedactedThinking {
                data: "opaque".into(),
            }],
        );
        let UnifiedEvent::Thinking(thinking) = &events[0] else {
            panic!("expected thinking");
        };
        assert!(thinking.text.is_empty());
        assert_eq!(thinking.provider_metadata[REDACTED_SIGNATURE_KEY], json!("opaque"));
    }

    #[test]
    fn test_nameless_call_is_dropped() {
        let mut acc = StreamAccumulator::new(false, None);
        let events = run(
            &mut acc,
            vec![
                WireDelta::ToolArgs {
                    slot: 0,
                    fragment: "{}".into(),
                },
                WireDelta::Stop,
            ],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_usage_merges() {
        let mut acc = StreamAccumulator::new(false, None);
        run(
            &mut acc,
            vec![
                WireDelta::Usage(Usage {
                    input_tokens: Some(3),
                    ..Usage::default()
                }),
                WireDelta::Usage(Usage {
                    output_tokens: Some(9),
                    ..Usage::default()
                }),
            ],
        );
        assert_eq!(acc.usage().input_tokens, Some(3));
        assert_eq!(acc.usage().output_tokens, Some(9));
    }
}
