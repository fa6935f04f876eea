use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

pub type ProviderMetadata = Map<String, Value>;

/// A reasoning block, growing while `partial` is true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thinking {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provider_metadata: ProviderMetadata,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: Map<String, Value>,
    pub partial: bool,
}

/// Normalized output of every dialect, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UnifiedEvent {
    TextDelta(String),
    Thinking(Thinking),
    ToolCall(ToolCall),
}

impl UnifiedEvent {
    /// True for thinking and tool call events that are still accumulating.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        match self {
            UnifiedEvent::TextDelta(_) => false,
            UnifiedEvent::Thinking(thinking) => thinking.partial,
            UnifiedEvent::ToolCall(call) => call.partial,
        }
    }
}

/// Token counts relayed from vendor usage reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

impl Usage {
    /// Overwrite the counts `other` reports; keep the rest.
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.cached_tokens.is_some() {
            self.cached_tokens = other.cached_tokens;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.cached_tokens.is_none()
    }
}

/// Deltas mapped from one wire event; rarely more than a handful.
pub type WireDeltas = SmallVec<[WireDelta; 4]>;

/// Dialect-neutral step produced by mapping one vendor wire event.
///
/// Slots are vendor-supplied block or tool indexes.
#[derive(Debug, Clone, PartialEq)]
pub enum WireDelta {
    Text(String),
    Thinking {
        slot: Option<usize>,
        text: String,
    },
    ThinkingSignature(String),
    /// Opaque vendor state attached to the open thinking block.
    ThinkingMetadata(ProviderMetadata),
    RedactedThinking {
        data: String,
    },
    ToolStart {
        slot: usize,
        id: Option<String>,
        name: Option<String>,
    },
    ToolArgs {
        slot: usize,
        fragment: String,
    },
    /// A call delivered whole in one event.
    ToolCall {
        id: Option<String>,
        name: String,
        arguments: Map<String, Value>,
    },
    BlockStop {
        slot: usize,
    },
    Usage(Usage),
    Stop,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_merge_keeps_unreported_counts() {
        let mut usage = Usage {
            input_tokens: Some(10),
            ..Usage::default()
        };
        usage.merge(&Usage {
            output_tokens: Some(5),
            ..Usage::default()
        });
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(5));
        assert_eq!(usage.cached_tokens, None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = UnifiedEvent::TextDelta("hi".into());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "text_delta", "value": "hi"})
        );
        let call = UnifiedEvent::ToolCall(ToolCall {
            id: "tool_0".into(),
            name: "search".into(),
            parameters: Map::new(),
            partial: true,
        });
        assert!(call.is_partial());
        assert_eq!(serde_json::to_value(&call).unwrap()["type"], "tool_call");
    }
}
