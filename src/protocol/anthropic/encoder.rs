use serde_json::{json, Value};

use crate::error::CompletionError;
use crate::prompt::{EncodedContent, ThinkingRecord, ToolChoice};
use crate::protocol::accumulator::REDACTED_SIGNATURE_KEY;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicMessage, AnthropicRequest, AnthropicSource, AnthropicTool,
};
use crate::protocol::request::{lower_turns, Block, EncodeRequest, LowerOptions, Message, Role};

const DEFAULT_MAX_TOKENS: u64 = 4096;
const MIN_THINKING_BUDGET: u64 = 1024;

/// Encode a prompt into a streaming Anthropic Messages request body.
///
/// # Errors
///
/// Returns [`CompletionError::Encode`] when serialization fails, or upload
/// store failures raised while resolving content.
pub fn encode_anthropic_request(request: &EncodeRequest<'_>) -> Result<Value, CompletionError> {
    let lowered = lower_turns(
        request,
        LowerOptions {
            results_as_user: true,
            inline_speaker: true,
        },
    )?;
    let messages = lowered.iter().map(encode_message).collect();

    let tools = request.native_tool_definitions();
    let (tools, tool_choice) = if tools.is_empty() {
        (None, None)
    } else {
        let encoded = tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                input_schema: tool.to_json_schema(),
            })
            .collect();
        (Some(encoded), encode_tool_choice(request.prompt.tool_choice()))
    };

    let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let thinking = (request.thinking && max_tokens > 2 * MIN_THINKING_BUDGET)
        .then(|| json!({"type": "enabled", "budget_tokens": max_tokens / 2}));

    let system = request.system_text();
    let body = AnthropicRequest {
        model: request.model.to_owned(),
        max_tokens,
        system: (!system.is_empty()).then_some(system),
        messages,
        tools,
        tool_choice,
        thinking,
        stream: true,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: (!request.stop_sequences.is_empty())
            .then(|| request.stop_sequences.to_vec()),
    };
    serde_json::to_value(&body).map_err(|err| CompletionError::Encode(err.to_string()))
}

fn encode_message(message: &Message<'_>) -> AnthropicMessage {
    let role = match message.role {
        Role::Model => "assistant",
        Role::User | Role::Tool => "user",
    };
    let mut content = Vec::with_capacity(message.blocks.len());
    // tool_result blocks lead a user message.
    for block in &message.blocks {
        if let Block::ToolResult { id, content: text, .. } = block {
            content.push(AnthropicContentBlock::ToolResult {
                tool_use_id: (*id).to_owned(),
                content: (*text).to_owned(),
            });
        }
    }
    for block in &message.blocks {
        match block {
            Block::Content(part) => content.push(encode_content(part)),
            Block::Thinking(record) => {
                if let Some(block) = encode_thinking(record) {
                    content.push(block);
                }
            }
            Block::ToolCall {
                id,
                name,
                arguments,
            } => content.push(AnthropicContentBlock::ToolUse {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
                input: Value::Object((*arguments).clone()),
            }),
            Block::ToolResult { .. } => {}
        }
    }
    AnthropicMessage {
        role: role.to_owned(),
        content,
    }
}

fn encode_content(part: &EncodedContent) -> AnthropicContentBlock {
    match part {
        EncodedContent::Text(text) => AnthropicContentBlock::Text { text: text.clone() },
        EncodedContent::Image { mime_type, data } => AnthropicContentBlock::Image {
            source: AnthropicSource::base64(mime_type, data),
        },
        EncodedContent::Document {
            mime_type,
            filename,
            data,
        } => AnthropicContentBlock::Document {
            source: AnthropicSource::base64(mime_type, data),
            title: Some(filename.clone()),
        },
    }
}

/// Unsigned thinking is not accepted back, so it is left out.
fn encode_thinking(record: &ThinkingRecord) -> Option<AnthropicContentBlock> {
    if let Some(Value::String(data)) = record.metadata.get(REDACTED_SIGNATURE_KEY) {
        return Some(AnthropicContentBlock::RedactedThinking { data: data.clone() });
    }
    match &record.signature {
        Some(signature) => Some(AnthropicContentBlock::Thinking {
            thinking: record.text.clone(),
            signature: Some(signature.clone()),
        }),
        None => {
            tracing::debug!("dropping unsigned thinking from anthropic request");
            None
        }
    }
}

fn encode_tool_choice(choice: Option<&ToolChoice>) -> Option<Value> {
    match choice? {
        ToolChoice::Auto => Some(json!({"type": "auto"})),
        ToolChoice::Required => Some(json!({"type": "any"})),
        ToolChoice::Tool(name) => Some(json!({"type": "tool", "name": name})),
        ToolChoice::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{Prompt, Turn};
    use crate::tool::{ParameterDefinition, ParameterType, ToolDefinition};
    use serde_json::Map;

    fn tool() -> ToolDefinition {
        ToolDefinition::new(
            "search",
            "Search the forum",
            vec![ParameterDefinition::new("query", "Query", ParameterType::String).required()],
        )
        .unwrap()
    }

    fn prompt() -> Prompt {
        let mut args = Map::new();
        args.insert("query".into(), json!("cats"));
        Prompt::new(
            "You are a forum bot.",
            vec![
                Turn::user("find cats"),
                Turn::ToolCall {
                    id: "toolu_1".into(),
                    name: "search".into(),
                    arguments: args,
                    thinking: Some(ThinkingRecord {
                        text: "search first".into(),
                        signature: Some("sig".into()),
                        ..ThinkingRecord::default()
                    }),
                },
                Turn::tool("toolu_1", "search", "3 topics"),
            ],
        )
        .unwrap()
        .with_tools(vec![tool()])
        .with_tool_choice(ToolChoice::Required)
    }

    #[test]
    fn test_native_request_shape() {
        let prompt = prompt();
        let mut request = EncodeRequest::new(&prompt, "claude-x");
        let stops = vec!["STOP".to_string()];
        request.stop_sequences = &stops;
        request.temperature = Some(0.2);
        let body = encode_anthropic_request(&request).unwrap();

        assert_eq!(body["model"], json!("claude-x"));
        assert_eq!(body["max_tokens"], json!(4096));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["system"], json!("You are a forum bot."));
        assert_eq!(body["stop_sequences"], json!(["STOP"]));
        assert_eq!(body["tool_choice"], json!({"type": "any"}));
        assert_eq!(body["tools"][0]["input_schema"]["required"], json!(["query"]));

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], json!("assistant"));
        assert_eq!(messages[1]["content"][0]["type"], json!("thinking"));
        assert_eq!(messages[1]["content"][0]["signature"], json!("sig"));
        assert_eq!(messages[1]["content"][1]["type"], json!("tool_use"));
        assert_eq!(messages[2]["role"], json!("user"));
        assert_eq!(messages[2]["content"][0]["type"], json!("tool_result"));
        assert_eq!(messages[2]["content"][0]["tool_use_id"], json!("toolu_1"));
    }

    #[test]
    fn test_xml_mode_moves_tools_into_system() {
        let prompt = prompt();
        let mut request = EncodeRequest::new(&prompt, "claude-x");
        request.native_tools = false;
        let body = encode_anthropic_request(&request).unwrap();
        assert!(body.get("tools").is_none());
        let system = body["system"].as_str().unwrap();
        assert!(system.contains("<function_calls>"));
        assert!(system.contains("You MUST call at least one tool."));
        let messages = body["messages"].as_array().unwrap();
        assert!(messages[1]["content"][1]["text"]
            .as_str()
            .unwrap()
            .contains("<tool_name>search</tool_name>"));
        assert_eq!(messages[2]["role"], json!("user"));
    }

    #[test]
    fn test_thinking_budget() {
        let prompt = prompt();
        let mut request = EncodeRequest::new(&prompt, "claude-x");
        request.thinking = true;
        request.max_tokens = Some(8000);
        let body = encode_anthropic_request(&request).unwrap();
        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 4000}));
    }
}
