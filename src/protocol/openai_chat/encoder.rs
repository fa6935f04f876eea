use serde_json::{json, Value};

use crate::error::CompletionError;
use crate::prompt::{EncodedContent, ToolChoice};
use crate::protocol::openai_chat::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStreamOptions, OpenAiTool, OpenAiToolCall,
    OpenAiToolCallFunction, OpenAiToolFunction,
};
use crate::protocol::request::{
    data_url, lower_turns, Block, EncodeRequest, LowerOptions, Message, Role,
};

/// Encode a prompt into a streaming chat completions request body.
///
/// # Errors
///
/// Returns [`CompletionError::Encode`] when serialization fails, or upload
/// store failures raised while resolving content.
pub fn encode_openai_chat_request(request: &EncodeRequest<'_>) -> Result<Value, CompletionError> {
    let lowered = lower_turns(request, LowerOptions::default())?;

    let mut messages = Vec::with_capacity(lowered.len() + 1);
    let system = request.system_text();
    if !system.is_empty() {
        messages.push(OpenAiMessage {
            role: "system".into(),
            content: Some(Value::String(system)),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in &lowered {
        encode_message(message, &mut messages);
    }

    let tools = request.native_tool_definitions();
    let (tools, tool_choice) = if tools.is_empty() {
        (None, None)
    } else {
        let encoded = tools
            .iter()
            .map(|tool| OpenAiTool {
                type_: "function".into(),
                function: OpenAiToolFunction {
                    name: tool.name().to_owned(),
                    description: tool.description().to_owned(),
                    parameters: tool.to_json_schema(),
                },
            })
            .collect();
        (Some(encoded), encode_tool_choice(request.prompt.tool_choice()))
    };

    let response_format = request.response_schema().map(|schema| {
        json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema, "strict": true},
        })
    });

    let body = OpenAiChatRequest {
        model: request.model.to_owned(),
        messages,
        tools,
        tool_choice,
        stream: true,
        stream_options: Some(OpenAiStreamOptions {
            include_usage: true,
        }),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        stop: (!request.stop_sequences.is_empty()).then(|| request.stop_sequences.to_vec()),
        response_format,
    };
    serde_json::to_value(&body).map_err(|err| CompletionError::Encode(err.to_string()))
}

fn encode_message(message: &Message<'_>, out: &mut Vec<OpenAiMessage>) {
    match message.role {
        // One `tool` message per result.
        Role::Tool => {
            for block in &message.blocks {
                if let Block::ToolResult { id, content, .. } = block {
                    out.push(OpenAiMessage {
                        role: "tool".into(),
                        content: Some(Value::String((*content).to_owned())),
                        name: None,
                        tool_calls: None,
                        tool_call_id: Some((*id).to_owned()),
                    });
                }
            }
        }
        Role::User => out.push(OpenAiMessage {
            role: "user".into(),
            content: Some(encode_content(&message.blocks)),
            name: message.speaker.map(sanitize_name),
            tool_calls: None,
            tool_call_id: None,
        }),
        Role::Model => {
            let tool_calls: Vec<OpenAiToolCall> = message
                .blocks
                .iter()
                .filter_map(|block| match block {
                    Block::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(OpenAiToolCall {
                        id: (*id).to_owned(),
                        type_: "function".into(),
                        function: OpenAiToolCallFunction {
                            name: (*name).to_owned(),
                            arguments: Value::Object((*arguments).clone()).to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            let text = message.joined_text();
            out.push(OpenAiMessage {
                role: "assistant".into(),
                content: (!text.is_empty() || tool_calls.is_empty()).then(|| Value::String(text)),
                name: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            });
        }
    }
}

/// Plain string for text-only content, a parts array otherwise.
fn encode_content(blocks: &[Block<'_>]) -> Value {
    let mut parts = Vec::with_capacity(blocks.len());
    let mut text_only = true;
    for block in blocks {
        let Block::Content(part) = block else {
            continue;
        };
        match part {
            EncodedContent::Text(text) => parts.push(json!({"type": "text", "text": text})),
            EncodedContent::Image { mime_type, data } => {
                text_only = false;
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": data_url(mime_type, data)},
                }));
            }
            EncodedContent::Document {
                mime_type,
                filename,
                data,
            } => {
                text_only = false;
                parts.push(json!({
                    "type": "file",
                    "file": {"filename": filename, "file_data": data_url(mime_type, data)},
                }));
            }
        }
    }
    if text_only {
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect();
        return Value::String(texts.join("\n\n"));
    }
    Value::Array(parts)
}

/// `name` allows `[a-zA-Z0-9_-]{1,64}`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

fn encode_tool_choice(choice: Option<&ToolChoice>) -> Option<Value> {
    match choice? {
        ToolChoice::Auto => Some(json!("auto")),
        ToolChoice::None => Some(json!("none")),
        ToolChoice::Required => Some(json!("required")),
        ToolChoice::Tool(name) => Some(json!({"type": "function", "function": {"name": name}})),
    }
}
