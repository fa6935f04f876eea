use serde_json::{json, Map, Value};

use crate::error::CompletionError;
use crate::prompt::EncodedContent;
use crate::protocol::ollama::{
    OllamaFunctionCall, OllamaMessage, OllamaRequest, OllamaTool, OllamaToolCall,
    OllamaToolFunction,
};
use crate::protocol::request::{lower_turns, Block, EncodeRequest, LowerOptions, Message, Role};

/// Encode a prompt into a streaming `/api/chat` request body.
///
/// # Errors
///
/// Returns [`CompletionError::Encode`] when serialization fails, or upload
/// store failures raised while resolving content.
pub fn encode_ollama_request(request: &EncodeRequest<'_>) -> Result<Value, CompletionError> {
    let lowered = lower_turns(
        request,
        LowerOptions {
            results_as_user: false,
            inline_speaker: true,
        },
    )?;

    let mut messages = Vec::with_capacity(lowered.len() + 1);
    let system = request.system_text();
    if !system.is_empty() {
        messages.push(OllamaMessage {
            role: "system".into(),
            content: system,
            ..OllamaMessage::default()
        });
    }
    for message in &lowered {
        encode_message(message, &mut messages);
    }

    let tools = request.native_tool_definitions();
    let tools = (!tools.is_empty()).then(|| {
        tools
            .iter()
            .map(|tool| OllamaTool {
                type_: "function".into(),
                function: OllamaToolFunction {
                    name: tool.name().to_owned(),
                    description: tool.description().to_owned(),
                    parameters: tool.to_json_schema(),
                },
            })
            .collect()
    });

    let mut options = Map::new();
    if let Some(temperature) = request.temperature {
        options.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        options.insert("top_p".into(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        options.insert("num_predict".into(), json!(max_tokens));
    }
    if !request.stop_sequences.is_empty() {
        options.insert("stop".into(), json!(request.stop_sequences));
    }

    let body = OllamaRequest {
        model: request.model.to_owned(),
        messages,
        tools,
        stream: true,
        think: request.thinking.then_some(true),
        format: request.response_schema().cloned(),
        options,
    };
    serde_json::to_value(&body).map_err(|err| CompletionError::Encode(err.to_string()))
}

fn encode_message(message: &Message<'_>, out: &mut Vec<OllamaMessage>) {
    if message.role == Role::Tool {
        for block in &message.blocks {
            if let Block::ToolResult { name, content, .. } = block {
                out.push(OllamaMessage {
                    role: "tool".into(),
                    content: (*content).to_owned(),
                    tool_name: Some((*name).to_owned()),
                    ..OllamaMessage::default()
                });
            }
        }
        return;
    }

    let mut images = Vec::new();
    let mut tool_calls = Vec::new();
    let mut thinking: Option<String> = None;
    for block in &message.blocks {
        match block {
            Block::Content(EncodedContent::Image { data, .. }) => images.push(data.clone()),
            Block::Content(EncodedContent::Document { filename, .. }) => {
                tracing::debug!(filename = %filename, "ollama does not accept documents; skipping");
            }
            Block::Thinking(record) if !record.text.is_empty() => {
                thinking = Some(record.text.clone());
            }
            Block::ToolCall {
                name, arguments, ..
            } => tool_calls.push(OllamaToolCall {
                function: OllamaFunctionCall {
                    name: (*name).to_owned(),
                    arguments: (*arguments).clone(),
                },
            }),
            Block::Content(EncodedContent::Text(_))
            | Block::Thinking(_)
            | Block::ToolResult { .. } => {}
        }
    }
    out.push(OllamaMessage {
        role: if message.role == Role::Model {
            "assistant".into()
        } else {
            "user".into()
        },
        content: message.joined_text(),
        thinking,
        images: (!images.is_empty()).then_some(images),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_name: None,
    });
}
