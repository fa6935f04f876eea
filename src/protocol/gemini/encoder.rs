use serde_json::{json, Value};

use crate::error::CompletionError;
use crate::prompt::{EncodedContent, ToolChoice};
use crate::protocol::gemini::{
    GeminiContent, GeminiFunctionCall, GeminiFunctionCallingConfig, GeminiFunctionDeclaration,
    GeminiFunctionResponse, GeminiGenerationConfig, GeminiInlineData, GeminiPart, GeminiRequest,
    GeminiToolConfig, GeminiToolDeclaration,
};
use crate::protocol::request::{lower_turns, Block, EncodeRequest, LowerOptions, Message, Role};

/// Encode a prompt into a streaming generateContent request body.
///
/// # Errors
///
/// Returns [`CompletionError::Encode`] when serialization fails, or upload
/// store failures raised while resolving content.
pub fn encode_gemini_request(request: &EncodeRequest<'_>) -> Result<Value, CompletionError> {
    let lowered = lower_turns(
        request,
        LowerOptions {
            results_as_user: true,
            inline_speaker: true,
        },
    )?;
    let contents = lowered.iter().map(encode_message).collect();

    let system = request.system_text();
    let system_instruction = (!system.is_empty()).then(|| GeminiContent {
        role: None,
        parts: vec![GeminiPart {
            text: Some(system),
            ..GeminiPart::default()
        }],
    });

    let tools = request.native_tool_definitions();
    let (tools, tool_config) = if tools.is_empty() {
        (None, None)
    } else {
        let declarations = tools
            .iter()
            .map(|tool| GeminiFunctionDeclaration {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                parameters: tool.to_json_schema(),
            })
            .collect();
        (
            Some(vec![GeminiToolDeclaration {
                function_declarations: declarations,
            }]),
            encode_tool_config(request.prompt.tool_choice()),
        )
    };

    let schema = request.response_schema();
    let generation_config = GeminiGenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: (!request.stop_sequences.is_empty())
            .then(|| request.stop_sequences.to_vec()),
        response_mime_type: schema.map(|_| "application/json".to_owned()),
        response_schema: schema.cloned(),
        thinking_config: request.thinking.then(|| json!({"includeThoughts": true})),
    };

    let body = GeminiRequest {
        contents,
        tools,
        tool_config,
        system_instruction,
        generation_config: Some(generation_config),
    };
    serde_json::to_value(&body).map_err(|err| CompletionError::Encode(err.to_string()))
}

fn encode_message(message: &Message<'_>) -> GeminiContent {
    let role = match message.role {
        Role::Model => "model",
        Role::User | Role::Tool => "user",
    };
    let mut parts = Vec::with_capacity(message.blocks.len());
    // A signature is echoed on the part that follows its reasoning.
    let mut pending_signature: Option<String> = None;
    for block in &message.blocks {
        let mut part = match block {
            Block::Thinking(record) => {
                pending_signature.clone_from(&record.signature);
                continue;
            }
            Block::Content(EncodedContent::Text(text)) => GeminiPart {
                text: Some(text.clone()),
                ..GeminiPart::default()
            },
            Block::Content(
                EncodedContent::Image { mime_type, data }
                | EncodedContent::Document {
                    mime_type, data, ..
                },
            ) => GeminiPart {
                inline_data: Some(GeminiInlineData {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..GeminiPart::default()
            },
            Block::ToolCall {
                id,
                name,
                arguments,
            } => GeminiPart {
                function_call: Some(GeminiFunctionCall {
                    id: (!id.is_empty()).then(|| (*id).to_owned()),
                    name: (*name).to_owned(),
                    args: (*arguments).clone(),
                }),
                ..GeminiPart::default()
            },
            Block::ToolResult { id, name, content } => GeminiPart {
                function_response: Some(GeminiFunctionResponse {
                    id: (!id.is_empty()).then(|| (*id).to_owned()),
                    name: (*name).to_owned(),
                    response: json!({"content": content}),
                }),
                ..GeminiPart::default()
            },
        };
        part.thought_signature = pending_signature.take();
        parts.push(part);
    }
    GeminiContent {
        role: Some(role.to_owned()),
        parts,
    }
}

fn encode_tool_config(choice: Option<&ToolChoice>) -> Option<GeminiToolConfig> {
    let (mode, allowed) = match choice? {
        ToolChoice::Auto => ("AUTO", None),
        ToolChoice::None => ("NONE", None),
        ToolChoice::Required => ("ANY", None),
        ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
    };
    Some(GeminiToolConfig {
        function_calling_config: GeminiFunctionCallingConfig {
            mode: mode.to_owned(),
            allowed_function_names: allowed,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{Prompt, ThinkingRecord, Turn};
    use crate::tool::{ParameterDefinition, ParameterType, ToolDefinition};
    use serde_json::Map;

    #[test]
    fn test_request_shape() {
        let mut args = Map::new();
        args.insert("query".into(), json!("cats"));
        let tool = ToolDefinition::new(
            "search",
            "Search",
            vec![ParameterDefinition::new("query", "Query", ParameterType::String)],
        )
        .unwrap();
        let prompt = Prompt::new(
            "sys",
            vec![
                Turn::user("find cats"),
                Turn::ToolCall {
                    id: String::new(),
                    name: "search".into(),
                    arguments: args,
                    thinking: Some(ThinkingRecord {
                        text: String::new(),
                        signature: Some("c2ln".into()),
                        ..ThinkingRecord::default()
                    }),
                },
                Turn::tool("", "search", "2 results"),
            ],
        )
        .unwrap()
        .with_tools(vec![tool])
        .with_tool_choice(ToolChoice::Tool("search".into()));

        let body = encode_gemini_request(&EncodeRequest::new(&prompt, "gemini-x")).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("sys"));
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(
            contents[1],
            json!({"role": "model", "parts": [{
                "thoughtSignature": "c2ln",
                "functionCall": {"name": "search", "args": {"query": "cats"}}
            }]})
        );
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"],
            json!({"name": "search", "response": {"content": "2 results"}})
        );
        assert_eq!(
            body["toolConfig"],
            json!({"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["search"]}})
        );
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            json!("search")
        );
    }

    #[test]
    fn test_response_schema_and_thinking() {
        let prompt = Prompt::new("sys", vec![Turn::user("hi")]).unwrap();
        let schema = json!({"type": "object"});
        let mut request = EncodeRequest::new(&prompt, "gemini-x");
        request.response_format = Some(&schema);
        request.thinking = true;
        let body = encode_gemini_request(&request).unwrap();
        let config = &body["generationConfig"];
        assert_eq!(config["responseMimeType"], json!("application/json"));
        assert_eq!(config["responseSchema"], schema);
        assert_eq!(config["thinkingConfig"], json!({"includeThoughts": true}));
    }
}
