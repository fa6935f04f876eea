//! Dialect-neutral request input and the conversation lowering shared by
//! every encoder.
use serde_json::{Map, Value};

use crate::error::CompletionError;
use crate::fc::{render_tool_call_xml, render_tool_result_xml, tool_instructions};
use crate::prompt::{
    content_with_encoded_uploads, Content, EncodedContent, Prompt, ThinkingRecord, ToolChoice,
    Turn, UploadOptions, UploadStore,
};
use crate::tool::ToolDefinition;

/// Everything an encoder needs to build one streaming request body.
#[derive(Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub prompt: &'a Prompt,
    /// Upstream model name.
    pub model: &'a str,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop_sequences: &'a [String],
    /// JSON schema the response must follow.
    pub response_format: Option<&'a Value>,
    /// Ask the backend to stream its reasoning.
    pub thinking: bool,
    /// Send tools natively instead of as XML instructions.
    pub native_tools: bool,
    pub uploads: Option<&'a dyn UploadStore>,
    pub upload_options: UploadOptions,
}

impl<'a> EncodeRequest<'a> {
    #[must_use]
    pub fn new(prompt: &'a Prompt, model: &'a str) -> Self {
        Self {
            prompt,
            model,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop_sequences: &[],
            response_format: None,
            thinking: false,
            native_tools: true,
            uploads: None,
            upload_options: UploadOptions::default(),
        }
    }

    /// System text, with the XML tool instructions appended when tools are
    /// not sent natively.
    #[must_use]
    pub fn system_text(&self) -> String {
        let system = self.prompt.system_text();
        if self.native_tools {
            return system.to_owned();
        }
        let instructions = tool_instructions(self.prompt.tools(), self.prompt.tool_choice());
        if instructions.is_empty() {
            return system.to_owned();
        }
        let mut out = String::with_capacity(system.len() + instructions.len() + 2);
        out.push_str(system);
        if !system.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&instructions);
        out
    }

    /// Tools to declare natively; empty in XML mode or with choice `none`.
    #[must_use]
    pub fn native_tool_definitions(&self) -> &'a [ToolDefinition] {
        if !self.native_tools || matches!(self.prompt.tool_choice(), Some(ToolChoice::None)) {
            return &[];
        }
        self.prompt.tools()
    }

    /// The bare JSON schema of `response_format`.
    #[must_use]
    pub fn response_schema(&self) -> Option<&'a Value> {
        self.response_format
            .map(|format| format.pointer("/json_schema/schema").unwrap_or(format))
    }

    /// Resolve `content` into encoded parts, dropping uploads when no store is set.
    ///
    /// # Errors
    ///
    /// Propagates upload store failures.
    pub fn parts(&self, content: &Content) -> Result<Vec<EncodedContent>, CompletionError> {
        if let Some(store) = self.uploads {
            return content_with_encoded_uploads(content, store, &self.upload_options);
        }
        if content.upload_ids().next().is_some() {
            tracing::debug!("no upload store configured; uploads left out of the request");
        }
        let text = content.text();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![EncodedContent::Text(text)])
    }
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    User,
    Model,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Block<'a> {
    Content(EncodedContent),
    Thinking(&'a ThinkingRecord),
    ToolCall {
        id: &'a str,
        name: &'a str,
        arguments: &'a Map<String, Value>,
    },
    ToolResult {
        id: &'a str,
        name: &'a str,
        content: &'a str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message<'a> {
    pub role: Role,
    pub speaker: Option<&'a str>,
    pub blocks: Vec<Block<'a>>,
}

impl Message<'_> {
    /// Text blocks joined with blank lines.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let Block::Content(EncodedContent::Text(text)) = block {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LowerOptions {
    /// Native tool results travel in user messages.
    pub results_as_user: bool,
    /// Prefix user text with `speaker: ` instead of keeping it on the message.
    pub inline_speaker: bool,
}

/// Turn the prompt's non-system turns into role-merged messages.
///
/// Tool turns become XML text when tools are not native. Adjacent messages
/// with the same role and speaker are merged.
pub(crate) fn lower_turns<'a>(
    request: &EncodeRequest<'a>,
    options: LowerOptions,
) -> Result<Vec<Message<'a>>, CompletionError> {
    let mut messages: Vec<Message<'a>> = Vec::with_capacity(request.prompt.turns().len());
    for turn in request.prompt.turns() {
        let (role, speaker, blocks) = match turn {
            Turn::System { .. } => continue,
            Turn::User { content, id } => {
                let mut blocks: Vec<Block<'a>> =
                    request.parts(content)?.into_iter().map(Block::Content).collect();
                let speaker = id.as_deref();
                if options.inline_speaker {
                    if let Some(name) = speaker {
                        prefix_speaker(&mut blocks, name);
                    }
                    (Role::User, None, blocks)
                } else {
                    (Role::User, speaker, blocks)
                }
            }
            Turn::Model { content, thinking } => {
                let mut blocks: Vec<Block<'a>> = thinking.iter().map(Block::Thinking).collect();
                blocks.extend(request.parts(content)?.into_iter().map(Block::Content));
                (Role::Model, None, blocks)
            }
            Turn::ToolCall {
                id,
                name,
                arguments,
                thinking,
            } => {
                let mut blocks: Vec<Block<'a>> = thinking.iter().map(Block::Thinking).collect();
                if request.native_tools {
                    blocks.push(Block::ToolCall {
                        id,
                        name,
                        arguments,
                    });
                } else {
                    blocks.push(Block::Content(EncodedContent::Text(render_tool_call_xml(
                        id, name, arguments,
                    ))));
                }
                (Role::Model, None, blocks)
            }
            Turn::Tool { id, name, content } => {
                if request.native_tools {
                    let role = if options.results_as_user {
                        Role::User
                    } else {
                        Role::Tool
                    };
                    (role, None, vec![Block::ToolResult { id, name, content }])
                } else {
                    let xml = render_tool_result_xml(id, name, content);
                    (Role::User, None, vec![Block::Content(EncodedContent::Text(xml))])
                }
            }
        };

        match messages.last_mut() {
            Some(last) if last.role == role && role != Role::Tool && last.speaker == speaker => {
                last.blocks.extend(blocks);
            }
            _ => messages.push(Message {
                role,
                speaker,
                blocks,
            }),
        }
    }
    Ok(messages)
}

fn prefix_speaker(blocks: &mut Vec<Block<'_>>, name: &str) {
    for block in blocks.iter_mut() {
        if let Block::Content(EncodedContent::Text(text)) = block {
            *text = format!("{name}: {text}");
            return;
        }
    }
    blocks.insert(0, Block::Content(EncodedContent::Text(format!("{name}:"))));
}

/// `data:` URL for inline binary content.
pub(crate) fn data_url(mime_type: &str, data: &str) -> String {
    format!("data:{mime_type};base64,{data}")
}
