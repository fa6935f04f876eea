//! Turn-validated conversation container handed to a generation.
//!
//! Each turn kind is its own variant, so a tool result without an id or a
//! system turn with uploads cannot be expressed. Sequencing rules are
//! checked on every [`Prompt::push`].
pub mod upload;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CompletionError;
use crate::protocol::canonical::{ProviderMetadata, Thinking, ToolCall};
use crate::tool::ToolDefinition;

pub use upload::{
    content_with_encoded_uploads, EncodedContent, ReadRequest, UploadMeta, UploadOptions,
    UploadStore,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Reference to an uploaded file, resolved on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadRef {
    pub upload_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Text(String),
    Upload(UploadRef),
}

/// Turn content: plain text, or text interleaved with uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// The text parts joined, uploads left out.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text(text) => Some(text.as_str()),
                    ContentPart::Upload(_) => None,
                })
                .collect(),
        }
    }

    pub fn upload_ids(&self) -> impl Iterator<Item = u64> + '_ {
        let parts: &[ContentPart] = match self {
            Content::Text(_) => &[],
            Content::Parts(parts) => parts,
        };
        parts.iter().filter_map(|part| match part {
            ContentPart::Upload(upload) => Some(upload.upload_id),
            ContentPart::Text(_) => None,
        })
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_owned())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

/// Reasoning carried over from a previous model response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkingRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: ProviderMetadata,
}

impl From<Thinking> for ThinkingRecord {
    fn from(thinking: Thinking) -> Self {
        Self {
            text: thinking.text,
            signature: thinking.signature,
            metadata: thinking.provider_metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: Content,
        /// Speaker name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Model {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<ThinkingRecord>,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<ThinkingRecord>,
    },
    Tool {
        id: String,
        name: String,
        content: String,
    },
}

impl Turn {
    #[must_use]
    pub fn user(content: impl Into<Content>) -> Self {
        Turn::User {
            content: content.into(),
            id: None,
        }
    }

    #[must_use]
    pub fn model(content: impl Into<Content>) -> Self {
        Turn::Model {
            content: content.into(),
            thinking: None,
        }
    }

    #[must_use]
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Turn::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            thinking: None,
        }
    }

    #[must_use]
    pub fn tool(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Turn::Tool {
            id: id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Turn::System { .. } => "system",
            Turn::User { .. } => "user",
            Turn::Model { .. } => "model",
            Turn::ToolCall { .. } => "tool_call",
            Turn::Tool { .. } => "tool",
        }
    }
}

/// How the model may use the declared tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    /// Force one named tool.
    Tool(String),
}

impl From<String> for ToolChoice {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => ToolChoice::Auto,
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            _ => ToolChoice::Tool(value),
        }
    }
}

impl From<ToolChoice> for String {
    fn from(choice: ToolChoice) -> Self {
        match choice {
            ToolChoice::Auto => "auto".into(),
            ToolChoice::None => "none".into(),
            ToolChoice::Required => "required".into(),
            ToolChoice::Tool(name) => name,
        }
    }
}

/// One item of a streamed model response, as collected by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    Thinking(Thinking),
    ToolCall(ToolCall),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PromptJson {
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    messages: Vec<Turn>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    turns: Vec<Turn>,
    tools: Vec<ToolDefinition>,
    tool_choice: Option<ToolChoice>,
}

impl Prompt {
    /// # Errors
    ///
    /// Returns [`CompletionError::InvalidTurn`] when `turns` break the
    /// sequencing rules.
    pub fn new(system_text: impl Into<String>, turns: Vec<Turn>) -> Result<Self, CompletionError> {
        let mut prompt = Self {
            turns: vec![Turn::System {
                content: system_text.into(),
            }],
            tools: Vec::new(),
            tool_choice: None,
        };
        for turn in turns {
            prompt.push(turn)?;
        }
        Ok(prompt)
    }

    /// Build from `{system?, messages, tools?, tool_choice?}`.
    ///
    /// A leading system message in `messages` is used when `system` is absent.
    ///
    /// # Errors
    ///
    /// Shape problems (unknown or missing fields, bad tool definitions) are
    /// [`CompletionError::InvalidPrompt`]; sequencing problems are
    /// [`CompletionError::InvalidTurn`].
    pub fn from_json(value: &Value) -> Result<Self, CompletionError> {
        let raw = PromptJson::deserialize(value)
            .map_err(|e| CompletionError::InvalidPrompt(e.to_string()))?;
        let tools = raw
            .tools
            .iter()
            .map(ToolDefinition::from_hash)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CompletionError::InvalidPrompt(e.to_string()))?;

        let mut messages = raw.messages.into_iter().peekable();
        let leading_system = match messages.peek() {
            Some(Turn::System { .. }) => match messages.next() {
                Some(Turn::System { content }) => Some(content),
                _ => None,
            },
            _ => None,
        };
        let system = raw
            .system
            .or(leading_system)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());

        let mut prompt = Self::new(system, messages.collect())?.with_tools(tools);
        prompt.tool_choice = raw.tool_choice;
        Ok(prompt)
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    #[must_use]
    pub fn tool_choice(&self) -> Option<&ToolChoice> {
        self.tool_choice.as_ref()
    }

    #[must_use]
    pub fn system_text(&self) -> &str {
        match self.turns.first() {
            Some(Turn::System { content }) => content,
            _ => "",
        }
    }

    /// Append a turn, enforcing the sequencing rules.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::InvalidTurn`] for a second system turn, a
    /// tool result not directly after a tool call, or a model turn not
    /// directly after a user or tool turn.
    pub fn push(&mut self, turn: Turn) -> Result<(), CompletionError> {
        let last = self
            .turns
            .iter()
            .rev()
            .find(|t| !matches!(t, Turn::System { .. }));
        match &turn {
            Turn::System { .. } => {
                return Err(CompletionError::InvalidTurn(
                    "a prompt has exactly one system turn and it comes first".into(),
                ));
            }
            Turn::Tool { .. } if !matches!(last, Some(Turn::ToolCall { .. })) => {
                return Err(CompletionError::InvalidTurn(format!(
                    "tool turn must follow a tool_call turn, not {}",
                    last.map_or("nothing", Turn::kind)
                )));
            }
            Turn::Model { .. }
                if !matches!(self.turns.last(), Some(Turn::User { .. } | Turn::Tool { .. })) =>
            {
                return Err(CompletionError::InvalidTurn(format!(
                    "model turn must follow a user or tool turn, not {}",
                    self.turns.last().map_or("nothing", Turn::kind)
                )));
            }
            _ => {}
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Record a streamed model response.
    ///
    /// Consecutive text merges into one model turn. Final thinking attaches
    /// to the next turn produced; final tool calls become tool_call turns.
    /// Partial items are ignored.
    ///
    /// # Errors
    ///
    /// Propagates [`Prompt::push`] errors.
    pub fn push_model_response(&mut self, parts: Vec<ResponsePart>) -> Result<(), CompletionError> {
        let mut text = String::new();
        let mut thinking: Option<ThinkingRecord> = None;
        for part in parts {
            match part {
                ResponsePart::Text(fragment) => text.push_str(&fragment),
                ResponsePart::Thinking(t) if !t.partial => thinking = Some(t.into()),
                ResponsePart::ToolCall(call) if !call.partial => {
                    self.flush_model_text(&mut text, &mut thinking)?;
                    self.push(Turn::ToolCall {
                        id: call.id,
                        name: call.name,
                        arguments: call.parameters,
                        thinking: thinking.take(),
                    })?;
                }
                ResponsePart::Thinking(_) | ResponsePart::ToolCall(_) => {}
            }
        }
        self.flush_model_text(&mut text, &mut thinking)?;
        if thinking.is_some() {
            tracing::debug!("thinking without a following turn was not recorded");
        }
        Ok(())
    }

    fn flush_model_text(
        &mut self,
        text: &mut String,
        thinking: &mut Option<ThinkingRecord>,
    ) -> Result<(), CompletionError> {
        if text.is_empty() {
            return Ok(());
        }
        self.push(Turn::Model {
            content: Content::Text(std::mem::take(text)),
            thinking: thinking.take(),
        })
    }
}
