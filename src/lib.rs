pub mod cancel;
pub mod config;
pub mod error;
pub mod fc;
pub mod generation;
pub mod observability;
pub mod prompt;
pub mod protocol;
pub mod routing;
pub mod stream;
pub mod tool;
pub mod transport;

pub(crate) mod json_scan;
mod util;

pub use cancel::{CallbackId, CancelManager, CancelState};
pub use error::{CompletionError, ErrorCategory};
pub use generation::{Completion, GenerateOptions, Llm};
pub use prompt::{Prompt, ResponsePart, ToolChoice, Turn};
pub use protocol::{Dialect, Thinking, ToolCall, UnifiedEvent, Usage};
pub use routing::{DialectRegistry, ModelEndpoint};
pub use tool::{ParameterDefinition, ParameterType, ToolDefinition};
