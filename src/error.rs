use crate::config::ConfigError;

/// Error type shared by every public entry point of the crate.
///
/// Malformed upstream data never surfaces here: decoders and processors
/// recover or drop silently. Only caller mistakes (bad prompts, unknown
/// models, invalid tool schemas) and setup failures are reported.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Invalid turn: {0}")]
    InvalidTurn(String),
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("Invalid tool definition: {0}")]
    InvalidToolDefinition(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Request encoding error: {0}")]
    Encode(String),
}

/// Broad error category, used to tell caller mistakes from environment failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidInput,
    Configuration,
    Network,
}

impl CompletionError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            CompletionError::UnknownModel(_)
            | CompletionError::InvalidTurn(_)
            | CompletionError::InvalidPrompt(_)
            | CompletionError::InvalidToolDefinition(_)
            | CompletionError::Upload(_)
            | CompletionError::Encode(_) => ErrorCategory::InvalidInput,
            CompletionError::Config(_) => ErrorCategory::Configuration,
            CompletionError::Transport(_) | CompletionError::Upstream { .. } => {
                ErrorCategory::Network
            }
        }
    }

    /// True for the variants raised by [`crate::prompt::Prompt::push`].
    #[must_use]
    pub fn is_invalid_turn(&self) -> bool {
        matches!(self, CompletionError::InvalidTurn(_))
    }
}

impl From<ConfigError> for CompletionError {
    fn from(err: ConfigError) -> Self {
        CompletionError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            CompletionError::UnknownModel("x".into()).category(),
            ErrorCategory::InvalidInput
        );
        assert_eq!(
            CompletionError::Upstream {
                status: 500,
                message: "boom".into()
            }
            .category(),
            ErrorCategory::Network
        );
        assert_eq!(
            CompletionError::Config("bad".into()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = CompletionError::InvalidTurn("model after model".into());
        assert_eq!(err.to_string(), "Invalid turn: model after model");
        assert!(err.is_invalid_turn());
    }

    #[test]
    fn test_config_error_converts() {
        let err: CompletionError = ConfigError::Validation("endpoints cannot be empty".into()).into();
        assert!(matches!(err, CompletionError::Config(msg) if msg.contains("endpoints")));
    }
}
