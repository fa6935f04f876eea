pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// One backend and the model ids it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default = "default_dialect")]
    pub dialect: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Model ids, or `alias:upstream_model` entries.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Override the dialect's native tool support; `false` forces XML tools.
    #[serde(default)]
    pub native_tools: Option<bool>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

fn default_dialect() -> String {
    "openai".to_string()
}

/// Defaults applied to every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub partial_tool_calls: bool,
    #[serde(default)]
    pub output_thinking: bool,
    /// Tag names whose content is removed from streamed text.
    #[serde(default)]
    pub strip_tags: Vec<String>,
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    #[serde(default)]
    pub allow_documents: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_cancel_poll_ms() -> u64 {
    1000
}
fn default_max_pixels() -> u64 {
    1_048_576
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            partial_tool_calls: false,
            output_thinking: false,
            strip_tags: Vec::new(),
            cancel_poll_ms: default_cancel_poll_ms(),
            max_pixels: default_max_pixels(),
            allow_documents: false,
        }
    }
}

/// Settings of the default HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub use_env_proxy: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            runtime_worker_threads: None,
            use_env_proxy: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<EngineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
