use rustc_hash::FxHashSet;

use super::{ConfigError, EngineConfig, EndpointConfig};
use crate::protocol::Dialect;

/// Validate the full engine config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_endpoints(config)?;
    validate_log_level(config)?;
    validate_features(config)?;
    validate_transport(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_endpoints(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.endpoints.is_empty() {
        return Err(validation_err("endpoints cannot be empty"));
    }

    for endpoint in &config.endpoints {
        validate_endpoint(endpoint)?;
    }

    // Every model id resolves to exactly one endpoint.
    let mut seen = FxHashSet::default();
    for endpoint in &config.endpoints {
        for entry in &endpoint.models {
            let id = entry.split_once(':').map_or(entry.as_str(), |(alias, _)| alias);
            if !seen.insert(id) {
                return Err(validation_err(format!(
                    "Endpoint '{}': model id '{id}' is already served by another entry",
                    endpoint.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_endpoint(endpoint: &EndpointConfig) -> Result<(), ConfigError> {
    let name = &endpoint.name;
    if name.trim().is_empty() {
        return Err(validation_err("endpoint name cannot be empty"));
    }
    let Some(dialect) = Dialect::from_name(&endpoint.dialect) else {
        return Err(validation_err(format!(
            "Endpoint '{name}': unknown dialect '{}'. Must be one of: {}",
            endpoint.dialect,
            Dialect::ALL
                .iter()
                .map(|d| d.name())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    };

    let parsed = url::Url::parse(&endpoint.base_url).map_err(|err| {
        validation_err(format!("Endpoint '{name}': base_url is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Endpoint '{name}': base_url must use http:// or https://"
        )));
    }

    if dialect != Dialect::Ollama && endpoint.api_key.trim().is_empty() {
        return Err(validation_err(format!(
            "Endpoint '{name}': api_key cannot be empty"
        )));
    }

    if endpoint.models.is_empty() {
        return Err(validation_err(format!(
            "Endpoint '{name}' must have at least one model"
        )));
    }
    for model in &endpoint.models {
        if model.trim().is_empty() {
            return Err(validation_err(format!(
                "Endpoint '{name}': model name cannot be empty"
            )));
        }
        if let Some((alias, upstream)) = model.split_once(':') {
            if alias.trim().is_empty() || upstream.trim().is_empty() {
                return Err(validation_err(format!(
                    "Invalid alias format in '{model}'. Both parts must not be empty."
                )));
            }
        }
    }
    if endpoint.max_output_tokens == Some(0) {
        return Err(validation_err(format!(
            "Endpoint '{name}': max_output_tokens must be greater than 0 when set"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &EngineConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_features(config: &EngineConfig) -> Result<(), ConfigError> {
    let features = &config.features;
    if features.cancel_poll_ms == 0 {
        return Err(validation_err("features.cancel_poll_ms must be greater than 0"));
    }
    if features.max_pixels == 0 {
        return Err(validation_err("features.max_pixels must be greater than 0"));
    }
    if features.strip_tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(validation_err("features.strip_tags contains an empty tag name"));
    }
    Ok(())
}

fn validate_transport(config: &EngineConfig) -> Result<(), ConfigError> {
    let transport = &config.transport;
    if transport.connect_timeout_secs == 0 {
        return Err(validation_err(
            "transport.connect_timeout_secs must be greater than 0",
        ));
    }
    if transport.runtime_worker_threads == Some(0) {
        return Err(validation_err(
            "transport.runtime_worker_threads must be greater than 0 when set",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn make_valid_config() -> EngineConfig {
        EngineConfig {
            endpoints: vec![EndpointConfig {
                name: "openai".to_string(),
                dialect: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: "sk-test".to_string(),
                models: vec!["gpt-4o".to_string(), "fast:gpt-4o-mini".to_string()],
                api_version: None,
                native_tools: None,
                max_output_tokens: None,
            }],
            features: FeaturesConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    fn assert_invalid(config: &EngineConfig, needle: &str) {
        match validate_config(config) {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {msg}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_empty_endpoints() {
        let mut config = make_valid_config();
        config.endpoints.clear();
        assert_invalid(&config, "endpoints cannot be empty");
    }

    #[test]
    fn test_unknown_dialect() {
        let mut config = make_valid_config();
        config.endpoints[0].dialect = "cohere".into();
        assert_invalid(&config, "unknown dialect");
    }

    #[test]
    fn test_bad_base_url() {
        let mut config = make_valid_config();
        config.endpoints[0].base_url = "ftp://example.com".into();
        assert_invalid(&config, "http:// or https://");
        config.endpoints[0].base_url = "not a url".into();
        assert_invalid(&config, "not a valid URL");
    }

    #[test]
    fn test_api_key_optional_for_ollama() {
        let mut config = make_valid_config();
        config.endpoints[0].api_key.clear();
        assert_invalid(&config, "api_key cannot be empty");
        config.endpoints[0].dialect = "ollama".into();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_model_ids() {
        let mut config = make_valid_config();
        let mut second = config.endpoints[0].clone();
        second.name = "other".into();
        second.models = vec!["fast:other-model".into()];
        config.endpoints.push(second);
        assert_invalid(&config, "already served");
    }

    #[test]
    fn test_bad_alias() {
        let mut config = make_valid_config();
        config.endpoints[0].models = vec![":gpt-4o".into()];
        assert_invalid(&config, "Invalid alias format");
    }

    #[test]
    fn test_log_level() {
        let mut config = make_valid_config();
        config.features.log_level = "warning".into();
        assert!(validate_config(&config).is_ok());
        config.features.log_level = "verbose".into();
        assert_invalid(&config, "log_level");
    }

    #[test]
    fn test_zero_limits() {
        let mut config = make_valid_config();
        config.transport.runtime_worker_threads = Some(0);
        assert_invalid(&config, "runtime_worker_threads");

        let mut config = make_valid_config();
        config.features.max_pixels = 0;
        assert_invalid(&config, "max_pixels");
    }
}
