use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::{EndpointConfig, EngineConfig};
use crate::error::CompletionError;
use crate::protocol::Dialect;

/// Everything needed to reach one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEndpoint {
    pub dialect: Dialect,
    pub base_url: String,
    pub api_key: String,
    pub api_version: Option<String>,
    /// Model name sent upstream (the right side of an `alias:model` entry).
    pub upstream_model: String,
    pub native_tools: bool,
    pub max_output_tokens: Option<u64>,
}

/// Model id to endpoint index, built once and passed by reference.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    models: FxHashMap<String, Arc<ModelEndpoint>>,
}

impl DialectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every model entry of every configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Config`] for an unknown dialect name.
    pub fn from_config(config: &EngineConfig) -> Result<Self, CompletionError> {
        let mut registry = Self::new();
        for endpoint in &config.endpoints {
            registry.register_endpoint(endpoint)?;
        }
        Ok(registry)
    }

    /// Register the models of one configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Config`] for an unknown dialect name.
    pub fn register_endpoint(&mut self, endpoint: &EndpointConfig) -> Result<(), CompletionError> {
        let dialect = Dialect::from_name(&endpoint.dialect).ok_or_else(|| {
            CompletionError::Config(format!(
                "Endpoint '{}': unknown dialect '{}'",
                endpoint.name, endpoint.dialect
            ))
        })?;
        let native_tools = endpoint
            .native_tools
            .unwrap_or(dialect.spec().native_tools);
        for entry in &endpoint.models {
            let (model_id, upstream_model) = match entry.split_once(':') {
                Some((alias, real)) => (alias.trim(), real.trim()),
                None => (entry.trim(), entry.trim()),
            };
            self.register(
                model_id,
                ModelEndpoint {
                    dialect,
                    base_url: endpoint.base_url.clone(),
                    api_key: endpoint.api_key.clone(),
                    api_version: endpoint.api_version.clone(),
                    upstream_model: upstream_model.to_owned(),
                    native_tools,
                    max_output_tokens: endpoint.max_output_tokens,
                },
            );
        }
        Ok(())
    }

    /// Map `model_id` to `endpoint`, replacing a previous mapping.
    pub fn register(&mut self, model_id: impl Into<String>, endpoint: ModelEndpoint) {
        let model_id = model_id.into();
        if self.models.insert(model_id.clone(), Arc::new(endpoint)).is_some() {
            tracing::debug!(model = %model_id, "model registration replaced");
        }
    }

    /// # Errors
    ///
    /// Returns [`CompletionError::UnknownModel`] when `model` is not registered.
    pub fn resolve(&self, model: &str) -> Result<Arc<ModelEndpoint>, CompletionError> {
        self.models
            .get(model)
            .cloned()
            .ok_or_else(|| CompletionError::UnknownModel(model.to_owned()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Registered model ids, sorted.
    #[must_use]
    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeaturesConfig, TransportConfig};

    fn make_endpoint(name: &str, dialect: &str, models: Vec<&str>) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            dialect: dialect.to_string(),
            base_url: format!("https://{name}.example.com/v1"),
            api_key: "key".to_string(),
            models: models.into_iter().map(String::from).collect(),
            api_version: None,
            native_tools: None,
            max_output_tokens: Some(1000),
        }
    }

    fn make_config(endpoints: Vec<EndpointConfig>) -> EngineConfig {
        EngineConfig {
            endpoints,
            features: FeaturesConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    #[test]
    fn test_exact_model_match() {
        let registry =
            DialectRegistry::from_config(&make_config(vec![make_endpoint("a", "openai", vec!["gpt-4o"])]))
                .unwrap();
        let endpoint = registry.resolve("gpt-4o").unwrap();
        assert_eq!(endpoint.dialect, Dialect::OpenAi);
        assert_eq!(endpoint.upstream_model, "gpt-4o");
        assert!(endpoint.native_tools);
        assert_eq!(endpoint.max_output_tokens, Some(1000));
    }

    #[test]
    fn test_alias_maps_to_upstream_model() {
        let registry = DialectRegistry::from_config(&make_config(vec![make_endpoint(
            "local",
            "ollama",
            vec!["small:llama3.2:1b"],
        )]))
        .unwrap();
        let endpoint = registry.resolve("small").unwrap();
        assert_eq!(endpoint.upstream_model, "llama3.2:1b");
        assert!(!endpoint.native_tools);
        assert!(registry.resolve("llama3.2:1b").is_err());
    }

    #[test]
    fn test_native_tools_override() {
        let mut endpoint = make_endpoint("a", "anthropic", vec!["claude"]);
        endpoint.native_tools = Some(false);
        let registry = DialectRegistry::from_config(&make_config(vec![endpoint])).unwrap();
        assert!(!registry.resolve("claude").unwrap().native_tools);
    }

    #[test]
    fn test_no_match_returns_error() {
        let registry = DialectRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, CompletionError::UnknownModel(ref m) if m == "missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_dialect_is_config_error() {
        let err = DialectRegistry::from_config(&make_config(vec![make_endpoint("a", "palm", vec!["x"])]))
            .unwrap_err();
        assert!(matches!(err, CompletionError::Config(_)));
    }
}
