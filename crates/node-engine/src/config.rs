//! Engine configuration
//!
//! A single [`EngineConfig`] snapshot is shared (behind `Arc`) by the
//! registries, the executor and every execution context. It can be built in
//! code, loaded from a JSON file, and adjusted from `NODEFLOW_*` environment
//! variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::constants::{self, extraction, integrations, limits, timeouts};
use crate::error::Result;

/// Errors raised while loading or checking configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Execution timeouts and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Budget for a whole node invocation
    pub node_timeout_ms: u64,
    /// Budget for a single expression evaluation
    pub expression_timeout_ms: u64,
    /// Interpreter step budget per expression
    pub expression_max_steps: usize,
    /// Retries when a node returns a hard error
    pub max_retries: u32,
    /// Upper bound for loop nodes
    pub max_loop_iterations: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: timeouts::NODE_MS,
            expression_timeout_ms: timeouts::EXPRESSION_MS,
            expression_max_steps: limits::EXPRESSION_STEPS,
            max_retries: limits::MAX_RETRIES,
            max_loop_iterations: limits::MAX_LOOP_ITERATIONS,
        }
    }
}

impl ExecutionConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }
}

/// Limits for the nested variable extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractorConfig {
    pub max_depth: usize,
    pub max_variables: usize,
    pub max_array_items: usize,
    pub max_example_len: usize,
    /// Containers larger than this keep a pruned copy as their value
    pub max_value_bytes: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_depth: extraction::MAX_DEPTH,
            max_variables: extraction::MAX_VARIABLES,
            max_array_items: extraction::MAX_ARRAY_ITEMS,
            max_example_len: extraction::MAX_EXAMPLE_LEN,
            max_value_bytes: extraction::MAX_VALUE_BYTES,
        }
    }
}

/// Runtime variable catalog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariablesConfig {
    /// Age under which a runtime set counts as fresh
    pub freshness_secs: u64,
}

impl Default for VariablesConfig {
    fn default() -> Self {
        Self {
            freshness_secs: constants::FRESHNESS_SECS,
        }
    }
}

/// Plugin execution metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// Number of executions retained per plugin
    pub window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: limits::METRICS_WINDOW,
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: limits::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Credentials and endpoints for integration nodes
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntegrationConfig {
    pub http_timeout_ms: u64,
    pub user_agent: String,
    /// OpenAI-compatible API root (no trailing `/chat/completions`)
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: timeouts::HTTP_MS,
            user_agent: integrations::USER_AGENT.to_string(),
            llm_base_url: integrations::LLM_BASE_URL.to_string(),
            llm_model: integrations::LLM_MODEL.to_string(),
            llm_timeout_ms: timeouts::LLM_MS,
            llm_api_key: None,
        }
    }
}

// Keep API keys out of debug logs
impl std::fmt::Debug for IntegrationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationConfig")
            .field("http_timeout_ms", &self.http_timeout_ms)
            .field("user_agent", &self.user_agent)
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_model", &self.llm_model)
            .field("llm_timeout_ms", &self.llm_timeout_ms)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub extractor: ExtractorConfig,
    pub variables: VariablesConfig,
    pub metrics: MetricsConfig,
    pub events: EventsConfig,
    pub integrations: IntegrationConfig,
}

impl EngineConfig {
    /// Parse a JSON document; missing sections fall back to defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&contents)?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Reject limits that would make the engine unusable
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive: [(&'static str, u64); 6] = [
            ("execution.nodeTimeoutMs", self.execution.node_timeout_ms),
            ("execution.expressionTimeoutMs", self.execution.expression_timeout_ms),
            ("execution.expressionMaxSteps", self.execution.expression_max_steps as u64),
            ("metrics.window", self.metrics.window as u64),
            ("events.channelCapacity", self.events.channel_capacity as u64),
            ("integrations.httpTimeoutMs", self.integrations.http_timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !self.integrations.llm_base_url.starts_with("http://")
            && !self.integrations.llm_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                key: "integrations.llmBaseUrl",
                reason: format!("'{}' is not an http(s) URL", self.integrations.llm_base_url),
            });
        }
        Ok(())
    }

    /// Write configuration to a JSON file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// Apply `NODEFLOW_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Unparsable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(constants::env::NODE_TIMEOUT_MS) {
            match raw.parse() {
                Ok(ms) => self.execution.node_timeout_ms = ms,
                Err(_) => log::warn!("Ignoring invalid {}='{}'", constants::env::NODE_TIMEOUT_MS, raw),
            }
        }
        if let Some(raw) = lookup(constants::env::MAX_LOOP_ITERATIONS) {
            match raw.parse() {
                Ok(n) => self.execution.max_loop_iterations = n,
                Err(_) => log::warn!("Ignoring invalid {}='{}'", constants::env::MAX_LOOP_ITERATIONS, raw),
            }
        }
        if let Some(url) = lookup(constants::env::LLM_BASE_URL) {
            self.integrations.llm_base_url = url;
        }
        if let Some(key) = lookup(constants::env::LLM_API_KEY) {
            self.integrations.llm_api_key = Some(key);
        }
        if let Some(model) = lookup(constants::env::LLM_MODEL) {
            self.integrations.llm_model = model;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeEngineError;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"execution": {"maxRetries": 2}}"#).unwrap();
        assert_eq!(config.execution.max_retries, 2);
        assert_eq!(config.execution.node_timeout_ms, timeouts::NODE_MS);
        assert_eq!(config.metrics.window, 100);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, NodeEngineError::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = EngineConfig::from_json_str(r#"{"metrics": {"window": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("metrics.window"));

        let mut config = EngineConfig::default();
        config.integrations.llm_base_url = "ftp://example".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "integrations.llmBaseUrl", .. })
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let mut config = EngineConfig::default();
        config.extractor.max_depth = 3;
        config.integrations.llm_model = "local-model".to_string();
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, NodeEngineError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NODEFLOW_NODE_TIMEOUT_MS", "1500"),
            ("NODEFLOW_MAX_LOOP_ITERATIONS", "abc"),
            ("NODEFLOW_LLM_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.execution.node_timeout_ms, 1500);
        assert_eq!(config.execution.max_loop_iterations, limits::MAX_LOOP_ITERATIONS);
        assert_eq!(config.integrations.llm_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut config = IntegrationConfig::default();
        config.llm_api_key = Some("sk-secret".into());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
