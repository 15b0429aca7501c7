//! Engine-wide constants
//!
//! Single source of truth for limits and configuration defaults.

/// Timeout defaults (in milliseconds)
pub mod timeouts {
    /// Whole-node execution budget
    pub const NODE_MS: u64 = 30_000;
    /// Wall-clock budget for a single expression evaluation
    pub const EXPRESSION_MS: u64 = 5_000;
    /// Outbound HTTP request timeout
    pub const HTTP_MS: u64 = 30_000;
    /// LLM completion request timeout
    pub const LLM_MS: u64 = 60_000;
}

/// Nested variable extraction limits
pub mod extraction {
    pub const MAX_DEPTH: usize = 10;
    pub const MAX_VARIABLES: usize = 500;
    /// Array elements sampled per array
    pub const MAX_ARRAY_ITEMS: usize = 10;
    /// Characters kept in a rendered example
    pub const MAX_EXAMPLE_LEN: usize = 100;
    /// Approximate JSON bytes a container variable keeps verbatim
    pub const MAX_VALUE_BYTES: usize = 4_096;
    /// Path used for non-object top-level outputs
    pub const ROOT_SEGMENT: &str = "value";
}

/// Execution limits
pub mod limits {
    /// Trailing window of execution metrics kept per plugin
    pub const METRICS_WINDOW: usize = 100;
    pub const MAX_LOOP_ITERATIONS: usize = 1_000;
    pub const MAX_RETRIES: u32 = 0;
    /// Interpreter steps allowed per expression evaluation
    pub const EXPRESSION_STEPS: usize = 100_000;
    /// Buffered events before publishers start dropping
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
}

/// Runtime variable freshness window (seconds)
pub const FRESHNESS_SECS: u64 = 60;

/// Integration defaults
pub mod integrations {
    pub const LLM_BASE_URL: &str = "https://api.openai.com/v1";
    pub const LLM_MODEL: &str = "gpt-4o-mini";
    pub const USER_AGENT: &str = concat!("nodeflow/", env!("CARGO_PKG_VERSION"));
}

/// Environment variable names read by `EngineConfig::apply_env_overrides`
pub mod env {
    pub const NODE_TIMEOUT_MS: &str = "NODEFLOW_NODE_TIMEOUT_MS";
    pub const MAX_LOOP_ITERATIONS: &str = "NODEFLOW_MAX_LOOP_ITERATIONS";
    pub const LLM_BASE_URL: &str = "NODEFLOW_LLM_BASE_URL";
    pub const LLM_API_KEY: &str = "NODEFLOW_LLM_API_KEY";
    pub const LLM_MODEL: &str = "NODEFLOW_LLM_MODEL";
}
