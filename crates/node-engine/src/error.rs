//! Error types for the node engine

use thiserror::Error;

/// Result type alias using NodeEngineError
pub type Result<T> = std::result::Result<T, NodeEngineError>;

/// Errors that can occur in the node engine
///
/// Only contract violations travel through this type. A node's own execution
/// failure (bad expression, failed HTTP call, unparsable text) is encoded in
/// its output value instead.
#[derive(Debug, Error)]
pub enum NodeEngineError {
    /// Node execution failed in a way the node could not express as data
    #[error("Node execution failed: {0}")]
    ExecutionFailed(String),

    /// No plugin is registered for the requested node type
    #[error("No plugin registered for node type '{0}'")]
    UnknownPlugin(String),

    /// The plugin exists but is currently disabled
    #[error("Plugin for node type '{0}' is disabled")]
    PluginDisabled(String),

    /// Node configuration could not be interpreted
    #[error("Invalid data for node '{node_id}': {message}")]
    InvalidNodeData { node_id: String, message: String },

    /// Node did not finish within the configured timeout
    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// The flow graph contains a cycle among executable nodes
    #[error("Cycle detected in flow graph")]
    CycleDetected,

    /// A node referenced by the caller does not exist in the graph
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Flow graph failed structural validation
    #[error("Flow validation failed: {}", .0.join("; "))]
    InvalidFlow(Vec<String>),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeEngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create an invalid-data error for a node
    pub fn invalid_data(node_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidNodeData {
            node_id: node_id.into(),
            message: msg.into(),
        }
    }
}

/// Reasons a plugin registration is refused
///
/// Every problem found is reported, not just the first.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Plugin registration rejected for '{node_type}': {}", .problems.join("; "))]
pub struct RegistrationError {
    /// Type tag the plugin declared (may be empty)
    pub node_type: String,
    /// Human-readable list of problems
    pub problems: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_error_lists_all_problems() {
        let err = RegistrationError {
            node_type: "broken".to_string(),
            problems: vec!["missing name".to_string(), "invalid version".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("broken"));
        assert!(msg.contains("missing name; invalid version"));
    }

    #[test]
    fn test_invalid_flow_message() {
        let err = NodeEngineError::InvalidFlow(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Flow validation failed: a; b");
    }
}
