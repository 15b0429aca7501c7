//! Flow graph validation
//!
//! Validates graph structure, node types and node data, and detects
//! cycles. Every problem is collected; validation never stops at the first.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::plugin_registry::PluginRegistry;
use crate::types::{FlowGraph, NodeId};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Cycle detected in the graph
    CycleDetected,
    /// Two nodes share an id
    DuplicateNodeId { node_id: String },
    /// Two edges share an id
    DuplicateEdgeId { edge_id: String },
    /// An edge references a non-existent node
    UnknownNode { edge_id: String, node_id: String },
    /// A node has a type with no registered plugin
    UnknownNodeType { node_id: String, node_type: String },
    /// A node's plugin is registered but disabled
    DisabledNodeType { node_id: String, node_type: String },
    /// The node's plugin rejected its data
    InvalidNodeData { node_id: String, message: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleDetected => write!(f, "Cycle detected in graph"),
            Self::DuplicateNodeId { node_id } => write!(f, "Duplicate node id '{}'", node_id),
            Self::DuplicateEdgeId { edge_id } => write!(f, "Duplicate edge id '{}'", edge_id),
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "Edge '{}' references unknown node '{}'", edge_id, node_id)
            }
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "Unknown node type '{}' for node '{}'", node_type, node_id)
            }
            Self::DisabledNodeType { node_id, node_type } => {
                write!(f, "Node type '{}' used by node '{}' is disabled", node_type, node_id)
            }
            Self::InvalidNodeData { node_id, message } => {
                write!(f, "Node '{}': {}", node_id, message)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a flow graph
///
/// Returns all validation errors found (not just the first).
/// Pass a registry to enable node type and node data validation.
pub fn validate_flow(graph: &FlowGraph, registry: Option<&PluginRegistry>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_unique_ids(graph, &mut errors);
    validate_edge_references(graph, &mut errors);
    if topological_order(graph).is_none() {
        errors.push(ValidationError::CycleDetected);
    }

    if let Some(reg) = registry {
        validate_node_data(graph, reg, &mut errors);
    }

    errors
}

fn validate_unique_ids(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let mut nodes = HashSet::new();
    for node in &graph.nodes {
        if !nodes.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }
    let mut edges = HashSet::new();
    for edge in &graph.edges {
        if !edges.insert(edge.id.as_str()) {
            errors.push(ValidationError::DuplicateEdgeId {
                edge_id: edge.id.clone(),
            });
        }
    }
}

/// Check that all edge source/target nodes exist
fn validate_edge_references(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
}

/// Check node types against the registry and run each plugin's data checks
fn validate_node_data(graph: &FlowGraph, registry: &PluginRegistry, errors: &mut Vec<ValidationError>) {
    for node in &graph.nodes {
        let Some(registration) = registry.registration(&node.node_type) else {
            errors.push(ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
            continue;
        };
        if !registration.enabled {
            errors.push(ValidationError::DisabledNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
            continue;
        }
        for message in registration.plugin.validate_data(&node.data) {
            errors.push(ValidationError::InvalidNodeData {
                node_id: node.id.clone(),
                message,
            });
        }
    }
}

/// Order nodes with Kahn's algorithm
///
/// Ties keep declaration order, so the result is deterministic. Edges to
/// unknown nodes are ignored. Returns `None` if the graph has a cycle.
pub fn topological_order(graph: &FlowGraph) -> Option<Vec<NodeId>> {
    let mut in_degree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in &graph.edges {
        if in_degree.contains_key(edge.source.as_str()) {
            if let Some(deg) = in_degree.get_mut(edge.target.as_str()) {
                *deg += 1;
            }
        }
    }

    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0) && seen.insert(*id))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.to_string());
        for edge in graph.outgoing_edges(node_id) {
            if let Some(deg) = in_degree.get_mut(edge.target.as_str()).filter(|d| **d > 0) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
    }

    (order.len() == in_degree.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::context::ExecutionContext;
    use crate::descriptor::{PluginMetadata, VariableDefinition};
    use crate::error::Result;
    use crate::events::NullEventSink;
    use crate::plugin::NodePlugin;
    use crate::types::{GraphEdge, GraphNode, PluginCategory};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Requires a non-empty `text` field
    struct TextPlugin;

    #[async_trait]
    impl NodePlugin for TextPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("text", "Text", "Text node", "1.0.0", PluginCategory::Utility)
        }

        fn create_default_data(&self) -> Value {
            json!({"text": ""})
        }

        fn output_schema(&self) -> Vec<VariableDefinition> {
            Vec::new()
        }

        async fn execute(&self, input: Value, _data: &Value, _ctx: &ExecutionContext) -> Result<Value> {
            Ok(input)
        }

        fn validate_data(&self, data: &Value) -> Vec<String> {
            match data.get("text").and_then(Value::as_str) {
                Some(t) if !t.is_empty() => Vec::new(),
                _ => vec!["text is required".to_string()],
            }
        }
    }

    fn make_test_registry() -> PluginRegistry {
        let registry = PluginRegistry::new(Arc::new(NullEventSink), &MetricsConfig::default());
        registry.register(Arc::new(TextPlugin)).unwrap();
        registry
    }

    fn node(id: &str) -> GraphNode {
        GraphNode::new(id, "text", json!({"text": "hi"}))
    }

    #[test]
    fn test_valid_graph() {
        let graph = FlowGraph::new("f", "Test")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_edge(GraphEdge::new("e1", "a", "b"));

        let registry = make_test_registry();
        let errors = validate_flow(&graph, Some(&registry));
        assert!(errors.is_empty(), "Expected no errors, got: {:?}", errors);
    }

    #[test]
    fn test_detect_cycle() {
        let graph = FlowGraph::new("f", "Cyclic")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_edge(GraphEdge::new("e1", "a", "b"))
            .with_edge(GraphEdge::new("e2", "b", "a"));

        let errors = validate_flow(&graph, None);
        assert!(errors.contains(&ValidationError::CycleDetected));
        assert!(topological_order(&graph).is_none());
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let graph = FlowGraph::new("f", "Diamond")
            .with_node(node("d"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_node(node("a"))
            .with_edge(GraphEdge::new("e1", "a", "b"))
            .with_edge(GraphEdge::new("e2", "a", "c"))
            .with_edge(GraphEdge::new("e3", "b", "d"))
            .with_edge(GraphEdge::new("e4", "c", "d"));

        assert_eq!(topological_order(&graph).unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_unknown_and_disabled_types() {
        let graph = FlowGraph::new("f", "Test")
            .with_node(GraphNode::new("a", "unknown-type", json!({})))
            .with_node(node("b"));

        let registry = make_test_registry();
        registry.set_enabled("text", false);
        let errors = validate_flow(&graph, Some(&registry));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownNodeType { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DisabledNodeType { .. })));
    }

    #[test]
    fn test_edge_references_missing_node() {
        let graph = FlowGraph::new("f", "Test")
            .with_node(node("a"))
            .with_edge(GraphEdge::new("e1", "a", "missing"));

        let errors = validate_flow(&graph, None);
        assert_eq!(
            errors,
            vec![ValidationError::UnknownNode {
                edge_id: "e1".into(),
                node_id: "missing".into()
            }]
        );
    }

    #[test]
    fn test_collects_multiple_errors() {
        let graph = FlowGraph::new("f", "Broken")
            .with_node(GraphNode::new("a", "text", json!({})))
            .with_node(node("a"))
            .with_edge(GraphEdge::new("e1", "a", "x"))
            .with_edge(GraphEdge::new("e1", "y", "a"));

        let registry = make_test_registry();
        let errors = validate_flow(&graph, Some(&registry));
        assert!(errors.contains(&ValidationError::DuplicateNodeId { node_id: "a".into() }));
        assert!(errors.contains(&ValidationError::DuplicateEdgeId { edge_id: "e1".into() }));
        assert_eq!(
            errors.iter().filter(|e| matches!(e, ValidationError::UnknownNode { .. })).count(),
            2
        );
        assert!(errors.contains(&ValidationError::InvalidNodeData {
            node_id: "a".into(),
            message: "text is required".into()
        }));
        assert_eq!(
            errors[errors.len() - 1].to_string(),
            "Node 'a': text is required"
        );
    }
}
