//! Core types for flow graphs
//!
//! These types define the structure of flow graphs (nodes and edges) and
//! the small tag enums shared by plugins and the variable catalogs.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Unique identifier for a port/handle
pub type HandleId = String;

/// Category of a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    /// Entry points that start a flow
    Trigger,
    /// Side-effecting nodes (HTTP, LLM, integrations)
    Action,
    /// Branching nodes (condition, switch)
    Condition,
    /// Data-shaping nodes (transform, loop)
    Transform,
    /// Everything else
    Utility,
}

impl PluginCategory {
    /// Parse a category tag as written in plugin metadata
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "trigger" => Some(Self::Trigger),
            "action" => Some(Self::Action),
            "condition" => Some(Self::Condition),
            "transform" => Some(Self::Transform),
            "utility" => Some(Self::Utility),
            _ => None,
        }
    }

    /// The tag used in serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Transform => "transform",
            Self::Utility => "utility",
        }
    }
}

/// Type tag of a variable, declared or inferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Undefined,
    /// Declared schemas may promise "anything"
    Any,
}

impl VariableType {
    /// Infer the type tag of a JSON value
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::Array,
            serde_json::Value::Object(_) => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An edge connecting two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Source output handle (branch name for branching nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<HandleId>,
    /// Target node ID
    pub target: NodeId,
    /// Target input handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<HandleId>,
}

impl GraphEdge {
    /// Create an edge without handles
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
        }
    }

    /// Set the source output handle
    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Set the target input handle
    pub fn to_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }
}

/// A node instance in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Unique identifier for this node instance
    pub id: NodeId,
    /// Node type tag (references a registered plugin)
    pub node_type: String,
    /// Position in the editor (x, y)
    #[serde(default)]
    pub position: (f64, f64),
    /// Type-specific configuration for this instance
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GraphNode {
    /// Create a node at the origin
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: (0.0, 0.0),
            data,
        }
    }

    /// Display label: `data.label` when set, else the type tag
    pub fn label(&self) -> &str {
        self.data
            .get("label")
            .and_then(|l| l.as_str())
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.node_type)
    }
}

/// A complete flow graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    /// Unique identifier for this flow
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Nodes in the graph
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Edges connecting nodes
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl FlowGraph {
    /// Create a new empty graph
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node (builder style)
    pub fn with_node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge (builder style)
    pub fn with_edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Find a node by ID (mutable)
    pub fn find_node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Get edges coming into a node
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Get edges going out of a node
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Get the IDs of nodes that this node depends on (direct upstream nodes)
    pub fn get_dependencies(&self, node_id: &str) -> Vec<NodeId> {
        self.incoming_edges(node_id)
            .map(|e| e.source.clone())
            .collect()
    }

    /// Get the IDs of nodes that depend on this node (direct downstream nodes)
    pub fn get_dependents(&self, node_id: &str) -> Vec<NodeId> {
        self.outgoing_edges(node_id)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, node_id: &str) -> Option<GraphNode> {
        let pos = self.nodes.iter().position(|n| n.id == node_id)?;
        self.edges.retain(|e| e.source != node_id && e.target != node_id);
        Some(self.nodes.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_graph() -> FlowGraph {
        FlowGraph::new("test", "Test Graph")
            .with_node(GraphNode::new("node1", "manual-trigger", json!({})))
            .with_node(GraphNode::new("node2", "transform", json!({"label": "Shape"})))
            .with_edge(GraphEdge::new("edge1", "node1", "node2"))
    }

    #[test]
    fn test_graph_edges() {
        let graph = two_node_graph();

        let deps = graph.get_dependencies("node2");
        assert_eq!(deps, vec!["node1"]);

        let dependents = graph.get_dependents("node1");
        assert_eq!(dependents, vec!["node2"]);
    }

    #[test]
    fn test_node_label_falls_back_to_type() {
        let graph = two_node_graph();
        assert_eq!(graph.find_node("node1").unwrap().label(), "manual-trigger");
        assert_eq!(graph.find_node("node2").unwrap().label(), "Shape");
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut graph = two_node_graph();
        assert!(graph.remove_node("node1").is_some());
        assert!(graph.edges.is_empty());
        assert!(graph.remove_node("node1").is_none());
    }

    #[test]
    fn test_variable_type_inference() {
        assert_eq!(VariableType::of(&json!("x")), VariableType::String);
        assert_eq!(VariableType::of(&json!(1.5)), VariableType::Number);
        assert_eq!(VariableType::of(&json!([1])), VariableType::Array);
        assert_eq!(VariableType::of(&json!(null)), VariableType::Null);
    }

    #[test]
    fn test_edge_handles_roundtrip_camel_case() {
        let edge = GraphEdge::new("e", "a", "b").from_handle("true");
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["sourceHandle"], "true");
        assert!(json.get("targetHandle").is_none());
    }

    #[test]
    fn test_category_tags() {
        assert_eq!(PluginCategory::from_tag("condition"), Some(PluginCategory::Condition));
        assert_eq!(PluginCategory::from_tag("bogus"), None);
        assert_eq!(PluginCategory::Action.as_str(), "action");
    }
}
