//! Variable registry
//!
//! Two catalogs answer "what can this node reference?":
//!
//! - the static schema, declared once per node type by its plugin
//! - the runtime catalog, extracted per node instance from its latest output
//!
//! [`VariableRegistry::available_variables_for`] walks the flow graph
//! upstream from a node and merges both catalogs for every node it reaches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::descriptor::VariableDefinition;
use crate::events::{EngineEvent, EventSink};
use crate::extractor::{render_example, NestedVariableExtractor, RuntimeVariable};
use crate::path::full_path;
use crate::references::{validate_references, ReferenceValidation};
use crate::types::{FlowGraph, NodeId, VariableType};

/// A variable a node may reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableVariable {
    /// Schema name, or the path inside the output for runtime variables
    pub name: String,
    pub node_id: NodeId,
    pub node_label: String,
    pub node_type: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub description: String,
    pub full_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    /// `true` for variables discovered in runtime output
    pub is_nested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    /// Captured value, runtime variables only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl AvailableVariable {
    fn from_schema(node_id: &str, node_label: &str, node_type: &str, def: &VariableDefinition, max_example: usize) -> Self {
        Self {
            name: def.name.clone(),
            node_id: node_id.to_string(),
            node_label: node_label.to_string(),
            node_type: node_type.to_string(),
            var_type: def.var_type,
            description: def.description.clone(),
            full_path: full_path(node_id, &def.name),
            example: def.example.as_ref().map(|e| render_example(e, max_example)),
            is_nested: false,
            depth: None,
            value: None,
        }
    }

    fn from_runtime(node_label: &str, node_type: &str, var: &RuntimeVariable) -> Self {
        Self {
            name: var.path.clone(),
            node_id: var.node_id.clone(),
            node_label: node_label.to_string(),
            node_type: node_type.to_string(),
            var_type: var.var_type,
            description: var.description.clone(),
            full_path: var.full_path.clone(),
            example: Some(var.example.clone()),
            is_nested: true,
            depth: Some(var.depth),
            value: Some(var.value.clone()),
        }
    }

    #[cfg(test)]
    pub(crate) fn runtime_for_test(node_id: &str, path: &str, var_type: VariableType) -> Self {
        Self {
            name: path.to_string(),
            node_id: node_id.to_string(),
            node_label: node_id.to_string(),
            node_type: "test".to_string(),
            var_type,
            description: String::new(),
            full_path: full_path(node_id, path),
            example: None,
            is_nested: true,
            depth: Some(0),
            value: None,
        }
    }

    fn matches(&self, term: &str) -> bool {
        [&self.name, &self.node_label, &self.description, &self.full_path]
            .iter()
            .any(|field| field.to_lowercase().contains(term))
    }
}

/// Presentation order: static first, then shallower runtime variables,
/// then full path
fn sort_available(vars: &mut [AvailableVariable]) {
    vars.sort_by(|a, b| {
        (a.is_nested, a.depth.unwrap_or(0), &a.full_path).cmp(&(b.is_nested, b.depth.unwrap_or(0), &b.full_path))
    });
}

struct RuntimeSet {
    variables: Arc<Vec<RuntimeVariable>>,
    extracted_at: DateTime<Utc>,
}

/// Static schemas per node type and runtime catalogs per node instance
pub struct VariableRegistry {
    schemas: RwLock<HashMap<String, Arc<Vec<VariableDefinition>>>>,
    runtime: RwLock<HashMap<NodeId, RuntimeSet>>,
    extractor: NestedVariableExtractor,
    events: Arc<dyn EventSink>,
    freshness: Duration,
}

impl VariableRegistry {
    pub fn new(events: Arc<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            runtime: RwLock::new(HashMap::new()),
            extractor: NestedVariableExtractor::new(config.extractor.clone()),
            events,
            freshness: Duration::from_secs(config.variables.freshness_secs),
        }
    }

    /// Store the static catalog of a node type, replacing any previous one
    pub fn register_schema(&self, node_type: &str, definitions: Vec<VariableDefinition>) {
        let variable_count = definitions.len();
        self.schemas
            .write()
            .insert(node_type.to_string(), Arc::new(definitions));
        log::debug!("VariableRegistry: schema for '{}' has {} variables", node_type, variable_count);
        self.emit(EngineEvent::SchemaRegistered {
            node_type: node_type.to_string(),
            variable_count,
        });
    }

    pub fn schema_for(&self, node_type: &str) -> Option<Vec<VariableDefinition>> {
        self.schemas.read().get(node_type).map(|defs| defs.as_ref().clone())
    }

    /// Extract `output` and replace the node's runtime set
    ///
    /// A null output or an empty extraction clears the set instead. Returns
    /// the number of variables stored.
    pub fn register_runtime(&self, node_id: &str, output: &Value) -> usize {
        let variables = if output.is_null() {
            Vec::new()
        } else {
            self.extractor.extract(node_id, output)
        };

        if variables.is_empty() {
            self.invalidate_runtime(node_id);
            return 0;
        }

        let variable_count = variables.len();
        let set = RuntimeSet {
            extracted_at: variables[0].extracted_at,
            variables: Arc::new(variables),
        };
        self.runtime.write().insert(node_id.to_string(), set);

        self.emit(EngineEvent::RuntimeVariablesRegistered {
            node_id: node_id.to_string(),
            variable_count,
        });
        variable_count
    }

    /// The node's current runtime set (empty if none)
    pub fn runtime_for(&self, node_id: &str) -> Vec<RuntimeVariable> {
        self.runtime
            .read()
            .get(node_id)
            .map(|set| set.variables.as_ref().clone())
            .unwrap_or_default()
    }

    /// Drop a node's runtime set; `false` if there was none
    pub fn invalidate_runtime(&self, node_id: &str) -> bool {
        let removed = self.runtime.write().remove(node_id).is_some();
        if removed {
            self.emit(EngineEvent::RuntimeVariablesInvalidated {
                node_id: node_id.to_string(),
            });
        }
        removed
    }

    /// Drop every runtime set; returns how many nodes had one
    pub fn clear_all_runtime(&self) -> usize {
        let node_count = {
            let mut runtime = self.runtime.write();
            let count = runtime.len();
            runtime.clear();
            count
        };
        if node_count > 0 {
            self.emit(EngineEvent::RuntimeVariablesCleared { node_count });
        }
        node_count
    }

    /// Whether the node's runtime set was extracted within `max_age`
    pub fn is_fresh(&self, node_id: &str, max_age: Duration) -> bool {
        let Some(extracted_at) = self.runtime.read().get(node_id).map(|set| set.extracted_at) else {
            return false;
        };
        let age = Utc::now() - extracted_at;
        age.to_std().map(|age| age <= max_age).unwrap_or(true)
    }

    /// [`is_fresh`](Self::is_fresh) with the configured window
    pub fn is_fresh_default(&self, node_id: &str) -> bool {
        self.is_fresh(node_id, self.freshness)
    }

    /// Every node with a path of incoming edges ending at `node_id`
    ///
    /// Breadth-first and visit-once, so cycles are tolerated. The target
    /// itself is never included.
    pub fn upstream_nodes(node_id: &str, graph: &FlowGraph) -> Vec<NodeId> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut reached = Vec::new();

        visited.insert(node_id);
        queue.push_back(node_id);

        while let Some(current) = queue.pop_front() {
            for edge in graph.incoming_edges(current) {
                let source = edge.source.as_str();
                if visited.insert(source) {
                    reached.push(source.to_string());
                    queue.push_back(source);
                }
            }
        }
        reached
    }

    /// Static and runtime variables of every upstream node
    pub fn available_variables_for(&self, node_id: &str, graph: &FlowGraph) -> Vec<AvailableVariable> {
        let upstream = Self::upstream_nodes(node_id, graph);
        let max_example = self.extractor.config().max_example_len;

        let mut available = Vec::new();
        {
            let schemas = self.schemas.read();
            let runtime = self.runtime.read();

            for id in &upstream {
                // dangling edge sources are reported by validation, not here
                let Some(node) = graph.find_node(id) else {
                    continue;
                };
                let label = node.label();

                if let Some(defs) = schemas.get(&node.node_type) {
                    available.extend(
                        defs.iter()
                            .map(|def| AvailableVariable::from_schema(id, label, &node.node_type, def, max_example)),
                    );
                }
                if let Some(set) = runtime.get(id) {
                    available.extend(
                        set.variables
                            .iter()
                            .map(|var| AvailableVariable::from_runtime(label, &node.node_type, var)),
                    );
                }
            }
        }

        sort_available(&mut available);
        available
    }

    /// Case-insensitive search over the available set
    pub fn suggest(&self, node_id: &str, graph: &FlowGraph, term: &str) -> Vec<AvailableVariable> {
        let term = term.trim().to_lowercase();
        let mut matches: Vec<AvailableVariable> = self
            .available_variables_for(node_id, graph)
            .into_iter()
            .filter(|v| term.is_empty() || v.matches(&term))
            .collect();
        sort_available(&mut matches);
        matches
    }

    /// Validate every reference in `text` against what `node_id` can see
    pub fn validate_references(&self, text: &str, node_id: &str, graph: &FlowGraph) -> Vec<ReferenceValidation> {
        validate_references(text, &self.available_variables_for(node_id, graph))
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("VariableRegistry: event not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, VecEventSink};
    use crate::types::{GraphEdge, GraphNode};
    use serde_json::json;

    fn registry() -> (VariableRegistry, Arc<VecEventSink>) {
        let sink = Arc::new(VecEventSink::new());
        (VariableRegistry::new(sink.clone(), &EngineConfig::default()), sink)
    }

    /// trigger -> http -> cond -> sink, plus an unrelated node
    fn graph() -> FlowGraph {
        FlowGraph::new("f1", "Test")
            .with_node(GraphNode::new("trigger", "manual-trigger", json!({})))
            .with_node(GraphNode::new("http", "http-request", json!({"label": "Fetch profile"})))
            .with_node(GraphNode::new("cond", "condition", json!({})))
            .with_node(GraphNode::new("sink", "transform", json!({})))
            .with_node(GraphNode::new("other", "transform", json!({})))
            .with_edge(GraphEdge::new("e1", "trigger", "http"))
            .with_edge(GraphEdge::new("e2", "http", "cond"))
            .with_edge(GraphEdge::new("e3", "cond", "sink").from_handle("true"))
    }

    #[test]
    fn test_runtime_round_trip_surfaces_downstream() {
        let (registry, sink) = registry();
        let g = FlowGraph::new("f", "f")
            .with_node(GraphNode::new("n1", "t", json!({})))
            .with_node(GraphNode::new("n2", "t", json!({})))
            .with_edge(GraphEdge::new("e", "n1", "n2"));

        assert_eq!(registry.register_runtime("n1", &json!({"a": {"b": 1}})), 2);

        let leaf = registry
            .runtime_for("n1")
            .into_iter()
            .find(|v| v.full_path == "n1.a.b")
            .unwrap();
        assert!(leaf.depth >= 1);

        let available = registry.available_variables_for("n2", &g);
        assert!(available.iter().any(|v| v.full_path == "n1.a.b" && v.is_nested));
        assert_eq!(sink.count(EventKind::RuntimeVariablesRegistered), 1);
    }

    #[test]
    fn test_available_excludes_self_and_unreachable() {
        let (registry, _) = registry();
        for id in ["trigger", "http", "cond", "sink", "other"] {
            registry.register_runtime(id, &json!({"v": 1}));
        }

        let nodes: HashSet<String> = registry
            .available_variables_for("cond", &graph())
            .into_iter()
            .map(|v| v.node_id)
            .collect();
        assert_eq!(nodes, ["trigger", "http"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_cycles_are_visited_once() {
        let (registry, _) = registry();
        let g = graph().with_edge(GraphEdge::new("back", "sink", "trigger"));
        registry.register_runtime("sink", &json!({"v": 1}));
        registry.register_runtime("http", &json!({"v": 1}));

        let upstream = VariableRegistry::upstream_nodes("cond", &g);
        assert_eq!(upstream, vec!["http", "trigger", "sink"]);

        let available = registry.available_variables_for("cond", &g);
        assert_eq!(available.iter().filter(|v| v.full_path == "sink.v").count(), 1);
    }

    #[test]
    fn test_ordering_static_then_depth_then_path() {
        let (registry, _) = registry();
        registry.register_schema(
            "http-request",
            vec![
                VariableDefinition::new("status", VariableType::Number, "HTTP status"),
                VariableDefinition::new("data", VariableType::Any, "Body").with_example(json!({"id": 1})),
            ],
        );
        registry.register_runtime("http", &json!({"data": {"id": 7}, "status": 200}));

        let order: Vec<(bool, String)> = registry
            .available_variables_for("cond", &graph())
            .into_iter()
            .map(|v| (v.is_nested, v.full_path))
            .collect();
        assert_eq!(
            order,
            vec![
                (false, "http.data".to_string()),
                (false, "http.status".to_string()),
                (true, "http.data".to_string()),
                (true, "http.status".to_string()),
                (true, "http.data.id".to_string()),
            ]
        );
    }

    #[test]
    fn test_suggest_filters_case_insensitively() {
        let (registry, _) = registry();
        registry.register_runtime("http", &json!({"userName": "ada", "count": 1}));
        registry.register_runtime("trigger", &json!({"payload": 1}));

        let names: Vec<String> = registry
            .suggest("cond", &graph(), "USER")
            .into_iter()
            .map(|v| v.full_path)
            .collect();
        assert_eq!(names, vec!["http.userName"]);

        // label match pulls in every variable of the labelled node
        assert_eq!(registry.suggest("cond", &graph(), "fetch").len(), 2);
        assert_eq!(registry.suggest("cond", &graph(), "").len(), 3);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let (registry, sink) = registry();
        registry.register_runtime("n1", &json!({"a": 1}));

        assert!(registry.invalidate_runtime("n1"));
        assert!(!registry.invalidate_runtime("n1"));
        assert_eq!(sink.count(EventKind::RuntimeVariablesInvalidated), 1);
    }

    #[test]
    fn test_null_output_clears_set() {
        let (registry, sink) = registry();
        registry.register_runtime("n1", &json!({"a": 1}));
        assert_eq!(registry.register_runtime("n1", &Value::Null), 0);
        assert!(registry.runtime_for("n1").is_empty());

        // nothing left to invalidate
        registry.register_runtime("n1", &json!({}));
        assert_eq!(sink.count(EventKind::RuntimeVariablesInvalidated), 1);
    }

    #[test]
    fn test_clear_all() {
        let (registry, sink) = registry();
        assert_eq!(registry.clear_all_runtime(), 0);
        registry.register_runtime("a", &json!({"x": 1}));
        registry.register_runtime("b", &json!({"x": 1}));

        assert_eq!(registry.clear_all_runtime(), 2);
        assert_eq!(sink.count(EventKind::RuntimeVariablesCleared), 1);
    }

    #[test]
    fn test_freshness() {
        let (registry, _) = registry();
        assert!(!registry.is_fresh("n1", Duration::from_secs(60)));
        registry.register_runtime("n1", &json!({"a": 1}));
        assert!(registry.is_fresh("n1", Duration::from_secs(60)));
        assert!(registry.is_fresh_default("n1"));

        std::thread::sleep(Duration::from_millis(5));
        assert!(!registry.is_fresh("n1", Duration::ZERO));
    }

    #[test]
    fn test_validate_references_against_graph() {
        let (registry, _) = registry();
        registry.register_runtime("http", &json!({"user": {"name": "ada"}}));

        let results = registry.validate_references("{http.user.name} {sink.x} {other.v}", "cond", &graph());
        let valid: Vec<bool> = results.iter().map(|r| r.valid).collect();
        assert_eq!(valid, vec![true, false, false]);
    }
}
