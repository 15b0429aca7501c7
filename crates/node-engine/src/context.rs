//! Per-invocation execution context
//!
//! An [`ExecutionContext`] is built fresh for every node invocation. It
//! carries the node's identity and input, run metadata, the service handles
//! supplied by the host (logger, event sink, configuration, extensions) and
//! two input-scoped helpers: reference substitution and expression
//! evaluation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::NodeEngineError;
use crate::events::{EngineEvent, EventSink, NullEventSink};
use crate::expression::{self, EvalLimits, ExpressionError, Scope};
use crate::extensions::ExecutorExtensions;
use crate::logging::NodeLogger;
use crate::path;
use crate::references::{parse_references, VariableReference};
use crate::types::NodeId;

/// Node id that addresses the current input in references
pub const INPUT_NODE_ID: &str = "input";

/// Position inside a loop, when the node runs per item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationInfo {
    pub index: usize,
    pub total: usize,
    pub item_variable: String,
}

/// Run metadata attached to a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub total_nodes: usize,
    pub current_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationInfo>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            retry_count: 0,
            total_nodes: 1,
            current_index: 0,
            iteration: None,
        }
    }
}

/// Environment handed to [`NodePlugin::execute`](crate::plugin::NodePlugin::execute)
#[derive(Clone)]
pub struct ExecutionContext {
    pub flow_id: String,
    pub node_id: NodeId,
    pub execution_id: String,
    pub input: Value,
    pub metadata: ExecutionMetadata,
    upstream: Arc<HashMap<NodeId, Value>>,
    logger: NodeLogger,
    events: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    extensions: Arc<ExecutorExtensions>,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    /// Create a standalone context with default services
    ///
    /// Events are discarded and the default configuration applies until the
    /// `with_*` builders replace them.
    pub fn new(flow_id: impl Into<String>, node_id: impl Into<NodeId>, input: Value) -> Self {
        let flow_id = flow_id.into();
        let node_id = node_id.into();
        let execution_id = uuid::Uuid::new_v4().to_string();
        Self {
            logger: scoped_logger(&flow_id, &node_id, &execution_id),
            flow_id,
            node_id,
            execution_id,
            input,
            metadata: ExecutionMetadata::default(),
            upstream: Arc::new(HashMap::new()),
            events: Arc::new(NullEventSink),
            config: Arc::new(EngineConfig::default()),
            extensions: Arc::new(ExecutorExtensions::new()),
            deadline: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self.logger = scoped_logger(&self.flow_id, &self.node_id, &self.execution_id);
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_iteration(mut self, iteration: IterationInfo) -> Self {
        self.metadata.iteration = Some(iteration);
        self
    }

    /// Outputs of nodes that already ran in this flow run
    pub fn with_upstream(mut self, upstream: Arc<HashMap<NodeId, Value>>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_extensions(mut self, extensions: Arc<ExecutorExtensions>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Point in time by which the node must finish
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when the node is unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Cooperative checkpoint for plugins that work item by item
    ///
    /// Yields to the runtime, then fails with [`NodeEngineError::Timeout`]
    /// once the deadline has passed.
    pub async fn checkpoint(&self) -> Result<(), NodeEngineError> {
        tokio::task::yield_now().await;
        if self.deadline_passed() {
            return Err(NodeEngineError::Timeout {
                node_id: self.node_id.clone(),
                timeout_ms: self.config.execution.node_timeout_ms,
            });
        }
        Ok(())
    }

    /// Logger carrying `flow`, `node` and `exec` context
    pub fn logger(&self) -> &NodeLogger {
        &self.logger
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn extensions(&self) -> &ExecutorExtensions {
        &self.extensions
    }

    pub fn upstream_output(&self, node_id: &str) -> Option<&Value> {
        self.upstream.get(node_id)
    }

    /// Publish an event; failures are logged, never returned
    pub fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.send(event) {
            self.logger.debug(&format!("event not delivered: {}", e));
        }
    }

    /// Resolve one reference against the input or upstream outputs
    pub fn resolve_reference(&self, reference: &VariableReference) -> Option<Value> {
        let root = if reference.node_id == INPUT_NODE_ID {
            &self.input
        } else {
            self.upstream.get(&reference.node_id)?
        };
        path::lookup(root, &reference.path).cloned()
    }

    /// Replace `{nodeId.path}` references in a template
    ///
    /// Strings are inserted raw, other values as compact JSON. References
    /// that do not resolve are left as written.
    pub fn substitute(&self, template: &str) -> String {
        let references = parse_references(template);
        if references.is_empty() {
            return template.to_string();
        }

        let mut out = String::with_capacity(template.len());
        let mut cursor = 0;
        for reference in references {
            out.push_str(&template[cursor..reference.start]);
            match self.resolve_reference(&reference) {
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    self.logger.debug(&format!("unresolved reference {}", reference.raw));
                    out.push_str(&reference.raw);
                }
            }
            cursor = reference.end;
        }
        out.push_str(&template[cursor..]);
        out
    }

    /// Apply [`substitute`](Self::substitute) through a whole value
    ///
    /// A string that is exactly one reference becomes the referenced value
    /// with its type preserved.
    pub fn substitute_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                let references = parse_references(trimmed);
                if let [only] = references.as_slice() {
                    if only.start == 0 && only.end == trimmed.len() {
                        if let Some(resolved) = self.resolve_reference(only) {
                            return resolved;
                        }
                    }
                }
                Value::String(self.substitute(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.substitute_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Expression limits taken from configuration
    ///
    /// The evaluation timeout never outlasts the node deadline.
    pub fn eval_limits(&self) -> EvalLimits {
        let configured = self.config.execution.expression_timeout();
        EvalLimits {
            max_steps: self.config.execution.expression_max_steps,
            timeout: self.remaining().map_or(configured, |left| left.min(configured)),
        }
    }

    /// Evaluate an expression with `input` bound to the current input
    ///
    /// Bare identifiers fall back to fields of the input.
    pub fn evaluate(&self, snippet: &str) -> Result<Value, ExpressionError> {
        self.evaluate_with(snippet, &[])
    }

    /// Evaluate with extra bindings, which shadow `input` and its fields
    pub fn evaluate_with(&self, snippet: &str, bindings: &[(&str, &Value)]) -> Result<Value, ExpressionError> {
        let scope = bindings
            .iter()
            .fold(Scope::new().bind(INPUT_NODE_ID, &self.input).with_fallback(&self.input), |scope, (name, value)| {
                scope.bind(name, value)
            });
        expression::evaluate(snippet, &scope, self.eval_limits())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("flow_id", &self.flow_id)
            .field("node_id", &self.node_id)
            .field("execution_id", &self.execution_id)
            .field("metadata", &self.metadata)
            .field("upstream", &self.upstream.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn scoped_logger(flow_id: &str, node_id: &str, execution_id: &str) -> NodeLogger {
    NodeLogger::new()
        .child("flow", flow_id)
        .child("node", node_id)
        .child("exec", execution_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, VecEventSink};
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut upstream = HashMap::new();
        upstream.insert("n1".to_string(), json!({"user": {"name": "Ada", "age": 36}, "tags": ["a", "b"]}));
        ExecutionContext::new("flow-1", "n2", json!({"value": 5, "city": "Paris"}))
            .with_upstream(Arc::new(upstream))
    }

    #[test]
    fn test_substitute_strings_and_json() {
        let ctx = context();
        assert_eq!(
            ctx.substitute("Hi {n1.user.name} ({n1.user.age}) from {input.city}: {n1.tags}"),
            r#"Hi Ada (36) from Paris: ["a","b"]"#
        );
    }

    #[test]
    fn test_unresolved_references_are_kept() {
        let ctx = context();
        assert_eq!(ctx.substitute("{n9.x} and {n1.user.email}"), "{n9.x} and {n1.user.email}");
        assert_eq!(ctx.substitute("no refs"), "no refs");
    }

    #[test]
    fn test_substitute_value_preserves_types() {
        let ctx = context();
        let data = json!({
            "age": "{n1.user.age}",
            "greeting": "Hello {n1.user.name}",
            "list": ["{n1.tags[1]}", 3],
        });
        assert_eq!(
            ctx.substitute_value(&data),
            json!({"age": 36, "greeting": "Hello Ada", "list": ["b", 3]})
        );
    }

    #[test]
    fn test_evaluate_scoped_to_input() {
        let ctx = context();
        assert_eq!(ctx.evaluate("input.value > 10").unwrap(), json!(false));
        assert_eq!(ctx.evaluate("value * 2").unwrap(), json!(10));

        let item = json!({"price": 3});
        assert_eq!(ctx.evaluate_with("item.price + value", &[("item", &item)]).unwrap(), json!(8));
    }

    #[test]
    fn test_expression_limits_follow_config() {
        let mut config = EngineConfig::default();
        config.execution.expression_max_steps = 3;
        let ctx = context().with_config(Arc::new(config));

        assert!(matches!(
            ctx.evaluate("1 + 2 + 3 + 4"),
            Err(ExpressionError::StepLimit(3))
        ));
    }

    #[test]
    fn test_emit_goes_to_sink() {
        let sink = Arc::new(VecEventSink::new());
        let ctx = context().with_events(sink.clone());
        ctx.emit(EngineEvent::RuntimeVariablesInvalidated { node_id: "n1".into() });
        assert_eq!(sink.count(EventKind::RuntimeVariablesInvalidated), 1);
    }

    #[test]
    fn test_logger_carries_identity() {
        let ctx = context().with_execution_id("exec-7");
        assert_eq!(ctx.logger().context(), "flow=flow-1 node=n2 exec=exec-7");
    }

    #[tokio::test]
    async fn test_deadline_bounds_evaluation_and_checkpoint() {
        let unbounded = context();
        assert!(unbounded.remaining().is_none());
        assert!(unbounded.checkpoint().await.is_ok());
        assert_eq!(unbounded.eval_limits().timeout, unbounded.config().execution.expression_timeout());

        let ctx = context().with_deadline(Instant::now() + Duration::from_millis(100));
        assert!(ctx.eval_limits().timeout <= Duration::from_millis(100));
        assert!(ctx.checkpoint().await.is_ok());

        let expired = context().with_deadline(Instant::now());
        assert!(expired.deadline_passed());
        assert!(matches!(
            expired.checkpoint().await,
            Err(NodeEngineError::Timeout { ref node_id, .. }) if node_id == "n2"
        ));
    }
}
