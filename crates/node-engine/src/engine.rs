//! Flow executor
//!
//! [`FlowEngine`] ties the registries and the event bus together and runs a
//! [`FlowGraph`] once, node by node, in topological order.
//!
//! # Key Concepts
//!
//! - **Validation first**: any structural or data problem aborts the run
//!   before a single node executes
//! - **Branch routing**: an edge with a source handle is followed only when
//!   the handle equals the source output's `branchPath` / `outputPath`
//! - **Failures as data**: node timeouts become error fields in the output;
//!   only `Err` results are retried and, once retries run out, stop the run

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, ExecutionMetadata};
use crate::error::{NodeEngineError, RegistrationError, Result};
use crate::events::{EngineEvent, EventBus, EventSink};
use crate::extensions::ExecutorExtensions;
use crate::plugin::{linked_factories, NodePlugin};
use crate::plugin_registry::{ExecutionMetrics, PluginRegistry};
use crate::types::{FlowGraph, GraphNode, NodeId};
use crate::validation::{topological_order, validate_flow, ValidationError};
use crate::variable_registry::VariableRegistry;

/// Output fields that select a branch, in lookup order
pub const BRANCH_FIELDS: [&str; 2] = ["branchPath", "outputPath"];

/// Outcome of one [`FlowEngine::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRunReport {
    pub flow_id: String,
    pub execution_id: String,
    pub success: bool,
    /// Output of every node that completed, keyed by node id
    pub outputs: HashMap<NodeId, Value>,
    /// Completed nodes in execution order
    pub executed: Vec<NodeId>,
    /// Nodes on branches that were not taken
    pub skipped: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl FlowRunReport {
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }
}

/// Builder for [`FlowEngine`]
#[derive(Default)]
pub struct FlowEngineBuilder {
    config: EngineConfig,
    extensions: ExecutorExtensions,
    builtins: bool,
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Host services handed to every node through its context
    pub fn extensions(mut self, extensions: ExecutorExtensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Register every linked built-in plugin on build
    pub fn with_builtins(mut self) -> Self {
        self.builtins = true;
        self
    }

    pub fn build(self) -> FlowEngine {
        let events = Arc::new(EventBus::new(self.config.events.channel_capacity));
        let sink: Arc<dyn EventSink> = events.clone();
        let engine = FlowEngine {
            plugins: Arc::new(PluginRegistry::new(sink.clone(), &self.config.metrics)),
            variables: Arc::new(VariableRegistry::new(sink, &self.config)),
            config: Arc::new(self.config),
            extensions: Arc::new(self.extensions),
            events,
        };
        if self.builtins {
            let count = engine.register_builtins();
            log::info!("FlowEngine: registered {} built-in plugins", count);
        }
        engine
    }
}

/// Runs flow graphs against a plugin registry
pub struct FlowEngine {
    config: Arc<EngineConfig>,
    extensions: Arc<ExecutorExtensions>,
    events: Arc<EventBus>,
    plugins: Arc<PluginRegistry>,
    variables: Arc<VariableRegistry>,
}

/// How a single node invocation ended
enum NodeOutcome {
    Completed { output: Value, success: bool },
    Failed(NodeEngineError),
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    pub fn new(config: EngineConfig) -> Self {
        FlowEngineBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn variables(&self) -> &Arc<VariableRegistry> {
        &self.variables
    }

    /// Register a plugin and publish its output schema
    pub fn register_plugin(&self, plugin: Arc<dyn NodePlugin>) -> std::result::Result<(), RegistrationError> {
        let node_type = plugin.metadata().node_type;
        let schema = plugin.output_schema();
        self.plugins.register(plugin)?;
        self.variables.register_schema(&node_type, schema);
        Ok(())
    }

    /// Register every plugin submitted through `inventory`
    pub fn register_builtins(&self) -> usize {
        linked_factories()
            .filter(|factory| match self.register_plugin((factory.0)()) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("FlowEngine: built-in plugin rejected: {}", e);
                    false
                }
            })
            .count()
    }

    pub fn unregister_plugin(&self, node_type: &str) -> bool {
        self.plugins.unregister(node_type)
    }

    /// Drop every runtime variable recorded by earlier runs
    pub fn reset(&self) -> usize {
        self.variables.clear_all_runtime()
    }

    /// Validate and execute a flow once
    ///
    /// Returns `Err` only when the graph is rejected before execution. A
    /// node failure during the run is reported through
    /// [`FlowRunReport::success`] and [`FlowRunReport::error`].
    pub async fn run(&self, graph: &FlowGraph, input: Value) -> Result<FlowRunReport> {
        let problems = validate_flow(graph, Some(&self.plugins));
        if !problems.is_empty() {
            log::warn!("FlowEngine: flow '{}' rejected with {} problems", graph.id, problems.len());
            if problems.iter().all(|p| *p == ValidationError::CycleDetected) {
                return Err(NodeEngineError::CycleDetected);
            }
            return Err(NodeEngineError::InvalidFlow(
                problems.iter().map(ToString::to_string).collect(),
            ));
        }
        let order = topological_order(graph).ok_or(NodeEngineError::CycleDetected)?;

        let started = Instant::now();
        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut report = FlowRunReport {
            flow_id: graph.id.clone(),
            execution_id: execution_id.clone(),
            success: true,
            outputs: HashMap::new(),
            executed: Vec::new(),
            skipped: Vec::new(),
            failed_node: None,
            error: None,
            duration_ms: 0,
        };

        log::info!("FlowEngine: starting flow '{}' ({} nodes, exec {})", graph.id, order.len(), execution_id);
        self.emit(EngineEvent::FlowStarted {
            flow_id: graph.id.clone(),
            execution_id: execution_id.clone(),
            node_count: order.len(),
        });

        let mut outputs: Arc<HashMap<NodeId, Value>> = Arc::new(HashMap::new());
        for (index, node_id) in order.iter().enumerate() {
            let Some(node) = graph.find_node(node_id) else {
                return Err(NodeEngineError::NodeNotFound(node_id.clone()));
            };

            let Some(node_input) = gather_input(graph, node_id, &outputs, &input) else {
                log::debug!("FlowEngine: skipping '{}' (branch not taken)", node_id);
                report.skipped.push(node_id.clone());
                self.emit(EngineEvent::NodeSkipped {
                    flow_id: graph.id.clone(),
                    execution_id: execution_id.clone(),
                    node_id: node_id.clone(),
                });
                continue;
            };

            self.emit(EngineEvent::NodeStarted {
                flow_id: graph.id.clone(),
                execution_id: execution_id.clone(),
                node_id: node_id.clone(),
                node_type: node.node_type.clone(),
            });

            let node_started = Instant::now();
            let started_at = Utc::now();
            let outcome = self
                .execute_node(graph, node, node_input.clone(), &execution_id, index, order.len(), &outputs)
                .await;
            let duration_ms = node_started.elapsed().as_millis() as u64;

            match outcome {
                NodeOutcome::Completed { output, success } => {
                    self.plugins.record_execution(
                        &node.node_type,
                        ExecutionMetrics::new(started_at, Utc::now(), &node_input, &output, success),
                    );
                    self.variables.register_runtime(node_id, &output);
                    self.emit(EngineEvent::NodeCompleted {
                        flow_id: graph.id.clone(),
                        execution_id: execution_id.clone(),
                        node_id: node_id.clone(),
                        duration_ms,
                        output: output.clone(),
                    });
                    report.executed.push(node_id.clone());
                    report.outputs.insert(node_id.clone(), output.clone());
                    Arc::make_mut(&mut outputs).insert(node_id.clone(), output);
                }
                NodeOutcome::Failed(error) => {
                    self.plugins.record_execution(
                        &node.node_type,
                        ExecutionMetrics::new(started_at, Utc::now(), &node_input, &Value::Null, false),
                    );
                    let message = error.to_string();
                    log::error!("FlowEngine: node '{}' failed: {}", node_id, message);
                    self.emit(EngineEvent::NodeFailed {
                        flow_id: graph.id.clone(),
                        execution_id: execution_id.clone(),
                        node_id: node_id.clone(),
                        error: message.clone(),
                    });
                    self.emit(EngineEvent::FlowFailed {
                        flow_id: graph.id.clone(),
                        execution_id: execution_id.clone(),
                        error: message.clone(),
                    });
                    report.success = false;
                    report.failed_node = Some(node_id.clone());
                    report.error = Some(message);
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    return Ok(report);
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "FlowEngine: flow '{}' completed in {}ms ({} executed, {} skipped)",
            graph.id,
            report.duration_ms,
            report.executed.len(),
            report.skipped.len()
        );
        self.emit(EngineEvent::FlowCompleted {
            flow_id: graph.id.clone(),
            execution_id,
            duration_ms: report.duration_ms,
        });
        Ok(report)
    }

    /// Run one node with timeout and retries
    #[allow(clippy::too_many_arguments)]
    async fn execute_node(
        &self,
        graph: &FlowGraph,
        node: &GraphNode,
        input: Value,
        execution_id: &str,
        index: usize,
        total: usize,
        upstream: &Arc<HashMap<NodeId, Value>>,
    ) -> NodeOutcome {
        let Some(plugin) = self.plugins.get(&node.node_type) else {
            let error = if self.plugins.has_type(&node.node_type) {
                NodeEngineError::PluginDisabled(node.node_type.clone())
            } else {
                NodeEngineError::UnknownPlugin(node.node_type.clone())
            };
            return NodeOutcome::Failed(error);
        };

        let timeout = self.config.execution.node_timeout();
        let max_retries = self.config.execution.max_retries;
        let events: Arc<dyn EventSink> = self.events.clone();
        let mut attempt = 0;
        loop {
            let ctx = ExecutionContext::new(graph.id.clone(), node.id.clone(), input.clone())
                .with_execution_id(execution_id)
                .with_metadata(ExecutionMetadata {
                    timestamp: Utc::now(),
                    retry_count: attempt,
                    total_nodes: total,
                    current_index: index,
                    iteration: None,
                })
                .with_upstream(upstream.clone())
                .with_events(events.clone())
                .with_config(self.config.clone())
                .with_extensions(self.extensions.clone())
                .with_deadline(Instant::now() + timeout);

            match tokio::time::timeout(timeout, plugin.execute(input.clone(), &node.data, &ctx)).await {
                // Synchronous work can overrun without ever yielding
                Ok(Ok(output)) if ctx.deadline_passed() => {
                    return self.timed_out(node, &ctx, output);
                }
                Ok(Ok(output)) => {
                    let success = !is_error_output(&output);
                    return NodeOutcome::Completed { output, success };
                }
                Ok(Err(NodeEngineError::Timeout { .. })) | Err(_) => {
                    return self.timed_out(node, &ctx, json!({}));
                }
                Ok(Err(e)) if attempt < max_retries => {
                    attempt += 1;
                    ctx.logger()
                        .warn(&format!("attempt failed, retrying ({}/{}): {}", attempt, max_retries, e));
                }
                Ok(Err(e)) => return NodeOutcome::Failed(e),
            }
        }
    }

    /// Timeout reported as error data, keeping any partial output fields
    fn timed_out(&self, node: &GraphNode, ctx: &ExecutionContext, partial: Value) -> NodeOutcome {
        let error = NodeEngineError::Timeout {
            node_id: node.id.clone(),
            timeout_ms: self.config.execution.node_timeout_ms,
        };
        ctx.logger().warn(&error.to_string());

        let mut output = match partial {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        output.insert("error".to_string(), Value::Bool(true));
        output.insert("errorMessage".to_string(), Value::String(error.to_string()));
        output.insert("timedOut".to_string(), Value::Bool(true));
        NodeOutcome::Completed {
            output: Value::Object(output),
            success: false,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.publish(event) {
            log::debug!("FlowEngine: event not delivered: {}", e);
        }
    }
}

/// The branch a node output selected, if any
pub fn branch_of(output: &Value) -> Option<&str> {
    BRANCH_FIELDS
        .iter()
        .find_map(|field| output.get(field).and_then(Value::as_str))
}

fn is_error_output(output: &Value) -> bool {
    output.get("error").is_some_and(|e| e == &Value::Bool(true))
        || output.get("success") == Some(&Value::Bool(false))
}

/// Build a node's input from its active incoming edges
///
/// Nodes without incoming edges receive the flow input. Returns `None` when
/// the node has predecessors but no edge into it was activated.
fn gather_input(
    graph: &FlowGraph,
    node_id: &str,
    outputs: &HashMap<NodeId, Value>,
    flow_input: &Value,
) -> Option<Value> {
    let incoming: Vec<_> = graph.incoming_edges(node_id).collect();
    if incoming.is_empty() {
        return Some(flow_input.clone());
    }

    let mut seen = HashSet::new();
    let active: Vec<(&str, &Value)> = incoming
        .iter()
        .filter_map(|edge| {
            let output = outputs.get(&edge.source)?;
            let followed = match (&edge.source_handle, branch_of(output)) {
                (Some(handle), Some(branch)) => handle == branch,
                _ => true,
            };
            (followed && seen.insert(edge.source.as_str())).then_some((edge.source.as_str(), output))
        })
        .collect();

    match active.as_slice() {
        [] => None,
        [(_, output)] if output.is_object() => Some((*output).clone()),
        sources => {
            let mut merged = Map::new();
            for (source, output) in sources {
                match output {
                    Value::Object(fields) => merged.extend(fields.clone()),
                    other => {
                        merged.insert((*source).to_string(), (*other).clone());
                    }
                }
            }
            Some(Value::Object(merged))
        }
    }
}
