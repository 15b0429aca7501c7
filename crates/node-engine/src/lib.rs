//! Node Engine - plugin execution and variable resolution for automation flows
//!
//! This crate runs node-graph automation flows built from pluggable node
//! types. It supports:
//!
//! - A plugin registry with link-time discovery of built-in node types
//! - Static output schemas plus runtime variables extracted from real output
//! - `{nodeId.path}` variable references, validated against what is reachable
//! - A small sandboxed expression language for conditions and mappings
//! - An event bus with isolated, asynchronous delivery
//!
//! # Architecture
//!
//! - `PluginRegistry`: node types, enablement and execution metrics
//! - `VariableRegistry`: static schemas and runtime catalogs per node
//! - `ExecutionContext`: what a node sees while it runs
//! - `FlowEngine`: validates a graph and executes it in topological order
//!
//! # Example
//!
//! ```ignore
//! use node_engine::{FlowEngine, FlowGraph, GraphNode};
//!
//! let engine = FlowEngine::builder().with_builtins().build();
//! let graph = FlowGraph::new("flow-1", "Demo")
//!     .with_node(GraphNode::new("start", "manual-trigger", serde_json::json!({})));
//! let report = engine.run(&graph, serde_json::json!({"value": 5})).await?;
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod extensions;
pub mod extractor;
pub mod logging;
pub mod path;
pub mod plugin;
pub mod plugin_registry;
pub mod references;
pub mod types;
pub mod validation;
pub mod variable_registry;

// Re-export key types
pub use config::{ConfigError, EngineConfig};
pub use context::{ExecutionContext, ExecutionMetadata, IterationInfo, INPUT_NODE_ID};
pub use descriptor::{PluginMetadata, RequiredConnections, VariableDefinition};
pub use engine::{FlowEngine, FlowEngineBuilder, FlowRunReport};
pub use error::{NodeEngineError, RegistrationError, Result};
pub use events::{EngineEvent, EventBus, EventError, EventKind, EventSink, NullEventSink, VecEventSink};
pub use expression::ExpressionError;
pub use extensions::{extension_keys, ExecutorExtensions};
pub use extractor::{NestedVariableExtractor, RuntimeVariable};
pub use logging::NodeLogger;
pub use plugin::{NodePlugin, PluginFactoryFn};
pub use plugin_registry::{ExecutionMetrics, PluginRegistration, PluginRegistry};
pub use references::{parse_references, ReferenceValidation, VariableReference};
pub use types::{FlowGraph, GraphEdge, GraphNode, NodeId, PluginCategory, VariableType};
pub use validation::{validate_flow, ValidationError};
pub use variable_registry::{AvailableVariable, VariableRegistry};
