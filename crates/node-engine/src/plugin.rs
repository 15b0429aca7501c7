//! The node plugin contract
//!
//! Every node type is backed by one [`NodePlugin`] implementation. The
//! trait makes the required capabilities (metadata, default data, execute,
//! output schema) mandatory; validation, connection hints and disposal
//! have defaults.
//!
//! Built-in plugins announce themselves at link time:
//!
//! ```ignore
//! inventory::submit!(node_engine::PluginFactoryFn(ConditionPlugin::factory));
//! ```
//!
//! and [`FlowEngine::register_builtins`](crate::engine::FlowEngine::register_builtins)
//! picks them all up.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::descriptor::{PluginMetadata, RequiredConnections, VariableDefinition};
use crate::error::Result;

/// Executable implementation of one node type
#[async_trait]
pub trait NodePlugin: Send + Sync {
    /// Registry metadata; `node_type` is the registry key
    fn metadata(&self) -> PluginMetadata;

    /// Fresh configuration payload for a new node of this type
    ///
    /// Must be a JSON object.
    fn create_default_data(&self) -> Value;

    /// Fields this node type promises to produce
    fn output_schema(&self) -> Vec<VariableDefinition>;

    /// Run the node
    ///
    /// Failures the flow can react to (bad expression, failed request) are
    /// returned as data in the output object. `Err` is reserved for contract
    /// violations and for failures the node must not hide.
    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value>;

    /// Check a configuration payload; every problem is reported
    fn validate_data(&self, _data: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Expected port counts, if the node type has fixed ones
    fn required_connections(&self) -> Option<RequiredConnections> {
        None
    }

    /// Release resources when the plugin is unregistered
    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Link-time registration of a plugin
///
/// Holds a function pointer so the factory is usable in `inventory::submit!`.
pub struct PluginFactoryFn(pub fn() -> Arc<dyn NodePlugin>);

inventory::collect!(PluginFactoryFn);

/// Iterate over every plugin factory linked into the binary
pub fn linked_factories() -> impl Iterator<Item = &'static PluginFactoryFn> {
    inventory::iter::<PluginFactoryFn>.into_iter()
}
