//! Plugin registry
//!
//! Maps node type tags to their [`NodePlugin`] implementations and keeps a
//! bounded window of execution metrics per type. The registry is the only
//! owner of registrations: enabling, disabling and removal all go through
//! it.
//!
//! # Usage
//!
//! ```ignore
//! use node_engine::{PluginRegistry, VecEventSink};
//!
//! let registry = PluginRegistry::new(Arc::new(VecEventSink::new()), &Default::default());
//! registry.register(Arc::new(ConditionPlugin))?;
//! let plugin = registry.get("condition").unwrap();
//! ```
//!
//! Link-time built-ins are registered through
//! [`FlowEngine::register_builtins`](crate::engine::FlowEngine::register_builtins),
//! which also publishes their output schemas.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MetricsConfig;
use crate::descriptor::PluginMetadata;
use crate::error::RegistrationError;
use crate::events::{EngineEvent, EventSink};
use crate::plugin::NodePlugin;
use crate::types::PluginCategory;

/// One recorded execution of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Bytes of the JSON-encoded input
    pub input_size: usize,
    /// Bytes of the JSON-encoded output
    pub output_size: usize,
    pub success: bool,
}

impl ExecutionMetrics {
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        input: &Value,
        output: &Value,
        success: bool,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            started_at,
            finished_at,
            duration_ms,
            input_size: approximate_size(input),
            output_size: approximate_size(output),
            success,
        }
    }
}

/// Approximate size of a value as the length of its JSON encoding
pub fn approximate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// A registered plugin and its bookkeeping
#[derive(Clone)]
pub struct PluginRegistration {
    pub plugin: Arc<dyn NodePlugin>,
    pub metadata: PluginMetadata,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
    pub version: String,
}

impl std::fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("node_type", &self.metadata.node_type)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    registrations: HashMap<String, PluginRegistration>,
    metrics: HashMap<String, VecDeque<ExecutionMetrics>>,
}

/// Catalog of node type implementations
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    events: Arc<dyn EventSink>,
    metrics_window: usize,
}

impl PluginRegistry {
    pub fn new(events: Arc<dyn EventSink>, config: &MetricsConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            metrics_window: config.window.max(1),
        }
    }

    /// Check a plugin without registering it
    ///
    /// Returns every problem found; an empty list means the plugin is
    /// acceptable.
    pub fn check(plugin: &dyn NodePlugin) -> Vec<String> {
        let metadata = plugin.metadata();
        let mut problems = metadata.problems();

        if !plugin.create_default_data().is_object() {
            problems.push("default data is not an object".to_string());
        }

        let schema = plugin.output_schema();
        let mut seen = std::collections::HashSet::new();
        for def in &schema {
            if def.name.trim().is_empty() {
                problems.push("output schema has a variable with an empty name".to_string());
            } else if !seen.insert(def.name.as_str()) {
                problems.push(format!("output schema declares '{}' more than once", def.name));
            }
        }
        problems
    }

    /// Register a plugin, replacing any previous registration of its type
    ///
    /// Fails without touching the registry when the plugin is malformed.
    pub fn register(&self, plugin: Arc<dyn NodePlugin>) -> Result<(), RegistrationError> {
        let metadata = plugin.metadata();
        let problems = Self::check(plugin.as_ref());
        if !problems.is_empty() {
            log::warn!("PluginRegistry: rejected '{}': {}", metadata.node_type, problems.join("; "));
            return Err(RegistrationError {
                node_type: metadata.node_type,
                problems,
            });
        }

        let node_type = metadata.node_type.clone();
        let version = metadata.version.clone();
        let registration = PluginRegistration {
            plugin,
            version: version.clone(),
            metadata,
            enabled: true,
            loaded_at: Utc::now(),
        };

        let replaced = self.state.write().registrations.insert(node_type.clone(), registration);
        if let Some(old) = replaced {
            log::warn!(
                "PluginRegistry: '{}' re-registered, replacing version {} with {}",
                node_type,
                old.version,
                version
            );
            dispose_guarded(&node_type, old.plugin.as_ref());
        } else {
            log::debug!("PluginRegistry: registered '{}' v{}", node_type, version);
        }

        self.emit(EngineEvent::PluginRegistered { node_type, version });
        Ok(())
    }

    /// Remove and dispose a plugin
    ///
    /// Errors and panics from the plugin's dispose hook are logged and
    /// swallowed. Returns `false` if the type was not registered.
    pub fn unregister(&self, node_type: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            state.metrics.remove(node_type);
            state.registrations.remove(node_type)
        };
        let Some(registration) = removed else {
            return false;
        };

        dispose_guarded(node_type, registration.plugin.as_ref());
        log::debug!("PluginRegistry: unregistered '{}'", node_type);
        self.emit(EngineEvent::PluginUnregistered {
            node_type: node_type.to_string(),
        });
        true
    }

    /// Get a plugin if it is registered and enabled
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodePlugin>> {
        self.state
            .read()
            .registrations
            .get(node_type)
            .filter(|r| r.enabled)
            .map(|r| r.plugin.clone())
    }

    /// Registration details, enabled or not
    pub fn registration(&self, node_type: &str) -> Option<PluginRegistration> {
        self.state.read().registrations.get(node_type).cloned()
    }

    pub fn has_type(&self, node_type: &str) -> bool {
        self.state.read().registrations.contains_key(node_type)
    }

    pub fn is_enabled(&self, node_type: &str) -> bool {
        self.state
            .read()
            .registrations
            .get(node_type)
            .is_some_and(|r| r.enabled)
    }

    /// Toggle visibility, keeping the registration and its metrics
    ///
    /// Returns `false` for unknown types. An event is emitted only when the
    /// flag actually changes.
    pub fn set_enabled(&self, node_type: &str, enabled: bool) -> bool {
        let changed = {
            let mut state = self.state.write();
            let Some(registration) = state.registrations.get_mut(node_type) else {
                return false;
            };
            let changed = registration.enabled != enabled;
            registration.enabled = enabled;
            changed
        };

        if changed {
            log::debug!("PluginRegistry: '{}' enabled={}", node_type, enabled);
            self.emit(EngineEvent::PluginEnabledChanged {
                node_type: node_type.to_string(),
                enabled,
            });
        }
        true
    }

    /// All registered types, sorted
    pub fn all_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.state.read().registrations.keys().cloned().collect();
        types.sort();
        types
    }

    /// Enabled types, sorted
    pub fn enabled_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .state
            .read()
            .registrations
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.metadata.node_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Metadata of enabled plugins grouped by category
    pub fn by_category(&self) -> HashMap<PluginCategory, Vec<PluginMetadata>> {
        let mut groups: HashMap<PluginCategory, Vec<PluginMetadata>> = HashMap::new();
        for registration in self.state.read().registrations.values().filter(|r| r.enabled) {
            groups
                .entry(registration.metadata.category)
                .or_default()
                .push(registration.metadata.clone());
        }
        for list in groups.values_mut() {
            list.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.state.read().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an execution to the type's metrics window
    ///
    /// Returns `false` for unknown types.
    pub fn record_execution(&self, node_type: &str, metrics: ExecutionMetrics) -> bool {
        let mut state = self.state.write();
        if !state.registrations.contains_key(node_type) {
            return false;
        }
        let window = state.metrics.entry(node_type.to_string()).or_default();
        window.push_back(metrics);
        while window.len() > self.metrics_window {
            window.pop_front();
        }
        true
    }

    /// Recorded executions, oldest first
    pub fn execution_metrics(&self, node_type: &str) -> Vec<ExecutionMetrics> {
        self.state
            .read()
            .metrics
            .get(node_type)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mean duration over the metrics window
    pub fn average_duration_ms(&self, node_type: &str) -> Option<f64> {
        let state = self.state.read();
        let window = state.metrics.get(node_type).filter(|w| !w.is_empty())?;
        let total: u64 = window.iter().map(|m| m.duration_ms).sum();
        Some(total as f64 / window.len() as f64)
    }

    pub fn clear_metrics(&self, node_type: &str) {
        self.state.write().metrics.remove(node_type);
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("PluginRegistry: event not delivered: {}", e);
        }
    }
}

fn dispose_guarded(node_type: &str, plugin: &dyn NodePlugin) {
    match catch_unwind(AssertUnwindSafe(|| plugin.dispose())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("PluginRegistry: dispose of '{}' failed: {}", node_type, e),
        Err(_) => log::error!("PluginRegistry: dispose of '{}' panicked", node_type),
    }
}
