//! Condition
//!
//! Evaluates a boolean expression against the node input and selects the
//! `"true"` or `"false"` branch. Outgoing edges pick a branch through their
//! source handle.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use node_engine::expression::{truthy, validate_expression};
use node_engine::{
    ExecutionContext, NodePlugin, PluginCategory, PluginMetadata, RequiredConnections, Result,
    VariableDefinition, VariableType,
};
use serde_json::{json, Value};

use crate::common::{elapsed_ms, str_field};

/// Condition plugin
///
/// # Data
/// - `expression` (required) - e.g. `input.value > 10`
///
/// # Output
/// - `conditionResult`, `expression`, `evaluationTimeMs`, `input`
/// - `branchPath` - `"true"` or `"false"`
///
/// A failed evaluation takes the `"false"` branch and adds `error` and
/// `errorMessage`.
pub struct ConditionPlugin;

impl ConditionPlugin {
    pub const NODE_TYPE: &'static str = "condition";
    pub const BRANCH_TRUE: &'static str = "true";
    pub const BRANCH_FALSE: &'static str = "false";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }
}

inventory::submit!(node_engine::PluginFactoryFn(ConditionPlugin::factory));

#[async_trait]
impl NodePlugin for ConditionPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "Condition",
            "Routes the flow based on a boolean expression",
            "1.0.0",
            PluginCategory::Condition,
        )
        .with_icon("git-branch")
        .with_tags(&["logic", "branch", "if"])
    }

    fn create_default_data(&self) -> Value {
        json!({"expression": ""})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("conditionResult", VariableType::Boolean, "Result of the expression")
                .with_example(json!(true)),
            VariableDefinition::new("expression", VariableType::String, "The evaluated expression"),
            VariableDefinition::new("evaluationTimeMs", VariableType::Number, "Evaluation time in milliseconds"),
            VariableDefinition::new("branchPath", VariableType::String, "Branch taken")
                .with_example(json!("true")),
            VariableDefinition::new("input", VariableType::Any, "The node input, passed through"),
        ]
    }

    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let expression = str_field(data, "expression").unwrap_or_default();
        let started = Instant::now();
        let evaluated = ctx.evaluate(expression);
        let evaluation_time_ms = elapsed_ms(started);

        let output = match evaluated {
            Ok(value) => {
                let result = truthy(&value);
                ctx.logger().debug(&format!("'{}' evaluated to {}", expression, result));
                json!({
                    "conditionResult": result,
                    "expression": expression,
                    "evaluationTimeMs": evaluation_time_ms,
                    "branchPath": if result { Self::BRANCH_TRUE } else { Self::BRANCH_FALSE },
                    "input": input,
                })
            }
            Err(e) => {
                ctx.logger().warn(&format!("'{}' failed: {}", expression, e));
                json!({
                    "conditionResult": false,
                    "expression": expression,
                    "evaluationTimeMs": evaluation_time_ms,
                    "branchPath": Self::BRANCH_FALSE,
                    "input": input,
                    "error": true,
                    "errorMessage": e.to_string(),
                })
            }
        };
        Ok(output)
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        validate_expression(str_field(data, "expression").unwrap_or_default())
    }

    fn required_connections(&self) -> Option<RequiredConnections> {
        Some(RequiredConnections { inputs: 1, outputs: 2 })
    }
}
