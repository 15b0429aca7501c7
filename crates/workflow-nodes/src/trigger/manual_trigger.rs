//! Manual Trigger
//!
//! Entry point of a flow. Emits the flow input, layered over an optional
//! configured payload, and stamps when and how the flow was triggered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use node_engine::{
    ExecutionContext, NodePlugin, PluginCategory, PluginMetadata, RequiredConnections, Result,
    VariableDefinition, VariableType,
};
use serde_json::{json, Map, Value};

/// Manual Trigger plugin
///
/// # Data
/// - `payload` (optional) - object of default fields; input fields win
///
/// # Output
/// Every payload and input field, plus `triggeredAt` and `triggerType`.
pub struct ManualTriggerPlugin;

impl ManualTriggerPlugin {
    pub const NODE_TYPE: &'static str = "manual-trigger";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }
}

inventory::submit!(node_engine::PluginFactoryFn(ManualTriggerPlugin::factory));

#[async_trait]
impl NodePlugin for ManualTriggerPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "Manual Trigger",
            "Starts a flow with the provided input",
            "1.0.0",
            PluginCategory::Trigger,
        )
        .with_icon("play")
        .with_tags(&["trigger", "start"])
    }

    fn create_default_data(&self) -> Value {
        json!({"payload": {}})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("triggeredAt", VariableType::String, "When the flow was triggered")
                .with_example(json!("2024-01-01T12:00:00Z")),
            VariableDefinition::new("triggerType", VariableType::String, "How the flow was triggered")
                .with_example(json!("manual")),
        ]
    }

    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let mut fields = match data.get("payload") {
            Some(Value::Object(payload)) => payload.clone(),
            _ => Map::new(),
        };
        match input {
            Value::Object(input) => fields.extend(input),
            Value::Null => {}
            other => {
                fields.insert("value".to_string(), other);
            }
        }
        fields.insert("triggeredAt".to_string(), json!(Utc::now().to_rfc3339()));
        fields.insert("triggerType".to_string(), json!("manual"));

        ctx.logger().debug(&format!("triggered with {} fields", fields.len()));
        Ok(Value::Object(fields))
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        match data.get("payload") {
            None | Some(Value::Null) | Some(Value::Object(_)) => Vec::new(),
            Some(_) => vec!["payload must be an object".to_string()],
        }
    }

    fn required_connections(&self) -> Option<RequiredConnections> {
        Some(RequiredConnections { inputs: 0, outputs: 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_input_overrides_payload() {
        let ctx = ExecutionContext::new("f", "t", json!({}));
        let data = json!({"payload": {"a": 1, "b": 2}});
        let out = ManualTriggerPlugin
            .execute(json!({"b": 3}), &data, &ctx)
            .await
            .unwrap();

        assert_eq!(out["a"], 1);
        assert_eq!(out["b"], 3);
        assert_eq!(out["triggerType"], "manual");
        assert!(out["triggeredAt"].is_string());
    }

    #[tokio::test]
    async fn test_scalar_input_goes_under_value() {
        let ctx = ExecutionContext::new("f", "t", json!(7));
        let out = ManualTriggerPlugin.execute(json!(7), &json!({}), &ctx).await.unwrap();
        assert_eq!(out["value"], 7);
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(ManualTriggerPlugin.validate_data(&json!({"payload": {}})).is_empty());
        assert_eq!(
            ManualTriggerPlugin.validate_data(&json!({"payload": [1]})),
            vec!["payload must be an object"]
        );
    }
}
