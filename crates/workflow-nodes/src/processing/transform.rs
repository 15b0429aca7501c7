//! Transform
//!
//! Reshapes the node input. One node performs one kind of transform,
//! selected by `transformType`:
//!
//! - `extract` - pull the value at `path` out of the input
//! - `format` - render `template`, substituting `{nodeId.path}` references
//! - `parse` - parse the JSON text at `path` (or the input itself)
//! - `filter` - keep the items of the array at `path` for which `condition`
//!   holds, with `item` and `index` bound
//! - `custom` - evaluate `expression`

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use node_engine::expression::{truthy, validate_expression};
use node_engine::path;
use node_engine::plugin_registry::approximate_size;
use node_engine::{
    ExecutionContext, NodePlugin, PluginCategory, PluginMetadata, Result, VariableDefinition,
    VariableType,
};
use serde_json::{json, Value};

use crate::common::{elapsed_ms, str_field};

/// Supported transform kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    Extract,
    Format,
    Parse,
    Filter,
    Custom,
}

impl TransformType {
    pub const ALL: [TransformType; 5] = [
        Self::Extract,
        Self::Format,
        Self::Parse,
        Self::Filter,
        Self::Custom,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Format => "format",
            Self::Parse => "parse",
            Self::Filter => "filter",
            Self::Custom => "custom",
        }
    }

    /// Data field that must be present for this kind
    fn required_field(&self) -> Option<&'static str> {
        match self {
            Self::Extract => Some("path"),
            Self::Format => Some("template"),
            Self::Parse => None,
            Self::Filter => Some("condition"),
            Self::Custom => Some("expression"),
        }
    }
}

/// Transform plugin
pub struct TransformPlugin;

impl TransformPlugin {
    pub const NODE_TYPE: &'static str = "transform";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }

    async fn transform(
        &self,
        kind: TransformType,
        input: &Value,
        data: &Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, String> {
        match kind {
            TransformType::Extract => {
                let target = str_field(data, "path").unwrap_or_default();
                path::lookup(input, target)
                    .cloned()
                    .ok_or_else(|| format!("Path '{}' not found in input", target))
            }
            TransformType::Format => {
                let template = data.get("template").and_then(Value::as_str).unwrap_or_default();
                Ok(Value::String(ctx.substitute(template)))
            }
            TransformType::Parse => {
                let text = source_value(input, data)?;
                let Value::String(text) = text else {
                    return Err(format!("Expected a string to parse, got {}", type_label(text)));
                };
                serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {}", e))
            }
            TransformType::Filter => {
                let items = source_value(input, data)?;
                let Value::Array(items) = items else {
                    return Err(format!("Expected an array to filter, got {}", type_label(items)));
                };
                let limit = ctx.config().execution.max_loop_iterations;
                if items.len() > limit {
                    return Err(format!("Cannot filter {} items (limit is {})", items.len(), limit));
                }
                let condition = str_field(data, "condition").unwrap_or_default();
                let mut kept = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    ctx.checkpoint().await.map_err(|e| e.to_string())?;
                    let index_value = json!(index);
                    let verdict = ctx
                        .evaluate_with(condition, &[("item", item), ("index", &index_value)])
                        .map_err(|e| format!("item {}: {}", index, e))?;
                    if truthy(&verdict) {
                        kept.push(item.clone());
                    }
                }
                Ok(Value::Array(kept))
            }
            TransformType::Custom => {
                let expression = str_field(data, "expression").unwrap_or_default();
                ctx.evaluate(expression).map_err(|e| e.to_string())
            }
        }
    }
}

inventory::submit!(node_engine::PluginFactoryFn(TransformPlugin::factory));

/// The value at `path`, or the whole input when no path is set
fn source_value<'a>(input: &'a Value, data: &Value) -> std::result::Result<&'a Value, String> {
    match str_field(data, "path") {
        Some(target) => path::lookup(input, target).ok_or_else(|| format!("Path '{}' not found in input", target)),
        None => Ok(input),
    }
}

fn type_label(value: &Value) -> &'static str {
    VariableType::of(value).as_str()
}

#[async_trait]
impl NodePlugin for TransformPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "Transform",
            "Extracts, formats, parses, filters or computes data",
            "1.0.0",
            PluginCategory::Transform,
        )
        .with_icon("shuffle")
        .with_tags(&["data", "json", "map"])
    }

    fn create_default_data(&self) -> Value {
        json!({"transformType": "extract", "path": ""})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("result", VariableType::Any, "Transformed value, null on failure"),
            VariableDefinition::new("transformType", VariableType::String, "Kind of transform applied")
                .with_example(json!("extract")),
            VariableDefinition::new("transformSuccess", VariableType::Boolean, "Whether the transform succeeded"),
            VariableDefinition::new("inputSize", VariableType::Number, "Approximate input size in bytes"),
            VariableDefinition::new("outputSize", VariableType::Number, "Approximate result size in bytes"),
            VariableDefinition::new("transformTimeMs", VariableType::Number, "Transform time in milliseconds"),
        ]
    }

    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let tag = str_field(data, "transformType").unwrap_or_default();
        let started = Instant::now();

        let outcome = match TransformType::from_tag(tag) {
            Some(kind) => self.transform(kind, &input, data, ctx).await,
            None => Err(format!("Unknown transform type '{}'", tag)),
        };

        let input_size = approximate_size(&input);
        let output = match outcome {
            Ok(result) => {
                ctx.logger().debug(&format!("{} transform succeeded", tag));
                json!({
                    "transformType": tag,
                    "transformSuccess": true,
                    "inputSize": input_size,
                    "outputSize": approximate_size(&result),
                    "transformTimeMs": elapsed_ms(started),
                    "result": result,
                })
            }
            Err(message) => {
                ctx.logger().warn(&format!("{} transform failed: {}", tag, message));
                json!({
                    "transformType": tag,
                    "transformSuccess": false,
                    "inputSize": input_size,
                    "outputSize": 0,
                    "transformTimeMs": elapsed_ms(started),
                    "result": null,
                    "error": true,
                    "errorMessage": message,
                })
            }
        };
        Ok(output)
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        let Some(tag) = str_field(data, "transformType") else {
            return vec!["transformType is required".to_string()];
        };
        let Some(kind) = TransformType::from_tag(tag) else {
            let known: Vec<&str> = TransformType::ALL.iter().map(TransformType::as_str).collect();
            return vec![format!("Unknown transform type '{}' (expected one of: {})", tag, known.join(", "))];
        };

        let mut problems = Vec::new();
        if let Some(field) = kind.required_field() {
            if str_field(data, field).is_none() {
                problems.push(format!("{} is required for {} transforms", field, tag));
            }
        }
        if let Some(target) = str_field(data, "path") {
            if path::parse_path(target).is_none() {
                problems.push(format!("Invalid path '{}'", target));
            }
        }
        for field in ["condition", "expression"] {
            if let Some(expression) = str_field(data, field) {
                problems.extend(validate_expression(expression));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::EngineConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn run(data: Value, input: Value) -> Value {
        let ctx = ExecutionContext::new("f", "tx", input.clone());
        TransformPlugin.execute(input, &data, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_extract() {
        let out = run(
            json!({"transformType": "extract", "path": "user.tags[1]"}),
            json!({"user": {"tags": ["a", "b"]}}),
        )
        .await;
        assert_eq!(out["result"], "b");
        assert_eq!(out["transformSuccess"], true);
        assert_eq!(out["outputSize"], 3);
    }

    #[tokio::test]
    async fn test_extract_missing_path_fails_as_data() {
        let out = run(json!({"transformType": "extract", "path": "nope"}), json!({})).await;
        assert_eq!(out["transformSuccess"], false);
        assert_eq!(out["result"], Value::Null);
        assert_eq!(out["errorMessage"], "Path 'nope' not found in input");
    }

    #[tokio::test]
    async fn test_format_substitutes_references() {
        let mut upstream = HashMap::new();
        upstream.insert("http".to_string(), json!({"data": {"name": "Ada"}}));
        let input = json!({"greeting": "Hello"});
        let ctx = ExecutionContext::new("f", "tx", input.clone()).with_upstream(Arc::new(upstream));

        let out = TransformPlugin
            .execute(input, &json!({"transformType": "format", "template": "{input.greeting}, {http.data.name}!"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["result"], "Hello, Ada!");
    }

    #[tokio::test]
    async fn test_parse() {
        let out = run(json!({"transformType": "parse", "path": "body"}), json!({"body": "{\"ok\":true}"})).await;
        assert_eq!(out["result"], json!({"ok": true}));

        let bad = run(json!({"transformType": "parse", "path": "body"}), json!({"body": "{oops"})).await;
        assert_eq!(bad["transformSuccess"], false);
        assert!(bad["errorMessage"].as_str().unwrap().starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn test_filter() {
        let out = run(
            json!({"transformType": "filter", "path": "scores", "condition": "item >= 50 && index != 0"}),
            json!({"scores": [90, 20, 75, 50]}),
        )
        .await;
        assert_eq!(out["result"], json!([75, 50]));
    }

    #[tokio::test]
    async fn test_filter_respects_iteration_limit() {
        let mut config = EngineConfig::default();
        config.execution.max_loop_iterations = 3;
        let input = json!({"scores": [1, 2, 3, 4]});
        let ctx = ExecutionContext::new("f", "tx", input.clone()).with_config(Arc::new(config));

        let out = TransformPlugin
            .execute(input, &json!({"transformType": "filter", "path": "scores", "condition": "true"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["transformSuccess"], false);
        assert_eq!(out["errorMessage"], "Cannot filter 4 items (limit is 3)");
    }

    #[tokio::test]
    async fn test_filter_stops_at_node_deadline() {
        let items: Vec<Value> = (0..3000).map(|i| json!(i)).collect();
        let condition = vec!["item >= 0"; 200].join(" && ");
        let input = json!({"items": items});
        let mut config = EngineConfig::default();
        config.execution.max_loop_iterations = 5000;
        let ctx = ExecutionContext::new("f", "tx", input.clone())
            .with_config(Arc::new(config))
            .with_deadline(Instant::now() + Duration::from_millis(50));

        let started = Instant::now();
        let out = TransformPlugin
            .execute(input, &json!({"transformType": "filter", "path": "items", "condition": condition}), &ctx)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(out["transformSuccess"], false);
        assert!(out["errorMessage"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_custom() {
        let out = run(
            json!({"transformType": "custom", "expression": "upper(first) + ' ' + len(items)"}),
            json!({"first": "ada", "items": [1, 2, 3]}),
        )
        .await;
        assert_eq!(out["result"], "ADA 3");
        assert_eq!(out["transformType"], "custom");
    }

    #[tokio::test]
    async fn test_unknown_type_is_data() {
        let out = run(json!({"transformType": "zip"}), json!({})).await;
        assert_eq!(out["transformSuccess"], false);
        assert_eq!(out["errorMessage"], "Unknown transform type 'zip'");
    }

    #[test]
    fn test_validation() {
        assert!(TransformPlugin
            .validate_data(&json!({"transformType": "extract", "path": "a.b"}))
            .is_empty());
        assert_eq!(
            TransformPlugin.validate_data(&json!({"transformType": "extract"})),
            vec!["path is required for extract transforms"]
        );
        assert_eq!(
            TransformPlugin.validate_data(&json!({"transformType": "custom", "expression": "process.exit()"})),
            vec!["Expression contains forbidden identifier 'process'"]
        );
        assert_eq!(
            TransformPlugin.validate_data(&json!({})),
            vec!["transformType is required"]
        );
        assert_eq!(TransformPlugin.validate_data(&json!({"transformType": "zip"})).len(), 1);
    }
}
