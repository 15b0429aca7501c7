//! Loop
//!
//! Iterates over an array taken from the node input, optionally mapping
//! every item through an expression. Iteration is capped by the node's
//! `maxIterations` and by the engine-wide loop limit.

use std::sync::Arc;

use async_trait::async_trait;
use node_engine::expression::{validate_expression, BLOCKED_IDENTIFIERS};
use node_engine::{
    ExecutionContext, IterationInfo, NodePlugin, PluginCategory, PluginMetadata, Result,
    VariableDefinition, VariableType, INPUT_NODE_ID,
};
use serde_json::{json, Value};

use crate::common::{error_fields, positive_int_field, str_field, with_fields};

/// Loop plugin
///
/// # Data
/// - `source` - expression yielding the array (default `items`)
/// - `itemVariable` - name the current item is bound to (default `item`)
/// - `mapExpression` (optional) - evaluated per item, with `index` bound
/// - `maxIterations` (optional) - lowered to the configured maximum
///
/// # Output
/// `items`, `results`, `iterations`, `totalItems`, `truncated`,
/// `itemVariable`. Evaluation failures stop the loop and add `error` and
/// `errorMessage`, keeping the results gathered so far.
pub struct LoopPlugin;

impl LoopPlugin {
    pub const NODE_TYPE: &'static str = "loop";
    pub const DEFAULT_SOURCE: &'static str = "items";
    pub const DEFAULT_ITEM_VARIABLE: &'static str = "item";
    pub const INDEX_VARIABLE: &'static str = "index";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }
}

inventory::submit!(node_engine::PluginFactoryFn(LoopPlugin::factory));

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[async_trait]
impl NodePlugin for LoopPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "Loop",
            "Iterates over an array, optionally mapping each item",
            "1.0.0",
            PluginCategory::Transform,
        )
        .with_icon("repeat")
        .with_tags(&["loop", "iterate", "map"])
    }

    fn create_default_data(&self) -> Value {
        json!({
            "source": Self::DEFAULT_SOURCE,
            "itemVariable": Self::DEFAULT_ITEM_VARIABLE,
            "mapExpression": "",
        })
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("items", VariableType::Array, "Items that were iterated"),
            VariableDefinition::new("results", VariableType::Array, "Per-item results"),
            VariableDefinition::new("iterations", VariableType::Number, "Number of iterations run")
                .with_example(json!(3)),
            VariableDefinition::new("totalItems", VariableType::Number, "Length of the source array"),
            VariableDefinition::new("truncated", VariableType::Boolean, "Whether the iteration cap was hit"),
            VariableDefinition::new("itemVariable", VariableType::String, "Name bound to the current item"),
        ]
    }

    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let source = str_field(data, "source").unwrap_or(Self::DEFAULT_SOURCE);
        let item_variable = str_field(data, "itemVariable").unwrap_or(Self::DEFAULT_ITEM_VARIABLE);
        let map_expression = str_field(data, "mapExpression");

        let configured_max = ctx.config().execution.max_loop_iterations;
        let max_iterations = data
            .get("maxIterations")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).min(configured_max))
            .unwrap_or(configured_max);

        let items = match ctx.evaluate(source) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                let message = format!("'{}' did not resolve to an array (got {})", source, other);
                ctx.logger().warn(&message);
                return Ok(with_fields(empty_output(item_variable), error_fields(message)));
            }
            Err(e) => {
                ctx.logger().warn(&format!("'{}' failed: {}", source, e));
                return Ok(with_fields(empty_output(item_variable), error_fields(e.to_string())));
            }
        };

        let total = items.len();
        let truncated = total > max_iterations;
        if truncated {
            ctx.logger()
                .warn(&format!("iterating {} of {} items (limit reached)", max_iterations, total));
        }
        let iterated = &items[..total.min(max_iterations)];

        let mut results = Vec::with_capacity(iterated.len());
        let mut failure = None;
        for (index, item) in iterated.iter().enumerate() {
            if let Err(e) = ctx.checkpoint().await {
                ctx.logger().warn(&format!("stopped before item {}: {}", index, e));
                failure = Some(e.to_string());
                break;
            }
            let Some(expression) = map_expression else {
                results.push(item.clone());
                continue;
            };
            let item_ctx = ctx.clone().with_iteration(IterationInfo {
                index,
                total,
                item_variable: item_variable.to_string(),
            });
            let index_value = json!(index);
            match item_ctx.evaluate_with(expression, &[(item_variable, item), (Self::INDEX_VARIABLE, &index_value)]) {
                Ok(value) => results.push(value),
                Err(e) => {
                    item_ctx.logger().warn(&format!("item {} failed: {}", index, e));
                    failure = Some(format!("item {}: {}", index, e));
                    break;
                }
            }
        }

        ctx.logger().debug(&format!("{} iterations over {} items", results.len(), total));
        let output = json!({
            "items": iterated,
            "iterations": results.len(),
            "results": results,
            "totalItems": total,
            "truncated": truncated,
            "itemVariable": item_variable,
            "input": input,
        });
        Ok(match failure {
            Some(message) => with_fields(output, error_fields(message)),
            None => output,
        })
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        let mut problems = Vec::new();

        if let Some(source) = str_field(data, "source") {
            problems.extend(validate_expression(source));
        }
        if let Some(expression) = str_field(data, "mapExpression") {
            problems.extend(validate_expression(expression));
        }

        let item_variable = str_field(data, "itemVariable").unwrap_or(Self::DEFAULT_ITEM_VARIABLE);
        if !is_identifier(item_variable) {
            problems.push(format!("itemVariable '{}' is not a valid identifier", item_variable));
        } else if BLOCKED_IDENTIFIERS.contains(&item_variable)
            || item_variable == INPUT_NODE_ID
            || item_variable == Self::INDEX_VARIABLE
        {
            problems.push(format!("itemVariable '{}' is reserved", item_variable));
        }

        if let Err(message) = positive_int_field(data, "maxIterations") {
            problems.push(message);
        }
        problems
    }
}

fn empty_output(item_variable: &str) -> Value {
    json!({
        "items": [],
        "results": [],
        "iterations": 0,
        "totalItems": 0,
        "truncated": false,
        "itemVariable": item_variable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::EngineConfig;

    async fn run(data: Value, input: Value) -> Value {
        let ctx = ExecutionContext::new("f", "loop", input.clone());
        LoopPlugin.execute(input, &data, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_maps_items_with_index() {
        let out = run(
            json!({"source": "orders", "itemVariable": "order", "mapExpression": "order.qty * 2 + index"}),
            json!({"orders": [{"qty": 1}, {"qty": 5}]}),
        )
        .await;
        assert_eq!(out["results"], json!([2, 11]));
        assert_eq!(out["iterations"], 2);
        assert_eq!(out["totalItems"], 2);
        assert_eq!(out["truncated"], false);
        assert_eq!(out["itemVariable"], "order");
    }

    #[tokio::test]
    async fn test_without_map_passes_items_through() {
        let out = run(json!({}), json!({"items": ["a", "b"]})).await;
        assert_eq!(out["results"], json!(["a", "b"]));
        assert_eq!(out["items"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_iterations_are_capped() {
        let mut config = EngineConfig::default();
        config.execution.max_loop_iterations = 3;
        let input = json!({"items": [1, 2, 3, 4, 5]});
        let ctx = ExecutionContext::new("f", "loop", input.clone()).with_config(Arc::new(config));

        let out = LoopPlugin
            .execute(input, &json!({"maxIterations": 10}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["iterations"], 3);
        assert_eq!(out["totalItems"], 5);
        assert_eq!(out["truncated"], true);
    }

    #[tokio::test]
    async fn test_non_array_source_is_error_data() {
        let out = run(json!({"source": "name"}), json!({"name": "x"})).await;
        assert_eq!(out["error"], true);
        assert_eq!(out["iterations"], 0);
    }

    #[tokio::test]
    async fn test_map_failure_keeps_partial_results() {
        let out = run(
            json!({"mapExpression": "10 / item"}),
            json!({"items": [2, 0, 5]}),
        )
        .await;
        assert_eq!(out["results"], json!([5]));
        assert_eq!(out["error"], true);
        assert!(out["errorMessage"].as_str().unwrap().starts_with("item 1:"));
    }

    #[tokio::test]
    async fn test_passed_deadline_stops_iteration() {
        let input = json!({"items": [1, 2, 3]});
        let ctx = ExecutionContext::new("f", "loop", input.clone()).with_deadline(std::time::Instant::now());

        let out = LoopPlugin
            .execute(input, &json!({"mapExpression": "item * 2"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["error"], true);
        assert!(out["errorMessage"].as_str().unwrap().contains("timed out"));
        assert_eq!(out["iterations"], 0);
        assert_eq!(out["totalItems"], 3);
    }

    #[test]
    fn test_validation() {
        assert!(LoopPlugin.validate_data(&LoopPlugin.create_default_data()).is_empty());
        assert_eq!(
            LoopPlugin.validate_data(&json!({"itemVariable": "1x"})),
            vec!["itemVariable '1x' is not a valid identifier"]
        );
        assert_eq!(
            LoopPlugin.validate_data(&json!({"itemVariable": "input"})),
            vec!["itemVariable 'input' is reserved"]
        );
        assert_eq!(
            LoopPlugin.validate_data(&json!({"maxIterations": 0})),
            vec!["maxIterations must be a positive integer"]
        );
    }
}
