//! Switch
//!
//! Multi-way branch. The expression result is compared, as a string, with
//! each declared case in order; the first match selects its branch.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use node_engine::expression::{to_display_string, validate_expression};
use node_engine::{
    ExecutionContext, NodeEngineError, NodePlugin, PluginCategory, PluginMetadata, Result,
    VariableDefinition, VariableType,
};
use serde_json::{json, Value};

use crate::common::str_field;

/// Switch plugin
///
/// # Data
/// - `expression` (required) - value to match
/// - `cases` - `[{"value": "urgent"}, ...]` or plain strings
/// - `defaultCase` - take the `"default"` branch when nothing matches
///
/// Case values go through variable substitution before comparison. A
/// matched case routes to its declared value; an unmatched one routes to
/// `"default"`, or fails the node when there is no default.
pub struct SwitchPlugin;

impl SwitchPlugin {
    pub const NODE_TYPE: &'static str = "switch";
    pub const DEFAULT_BRANCH: &'static str = "default";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }
}

inventory::submit!(node_engine::PluginFactoryFn(SwitchPlugin::factory));

/// Declared value of one case entry
fn case_value(case: &Value) -> Option<String> {
    match case {
        Value::String(s) => Some(s.clone()),
        Value::Object(fields) => fields
            .get("value")
            .filter(|v| !v.is_null())
            .map(to_display_string),
        _ => None,
    }
}

fn declared_cases(data: &Value) -> &[Value] {
    data.get("cases")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn has_default(data: &Value) -> bool {
    data.get("defaultCase").and_then(Value::as_bool).unwrap_or(false)
}

#[async_trait]
impl NodePlugin for SwitchPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "Switch",
            "Routes the flow to the first case matching a value",
            "1.0.0",
            PluginCategory::Condition,
        )
        .with_icon("split")
        .with_tags(&["logic", "branch", "case"])
    }

    fn create_default_data(&self) -> Value {
        json!({"expression": "", "cases": [], "defaultCase": true})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("matchedCase", VariableType::String, "Matched case value, or null"),
            VariableDefinition::new("matchedCaseIndex", VariableType::Number, "Index of the matched case, or -1")
                .with_example(json!(0)),
            VariableDefinition::new("outputPath", VariableType::String, "Branch taken")
                .with_example(json!("default")),
            VariableDefinition::new("switchValue", VariableType::String, "Expression result as a string"),
            VariableDefinition::new("cases", VariableType::Array, "Case values after substitution, null where a case has none"),
            VariableDefinition::new("input", VariableType::Any, "The node input, passed through"),
        ]
    }

    async fn execute(&self, input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let expression = str_field(data, "expression").unwrap_or_default();
        let default_enabled = has_default(data);

        // (declared, substituted) per case, at its declared position
        let cases: Vec<Option<(String, String)>> = declared_cases(data)
            .iter()
            .map(|case| {
                case_value(case).map(|declared| {
                    let substituted = ctx.substitute(&declared);
                    (declared, substituted)
                })
            })
            .collect();
        let case_values: Vec<Option<&str>> = cases
            .iter()
            .map(|case| case.as_ref().map(|(_, substituted)| substituted.as_str()))
            .collect();

        let switch_value = match ctx.evaluate(expression) {
            Ok(value) => to_display_string(&value),
            Err(e) if default_enabled => {
                ctx.logger().warn(&format!("'{}' failed, taking default: {}", expression, e));
                return Ok(json!({
                    "matchedCase": null,
                    "matchedCaseIndex": -1,
                    "outputPath": Self::DEFAULT_BRANCH,
                    "switchValue": null,
                    "cases": case_values,
                    "input": input,
                    "error": true,
                    "errorMessage": e.to_string(),
                }));
            }
            Err(e) => {
                return Err(NodeEngineError::failed(format!(
                    "switch expression '{}' failed: {}",
                    expression, e
                )))
            }
        };

        let matched = cases.iter().enumerate().find_map(|(index, case)| match case {
            Some((declared, substituted)) if *substituted == switch_value => Some((index, declared, substituted)),
            _ => None,
        });

        let output = match matched {
            Some((index, declared, substituted)) => {
                ctx.logger().debug(&format!("'{}' matched case {}", switch_value, index));
                json!({
                    "matchedCase": substituted,
                    "matchedCaseIndex": index,
                    "outputPath": declared,
                    "switchValue": switch_value,
                    "cases": case_values,
                    "input": input,
                })
            }
            None if default_enabled => json!({
                "matchedCase": null,
                "matchedCaseIndex": -1,
                "outputPath": Self::DEFAULT_BRANCH,
                "switchValue": switch_value,
                "cases": case_values,
                "input": input,
            }),
            None => {
                return Err(NodeEngineError::failed(format!(
                    "no case matched '{}' and no default case is configured",
                    switch_value
                )))
            }
        };
        Ok(output)
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        let mut problems = validate_expression(str_field(data, "expression").unwrap_or_default());

        let cases = declared_cases(data);
        if cases.is_empty() && !has_default(data) {
            problems.push("At least one case or a default case is required".to_string());
        }

        let mut seen = HashSet::new();
        for (index, case) in cases.iter().enumerate() {
            match case_value(case) {
                None => problems.push(format!("Case {} has no value", index + 1)),
                Some(value) if !seen.insert(value.clone()) => {
                    problems.push(format!("Duplicate case value '{}'", value));
                }
                Some(_) => {}
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn data(default_case: bool) -> Value {
        json!({
            "expression": "input.priority",
            "cases": [{"value": "urgent"}, {"value": "normal"}],
            "defaultCase": default_case,
        })
    }

    async fn run(data: &Value, input: Value) -> Result<Value> {
        let ctx = ExecutionContext::new("f", "sw", input.clone());
        SwitchPlugin.execute(input, data, &ctx).await
    }

    #[tokio::test]
    async fn test_unmatched_value_takes_default() {
        let out = run(&data(true), json!({"priority": "low"})).await.unwrap();
        assert_eq!(out["outputPath"], "default");
        assert_eq!(out["matchedCaseIndex"], -1);
        assert_eq!(out["matchedCase"], Value::Null);
        assert_eq!(out["switchValue"], "low");
        assert_eq!(out["cases"], json!(["urgent", "normal"]));
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let data = json!({
            "expression": "input.priority",
            "cases": ["normal", {"value": "normal"}, "urgent"],
            "defaultCase": false,
        });
        let out = run(&data, json!({"priority": "normal"})).await.unwrap();
        assert_eq!(out["matchedCaseIndex"], 0);
        assert_eq!(out["outputPath"], "normal");
    }

    #[tokio::test]
    async fn test_no_match_without_default_fails() {
        let err = run(&data(false), json!({"priority": "low"})).await.unwrap_err();
        assert!(err.to_string().contains("no case matched 'low'"));
    }

    #[tokio::test]
    async fn test_numbers_compare_as_strings() {
        let data = json!({"expression": "input.code", "cases": [{"value": 200}, {"value": 404}]});
        let out = run(&data, json!({"code": 404})).await.unwrap();
        assert_eq!(out["matchedCaseIndex"], 1);
        assert_eq!(out["switchValue"], "404");
    }

    #[tokio::test]
    async fn test_case_values_are_substituted() {
        let mut upstream = HashMap::new();
        upstream.insert("cfg".to_string(), json!({"vip": "gold"}));
        let input = json!({"tier": "gold"});
        let ctx = ExecutionContext::new("f", "sw", input.clone()).with_upstream(Arc::new(upstream));
        let data = json!({"expression": "tier", "cases": [{"value": "{cfg.vip}"}]});

        let out = SwitchPlugin.execute(input, &data, &ctx).await.unwrap();
        assert_eq!(out["matchedCase"], "gold");
        assert_eq!(out["outputPath"], "{cfg.vip}");
    }

    #[tokio::test]
    async fn test_evaluation_failure_with_default() {
        let data = json!({"expression": "1 / 0", "cases": ["a"], "defaultCase": true});
        let out = run(&data, json!({})).await.unwrap();
        assert_eq!(out["outputPath"], "default");
        assert_eq!(out["error"], true);
        assert_eq!(out["cases"], json!(["a"]));
    }

    #[tokio::test]
    async fn test_matched_index_is_declared_position() {
        let data = json!({
            "expression": "input.priority",
            "cases": [{"label": "unset"}, {"value": "low"}, "high"],
            "defaultCase": true,
        });
        let out = run(&data, json!({"priority": "high"})).await.unwrap();
        assert_eq!(out["matchedCaseIndex"], 2);
        assert_eq!(out["outputPath"], "high");
        assert_eq!(out["cases"], json!([null, "low", "high"]));
    }

    #[test]
    fn test_validation() {
        assert!(SwitchPlugin.validate_data(&data(false)).is_empty());
        assert_eq!(
            SwitchPlugin.validate_data(&json!({"expression": "x", "cases": []})),
            vec!["At least one case or a default case is required"]
        );
        assert_eq!(
            SwitchPlugin.validate_data(&json!({"expression": "x", "cases": ["a", {"value": "a"}, {}]})),
            vec!["Duplicate case value 'a'", "Case 3 has no value"]
        );
        assert_eq!(
            SwitchPlugin.validate_data(&json!({"expression": "", "defaultCase": true})),
            vec!["Expression is required"]
        );
    }
}
