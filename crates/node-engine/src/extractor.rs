//! Nested variable extraction
//!
//! After a node runs, its output is walked and flattened into a catalog of
//! [`RuntimeVariable`]s, one per addressable value. Containers are emitted
//! too (so `{n1.user}` is referenceable as well as `{n1.user.name}`) and
//! then recursed into. Outputs are untrusted, so the walk is bounded by
//! depth, by total variable count and by the number of array elements
//! sampled.

use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExtractorConfig;
use crate::constants::extraction::ROOT_SEGMENT;
use crate::path::{full_path, push_index, push_key};
use crate::types::VariableType;

/// A value observed in a node's most recent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVariable {
    pub node_id: String,
    /// Location inside the output, e.g. `items[0].title`
    pub path: String,
    /// `nodeId` joined with `path`
    pub full_path: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub description: String,
    /// Truncated rendering of `value`
    pub example: String,
    /// The value itself; large containers keep their first level only,
    /// with arrays sampled and nested containers emptied
    pub value: Value,
    /// 0 for top-level fields
    pub depth: usize,
    pub extracted_at: DateTime<Utc>,
}

/// Render a value for display, truncated to `max_len` characters
///
/// Strings render without quotes; everything else as compact JSON.
pub fn render_example(value: &Value, max_len: usize) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= max_len {
        rendered
    } else {
        let mut truncated: String = rendered.chars().take(max_len).collect();
        truncated.push_str("...");
        truncated
    }
}

/// Flattens node outputs into runtime variables
#[derive(Debug, Clone, Default)]
pub struct NestedVariableExtractor {
    config: ExtractorConfig,
}

struct Walk<'a> {
    config: &'a ExtractorConfig,
    node_id: &'a str,
    extracted_at: DateTime<Utc>,
    out: Vec<RuntimeVariable>,
}

impl NestedVariableExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract every addressable value from `output`
    ///
    /// Never fails: an internal fault is logged and yields an empty set.
    pub fn extract(&self, node_id: &str, output: &Value) -> Vec<RuntimeVariable> {
        let result = catch_unwind(AssertUnwindSafe(|| self.walk(node_id, output)));
        match result {
            Ok(vars) => {
                log::debug!("NestedVariableExtractor {}: extracted {} variables", node_id, vars.len());
                vars
            }
            Err(_) => {
                log::error!("NestedVariableExtractor {}: extraction panicked; runtime set left empty", node_id);
                Vec::new()
            }
        }
    }

    fn walk(&self, node_id: &str, output: &Value) -> Vec<RuntimeVariable> {
        let mut walk = Walk {
            config: &self.config,
            node_id,
            extracted_at: Utc::now(),
            out: Vec::new(),
        };

        match output {
            Value::Object(map) => {
                for (key, value) in map {
                    if walk.is_full() {
                        break;
                    }
                    walk.visit(push_key("", key), value, 0);
                }
            }
            other => walk.visit(ROOT_SEGMENT.to_string(), other, 0),
        }

        if walk.is_full() {
            log::warn!(
                "NestedVariableExtractor {}: variable limit {} reached, output truncated",
                node_id,
                self.config.max_variables
            );
        }
        walk.out
    }
}

impl Walk<'_> {
    fn is_full(&self) -> bool {
        self.out.len() >= self.config.max_variables
    }

    fn visit(&mut self, path: String, value: &Value, depth: usize) {
        if self.is_full() {
            return;
        }

        let var_type = VariableType::of(value);
        self.out.push(RuntimeVariable {
            node_id: self.node_id.to_string(),
            full_path: full_path(self.node_id, &path),
            description: format!("{} at {}", var_type, path),
            example: render_example(value, self.config.max_example_len),
            var_type,
            value: bounded_value(value, self.config),
            depth,
            extracted_at: self.extracted_at,
            path: path.clone(),
        });

        if depth >= self.config.max_depth {
            return;
        }

        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if self.is_full() {
                        return;
                    }
                    self.visit(push_key(&path, key), child, depth + 1);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().take(self.config.max_array_items).enumerate() {
                    if self.is_full() {
                        return;
                    }
                    self.visit(push_index(&path, i), child, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Copy of `value` whose size does not grow with the subtree
///
/// Descendants are emitted as their own variables, so a large container
/// only needs its first level.
fn bounded_value(value: &Value, config: &ExtractorConfig) -> Value {
    let mut budget = config.max_value_bytes;
    if !matches!(value, Value::Object(_) | Value::Array(_)) || fits(value, &mut budget) {
        return value.clone();
    }

    let shallow = |child: &Value| match child {
        Value::Object(_) => Value::Object(serde_json::Map::new()),
        Value::Array(_) => Value::Array(Vec::new()),
        scalar => scalar.clone(),
    };
    match value {
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), shallow(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().take(config.max_array_items).map(shallow).collect()),
        scalar => scalar.clone(),
    }
}

/// Whether `value` serializes to roughly `budget` bytes or less; stops early
fn fits(value: &Value, budget: &mut usize) -> bool {
    let cost = match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.len(),
        Value::Object(map) => 2 + map.keys().map(|k| k.len() + 4).sum::<usize>(),
    };
    let Some(left) = budget.checked_sub(cost) else {
        return false;
    };
    *budget = left;
    match value {
        Value::Array(items) => items.iter().all(|item| fits(item, budget)),
        Value::Object(map) => map.values().all(|child| fits(child, budget)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(vars: &[RuntimeVariable]) -> Vec<&str> {
        vars.iter().map(|v| v.full_path.as_str()).collect()
    }

    fn find<'a>(vars: &'a [RuntimeVariable], full: &str) -> &'a RuntimeVariable {
        vars.iter().find(|v| v.full_path == full).unwrap()
    }

    #[test]
    fn test_nested_object() {
        let vars = NestedVariableExtractor::default().extract("n1", &json!({"a": {"b": 1}}));

        assert_eq!(paths(&vars), vec!["n1.a", "n1.a.b"]);
        let leaf = find(&vars, "n1.a.b");
        assert_eq!(leaf.depth, 1);
        assert_eq!(leaf.path, "a.b");
        assert_eq!(leaf.var_type, VariableType::Number);
        assert_eq!(leaf.value, json!(1));
        assert_eq!(find(&vars, "n1.a").var_type, VariableType::Object);
        assert_eq!(find(&vars, "n1.a").depth, 0);
    }

    #[test]
    fn test_scalar_and_array_roots() {
        let extractor = NestedVariableExtractor::default();

        let vars = extractor.extract("n1", &json!("hello"));
        assert_eq!(paths(&vars), vec!["n1.value"]);
        assert_eq!(vars[0].example, "hello");

        let vars = extractor.extract("n2", &json!([1, {"x": true}]));
        assert_eq!(paths(&vars), vec!["n2.value", "n2.value[0]", "n2.value[1]", "n2.value[1].x"]);
        assert_eq!(find(&vars, "n2.value[1].x").depth, 2);
    }

    #[test]
    fn test_special_keys_are_quoted() {
        let vars = NestedVariableExtractor::default()
            .extract("n1", &json!({"first name": "Ada", "meta": {"content-type": "json", "x.y": 1}}));

        let full: Vec<&str> = paths(&vars);
        assert!(full.contains(&r#"n1["first name"]"#));
        assert!(full.contains(&"n1.meta.content-type"));
        assert!(full.contains(&r#"n1.meta["x.y"]"#));
    }

    #[test]
    fn test_depth_limit() {
        let config = ExtractorConfig {
            max_depth: 1,
            ..Default::default()
        };
        let vars = NestedVariableExtractor::new(config).extract("n1", &json!({"a": {"b": {"c": 1}}}));

        assert_eq!(paths(&vars), vec!["n1.a", "n1.a.b"]);
    }

    #[test]
    fn test_variable_limit() {
        let config = ExtractorConfig {
            max_variables: 3,
            ..Default::default()
        };
        let vars = NestedVariableExtractor::new(config).extract("n1", &json!({"a": 1, "b": 2, "c": 3, "d": 4}));

        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_large_container_values_are_pruned() {
        let config = ExtractorConfig {
            max_value_bytes: 64,
            ..Default::default()
        };
        let rows: Vec<Value> = (0..20).map(|i| json!({"id": i, "tags": ["a", "b"]})).collect();
        let vars = NestedVariableExtractor::new(config)
            .extract("n1", &json!({"page": {"rows": rows, "total": 20}, "small": {"k": 1}}));

        let page = find(&vars, "n1.page");
        assert_eq!(page.value, json!({"rows": [], "total": 20}));
        assert_eq!(find(&vars, "n1.page.rows").value.as_array().unwrap().len(), 10);
        assert_eq!(find(&vars, "n1.page.rows[0]").value, json!({"id": 0, "tags": ["a", "b"]}));
        assert_eq!(find(&vars, "n1.small").value, json!({"k": 1}));
    }

    #[test]
    fn test_array_sampling() {
        let items: Vec<i32> = (0..50).collect();
        let vars = NestedVariableExtractor::default().extract("n1", &json!({ "items": items }));

        // the array itself plus ten sampled elements
        assert_eq!(vars.len(), 11);
        assert_eq!(vars.last().unwrap().full_path, "n1.items[9]");
    }

    #[test]
    fn test_example_truncation() {
        let long = "x".repeat(250);
        let vars = NestedVariableExtractor::default().extract("n1", &json!({ "text": long }));

        assert_eq!(vars[0].example.chars().count(), 103);
        assert!(vars[0].example.ends_with("..."));
        assert_eq!(vars[0].value.as_str().unwrap().len(), 250);
    }

    #[test]
    fn test_shared_timestamp() {
        let vars = NestedVariableExtractor::default().extract("n1", &json!({"a": 1, "b": [1, 2]}));
        assert!(vars.iter().all(|v| v.extracted_at == vars[0].extracted_at));
    }
}
