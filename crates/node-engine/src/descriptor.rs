//! Plugin metadata and variable definition types
//!
//! A plugin describes itself with a [`PluginMetadata`] (registry key, label,
//! version, category) and promises a list of [`VariableDefinition`]s: the
//! static output schema for its node type.

use serde::{Deserialize, Serialize};

use crate::types::{PluginCategory, VariableType};

/// Complete metadata for a node type
///
/// `node_type` is the registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Unique type identifier (e.g., "http-request")
    pub node_type: String,
    /// Human-readable name
    pub name: String,
    /// Description of what the node does
    pub description: String,
    /// Semantic version (`MAJOR.MINOR.PATCH`)
    pub version: String,
    /// Category for grouping
    pub category: PluginCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl PluginMetadata {
    /// Create metadata with the required fields
    pub fn new(
        node_type: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
        category: PluginCategory,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            name: name.into(),
            description: description.into(),
            version: version.into(),
            category,
            icon: None,
            color: None,
            tags: Vec::new(),
            author: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Check the required fields, returning every problem found
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.node_type.trim().is_empty() {
            problems.push("missing node type".to_string());
        }
        if self.name.trim().is_empty() {
            problems.push("missing name".to_string());
        }
        if self.description.trim().is_empty() {
            problems.push("missing description".to_string());
        }
        if !is_semver(&self.version) {
            problems.push(format!("invalid version '{}'", self.version));
        }
        problems
    }
}

/// `MAJOR.MINOR.PATCH` with an optional `-pre` or `+build` suffix
fn is_semver(version: &str) -> bool {
    let core = version
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// A field a node type promises to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    /// Field name (top-level key of the node's output)
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub var_type: VariableType,
    /// Human description
    pub description: String,
    /// Optional example value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<serde_json::Value>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>, var_type: VariableType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type,
            description: description.into(),
            example: None,
        }
    }

    /// Attach an example value
    pub fn with_example(mut self, example: serde_json::Value) -> Self {
        self.example = Some(example);
        self
    }
}

/// Expected port counts, used by editors to draw handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredConnections {
    pub inputs: usize,
    pub outputs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PluginMetadata {
        PluginMetadata::new("test-node", "Test", "A test node", "1.0.0", PluginCategory::Utility)
    }

    #[test]
    fn test_valid_metadata_has_no_problems() {
        assert!(valid().problems().is_empty());
    }

    #[test]
    fn test_all_problems_reported() {
        let meta = PluginMetadata::new("", " ", "", "1.0", PluginCategory::Utility);
        let problems = meta.problems();
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn test_semver_variants() {
        assert!(is_semver("0.1.0"));
        assert!(is_semver("2.10.3-beta.1"));
        assert!(is_semver("1.0.0+build5"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("v1.0.0"));
        assert!(!is_semver("1..0"));
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = valid().with_tags(&["core"]).with_icon("bolt");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("nodeType")); // camelCase
        assert!(json.contains("\"category\":\"utility\""));
        assert!(!json.contains("author"));
    }

    #[test]
    fn test_variable_definition_type_key() {
        let def = VariableDefinition::new("status", VariableType::Number, "HTTP status")
            .with_example(serde_json::json!(200));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "number");
        assert_eq!(json["example"], 200);
    }
}
