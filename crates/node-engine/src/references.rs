//! `{nodeId.path}` variable references in free text

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::path::{full_path, parse_path, render_path};
use crate::variable_registry::AvailableVariable;

/// Reason attached to references that cannot be resolved
pub const NOT_AVAILABLE_REASON: &str = "not available or not yet executed";

static REFERENCE_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"\{([A-Za-z0-9_-]+)((?:\.[A-Za-z0-9_$-]+|\[\d+\]|\["(?:[^"\\]|\\.)*"\]|\['(?:[^'\\]|\\.)*'\])+)\}"#,
    )
    .map_err(|e| log::error!("reference pattern failed to compile: {}", e))
    .ok()
});

/// One reference found in a text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableReference {
    /// The matched text including braces
    pub raw: String,
    pub node_id: String,
    /// Path as written, without the leading `.`
    pub path: String,
    /// `nodeId` + path in canonical form
    pub full_path: String,
    /// Byte offsets of `raw` in the source text
    pub start: usize,
    pub end: usize,
}

/// Outcome of checking one reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceValidation {
    pub reference: VariableReference,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Find every `{nodeId.path}` reference in `text`, in order of appearance
pub fn parse_references(text: &str) -> Vec<VariableReference> {
    let Some(re) = REFERENCE_RE.as_ref() else {
        return Vec::new();
    };

    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let node_id = caps.get(1)?.as_str();
            let written = caps.get(2)?.as_str();
            let path = written.strip_prefix('.').unwrap_or(written);
            // Canonicalize quoting so `a['x']` and `a["x"]` compare equal
            let canonical = parse_path(path).map(|segs| render_path(&segs)).unwrap_or_else(|| path.to_string());
            Some(VariableReference {
                raw: whole.as_str().to_string(),
                node_id: node_id.to_string(),
                path: path.to_string(),
                full_path: full_path(node_id, &canonical),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Classify each reference in `text` against an available set
pub fn validate_references(text: &str, available: &[AvailableVariable]) -> Vec<ReferenceValidation> {
    parse_references(text)
        .into_iter()
        .map(|reference| {
            let valid = available.iter().any(|v| v.full_path == reference.full_path);
            ReferenceValidation {
                reason: (!valid).then(|| NOT_AVAILABLE_REASON.to_string()),
                valid,
                reference,
            }
        })
        .collect()
}
