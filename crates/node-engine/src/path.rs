//! Addressing values inside JSON output
//!
//! Paths use dot notation for object keys, brackets for array indices and
//! quoted brackets for keys that are not plain identifiers:
//!
//! - `user.name`
//! - `items[0].title`
//! - `headers["content-type"]`

use serde_json::Value;

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a path into segments
///
/// Returns `None` for malformed paths (unterminated brackets or quotes,
/// empty keys).
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                // A dot must be followed by a key
                i += 1;
                if i >= chars.len() || chars[i] == '.' || chars[i] == '[' {
                    return None;
                }
            }
            '[' => {
                i += 1;
                let quote = match chars.get(i) {
                    Some(&q) if q == '"' || q == '\'' => Some(q),
                    Some(_) => None,
                    None => return None,
                };
                if let Some(q) = quote {
                    i += 1;
                    let mut key = String::new();
                    loop {
                        match chars.get(i) {
                            None => return None,
                            Some('\\') => {
                                key.push(*chars.get(i + 1)?);
                                i += 2;
                            }
                            Some(&c) if c == q => {
                                i += 1;
                                break;
                            }
                            Some(&c) => {
                                key.push(c);
                                i += 1;
                            }
                        }
                    }
                    if chars.get(i) != Some(&']') {
                        return None;
                    }
                    i += 1;
                    segments.push(PathSegment::Key(key));
                } else {
                    let start = i;
                    while i < chars.len() && chars[i] != ']' {
                        i += 1;
                    }
                    if i >= chars.len() {
                        return None;
                    }
                    let raw: String = chars[start..i].iter().collect();
                    let index = raw.trim().parse::<usize>().ok()?;
                    i += 1;
                    segments.push(PathSegment::Index(index));
                }
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                if key.is_empty() {
                    return None;
                }
                segments.push(PathSegment::Key(key));
            }
        }
    }

    Some(segments)
}

/// Whether a key can be written with plain dot notation
pub fn is_plain_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-')
}

/// Append a key to a path string, quoting when needed
pub fn push_key(path: &str, key: &str) -> String {
    if is_plain_key(key) {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", path, key)
        }
    } else {
        let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{}[\"{}\"]", path, escaped)
    }
}

/// Append an array index to a path string
pub fn push_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

/// Render segments back into a path string
pub fn render_path(segments: &[PathSegment]) -> String {
    segments.iter().fold(String::new(), |acc, seg| match seg {
        PathSegment::Key(k) => push_key(&acc, k),
        PathSegment::Index(i) => push_index(&acc, *i),
    })
}

/// Join a node id and a field path into a full path
pub fn full_path(node_id: &str, path: &str) -> String {
    if path.is_empty() {
        node_id.to_string()
    } else if path.starts_with('[') {
        format!("{}{}", node_id, path)
    } else {
        format!("{}.{}", node_id, path)
    }
}

/// Walk parsed segments through a value
pub fn lookup_segments<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, seg| match seg {
        PathSegment::Key(k) => current.get(k.as_str()),
        PathSegment::Index(i) => current.get(*i),
    })
}

/// Look a path string up inside a value
///
/// An empty path addresses the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let segments = parse_path(path)?;
    lookup_segments(value, &segments)
}
