//! Helpers shared by the built-in plugins

use std::time::{Duration, Instant};

use node_engine::extension_keys;
use node_engine::ExecutionContext;
use serde_json::{json, Value};

/// A trimmed, non-empty string field of node data
pub fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// A positive integer field; `Err` carries a validation message
pub fn positive_int_field(data: &Value, key: &str) -> Result<Option<u64>, String> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Ok(Some(n)),
            _ => Err(format!("{} must be a positive integer", key)),
        },
    }
}

pub fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Standard error payload for failures reported as data
pub fn error_fields(message: impl Into<String>) -> Value {
    json!({
        "error": true,
        "errorMessage": message.into(),
    })
}

/// Merge `extra` fields into an object value
pub fn with_fields(mut base: Value, extra: Value) -> Value {
    if let (Some(target), Value::Object(fields)) = (base.as_object_mut(), extra) {
        target.extend(fields);
    }
    base
}

/// The host's shared HTTP client, or a new one with the configured user agent
///
/// Per-request timeouts are applied by the caller.
pub fn http_client(ctx: &ExecutionContext) -> Result<reqwest::Client, reqwest::Error> {
    if let Some(client) = ctx.extensions().get::<reqwest::Client>(extension_keys::HTTP_CLIENT) {
        return Ok(client.clone());
    }
    reqwest::Client::builder()
        .user_agent(ctx.config().integrations.user_agent.clone())
        .build()
}

/// Timeout from `timeoutMs` in node data, falling back to `default_ms`
pub fn timeout_from(data: &Value, default_ms: u64) -> Duration {
    let ms = data
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
