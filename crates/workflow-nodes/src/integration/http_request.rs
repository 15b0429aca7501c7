//! HTTP Request
//!
//! Sends one HTTP request. URL, headers and body accept `{nodeId.path}`
//! references. Transport failures and non-2xx responses are reported as
//! data with `success: false`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use node_engine::{
    ExecutionContext, NodePlugin, PluginCategory, PluginMetadata, Result, VariableDefinition,
    VariableType,
};
use reqwest::Method;
use serde_json::{json, Map, Value};

use crate::common::{elapsed_ms, http_client, positive_int_field, str_field, timeout_from};

/// HTTP Request plugin
///
/// # Data
/// - `url` (required)
/// - `method` - `GET` (default), `POST`, `PUT`, `PATCH`, `DELETE`, `HEAD`
/// - `headers` - object of header values
/// - `body` - a string is sent as is, anything else as JSON
/// - `timeoutMs` - overrides the configured HTTP timeout
///
/// # Output
/// `success`, `status`, `headers`, `data` (parsed JSON when possible),
/// `durationMs`; `error` on failure.
pub struct HttpRequestPlugin;

impl HttpRequestPlugin {
    pub const NODE_TYPE: &'static str = "http-request";
    pub const METHODS: [&'static str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }
}

inventory::submit!(node_engine::PluginFactoryFn(HttpRequestPlugin::factory));

fn method_of(data: &Value) -> String {
    str_field(data, "method").unwrap_or("GET").to_ascii_uppercase()
}

fn failure(message: String, method: &str, url: &str, duration_ms: u64) -> Value {
    json!({
        "success": false,
        "error": message,
        "method": method,
        "url": url,
        "durationMs": duration_ms,
    })
}

#[async_trait]
impl NodePlugin for HttpRequestPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "HTTP Request",
            "Sends an HTTP request and returns the response",
            "1.0.0",
            PluginCategory::Action,
        )
        .with_icon("globe")
        .with_tags(&["http", "api", "request"])
    }

    fn create_default_data(&self) -> Value {
        json!({"url": "", "method": "GET", "headers": {}})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("success", VariableType::Boolean, "Whether a 2xx response was received"),
            VariableDefinition::new("status", VariableType::Number, "HTTP status code")
                .with_example(json!(200)),
            VariableDefinition::new("headers", VariableType::Object, "Response headers"),
            VariableDefinition::new("data", VariableType::Any, "Response body, parsed as JSON when possible"),
            VariableDefinition::new("durationMs", VariableType::Number, "Request time in milliseconds"),
        ]
    }

    async fn execute(&self, _input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let started = Instant::now();
        let method_name = method_of(data);
        let url = ctx.substitute(str_field(data, "url").unwrap_or_default());

        let method = match Method::from_bytes(method_name.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return Ok(failure(format!("Invalid method '{}'", method_name), &method_name, &url, 0));
            }
        };

        let client = match http_client(ctx) {
            Ok(client) => client,
            Err(e) => {
                return Ok(failure(format!("Failed to build HTTP client: {}", e), &method_name, &url, 0));
            }
        };

        let timeout = timeout_from(data, ctx.config().integrations.http_timeout_ms);
        let mut request = client.request(method, &url).timeout(timeout);

        if let Some(Value::Object(headers)) = data.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => ctx.substitute(s),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
        }

        match data.get("body").map(|body| ctx.substitute_value(body)) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text),
            Some(body) => request = request.json(&body),
        }

        log::debug!("HttpRequest: {} {}", method_name, url);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("Request timed out after {}ms", timeout.as_millis())
                } else {
                    format!("Request failed: {}", e)
                };
                ctx.logger().warn(&message);
                return Ok(failure(message, &method_name, &url, elapsed_ms(started)));
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();

        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Ok(failure(format!("Failed to read response body: {}", e), &method_name, &url, elapsed_ms(started)));
            }
        };
        let data_value = serde_json::from_str(&body).unwrap_or(Value::String(body));

        let duration_ms = elapsed_ms(started);
        ctx.logger()
            .debug(&format!("{} {} -> {} in {}ms", method_name, url, status.as_u16(), duration_ms));

        let mut output = json!({
            "success": status.is_success(),
            "status": status.as_u16(),
            "headers": headers,
            "data": data_value,
            "method": method_name,
            "url": url,
            "durationMs": duration_ms,
        });
        if !status.is_success() {
            output["error"] = json!(format!("HTTP {}", status));
        }
        Ok(output)
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        let mut problems = Vec::new();

        match str_field(data, "url") {
            None => problems.push("URL is required".to_string()),
            // References may expand to a full URL
            Some(url) if url.starts_with('{') => {}
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                problems.push(format!("URL must start with http:// or https:// (got '{}')", url));
            }
            Some(_) => {}
        }

        let method = method_of(data);
        if !Self::METHODS.contains(&method.as_str()) {
            problems.push(format!("Unsupported method '{}'", method));
        }

        match data.get("headers") {
            None | Some(Value::Null) | Some(Value::Object(_)) => {}
            Some(_) => problems.push("headers must be an object".to_string()),
        }

        if let Err(message) = positive_int_field(data, "timeoutMs") {
            problems.push(message);
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::{extension_keys, ExecutorExtensions};
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_with_upstream(upstream: Value) -> ExecutionContext {
        let mut outputs = HashMap::new();
        outputs.insert("prev".to_string(), upstream);
        ExecutionContext::new("f", "http", json!({})).with_upstream(Arc::new(outputs))
    }

    #[tokio::test]
    async fn test_get_with_substituted_url() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
            .mount(&server)
            .await;

        let ctx = ctx_with_upstream(json!({"id": 42}));
        let data = json!({"url": format!("{}/users/{{prev.id}}", server.uri())});
        let out = HttpRequestPlugin.execute(json!({}), &data, &ctx).await.unwrap();

        assert_eq!(out["success"], true);
        assert_eq!(out["status"], 200);
        assert_eq!(out["data"], json!({"name": "Ada"}));
        assert!(out["headers"]["content-type"].as_str().unwrap().contains("json"));
    }

    #[tokio::test]
    async fn test_post_json_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(header("x-trace", "abc"))
            .and(body_json(json!({"id": 42, "label": "item 42"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let ctx = ctx_with_upstream(json!({"id": 42, "trace": "abc"}));
        let data = json!({
            "url": format!("{}/items", server.uri()),
            "method": "post",
            "headers": {"x-trace": "{prev.trace}"},
            "body": {"id": "{prev.id}", "label": "item {prev.id}"},
        });
        let out = HttpRequestPlugin.execute(json!({}), &data, &ctx).await.unwrap();

        assert_eq!(out["success"], true);
        assert_eq!(out["status"], 201);
        assert_eq!(out["data"], "created");
    }

    #[tokio::test]
    async fn test_error_status_is_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ctx = ExecutionContext::new("f", "http", json!({}));
        let out = HttpRequestPlugin
            .execute(json!({}), &json!({"url": server.uri()}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["status"], 404);
        assert!(out["error"].as_str().unwrap().starts_with("HTTP 404"));
    }

    #[tokio::test]
    async fn test_timeout_from_node_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)))
            .mount(&server)
            .await;

        let ctx = ExecutionContext::new("f", "http", json!({}));
        let data = json!({"url": server.uri(), "timeoutMs": 50});
        let out = HttpRequestPlugin.execute(json!({}), &data, &ctx).await.unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "Request timed out after 50ms");
    }

    #[tokio::test]
    async fn test_uses_shared_client_from_extensions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "shared-client"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder().user_agent("shared-client").build().unwrap();
        let extensions = ExecutorExtensions::new().with(extension_keys::HTTP_CLIENT, client);
        let ctx = ExecutionContext::new("f", "http", json!({})).with_extensions(Arc::new(extensions));
        let out = HttpRequestPlugin
            .execute(json!({}), &json!({"url": server.uri()}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["success"], true);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_data() {
        let ctx = ExecutionContext::new("f", "http", json!({}));
        let out = HttpRequestPlugin
            .execute(json!({}), &json!({"url": "http://127.0.0.1:9/nothing", "timeoutMs": 500}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["success"], false);
        assert!(out["error"].is_string());
    }

    #[test]
    fn test_validation() {
        assert!(HttpRequestPlugin
            .validate_data(&json!({"url": "https://example.com", "method": "get"}))
            .is_empty());
        assert!(HttpRequestPlugin.validate_data(&json!({"url": "{cfg.endpoint}"})).is_empty());
        assert_eq!(
            HttpRequestPlugin.validate_data(&json!({"url": "", "method": "TRACE", "headers": [], "timeoutMs": 0})),
            vec![
                "URL is required",
                "Unsupported method 'TRACE'",
                "headers must be an object",
                "timeoutMs must be a positive integer",
            ]
        );
    }
}
