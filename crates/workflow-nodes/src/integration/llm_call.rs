//! LLM Call
//!
//! Sends a prompt to an OpenAI-compatible `/chat/completions` endpoint.
//! Endpoint, default model, timeout and API key come from the engine
//! configuration; node data can pick a model and sampling settings.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use node_engine::{
    ExecutionContext, NodePlugin, PluginCategory, PluginMetadata, Result, VariableDefinition,
    VariableType,
};
use serde_json::{json, Value};

use crate::common::{elapsed_ms, http_client, positive_int_field, str_field, timeout_from};

/// LLM Call plugin
///
/// # Data
/// - `prompt` (required), `systemPrompt` - both accept references
/// - `model` - overrides the configured model
/// - `temperature` (0 to 2), `maxTokens`, `timeoutMs`
///
/// # Output
/// `success`, `response`, `model`, `usage`, `finishReason`, `durationMs`;
/// `error` on failure.
pub struct LlmCallPlugin;

impl LlmCallPlugin {
    pub const NODE_TYPE: &'static str = "llm-call";
    pub const COMPLETIONS_PATH: &'static str = "/chat/completions";

    pub fn factory() -> Arc<dyn NodePlugin> {
        Arc::new(Self)
    }

    /// Request body for the completion call
    fn request_body(model: &str, prompt: &str, system_prompt: Option<&str>, data: &Value) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if let Some(temperature) = data.get("temperature").and_then(Value::as_f64) {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = data.get("maxTokens").and_then(Value::as_u64) {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

inventory::submit!(node_engine::PluginFactoryFn(LlmCallPlugin::factory));

fn failure(message: String, model: &str, duration_ms: u64) -> Value {
    json!({
        "success": false,
        "error": message,
        "model": model,
        "durationMs": duration_ms,
    })
}

#[async_trait]
impl NodePlugin for LlmCallPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            Self::NODE_TYPE,
            "LLM Call",
            "Generates text with a chat completion model",
            "1.0.0",
            PluginCategory::Action,
        )
        .with_icon("sparkles")
        .with_tags(&["ai", "llm", "chat"])
    }

    fn create_default_data(&self) -> Value {
        json!({"prompt": "", "systemPrompt": "", "temperature": 0.7})
    }

    fn output_schema(&self) -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::new("success", VariableType::Boolean, "Whether a completion was returned"),
            VariableDefinition::new("response", VariableType::String, "Generated text"),
            VariableDefinition::new("model", VariableType::String, "Model that produced the response"),
            VariableDefinition::new("usage", VariableType::Object, "Token usage reported by the API")
                .with_example(json!({"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42})),
            VariableDefinition::new("finishReason", VariableType::String, "Why generation stopped"),
            VariableDefinition::new("durationMs", VariableType::Number, "Call time in milliseconds"),
        ]
    }

    async fn execute(&self, _input: Value, data: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let started = Instant::now();
        let integrations = &ctx.config().integrations;
        let model = str_field(data, "model")
            .map(str::to_string)
            .unwrap_or_else(|| integrations.llm_model.clone());

        let prompt = ctx.substitute(data.get("prompt").and_then(Value::as_str).unwrap_or_default());
        let system_prompt = data
            .get("systemPrompt")
            .and_then(Value::as_str)
            .map(|s| ctx.substitute(s));
        let body = Self::request_body(&model, &prompt, system_prompt.as_deref(), data);

        let client = match http_client(ctx) {
            Ok(client) => client,
            Err(e) => return Ok(failure(format!("Failed to build HTTP client: {}", e), &model, 0)),
        };
        let url = format!(
            "{}{}",
            integrations.llm_base_url.trim_end_matches('/'),
            Self::COMPLETIONS_PATH
        );
        let timeout = timeout_from(data, integrations.llm_timeout_ms);

        let mut request = client.post(&url).timeout(timeout).json(&body);
        if let Some(key) = integrations.llm_api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        log::debug!("LlmCall: sending request to {} with model '{}'", url, model);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("LLM request timed out after {}ms", timeout.as_millis())
                } else {
                    format!("Failed to reach LLM endpoint: {}", e)
                };
                ctx.logger().warn(&message);
                return Ok(failure(message, &model, elapsed_ms(started)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = format!("LLM API error ({}): {}", status, error_body);
            ctx.logger().warn(&message);
            return Ok(failure(message, &model, elapsed_ms(started)));
        }

        let completion: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return Ok(failure(format!("Failed to parse LLM response: {}", e), &model, elapsed_ms(started)));
            }
        };

        let choice = &completion["choices"][0];
        let Some(text) = choice["message"]["content"].as_str() else {
            return Ok(failure(
                "LLM response contained no message content".to_string(),
                &model,
                elapsed_ms(started),
            ));
        };
        let model_used = completion["model"].as_str().unwrap_or(&model).to_string();
        let duration_ms = elapsed_ms(started);

        ctx.logger().debug(&format!(
            "completed with {} chars using model '{}' in {}ms",
            text.len(),
            model_used,
            duration_ms
        ));

        Ok(json!({
            "success": true,
            "response": text,
            "model": model_used,
            "usage": completion.get("usage").cloned().unwrap_or(Value::Null),
            "finishReason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
            "durationMs": duration_ms,
        }))
    }

    fn validate_data(&self, data: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        if str_field(data, "prompt").is_none() {
            problems.push("Prompt is required".to_string());
        }
        match data.get("temperature") {
            None | Some(Value::Null) => {}
            Some(t) => match t.as_f64() {
                Some(t) if (0.0..=2.0).contains(&t) => {}
                _ => problems.push("temperature must be a number between 0 and 2".to_string()),
            },
        }
        for field in ["maxTokens", "timeoutMs"] {
            if let Err(message) = positive_int_field(data, field) {
                problems.push(message);
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::EngineConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_for(server: &MockServer, api_key: Option<&str>) -> ExecutionContext {
        let mut config = EngineConfig::default();
        config.integrations.llm_base_url = format!("{}/v1/", server.uri());
        config.integrations.llm_model = "test-model".to_string();
        config.integrations.llm_api_key = api_key.map(str::to_string);
        ExecutionContext::new("f", "llm", json!({"topic": "rust"})).with_config(Arc::new(config))
    }

    fn completion(text: &str) -> Value {
        json!({
            "model": "test-model-2024",
            "choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12},
        })
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "messages": [
                    {"role": "system", "content": "Be brief"},
                    {"role": "user", "content": "Explain rust"},
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Ownership!")))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server, Some("sk-test"));
        let data = json!({"prompt": "Explain {input.topic}", "systemPrompt": "Be brief"});
        let out = LlmCallPlugin.execute(json!({}), &data, &ctx).await.unwrap();

        assert_eq!(out["success"], true);
        assert_eq!(out["response"], "Ownership!");
        assert_eq!(out["model"], "test-model-2024");
        assert_eq!(out["usage"]["total_tokens"], 12);
        assert_eq!(out["finishReason"], "stop");
    }

    #[tokio::test]
    async fn test_api_error_is_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server, None);
        let out = LlmCallPlugin
            .execute(json!({}), &json!({"prompt": "hi", "model": "other"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["model"], "other");
        assert!(out["error"].as_str().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_missing_content_is_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server, None);
        let out = LlmCallPlugin.execute(json!({}), &json!({"prompt": "hi"}), &ctx).await.unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "LLM response contained no message content");
    }

    #[test]
    fn test_request_body_options() {
        let body = LlmCallPlugin::request_body("m", "hello", Some(" "), &json!({"temperature": 0.2, "maxTokens": 64}));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_validation() {
        assert!(LlmCallPlugin.validate_data(&json!({"prompt": "hi", "temperature": 1})).is_empty());
        assert_eq!(
            LlmCallPlugin.validate_data(&json!({"temperature": 3, "maxTokens": 0})),
            vec![
                "Prompt is required",
                "temperature must be a number between 0 and 2",
                "maxTokens must be a positive integer",
            ]
        );
    }
}
