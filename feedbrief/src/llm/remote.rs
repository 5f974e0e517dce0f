use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

/// Remote LLM provider using OpenAI-compatible HTTP API
pub struct RemoteLlmProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    default_timeout: Duration,
    default_max_tokens: usize,
    default_temperature: f32,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            default_timeout: Duration::from_secs(120),
            default_max_tokens: 1024,
            default_temperature: 0.3,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(mut self, timeout_secs: u64, max_tokens: usize, temperature: f32) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    fn build_body(&self, request: LlmRequest) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.user_prompts.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: Value::String(request.system_prompt),
            });
        }

        // Images ride along with the first user message.
        let mut images = Some(request.images).filter(|i| !i.is_empty());
        for prompt in request.user_prompts {
            let content = match images.take() {
                Some(images) => {
                    let mut parts = vec![json!({ "type": "text", "text": prompt })];
                    parts.extend(
                        images
                            .into_iter()
                            .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
                    );
                    Value::Array(parts)
                }
                None => Value::String(prompt),
            };
            messages.push(Message {
                role: "user".to_string(),
                content,
            });
        }

        let response_format = request.output_schema.map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "strict": true, "schema": schema }
            })
        });

        OpenAiRequest {
            model: request.model.unwrap_or_else(|| self.model.clone()),
            messages,
            max_tokens: Some(request.max_tokens.unwrap_or(self.default_max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.default_temperature)),
            response_format,
        }
    }
}

/// Local backends (LM Studio, Ollama, llama.cpp server) answer with 503 or an
/// error message while the model is still being loaded into memory.
fn is_model_loading(status: reqwest::StatusCode, body: &str) -> bool {
    let body = body.to_lowercase();
    let mentions_loading = ["model is loading", "loading model", "model not loaded", "still loading"]
        .iter()
        .any(|needle| body.contains(needle));
    mentions_loading || (status == reqwest::StatusCode::SERVICE_UNAVAILABLE && body.contains("loading"))
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let req_body = self.build_body(request);

        let mut http = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .json(&req_body);
        if let Some(key) = &self.api_key {
            http = http.header("Authorization", format!("Bearer {}", key));
        }

        // Make HTTP request with timeout
        let response = tokio::time::timeout(timeout, http.send())
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_model_loading(status, &body) {
                return Err(LlmError::ModelLoading(body));
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body_text = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;
        let resp_body: OpenAiResponse = serde_json::from_str(&body_text)
            .map_err(|e| LlmError::InvalidResponse(format!("{} (body: {})", e, body_text)))?;

        if let Some(err) = resp_body.error {
            let message = err.message.unwrap_or_default();
            if is_model_loading(status, &message) {
                return Err(LlmError::ModelLoading(message));
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: message,
            });
        }

        let choice = resp_body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("LLM response has no choices".to_string()))?;
        let content = choice
            .message
            .content
            .ok_or_else(|| LlmError::InvalidResponse("LLM response has empty content".to_string()))?;

        let usage = resp_body.usage.unwrap_or_default();
        Ok(LlmResponse {
            content,
            usage: UsageMetadata {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
                total_tokens: usage.total_tokens.unwrap_or(0),
            },
            model: resp_body.model.unwrap_or(req_body.model),
        })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_attach_to_first_user_message() {
        let provider = RemoteLlmProvider::new("http://localhost/v1/chat/completions", None, "llava");
        let body = provider.build_body(
            LlmRequest::new("describe")
                .user("what is this?")
                .user("be brief")
                .image("data:image/png;base64,AAAA"),
        );
        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.messages[0].role, "system");
        let parts = body.messages[1].content.as_array().expect("content parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert!(body.messages[2].content.is_string());
        assert_eq!(body.model, "llava");
        assert!(body.response_format.is_none());
    }

    #[test]
    fn schema_becomes_response_format() {
        let provider = RemoteLlmProvider::new("http://localhost", None, "m");
        let body = provider.build_body(
            LlmRequest::new("s")
                .user("u")
                .model("other")
                .schema(json!({ "type": "object" })),
        );
        assert_eq!(body.model, "other");
        let format = body.response_format.expect("response format");
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["schema"]["type"], "object");
    }

    #[test]
    fn detects_model_loading() {
        use reqwest::StatusCode;
        assert!(is_model_loading(StatusCode::SERVICE_UNAVAILABLE, "Loading..."));
        assert!(is_model_loading(StatusCode::BAD_REQUEST, "Model is loading, please wait"));
        assert!(!is_model_loading(StatusCode::BAD_REQUEST, "invalid prompt"));
        assert!(!is_model_loading(StatusCode::SERVICE_UNAVAILABLE, "overloaded"));
    }
}
