use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::retry::{retry, RetryError, RetryPolicy};

pub mod remote;

/// Core trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one chat completion. Resolves once the full response is available.
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Model used when a request does not name one
    fn default_model(&self) -> &str;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub system_prompt: String,
    pub user_prompts: Vec<String>,
    /// Inline images as data URIs
    pub images: Vec<String>,
    /// JSON schema the response must follow
    pub output_schema: Option<serde_json::Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, prompt: impl Into<String>) -> Self {
        self.user_prompts.push(prompt.into());
        self
    }

    pub fn image(mut self, data_uri: impl Into<String>) -> Self {
        self.images.push(data_uri.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The backend accepted the request but the model is not loaded yet.
    #[error("model is still loading: {0}")]
    ModelLoading(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("LLM HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM request cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_model_loading(&self) -> bool {
        matches!(self, LlmError::ModelLoading(_))
    }
}

/// Provider plus the retry budget for a backend that is still loading its model.
///
/// Every other error is returned after one attempt; call sites wrap this in
/// their own phase policy.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    loading_policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, loading_policy: RetryPolicy) -> Self {
        Self {
            provider,
            loading_policy,
        }
    }

    pub fn default_model(&self) -> &str {
        self.provider.default_model()
    }

    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &LlmRequest,
    ) -> Result<LlmResponse, RetryError<LlmError>> {
        let response = retry(
            cancel,
            &self.loading_policy,
            move |_| async move {
                tokio::select! {
                    res = self.provider.complete(request.clone()) => res,
                    _ = cancel.cancelled() => Err(LlmError::Cancelled),
                }
            },
            LlmError::is_model_loading,
        )
        .await?;
        info!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "LLM completion"
        );
        Ok(response)
    }
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}

/// Parse a model's JSON answer, tolerating fences and preamble.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(raw: &str) -> anyhow::Result<T> {
    let cleaned = strip_thinking(raw);
    let json = extract_json_from_text(&cleaned)
        .ok_or_else(|| anyhow::anyhow!("no JSON object found in model output"))?;
    serde_json::from_str(&json)
        .map_err(|e| anyhow::anyhow!("failed to parse model JSON: {} (input was: {})", e, json))
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Remove `<think>...</think>` reasoning blocks from model output.
///
/// A dangling `</think>` (opening tag swallowed by the chat template) drops
/// everything before it; an unclosed `<think>` drops everything after it.
pub fn strip_thinking(text: &str) -> String {
    let mut rest = text;
    if !rest.contains(THINK_OPEN) {
        if let Some(end) = rest.rfind(THINK_CLOSE) {
            rest = &rest[end + THINK_CLOSE.len()..];
        }
    }

    let mut out = String::with_capacity(rest.len());
    while let Some(start) = rest.find(THINK_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + THINK_OPEN.len()..];
        match after.find(THINK_CLOSE) {
            Some(end) => rest = &after[end + THINK_CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StalledProvider;

    #[async_trait::async_trait]
    impl LlmProvider for StalledProvider {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Err(LlmError::Timeout(Duration::from_secs(120)))
        }

        fn default_model(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_an_in_flight_completion() {
        let client = LlmClient::new(Arc::new(StalledProvider), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = client.complete(&cancel, &LlmRequest::new("system").user("hi")).await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Sure! ```json\n{\"a\": 1}\n``` hope that helps";
        assert_eq!(extract_json_from_text(text).as_deref(), Some("{\"a\": 1}"));
        assert_eq!(extract_json_from_text("x {\"b\": 2} y").as_deref(), Some("{\"b\": 2}"));
        assert_eq!(extract_json_from_text("no json here"), None);
    }

    #[test]
    fn strips_thinking_blocks() {
        assert_eq!(strip_thinking("<think>hmm</think>The answer."), "The answer.");
        assert_eq!(strip_thinking("a <think>x</think> b <think>y</think> c"), "a  b  c");
        assert_eq!(strip_thinking("reasoning...</think>\nSummary"), "Summary");
        assert_eq!(strip_thinking("Summary <think>never closed"), "Summary");
        assert_eq!(strip_thinking("plain"), "plain");
    }

    #[test]
    fn parses_json_after_thinking() {
        #[derive(Deserialize)]
        struct Out {
            ok: bool,
        }
        let out: Out = parse_json_response("<think>{\"ok\": false}</think>```json\n{\"ok\": true}\n```").unwrap();
        assert!(out.ok);
        assert!(parse_json_response::<Out>("not json").is_err());
    }
}
