//! Gemini-class primary provider binding.
//!
//! A raw `reqwest` JSON POST, not a generated client: this crate needs
//! full control over status-code categorization (auth vs. rate-limit vs.
//! transient server) that an opaque chat-completion wrapper would hide.
//! Request/response shapes follow `SPEC_FULL.md §6.1`: content parts,
//! generation config, and a `candidates[0].content.parts[0].text` /
//! `usageMetadata.totalTokenCount` response envelope.

use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};

use crate::error::ProviderError;
use crate::provider::{call_with_retry, estimate_tokens, ProviderAdapter, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiProvider {
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        GeminiProvider {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs_f64(30.0),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    async fn call_once(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = json!({
            "contents": [{
                "parts": [{ "text": request.prompt }]
            }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens,
                "stopSequences": request.stop_sequences,
            }
        });

        let started = Instant::now();
        let client = super::shared_http_client();
        let response = client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Server(0)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Auth(format!("HTTP {}", status)));
        }
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimit);
        }
        if status.is_server_error() {
            return Err(ProviderError::Server(status.as_u16()));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if let Some(error) = response_json.get("error") {
            return Err(ProviderError::MalformedResponse(error.to_string()));
        }

        let content = response_json
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing candidates[0].content.parts[0].text".into())
            })?
            .to_string();

        let (prompt_tokens, completion_tokens) = response_json
            .get("usageMetadata")
            .map(|u| {
                let prompt = u
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or_else(|| estimate_tokens(&request.prompt));
                let completion = u
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or_else(|| estimate_tokens(&content));
                (prompt, completion)
            })
            .unwrap_or_else(|| (estimate_tokens(&request.prompt), estimate_tokens(&content)));

        Ok(ProviderResponse {
            content,
            prompt_tokens,
            completion_tokens,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match tokio::time::timeout(
            self.timeout,
            call_with_retry(self.max_retries, || self.call_once(&request)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
