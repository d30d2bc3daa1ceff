//! LLM Provider Adapter (C2).
//!
//! One outbound call to one provider. [`ProviderAdapter`] is the trait a
//! host's binding implements; this crate ships exactly one concrete
//! binding ([`clients::gemini::GeminiProvider`]) plus a
//! [`clients::mock::MockProvider`] for tests. Multi-provider routing is
//! out of scope — see `SPEC_FULL.md §9`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ProviderError;

/// A single request to the provider boundary (`SPEC_FULL.md §6.1`):
/// text content, generation config, and an optional set of stop
/// sequences.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        ProviderRequest {
            prompt: prompt.into(),
            temperature: 0.7,
            max_output_tokens: 1024,
            stop_sequences: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed: Duration,
}

/// `ceil(len(prompt+content)/4)` — the estimator used whenever the
/// provider itself does not return a token count, applied uniformly at
/// every call site in this crate (see `SPEC_FULL.md §3.1`).
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as f64) / 4.0).ceil() as u64
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Performs the outbound call, including retry/backoff. Implementors
    /// should NOT retry on `ProviderError::Auth` or
    /// `ProviderError::MalformedResponse`; only `RateLimit`/`Server` are
    /// retryable (`ProviderError::retryable`).
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    fn model_name(&self) -> &str;
}

/// Runs `attempt` up to `max_retries + 1` times, retrying only on
/// [`ProviderError::retryable`] errors with exponential backoff starting
/// at 250ms. Shared by every concrete binding so the retry policy lives
/// in exactly one place.
pub async fn call_with_retry<F, Fut>(
    max_retries: u32,
    mut attempt: F,
) -> Result<ProviderResponse, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<ProviderResponse, ProviderError>>,
{
    let mut delay = Duration::from_millis(250);
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(response) => return Ok(response),
            Err(e) if e.retryable() && tries < max_retries => {
                tries += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
