//! In-memory provider binding used throughout the test suite, promoted
//! to a library-level fixture since every component's tests (and the
//! end-to-end scenario tests) need one.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::provider::{estimate_tokens, ProviderAdapter, ProviderRequest, ProviderResponse};

/// Returns a configurable canned response, optionally after failing a
/// fixed number of times (to exercise a caller's retry loop) or after a
/// configurable simulated latency.
pub struct MockProvider {
    response: Mutex<String>,
    fail_times: AtomicU32,
    failure: ProviderError,
    latency: Duration,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn new(response: impl Into<String>) -> Self {
        MockProvider {
            response: Mutex::new(response.into()),
            fail_times: AtomicU32::new(0),
            failure: ProviderError::Server(503),
            latency: Duration::from_millis(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_fail_times(mut self, times: u32, failure: ProviderError) -> Self {
        self.fail_times = AtomicU32::new(times);
        self.failure = failure;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_response(&self, response: impl Into<String>) {
        *self.response.lock().await = response.into();
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(self.failure.clone());
        }
        let content = self.response.lock().await.clone();
        Ok(ProviderResponse {
            prompt_tokens: estimate_tokens(&request.prompt),
            completion_tokens: estimate_tokens(&content),
            content,
            elapsed: self.latency,
        })
    }

    fn model_name(&self) -> &str {
        "mock-provider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_after_configured_failures() {
        let mock = MockProvider::new("hello").with_fail_times(2, ProviderError::RateLimit);
        assert!(mock.call(ProviderRequest::new("hi")).await.is_err());
        assert!(mock.call(ProviderRequest::new("hi")).await.is_err());
        let response = mock.call(ProviderRequest::new("hi")).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(mock.call_count(), 3);
    }
}
