//! Concrete [`ProviderAdapter`](crate::provider::ProviderAdapter) bindings.
//!
//! `spec.md` resolves the source's multi-provider question by fixing "one
//! provider with retries" — this crate ships exactly one primary binding
//! ([`gemini`]) plus an in-memory [`mock`] binding used throughout the
//! test suite.

pub mod gemini;
pub mod mock;

use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// One shared, connection-pooled `reqwest::Client` for the crate's single
/// provider binding, since this crate only ever talks to one provider
/// base URL.
static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
});

pub(crate) fn shared_http_client() -> Client {
    SHARED_CLIENT.clone()
}
