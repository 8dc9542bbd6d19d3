use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ProviderError;
use crate::ledger::models::SourceType;

/// Bounded retry with exponential backoff for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Build a provider HTTP client with a conservative request timeout
pub fn build_client(timeout_secs: u64) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
        .user_agent(concat!("revenue-engine/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Authentication failures are never retried.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                warn!(
                    "⚠️ {} failed ({}), retrying in {:?} (attempt {}/{})",
                    operation, e, delay, attempt, policy.max_retries
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub fn classify_status(provider: SourceType, status: u16, body: &str) -> ProviderError {
    let message: String = body.chars().take(300).collect();
    match status {
        401 | 403 => ProviderError::Unauthorized { provider, status, message },
        429 => ProviderError::RateLimited { provider },
        408 | 504 => ProviderError::Timeout { provider },
        500..=599 => ProviderError::Transient {
            provider,
            message: format!("HTTP {}: {}", status, message),
        },
        _ => ProviderError::Rejected { provider, status, message },
    }
}

/// Turn a response into a typed body, mapping failure statuses and schema errors
pub async fn read_json<T: DeserializeOwned>(
    provider: SourceType,
    response: Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, status.as_u16(), &body));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;

    serde_json::from_slice(&bytes).map_err(|e| ProviderError::MalformedPayload {
        provider,
        message: e.to_string(),
    })
}
