//! Remote embedding client. Optional: when unconfigured or unavailable the
//! extractor uses the deterministic fallback embedding instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::CircuitBreaker;
use crate::error::RouterError;

/// Seam between the extractor and whatever produces embeddings. Tests inject
/// in-process fakes; production wires `HttpEmbeddingBackend`.
#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed `text` within `budget`. Implementations must return promptly
    /// once the budget is spent; callers treat any error as "use fallback".
    async fn embed(&self, text: &str, budget: Duration) -> Result<Vec<f32>, RouterError>;
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingBackend {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpEmbeddingBackend {
    pub fn new(url: String, timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        // Per-request timeouts are applied at call time; the builder default
        // is only a backstop.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("failed to build embedding http client");
        Self {
            url,
            timeout,
            client,
            breaker,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, text: &str, budget: Duration) -> Result<Vec<f32>, RouterError> {
        self.breaker.admit()?;
        let timeout = self.timeout.min(budget);
        if timeout.is_zero() {
            // Not a service failure; leave the breaker untouched.
            return Err(RouterError::DeadlineExceeded);
        }
        let result = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await;
        let resp = match result {
            Ok(r) => r,
            Err(err) => {
                self.breaker.record_failure();
                return Err(RouterError::EmbeddingService(err.to_string()));
            }
        };
        if !resp.status().is_success() {
            self.breaker.record_failure();
            return Err(RouterError::EmbeddingService(format!(
                "status {}",
                resp.status()
            )));
        }
        match resp.json::<EmbedResponse>().await {
            Ok(body) => {
                self.breaker.record_success();
                Ok(body.embedding)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(RouterError::EmbeddingService(format!("decode: {}", err)))
            }
        }
    }
}
