//! Model-catalog HTTP client: retry with exponential backoff on 5xx and
//! transport errors, authoritative 4xx, a per-endpoint TTL cache with a
//! background sweeper, and last-known-value degradation.
//!
//! A 404 ("unknown model") and a dead catalog both surface to callers as an
//! absent value, but they bump different counters so operators can tell the
//! two apart; absent pricing is never folded into a zero price.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::CircuitBreaker;
use crate::error::RouterError;
use crate::util::fnv1a;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelInfo {
    pub slug: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Capabilities {
    pub slug: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pricing {
    pub slug: String,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub base_url: String,
    pub ttl: Duration,
    pub max_entries: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub sweep_interval: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            ttl: Duration::from_secs(300),
            max_entries: 1_000,
            max_retries: 3,
            backoff_base: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct CacheSlot {
    value: Value,
    expires_at: Instant,
}

enum Fetch {
    Fresh(Value),
    NotFound,
    Failed,
}

pub struct CatalogClient {
    cfg: CatalogConfig,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    cache: DashMap<u64, CacheSlot>,
    last_known: DashMap<u64, Value>,
    not_found_total: AtomicU64,
    errors_total: AtomicU64,
    retries_total: AtomicU64,
}

impl CatalogClient {
    pub fn new(cfg: CatalogConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build catalog http client");
        Self {
            cfg,
            client,
            breaker,
            cache: DashMap::new(),
            last_known: DashMap::new(),
            not_found_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
        }
    }

    pub fn not_found_count(&self) -> u64 {
        self.not_found_total.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// `GET /v1/models` with optional provider/family filters. Persistent
    /// failure degrades to last-known, then to empty.
    pub async fn models(&self, filters: &[(&str, &str)]) -> Vec<ModelInfo> {
        let mut sorted: Vec<(String, String)> = filters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        let key = Self::cache_key("models", &sorted);
        let value = self
            .fetch_cached(key, &["v1", "models"], &sorted)
            .await;
        match value {
            Some(v) => v
                .get("models")
                .and_then(|m| serde_json::from_value(m.clone()).ok())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// `GET /v1/capabilities/{model}`. `None` covers both "unknown model"
    /// and "catalog down"; the counters disambiguate.
    pub async fn capabilities(&self, slug: &str) -> Option<Capabilities> {
        let key = Self::cache_key("capabilities", &[("slug".into(), slug.into())]);
        let value = self
            .fetch_cached(key, &["v1", "capabilities", slug], &[])
            .await?;
        serde_json::from_value(value).ok()
    }

    /// `GET /v1/pricing/{model}`. Absent pricing is `None`, never zero.
    pub async fn pricing(&self, slug: &str) -> Option<Pricing> {
        let key = Self::cache_key("pricing", &[("slug".into(), slug.into())]);
        let value = self
            .fetch_cached(key, &["v1", "pricing", slug], &[])
            .await?;
        serde_json::from_value(value).ok()
    }

    /// `GET /v1/feature-flags`.
    pub async fn feature_flags(&self) -> HashMap<String, bool> {
        let key = Self::cache_key("feature-flags", &[]);
        let value = self.fetch_cached(key, &["v1", "feature-flags"], &[]).await;
        match value {
            Some(v) => v
                .get("flags")
                .and_then(|f| serde_json::from_value(f.clone()).ok())
                .unwrap_or_default(),
            None => HashMap::new(),
        }
    }

    /// `GET /health`. Uncached.
    pub async fn health(&self) -> bool {
        let Ok(url) = self.endpoint_url(&["health"], &[]) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn cache_key(endpoint: &str, params: &[(String, String)]) -> u64 {
        let mut canonical = String::from(endpoint);
        for (k, v) in params {
            canonical.push('|');
            canonical.push_str(k);
            canonical.push('=');
            canonical.push_str(v);
        }
        fnv1a(canonical.as_bytes())
    }

    async fn fetch_cached(
        &self,
        key: u64,
        segments: &[&str],
        query: &[(String, String)],
    ) -> Option<Value> {
        if let Some(slot) = self.cache.get(&key) {
            if slot.expires_at > Instant::now() {
                return Some(slot.value.clone());
            }
            drop(slot);
            self.cache.remove(&key);
        }
        match self.fetch(segments, query).await {
            Fetch::Fresh(value) => {
                self.store(key, value.clone());
                self.last_known.insert(key, value.clone());
                Some(value)
            }
            Fetch::NotFound => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
                None
            }
            Fetch::Failed => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
                self.last_known.get(&key).map(|v| v.value().clone())
            }
        }
    }

    fn store(&self, key: u64, value: Value) {
        if self.cache.len() >= self.cfg.max_entries {
            let now = Instant::now();
            self.cache.retain(|_, slot| slot.expires_at > now);
            while self.cache.len() >= self.cfg.max_entries {
                // Still full after the TTL pass: drop the soonest-to-expire.
                let victim = self
                    .cache
                    .iter()
                    .min_by_key(|e| e.expires_at)
                    .map(|e| *e.key());
                match victim {
                    Some(k) => {
                        self.cache.remove(&k);
                    }
                    None => break,
                }
            }
        }
        self.cache.insert(
            key,
            CacheSlot {
                value,
                expires_at: Instant::now() + self.cfg.ttl,
            },
        );
    }

    fn endpoint_url(
        &self,
        segments: &[&str],
        query: &[(String, String)],
    ) -> Result<reqwest::Url, RouterError> {
        let mut url = reqwest::Url::parse(&self.cfg.base_url)
            .map_err(|e| RouterError::CatalogUnavailable(format!("base url: {}", e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RouterError::CatalogUnavailable("opaque base url".into()))?;
            path.pop_if_empty();
            for segment in segments {
                // Url escapes each segment, so a slug like `openai/gpt-5`
                // stays a single path element.
                path.push(segment);
            }
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn fetch(&self, segments: &[&str], query: &[(String, String)]) -> Fetch {
        if self.breaker.admit().is_err() {
            return Fetch::Failed;
        }
        let url = match self.endpoint_url(segments, query) {
            Ok(u) => u,
            Err(err) => {
                tracing::warn!(error = %err, "catalog url construction failed");
                self.breaker.record_failure();
                return Fetch::Failed;
            }
        };
        let mut delay = self.cfg.backoff_base;
        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                self.retries_total.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(value) => {
                                self.breaker.record_success();
                                return Fetch::Fresh(value);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "catalog response decode failed");
                                self.breaker.record_failure();
                                return Fetch::Failed;
                            }
                        }
                    }
                    if status.is_client_error() {
                        // Authoritative; retrying cannot help.
                        self.breaker.record_success();
                        return if status == reqwest::StatusCode::NOT_FOUND {
                            Fetch::NotFound
                        } else {
                            tracing::warn!(status = %status, "catalog rejected request");
                            Fetch::Failed
                        };
                    }
                    tracing::debug!(status = %status, attempt, "catalog server error, will retry");
                }
                Err(err) => {
                    tracing::debug!(error = %err, attempt, "catalog transport error, will retry");
                }
            }
        }
        self.breaker.record_failure();
        Fetch::Failed
    }

    /// Cull expired cache entries at a coarse interval.
    pub fn spawn_sweeper(client: Arc<CatalogClient>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval = client.cfg.sweep_interval;
            loop {
                tokio::time::sleep(interval).await;
                let now = Instant::now();
                let before = client.cache.len();
                client.cache.retain(|_, slot| slot.expires_at > now);
                let culled = before.saturating_sub(client.cache.len());
                if culled > 0 {
                    tracing::debug!(culled, "catalog cache sweep");
                }
            }
        })
    }
}
