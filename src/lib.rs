//! Core library for Heimdall, a request-routing pre-hook for an LLM
//! gateway. This module wires together the routing pipeline, payload
//! structures, shared plugin state and the HTTP handlers that embed the
//! plugin into a host.

pub mod artifact;
pub mod auth;
pub mod breaker;
pub mod bucket;
pub mod cache;
mod config;
pub mod catalog;
pub mod embedding;
pub mod error;
pub mod features;
pub mod gbdt;
pub mod hook;
pub mod scorer;
pub mod util;

pub use config::{AppConfig, RotationConfig, RouterConfig};
pub use error::RouterError;
pub use hook::{decide, DecideOutcome};

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{rejection::JsonRejection, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use crate::artifact::{ArtifactManager, ArtifactStore};
use crate::auth::{AuthAdapterRegistry, Headers};
use crate::breaker::CircuitBreakers;
use crate::bucket::{Bucket, BucketProbs, CandidatePools};
use crate::cache::DecisionCache;
use crate::catalog::CatalogClient;
use crate::embedding::{EmbeddingBackend, HttpEmbeddingBackend};
use crate::features::FeatureExtractor;
use crate::scorer::{AlphaScorer, ScoredCandidate};
use crate::util::LatencyHistogram;

/// Chat payload shapes. Only the fields the router needs are modeled;
/// everything else rides along in `extra` and is echoed back untouched.

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// A header value as gateways forward them: either a single string or an
/// ordered list.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RouteRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    /// Caller-supplied model hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, HeaderValues>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DecisionExplanation {
    pub probs: BucketProbs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<String>,
    pub alpha_used: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explore_seed: Option<u64>,
    pub gbdt_source: String,
    pub ranked: Vec<ScoredCandidate>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub bucket: Bucket,
    pub model: String,
    pub fallbacks: Vec<String>,
    /// Provider-specific thinking parameters; keys keep their wire names.
    pub thinking: serde_json::Map<String, serde_json::Value>,
    pub alpha_score: f64,
    pub explanation: DecisionExplanation,
    /// Version of the artifact this decision was computed against; empty
    /// when no artifact had been published.
    pub artifact_version: String,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

pub struct Metrics {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub deadline_exceeded_total: AtomicU64,
    pub latency: LatencyHistogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            deadline_exceeded_total: AtomicU64::new(0),
            latency: LatencyHistogram::new_request_scale(),
        }
    }

    pub fn note_deadline_exceeded(&self) {
        self.deadline_exceeded_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// All process-long mutable state, passed explicitly into every handler so
/// tests can build a fresh instance per case.
#[derive(Clone)]
pub struct PluginState {
    pub config: Arc<AppConfig>,
    pub pools: Arc<CandidatePools>,
    pub extractor: Arc<FeatureExtractor>,
    pub scorer: Arc<AlphaScorer>,
    pub decision_cache: Arc<DecisionCache>,
    pub artifacts: Arc<ArtifactStore>,
    pub auth: Arc<AuthAdapterRegistry>,
    pub breakers: Arc<CircuitBreakers>,
    pub catalog: Option<Arc<CatalogClient>>,
    pub artifact_manager: Option<Arc<ArtifactManager>>,
    pub metrics: Arc<Metrics>,
    pub decision_log: DecisionLog,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl PluginState {
    /// Construct state from a validated config. Does not start background
    /// tasks; see [`PluginState::spawn_background`].
    pub fn build(config: AppConfig) -> Result<Self, RouterError> {
        config.router.validate()?;
        let breakers = Arc::new(CircuitBreakers::new(config.router.breaker_config()));
        let backend: Option<Arc<dyn EmbeddingBackend>> =
            config.router.embedding_url.as_ref().map(|url| {
                Arc::new(HttpEmbeddingBackend::new(
                    url.clone(),
                    Duration::from_millis(config.router.embedding_timeout_ms),
                    breakers.embedding.clone(),
                )) as Arc<dyn EmbeddingBackend>
            });
        Self::build_with_embedding(config, breakers, backend)
    }

    /// Same as [`PluginState::build`] but with an injected embedding
    /// backend; the seam tests and benches use.
    pub fn build_with_embedding(
        config: AppConfig,
        breakers: Arc<CircuitBreakers>,
        backend: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Result<Self, RouterError> {
        config.router.validate()?;
        let router = &config.router;

        let pools = Arc::new(router.candidate_pools());
        let extractor = Arc::new(FeatureExtractor::new(
            router.feature_byte_budget,
            router.router.top_p,
            router.router.default_context_limit,
            backend,
        ));
        let scorer = Arc::new(AlphaScorer::new(router.scorer_params()));
        let decision_cache = Arc::new(DecisionCache::new(
            Duration::from_secs(router.cache_ttl_seconds),
            router.max_cache_size,
        ));
        let artifacts = Arc::new(ArtifactStore::new());

        let artifact_manager = router.tuning.artifact_url.as_ref().map(|url| {
            Arc::new(ArtifactManager::new(
                url.clone(),
                Duration::from_secs(router.tuning.reload_seconds),
                Duration::from_secs(router.tuning.backoff_cap_seconds),
                artifacts.clone(),
                breakers.artifact.clone(),
            ))
        });

        let catalog = router
            .catalog_config()
            .map(|cfg| Arc::new(CatalogClient::new(cfg, breakers.catalog.clone())));

        let decision_log = DecisionLog::from_config(&config);

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Self {
            config: Arc::new(config),
            pools,
            extractor,
            scorer,
            decision_cache,
            artifacts,
            auth: Arc::new(AuthAdapterRegistry::with_default_adapters()),
            breakers,
            catalog,
            artifact_manager,
            metrics: Arc::new(Metrics::new()),
            decision_log,
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        })
    }

    /// Start the artifact refresh loop and the catalog cache sweeper.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(manager) = &self.artifact_manager {
            handles.push(ArtifactManager::spawn(manager.clone()));
        }
        if let Some(catalog) = &self.catalog {
            handles.push(CatalogClient::spawn_sweeper(catalog.clone()));
        }
        handles
    }
}

/// Build state from environment variables (`HEIMDALL_CONFIG` and friends)
/// and start the background tasks.
pub async fn build_state_from_env() -> Result<PluginState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    let state = PluginState::build(config)?;
    state.spawn_background();
    Ok(state)
}

/// Size-based rotating JSONL writer; keeps N backups and optionally gzips
/// the freshest one.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: &RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes: rotation.max_bytes,
            keep: rotation.keep,
            compress: rotation.compress,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            let over = self
                .path
                .metadata()
                .map(|m| m.len() >= limit)
                .unwrap_or(false);
            if over {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn rotate(&mut self) {
        if self.keep > 0 {
            for idx in (1..=self.keep).rev() {
                let from = if idx == 1 {
                    self.path.clone()
                } else {
                    self.path.with_extension(format!("{}", idx - 1))
                };
                if from.exists() {
                    let _ = fs::rename(&from, self.path.with_extension(format!("{}", idx)));
                }
            }
            if self.compress {
                self.gzip_first_backup();
            }
        }
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }

    fn gzip_first_backup(&self) {
        let rotated = self.path.with_extension("1");
        let Ok(data) = fs::read(&rotated) else { return };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_ok() {
            if let Ok(buf) = gz.finish() {
                let _ = fs::write(rotated.with_extension("1.gz"), buf);
                let _ = fs::remove_file(&rotated);
            }
        }
    }
}

pub struct DecisionLogFields<'a> {
    pub bucket: &'a str,
    pub model: &'a str,
    pub cache_hit: bool,
    pub degraded: bool,
    pub latency_us: u128,
}

/// JSONL decision telemetry with sampled stdout mirroring.
#[derive(Clone)]
pub struct DecisionLog {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    sample_n: Option<u64>,
    sample_counter: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl DecisionLog {
    pub fn from_config(config: &AppConfig) -> Self {
        let writer = match config.log_file.as_deref() {
            Some(path) => match RotatingWriter::open(path, &config.rotation) {
                Ok(w) => Some(Arc::new(Mutex::new(w))),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open decision log; telemetry disabled");
                    None
                }
            },
            None => None,
        };
        Self {
            writer,
            log_stdout: config.log_stdout,
            sample_n: config.log_sample_n,
            sample_counter: Arc::new(AtomicU64::new(0)),
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, record: &serde_json::Value, summary: &DecisionLogFields<'_>) {
        if let Some(writer) = &self.writer {
            if let Ok(mut guard) = writer.lock() {
                match guard.write_line(&record.to_string()) {
                    Ok(()) => {
                        self.lines_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to write decision log line");
                        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if self.should_log_stdout() {
            tracing::info!(
                target = "decisions",
                bucket = summary.bucket,
                model = summary.model,
                cacheHit = summary.cache_hit,
                degraded = summary.degraded,
                latencyUs = summary.latency_us as u64,
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size(&self) -> u64 {
        self.writer
            .as_ref()
            .and_then(|w| w.lock().ok())
            .and_then(|w| w.current_size())
            .unwrap_or(0)
    }

    fn should_log_stdout(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        match self.sample_n {
            Some(n) => self.sample_counter.fetch_add(1, Ordering::Relaxed) % n == 0,
            None => true,
        }
    }
}

/// Build the axum router with the pre-hook, health and metrics endpoints.
pub fn app(state: PluginState) -> Router {
    let max_request_bytes = state.config.router.max_request_bytes;

    let router = Router::new()
        .route("/v1/hook/pre", post(pre_hook_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(RequestBodyLimitLayer::new(limit))
    } else {
        router
    };

    router.with_state(state)
}

/// Merge payload-carried headers (the original request's, forwarded by the
/// gateway) with transport headers; payload entries win on lookup.
fn merged_headers(payload: &RouteRequest, transport: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, values) in &payload.headers {
        match values {
            HeaderValues::One(v) => headers.insert(name, v.clone()),
            HeaderValues::Many(vs) => {
                for v in vs {
                    headers.insert(name, v.clone());
                }
            }
        }
    }
    for (name, value) in transport {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str(), v);
        }
    }
    headers
}

async fn pre_hook_handler(
    State(state): State<PluginState>,
    transport_headers: HeaderMap,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> axum::response::Response {
    let payload = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => {
            let status = rejection.status();
            let body = serde_json::json!({ "error": rejection.body_text() });
            return (status, Json(body)).into_response();
        }
    };

    let start = Instant::now();
    let cfg = &state.config.router;
    let headers = merged_headers(&payload, &transport_headers);

    // The deadline lives inside decide(); the grace window here is the hard
    // ceiling promised to the host.
    let ceiling = Duration::from_millis(cfg.timeout_ms + cfg.grace_ms);
    let outcome = match tokio::time::timeout(ceiling, decide(&state, &payload, &headers)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            state.metrics.note_deadline_exceeded();
            DecideOutcome {
                decision: hook::safe_default(&state, &state.artifacts.version(), "deadline-exceeded"),
                auth: None,
                cache_hit: false,
                features: None,
            }
        }
    };
    let latency = start.elapsed();

    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    if outcome.decision.degraded {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    state.metrics.latency.record(latency);

    let decision = &outcome.decision;
    state.decision_log.emit(
        &serde_json::json!({
            "schemaVersion": 1,
            "ts": chrono::Utc::now().to_rfc3339(),
            "bucket": decision.bucket.as_str(),
            "model": decision.model,
            "artifactVersion": decision.artifact_version,
            "cacheHit": outcome.cache_hit,
            "degraded": decision.degraded,
            "fallbackReason": decision.fallback_reason,
            "latencyUs": latency.as_micros() as u64,
        }),
        &DecisionLogFields {
            bucket: decision.bucket.as_str(),
            model: &decision.model,
            cache_hit: outcome.cache_hit,
            degraded: decision.degraded,
            latency_us: latency.as_micros(),
        },
    );

    // Echo the request with the routing outcome applied.
    let mut mutated = payload.clone();
    mutated.model = Some(decision.model.clone());
    let mut body = match serde_json::to_value(&mutated) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if !decision.fallbacks.is_empty() {
        body.insert("fallbacks".into(), serde_json::json!(decision.fallbacks));
    }
    if !decision.thinking.is_empty() {
        body.insert(
            "thinking".into(),
            serde_json::Value::Object(decision.thinking.clone()),
        );
    }
    body.insert(
        "heimdall_bucket".into(),
        serde_json::Value::String(decision.bucket.as_str().into()),
    );
    body.insert(
        "heimdall_decision".into(),
        serde_json::to_value(decision).unwrap_or(serde_json::Value::Null),
    );
    if cfg.enable_observability {
        if let Some(features) = &outcome.features {
            body.insert(
                "heimdall_features".into(),
                serde_json::to_value(features).unwrap_or(serde_json::Value::Null),
            );
        }
    }
    if let Some(auth) = &outcome.auth {
        body.insert(
            "heimdall_auth_info".into(),
            serde_json::to_value(auth).unwrap_or(serde_json::Value::Null),
        );
    }
    body.insert("heimdall_cache_hit".into(), outcome.cache_hit.into());
    if let Some(reason) = &decision.fallback_reason {
        body.insert(
            "heimdall_fallback_reason".into(),
            serde_json::Value::String(reason.clone()),
        );
    }

    (StatusCode::OK, Json(serde_json::Value::Object(body))).into_response()
}

async fn healthz_handler(State(state): State<PluginState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "artifactVersion": state.artifacts.version(),
        "artifactAgeSeconds": state.artifacts.age().map(|d| d.as_secs()),
        "budgetMs": state.config.router.timeout_ms,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style text exposition.
async fn metrics_handler(State(state): State<PluginState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();

    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let deadline = state.metrics.deadline_exceeded_total.load(Ordering::Relaxed);

    writeln!(
        &mut buf,
        "# HELP heimdall_requests_total Routing decisions requested\n# TYPE heimdall_requests_total counter"
    )
    .ok();
    writeln!(&mut buf, "heimdall_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_errors_total Degraded decisions served\n# TYPE heimdall_errors_total counter"
    )
    .ok();
    writeln!(&mut buf, "heimdall_errors_total {}", errors).ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_deadline_exceeded_total Decisions replaced by the safe default\n# TYPE heimdall_deadline_exceeded_total counter"
    )
    .ok();
    writeln!(&mut buf, "heimdall_deadline_exceeded_total {}", deadline).ok();

    // Decision cache.
    writeln!(
        &mut buf,
        "# HELP heimdall_cache_hits_total Decision cache hits\n# TYPE heimdall_cache_hits_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_cache_hits_total {}",
        state.decision_cache.hit_count()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_cache_misses_total Decision cache misses\n# TYPE heimdall_cache_misses_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_cache_misses_total {}",
        state.decision_cache.miss_count()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_cache_entries Live decision cache entries\n# TYPE heimdall_cache_entries gauge"
    )
    .ok();
    writeln!(&mut buf, "heimdall_cache_entries {}", state.decision_cache.len()).ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_score_cache_entries Live score cache entries\n# TYPE heimdall_score_cache_entries gauge"
    )
    .ok();
    writeln!(&mut buf, "heimdall_score_cache_entries {}", state.scorer.cache_len()).ok();

    // Artifact.
    writeln!(
        &mut buf,
        "# HELP heimdall_artifact_info Currently published artifact\n# TYPE heimdall_artifact_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_artifact_info{{version=\"{}\"}} 1",
        state.artifacts.version()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_artifact_age_seconds Seconds since the artifact was published\n# TYPE heimdall_artifact_age_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_artifact_age_seconds {}",
        state.artifacts.age().map(|d| d.as_secs()).unwrap_or(0)
    )
    .ok();
    if let Some(manager) = &state.artifact_manager {
        writeln!(
            &mut buf,
            "# HELP heimdall_artifact_fetch_errors_total Failed artifact refreshes\n# TYPE heimdall_artifact_fetch_errors_total counter"
        )
        .ok();
        writeln!(
            &mut buf,
            "heimdall_artifact_fetch_errors_total {}",
            manager.fetch_error_count()
        )
        .ok();
    }

    // Circuit breakers.
    writeln!(
        &mut buf,
        "# HELP heimdall_circuit_state Current state per breaker\n# TYPE heimdall_circuit_state gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_circuit_trips_total Times each breaker opened\n# TYPE heimdall_circuit_trips_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_circuit_transitions_total State transitions per breaker\n# TYPE heimdall_circuit_transitions_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_circuit_time_in_state_seconds Seconds in the current state per breaker\n# TYPE heimdall_circuit_time_in_state_seconds gauge"
    )
    .ok();
    for breaker in state.breakers.all() {
        writeln!(
            &mut buf,
            "heimdall_circuit_state{{breaker=\"{}\",state=\"{}\"}} 1",
            breaker.name(),
            breaker.state_name()
        )
        .ok();
        writeln!(
            &mut buf,
            "heimdall_circuit_trips_total{{breaker=\"{}\"}} {}",
            breaker.name(),
            breaker.trip_count()
        )
        .ok();
        writeln!(
            &mut buf,
            "heimdall_circuit_transitions_total{{breaker=\"{}\"}} {}",
            breaker.name(),
            breaker.transition_count()
        )
        .ok();
        writeln!(
            &mut buf,
            "heimdall_circuit_time_in_state_seconds{{breaker=\"{}\"}} {}",
            breaker.name(),
            breaker.time_in_state().as_secs_f64()
        )
        .ok();
    }

    // Catalog client.
    if let Some(catalog) = &state.catalog {
        writeln!(
            &mut buf,
            "# HELP heimdall_catalog_not_found_total Authoritative catalog 404s\n# TYPE heimdall_catalog_not_found_total counter"
        )
        .ok();
        writeln!(
            &mut buf,
            "heimdall_catalog_not_found_total {}",
            catalog.not_found_count()
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP heimdall_catalog_errors_total Catalog fetches that exhausted retries\n# TYPE heimdall_catalog_errors_total counter"
        )
        .ok();
        writeln!(&mut buf, "heimdall_catalog_errors_total {}", catalog.error_count()).ok();
        writeln!(
            &mut buf,
            "# HELP heimdall_catalog_retries_total Catalog request retries\n# TYPE heimdall_catalog_retries_total counter"
        )
        .ok();
        writeln!(&mut buf, "heimdall_catalog_retries_total {}", catalog.retry_count()).ok();
        writeln!(
            &mut buf,
            "# HELP heimdall_catalog_cache_entries Live catalog cache entries\n# TYPE heimdall_catalog_cache_entries gauge"
        )
        .ok();
        writeln!(&mut buf, "heimdall_catalog_cache_entries {}", catalog.cache_len()).ok();
    }

    // Latency histogram (microseconds) plus quantile gauges.
    writeln!(
        &mut buf,
        "# HELP heimdall_request_latency_us Pre-hook latency histogram (us)\n# TYPE heimdall_request_latency_us histogram"
    )
    .ok();
    let hist = &state.metrics.latency;
    let mut cumulative = 0u64;
    for (i, ub) in hist.bounds().iter().enumerate() {
        cumulative += hist.count_at(i);
        writeln!(
            &mut buf,
            "heimdall_request_latency_us_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "heimdall_request_latency_us_bucket{{le=\"+Inf\"}} {}",
        hist.total()
    )
    .ok();
    writeln!(&mut buf, "heimdall_request_latency_us_sum {}", hist.sum_us()).ok();
    writeln!(&mut buf, "heimdall_request_latency_us_count {}", hist.total()).ok();
    for (name, q) in [
        ("heimdall_latency_p50_us", 0.5),
        ("heimdall_latency_p95_us", 0.95),
        ("heimdall_latency_p99_us", 0.99),
    ] {
        writeln!(
            &mut buf,
            "# HELP {} Approximate latency quantile (us)\n# TYPE {} gauge",
            name, name
        )
        .ok();
        writeln!(&mut buf, "{} {}", name, hist.quantile_us(q)).ok();
    }

    // Decision log.
    writeln!(
        &mut buf,
        "# HELP heimdall_decision_log_lines_total Decision log lines written\n# TYPE heimdall_decision_log_lines_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_decision_log_lines_total {}",
        state.decision_log.lines_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_decision_log_write_errors_total Decision log write failures\n# TYPE heimdall_decision_log_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_decision_log_write_errors_total {}",
        state.decision_log.write_errors_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_log_file_size_bytes Current decision log size\n# TYPE heimdall_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(&mut buf, "heimdall_log_file_size_bytes {}", state.decision_log.file_size()).ok();

    // Build/process info.
    writeln!(
        &mut buf,
        "# HELP heimdall_build_info Build information\n# TYPE heimdall_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE heimdall_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP heimdall_process_uptime_seconds Process uptime seconds\n# TYPE heimdall_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "heimdall_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
