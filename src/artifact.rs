//! Tuning artifact: schema, validation, the atomically swapped current
//! snapshot and the background fetch loop.
//!
//! Readers grab one `Arc<Artifact>` snapshot per request and pass it down
//! the pipeline; the fetcher publishes a fresh artifact by swapping the
//! reference. Neither side ever blocks the other, and an artifact is never
//! mutated after publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::error::RouterError;
use crate::features::EMBEDDING_DIM;
use crate::gbdt::GbdtModel;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Thresholds {
    pub cheap: f64,
    pub hard: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Penalties {
    #[serde(default, alias = "latencySd")]
    pub latency_sd: f64,
    #[serde(default, alias = "ctxOver80Pct", alias = "ctx_over_80_pct")]
    pub ctx_over_80pct: f64,
    /// Per-model additive adjustments, e.g. deprecation nudges.
    #[serde(default, alias = "modelAdjustments")]
    pub model_adjustments: HashMap<String, f64>,
}

/// Immutable ML bundle produced by the training pipeline. Unknown wire
/// fields are ignored for forward compatibility; missing required fields
/// fail deserialization and the artifact is rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub version: String,
    pub alpha: f64,
    pub thresholds: Thresholds,
    pub penalties: Penalties,
    /// Per-model quality scores indexed by cluster id.
    pub qhat: HashMap<String, Vec<f64>>,
    /// Normalized cost per model. The wire key is `chat` for compatibility
    /// with the training pipeline's export.
    #[serde(rename = "chat", alias = "chatCost", alias = "chat_cost")]
    pub chat_cost: HashMap<String, f64>,
    /// Cluster centroids in embedding space; rows of `EMBEDDING_DIM` floats.
    #[serde(default)]
    pub centroids: Vec<Vec<f32>>,
    pub gbdt: GbdtModel,
    #[serde(default, alias = "featureNames")]
    pub feature_names: Vec<String>,
}

impl Artifact {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Shape and invariant checks: value ranges, row lengths, finiteness.
    pub fn validate(&self) -> Result<(), RouterError> {
        let fail = |msg: String| Err(RouterError::ArtifactInvalid(msg));

        if self.version.trim().is_empty() {
            return fail("empty version".into());
        }
        if !(0.0..=1.0).contains(&self.alpha) || !self.alpha.is_finite() {
            return fail(format!("alpha {} out of [0,1]", self.alpha));
        }
        for (name, v) in [
            ("thresholds.cheap", self.thresholds.cheap),
            ("thresholds.hard", self.thresholds.hard),
        ] {
            if !(0.0..=1.0).contains(&v) || !v.is_finite() {
                return fail(format!("{} {} out of [0,1]", name, v));
            }
        }
        if !self.penalties.latency_sd.is_finite() || !self.penalties.ctx_over_80pct.is_finite() {
            return fail("penalty coefficients not finite".into());
        }
        for (model, adj) in &self.penalties.model_adjustments {
            if !adj.is_finite() {
                return fail(format!("model adjustment for {} not finite", model));
            }
        }
        for (idx, centroid) in self.centroids.iter().enumerate() {
            if centroid.len() != EMBEDDING_DIM {
                return fail(format!(
                    "centroid {} has {} dims, expected {}",
                    idx,
                    centroid.len(),
                    EMBEDDING_DIM
                ));
            }
            if centroid.iter().any(|v| !v.is_finite()) {
                return fail(format!("centroid {} not finite", idx));
            }
        }
        let clusters = self.cluster_count();
        for (model, row) in &self.qhat {
            if clusters > 0 && row.len() != clusters {
                return fail(format!(
                    "qhat row for {} has {} entries, expected {}",
                    model,
                    row.len(),
                    clusters
                ));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return fail(format!("qhat row for {} not finite", model));
            }
        }
        for (model, cost) in &self.chat_cost {
            if !cost.is_finite() || *cost < 0.0 {
                return fail(format!("cost for {} invalid: {}", model, cost));
            }
        }
        let n_features = if self.feature_names.is_empty() {
            usize::MAX
        } else {
            self.feature_names.len()
        };
        self.gbdt
            .validate(n_features)
            .map_err(RouterError::ArtifactInvalid)?;
        Ok(())
    }
}

/// Currently published artifact plus load bookkeeping. Single writer (the
/// fetch loop), many readers.
#[derive(Default)]
pub struct ArtifactStore {
    current: RwLock<Option<Arc<Artifact>>>,
    published: RwLock<Option<PublishStamp>>,
}

#[derive(Clone, Copy)]
struct PublishStamp {
    at: Instant,
    wall: DateTime<Utc>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot a request pipeline should hold for its whole lifetime.
    pub fn snapshot(&self) -> Option<Arc<Artifact>> {
        self.current
            .read()
            .expect("artifact lock poisoned")
            .clone()
    }

    pub fn publish(&self, artifact: Artifact) {
        let version = artifact.version.clone();
        *self.current.write().expect("artifact lock poisoned") = Some(Arc::new(artifact));
        *self.published.write().expect("publish stamp lock poisoned") = Some(PublishStamp {
            at: Instant::now(),
            wall: Utc::now(),
        });
        tracing::info!(version = %version, "artifact published");
    }

    /// Version of the current artifact; empty string before first publish.
    pub fn version(&self) -> String {
        self.snapshot()
            .map(|a| a.version.clone())
            .unwrap_or_default()
    }

    pub fn age(&self) -> Option<Duration> {
        self.published
            .read()
            .expect("publish stamp lock poisoned")
            .map(|s| s.at.elapsed())
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.published
            .read()
            .expect("publish stamp lock poisoned")
            .map(|s| s.wall)
    }
}

/// Fetcher states: `Idle → Fetching → Validated → Published` on success,
/// `Fetching → Error → Backoff → Fetching` on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchPhase {
    Idle,
    Fetching,
    Validated,
    Published,
    Error,
    Backoff,
}

/// Periodic fetcher with capped exponential backoff on failure, guarded by
/// the `artifact` circuit breaker.
pub struct ArtifactManager {
    url: String,
    interval: Duration,
    backoff_cap: Duration,
    client: reqwest::Client,
    store: Arc<ArtifactStore>,
    breaker: Arc<CircuitBreaker>,
    fetch_errors: AtomicU64,
    phase: Mutex<FetchPhase>,
}

impl ArtifactManager {
    pub fn new(
        url: String,
        interval: Duration,
        backoff_cap: Duration,
        store: Arc<ArtifactStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build artifact http client");
        Self {
            url,
            interval,
            backoff_cap,
            client,
            store,
            breaker,
            fetch_errors: AtomicU64::new(0),
            phase: Mutex::new(FetchPhase::Idle),
        }
    }

    pub fn fetch_error_count(&self) -> u64 {
        self.fetch_errors.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> FetchPhase {
        *self.phase.lock().expect("fetch phase lock poisoned")
    }

    fn set_phase(&self, phase: FetchPhase) {
        *self.phase.lock().expect("fetch phase lock poisoned") = phase;
    }

    /// Run the refresh loop until the process exits. The first fetch happens
    /// immediately so a healthy deployment leaves degraded mode fast.
    pub fn spawn(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match manager.fetch_once().await {
                    Ok(()) => {
                        manager.set_phase(FetchPhase::Published);
                        backoff = Duration::from_secs(1);
                        tokio::time::sleep(manager.interval).await;
                    }
                    Err(err) => {
                        manager.fetch_errors.fetch_add(1, Ordering::Relaxed);
                        manager.set_phase(FetchPhase::Error);
                        tracing::warn!(error = %err, retry_in = ?backoff, "artifact refresh failed");
                        manager.set_phase(FetchPhase::Backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(manager.backoff_cap);
                    }
                }
            }
        })
    }

    pub async fn fetch_once(&self) -> Result<(), RouterError> {
        self.breaker.admit()?;
        self.set_phase(FetchPhase::Fetching);
        let result = self.fetch_and_publish().await;
        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn fetch_and_publish(&self) -> Result<(), RouterError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RouterError::ArtifactFetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RouterError::ArtifactFetch(format!(
                "status {}",
                resp.status()
            )));
        }
        let artifact: Artifact = resp
            .json()
            .await
            .map_err(|e| RouterError::ArtifactInvalid(format!("decode: {}", e)))?;
        artifact.validate()?;
        self.set_phase(FetchPhase::Validated);
        self.store.publish(artifact);
        Ok(())
    }
}
