//! Pre-hook orchestrator: composes fingerprinting, the decision cache,
//! feature extraction, triage, bucket selection and α-scoring under one
//! request deadline.
//!
//! Nothing in this path ever returns an error to the host. Whenever the
//! budget runs out the safe default decision ships instead, and a pipeline
//! abandoned by the timeout performs no further shared-state writes.

use crate::auth::{AuthInfo, Headers};
use crate::bucket;
use crate::cache::fingerprint;
use crate::features::{RequestFeatures, TextStats};
use crate::gbdt::{self, PredictionSource};
use crate::util::Deadline;
use crate::{DecisionExplanation, PluginState, RouteRequest, RoutingDecision};

/// How many ranked candidates the explanation keeps.
const EXPLAIN_TOP: usize = 5;

#[derive(Clone, Debug)]
pub struct DecideOutcome {
    pub decision: RoutingDecision,
    pub auth: Option<AuthInfo>,
    pub cache_hit: bool,
    /// Extracted features, when the pipeline ran them (observability only;
    /// absent on cache hits and safe defaults).
    pub features: Option<RequestFeatures>,
}

/// Produce a routing decision for one request within the configured budget.
pub async fn decide(state: &PluginState, req: &RouteRequest, headers: &Headers) -> DecideOutcome {
    let cfg = &state.config.router;
    let deadline = Deadline::from_ms(cfg.timeout_ms);

    let stats = state.extractor.text_stats(req);
    let version = state.artifacts.version();
    let fp = fingerprint(&stats, req.model.as_deref(), &version);

    if cfg.enable_caching {
        if let Some(decision) = state.decision_cache.get(fp, &version) {
            return DecideOutcome {
                decision,
                auth: classify_auth(state, headers),
                cache_hit: true,
                features: None,
            };
        }
    }

    let pipeline = run_pipeline(state, &stats, fp, headers, &deadline);
    let (decision, features, auth) =
        match tokio::time::timeout(deadline.remaining(), pipeline).await {
            Ok(done) => done,
            Err(_) => {
                state.metrics.note_deadline_exceeded();
                tracing::warn!(budget_ms = cfg.timeout_ms, "routing deadline exceeded, using default decision");
                (
                    safe_default(state, &version, "deadline-exceeded"),
                    None,
                    classify_auth(state, headers),
                )
            }
        };

    if cfg.enable_caching && decision.fallback_reason.as_deref() != Some("deadline-exceeded") {
        state.decision_cache.insert(fp, decision.clone());
    }

    DecideOutcome {
        decision,
        auth,
        cache_hit: false,
        features,
    }
}

fn classify_auth(state: &PluginState, headers: &Headers) -> Option<AuthInfo> {
    if state.config.router.enable_auth {
        Some(state.auth.classify(headers))
    } else {
        None
    }
}

async fn run_pipeline(
    state: &PluginState,
    stats: &TextStats,
    fp: u64,
    headers: &Headers,
    deadline: &Deadline,
) -> (RoutingDecision, Option<RequestFeatures>, Option<AuthInfo>) {
    let cfg = &state.config.router;

    // One snapshot for the whole decision; a concurrent artifact swap
    // affects only later requests.
    let snapshot = state.artifacts.snapshot();
    let artifact = snapshot.as_deref();

    // Feature extraction gets its own sub-budget within the request budget;
    // auth detection is dispatched alongside it and joined here.
    let feature_budget = deadline
        .remaining()
        .min(std::time::Duration::from_millis(cfg.feature_timeout_ms));
    let feature_deadline = Deadline::new(feature_budget);
    let (auth, features) = tokio::join!(
        async { classify_auth(state, headers) },
        state.extractor.extract(stats, artifact, &feature_deadline),
    );

    let vector = state.extractor.feature_vector(&features);
    let prediction = gbdt::predict(artifact, &vector);

    let thresholds = artifact
        .map(|a| a.thresholds)
        .unwrap_or_else(|| cfg.default_thresholds());
    let chosen = bucket::select(&prediction.probs, &thresholds, &features, &state.pools);

    let candidates = state.pools.candidates(chosen.bucket);
    let Some(selection) =
        state
            .scorer
            .select(chosen.bucket, candidates, &features, artifact, &state.pools, fp)
    else {
        // Candidate lists are validated non-empty at startup; this only
        // triggers if a future config source breaks that.
        let version = artifact.map(|a| a.version.as_str()).unwrap_or("");
        return (
            safe_default(state, version, "empty-candidates"),
            Some(features),
            auth,
        );
    };

    let degraded =
        features.degraded || prediction.source == PredictionSource::Prior || artifact.is_none();
    let fallback_reason = if chosen.no_feasible {
        Some("no-feasible-candidate".to_string())
    } else if prediction.source == PredictionSource::Prior {
        Some("gbdt-fallback".to_string())
    } else if features.degraded {
        Some("degraded-features".to_string())
    } else {
        None
    };

    let mut ranked = selection.ranked.clone();
    ranked.truncate(EXPLAIN_TOP);

    let decision = RoutingDecision {
        bucket: chosen.bucket,
        model: selection.winner.model.clone(),
        fallbacks: if cfg.enable_fallbacks {
            selection.fallbacks.clone()
        } else {
            Vec::new()
        },
        thinking: cfg.thinking_for(chosen.bucket),
        alpha_score: selection.winner.score,
        explanation: DecisionExplanation {
            probs: prediction.probs,
            guardrail: chosen.guardrail.map(str::to_string),
            alpha_used: selection.alpha_used,
            explore_seed: selection.explore_seed,
            gbdt_source: match prediction.source {
                PredictionSource::Model => "model".to_string(),
                PredictionSource::Prior => "prior".to_string(),
            },
            ranked,
        },
        artifact_version: artifact.map(|a| a.version.clone()).unwrap_or_default(),
        degraded,
        fallback_reason,
    };
    (decision, Some(features), auth)
}

/// The decision shipped when the pipeline cannot run to completion: the
/// configured default bucket with its first candidate and the remaining
/// candidates as fallbacks. Does no I/O and touches no caches.
pub(crate) fn safe_default(
    state: &PluginState,
    artifact_version: &str,
    reason: &str,
) -> RoutingDecision {
    let cfg = &state.config.router;
    let bucket = cfg.router.default_bucket;
    let candidates = state.pools.candidates(bucket);
    let model = candidates
        .first()
        .cloned()
        .unwrap_or_else(|| "openai/gpt-5-mini".to_string());
    let fallbacks: Vec<String> = if cfg.enable_fallbacks {
        candidates
            .iter()
            .skip(1)
            .take(cfg.router.fallback_depth)
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    RoutingDecision {
        bucket,
        model,
        fallbacks,
        thinking: cfg.thinking_for(bucket),
        alpha_score: 0.0,
        explanation: DecisionExplanation {
            probs: crate::bucket::BucketProbs::PRIOR,
            guardrail: None,
            alpha_used: cfg.router.alpha.unwrap_or(0.6),
            explore_seed: None,
            gbdt_source: "prior".to_string(),
            ranked: Vec::new(),
        },
        artifact_version: artifact_version.to_string(),
        degraded: true,
        fallback_reason: Some(reason.to_string()),
    }
}
