//! α-scorer: ranks a bucket's candidates by `α·Q̂ − (1−α)·Ĉ − penalties`.
//!
//! Stateless with respect to artifacts (the snapshot is an argument, never a
//! field) and stateful only for its TTL'd score cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::artifact::Artifact;
use crate::bucket::{Bucket, CandidatePools};
use crate::features::RequestFeatures;
use crate::util::{fnv1a_continue, fnv1a_u64, FNV_OFFSET};

const DEFAULT_ALPHA: f64 = 0.6;
const DEFAULT_PENALTY_LATENCY_SD: f64 = 0.1;
const DEFAULT_PENALTY_CTX_OVER: f64 = 0.5;
const SCORE_CACHE_SWEEP_LEN: usize = 8_192;

#[derive(Clone, Debug, Serialize)]
pub struct ScoredCandidate {
    pub model: String,
    pub score: f64,
    pub qhat: f64,
    pub cost: f64,
    pub penalty: f64,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub winner: ScoredCandidate,
    /// Remaining candidates by descending score, truncated to the configured
    /// depth; never contains the winner or duplicates.
    pub fallbacks: Vec<String>,
    /// Full ranking, for the decision explanation.
    pub ranked: Vec<ScoredCandidate>,
    pub alpha_used: f64,
    pub explore_seed: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub struct ExploreParams {
    pub enabled: bool,
    pub rate: f64,
    pub top_k: usize,
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct ScorerParams {
    /// Config override of the artifact's α.
    pub alpha_override: Option<f64>,
    /// Dynamic α: added when code/math heuristics fired. Zero disables.
    pub alpha_code_boost: f64,
    /// Dynamic α: subtracted under low context pressure. Zero disables.
    pub alpha_cost_relief: f64,
    /// Config overrides of the artifact's λ coefficients.
    pub penalty_latency_sd: Option<f64>,
    pub penalty_ctx_over: Option<f64>,
    /// Per-model latency standard deviation estimates.
    pub latency_sd: HashMap<String, f64>,
    pub fallback_depth: usize,
    pub score_ttl: Duration,
    pub explore: ExploreParams,
}

struct ScoreEntry {
    qhat: f64,
    cost: f64,
    penalty: f64,
    score: f64,
    expires_at: Instant,
}

pub struct AlphaScorer {
    params: ScorerParams,
    cache: DashMap<u64, ScoreEntry>,
}

impl AlphaScorer {
    pub fn new(params: ScorerParams) -> Self {
        Self {
            params,
            cache: DashMap::new(),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Rank the bucket's candidates and pick a winner. `None` only when the
    /// candidate list is empty; the orchestrator then falls back to the
    /// configured default model.
    pub fn select(
        &self,
        bucket: Bucket,
        candidates: &[String],
        features: &RequestFeatures,
        artifact: Option<&Artifact>,
        pools: &CandidatePools,
        fingerprint: u64,
    ) -> Option<Selection> {
        let mut unique: Vec<&String> = Vec::with_capacity(candidates.len());
        for m in candidates {
            if !unique.iter().any(|u| *u == m) {
                unique.push(m);
            }
        }
        if unique.is_empty() {
            return None;
        }

        // Infeasible candidates are only scored when nothing fits at all;
        // the selector has already flagged that case.
        let feasible: Vec<&String> = unique
            .iter()
            .copied()
            .filter(|m| pools.context_limit(m) >= features.token_estimate)
            .collect();
        let pool: &[&String] = if feasible.is_empty() { &unique } else { &feasible };

        let alpha = self.effective_alpha(features, artifact);
        let cost_median = Self::cost_median(pool, artifact);
        let qhat_fallback = Self::qhat_mean_of_means(artifact);
        let request_digest = self.request_digest(bucket, features, artifact);

        let mut ranked: Vec<ScoredCandidate> = pool
            .iter()
            .map(|model| {
                self.score_candidate(
                    model,
                    alpha,
                    features,
                    artifact,
                    cost_median,
                    qhat_fallback,
                    request_digest,
                )
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.qhat
                        .partial_cmp(&a.qhat)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    a.cost
                        .partial_cmp(&b.cost)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.model.cmp(&b.model))
        });

        let (winner_idx, explore_seed) = self.maybe_explore(&ranked, fingerprint);
        let winner = ranked[winner_idx].clone();
        let fallbacks: Vec<String> = ranked
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != winner_idx)
            .map(|(_, c)| c.model.clone())
            .take(self.params.fallback_depth)
            .collect();

        Some(Selection {
            winner,
            fallbacks,
            ranked,
            alpha_used: alpha,
            explore_seed,
        })
    }

    fn effective_alpha(&self, features: &RequestFeatures, artifact: Option<&Artifact>) -> f64 {
        let mut alpha = self
            .params
            .alpha_override
            .or_else(|| artifact.map(|a| a.alpha))
            .unwrap_or(DEFAULT_ALPHA);
        if (features.has_code || features.has_math) && self.params.alpha_code_boost > 0.0 {
            alpha += self.params.alpha_code_boost;
        }
        if features.context_ratio < 0.25 && self.params.alpha_cost_relief > 0.0 {
            alpha -= self.params.alpha_cost_relief;
        }
        alpha.clamp(0.0, 1.0)
    }

    #[allow(clippy::too_many_arguments)]
    fn score_candidate(
        &self,
        model: &str,
        alpha: f64,
        features: &RequestFeatures,
        artifact: Option<&Artifact>,
        cost_median: f64,
        qhat_fallback: f64,
        request_digest: u64,
    ) -> ScoredCandidate {
        let key = fnv1a_continue(request_digest, model.as_bytes());
        if let Some(entry) = self.cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return ScoredCandidate {
                    model: model.to_string(),
                    score: entry.score,
                    qhat: entry.qhat,
                    cost: entry.cost,
                    penalty: entry.penalty,
                };
            }
            drop(entry);
            self.cache.remove(&key);
        }

        let qhat = match artifact.and_then(|a| a.qhat.get(model)) {
            Some(row) => features
                .clusters
                .iter()
                .filter_map(|c| row.get(c.id).map(|q| c.similarity as f64 * q))
                .sum(),
            None => qhat_fallback,
        };
        let cost = artifact
            .and_then(|a| a.chat_cost.get(model).copied())
            .unwrap_or(cost_median);

        let (lambda_sd, lambda_ctx) = self.lambdas(artifact);
        let latency_sd = self.params.latency_sd.get(model).copied().unwrap_or(0.0);
        let model_adjustment = artifact
            .and_then(|a| a.penalties.model_adjustments.get(model).copied())
            .unwrap_or(0.0);
        let penalty = lambda_ctx * (features.context_ratio - 0.8).max(0.0)
            + lambda_sd * latency_sd
            + model_adjustment;

        let score = alpha * qhat - (1.0 - alpha) * cost - penalty;

        if self.cache.len() >= SCORE_CACHE_SWEEP_LEN {
            let now = Instant::now();
            self.cache.retain(|_, e| e.expires_at > now);
        }
        self.cache.insert(
            key,
            ScoreEntry {
                qhat,
                cost,
                penalty,
                score,
                expires_at: Instant::now() + self.params.score_ttl,
            },
        );

        ScoredCandidate {
            model: model.to_string(),
            score,
            qhat,
            cost,
            penalty,
        }
    }

    fn lambdas(&self, artifact: Option<&Artifact>) -> (f64, f64) {
        let sd = self.params.penalty_latency_sd.unwrap_or_else(|| {
            artifact
                .map(|a| a.penalties.latency_sd)
                .unwrap_or(DEFAULT_PENALTY_LATENCY_SD)
        });
        let ctx = self.params.penalty_ctx_over.unwrap_or_else(|| {
            artifact
                .map(|a| a.penalties.ctx_over_80pct)
                .unwrap_or(DEFAULT_PENALTY_CTX_OVER)
        });
        (sd, ctx)
    }

    fn cost_median(pool: &[&String], artifact: Option<&Artifact>) -> f64 {
        let Some(artifact) = artifact else { return 0.5 };
        let mut known: Vec<f64> = pool
            .iter()
            .filter_map(|m| artifact.chat_cost.get(*m).copied())
            .collect();
        if known.is_empty() {
            return 0.5;
        }
        known.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = known.len() / 2;
        if known.len() % 2 == 1 {
            known[mid]
        } else {
            (known[mid - 1] + known[mid]) / 2.0
        }
    }

    fn qhat_mean_of_means(artifact: Option<&Artifact>) -> f64 {
        let Some(artifact) = artifact else { return 0.5 };
        if artifact.qhat.is_empty() {
            return 0.5;
        }
        let mut sum = 0.0;
        let mut n = 0usize;
        for row in artifact.qhat.values() {
            if row.is_empty() {
                continue;
            }
            sum += row.iter().sum::<f64>() / row.len() as f64;
            n += 1;
        }
        if n == 0 {
            0.5
        } else {
            sum / n as f64
        }
    }

    /// Score-cache digest for the request side of the key: rounded features,
    /// artifact version and bucket. Per-model bytes are folded in later.
    fn request_digest(
        &self,
        bucket: Bucket,
        features: &RequestFeatures,
        artifact: Option<&Artifact>,
    ) -> u64 {
        let mut d = FNV_OFFSET;
        d = fnv1a_continue(
            d,
            artifact.map(|a| a.version.as_bytes()).unwrap_or(b""),
        );
        d = fnv1a_continue(d, bucket.as_str().as_bytes());
        d = fnv1a_u64(d, (features.token_estimate / 256) as u64);
        d = fnv1a_u64(d, features.has_code as u64);
        d = fnv1a_u64(d, features.has_math as u64);
        d = fnv1a_u64(d, (features.ngram_entropy * 4.0).round() as u64);
        d = fnv1a_u64(d, (features.context_ratio * 100.0).round() as u64);
        for c in &features.clusters {
            d = fnv1a_u64(d, c.id as u64);
            d = fnv1a_u64(d, (c.similarity * 100.0).round() as i64 as u64);
        }
        d
    }

    /// With probability `rate`, swap the winner for a uniform draw over the
    /// top-k. Deterministic given (fingerprint, seed): the derived seed is
    /// recorded in the explanation so logged decisions replay.
    fn maybe_explore(&self, ranked: &[ScoredCandidate], fingerprint: u64) -> (usize, Option<u64>) {
        let e = &self.params.explore;
        if !e.enabled || e.rate <= 0.0 || ranked.len() < 2 {
            return (0, None);
        }
        let derived = fingerprint ^ e.seed;
        let coin = splitmix64(derived);
        let unit = (coin >> 11) as f64 / (1u64 << 53) as f64;
        if unit >= e.rate {
            return (0, None);
        }
        let k = e.top_k.max(1).min(ranked.len());
        let idx = (splitmix64(coin) % k as u64) as usize;
        (idx, Some(derived))
    }
}

/// splitmix64: tiny, portable, and stable across platforms and releases,
/// which is exactly what replayable exploration seeds require.
fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::{artifact_with_gbdt, leaf_gbdt};
    use crate::features::{ClusterMatch, RequestFeatures, EMBEDDING_DIM, SCALAR_FEATURES};

    fn params() -> ScorerParams {
        ScorerParams {
            alpha_override: None,
            alpha_code_boost: 0.0,
            alpha_cost_relief: 0.0,
            penalty_latency_sd: None,
            penalty_ctx_over: None,
            latency_sd: HashMap::new(),
            fallback_depth: 3,
            score_ttl: Duration::from_secs(300),
            explore: ExploreParams {
                enabled: false,
                rate: 0.0,
                top_k: 3,
                seed: 0,
            },
        }
    }

    fn pools() -> CandidatePools {
        CandidatePools {
            cheap: vec![],
            mid: vec![
                "prov/a".into(),
                "prov/b".into(),
                "prov/c".into(),
            ],
            hard: vec![],
            context_limits: HashMap::new(),
            default_context_limit: 128_000,
        }
    }

    fn artifact() -> crate::artifact::Artifact {
        let mut a = artifact_with_gbdt(leaf_gbdt([0.0; 3]), SCALAR_FEATURES + 5);
        a.centroids = vec![vec![0.0; EMBEDDING_DIM]; 2];
        a.qhat.insert("prov/a".into(), vec![0.9, 0.1]);
        a.qhat.insert("prov/b".into(), vec![0.3, 0.3]);
        a.chat_cost.insert("prov/a".into(), 0.8);
        a.chat_cost.insert("prov/b".into(), 0.2);
        a
    }

    fn features_with_cluster0() -> RequestFeatures {
        let mut f = RequestFeatures::empty();
        f.token_estimate = 100;
        f.clusters = vec![ClusterMatch {
            id: 0,
            similarity: 1.0,
        }];
        f
    }

    fn mids() -> Vec<String> {
        pools().mid.clone()
    }

    #[test]
    fn winner_scores_at_least_every_candidate() {
        let scorer = AlphaScorer::new(params());
        let a = artifact();
        let f = features_with_cluster0();
        let sel = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 42)
            .unwrap();
        for c in &sel.ranked {
            assert!(sel.winner.score >= c.score);
        }
        // prov/a: 0.6*0.9 - 0.4*0.8 = 0.22; prov/b: 0.6*0.3 - 0.4*0.2 = 0.10.
        assert_eq!(sel.winner.model, "prov/a");
    }

    #[test]
    fn missing_qhat_row_uses_mean_of_row_means() {
        let scorer = AlphaScorer::new(params());
        let a = artifact();
        let f = features_with_cluster0();
        let sel = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 42)
            .unwrap();
        let c = sel.ranked.iter().find(|c| c.model == "prov/c").unwrap();
        // Row means: a -> 0.5, b -> 0.3; mean of means 0.4.
        assert!((c.qhat - 0.4).abs() < 1e-9);
        // Cost fallback is the bucket median of known costs.
        assert!((c.cost - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tie_break_prefers_quality_then_cost_then_name() {
        let scorer = AlphaScorer::new(ScorerParams {
            alpha_override: Some(0.5),
            ..params()
        });
        let mut a = artifact();
        a.qhat.clear();
        a.chat_cost.clear();
        // Equal scores by construction: q - c identical, q differs.
        a.qhat.insert("prov/a".into(), vec![0.8, 0.0]);
        a.chat_cost.insert("prov/a".into(), 0.6);
        a.qhat.insert("prov/b".into(), vec![0.6, 0.0]);
        a.chat_cost.insert("prov/b".into(), 0.4);
        let f = features_with_cluster0();
        let sel = scorer
            .select(
                Bucket::Mid,
                &["prov/a".to_string(), "prov/b".to_string()],
                &f,
                Some(&a),
                &pools(),
                42,
            )
            .unwrap();
        assert!((sel.ranked[0].score - sel.ranked[1].score).abs() < 1e-12);
        assert_eq!(sel.winner.model, "prov/a");

        // Exact ties everywhere fall back to the lexicographic order.
        let mut a2 = artifact();
        a2.qhat.clear();
        a2.chat_cost.clear();
        let f2 = features_with_cluster0();
        let sel2 = scorer
            .select(
                Bucket::Mid,
                &["prov/b".to_string(), "prov/a".to_string()],
                &f2,
                Some(&a2),
                &pools(),
                42,
            )
            .unwrap();
        assert_eq!(sel2.winner.model, "prov/a");
    }

    #[test]
    fn fallbacks_exclude_winner_and_preserve_order() {
        let scorer = AlphaScorer::new(params());
        let a = artifact();
        let f = features_with_cluster0();
        let sel = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 42)
            .unwrap();
        assert!(!sel.fallbacks.contains(&sel.winner.model));
        assert_eq!(sel.fallbacks.len(), 2);
        let mut dedup = sel.fallbacks.clone();
        dedup.dedup();
        assert_eq!(dedup, sel.fallbacks);
    }

    #[test]
    fn empty_candidate_list_yields_none() {
        let scorer = AlphaScorer::new(params());
        let f = RequestFeatures::empty();
        assert!(scorer
            .select(Bucket::Mid, &[], &f, None, &pools(), 42)
            .is_none());
    }

    #[test]
    fn no_artifact_scores_cost_only_defaults() {
        let scorer = AlphaScorer::new(params());
        let f = RequestFeatures::empty();
        let sel = scorer
            .select(Bucket::Mid, &mids(), &f, None, &pools(), 42)
            .unwrap();
        // All candidates identical → lexicographic winner.
        assert_eq!(sel.winner.model, "prov/a");
        assert!((sel.winner.qhat - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dynamic_alpha_bumps_and_clamps() {
        let scorer = AlphaScorer::new(ScorerParams {
            alpha_override: Some(0.95),
            alpha_code_boost: 0.2,
            alpha_cost_relief: 0.1,
            ..params()
        });
        let mut f = features_with_cluster0();
        f.has_code = true;
        f.context_ratio = 0.5;
        let sel = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&artifact()), &pools(), 42)
            .unwrap();
        assert!((sel.alpha_used - 1.0).abs() < 1e-12);

        let mut f2 = features_with_cluster0();
        f2.context_ratio = 0.1;
        let sel2 = scorer
            .select(Bucket::Mid, &mids(), &f2, Some(&artifact()), &pools(), 43)
            .unwrap();
        assert!((sel2.alpha_used - 0.85).abs() < 1e-12);
    }

    #[test]
    fn exploration_is_deterministic_and_recorded() {
        let explore = ExploreParams {
            enabled: true,
            rate: 1.0,
            top_k: 3,
            seed: 7,
        };
        let scorer = AlphaScorer::new(ScorerParams {
            explore,
            ..params()
        });
        let a = artifact();
        let f = features_with_cluster0();
        let one = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 99)
            .unwrap();
        let two = scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 99)
            .unwrap();
        assert_eq!(one.winner.model, two.winner.model);
        assert_eq!(one.explore_seed, two.explore_seed);
        assert_eq!(one.explore_seed, Some(99 ^ 7));
    }

    #[test]
    fn exploration_respects_feasibility() {
        let explore = ExploreParams {
            enabled: true,
            rate: 1.0,
            top_k: 3,
            seed: 0,
        };
        let scorer = AlphaScorer::new(ScorerParams {
            explore,
            ..params()
        });
        let mut p = pools();
        p.context_limits.insert("prov/a".into(), 1_000);
        p.context_limits.insert("prov/b".into(), 200_000);
        p.context_limits.insert("prov/c".into(), 200_000);
        let mut f = features_with_cluster0();
        f.token_estimate = 50_000;
        for fp in 0..32u64 {
            let sel = scorer
                .select(Bucket::Mid, &mids(), &f, Some(&artifact()), &p, fp)
                .unwrap();
            assert_ne!(sel.winner.model, "prov/a");
        }
    }

    #[test]
    fn score_cache_serves_entries_until_ttl() {
        let scorer = AlphaScorer::new(ScorerParams {
            score_ttl: Duration::from_millis(20),
            ..params()
        });
        let a = artifact();
        let f = features_with_cluster0();
        scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 1)
            .unwrap();
        let filled = scorer.cache_len();
        assert!(filled >= 3);
        // Second pass hits the cache: no growth.
        scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 1)
            .unwrap();
        assert_eq!(scorer.cache_len(), filled);
        std::thread::sleep(Duration::from_millis(30));
        scorer
            .select(Bucket::Mid, &mids(), &f, Some(&a), &pools(), 1)
            .unwrap();
        assert_eq!(scorer.cache_len(), filled);
    }
}
