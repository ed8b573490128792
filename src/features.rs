//! Feature extraction: prompt assembly, token estimation, code/math
//! heuristics, 3-gram entropy, embeddings and nearest-cluster matching.
//!
//! The fallback embedding is load-bearing: it hashes character n-grams with
//! FNV-1a into a fixed 384-dim vector, so two processes given the same text
//! always produce the same vector. Cache hit rates and A/B replays depend on
//! this.

use std::collections::HashMap;
use std::sync::Arc;

use memchr::memmem;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::artifact::Artifact;
use crate::embedding::EmbeddingBackend;
use crate::util::{ac_for, fnv1a, Deadline};
use crate::RouteRequest;

pub const EMBEDDING_DIM: usize = 384;
/// Scalar features preceding the cluster similarities in the GBDT vector.
pub const SCALAR_FEATURES: usize = 6;

static FENCE: Lazy<memmem::Finder<'static>> = Lazy::new(|| memmem::Finder::new("```"));

static CODE_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s{0,8}(?:fn |def |class |import |from \w+ import|#include\s*<|public (?:static )?\w+ \w+\(|SELECT\s.+\sFROM\s)",
    )
    .unwrap()
});

static MATH_INLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[^$\n]{1,200}\$").unwrap());
static MATH_DISPLAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\\[[\s\S]{1,400}?\\\]").unwrap());

static MATH_KEYWORDS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "integral",
        "derivative",
        "theorem",
        "eigenvalue",
        "polynomial",
        "logarithm",
        r"\frac",
        r"\sum",
        r"\int",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Remote,
    Fallback,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterMatch {
    pub id: usize,
    pub similarity: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestFeatures {
    /// 384-dim unit vector. Not serialized into traces; too heavy.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub token_estimate: u32,
    pub has_code: bool,
    pub has_math: bool,
    pub ngram_entropy: f64,
    pub turns: u32,
    pub context_ratio: f64,
    pub clusters: Vec<ClusterMatch>,
    pub degraded: bool,
    pub embedding_source: EmbeddingSource,
}

impl RequestFeatures {
    pub fn empty() -> Self {
        Self {
            embedding: Vec::new(),
            token_estimate: 0,
            has_code: false,
            has_math: false,
            ngram_entropy: 0.0,
            turns: 0,
            context_ratio: 0.0,
            clusters: Vec::new(),
            degraded: false,
            embedding_source: EmbeddingSource::Fallback,
        }
    }
}

/// Cheap scalar pass over the request text. Computed before the decision
/// cache is consulted, since the fingerprint is built from these fields.
#[derive(Clone, Debug)]
pub struct TextStats {
    /// Lower-cased, whitespace-collapsed prompt (post byte cap).
    pub normalized: String,
    pub token_estimate: u32,
    pub has_code: bool,
    pub has_math: bool,
    pub ngram_entropy: f64,
    pub turns: u32,
}

pub struct FeatureExtractor {
    byte_budget: usize,
    top_p: usize,
    default_context_limit: u32,
    backend: Option<Arc<dyn EmbeddingBackend>>,
}

impl FeatureExtractor {
    pub fn new(
        byte_budget: usize,
        top_p: usize,
        default_context_limit: u32,
        backend: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Self {
        Self {
            byte_budget,
            top_p,
            default_context_limit,
            backend,
        }
    }

    /// Assemble the prompt (system messages first, then the rest in order),
    /// cap it at the byte budget and compute the scalar features.
    pub fn text_stats(&self, req: &RouteRequest) -> TextStats {
        let prompt = assemble_prompt(req, self.byte_budget);
        let token_estimate = estimate_tokens(&prompt);
        let has_code = detect_code(&prompt);
        let has_math = detect_math(&prompt);
        let normalized = normalize(&prompt);
        let ngram_entropy = trigram_entropy(&normalized);
        TextStats {
            normalized,
            token_estimate,
            has_code,
            has_math,
            ngram_entropy,
            turns: req.messages.len() as u32,
        }
    }

    /// Full feature set. Falls back to the deterministic embedding when the
    /// remote service is unavailable or the deadline is pressing, and skips
    /// cluster matching once the budget is gone; in both cases the result is
    /// flagged degraded rather than failing.
    pub async fn extract(
        &self,
        stats: &TextStats,
        artifact: Option<&Artifact>,
        deadline: &Deadline,
    ) -> RequestFeatures {
        let mut degraded = false;

        let (embedding, embedding_source) = match &self.backend {
            Some(backend) if !deadline.exceeded() => {
                match backend.embed(&stats.normalized, deadline.remaining()).await {
                    Ok(vec) if vec.len() == EMBEDDING_DIM => (l2_normalized(vec), EmbeddingSource::Remote),
                    Ok(vec) => {
                        tracing::warn!(dims = vec.len(), "embedding service returned wrong dimension");
                        degraded = true;
                        (fallback_embedding(&stats.normalized), EmbeddingSource::Fallback)
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "embedding unavailable, using fallback");
                        degraded = true;
                        (fallback_embedding(&stats.normalized), EmbeddingSource::Fallback)
                    }
                }
            }
            Some(_) => {
                degraded = true;
                (fallback_embedding(&stats.normalized), EmbeddingSource::Fallback)
            }
            None => (fallback_embedding(&stats.normalized), EmbeddingSource::Fallback),
        };

        let clusters = if deadline.exceeded() {
            degraded = true;
            Vec::new()
        } else {
            match artifact {
                Some(a) => nearest_clusters(&embedding, &a.centroids, self.top_p),
                None => Vec::new(),
            }
        };

        RequestFeatures {
            token_estimate: stats.token_estimate,
            has_code: stats.has_code,
            has_math: stats.has_math,
            ngram_entropy: stats.ngram_entropy,
            turns: stats.turns,
            context_ratio: stats.token_estimate as f64 / self.default_context_limit as f64,
            embedding,
            clusters,
            degraded,
            embedding_source,
        }
    }

    /// Dense vector handed to the GBDT: six scalars, then the top-cluster
    /// similarities zero-padded to `top_p`.
    pub fn feature_vector(&self, features: &RequestFeatures) -> Vec<f64> {
        let mut v = Vec::with_capacity(SCALAR_FEATURES + self.top_p);
        v.push((1.0 + features.token_estimate as f64).ln());
        v.push(features.has_code as u8 as f64);
        v.push(features.has_math as u8 as f64);
        v.push(features.ngram_entropy);
        v.push(features.turns as f64);
        v.push(features.context_ratio);
        for i in 0..self.top_p {
            v.push(
                features
                    .clusters
                    .get(i)
                    .map(|c| c.similarity as f64)
                    .unwrap_or(0.0),
            );
        }
        v
    }
}

fn assemble_prompt(req: &RouteRequest, byte_budget: usize) -> String {
    let mut out = String::new();
    let mut push = |text: &str| {
        if out.len() >= byte_budget {
            return;
        }
        let room = byte_budget - out.len();
        if text.len() <= room {
            out.push_str(text);
        } else {
            // Cut at a char boundary inside the budget.
            let mut cut = room;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push_str(&text[..cut]);
        }
        out.push('\n');
    };
    for msg in req.messages.iter().filter(|m| m.role == "system") {
        push(&msg.content);
    }
    for msg in req.messages.iter().filter(|m| m.role != "system") {
        push(&msg.content);
    }
    out
}

/// Deterministic `ceil(bytes/4)` estimate, nudged by whitespace density:
/// whitespace-sparse text (minified code, base64) tokenizes worse, prose
/// with heavy whitespace slightly better.
pub fn estimate_tokens(text: &str) -> u32 {
    let bytes = text.len();
    if bytes == 0 {
        return 0;
    }
    let ws = text.bytes().filter(|b| b.is_ascii_whitespace()).count();
    let ws_frac = ws as f64 / bytes as f64;
    let base = (bytes as f64) / 4.0;
    let factor = if ws_frac < 0.10 {
        1.2
    } else if ws_frac > 0.35 {
        0.9
    } else {
        1.0
    };
    (base * factor).ceil() as u32
}

pub fn detect_code(text: &str) -> bool {
    FENCE.find(text.as_bytes()).is_some() || CODE_HINT_RE.is_match(text)
}

pub fn detect_math(text: &str) -> bool {
    MATH_INLINE_RE.is_match(text)
        || MATH_DISPLAY_RE.is_match(text)
        || ac_for(&MATH_KEYWORDS).is_match(text)
}

pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_ws = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_ws {
                out.push(' ');
                in_ws = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            in_ws = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Shannon entropy (bits) over byte trigrams of the normalized prompt.
pub fn trigram_entropy(normalized: &str) -> f64 {
    let bytes = normalized.as_bytes();
    if bytes.len() < 3 {
        return 0.0;
    }
    let mut counts: HashMap<&[u8], u32> = HashMap::new();
    for gram in bytes.windows(3) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    let total = (bytes.len() - 2) as f64;
    let mut entropy = 0.0;
    for count in counts.values() {
        let p = *count as f64 / total;
        entropy -= p * p.log2();
    }
    entropy
}

/// Hash char 3/4/5-grams into 384 signed buckets and ℓ²-normalize. Stable
/// across processes (plain FNV-1a, no seeding).
pub fn fallback_embedding(normalized: &str) -> Vec<f32> {
    let mut v = vec![0f32; EMBEDDING_DIM];
    let bytes = normalized.as_bytes();
    for n in 3..=5usize {
        if bytes.len() < n {
            break;
        }
        for gram in bytes.windows(n) {
            let h = fnv1a(gram);
            let idx = (h % EMBEDDING_DIM as u64) as usize;
            let sign = if h & (1 << 63) != 0 { -1.0 } else { 1.0 };
            v[idx] += sign;
        }
    }
    l2_normalized(v)
}

fn l2_normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    } else if !v.is_empty() {
        v[0] = 1.0;
    }
    v
}

fn nearest_clusters(embedding: &[f32], centroids: &[Vec<f32>], top_p: usize) -> Vec<ClusterMatch> {
    let mut matches: Vec<ClusterMatch> = centroids
        .iter()
        .enumerate()
        .map(|(id, centroid)| ClusterMatch {
            id,
            similarity: cosine(embedding, centroid),
        })
        .collect();
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    matches.truncate(top_p);
    matches
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
