//! Complexity buckets, probability→bucket selection and guardrails.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::artifact::Thresholds;
use crate::features::RequestFeatures;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Cheap,
    Mid,
    Hard,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Cheap => "cheap",
            Bucket::Mid => "mid",
            Bucket::Hard => "hard",
        }
    }

    /// One level up; `hard` saturates.
    pub fn escalated(&self) -> Bucket {
        match self {
            Bucket::Cheap => Bucket::Mid,
            Bucket::Mid | Bucket::Hard => Bucket::Hard,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BucketProbs {
    pub cheap: f64,
    pub mid: f64,
    pub hard: f64,
}

impl BucketProbs {
    /// Safe prior used whenever the triage model cannot run.
    pub const PRIOR: BucketProbs = BucketProbs {
        cheap: 0.5,
        mid: 0.35,
        hard: 0.15,
    };

    pub fn is_valid(&self) -> bool {
        let vals = [self.cheap, self.mid, self.hard];
        vals.iter().all(|v| v.is_finite() && *v >= 0.0)
            && ((self.cheap + self.mid + self.hard) - 1.0).abs() < 1e-6
    }
}

/// Candidate pools per bucket plus the context limits needed for the
/// feasibility guardrail. Built once from config at startup.
#[derive(Clone, Debug)]
pub struct CandidatePools {
    pub cheap: Vec<String>,
    pub mid: Vec<String>,
    pub hard: Vec<String>,
    pub context_limits: HashMap<String, u32>,
    pub default_context_limit: u32,
}

impl CandidatePools {
    pub fn candidates(&self, bucket: Bucket) -> &[String] {
        match bucket {
            Bucket::Cheap => &self.cheap,
            Bucket::Mid => &self.mid,
            Bucket::Hard => &self.hard,
        }
    }

    pub fn context_limit(&self, model: &str) -> u32 {
        self.context_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_context_limit)
    }

    /// True when at least one candidate in the bucket can hold the request.
    pub fn fits(&self, bucket: Bucket, token_estimate: u32) -> bool {
        self.candidates(bucket)
            .iter()
            .any(|m| self.context_limit(m) >= token_estimate)
    }
}

#[derive(Clone, Debug)]
pub struct BucketDecision {
    pub bucket: Bucket,
    /// Name of the guardrail that overrode the probabilistic choice, if any.
    pub guardrail: Option<&'static str>,
    /// Set when even the hard bucket has no candidate with enough context.
    pub no_feasible: bool,
}

/// Map bucket probabilities to a bucket, then apply guardrails in order:
/// context pressure, code escalation, feasibility.
pub fn select(
    probs: &BucketProbs,
    thresholds: &Thresholds,
    features: &RequestFeatures,
    pools: &CandidatePools,
) -> BucketDecision {
    let heuristics_fired = features.has_code || features.has_math;
    let mut bucket = if probs.hard >= thresholds.hard {
        Bucket::Hard
    } else if probs.cheap >= thresholds.cheap && !heuristics_fired {
        Bucket::Cheap
    } else {
        Bucket::Mid
    };
    let mut guardrail = None;

    if features.context_ratio > 0.8 && bucket != Bucket::Hard {
        bucket = bucket.escalated();
        guardrail = Some("context-pressure");
    }

    if features.has_code && bucket == Bucket::Cheap {
        bucket = Bucket::Mid;
        guardrail = Some("code-escalation");
    }

    let mut no_feasible = false;
    while !pools.fits(bucket, features.token_estimate) {
        if bucket == Bucket::Hard {
            no_feasible = true;
            guardrail = Some("no-feasible-candidate");
            break;
        }
        bucket = bucket.escalated();
        guardrail = Some("context-feasibility");
    }

    BucketDecision {
        bucket,
        guardrail,
        no_feasible,
    }
}
