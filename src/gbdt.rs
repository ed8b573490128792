//! Gradient-boosted-tree runtime for request triage.
//!
//! Evaluates the ensemble shipped inside the tuning artifact against a dense
//! feature vector and yields bucket probabilities. The caller passes an
//! artifact snapshot, so a concurrent artifact swap can never interrupt an
//! in-flight evaluation.

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::bucket::BucketProbs;

pub const N_BUCKETS: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GbdtModel {
    #[serde(default)]
    pub base_score: Vec<f64>,
    pub trees: Vec<Tree>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

/// Serialized node: either an internal split or a leaf carrying one score
/// contribution per bucket. The field sets are disjoint, so the wire form
/// stays untagged.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: Vec<f64>,
    },
}

impl GbdtModel {
    /// Structural validation run once at artifact load. Child indices must
    /// point strictly forward so traversal terminates, leaves must carry one
    /// value per bucket and split features must exist in the schema.
    pub fn validate(&self, n_features: usize) -> Result<(), String> {
        if !self.base_score.is_empty() && self.base_score.len() != N_BUCKETS {
            return Err(format!(
                "base_score has {} entries, expected {}",
                self.base_score.len(),
                N_BUCKETS
            ));
        }
        for (t_idx, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(format!("tree {} has no nodes", t_idx));
            }
            for (n_idx, node) in tree.nodes.iter().enumerate() {
                match node {
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        if *feature >= n_features {
                            return Err(format!(
                                "tree {} node {} splits on feature {} but schema has {}",
                                t_idx, n_idx, feature, n_features
                            ));
                        }
                        if !threshold.is_finite() {
                            return Err(format!("tree {} node {} threshold not finite", t_idx, n_idx));
                        }
                        if *left <= n_idx || *right <= n_idx {
                            return Err(format!(
                                "tree {} node {} has non-forward child index",
                                t_idx, n_idx
                            ));
                        }
                        if *left >= tree.nodes.len() || *right >= tree.nodes.len() {
                            return Err(format!(
                                "tree {} node {} child index out of range",
                                t_idx, n_idx
                            ));
                        }
                    }
                    Node::Leaf { leaf } => {
                        if leaf.len() != N_BUCKETS {
                            return Err(format!(
                                "tree {} node {} leaf has {} scores, expected {}",
                                t_idx,
                                n_idx,
                                leaf.len(),
                                N_BUCKETS
                            ));
                        }
                        if leaf.iter().any(|v| !v.is_finite()) {
                            return Err(format!("tree {} node {} leaf not finite", t_idx, n_idx));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accumulate(&self, features: &[f64], scores: &mut [f64; N_BUCKETS]) -> Result<(), ()> {
        for tree in &self.trees {
            let mut idx = 0usize;
            // Forward-only child indices were validated at load; the bound
            // here is a second line against a corrupt swap.
            for _ in 0..tree.nodes.len() {
                match &tree.nodes[idx] {
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        let value = features.get(*feature).copied().ok_or(())?;
                        idx = if value <= *threshold { *left } else { *right };
                    }
                    Node::Leaf { leaf } => {
                        for (s, l) in scores.iter_mut().zip(leaf) {
                            *s += l;
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionSource {
    Model,
    Prior,
}

#[derive(Clone, Debug)]
pub struct Prediction {
    pub probs: BucketProbs,
    pub source: PredictionSource,
}

/// Evaluate the ensemble of the given artifact snapshot. Absent artifact or
/// any evaluation failure yields the safe prior; the orchestrator marks such
/// decisions `gbdt-fallback`.
pub fn predict(artifact: Option<&Artifact>, features: &[f64]) -> Prediction {
    let Some(artifact) = artifact else {
        return Prediction {
            probs: BucketProbs::PRIOR,
            source: PredictionSource::Prior,
        };
    };
    let model = &artifact.gbdt;
    let mut scores = [0f64; N_BUCKETS];
    for (s, b) in scores.iter_mut().zip(model.base_score.iter()) {
        *s = *b;
    }
    if model.accumulate(features, &mut scores).is_err() {
        tracing::warn!(version = %artifact.version, "gbdt evaluation failed, using prior");
        return Prediction {
            probs: BucketProbs::PRIOR,
            source: PredictionSource::Prior,
        };
    }
    let probs = softmax(&scores);
    if !probs.is_valid() {
        tracing::warn!(version = %artifact.version, "gbdt produced invalid probabilities, using prior");
        return Prediction {
            probs: BucketProbs::PRIOR,
            source: PredictionSource::Prior,
        };
    }
    Prediction {
        probs,
        source: PredictionSource::Model,
    }
}

fn softmax(scores: &[f64; N_BUCKETS]) -> BucketProbs {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    BucketProbs {
        cheap: exps[0] / sum,
        mid: exps[1] / sum,
        hard: exps[2] / sum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::artifact_with_gbdt;

    fn stump(feature: usize, threshold: f64, left: [f64; 3], right: [f64; 3]) -> GbdtModel {
        GbdtModel {
            base_score: vec![],
            trees: vec![Tree {
                nodes: vec![
                    Node::Split {
                        feature,
                        threshold,
                        left: 1,
                        right: 2,
                    },
                    Node::Leaf {
                        leaf: left.to_vec(),
                    },
                    Node::Leaf {
                        leaf: right.to_vec(),
                    },
                ],
            }],
        }
    }

    #[test]
    fn absent_artifact_yields_prior() {
        let p = predict(None, &[1.0, 2.0]);
        assert_eq!(p.source, PredictionSource::Prior);
        assert!((p.probs.cheap - 0.5).abs() < 1e-9);
        assert!((p.probs.mid - 0.35).abs() < 1e-9);
        assert!((p.probs.hard - 0.15).abs() < 1e-9);
    }

    #[test]
    fn stump_routes_by_threshold_and_is_deterministic() {
        let model = stump(0, 4.0, [2.0, 0.0, -2.0], [-2.0, 0.0, 2.0]);
        let artifact = artifact_with_gbdt(model, 6);

        let low = predict(Some(&artifact), &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(low.source, PredictionSource::Model);
        assert!(low.probs.cheap > low.probs.hard);

        let high = predict(Some(&artifact), &[9.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(high.probs.hard > high.probs.cheap);

        let again = predict(Some(&artifact), &[9.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(high.probs.hard.to_bits(), again.probs.hard.to_bits());
    }

    #[test]
    fn probabilities_sum_to_one() {
        let model = stump(2, 0.5, [0.3, 0.2, 0.1], [1.0, 2.0, 3.0]);
        let artifact = artifact_with_gbdt(model, 6);
        let p = predict(Some(&artifact), &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        assert!(p.probs.is_valid());
    }

    #[test]
    fn short_feature_vector_falls_back_to_prior() {
        let model = stump(5, 0.5, [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]);
        let artifact = artifact_with_gbdt(model, 6);
        let p = predict(Some(&artifact), &[0.0, 0.0]);
        assert_eq!(p.source, PredictionSource::Prior);
    }

    #[test]
    fn validation_rejects_backward_edges_and_bad_leaves() {
        let cyclic = GbdtModel {
            base_score: vec![],
            trees: vec![Tree {
                nodes: vec![
                    Node::Split {
                        feature: 0,
                        threshold: 0.0,
                        left: 0,
                        right: 1,
                    },
                    Node::Leaf {
                        leaf: vec![0.0, 0.0, 0.0],
                    },
                ],
            }],
        };
        assert!(cyclic.validate(6).is_err());

        let short_leaf = GbdtModel {
            base_score: vec![],
            trees: vec![Tree {
                nodes: vec![Node::Leaf { leaf: vec![0.0] }],
            }],
        };
        assert!(short_leaf.validate(6).is_err());

        let bad_feature = stump(11, 0.0, [0.0; 3], [0.0; 3]);
        assert!(bad_feature.validate(6).is_err());
    }
}
