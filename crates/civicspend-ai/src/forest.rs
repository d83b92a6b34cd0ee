//! Isolation forest: an ensemble of random partitioning trees.
//!
//! Each tree recursively splits a random subsample on a random feature at a
//! uniformly drawn threshold. Points that end up isolated after few splits
//! are outliers. Scores follow the usual convention: `score_samples` lies in
//! `[-1, 0)` and more negative means more anomalous; the decision boundary is
//! the training-score percentile given by the contamination fraction.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ModelError;
use crate::scaler::check_rows;

const EULER_GAMMA: f64 = 0.577_215_664_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_estimators: usize,
    /// Per-tree subsample cap; the full sample count is used if smaller.
    pub max_samples: usize,
    /// Expected outlier fraction, in `(0, 0.5]`.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// One partitioning tree stored as an arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn grow(data: &[Vec<f64>], sample_size: usize, max_depth: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = index::sample(&mut rng, data.len(), sample_size).into_vec();
        let mut tree = Tree { nodes: Vec::new() };
        tree.split(data, &mut sample, 0, max_depth, &mut rng);
        tree
    }

    fn split(
        &mut self,
        data: &[Vec<f64>],
        rows: &mut [usize],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= max_depth || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary within this node can split it.
        let dim = data[rows[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..dim)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(data[r][f]), hi.max(data[r][f]))
                });
                (lo < hi).then_some((f, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);

        let mut mid = 0;
        for i in 0..rows.len() {
            if data[rows[i]][feature] <= threshold {
                rows.swap(i, mid);
                mid += 1;
            }
        }
        let (left_rows, right_rows) = rows.split_at_mut(mid);
        let left = self.split(data, left_rows, depth + 1, max_depth, rng);
        let right = self.split(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// Depth at which `x` lands, plus the expected remaining depth of the
    /// leaf's unsplit points.
    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful binary-search-tree lookup over
/// `n` points; normalises depths across subsample sizes.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A fitted isolation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    config: ForestConfig,
    trees: Vec<Tree>,
    n_features: usize,
    sample_size: usize,
    /// Score below which a point is an outlier.
    offset: f64,
}

impl IsolationForest {
    /// Fit on a row-major matrix.
    ///
    /// Trees are grown in parallel from per-tree seeds drawn up front, so the
    /// result depends only on the data and `config.seed`.
    pub fn fit(rows: &[Vec<f64>], config: ForestConfig) -> Result<Self, ModelError> {
        if config.n_estimators == 0 {
            return Err(ModelError::InvalidParameter {
                name: "n_estimators",
                reason: "must be at least 1".into(),
            });
        }
        if config.max_samples == 0 {
            return Err(ModelError::InvalidParameter {
                name: "max_samples",
                reason: "must be at least 1".into(),
            });
        }
        if !(config.contamination > 0.0 && config.contamination <= 0.5) {
            return Err(ModelError::InvalidParameter {
                name: "contamination",
                reason: format!("{} is outside (0, 0.5]", config.contamination),
            });
        }
        let n_features = check_rows(rows, None)?;

        let sample_size = config.max_samples.min(rows.len());
        let max_depth = (sample_size.max(2) as f64).log2().ceil() as usize;

        let mut master = StdRng::seed_from_u64(config.seed);
        let seeds: Vec<u64> = (0..config.n_estimators).map(|_| master.next_u64()).collect();
        let trees: Vec<Tree> = seeds
            .par_iter()
            .map(|&seed| Tree::grow(rows, sample_size, max_depth, seed))
            .collect();
        debug!(trees = trees.len(), sample_size, max_depth, "grew isolation trees");

        let mut forest = Self {
            config,
            trees,
            n_features,
            sample_size,
            offset: 0.0,
        };
        let train_scores = forest.score_rows(rows);
        forest.offset = percentile(&train_scores, 100.0 * forest.config.contamination);
        info!(
            samples = rows.len(),
            features = n_features,
            offset = forest.offset,
            "isolation forest fitted"
        );
        Ok(forest)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Anomaly score per row: `-2^(-E[h(x)] / c(sample_size))`.
    pub fn score_samples(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        check_rows(rows, Some(self.n_features))?;
        Ok(self.score_rows(rows))
    }

    /// Score shifted by the fitted offset; negative means outlier.
    pub fn decision_function(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        Ok(self
            .score_samples(rows)?
            .into_iter()
            .map(|s| s - self.offset)
            .collect())
    }

    /// `true` for each row the ensemble considers an outlier.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<bool>, ModelError> {
        Ok(self
            .decision_function(rows)?
            .into_iter()
            .map(|d| d < 0.0)
            .collect())
    }

    fn score_rows(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let norm = average_path_length(self.sample_size);
        let n_trees = self.trees.len() as f64;
        rows.par_iter()
            .map(|x| {
                let mean_depth =
                    self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / n_trees;
                if norm > 0.0 {
                    -(2f64.powf(-mean_depth / norm))
                } else {
                    // Single-sample forests cannot isolate anything.
                    -1.0
                }
            })
            .collect()
    }
}

/// Linear-interpolated percentile on a 0–100 scale.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
