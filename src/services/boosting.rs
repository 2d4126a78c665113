//! Gradient-boosted ensembles of shallow regression trees.
//!
//! Second-order boosting: each round fits a tree to the per-row gradient and
//! hessian of the loss, leaf values are `-G / (H + lambda)` and splits are
//! chosen by the matching gain. Logistic loss for binary targets, squared
//! error for goal counts. Fitting is fully deterministic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TrainingConfig;

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("no training rows")]
    Empty,
    #[error("row {row} has {found} features, expected {expected}")]
    Ragged { row: usize, found: usize, expected: usize },
    #[error("non-finite label or weight at row {0}")]
    NonFinite(usize),
    #[error("total sample weight is zero")]
    ZeroWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    Logistic,
    SquaredError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub rounds: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    pub l2_lambda: f64,
}

impl From<&TrainingConfig> for TreeParams {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            rounds: config.rounds,
            max_depth: config.max_depth,
            learning_rate: config.learning_rate,
            min_samples_leaf: config.min_samples_leaf.max(1),
            l2_lambda: config.l2_lambda,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split { feature, threshold, left, right }) => {
                    let x = row.get(*feature).copied().unwrap_or(f64::NAN);
                    // NaN goes right, matching "not <= threshold"
                    idx = if x <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    pub objective: Objective,
    pub base_score: f64,
    pub learning_rate: f64,
    pub n_features: usize,
    pub trees: Vec<RegressionTree>,
}

impl BoostedEnsemble {
    pub fn predict_raw(&self, row: &[f64]) -> f64 {
        self.base_score
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    /// Probability for logistic ensembles, non-negative expectation for squared error
    pub fn predict(&self, row: &[f64]) -> f64 {
        let raw = self.predict_raw(row);
        match self.objective {
            Objective::Logistic => sigmoid(raw),
            Objective::SquaredError => raw.max(0.0),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-node working set
struct NodeRows {
    members: Vec<bool>,
    count: usize,
}

struct TreeFitter<'a> {
    x: &'a [Vec<f64>],
    sorted: &'a [Vec<usize>],
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a TreeParams,
    nodes: Vec<Node>,
}

impl<'a> TreeFitter<'a> {
    fn leaf_value(&self, rows: &NodeRows) -> f64 {
        let (g, h) = self.sums(rows);
        -g / (h + self.params.l2_lambda)
    }

    fn sums(&self, rows: &NodeRows) -> (f64, f64) {
        rows.members
            .iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .fold((0.0, 0.0), |(g, h), (i, _)| (g + self.grad[i], h + self.hess[i]))
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.l2_lambda)
    }

    /// Best (gain, feature, threshold) for this node, if any split is admissible
    fn best_split(&self, rows: &NodeRows) -> Option<(f64, usize, f64)> {
        let (g_total, h_total) = self.sums(rows);
        let parent = self.score(g_total, h_total);
        let min_leaf = self.params.min_samples_leaf;
        let mut best: Option<(f64, usize, f64)> = None;

        for (feature, order) in self.sorted.iter().enumerate() {
            let (mut g_left, mut h_left, mut n_left) = (0.0, 0.0, 0usize);
            let mut prev: Option<usize> = None;

            for &i in order.iter().filter(|&&i| rows.members[i]) {
                if let Some(p) = prev {
                    let (xp, xi) = (self.x[p][feature], self.x[i][feature]);
                    let n_right = rows.count - n_left;
                    if xi > xp && n_left >= min_leaf && n_right >= min_leaf {
                        let gain = self.score(g_left, h_left)
                            + self.score(g_total - g_left, h_total - h_left)
                            - parent;
                        if gain > 1e-12 && best.map_or(true, |(b, _, _)| gain > b) {
                            best = Some((gain, feature, (xp + xi) / 2.0));
                        }
                    }
                }
                g_left += self.grad[i];
                h_left += self.hess[i];
                n_left += 1;
                prev = Some(i);
            }
        }
        best
    }

    fn grow(&mut self, rows: NodeRows, depth: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { value: self.leaf_value(&rows) });

        if depth >= self.params.max_depth || rows.count < 2 * self.params.min_samples_leaf {
            return idx;
        }
        let Some((_, feature, threshold)) = self.best_split(&rows) else {
            return idx;
        };

        let mut left = NodeRows { members: vec![false; rows.members.len()], count: 0 };
        let mut right = NodeRows { members: vec![false; rows.members.len()], count: 0 };
        for (i, member) in rows.members.iter().enumerate() {
            if !*member {
                continue;
            }
            if self.x[i][feature] <= threshold {
                left.members[i] = true;
                left.count += 1;
            } else {
                right.members[i] = true;
                right.count += 1;
            }
        }

        let l = self.grow(left, depth + 1);
        let r = self.grow(right, depth + 1);
        self.nodes[idx] = Node::Split { feature, threshold, left: l, right: r };
        idx
    }
}

/// Fit a boosted ensemble on an already-imputed matrix
pub fn fit(
    x: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    objective: Objective,
    params: &TreeParams,
) -> Result<BoostedEnsemble, FitError> {
    if x.is_empty() || y.len() != x.len() || weights.len() != x.len() {
        return Err(FitError::Empty);
    }
    let n_features = x[0].len();
    for (row, values) in x.iter().enumerate() {
        if values.len() != n_features {
            return Err(FitError::Ragged { row, found: values.len(), expected: n_features });
        }
    }
    for i in 0..x.len() {
        if !y[i].is_finite() || !weights[i].is_finite() || weights[i] < 0.0 {
            return Err(FitError::NonFinite(i));
        }
    }
    let total_weight: f64 = weights.iter().sum();
    if total_weight <= 0.0 {
        return Err(FitError::ZeroWeight);
    }

    let mean_y = y.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total_weight;
    let base_score = match objective {
        Objective::Logistic => {
            let p = mean_y.clamp(1e-4, 1.0 - 1e-4);
            (p / (1.0 - p)).ln()
        }
        Objective::SquaredError => mean_y,
    };

    let sorted: Vec<Vec<usize>> = (0..n_features)
        .map(|f| {
            let mut order: Vec<usize> = (0..x.len()).collect();
            order.sort_by(|&a, &b| {
                x[a][f]
                    .partial_cmp(&x[b][f])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            order
        })
        .collect();

    let mut raw = vec![base_score; x.len()];
    let mut grad = vec![0.0; x.len()];
    let mut hess = vec![0.0; x.len()];
    let mut trees = Vec::with_capacity(params.rounds);

    for _ in 0..params.rounds {
        for i in 0..x.len() {
            let (g, h) = match objective {
                Objective::Logistic => {
                    let p = sigmoid(raw[i]);
                    (p - y[i], (p * (1.0 - p)).max(1e-6))
                }
                Objective::SquaredError => (raw[i] - y[i], 1.0),
            };
            grad[i] = g * weights[i];
            hess[i] = h * weights[i];
        }

        let mut fitter = TreeFitter {
            x,
            sorted: &sorted,
            grad: &grad,
            hess: &hess,
            params,
            nodes: Vec::new(),
        };
        fitter.grow(NodeRows { members: vec![true; x.len()], count: x.len() }, 0);
        let tree = RegressionTree { nodes: fitter.nodes };

        for (i, row) in x.iter().enumerate() {
            raw[i] += params.learning_rate * tree.predict(row);
        }
        trees.push(tree);
    }

    Ok(BoostedEnsemble {
        objective,
        base_score,
        learning_rate: params.learning_rate,
        n_features,
        trees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TreeParams {
        TreeParams {
            rounds: 40,
            max_depth: 2,
            learning_rate: 0.3,
            min_samples_leaf: 2,
            l2_lambda: 1.0,
        }
    }

    #[test]
    fn test_logistic_learns_threshold() {
        let x: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, 0.0]).collect();
        let y: Vec<f64> = (0..40).map(|i| if i >= 20 { 1.0 } else { 0.0 }).collect();
        let w = vec![1.0; 40];
        let model = fit(&x, &y, &w, Objective::Logistic, &params()).unwrap();
        assert!(model.predict(&[35.0, 0.0]) > 0.8);
        assert!(model.predict(&[5.0, 0.0]) < 0.2);
        assert!(model.trees.iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn test_squared_error_tracks_mean_and_is_non_negative() {
        let x: Vec<Vec<f64>> = (0..30).map(|i| vec![(i % 3) as f64]).collect();
        let y: Vec<f64> = (0..30).map(|i| (i % 3) as f64).collect();
        let w = vec![1.0; 30];
        let model = fit(&x, &y, &w, Objective::SquaredError, &params()).unwrap();
        assert!((model.predict(&[2.0]) - 2.0).abs() < 0.2);
        assert!(model.predict(&[0.0]) >= 0.0);
    }

    #[test]
    fn test_weights_shift_the_base_rate() {
        let x: Vec<Vec<f64>> = vec![vec![0.0]; 4];
        let y = vec![1.0, 1.0, 0.0, 0.0];
        let w = vec![3.0, 3.0, 1.0, 1.0];
        let model = fit(&x, &y, &w, Objective::Logistic, &TreeParams { rounds: 0, ..params() }).unwrap();
        assert!((model.predict(&[0.0]) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_constant_feature_yields_leaf_only_trees() {
        let x: Vec<Vec<f64>> = vec![vec![1.0]; 10];
        let y: Vec<f64> = (0..10).map(|i| (i % 2) as f64).collect();
        let model = fit(&x, &y, &[1.0; 10], Objective::Logistic, &params()).unwrap();
        assert!(model.trees.iter().all(|t| t.depth() == 0));
        assert!((model.predict(&[1.0]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(fit(&[], &[], &[], Objective::Logistic, &params()), Err(FitError::Empty));
        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            fit(&ragged, &[0.0, 1.0], &[1.0, 1.0], Objective::Logistic, &params()),
            Err(FitError::Ragged { row: 1, .. })
        ));
        assert_eq!(
            fit(&[vec![1.0]], &[f64::NAN], &[1.0], Objective::Logistic, &params()),
            Err(FitError::NonFinite(0))
        );
        assert_eq!(
            fit(&[vec![1.0]], &[1.0], &[0.0], Objective::Logistic, &params()),
            Err(FitError::ZeroWeight)
        );
    }

    #[test]
    fn test_fit_is_deterministic() {
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![(i * 7 % 11) as f64, (i % 5) as f64]).collect();
        let y: Vec<f64> = (0..50).map(|i| ((i * 3) % 2) as f64).collect();
        let w = vec![1.0; 50];
        let a = fit(&x, &y, &w, Objective::Logistic, &params()).unwrap();
        let b = fit(&x, &y, &w, Objective::Logistic, &params()).unwrap();
        assert_eq!(a, b);
    }
}
