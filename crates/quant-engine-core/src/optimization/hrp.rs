//! Hierarchical Risk Parity.
//!
//! Assets are clustered by average linkage over the correlation distance
//! `1 - rho`. The tree is then split top-down: at every merge node the two
//! child clusters share their parent's weight in inverse proportion to their
//! inverse-variance cluster variances. No covariance inverse is needed.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{MethodMetrics, MethodOutcome, Problem, SolveStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One agglomeration step. Leaves are numbered `0..n`; the cluster formed at
/// step `k` gets id `n + k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkageStep {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dendrogram {
    n_leaves: usize,
    steps: Vec<LinkageStep>,
}

impl Dendrogram {
    pub fn steps(&self) -> &[LinkageStep] {
        &self.steps
    }

    fn root(&self) -> Option<usize> {
        match self.n_leaves {
            0 => None,
            1 => Some(0),
            n => Some(n + self.steps.len() - 1),
        }
    }

    fn children(&self, node: usize) -> Option<(usize, usize)> {
        node.checked_sub(self.n_leaves)
            .and_then(|k| self.steps.get(k))
            .map(|s| (s.left, s.right))
    }

    /// Leaves under `node`, left subtree first.
    pub fn leaves(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            match self.children(current) {
                Some((l, r)) => {
                    stack.push(r);
                    stack.push(l);
                }
                None => out.push(current),
            }
        }
        out
    }

    /// Quasi-diagonal ordering of the leaves.
    pub fn order(&self) -> Vec<usize> {
        self.root().map(|r| self.leaves(r)).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

/// Average-linkage agglomerative clustering on a distance matrix. Ties go to
/// the lowest `(i, j)` pair.
pub fn average_linkage(dist: &[Vec<f64>]) -> Dendrogram {
    let n = dist.len();
    let mut d = dist.to_vec();
    let mut active = vec![true; n];
    let mut node_id: Vec<usize> = (0..n).collect();
    let mut size = vec![1usize; n];
    let mut steps = Vec::with_capacity(n.saturating_sub(1));

    for step in 0..n.saturating_sub(1) {
        let (mut mi, mut mj, mut min_d) = (0, 0, f64::INFINITY);
        for i in (0..n).filter(|&i| active[i]) {
            for j in ((i + 1)..n).filter(|&j| active[j]) {
                if d[i][j] < min_d {
                    min_d = d[i][j];
                    mi = i;
                    mj = j;
                }
            }
        }

        let merged = size[mi] + size[mj];
        steps.push(LinkageStep {
            left: node_id[mi],
            right: node_id[mj],
            distance: min_d,
            size: merged,
        });

        for k in (0..n).filter(|&k| active[k] && k != mi && k != mj) {
            let avg = (size[mi] as f64 * d[mi][k] + size[mj] as f64 * d[mj][k]) / merged as f64;
            d[mi][k] = avg;
            d[k][mi] = avg;
        }
        node_id[mi] = n + step;
        size[mi] = merged;
        active[mj] = false;
    }

    Dendrogram { n_leaves: n, steps }
}

/// Variance of a cluster held at inverse-variance weights.
fn cluster_variance(members: &[usize], sigma: &[Vec<f64>]) -> f64 {
    let inv: Vec<f64> = members
        .iter()
        .map(|&i| {
            let v = sigma[i][i];
            if v > 1e-15 {
                1.0 / v
            } else {
                0.0
            }
        })
        .collect();
    let total: f64 = inv.iter().sum();
    if total < 1e-15 {
        return 1.0;
    }
    let mut var = 0.0;
    for (a, &i) in members.iter().enumerate() {
        for (b, &j) in members.iter().enumerate() {
            var += (inv[a] / total) * (inv[b] / total) * sigma[i][j];
        }
    }
    var
}

/// Split weight down the tree, starting from 1 at the root.
pub fn bisect_weights(tree: &Dendrogram, sigma: &[Vec<f64>]) -> Vec<f64> {
    let n = tree.n_leaves;
    let mut weights = vec![0.0; n];
    let Some(root) = tree.root() else {
        return weights;
    };
    let mut stack = vec![(root, 1.0_f64)];
    while let Some((node, share)) = stack.pop() {
        match tree.children(node) {
            None => weights[node] = share,
            Some((l, r)) => {
                let var_l = cluster_variance(&tree.leaves(l), sigma);
                let var_r = cluster_variance(&tree.leaves(r), sigma);
                let denom = var_l + var_r;
                let alpha = if denom > 1e-30 { 1.0 - var_l / denom } else { 0.5 };
                stack.push((l, share * alpha));
                stack.push((r, share * (1.0 - alpha)));
            }
        }
    }
    weights
}

pub(crate) fn solve(problem: &Problem<'_>) -> MethodOutcome {
    let correlation = problem.stats.covariance.correlation();
    let dist: Vec<Vec<f64>> = correlation
        .iter()
        .map(|row| row.iter().map(|rho| (1.0 - rho).max(0.0)).collect())
        .collect();
    let tree = average_linkage(&dist);
    let raw = bisect_weights(&tree, problem.sigma);
    let scaled: Vec<f64> = raw.iter().map(|w| w * problem.set.budget).collect();

    let mut warnings = Vec::new();
    let weights = if problem.set.check(&scaled).is_satisfied() {
        scaled
    } else {
        warn!("HRP allocation violates constraints; repairing");
        warnings.push(
            "HRP allocation violated the constraints and was projected onto the feasible set"
                .to_string(),
        );
        problem.set.repair(&scaled)
    };

    let symbols = &problem.stats.symbols;
    MethodOutcome {
        weights,
        status: SolveStatus::Converged,
        iterations: tree.steps().len(),
        reason: None,
        method_metrics: Some(MethodMetrics::Hrp {
            linkage: tree.steps().to_vec(),
            order: tree.order().into_iter().map(|i| symbols[i].clone()).collect(),
        }),
        warnings,
    }
}
