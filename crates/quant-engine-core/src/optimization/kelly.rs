use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{MethodMetrics, MethodOutcome, Problem};
use crate::error::EngineError;
use crate::math::{mat_vec_multiply, to_dmatrix, vec_dot};
use crate::EngineResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KellyParams {
    /// Fractional-Kelly multiplier in (0, 1]. 1 is full Kelly.
    pub fraction: f64,
}

impl Default for KellyParams {
    fn default() -> Self {
        Self { fraction: 0.5 }
    }
}

/// Second-order expected log growth, `rf + w'(mu - rf) - 0.5 w'Sigma w`.
pub fn expected_log_growth(w: &[f64], mu: &[f64], sigma: &[Vec<f64>], risk_free_rate: f64) -> f64 {
    let excess: f64 = w.iter().zip(mu.iter()).map(|(wi, m)| wi * (m - risk_free_rate)).sum();
    risk_free_rate + excess - 0.5 * vec_dot(w, &mat_vec_multiply(sigma, w))
}

/// Unconstrained full-Kelly fractions `Sigma^-1 (mu - rf)`.
pub fn full_kelly(mu: &[f64], sigma: &[Vec<f64>], risk_free_rate: f64) -> Option<Vec<f64>> {
    let excess = DVector::from_iterator(mu.len(), mu.iter().map(|m| m - risk_free_rate));
    let chol = to_dmatrix(sigma).cholesky()?;
    Some(chol.solve(&excess).iter().copied().collect())
}

/// Maximise `w'(mu - rf) - w'Sigma w / (2 c)`. Scaling the variance penalty
/// by `1 / c` gives the fractional-Kelly bet `c Sigma^-1 (mu - rf)` when no
/// constraint binds.
pub(crate) fn solve(problem: &Problem<'_>, params: &KellyParams) -> EngineResult<MethodOutcome> {
    if !(params.fraction > 0.0 && params.fraction <= 1.0) {
        return Err(EngineError::config("fraction", "Must be in (0, 1]"));
    }
    let rf = problem.params.risk_free_rate;
    let excess: Vec<f64> = problem.mu.iter().map(|m| m - rf).collect();
    let penalty = 1.0 / params.fraction;

    let mut outcome = MethodOutcome::from(problem.descend(|w| {
        let sigma_w = mat_vec_multiply(problem.sigma, w);
        let value = -vec_dot(w, &excess) + 0.5 * penalty * vec_dot(w, &sigma_w);
        let grad = excess
            .iter()
            .zip(sigma_w.iter())
            .map(|(e, sw)| -e + penalty * sw)
            .collect();
        (value, grad)
    }));

    let full = full_kelly(problem.mu, problem.sigma, rf);
    if full.is_none() {
        outcome
            .warnings
            .push("Covariance not factorizable; full-Kelly fractions omitted".to_string());
    }
    let full_kelly: Option<BTreeMap<String, f64>> = full.map(|f| {
        problem
            .stats
            .symbols
            .iter()
            .cloned()
            .zip(f.into_iter().map(|x| x * params.fraction))
            .collect()
    });
    outcome.method_metrics = Some(MethodMetrics::Kelly {
        fraction: params.fraction,
        expected_log_growth: expected_log_growth(&outcome.weights, problem.mu, problem.sigma, rf),
        unconstrained_fractions: full_kelly,
    });
    Ok(outcome)
}
