use serde::{Deserialize, Serialize};

use super::{MethodMetrics, MethodOutcome, Problem};
use crate::error::EngineError;
use crate::math::{mat_vec_multiply, vec_dot};
use crate::EngineResult;

/// Floor on `sqrt(w'Theta w)` inside the gradient.
const MIN_ESTIMATION_RISK: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustParams {
    /// Radius of the ellipsoidal uncertainty set around the return estimate.
    pub epsilon: f64,
    /// Years of data behind the estimate, `Theta = Sigma / T`. Defaults to
    /// the length of the return history.
    pub estimation_years: Option<f64>,
    pub risk_aversion: f64,
}

impl Default for RobustParams {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            estimation_years: None,
            risk_aversion: 2.5,
        }
    }
}

/// Worst-case return over `{mu' : (mu' - mu)' Theta^-1 (mu' - mu) <= eps^2}`,
/// which is `w'mu - eps sqrt(w'Theta w)`.
pub fn worst_case_return(w: &[f64], mu: &[f64], theta: &[Vec<f64>], epsilon: f64) -> f64 {
    let spread = vec_dot(w, &mat_vec_multiply(theta, w)).max(0.0).sqrt();
    vec_dot(w, mu) - epsilon * spread
}

/// Maximise `w'mu - eps sqrt(w'Theta w) - (lambda / 2) w'Sigma w`.
pub(crate) fn solve(problem: &Problem<'_>, params: &RobustParams) -> EngineResult<MethodOutcome> {
    if !(params.epsilon >= 0.0) || !params.epsilon.is_finite() {
        return Err(EngineError::config("epsilon", "Must be non-negative"));
    }
    if !(params.risk_aversion >= 0.0) || !params.risk_aversion.is_finite() {
        return Err(EngineError::config("risk_aversion", "Must be non-negative"));
    }
    let years = match params.estimation_years {
        Some(t) if t > 0.0 && t.is_finite() => t,
        Some(_) => {
            return Err(EngineError::config("estimation_years", "Must be positive"));
        }
        None => {
            let obs = problem.stats.observations().max(1) as f64;
            obs / problem.stats.periods_per_year
        }
    };
    let theta: Vec<Vec<f64>> = problem
        .sigma
        .iter()
        .map(|row| row.iter().map(|v| v / years).collect())
        .collect();

    let eps = params.epsilon;
    let lambda = params.risk_aversion;
    let mut outcome = MethodOutcome::from(problem.descend(|w| {
        let theta_w = mat_vec_multiply(&theta, w);
        let spread = vec_dot(w, &theta_w).max(0.0).sqrt().max(MIN_ESTIMATION_RISK);
        let sigma_w = mat_vec_multiply(problem.sigma, w);
        let value = -vec_dot(w, problem.mu) + eps * spread + 0.5 * lambda * vec_dot(w, &sigma_w);
        let grad = (0..w.len())
            .map(|i| -problem.mu[i] + eps * theta_w[i] / spread + lambda * sigma_w[i])
            .collect();
        (value, grad)
    }));

    outcome.method_metrics = Some(MethodMetrics::Robust {
        epsilon: eps,
        estimation_years: years,
        nominal_return: vec_dot(&outcome.weights, problem.mu),
        worst_case_return: worst_case_return(&outcome.weights, problem.mu, &theta, eps),
    });
    Ok(outcome)
}
