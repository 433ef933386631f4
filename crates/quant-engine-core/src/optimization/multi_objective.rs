use serde::{Deserialize, Serialize};

use super::{MethodMetrics, MethodOutcome, Problem};
use crate::error::EngineError;
use crate::math::{mat_vec_multiply, vec_dot};
use crate::EngineResult;

/// Weights of the blended objective
/// `return_weight * w'mu - risk_weight * w'Sigma w + esg_weight * esg(w) / 100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiObjectiveParams {
    pub return_weight: f64,
    pub risk_weight: f64,
    pub esg_weight: f64,
}

impl Default for MultiObjectiveParams {
    fn default() -> Self {
        Self {
            return_weight: 1.0,
            risk_weight: 1.0,
            esg_weight: 0.0,
        }
    }
}

impl MultiObjectiveParams {
    fn validate(&self) -> EngineResult<()> {
        for (field, v) in [
            ("return_weight", self.return_weight),
            ("risk_weight", self.risk_weight),
            ("esg_weight", self.esg_weight),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::config(field, "Must be non-negative"));
            }
        }
        if self.return_weight + self.risk_weight + self.esg_weight <= 0.0 {
            return Err(EngineError::config(
                "objective weights",
                "At least one objective weight must be positive",
            ));
        }
        Ok(())
    }
}

pub(crate) fn solve(problem: &Problem<'_>, params: &MultiObjectiveParams) -> EngineResult<MethodOutcome> {
    params.validate()?;
    let scores: Vec<f64> = problem
        .stats
        .esg_scores
        .iter()
        .map(|s| s.unwrap_or(0.0))
        .collect();
    let budget = problem.set.budget;
    let esg_coeff: Vec<f64> = scores.iter().map(|s| params.esg_weight * s / (100.0 * budget)).collect();

    let mut outcome = MethodOutcome::from(problem.descend(|w| {
        let sigma_w = mat_vec_multiply(problem.sigma, w);
        let value = -params.return_weight * vec_dot(w, problem.mu)
            + params.risk_weight * vec_dot(w, &sigma_w)
            - vec_dot(w, &esg_coeff);
        let grad = (0..w.len())
            .map(|i| -params.return_weight * problem.mu[i] + 2.0 * params.risk_weight * sigma_w[i] - esg_coeff[i])
            .collect();
        (value, grad)
    }));

    if params.esg_weight > 0.0 && problem.stats.esg_scores.iter().any(Option::is_none) {
        outcome
            .warnings
            .push("Assets without an ESG score count as 0 in the ESG objective".to_string());
    }

    let w = &outcome.weights;
    let expected_return = vec_dot(w, problem.mu);
    let variance = vec_dot(w, &mat_vec_multiply(problem.sigma, w));
    let esg_score = vec_dot(w, &scores) / budget;
    outcome.method_metrics = Some(MethodMetrics::MultiObjective {
        expected_return,
        variance,
        esg_score,
        objective: params.return_weight * expected_return - params.risk_weight * variance
            + params.esg_weight * esg_score / 100.0,
    });
    Ok(outcome)
}
