use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

use super::{MethodMetrics, MethodOutcome, Problem, SolveStatus};
use crate::error::EngineError;
use crate::math::{mat_vec_multiply, vec_dot};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParityParams {
    /// Target share of total risk per symbol. Equal shares when absent.
    /// Normalised to sum to 1.
    pub risk_budgets: Option<BTreeMap<String, f64>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Fraction of portfolio variance contributed by each asset,
/// `w_i (Sigma w)_i / w'Sigma w`.
pub fn risk_contributions(w: &[f64], sigma: &[Vec<f64>]) -> Vec<f64> {
    let sigma_w = mat_vec_multiply(sigma, w);
    let variance = vec_dot(w, &sigma_w);
    if variance <= 0.0 {
        return vec![0.0; w.len()];
    }
    w.iter()
        .zip(sigma_w.iter())
        .map(|(wi, swi)| wi * swi / variance)
        .collect()
}

pub(crate) fn solve(problem: &Problem<'_>, params: &RiskParityParams) -> EngineResult<MethodOutcome> {
    let budgets = resolve_budgets(&problem.stats.symbols, params)?;
    let n = budgets.len();

    let (y, iterations, converged) =
        coordinate_descent(problem.sigma, &budgets, problem.params.max_iterations, problem.params.tolerance, problem.deadline);
    let total: f64 = y.iter().sum();
    let unconstrained: Vec<f64> = y.iter().map(|v| problem.set.budget * v / total).collect();

    let mut outcome = if problem.set.check(&unconstrained).is_satisfied() {
        let status = if converged {
            SolveStatus::Converged
        } else {
            SolveStatus::TimedOut
        };
        MethodOutcome {
            weights: unconstrained,
            status,
            iterations,
            reason: (!converged)
                .then(|| "Risk budgeting iteration stopped before convergence".to_string()),
            method_metrics: None,
            warnings: Vec::new(),
        }
    } else {
        debug!(n, "risk parity point infeasible; solving budget-deviation program");
        let scale = {
            let v = vec_dot(&unconstrained, &mat_vec_multiply(problem.sigma, &unconstrained));
            1.0 / (v * v).max(1e-30)
        };
        let descent = problem.descend_from(&unconstrained, |w| {
            budget_deviation(w, problem.sigma, &budgets, scale)
        });
        let mut outcome = MethodOutcome::from(descent);
        outcome.iterations += iterations;
        outcome.warnings.push(
            "Equal-risk point violates the constraints; returned the closest constrained risk budget fit"
                .to_string(),
        );
        outcome
    };

    let contributions = risk_contributions(&outcome.weights, problem.sigma);
    let max_budget_error = contributions
        .iter()
        .zip(budgets.iter())
        .map(|(c, b)| (c - b).abs())
        .fold(0.0, f64::max);
    outcome.method_metrics = Some(MethodMetrics::RiskParity {
        budgets: problem
            .stats
            .symbols
            .iter()
            .cloned()
            .zip(budgets.iter().copied())
            .collect(),
        max_budget_error,
    });
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

fn resolve_budgets(symbols: &[String], params: &RiskParityParams) -> EngineResult<Vec<f64>> {
    let n = symbols.len();
    let raw = match &params.risk_budgets {
        None => return Ok(vec![1.0 / n as f64; n]),
        Some(map) => {
            if let Some(unknown) = map.keys().find(|k| !symbols.contains(k)) {
                return Err(EngineError::config(
                    "risk_budgets",
                    format!("Budget given for '{}', which is not in the universe", unknown),
                ));
            }
            symbols
                .iter()
                .map(|s| {
                    map.get(s).copied().ok_or_else(|| {
                        EngineError::config("risk_budgets", format!("No budget for '{}'", s))
                    })
                })
                .collect::<EngineResult<Vec<f64>>>()?
        }
    };
    if raw.iter().any(|b| !b.is_finite() || *b <= 0.0) {
        return Err(EngineError::config("risk_budgets", "Budgets must be positive"));
    }
    let total: f64 = raw.iter().sum();
    Ok(raw.into_iter().map(|b| b / total).collect())
}

/// Cyclical coordinate descent on `0.5 y'Sigma y - sum b_i ln y_i`, whose
/// minimiser normalised to the budget equalises risk contributions to `b`.
/// Starts from inverse-volatility weights.
fn coordinate_descent(
    sigma: &[Vec<f64>],
    budgets: &[f64],
    max_sweeps: usize,
    tolerance: f64,
    deadline: Option<Instant>,
) -> (Vec<f64>, usize, bool) {
    let n = budgets.len();
    let mut y: Vec<f64> = (0..n).map(|i| 1.0 / sigma[i][i].sqrt()).collect();
    let total: f64 = y.iter().sum();
    for v in &mut y {
        *v /= total;
    }

    for sweep in 1..=max_sweeps {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return (y, sweep - 1, false);
        }
        let mut largest_move = 0.0_f64;
        for i in 0..n {
            let cross: f64 = (0..n).filter(|&j| j != i).map(|j| sigma[i][j] * y[j]).sum();
            let a = sigma[i][i];
            let next = (-cross + (cross * cross + 4.0 * a * budgets[i]).sqrt()) / (2.0 * a);
            largest_move = largest_move.max((next - y[i]).abs() / next.max(1e-300));
            y[i] = next;
        }
        if largest_move <= tolerance {
            return (y, sweep, true);
        }
    }
    (y, max_sweeps, false)
}

/// `scale * sum_i (w_i (Sigma w)_i - b_i w'Sigma w)^2` and its gradient.
fn budget_deviation(w: &[f64], sigma: &[Vec<f64>], budgets: &[f64], scale: f64) -> (f64, Vec<f64>) {
    let n = w.len();
    let s = mat_vec_multiply(sigma, w);
    let v = vec_dot(w, &s);
    let r: Vec<f64> = (0..n).map(|i| w[i] * s[i] - budgets[i] * v).collect();
    let value = scale * r.iter().map(|x| x * x).sum::<f64>();

    let rw: Vec<f64> = r.iter().zip(w.iter()).map(|(ri, wi)| ri * wi).collect();
    let sigma_rw = mat_vec_multiply(sigma, &rw);
    let rb = vec_dot(&r, budgets);
    let grad = (0..n)
        .map(|k| scale * 2.0 * (r[k] * s[k] + sigma_rw[k] - 2.0 * s[k] * rb))
        .collect();
    (value, grad)
}
