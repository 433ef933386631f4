use super::{MethodOutcome, Problem};
use crate::math::{mat_vec_multiply, portfolio_variance, vec_dot};

/// Floor on portfolio volatility inside the Sharpe gradient.
const MIN_VOLATILITY: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Objectives
// ---------------------------------------------------------------------------

/// Negative Sharpe ratio `-(w'mu - rf) / sqrt(w'Sigma w)` and its gradient.
pub(crate) fn negative_sharpe(
    w: &[f64],
    mu: &[f64],
    sigma: &[Vec<f64>],
    risk_free_rate: f64,
) -> (f64, Vec<f64>) {
    let sigma_w = mat_vec_multiply(sigma, w);
    let variance = vec_dot(w, &sigma_w).max(0.0);
    let vol = variance.sqrt().max(MIN_VOLATILITY);
    let excess = vec_dot(w, mu) - risk_free_rate;
    let sharpe = excess / vol;
    // d(S)/dw = mu / vol - excess * Sigma w / vol^3
    let grad = mu
        .iter()
        .zip(sigma_w.iter())
        .map(|(m, sw)| -(m / vol - excess * sw / (vol * vol * vol)))
        .collect();
    (-sharpe, grad)
}

/// Negative mean-variance utility `-(w'mu) + (lambda / 2) w'Sigma w`.
pub(crate) fn negative_utility(
    w: &[f64],
    mu: &[f64],
    sigma: &[Vec<f64>],
    risk_aversion: f64,
) -> (f64, Vec<f64>) {
    let sigma_w = mat_vec_multiply(sigma, w);
    let value = -vec_dot(w, mu) + 0.5 * risk_aversion * vec_dot(w, &sigma_w);
    let grad = mu
        .iter()
        .zip(sigma_w.iter())
        .map(|(m, sw)| -m + risk_aversion * sw)
        .collect();
    (value, grad)
}

pub(crate) fn variance(w: &[f64], sigma: &[Vec<f64>]) -> (f64, Vec<f64>) {
    let grad = mat_vec_multiply(sigma, w)
        .into_iter()
        .map(|x| 2.0 * x)
        .collect();
    (portfolio_variance(w, sigma), grad)
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

pub(crate) fn max_sharpe(problem: &Problem<'_>) -> MethodOutcome {
    let rf = problem.params.risk_free_rate;
    MethodOutcome::from(problem.descend(|w| negative_sharpe(w, problem.mu, problem.sigma, rf)))
}

pub(crate) fn mean_variance(problem: &Problem<'_>, risk_aversion: f64) -> MethodOutcome {
    MethodOutcome::from(
        problem.descend(|w| negative_utility(w, problem.mu, problem.sigma, risk_aversion)),
    )
}

pub(crate) fn min_variance(problem: &Problem<'_>) -> MethodOutcome {
    MethodOutcome::from(problem.descend(|w| variance(w, problem.sigma)))
}
