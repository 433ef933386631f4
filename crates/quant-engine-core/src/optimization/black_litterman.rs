use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::mean_variance::negative_utility;
use super::{MethodMetrics, MethodOutcome, Problem};
use crate::error::EngineError;
use crate::math::{equal_weights, from_dmatrix, to_dmatrix};
use crate::types::PortfolioWeights;
use crate::EngineResult;

/// Floor on a view's uncertainty so a fully confident view stays invertible.
const OMEGA_FLOOR: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An investor view. `confidence` in (0, 1]; 1 means no view uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum View {
    /// "`symbol` will return `expected_return`."
    Absolute {
        symbol: String,
        expected_return: f64,
        confidence: f64,
    },
    /// "`long` will outperform `short` by `expected_return`."
    Relative {
        long: String,
        short: String,
        expected_return: f64,
        confidence: f64,
    },
    /// A view on any linear combination of assets, `sum picks_i * r_i = expected_return`.
    Basket {
        picks: BTreeMap<String, f64>,
        expected_return: f64,
        confidence: f64,
    },
}

impl View {
    fn confidence(&self) -> f64 {
        match self {
            View::Absolute { confidence, .. }
            | View::Relative { confidence, .. }
            | View::Basket { confidence, .. } => *confidence,
        }
    }

    fn expected_return(&self) -> f64 {
        match self {
            View::Absolute { expected_return, .. }
            | View::Relative { expected_return, .. }
            | View::Basket { expected_return, .. } => *expected_return,
        }
    }

    fn picks(&self) -> Vec<(&str, f64)> {
        match self {
            View::Absolute { symbol, .. } => vec![(symbol.as_str(), 1.0)],
            View::Relative { long, short, .. } => vec![(long.as_str(), 1.0), (short.as_str(), -1.0)],
            View::Basket { picks, .. } => picks.iter().map(|(s, c)| (s.as_str(), *c)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackLittermanParams {
    pub views: Vec<View>,
    /// Scales the prior's uncertainty, `tau * Sigma`.
    pub tau: f64,
    /// Market risk aversion delta, used for reverse optimisation and the final solve.
    pub risk_aversion: f64,
    /// Equilibrium weights. Falls back to market caps, then equal weights.
    pub market_weights: Option<PortfolioWeights>,
}

impl Default for BlackLittermanParams {
    fn default() -> Self {
        Self {
            views: Vec::new(),
            tau: 0.05,
            risk_aversion: 2.5,
            market_weights: None,
        }
    }
}

/// Prior and posterior expected returns.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub implied: Vec<f64>,
    pub returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Blend the reverse-optimised prior `pi = delta Sigma w_mkt` with `views`.
pub fn posterior(
    symbols: &[String],
    sigma: &[Vec<f64>],
    market_weights: &[f64],
    params: &BlackLittermanParams,
) -> EngineResult<Posterior> {
    validate_params(params)?;
    let n = symbols.len();
    let k = params.views.len();
    let sigma_m = to_dmatrix(sigma);
    let w_mkt = DVector::from_column_slice(market_weights);
    let pi = &sigma_m * &w_mkt * params.risk_aversion;

    if k == 0 {
        return Ok(Posterior {
            implied: pi.iter().copied().collect(),
            returns: pi.iter().copied().collect(),
            covariance: from_dmatrix(&(&sigma_m * (1.0 + params.tau))),
        });
    }

    let (p, q) = pick_matrix_and_q(&params.views, symbols)?;
    let tau_sigma = &sigma_m * params.tau;
    let view_cov = &p * &tau_sigma * p.transpose();
    let omega = build_omega(&view_cov, &params.views);
    let a_inv = (&view_cov + omega).try_inverse().ok_or_else(|| {
        EngineError::numerical(
            "black_litterman",
            "View covariance P tau Sigma P' + Omega is singular",
        )
    })?;

    let gain = &tau_sigma * p.transpose() * a_inv;
    let mu_post = &pi + &gain * (&q - &p * &pi);
    let sigma_post = &sigma_m + &tau_sigma - &gain * &p * &tau_sigma;
    let sigma_post = (&sigma_post + sigma_post.transpose()) * 0.5;
    debug!(n, views = k, "black-litterman posterior built");

    Ok(Posterior {
        implied: pi.iter().copied().collect(),
        returns: mu_post.iter().copied().collect(),
        covariance: from_dmatrix(&sigma_post),
    })
}

pub(crate) fn solve(problem: &Problem<'_>, params: &BlackLittermanParams) -> EngineResult<MethodOutcome> {
    let symbols = &problem.stats.symbols;
    let (market, market_note) = market_weights(problem, params)?;
    let post = posterior(symbols, problem.sigma, &market, params)?;

    let delta = params.risk_aversion;
    let mut outcome = MethodOutcome::from(
        problem.descend(|w| negative_utility(w, &post.returns, &post.covariance, delta)),
    );
    outcome.warnings.extend(market_note);

    let by_symbol = |values: &[f64]| -> BTreeMap<String, f64> {
        symbols.iter().cloned().zip(values.iter().copied()).collect()
    };
    outcome.method_metrics = Some(MethodMetrics::BlackLitterman {
        prior_returns: by_symbol(&post.implied),
        posterior_returns: by_symbol(&post.returns),
        market_weights: by_symbol(&market),
        views: params.views.len(),
    });
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

fn market_weights(
    problem: &Problem<'_>,
    params: &BlackLittermanParams,
) -> EngineResult<(Vec<f64>, Option<String>)> {
    let symbols = &problem.stats.symbols;
    let n = symbols.len();
    let raw: Vec<f64> = if let Some(map) = &params.market_weights {
        if let Some(unknown) = map.keys().find(|s| !symbols.contains(s)) {
            return Err(EngineError::config(
                "market_weights",
                format!("'{}' is not in the universe", unknown),
            ));
        }
        symbols.iter().map(|s| map.get(s).copied().unwrap_or(0.0)).collect()
    } else if problem.stats.market_caps.iter().all(Option::is_some) && n > 0 {
        problem.stats.market_caps.iter().map(|c| c.unwrap_or(0.0)).collect()
    } else {
        return Ok((
            equal_weights(n, 1.0),
            Some("No market weights or caps for every asset; equal-weight prior used".to_string()),
        ));
    };

    if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(EngineError::config("market_weights", "Must be non-negative"));
    }
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(EngineError::config("market_weights", "Must have a positive total"));
    }
    Ok((raw.into_iter().map(|w| w / total).collect(), None))
}

fn validate_params(params: &BlackLittermanParams) -> EngineResult<()> {
    if !(params.tau > 0.0) || !params.tau.is_finite() {
        return Err(EngineError::config("tau", "Must be positive"));
    }
    if !(params.risk_aversion > 0.0) || !params.risk_aversion.is_finite() {
        return Err(EngineError::config("risk_aversion", "Must be positive"));
    }
    for (i, view) in params.views.iter().enumerate() {
        let c = view.confidence();
        if !(c > 0.0 && c <= 1.0) {
            return Err(EngineError::config(
                format!("views[{}].confidence", i),
                "Must be in (0, 1]",
            ));
        }
        if !view.expected_return().is_finite() {
            return Err(EngineError::config(
                format!("views[{}].expected_return", i),
                "Must be finite",
            ));
        }
    }
    Ok(())
}

fn pick_matrix_and_q(views: &[View], symbols: &[String]) -> EngineResult<(DMatrix<f64>, DVector<f64>)> {
    let n = symbols.len();
    let k = views.len();
    let mut p = DMatrix::<f64>::zeros(k, n);
    let mut q = DVector::<f64>::zeros(k);

    for (row, view) in views.iter().enumerate() {
        let picks = view.picks();
        if picks.is_empty() {
            return Err(EngineError::config(format!("views[{}]", row), "View picks no assets"));
        }
        for (symbol, coeff) in picks {
            let col = symbols.iter().position(|s| s == symbol).ok_or_else(|| {
                EngineError::config(
                    format!("views[{}]", row),
                    format!("'{}' is not in the universe", symbol),
                )
            })?;
            p[(row, col)] += coeff;
        }
        q[row] = view.expected_return();
    }
    Ok((p, q))
}

/// Omega_ii = (1/c_i - 1) (P tau Sigma P')_ii, floored.
fn build_omega(view_cov: &DMatrix<f64>, views: &[View]) -> DMatrix<f64> {
    let k = views.len();
    let mut omega = DMatrix::<f64>::zeros(k, k);
    for (i, view) in views.iter().enumerate() {
        let scale = 1.0 / view.confidence() - 1.0;
        omega[(i, i)] = (scale * view_cov[(i, i)]).max(OMEGA_FLOOR);
    }
    omega
}
