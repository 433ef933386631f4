use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::time::Instant;
use tracing::info;

use crate::error::EngineError;
use crate::math::{mean, percentile_sorted, sorted_copy, vec_dot};
use crate::statistics::{build_statistics, StatisticsOptions};
use crate::types::{with_metadata, AssetSeries, ComputationOutput, PathEnsemble, PortfolioWeights};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the metrics are computed over.
#[derive(Debug, Clone, Copy)]
pub enum RiskSource<'a> {
    /// Simulated portfolio paths. Return statistics use horizon returns
    /// `V_T / V_0 - 1`; drawdowns use every path.
    Ensemble(&'a PathEnsemble),
    /// Periodic portfolio returns, oldest first. Mean, volatility and the
    /// ratios are annualised; VaR and CVaR stay per period.
    Sample {
        returns: &'a [f64],
        periods_per_year: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub confidence: f64,
    pub observations: usize,
    pub mean_return: f64,
    /// Standard deviation of returns (annualised for samples).
    pub volatility: f64,
    /// Historical VaR as a positive loss fraction.
    pub var: f64,
    /// Mean loss at or beyond the VaR threshold. Never below `var`.
    pub cvar: f64,
    /// Gaussian VaR from the first two moments.
    pub parametric_var: f64,
    /// VaR with the Cornish-Fisher skew/kurtosis adjustment.
    pub cornish_fisher_var: f64,
    /// Largest peak-to-trough decline per path, averaged across paths.
    pub max_drawdown: f64,
    /// Largest peak-to-trough decline on any single path.
    pub worst_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub skewness: f64,
    pub excess_kurtosis: f64,
    pub probability_of_loss: f64,
}

/// CLI/serde input: either a return sample, or assets plus weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetricsInput {
    #[serde(default)]
    pub returns: Vec<f64>,
    #[serde(default)]
    pub assets: Vec<AssetSeries>,
    #[serde(default)]
    pub weights: PortfolioWeights,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub risk_free_rate: f64,
}

fn default_periods_per_year() -> f64 {
    252.0
}

fn default_confidence() -> f64 {
    0.95
}

/// Distribution summary of one set of returns, all in the sample's own units.
#[derive(Debug, Clone, Copy)]
struct TailSummary {
    mean: f64,
    std_dev: f64,
    var: f64,
    cvar: f64,
    parametric_var: f64,
    cornish_fisher_var: f64,
    skewness: f64,
    excess_kurtosis: f64,
    downside_dev: f64,
    probability_of_loss: f64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Reduce an ensemble or a return sample to scalar risk measures.
pub fn compute_risk_metrics(
    source: RiskSource<'_>,
    confidence: f64,
    risk_free_rate: f64,
) -> EngineResult<RiskMetrics> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(EngineError::config(
            "confidence",
            "Must lie strictly between 0 and 1",
        ));
    }
    if !risk_free_rate.is_finite() {
        return Err(EngineError::config("risk_free_rate", "Must be finite"));
    }

    match source {
        RiskSource::Ensemble(ensemble) => ensemble_metrics(ensemble, confidence, risk_free_rate),
        RiskSource::Sample {
            returns,
            periods_per_year,
        } => sample_metrics(returns, periods_per_year, confidence, risk_free_rate),
    }
}

fn ensemble_metrics(
    ensemble: &PathEnsemble,
    confidence: f64,
    risk_free_rate: f64,
) -> EngineResult<RiskMetrics> {
    if ensemble.n_paths == 0 {
        return Err(EngineError::data("ensemble", "No paths to measure"));
    }
    if ensemble.values.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::data("ensemble", "Contains non-finite values"));
    }
    if ensemble.values.iter().step_by(ensemble.row_len()).any(|v| *v == 0.0) {
        return Err(EngineError::data("ensemble", "Paths must start from a non-zero value"));
    }

    let returns = ensemble.terminal_returns();
    let horizon_rf = (risk_free_rate * ensemble.horizon_years()).exp() - 1.0;
    let tail = summarize(&returns, confidence, horizon_rf)?;

    let drawdowns: Vec<f64> = ensemble.paths().map(max_drawdown).collect();
    let worst = drawdowns.iter().copied().fold(0.0, f64::max);

    Ok(RiskMetrics {
        confidence,
        observations: returns.len(),
        mean_return: tail.mean,
        volatility: tail.std_dev,
        var: tail.var,
        cvar: tail.cvar,
        parametric_var: tail.parametric_var,
        cornish_fisher_var: tail.cornish_fisher_var,
        max_drawdown: mean(&drawdowns),
        worst_drawdown: worst,
        sharpe_ratio: ratio(tail.mean - horizon_rf, tail.std_dev),
        sortino_ratio: ratio(tail.mean - horizon_rf, tail.downside_dev),
        skewness: tail.skewness,
        excess_kurtosis: tail.excess_kurtosis,
        probability_of_loss: tail.probability_of_loss,
    })
}

fn sample_metrics(
    returns: &[f64],
    periods_per_year: f64,
    confidence: f64,
    risk_free_rate: f64,
) -> EngineResult<RiskMetrics> {
    if returns.len() < 2 {
        return Err(EngineError::data(
            "returns",
            "At least 2 return observations required",
        ));
    }
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(EngineError::data("returns", "Contains non-finite values"));
    }
    if !(periods_per_year > 0.0) || !periods_per_year.is_finite() {
        return Err(EngineError::config("periods_per_year", "Must be positive"));
    }

    let period_rf = risk_free_rate / periods_per_year;
    let tail = summarize(returns, confidence, period_rf)?;

    let mut wealth = Vec::with_capacity(returns.len() + 1);
    wealth.push(1.0);
    for r in returns {
        let last = wealth[wealth.len() - 1];
        wealth.push(last * (1.0 + r));
    }
    let drawdown = max_drawdown(&wealth);

    let ann_mean = tail.mean * periods_per_year;
    let root = periods_per_year.sqrt();

    Ok(RiskMetrics {
        confidence,
        observations: returns.len(),
        mean_return: ann_mean,
        volatility: tail.std_dev * root,
        var: tail.var,
        cvar: tail.cvar,
        parametric_var: tail.parametric_var,
        cornish_fisher_var: tail.cornish_fisher_var,
        max_drawdown: drawdown,
        worst_drawdown: drawdown,
        sharpe_ratio: ratio(ann_mean - risk_free_rate, tail.std_dev * root),
        sortino_ratio: ratio(ann_mean - risk_free_rate, tail.downside_dev * root),
        skewness: tail.skewness,
        excess_kurtosis: tail.excess_kurtosis,
        probability_of_loss: tail.probability_of_loss,
    })
}

/// Per-period portfolio returns of `weights` over aligned asset scenarios.
pub fn portfolio_sample_returns(scenarios: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    scenarios.iter().map(|row| vec_dot(row, weights)).collect()
}

/// Historical VaR and CVaR, both as positive loss fractions.
///
/// VaR is the `(1 - confidence)` quantile of returns, negated; CVaR is the
/// mean loss over returns at or below that quantile.
pub fn historical_var_cvar(returns: &[f64], confidence: f64) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let sorted = sorted_copy(returns);
    let q = percentile_sorted(&sorted, (1.0 - confidence) * 100.0);
    let tail: Vec<f64> = sorted.iter().copied().take_while(|r| *r <= q).collect();
    let var = -q;
    let cvar = if tail.is_empty() { var } else { -mean(&tail) };
    (var, cvar.max(var))
}

/// Largest fractional decline from a running peak.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &v in values {
        if v > peak {
            peak = v;
        }
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

/// Cornish-Fisher adjusted quantile.
/// z_CF = z + (z^2 - 1)*S/6 + (z^3 - 3z)*K/24 - (2z^3 - 5z)*S^2/36
pub fn cornish_fisher_z(z: f64, skew: f64, excess_kurtosis: f64) -> f64 {
    let z2 = z * z;
    let z3 = z2 * z;
    z + (z2 - 1.0) * skew / 6.0 + (z3 - 3.0 * z) * excess_kurtosis / 24.0
        - (2.0 * z3 - 5.0 * z) * skew * skew / 36.0
}

/// Envelope entry point used by the CLI.
pub fn run_risk_metrics(
    input: &RiskMetricsInput,
) -> EngineResult<ComputationOutput<RiskMetrics>> {
    let start = Instant::now();
    let mut warnings = Vec::new();

    let returns = if !input.returns.is_empty() {
        if !input.assets.is_empty() {
            warnings.push("Both returns and assets given; using returns".to_string());
        }
        input.returns.clone()
    } else if !input.assets.is_empty() {
        let stats = build_statistics(
            &input.assets,
            &StatisticsOptions {
                periods_per_year: input.periods_per_year,
            },
        )?;
        for symbol in input.weights.keys() {
            if stats.index_of(symbol).is_none() {
                return Err(EngineError::data(
                    "weights",
                    format!("'{}' is not one of the supplied assets", symbol),
                ));
            }
        }
        let w: Vec<f64> = stats
            .symbols
            .iter()
            .map(|s| input.weights.get(s).copied().unwrap_or(0.0))
            .collect();
        warnings.extend(stats.warnings.iter().cloned());
        portfolio_sample_returns(&stats.scenario_returns, &w)
    } else {
        return Err(EngineError::data(
            "returns",
            "Provide either a return sample or assets with weights",
        ));
    };

    let metrics = compute_risk_metrics(
        RiskSource::Sample {
            returns: &returns,
            periods_per_year: input.periods_per_year,
        },
        input.confidence,
        input.risk_free_rate,
    )?;

    let elapsed = start.elapsed().as_micros() as u64;
    info!(
        observations = metrics.observations,
        elapsed_us = elapsed,
        "risk metrics computed"
    );
    Ok(with_metadata(
        "Historical VaR/CVaR with Gaussian and Cornish-Fisher comparisons",
        &serde_json::json!({
            "confidence": input.confidence,
            "risk_free_rate": input.risk_free_rate,
            "periods_per_year": input.periods_per_year,
        }),
        warnings,
        elapsed,
        metrics,
    ))
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

fn summarize(returns: &[f64], confidence: f64, target: f64) -> EngineResult<TailSummary> {
    let n = returns.len() as f64;
    let m = mean(returns);

    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    let mut downside = 0.0;
    let mut losses = 0usize;
    for &r in returns {
        let d = r - m;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
        let below = (r - target).min(0.0);
        downside += below * below;
        if r < 0.0 {
            losses += 1;
        }
    }
    m2 /= n;
    m3 /= n;
    m4 /= n;

    let population_std = m2.sqrt();
    let (skewness, excess_kurtosis) = if population_std > f64::EPSILON {
        (m3 / population_std.powi(3), m4 / (m2 * m2) - 3.0)
    } else {
        (0.0, 0.0)
    };
    let std_dev = if returns.len() > 1 {
        (m2 * n / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    let (var, cvar) = historical_var_cvar(returns, confidence);

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::numerical("parametric VaR", e.to_string()))?;
    let z = normal.inverse_cdf(1.0 - confidence);
    let parametric_var = -(m + z * std_dev);
    let cornish_fisher_var = -(m + cornish_fisher_z(z, skewness, excess_kurtosis) * std_dev);

    Ok(TailSummary {
        mean: m,
        std_dev,
        var,
        cvar,
        parametric_var,
        cornish_fisher_var,
        skewness,
        excess_kurtosis,
        downside_dev: (downside / n).sqrt(),
        probability_of_loss: losses as f64 / n,
    })
}

fn ratio(excess: f64, risk: f64) -> f64 {
    if risk <= f64::EPSILON {
        0.0
    } else {
        excess / risk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensemble(paths: &[Vec<f64>]) -> PathEnsemble {
        let n_steps = paths[0].len() - 1;
        PathEnsemble {
            n_paths: paths.len(),
            n_steps,
            dt: 1.0 / n_steps as f64,
            initial_value: paths[0][0],
            seed: 0,
            batches: 1,
            values: paths.iter().flatten().copied().collect(),
        }
    }

    #[test]
    fn test_cvar_dominates_var() {
        let returns: Vec<f64> = (0..200).map(|i| ((i * 37) % 101) as f64 / 1000.0 - 0.05).collect();
        for c in [0.9, 0.95, 0.99] {
            let (var, cvar) = historical_var_cvar(&returns, c);
            assert!(cvar >= var, "confidence {}: cvar {} < var {}", c, cvar, var);
        }
    }

    #[test]
    fn test_var_of_uniform_grid() {
        // Returns -0.10, -0.09, ..., 0.10
        let returns: Vec<f64> = (0..=20).map(|i| -0.10 + 0.01 * i as f64).collect();
        let (var, cvar) = historical_var_cvar(&returns, 0.95);
        assert!((var - 0.09).abs() < 1e-12);
        // Tail is {-0.10, -0.09}
        assert!((cvar - 0.095).abs() < 1e-12);
    }

    #[test]
    fn test_drawdown_simple_path() {
        let dd = max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((dd - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_ensemble_drawdown_is_averaged() {
        let e = ensemble(&[
            vec![100.0, 80.0, 100.0],
            vec![100.0, 110.0, 120.0],
        ]);
        let m = compute_risk_metrics(RiskSource::Ensemble(&e), 0.95, 0.0).unwrap();
        assert!((m.max_drawdown - 0.10).abs() < 1e-12);
        assert!((m.worst_drawdown - 0.20).abs() < 1e-12);
        assert!(m.cvar >= m.var);
    }

    #[test]
    fn test_sample_annualisation() {
        let returns = vec![0.01, -0.005, 0.007, 0.002, -0.003, 0.004];
        let m = compute_risk_metrics(
            RiskSource::Sample {
                returns: &returns,
                periods_per_year: 12.0,
            },
            0.95,
            0.02,
        )
        .unwrap();
        assert!((m.mean_return - mean(&returns) * 12.0).abs() < 1e-12);
        assert!(
            (m.volatility - crate::math::sample_std(&returns) * 12.0_f64.sqrt()).abs() < 1e-12
        );
        assert!(m.sharpe_ratio.is_finite());
    }

    #[test]
    fn test_symmetric_sample_cornish_fisher_close_to_parametric() {
        let returns: Vec<f64> = (0..=40).map(|i| -0.02 + 0.001 * i as f64).collect();
        let m = compute_risk_metrics(
            RiskSource::Sample {
                returns: &returns,
                periods_per_year: 252.0,
            },
            0.99,
            0.0,
        )
        .unwrap();
        assert!(m.skewness.abs() < 1e-9);
        // Uniform is platykurtic, so Cornish-Fisher pulls the 99% VaR in.
        assert!(m.cornish_fisher_var < m.parametric_var);
    }

    #[test]
    fn test_invalid_confidence_rejected() {
        let returns = vec![0.01, 0.02];
        let err = compute_risk_metrics(
            RiskSource::Sample {
                returns: &returns,
                periods_per_year: 252.0,
            },
            1.0,
            0.0,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_portfolio_sample_returns() {
        let scenarios = vec![vec![0.01, 0.03], vec![-0.02, 0.00]];
        let r = portfolio_sample_returns(&scenarios, &[0.5, 0.5]);
        assert!((r[0] - 0.02).abs() < 1e-12);
        assert!((r[1] + 0.01).abs() < 1e-12);
    }
}
