use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::time::Instant;
use tracing::info;

use super::config::{DriftMeasure, SimulationConfig};
use super::paths::PathSimulator;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::math::{mean, sample_std};
use crate::statistics::CovarianceMatrix;
use crate::types::{with_metadata, ComputationOutput, PathEnsemble};
use crate::EngineResult;

const Z_95: f64 = 1.959_963_984_540_054;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

/// Monte Carlo price of a European option with its sampling error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionEstimate {
    pub price: f64,
    pub std_error: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub paths: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionPricingInput {
    /// Uses `initial_value` as spot, `risk_free_rate`, `volatility` and `horizon_years` as expiry.
    pub simulation: SimulationConfig,
    pub strike: f64,
    pub option_type: OptionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionPricingOutput {
    pub monte_carlo: OptionEstimate,
    pub black_scholes: f64,
    /// |MC - BS| / BS.
    pub relative_error: f64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Discounted mean payoff over an ensemble's terminal values. Expiry is the
/// ensemble horizon.
pub fn price_european(
    ensemble: &PathEnsemble,
    strike: f64,
    option_type: OptionType,
    risk_free_rate: f64,
) -> EngineResult<OptionEstimate> {
    if ensemble.n_paths == 0 {
        return Err(EngineError::data("ensemble", "No paths to price over"));
    }
    if !strike.is_finite() || strike < 0.0 {
        return Err(EngineError::config("strike", "Must be non-negative"));
    }
    let discount = (-risk_free_rate * ensemble.horizon_years()).exp();
    let payoffs: Vec<f64> = ensemble
        .terminal_values()
        .into_iter()
        .map(|s| discount * payoff(option_type, s, strike))
        .collect();
    let price = mean(&payoffs);
    let std_error = sample_std(&payoffs) / (payoffs.len() as f64).sqrt();
    Ok(OptionEstimate {
        price,
        std_error,
        ci_lower: price - Z_95 * std_error,
        ci_upper: price + Z_95 * std_error,
        paths: payoffs.len(),
    })
}

/// Closed-form Black-Scholes price (no dividends).
pub fn black_scholes_price(
    spot: f64,
    strike: f64,
    rate: f64,
    volatility: f64,
    expiry: f64,
    option_type: OptionType,
) -> EngineResult<f64> {
    if !(spot > 0.0) || !(strike > 0.0) {
        return Err(EngineError::config("spot/strike", "Must be positive"));
    }
    if volatility <= 0.0 || expiry <= 0.0 {
        let forward_intrinsic = payoff(option_type, spot, strike * (-rate * expiry.max(0.0)).exp());
        return Ok(forward_intrinsic);
    }
    let n = Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::numerical("normal distribution", e.to_string()))?;
    let sqrt_t = expiry.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * volatility * volatility) * expiry)
        / (volatility * sqrt_t);
    let d2 = d1 - volatility * sqrt_t;
    let df = (-rate * expiry).exp();
    Ok(match option_type {
        OptionType::Call => spot * n.cdf(d1) - strike * df * n.cdf(d2),
        OptionType::Put => strike * df * n.cdf(-d2) - spot * n.cdf(-d1),
    })
}

pub fn run_price_option(
    input: &OptionPricingInput,
    engine: &EngineConfig,
) -> EngineResult<ComputationOutput<OptionPricingOutput>> {
    let start = Instant::now();
    engine.validate()?;
    let cfg = &input.simulation;
    let sigma = match cfg.volatility {
        Some(v) if v > 0.0 => v,
        _ => {
            return Err(EngineError::config(
                "simulation.volatility",
                "Option pricing needs a positive volatility",
            ))
        }
    };

    let covariance = CovarianceMatrix::new(vec!["UNDERLYING".to_string()], vec![vec![sigma * sigma]])?;
    let risk_neutral = SimulationConfig {
        drift_measure: DriftMeasure::RiskNeutral,
        contributions: None,
        rebalance_frequency: None,
        ..cfg.clone()
    };
    let simulator = PathSimulator::from_config(engine);
    let run = simulator.simulate_detailed(
        &risk_neutral,
        &[cfg.risk_free_rate],
        &covariance,
        &[1.0],
    )?;
    let estimate = price_european(
        &run.ensemble,
        input.strike,
        input.option_type,
        cfg.risk_free_rate,
    )?;
    let reference = black_scholes_price(
        cfg.initial_value,
        input.strike,
        cfg.risk_free_rate,
        sigma,
        run.ensemble.horizon_years(),
        input.option_type,
    )?;
    let relative_error = if reference.abs() > f64::EPSILON {
        (estimate.price - reference).abs() / reference
    } else {
        0.0
    };

    let elapsed = start.elapsed().as_micros() as u64;
    info!(
        price = estimate.price,
        black_scholes = reference,
        paths = estimate.paths,
        elapsed_us = elapsed,
        "option priced"
    );
    Ok(with_metadata(
        "Risk-neutral GBM Monte Carlo with Black-Scholes reference",
        &serde_json::json!({
            "spot": cfg.initial_value,
            "strike": input.strike,
            "rate": cfg.risk_free_rate,
            "volatility": sigma,
            "expiry_years": run.ensemble.horizon_years(),
            "n_paths": cfg.n_paths,
        }),
        run.warnings,
        elapsed,
        OptionPricingOutput {
            monte_carlo: estimate,
            black_scholes: reference,
            relative_error,
        },
    ))
}

#[inline]
fn payoff(option_type: OptionType, spot: f64, strike: f64) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}
