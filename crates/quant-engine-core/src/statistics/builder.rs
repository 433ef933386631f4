use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

use super::covariance::CovarianceMatrix;
use crate::error::EngineError;
use crate::math::mean;
use crate::types::{with_metadata, AssetSeries, ComputationOutput};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Options for turning raw return series into annualised statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsOptions {
    /// Return observations per year (252 daily, 52 weekly, 12 monthly).
    pub periods_per_year: f64,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        Self {
            periods_per_year: 252.0,
        }
    }
}

/// Annualised market statistics for one request's universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatistics {
    pub symbols: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub volatilities: Vec<f64>,
    pub covariance: CovarianceMatrix,
    pub sectors: Vec<Option<String>>,
    pub esg_scores: Vec<Option<f64>>,
    pub market_caps: Vec<Option<f64>>,
    /// Aligned per-period returns, one row per period, one column per asset.
    pub scenario_returns: Vec<Vec<f64>>,
    pub periods_per_year: f64,
    /// Human-readable notes on any conditioning that was applied.
    pub warnings: Vec<String>,
}

impl MarketStatistics {
    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn observations(&self) -> usize {
        self.scenario_returns.len()
    }

    /// The (expected_returns, volatilities, covariance) triple of the call contract.
    pub fn into_parts(self) -> (Vec<f64>, Vec<f64>, CovarianceMatrix) {
        (self.expected_returns, self.volatilities, self.covariance)
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }
}

/// CLI/serde input for statistics building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsInput {
    pub assets: Vec<AssetSeries>,
    #[serde(default)]
    pub options: StatisticsOptions,
}

/// Serializable summary of a statistics build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsOutput {
    pub symbols: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub volatilities: Vec<f64>,
    pub covariance: CovarianceMatrix,
    pub correlation: Vec<Vec<f64>>,
    pub observations: usize,
    pub min_eigenvalue: f64,
    pub condition_number: f64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Convert raw per-asset return series into expected returns, volatilities
/// and a conditioned covariance matrix.
///
/// The sample window is the trailing history common to every asset.
/// Caller-supplied volatilities replace the sample ones while keeping the
/// sample correlation structure.
pub fn build_statistics(
    series: &[AssetSeries],
    options: &StatisticsOptions,
) -> EngineResult<MarketStatistics> {
    validate_series(series, options)?;

    let n = series.len();
    let ppy = options.periods_per_year;
    let window = series.iter().map(|s| s.returns.len()).min().unwrap_or(0);

    // Trailing aligned window, one column per asset.
    let columns: Vec<&[f64]> = series
        .iter()
        .map(|s| &s.returns[s.returns.len() - window..])
        .collect();
    let means: Vec<f64> = columns.iter().map(|c| mean(c)).collect();

    let mut sample = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let cov = columns[i]
                .iter()
                .zip(columns[j].iter())
                .map(|(a, b)| (a - means[i]) * (b - means[j]))
                .sum::<f64>()
                / (window - 1) as f64
                * ppy;
            sample[i][j] = cov;
            sample[j][i] = cov;
        }
    }

    let symbols: Vec<String> = series.iter().map(|s| s.symbol.clone()).collect();
    let raw = CovarianceMatrix::new(symbols.clone(), sample)?;

    let sample_vols = raw.volatilities();
    let volatilities: Vec<f64> = series
        .iter()
        .zip(sample_vols.iter())
        .map(|(s, v)| s.volatility.unwrap_or(*v))
        .collect();
    let overridden = series.iter().any(|s| s.volatility.is_some());
    let unconditioned = if overridden {
        raw.with_volatilities(&volatilities)?
    } else {
        raw
    };

    let expected_returns: Vec<f64> = series
        .iter()
        .zip(means.iter())
        .map(|(s, m)| s.expected_return.unwrap_or(m * ppy))
        .collect();

    let covariance = unconditioned.conditioned()?;
    // Loading and shrinkage move the diagonal; report the volatilities actually simulated.
    let volatilities = if covariance.conditioning().is_empty() {
        volatilities
    } else {
        covariance.volatilities()
    };
    let mut warnings = Vec::new();
    if !covariance.conditioning().is_empty() {
        warnings.push(format!(
            "Covariance matrix was not positive-definite; applied {:?}",
            covariance.conditioning()
        ));
    }

    let scenario_returns: Vec<Vec<f64>> = (0..window)
        .map(|t| columns.iter().map(|c| c[t]).collect())
        .collect();

    debug!(
        n_assets = n,
        window,
        conditioned = !covariance.conditioning().is_empty(),
        "built market statistics"
    );

    Ok(MarketStatistics {
        symbols,
        expected_returns,
        volatilities,
        covariance,
        sectors: series.iter().map(|s| s.sector.clone()).collect(),
        esg_scores: series.iter().map(|s| s.esg_score).collect(),
        market_caps: series.iter().map(|s| s.market_cap).collect(),
        scenario_returns,
        periods_per_year: ppy,
        warnings,
    })
}

/// Envelope-wrapping entry point used by the CLI.
pub fn run_build_statistics(
    input: &StatisticsInput,
) -> EngineResult<ComputationOutput<StatisticsOutput>> {
    let start = Instant::now();
    let stats = build_statistics(&input.assets, &input.options)?;

    let output = StatisticsOutput {
        symbols: stats.symbols.clone(),
        expected_returns: stats.expected_returns.clone(),
        volatilities: stats.volatilities.clone(),
        correlation: stats.covariance.correlation(),
        min_eigenvalue: stats.covariance.min_eigenvalue(),
        condition_number: stats.covariance.condition_number(),
        observations: stats.observations(),
        covariance: stats.covariance.clone(),
    };

    let elapsed = start.elapsed().as_micros() as u64;
    info!(n_assets = output.symbols.len(), elapsed_us = elapsed, "statistics built");
    Ok(with_metadata(
        "Sample covariance with diagonal-loading conditioning",
        &serde_json::json!({
            "n_assets": output.symbols.len(),
            "periods_per_year": input.options.periods_per_year,
            "observations": output.observations,
        }),
        stats.warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_series(series: &[AssetSeries], options: &StatisticsOptions) -> EngineResult<()> {
    if series.is_empty() {
        return Err(EngineError::data("asset_series", "At least one asset required"));
    }
    if !(options.periods_per_year > 0.0) || !options.periods_per_year.is_finite() {
        return Err(EngineError::config("periods_per_year", "Must be positive"));
    }

    let mut seen = HashSet::new();
    for (i, s) in series.iter().enumerate() {
        let field = format!("asset_series[{}]", i);
        if s.symbol.trim().is_empty() {
            return Err(EngineError::data(field, "Symbol must not be empty"));
        }
        if !seen.insert(s.symbol.as_str()) {
            return Err(EngineError::data(
                field,
                format!("Duplicate symbol '{}'", s.symbol),
            ));
        }
        if s.returns.len() < 2 {
            return Err(EngineError::data(
                format!("{}.returns", field),
                format!(
                    "'{}' has {} return periods; at least 2 required",
                    s.symbol,
                    s.returns.len()
                ),
            ));
        }
        if s.returns.iter().any(|r| !r.is_finite()) {
            return Err(EngineError::data(
                format!("{}.returns", field),
                format!("'{}' contains non-finite returns", s.symbol),
            ));
        }
        if let Some(vol) = s.volatility {
            if !vol.is_finite() || vol < 0.0 {
                return Err(EngineError::data(
                    format!("{}.volatility", field),
                    format!("'{}' volatility must be non-negative, got {}", s.symbol, vol),
                ));
            }
        }
        if let Some(er) = s.expected_return {
            if !er.is_finite() {
                return Err(EngineError::data(
                    format!("{}.expected_return", field),
                    "Must be finite",
                ));
            }
        }
        if let Some(esg) = s.esg_score {
            if !(0.0..=100.0).contains(&esg) {
                return Err(EngineError::data(
                    format!("{}.esg_score", field),
                    format!("Must lie in [0, 100], got {}", esg),
                ));
            }
        }
        if let Some(cap) = s.market_cap {
            if !cap.is_finite() || cap < 0.0 {
                return Err(EngineError::data(
                    format!("{}.market_cap", field),
                    "Must be non-negative",
                ));
            }
        }
    }
    Ok(())
}
