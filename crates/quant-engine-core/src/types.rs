use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::EngineResult;

/// Monetary amounts. Decimal so that tax and notional figures survive JSON round trips.
pub type Money = Decimal;

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = f64;

/// Year fractions or counts.
pub type Years = f64;

/// One traded instrument in a request.
///
/// Immutable once constructed: the builder reads it, never rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSeries {
    /// Unique key within a request.
    pub symbol: String,
    /// Ordered periodic returns (oldest first).
    pub returns: Vec<f64>,
    /// Annual expected return. Estimated from `returns` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return: Option<Rate>,
    /// Annual volatility. Estimated from `returns` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<Rate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    /// ESG score on a 0-100 scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esg_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
}

impl AssetSeries {
    pub fn new(symbol: impl Into<String>, returns: Vec<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            returns,
            expected_return: None,
            volatility: None,
            sector: None,
            esg_score: None,
            market_cap: None,
        }
    }

    pub fn with_expected_return(mut self, expected_return: Rate) -> Self {
        self.expected_return = Some(expected_return);
        self
    }

    pub fn with_volatility(mut self, volatility: Rate) -> Self {
        self.volatility = Some(volatility);
        self
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    pub fn with_esg_score(mut self, score: f64) -> Self {
        self.esg_score = Some(score);
        self
    }

    pub fn with_market_cap(mut self, market_cap: f64) -> Self {
        self.market_cap = Some(market_cap);
        self
    }
}

/// Symbol -> weight. Ordered so serialized output is stable.
pub type PortfolioWeights = BTreeMap<String, f64>;

/// Build a `PortfolioWeights` map from parallel symbol/weight slices.
pub fn weights_by_symbol(symbols: &[String], weights: &[f64]) -> PortfolioWeights {
    symbols
        .iter()
        .cloned()
        .zip(weights.iter().copied())
        .collect()
}

/// Order `weights` by `symbols`. An empty map means equal weights; a symbol
/// outside the universe is a data error. Absent symbols get 0.
pub fn align_weights(symbols: &[String], weights: &PortfolioWeights) -> EngineResult<Vec<f64>> {
    if weights.is_empty() {
        return Ok(crate::math::equal_weights(symbols.len(), 1.0));
    }
    if let Some(unknown) = weights.keys().find(|k| !symbols.contains(k)) {
        return Err(EngineError::data(
            "weights",
            format!("'{}' is not in the asset universe", unknown),
        ));
    }
    let aligned: Vec<f64> = symbols
        .iter()
        .map(|s| weights.get(s).copied().unwrap_or(0.0))
        .collect();
    if aligned.iter().any(|w| !w.is_finite()) {
        return Err(EngineError::data("weights", "Weights must be finite"));
    }
    Ok(aligned)
}

/// A [paths x (steps + 1)] matrix of portfolio values, stored row-major.
///
/// Column 0 holds the initial value for every path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEnsemble {
    pub n_paths: usize,
    pub n_steps: usize,
    /// Step length in years.
    pub dt: Years,
    pub initial_value: f64,
    /// Seed the ensemble was generated from.
    pub seed: u64,
    /// Number of independent batches the paths were generated in.
    pub batches: usize,
    pub values: Vec<f64>,
}

impl PathEnsemble {
    /// Values per path, including the starting column.
    pub fn row_len(&self) -> usize {
        self.n_steps + 1
    }

    pub fn horizon_years(&self) -> Years {
        self.dt * self.n_steps as f64
    }

    pub fn path(&self, p: usize) -> &[f64] {
        let len = self.row_len();
        &self.values[p * len..(p + 1) * len]
    }

    pub fn paths(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.row_len())
    }

    pub fn value(&self, p: usize, t: usize) -> f64 {
        self.values[p * self.row_len() + t]
    }

    pub fn terminal_values(&self) -> Vec<f64> {
        self.paths().map(|p| p[p.len() - 1]).collect()
    }

    /// Simple horizon returns `V_T / V_0 - 1`.
    pub fn terminal_returns(&self) -> Vec<f64> {
        self.paths().map(|p| p[p.len() - 1] / p[0] - 1.0).collect()
    }

    /// Cross-sectional mean value at each time step.
    pub fn mean_path(&self) -> Vec<f64> {
        let mut mean = vec![0.0; self.row_len()];
        if self.n_paths == 0 {
            return mean;
        }
        for path in self.paths() {
            for (m, v) in mean.iter_mut().zip(path) {
                *m += v;
            }
        }
        let n = self.n_paths as f64;
        mean.iter_mut().for_each(|m| *m /= n);
        mean
    }
}

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: "ieee754_f64".to_string(),
        },
    }
}
