use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::EngineResult;

/// Upper limit on `n_paths * (n_steps + 1)` for one ensemble.
pub const MAX_ENSEMBLE_VALUES: usize = 50_000_000;

/// Which drift the asset log-prices follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftMeasure {
    /// Each asset drifts at its expected return.
    #[default]
    Physical,
    /// Every asset drifts at the risk-free rate (pricing measure).
    RiskNeutral,
}

/// Compound-Poisson jump overlay. Log jump sizes are `Normal(mean, std)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JumpConfig {
    /// Expected jumps per year.
    pub intensity: f64,
    pub mean: f64,
    pub std: f64,
}

impl JumpConfig {
    /// Drift correction `lambda * (E[e^J] - 1)` that keeps expected growth unchanged.
    pub fn compensator(&self) -> f64 {
        self.intensity * ((self.mean + 0.5 * self.std * self.std).exp() - 1.0)
    }

    pub fn is_active(&self) -> bool {
        self.intensity > 0.0
    }
}

/// Per-request simulation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub n_paths: usize,
    pub horizon_years: f64,
    pub steps_per_year: usize,
    pub initial_value: f64,
    pub risk_free_rate: f64,
    /// Replaces every asset's volatility while keeping the correlation structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jump: Option<JumpConfig>,
    /// Monthly contribution per asset, in the same units as `initial_value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributions: Option<Vec<f64>>,
    /// Steps between rebalances to target weights. `None` holds the initial allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalance_frequency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Generate paths in antithetic pairs.
    pub antithetic: bool,
    pub drift_measure: DriftMeasure,
    /// Overrides the engine's batch size for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_paths: 10_000,
            horizon_years: 1.0,
            steps_per_year: 12,
            initial_value: 100.0,
            risk_free_rate: 0.0,
            volatility: None,
            jump: None,
            contributions: None,
            rebalance_frequency: None,
            seed: None,
            antithetic: false,
            drift_measure: DriftMeasure::Physical,
            batch_size: None,
            timeout_ms: None,
        }
    }
}

impl SimulationConfig {
    pub fn n_steps(&self) -> usize {
        ((self.horizon_years * self.steps_per_year as f64).round() as usize).max(1)
    }

    /// Step length in years; steps always tile the horizon exactly.
    pub fn dt(&self) -> f64 {
        self.horizon_years / self.n_steps() as f64
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Total contributions over the horizon.
    pub fn total_contributions(&self) -> f64 {
        self.contributions
            .as_ref()
            .map_or(0.0, |c| c.iter().sum::<f64>() * 12.0 * self.horizon_years)
    }

    /// Reject parameters before any work starts.
    pub fn validate(&self, n_assets: usize) -> EngineResult<()> {
        if self.n_paths == 0 {
            return Err(EngineError::config("n_paths", "Must be positive"));
        }
        if !self.horizon_years.is_finite() || self.horizon_years <= 0.0 {
            return Err(EngineError::config("horizon_years", "Must be positive"));
        }
        if self.steps_per_year == 0 {
            return Err(EngineError::config("steps_per_year", "Must be at least 1"));
        }
        if !self.initial_value.is_finite() || self.initial_value <= 0.0 {
            return Err(EngineError::config("initial_value", "Must be positive"));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::config("risk_free_rate", "Must be finite"));
        }
        if let Some(vol) = self.volatility {
            if !vol.is_finite() || vol < 0.0 {
                return Err(EngineError::config("volatility", "Must be non-negative"));
            }
        }
        if let Some(jump) = &self.jump {
            if !jump.intensity.is_finite() || jump.intensity < 0.0 {
                return Err(EngineError::config("jump.intensity", "Must be non-negative"));
            }
            if !jump.mean.is_finite() {
                return Err(EngineError::config("jump.mean", "Must be finite"));
            }
            if !jump.std.is_finite() || jump.std < 0.0 {
                return Err(EngineError::config("jump.std", "Must be non-negative"));
            }
        }
        if let Some(contributions) = &self.contributions {
            if contributions.len() != n_assets {
                return Err(EngineError::config(
                    "contributions",
                    format!(
                        "Expected one contribution per asset ({}), got {}",
                        n_assets,
                        contributions.len()
                    ),
                ));
            }
            if contributions.iter().any(|c| !c.is_finite() || *c < 0.0) {
                return Err(EngineError::config(
                    "contributions",
                    "Contributions must be finite and non-negative",
                ));
            }
        }
        if self.rebalance_frequency == Some(0) {
            return Err(EngineError::config(
                "rebalance_frequency",
                "Must be at least 1 step",
            ));
        }
        if self.batch_size == Some(0) {
            return Err(EngineError::config("batch_size", "Must be at least 1"));
        }
        let values = self.n_paths.saturating_mul(self.n_steps() + 1);
        if values > MAX_ENSEMBLE_VALUES {
            return Err(EngineError::config(
                "n_paths",
                format!(
                    "{} paths x {} steps exceeds the ensemble limit of {} values",
                    self.n_paths,
                    self.n_steps(),
                    MAX_ENSEMBLE_VALUES
                ),
            ));
        }
        Ok(())
    }
}
