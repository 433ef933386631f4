use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use super::config::{JumpConfig, SimulationConfig};
use super::paths::{resolve_seed, summarize_ensemble, PathSimulator};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::risk::{compute_risk_metrics, RiskSource};
use crate::statistics::{build_statistics, CovarianceMatrix, StatisticsOptions};
use crate::types::{align_weights, with_metadata, AssetSeries, ComputationOutput, PortfolioWeights};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A named set of shocks applied to the simulation inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Multiplier on every asset volatility.
    #[serde(default = "default_multiplier")]
    pub volatility_multiplier: f64,
    /// Moves each off-diagonal correlation toward 1: rho + s * (1 - rho).
    #[serde(default)]
    pub correlation_shift: f64,
    /// Added to every annual expected return.
    #[serde(default)]
    pub drift_shock: f64,
    /// Jump overlay replacing any configured jump process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<JumpConfig>,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Outcome of one simulation run, base or stressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressOutcome {
    pub name: String,
    pub mean_terminal: f64,
    pub var: f64,
    pub cvar: f64,
    pub max_drawdown: f64,
    pub probability_of_loss: f64,
}

/// Stressed outcome together with its change against the base case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressComparison {
    pub outcome: StressOutcome,
    pub mean_terminal_change: f64,
    pub var_change: f64,
    pub cvar_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub seed: u64,
    pub base: StressOutcome,
    pub scenarios: Vec<StressComparison>,
    /// Name of the scenario with the largest CVaR.
    pub worst_scenario: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressTestInput {
    pub assets: Vec<AssetSeries>,
    #[serde(default)]
    pub weights: PortfolioWeights,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub statistics: StatisticsOptions,
    /// Empty runs the standard scenarios.
    #[serde(default)]
    pub scenarios: Vec<StressScenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

pub fn standard_scenarios() -> Vec<StressScenario> {
    vec![
        StressScenario {
            name: "volatility_spike".into(),
            volatility_multiplier: 2.0,
            correlation_shift: 0.0,
            drift_shock: 0.0,
            jump: None,
        },
        StressScenario {
            name: "correlation_breakdown".into(),
            volatility_multiplier: 1.25,
            correlation_shift: 0.6,
            drift_shock: 0.0,
            jump: None,
        },
        StressScenario {
            name: "market_crash".into(),
            volatility_multiplier: 1.5,
            correlation_shift: 0.5,
            drift_shock: -0.20,
            jump: Some(JumpConfig {
                intensity: 1.0,
                mean: -0.15,
                std: 0.10,
            }),
        },
    ]
}

impl StressScenario {
    fn validate(&self) -> EngineResult<()> {
        let field = |f: &str| format!("scenarios.{}.{}", self.name, f);
        if !self.volatility_multiplier.is_finite() || self.volatility_multiplier < 0.0 {
            return Err(EngineError::config(field("volatility_multiplier"), "Must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.correlation_shift) {
            return Err(EngineError::config(field("correlation_shift"), "Must lie in [0, 1]"));
        }
        if !self.drift_shock.is_finite() {
            return Err(EngineError::config(field("drift_shock"), "Must be finite"));
        }
        Ok(())
    }
}

/// Covariance with scaled volatilities and correlations pulled toward 1.
pub fn stress_covariance(
    covariance: &CovarianceMatrix,
    scenario: &StressScenario,
) -> EngineResult<CovarianceMatrix> {
    let vols: Vec<f64> = covariance
        .volatilities()
        .iter()
        .map(|v| v * scenario.volatility_multiplier)
        .collect();
    let s = scenario.correlation_shift;
    let corr: Vec<Vec<f64>> = covariance
        .correlation()
        .into_iter()
        .map(|row| row.into_iter().map(|rho| rho + s * (1.0 - rho)).collect())
        .collect();
    CovarianceMatrix::from_correlation(covariance.symbols().to_vec(), &vols, &corr)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Re-run one simulation under each scenario with common random numbers.
pub fn stress_test(
    simulator: &PathSimulator,
    config: &SimulationConfig,
    expected_returns: &[f64],
    covariance: &CovarianceMatrix,
    weights: &[f64],
    scenarios: &[StressScenario],
    confidence: f64,
) -> EngineResult<StressReport> {
    for s in scenarios {
        s.validate()?;
    }
    let seed = resolve_seed(config);
    let base_config = SimulationConfig {
        seed: Some(seed),
        ..config.clone()
    };
    let base = run_outcome(
        simulator,
        "base",
        &base_config,
        expected_returns,
        covariance,
        weights,
        confidence,
    )?;

    let mut comparisons = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let cov = stress_covariance(covariance, scenario)?;
        let mu: Vec<f64> = expected_returns
            .iter()
            .map(|m| m + scenario.drift_shock)
            .collect();
        let stressed_config = SimulationConfig {
            jump: scenario.jump.or(base_config.jump),
            volatility: base_config
                .volatility
                .map(|v| v * scenario.volatility_multiplier),
            ..base_config.clone()
        };
        let outcome = run_outcome(
            simulator,
            &scenario.name,
            &stressed_config,
            &mu,
            &cov,
            weights,
            confidence,
        )?;
        comparisons.push(StressComparison {
            mean_terminal_change: outcome.mean_terminal - base.mean_terminal,
            var_change: outcome.var - base.var,
            cvar_change: outcome.cvar - base.cvar,
            outcome,
        });
    }

    let worst_scenario = comparisons
        .iter()
        .max_by(|a, b| {
            a.outcome
                .cvar
                .partial_cmp(&b.outcome.cvar)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.outcome.name.clone());

    Ok(StressReport {
        seed,
        base,
        scenarios: comparisons,
        worst_scenario,
    })
}

pub fn run_stress_test(
    input: &StressTestInput,
    engine: &EngineConfig,
) -> EngineResult<ComputationOutput<StressReport>> {
    let start = Instant::now();
    engine.validate()?;
    let stats = build_statistics(&input.assets, &input.statistics)?;
    let weights = align_weights(&stats.symbols, &input.weights)?;
    let scenarios = if input.scenarios.is_empty() {
        standard_scenarios()
    } else {
        input.scenarios.clone()
    };
    let confidence = input.confidence.unwrap_or(engine.default_confidence);
    let simulator = PathSimulator::from_config(engine);

    let report = stress_test(
        &simulator,
        &input.simulation,
        &stats.expected_returns,
        &stats.covariance,
        &weights,
        &scenarios,
        confidence,
    )?;

    let elapsed = start.elapsed().as_micros() as u64;
    info!(
        scenarios = report.scenarios.len(),
        worst = report.worst_scenario.as_deref().unwrap_or("none"),
        elapsed_us = elapsed,
        "stress test complete"
    );
    Ok(with_metadata(
        "Simulation stress test with common random numbers",
        &serde_json::json!({
            "n_assets": stats.n_assets(),
            "n_paths": input.simulation.n_paths,
            "scenarios": scenarios.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
            "confidence": confidence,
        }),
        stats.warnings,
        elapsed,
        report,
    ))
}

fn run_outcome(
    simulator: &PathSimulator,
    name: &str,
    config: &SimulationConfig,
    expected_returns: &[f64],
    covariance: &CovarianceMatrix,
    weights: &[f64],
    confidence: f64,
) -> EngineResult<StressOutcome> {
    let ensemble = simulator.simulate(config, expected_returns, covariance, weights)?;
    let metrics = compute_risk_metrics(
        RiskSource::Ensemble(&ensemble),
        confidence,
        config.risk_free_rate,
    )?;
    let summary = summarize_ensemble(&ensemble, config.total_contributions());
    Ok(StressOutcome {
        name: name.to_string(),
        mean_terminal: summary.mean_terminal,
        var: metrics.var,
        cvar: metrics.cvar,
        max_drawdown: metrics.max_drawdown,
        probability_of_loss: summary.probability_of_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u64 = 42;

    fn cov() -> CovarianceMatrix {
        CovarianceMatrix::from_correlation(
            vec!["A".into(), "B".into(), "C".into()],
            &[0.15, 0.20, 0.25],
            &[
                vec![1.0, 0.2, 0.1],
                vec![0.2, 1.0, 0.3],
                vec![0.1, 0.3, 1.0],
            ],
        )
        .unwrap()
    }

    fn config() -> SimulationConfig {
        SimulationConfig {
            n_paths: 4_000,
            seed: Some(SEED),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_correlation_shift_moves_toward_one() {
        let scenario = StressScenario {
            name: "x".into(),
            volatility_multiplier: 2.0,
            correlation_shift: 0.5,
            drift_shock: 0.0,
            jump: None,
        };
        let stressed = stress_covariance(&cov(), &scenario).unwrap();
        let corr = stressed.correlation();
        assert!((corr[0][1] - 0.6).abs() < 1e-12);
        assert!((stressed.volatilities()[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_standard_scenarios_worsen_tail() {
        let report = stress_test(
            &PathSimulator::default(),
            &config(),
            &[0.06, 0.07, 0.08],
            &cov(),
            &[1.0 / 3.0; 3],
            &standard_scenarios(),
            0.95,
        )
        .unwrap();
        assert_eq!(report.scenarios.len(), 3);
        for c in &report.scenarios {
            assert!(c.outcome.cvar >= c.outcome.var - 1e-12);
            assert!(c.cvar_change > 0.0, "{} did not worsen CVaR", c.outcome.name);
        }
        assert_eq!(report.worst_scenario.as_deref(), Some("market_crash"));
    }

    #[test]
    fn test_identity_scenario_reproduces_base() {
        let neutral = StressScenario {
            name: "neutral".into(),
            volatility_multiplier: 1.0,
            correlation_shift: 0.0,
            drift_shock: 0.0,
            jump: None,
        };
        let report = stress_test(
            &PathSimulator::default(),
            &config(),
            &[0.06, 0.07, 0.08],
            &cov(),
            &[0.2, 0.3, 0.5],
            &[neutral],
            0.95,
        )
        .unwrap();
        assert!(report.scenarios[0].mean_terminal_change.abs() < 1e-9);
    }

    #[test]
    fn test_invalid_shift_rejected() {
        let bad = StressScenario {
            name: "bad".into(),
            volatility_multiplier: 1.0,
            correlation_shift: 1.5,
            drift_shock: 0.0,
            jump: None,
        };
        let res = stress_test(
            &PathSimulator::default(),
            &config(),
            &[0.06, 0.07, 0.08],
            &cov(),
            &[0.2, 0.3, 0.5],
            &[bad],
            0.95,
        );
        assert!(matches!(res, Err(EngineError::Config { .. })));
    }
}
