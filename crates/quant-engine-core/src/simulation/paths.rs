use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::config::{DriftMeasure, SimulationConfig};
use super::executor::{executor_for, Executor, ParallelExecutor};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::math::{mean, percentile_sorted, sample_std, sorted_copy, stream_seed};
use crate::risk::{compute_risk_metrics, RiskMetrics, RiskSource};
use crate::statistics::{build_statistics, CholeskyFactor, CovarianceMatrix, StatisticsOptions};
use crate::types::{
    align_weights, with_metadata, AssetSeries, ComputationOutput, PathEnsemble, PortfolioWeights,
};
use crate::EngineResult;

const DEFAULT_BATCH_SIZE: usize = 10_000;
/// Above this mean the Poisson count switches from Knuth's product method to
/// a rounded normal approximation.
const KNUTH_POISSON_LIMIT: f64 = 30.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Correlated multi-asset path generator.
///
/// Paths are split into batches of `batch_size`; batch `b` draws from its own
/// stream seeded by `(seed, b)`, so the ensemble depends only on the seed and
/// the partition, never on which executor ran it.
#[derive(Debug, Clone)]
pub struct PathSimulator {
    executor: Arc<dyn Executor>,
    batch_size: usize,
    timeout: Option<Duration>,
}

impl Default for PathSimulator {
    fn default() -> Self {
        Self::new(Arc::new(ParallelExecutor))
    }
}

/// An ensemble plus everything the run had to say about itself.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub ensemble: PathEnsemble,
    pub executor: String,
    pub warnings: Vec<String>,
    pub elapsed_us: u64,
}

/// Terminal-value percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalPercentiles {
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSummary {
    pub n_paths: usize,
    pub n_steps: usize,
    pub mean_terminal: f64,
    pub std_terminal: f64,
    pub percentiles: TerminalPercentiles,
    /// Share of paths ending below the initial value plus contributions.
    pub probability_of_loss: f64,
    pub mean_path: Vec<f64>,
}

/// CLI/serde input for a portfolio simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateInput {
    pub assets: Vec<AssetSeries>,
    /// Target weights; empty means equal weights.
    #[serde(default)]
    pub weights: PortfolioWeights,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub statistics: StatisticsOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Number of raw paths to include in the output.
    #[serde(default)]
    pub sample_paths: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateOutput {
    pub seed: u64,
    pub batches: usize,
    pub executor: String,
    pub summary: EnsembleSummary,
    pub risk: RiskMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample_paths: Vec<Vec<f64>>,
}

/// Everything a batch needs, precomputed once per call.
#[derive(Debug)]
struct StepModel {
    n_assets: usize,
    n_steps: usize,
    sqrt_dt: f64,
    /// `(mu - sigma^2 / 2 - jump compensator) * dt` per asset.
    log_drift: Vec<f64>,
    factor: CholeskyFactor,
    jump: Option<JumpModel>,
    /// Target weights normalised to sum to one.
    targets: Vec<f64>,
    /// Contribution added to each asset every step.
    step_contributions: Option<Vec<f64>>,
    rebalance: Option<usize>,
    initial_value: f64,
    antithetic: bool,
}

#[derive(Debug, Clone, Copy)]
struct JumpModel {
    rate_per_step: f64,
    mean: f64,
    std: f64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl PathSimulator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            executor: executor_for(&config.executor),
            batch_size: config.batch_size.max(1),
            timeout: config.simulation_timeout(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Portfolio value paths for `weights` held in the assets described by
    /// `expected_returns` and `covariance`.
    pub fn simulate(
        &self,
        config: &SimulationConfig,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
        weights: &[f64],
    ) -> EngineResult<PathEnsemble> {
        self.simulate_detailed(config, expected_returns, covariance, weights)
            .map(|run| run.ensemble)
    }

    pub fn simulate_detailed(
        &self,
        config: &SimulationConfig,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
        weights: &[f64],
    ) -> EngineResult<SimulationRun> {
        let start = Instant::now();
        config.validate(covariance.dim())?;
        let (model, mut warnings) = build_model(config, expected_returns, covariance, weights)?;

        let seed = resolve_seed(config);
        let batch_size = config.batch_size.unwrap_or(self.batch_size);
        let n_paths = config.n_paths;
        let n_batches = n_paths.div_ceil(batch_size);
        let deadline = config.timeout().or(self.timeout).map(|t| start + t);

        debug!(
            n_paths,
            n_steps = model.n_steps,
            n_batches,
            executor = self.executor.name(),
            "simulating portfolio paths"
        );

        let task = |b: usize| -> EngineResult<Vec<f64>> {
            let count = batch_size.min(n_paths - b * batch_size);
            model.value_batch(stream_seed(seed, b as u64), count, deadline, start)
        };
        let batches = self.executor.run_batches(n_batches, &task)?;

        let mut values = Vec::with_capacity(n_paths * (model.n_steps + 1));
        for batch in batches {
            values.extend(batch);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::numerical(
                "path simulation",
                "Generated paths contain non-finite values",
            ));
        }
        if let Some(note) = self.executor.degraded() {
            warnings.push(note);
        }

        let elapsed_us = start.elapsed().as_micros() as u64;
        info!(
            n_paths,
            n_batches,
            seed,
            elapsed_us,
            executor = self.executor.name(),
            "simulation complete"
        );

        Ok(SimulationRun {
            ensemble: PathEnsemble {
                n_paths,
                n_steps: model.n_steps,
                dt: config.dt(),
                initial_value: config.initial_value,
                seed,
                batches: n_batches,
                values,
            },
            executor: self.executor.name().to_string(),
            warnings,
            elapsed_us,
        })
    }

    /// Per-asset simple returns over the full horizon, one row per path.
    /// Contributions and rebalancing do not apply.
    pub fn simulate_asset_returns(
        &self,
        config: &SimulationConfig,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
    ) -> EngineResult<Vec<Vec<f64>>> {
        let start = Instant::now();
        let n = covariance.dim();
        config.validate(n)?;
        let weights = vec![1.0; n];
        let (model, _) = build_model(config, expected_returns, covariance, &weights)?;

        let seed = resolve_seed(config);
        let batch_size = config.batch_size.unwrap_or(self.batch_size);
        let n_paths = config.n_paths;
        let n_batches = n_paths.div_ceil(batch_size);
        let deadline = config.timeout().or(self.timeout).map(|t| start + t);

        let task = |b: usize| -> EngineResult<Vec<f64>> {
            let count = batch_size.min(n_paths - b * batch_size);
            model.return_batch(stream_seed(seed, b as u64), count, deadline, start)
        };
        let flat: Vec<f64> = self
            .executor
            .run_batches(n_batches, &task)?
            .into_iter()
            .flatten()
            .collect();
        if flat.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::numerical(
                "scenario simulation",
                "Generated returns contain non-finite values",
            ));
        }
        debug!(n_paths, n_assets = n, "simulated asset return scenarios");
        Ok(flat.chunks_exact(n).map(<[f64]>::to_vec).collect())
    }
}

/// Simulate with a default parallel simulator.
pub fn simulate(
    config: &SimulationConfig,
    expected_returns: &[f64],
    covariance: &CovarianceMatrix,
    weights: &[f64],
) -> EngineResult<PathEnsemble> {
    PathSimulator::default().simulate(config, expected_returns, covariance, weights)
}

/// Single-asset GBM under the risk-neutral drift, with `config.volatility` as sigma.
pub fn simulate_gbm(config: &SimulationConfig) -> EngineResult<PathEnsemble> {
    let sigma = match config.volatility {
        Some(v) if v > 0.0 && v.is_finite() => v,
        _ => {
            return Err(EngineError::config(
                "volatility",
                "A positive volatility is required for single-asset GBM",
            ))
        }
    };
    let covariance = CovarianceMatrix::new(vec!["ASSET".to_string()], vec![vec![sigma * sigma]])?;
    let config = SimulationConfig {
        drift_measure: DriftMeasure::RiskNeutral,
        ..config.clone()
    };
    simulate(&config, &[config.risk_free_rate], &covariance, &[1.0])
}

/// Per-asset horizon return scenarios with a default parallel simulator.
pub fn simulate_asset_returns(
    config: &SimulationConfig,
    expected_returns: &[f64],
    covariance: &CovarianceMatrix,
) -> EngineResult<Vec<Vec<f64>>> {
    PathSimulator::default().simulate_asset_returns(config, expected_returns, covariance)
}

pub fn summarize_ensemble(ensemble: &PathEnsemble, total_contributions: f64) -> EnsembleSummary {
    let terminal = ensemble.terminal_values();
    let sorted = sorted_copy(&terminal);
    let invested = ensemble.initial_value + total_contributions;
    let losses = terminal.iter().filter(|v| **v < invested).count();
    EnsembleSummary {
        n_paths: ensemble.n_paths,
        n_steps: ensemble.n_steps,
        mean_terminal: mean(&terminal),
        std_terminal: sample_std(&terminal),
        percentiles: TerminalPercentiles {
            p5: percentile_sorted(&sorted, 5.0),
            p10: percentile_sorted(&sorted, 10.0),
            p25: percentile_sorted(&sorted, 25.0),
            p50: percentile_sorted(&sorted, 50.0),
            p75: percentile_sorted(&sorted, 75.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
        },
        probability_of_loss: if terminal.is_empty() {
            0.0
        } else {
            losses as f64 / terminal.len() as f64
        },
        mean_path: ensemble.mean_path(),
    }
}

/// Build statistics for `input.assets`, simulate, and reduce to a summary
/// and risk metrics.
pub fn run_simulate(
    input: &SimulateInput,
    engine: &EngineConfig,
) -> EngineResult<ComputationOutput<SimulateOutput>> {
    let start = Instant::now();
    engine.validate()?;
    let stats = build_statistics(&input.assets, &input.statistics)?;
    let weights = align_weights(&stats.symbols, &input.weights)?;
    let confidence = input.confidence.unwrap_or(engine.default_confidence);

    let simulator = PathSimulator::from_config(engine);
    let run = simulator.simulate_detailed(
        &input.simulation,
        &stats.expected_returns,
        &stats.covariance,
        &weights,
    )?;
    let risk = compute_risk_metrics(
        RiskSource::Ensemble(&run.ensemble),
        confidence,
        input.simulation.risk_free_rate,
    )?;
    let summary = summarize_ensemble(&run.ensemble, input.simulation.total_contributions());
    let sample_paths = run
        .ensemble
        .paths()
        .take(input.sample_paths)
        .map(<[f64]>::to_vec)
        .collect();

    let mut warnings = stats.warnings.clone();
    warnings.extend(run.warnings);

    let output = SimulateOutput {
        seed: run.ensemble.seed,
        batches: run.ensemble.batches,
        executor: run.executor,
        summary,
        risk,
        sample_paths,
    };
    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Correlated GBM with optional compound-Poisson jumps (Cholesky factorization)",
        &serde_json::json!({
            "n_assets": stats.n_assets(),
            "n_paths": input.simulation.n_paths,
            "horizon_years": input.simulation.horizon_years,
            "steps_per_year": input.simulation.steps_per_year,
            "drift_measure": input.simulation.drift_measure,
            "jumps": input.simulation.jump.is_some(),
            "antithetic": input.simulation.antithetic,
            "confidence": confidence,
        }),
        warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

pub(super) fn resolve_seed(config: &SimulationConfig) -> u64 {
    config.seed.unwrap_or_else(|| rand::thread_rng().gen())
}

fn build_model(
    config: &SimulationConfig,
    expected_returns: &[f64],
    covariance: &CovarianceMatrix,
    weights: &[f64],
) -> EngineResult<(StepModel, Vec<String>)> {
    let n = covariance.dim();
    if expected_returns.len() != n {
        return Err(EngineError::data(
            "expected_returns",
            format!("Expected {} entries, got {}", n, expected_returns.len()),
        ));
    }
    if expected_returns.iter().any(|m| !m.is_finite()) {
        return Err(EngineError::data("expected_returns", "Must be finite"));
    }
    if weights.len() != n {
        return Err(EngineError::config(
            "weights",
            format!("Expected {} weights, got {}", n, weights.len()),
        ));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(EngineError::config(
            "weights",
            "Simulated weights must be finite and non-negative",
        ));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(EngineError::config("weights", "Weights must have a positive sum"));
    }

    let mut warnings = Vec::new();
    let cov = match config.volatility {
        Some(v) => covariance.with_volatilities(&vec![v; n])?,
        None => covariance.clone(),
    };
    let (cov, factor) = match cov.cholesky() {
        Some(factor) => (cov, factor),
        None => {
            warn!("simulation covariance not positive-definite, conditioning before factorization");
            let conditioned = cov.conditioned()?;
            let factor = conditioned.cholesky().ok_or_else(|| {
                EngineError::numerical(
                    "cholesky factorization",
                    "Factorization failed after conditioning",
                )
            })?;
            warnings.push(format!(
                "Simulation covariance conditioned before factorization: {:?}",
                conditioned.conditioning()
            ));
            (conditioned, factor)
        }
    };

    let dt = config.dt();
    let jump = config.jump.filter(|j| j.is_active());
    let compensator = jump.map_or(0.0, |j| j.compensator());
    let log_drift = (0..n)
        .map(|i| {
            let mu = match config.drift_measure {
                DriftMeasure::Physical => expected_returns[i],
                DriftMeasure::RiskNeutral => config.risk_free_rate,
            };
            (mu - 0.5 * cov.get(i, i) - compensator) * dt
        })
        .collect();

    let model = StepModel {
        n_assets: n,
        n_steps: config.n_steps(),
        sqrt_dt: dt.sqrt(),
        log_drift,
        factor,
        jump: jump.map(|j| JumpModel {
            rate_per_step: j.intensity * dt,
            mean: j.mean,
            std: j.std,
        }),
        targets: weights.iter().map(|w| w / total).collect(),
        step_contributions: config
            .contributions
            .as_ref()
            .map(|c| c.iter().map(|m| m * 12.0 * dt).collect()),
        rebalance: config.rebalance_frequency,
        initial_value: config.initial_value,
        antithetic: config.antithetic,
    };
    Ok((model, warnings))
}

impl StepModel {
    fn check_deadline(&self, deadline: Option<Instant>, started: Instant) -> EngineResult<()> {
        match deadline {
            Some(d) if Instant::now() >= d => Err(EngineError::Timeout {
                operation: "simulate".to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }

    /// Log jump shared by every asset for one step.
    fn draw_jump(&self, rng: &mut StdRng, normal: &Normal) -> f64 {
        let Some(jump) = self.jump else {
            return 0.0;
        };
        let k = poisson_count(rng, normal, jump.rate_per_step);
        if k == 0 {
            return 0.0;
        }
        let k = k as f64;
        k * jump.mean + jump.std * k.sqrt() * rng.sample(normal)
    }

    /// Portfolio values for `count` paths, row-major with `n_steps + 1` columns.
    fn value_batch(
        &self,
        seed: u64,
        count: usize,
        deadline: Option<Instant>,
        started: Instant,
    ) -> EngineResult<Vec<f64>> {
        let n = self.n_assets;
        let row = self.n_steps + 1;
        let group = if self.antithetic { 2 } else { 1 };
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = standard_normal()?;

        let mut out = vec![0.0; count * row];
        let mut z = vec![0.0; n];
        let mut shock = vec![0.0; n];
        let mut holdings = vec![vec![0.0; n]; group];

        let mut p = 0;
        while p < count {
            self.check_deadline(deadline, started)?;
            let width = group.min(count - p);
            for h in holdings.iter_mut().take(width) {
                for (hi, t) in h.iter_mut().zip(self.targets.iter()) {
                    *hi = self.initial_value * t;
                }
            }
            for k in 0..width {
                out[(p + k) * row] = self.initial_value;
            }

            for step in 1..=self.n_steps {
                for zi in z.iter_mut() {
                    *zi = rng.sample(normal);
                }
                self.factor.correlate(&z, &mut shock);
                let jump = self.draw_jump(&mut rng, &normal);

                for (k, h) in holdings.iter_mut().take(width).enumerate() {
                    let sign = if k == 0 { 1.0 } else { -1.0 };
                    for i in 0..n {
                        h[i] *= (self.log_drift[i] + sign * self.sqrt_dt * shock[i] + jump).exp();
                    }
                    if let Some(c) = &self.step_contributions {
                        for (hi, ci) in h.iter_mut().zip(c.iter()) {
                            *hi += ci;
                        }
                    }
                    let value: f64 = h.iter().sum();
                    if self.rebalance.is_some_and(|f| step % f == 0) {
                        for (hi, t) in h.iter_mut().zip(self.targets.iter()) {
                            *hi = value * t;
                        }
                    }
                    out[(p + k) * row + step] = value;
                }
            }
            p += width;
        }
        Ok(out)
    }

    /// Horizon simple returns per asset for `count` paths, row-major with
    /// `n_assets` columns.
    fn return_batch(
        &self,
        seed: u64,
        count: usize,
        deadline: Option<Instant>,
        started: Instant,
    ) -> EngineResult<Vec<f64>> {
        let n = self.n_assets;
        let group = if self.antithetic { 2 } else { 1 };
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = standard_normal()?;

        let mut out = vec![0.0; count * n];
        let mut z = vec![0.0; n];
        let mut shock = vec![0.0; n];
        let mut log_totals = vec![vec![0.0; n]; group];

        let mut p = 0;
        while p < count {
            self.check_deadline(deadline, started)?;
            let width = group.min(count - p);
            for totals in log_totals.iter_mut() {
                totals.iter_mut().for_each(|x| *x = 0.0);
            }
            for _ in 0..self.n_steps {
                for zi in z.iter_mut() {
                    *zi = rng.sample(normal);
                }
                self.factor.correlate(&z, &mut shock);
                let jump = self.draw_jump(&mut rng, &normal);
                for (k, totals) in log_totals.iter_mut().take(width).enumerate() {
                    let sign = if k == 0 { 1.0 } else { -1.0 };
                    for i in 0..n {
                        totals[i] += self.log_drift[i] + sign * self.sqrt_dt * shock[i] + jump;
                    }
                }
            }
            for (k, totals) in log_totals.iter().take(width).enumerate() {
                for i in 0..n {
                    out[(p + k) * n + i] = totals[i].exp() - 1.0;
                }
            }
            p += width;
        }
        Ok(out)
    }
}

fn standard_normal() -> EngineResult<Normal> {
    Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::numerical("normal distribution", e.to_string()))
}

/// Poisson draw: Knuth's product of uniforms for small means, rounded normal otherwise.
fn poisson_count(rng: &mut StdRng, normal: &Normal, lambda: f64) -> u64 {
    if lambda <= 0.0 {
        return 0;
    }
    if lambda > KNUTH_POISSON_LIMIT {
        let draw = lambda + lambda.sqrt() * rng.sample(normal);
        return draw.round().max(0.0) as u64;
    }
    let limit = (-lambda).exp();
    let mut k = 0u64;
    let mut product: f64 = rng.gen();
    while product > limit {
        k += 1;
        product *= rng.gen::<f64>();
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::config::{DriftMeasure, JumpConfig};
    use crate::simulation::executor::{DevicePoolExecutor, SequentialExecutor};
    use pretty_assertions::assert_eq;

    const SEED: u64 = 42;

    fn two_asset_cov() -> CovarianceMatrix {
        CovarianceMatrix::from_correlation(
            vec!["A".into(), "B".into()],
            &[0.2, 0.3],
            &[vec![1.0, 0.4], vec![0.4, 1.0]],
        )
        .unwrap()
    }

    fn config(n_paths: usize) -> SimulationConfig {
        SimulationConfig {
            n_paths,
            seed: Some(SEED),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_paths_start_at_initial_value_and_stay_positive() {
        let ens = simulate(&config(500), &[0.07, 0.05], &two_asset_cov(), &[0.6, 0.4]).unwrap();
        assert_eq!(ens.n_paths, 500);
        assert_eq!(ens.n_steps, 12);
        for path in ens.paths() {
            assert_eq!(path[0], 100.0);
            assert!(path.iter().all(|v| v.is_finite() && *v > 0.0));
        }
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let cfg = config(2_000);
        let a = simulate(&cfg, &[0.07, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        let b = simulate(&cfg, &[0.07, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_differs() {
        let a = simulate(&config(100), &[0.07, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        let cfg = SimulationConfig {
            seed: Some(SEED + 1),
            ..config(100)
        };
        let b = simulate(&cfg, &[0.07, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        assert_ne!(a.values, b.values);
    }

    #[test]
    fn test_executors_agree_for_fixed_partition() {
        let cfg = SimulationConfig {
            batch_size: Some(300),
            ..config(1_000)
        };
        let mu = [0.07, 0.05];
        let w = [0.5, 0.5];
        let seq = PathSimulator::new(Arc::new(SequentialExecutor))
            .simulate(&cfg, &mu, &two_asset_cov(), &w)
            .unwrap();
        let par = PathSimulator::default()
            .simulate(&cfg, &mu, &two_asset_cov(), &w)
            .unwrap();
        let dev = PathSimulator::new(Arc::new(DevicePoolExecutor::new(2, 1)))
            .simulate(&cfg, &mu, &two_asset_cov(), &w)
            .unwrap();
        let fallback = PathSimulator::new(Arc::new(DevicePoolExecutor::from_pools(Vec::new(), 2)))
            .simulate(&cfg, &mu, &two_asset_cov(), &w)
            .unwrap();
        assert_eq!(seq.batches, 4);
        assert_eq!(seq, par);
        assert_eq!(seq, dev);
        assert_eq!(seq, fallback);
    }

    #[test]
    fn test_fallback_is_reported() {
        let sim = PathSimulator::new(Arc::new(DevicePoolExecutor::from_pools(Vec::new(), 2)));
        let run = sim
            .simulate_detailed(&config(10), &[0.05, 0.05], &two_asset_cov(), &[0.5, 0.5])
            .unwrap();
        assert!(run.warnings.iter().any(|w| w.contains("device")));
    }

    #[test]
    fn test_gbm_moments_match_lognormal() {
        let cfg = SimulationConfig {
            n_paths: 50_000,
            horizon_years: 1.0,
            steps_per_year: 12,
            initial_value: 100.0,
            risk_free_rate: 0.05,
            volatility: Some(0.20),
            seed: Some(SEED),
            ..SimulationConfig::default()
        };
        let ens = simulate_gbm(&cfg).unwrap();
        let terminal = ens.terminal_values();
        let m = mean(&terminal);
        let s = sample_std(&terminal);
        let expected_mean = 100.0 * 0.05_f64.exp();
        let expected_std = expected_mean * (0.04_f64.exp() - 1.0).sqrt();
        assert!((m - expected_mean).abs() / expected_mean < 0.02, "mean {}", m);
        assert!((s - expected_std).abs() / expected_std < 0.05, "std {}", s);
    }

    #[test]
    fn test_gbm_requires_volatility() {
        assert!(matches!(
            simulate_gbm(&config(10)),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn test_jumps_stay_finite_and_compensated() {
        let cfg = SimulationConfig {
            n_paths: 20_000,
            jump: Some(JumpConfig {
                intensity: 1.0,
                mean: -0.05,
                std: 0.1,
            }),
            drift_measure: DriftMeasure::RiskNeutral,
            risk_free_rate: 0.03,
            ..config(0)
        };
        let ens = simulate(&cfg, &[0.0, 0.0], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        assert!(ens.values.iter().all(|v| v.is_finite() && *v > 0.0));
        let m = mean(&ens.terminal_values());
        let expected = 100.0 * 0.03_f64.exp();
        assert!((m - expected).abs() / expected < 0.02, "mean {}", m);
    }

    #[test]
    fn test_contributions_raise_terminal_value() {
        let base = simulate(&config(1_000), &[0.05, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        let cfg = SimulationConfig {
            contributions: Some(vec![10.0, 10.0]),
            ..config(1_000)
        };
        let funded = simulate(&cfg, &[0.05, 0.05], &two_asset_cov(), &[0.5, 0.5]).unwrap();
        // Same seed and draws, so every funded path sits above its unfunded twin.
        for (a, b) in base.terminal_values().iter().zip(funded.terminal_values()) {
            assert!(b > *a);
        }
    }

    #[test]
    fn test_antithetic_pairs_mirror_shocks() {
        let cfg = SimulationConfig {
            antithetic: true,
            steps_per_year: 1,
            ..config(2)
        };
        let cov = CovarianceMatrix::new(vec!["A".into()], vec![vec![0.04]]).unwrap();
        let ens = simulate(&cfg, &[0.05], &cov, &[1.0]).unwrap();
        // log(V1/V0) + log(V1'/V0) = 2 * drift for a mirrored pair.
        let drift = 0.05 - 0.5 * 0.04;
        let sum = (ens.value(0, 1) / 100.0).ln() + (ens.value(1, 1) / 100.0).ln();
        assert!((sum - 2.0 * drift).abs() < 1e-12);
    }

    #[test]
    fn test_rebalancing_keeps_paths_valid() {
        let cfg = SimulationConfig {
            rebalance_frequency: Some(3),
            ..config(200)
        };
        let ens = simulate(&cfg, &[0.07, 0.05], &two_asset_cov(), &[0.7, 0.3]).unwrap();
        assert!(ens.values.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn test_asset_returns_shape_and_mean() {
        let cfg = SimulationConfig {
            drift_measure: DriftMeasure::Physical,
            ..config(20_000)
        };
        let rows = simulate_asset_returns(&cfg, &[0.08, 0.02], &two_asset_cov()).unwrap();
        assert_eq!(rows.len(), 20_000);
        assert_eq!(rows[0].len(), 2);
        let first: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let expected = 0.08_f64.exp() - 1.0;
        assert!((mean(&first) - expected).abs() < 0.01);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        assert!(matches!(
            simulate(&config(10), &[0.05], &two_asset_cov(), &[0.5, 0.5]),
            Err(EngineError::Data { .. })
        ));
        assert!(matches!(
            simulate(&config(10), &[0.05, 0.05], &two_asset_cov(), &[1.0]),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let sim = PathSimulator::new(Arc::new(SequentialExecutor)).with_timeout(Duration::ZERO);
        let res = sim.simulate(&config(100), &[0.05, 0.05], &two_asset_cov(), &[0.5, 0.5]);
        assert!(matches!(res, Err(EngineError::Timeout { .. })));
    }

    #[test]
    fn test_run_simulate_envelope() {
        let returns_a = vec![0.01, -0.02, 0.015, 0.003, 0.007, -0.004];
        let returns_b = vec![0.002, 0.004, -0.001, 0.006, 0.001, 0.003];
        let input = SimulateInput {
            assets: vec![
                AssetSeries::new("A", returns_a),
                AssetSeries::new("B", returns_b),
            ],
            weights: PortfolioWeights::new(),
            simulation: config(1_000),
            statistics: StatisticsOptions::default(),
            confidence: None,
            sample_paths: 3,
        };
        let out = run_simulate(&input, &EngineConfig::default()).unwrap();
        assert_eq!(out.result.sample_paths.len(), 3);
        assert_eq!(out.result.seed, SEED);
        assert!(out.result.risk.cvar >= out.result.risk.var - 1e-12);
        assert!(out.result.summary.percentiles.p5 <= out.result.summary.percentiles.p95);
    }
}
