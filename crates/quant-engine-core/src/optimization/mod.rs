//! Portfolio optimisation.
//!
//! Every method is a variant of [`OptimizationMethod`] and runs through the
//! same pipeline: resolve constraints (INIT -> BUILDING_PROBLEM), solve
//! (SOLVING), then report CONVERGED, INFEASIBLE or TIMED_OUT together with a
//! full constraint check of the returned weights.

pub mod black_litterman;
pub mod cvar;
pub mod hrp;
pub mod kelly;
pub mod mean_variance;
pub mod multi_objective;
pub mod risk_parity;
pub mod robust;
pub mod solver;
pub mod state;
pub mod tax_aware;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::constraints::{ConstraintSet, ConstraintViolation, Constraints};
use crate::error::EngineError;
use crate::math::{compute_sharpe, hhi, mat_vec_multiply, vec_dot};
use crate::simulation::PathSimulator;
use crate::statistics::{
    build_statistics, build_statistics_cached, CovarianceCache, MarketStatistics,
    StatisticsOptions,
};
use crate::types::{with_metadata, AssetSeries, ComputationOutput, PortfolioWeights};
use crate::EngineResult;

pub use black_litterman::{BlackLittermanParams, View};
pub use cvar::{CvarParams, ScenarioSource};
pub use hrp::LinkageStep;
pub use kelly::KellyParams;
pub use multi_objective::MultiObjectiveParams;
pub use risk_parity::{risk_contributions, RiskParityParams};
pub use robust::RobustParams;
pub use solver::Descent;
pub use state::{SolveState, SolveStatus, SolveTracker};
pub use tax_aware::{TaxAwareMetrics, TaxAwareParams, TaxLot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Iteration limits and market inputs shared by every method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    pub risk_free_rate: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Wall-clock budget for the whole call. On expiry the best feasible
    /// iterate is returned with status `timed_out`.
    pub timeout_ms: Option<u64>,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            max_iterations: 5_000,
            tolerance: 1e-9,
            timeout_ms: None,
        }
    }
}

impl SolverParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            risk_free_rate: 0.0,
            max_iterations: config.solver.max_iterations,
            tolerance: config.solver.tolerance,
            timeout_ms: config.solver.timeout_ms,
        }
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::config("risk_free_rate", "Must be finite"));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::config("max_iterations", "Must be at least 1"));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(EngineError::config("tolerance", "Must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanVarianceParams {
    pub risk_aversion: f64,
}

impl Default for MeanVarianceParams {
    fn default() -> Self {
        Self { risk_aversion: 3.0 }
    }
}

/// The closed set of optimisation methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OptimizationMethod {
    /// Maximise `(w'mu - rf) / sqrt(w'Sigma w)`.
    #[default]
    MaxSharpe,
    /// Maximise `w'mu - (lambda / 2) w'Sigma w`.
    MeanVariance(MeanVarianceParams),
    MinVariance,
    RiskParity(RiskParityParams),
    Hrp,
    BlackLitterman(BlackLittermanParams),
    Cvar(CvarParams),
    Kelly(KellyParams),
    Robust(RobustParams),
    MultiObjective(MultiObjectiveParams),
    TaxAware(TaxAwareParams),
}

/// Method-specific output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodMetrics {
    RiskParity {
        budgets: BTreeMap<String, f64>,
        max_budget_error: f64,
    },
    Hrp {
        linkage: Vec<LinkageStep>,
        /// Quasi-diagonal leaf order.
        order: Vec<String>,
    },
    BlackLitterman {
        prior_returns: BTreeMap<String, f64>,
        posterior_returns: BTreeMap<String, f64>,
        market_weights: BTreeMap<String, f64>,
        views: usize,
    },
    Cvar {
        confidence: f64,
        var: f64,
        cvar: f64,
        scenarios: usize,
        source: String,
    },
    Kelly {
        fraction: f64,
        expected_log_growth: f64,
        /// `fraction * Sigma^-1 (mu - rf)` with no constraints applied.
        unconstrained_fractions: Option<BTreeMap<String, f64>>,
    },
    Robust {
        epsilon: f64,
        estimation_years: f64,
        nominal_return: f64,
        worst_case_return: f64,
    },
    MultiObjective {
        expected_return: f64,
        variance: f64,
        esg_score: f64,
        objective: f64,
    },
    TaxAware(Box<TaxAwareMetrics>),
}

/// Risk and concentration figures for the returned weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Weighted average volatility over portfolio volatility.
    pub diversification_ratio: f64,
    pub hhi: f64,
    pub effective_assets: f64,
    /// Share of portfolio variance per symbol.
    pub risk_contributions: BTreeMap<String, f64>,
    pub esg_score: Option<f64>,
    /// One-way turnover against current holdings, when holdings were given.
    pub turnover: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub iterations: usize,
    /// Condition number of the covariance used, if finite.
    pub condition_number: Option<f64>,
    pub solve_time_us: u64,
    pub state_trace: Vec<SolveState>,
    /// Why the solve did not converge, if it did not.
    pub reason: Option<String>,
    pub first_violation: Option<ConstraintViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: PortfolioWeights,
    pub method: String,
    pub metrics: PortfolioMetrics,
    pub method_metrics: Option<MethodMetrics>,
    pub constraints_satisfied: bool,
    pub violations: Vec<ConstraintViolation>,
    pub status: SolveStatus,
    pub diagnostics: Diagnostics,
    pub warnings: Vec<String>,
}

/// Everything a method needs for one solve.
pub(crate) struct Problem<'a> {
    pub stats: &'a MarketStatistics,
    pub set: &'a ConstraintSet,
    pub mu: &'a [f64],
    pub sigma: &'a [Vec<f64>],
    pub params: &'a SolverParams,
    pub deadline: Option<Instant>,
    pub simulator: &'a PathSimulator,
}

impl Problem<'_> {
    /// Projected gradient from the tie-break reference point.
    pub fn descend<F>(&self, objective: F) -> Descent
    where
        F: Fn(&[f64]) -> (f64, Vec<f64>),
    {
        self.descend_from(&self.set.reference_weights(), objective)
    }

    pub fn descend_from<F>(&self, start: &[f64], objective: F) -> Descent
    where
        F: Fn(&[f64]) -> (f64, Vec<f64>),
    {
        solver::minimize(self.set, start, self.params, self.deadline, objective)
    }
}

/// A method's raw answer before the common reporting.
#[derive(Debug, Clone)]
pub(crate) struct MethodOutcome {
    pub weights: Vec<f64>,
    pub status: SolveStatus,
    pub iterations: usize,
    pub reason: Option<String>,
    pub method_metrics: Option<MethodMetrics>,
    pub warnings: Vec<String>,
}

impl From<Descent> for MethodOutcome {
    fn from(d: Descent) -> Self {
        Self {
            weights: d.weights,
            status: d.status,
            iterations: d.iterations,
            reason: d.reason,
            method_metrics: None,
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl OptimizationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationMethod::MaxSharpe => "max_sharpe",
            OptimizationMethod::MeanVariance(_) => "mean_variance",
            OptimizationMethod::MinVariance => "min_variance",
            OptimizationMethod::RiskParity(_) => "risk_parity",
            OptimizationMethod::Hrp => "hrp",
            OptimizationMethod::BlackLitterman(_) => "black_litterman",
            OptimizationMethod::Cvar(_) => "cvar",
            OptimizationMethod::Kelly(_) => "kelly",
            OptimizationMethod::Robust(_) => "robust",
            OptimizationMethod::MultiObjective(_) => "multi_objective",
            OptimizationMethod::TaxAware(_) => "tax_aware",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OptimizationMethod::MaxSharpe => "Maximum Sharpe ratio (projected gradient)",
            OptimizationMethod::MeanVariance(_) => "Mean-variance utility (projected gradient)",
            OptimizationMethod::MinVariance => "Minimum variance (projected gradient)",
            OptimizationMethod::RiskParity(_) => "Risk budgeting by cyclical coordinate descent",
            OptimizationMethod::Hrp => "Hierarchical Risk Parity, average linkage on 1 - rho",
            OptimizationMethod::BlackLitterman(_) => {
                "Black-Litterman posterior with mean-variance allocation"
            }
            OptimizationMethod::Cvar(_) => "CVaR minimisation (Rockafellar-Uryasev linear program)",
            OptimizationMethod::Kelly(_) => "Fractional Kelly log-growth",
            OptimizationMethod::Robust(_) => "Robust mean-variance over an ellipsoidal return set",
            OptimizationMethod::MultiObjective(_) => "Blended return / risk / ESG objective",
            OptimizationMethod::TaxAware(_) => "Tax- and turnover-aware overlay on a base method",
        }
    }

    /// Solve on prepared statistics with the default simulator.
    pub fn solve(
        &self,
        stats: &MarketStatistics,
        constraints: &Constraints,
        params: &SolverParams,
    ) -> EngineResult<OptimizationResult> {
        Optimizer::new(params.clone()).optimize_statistics(stats, constraints, self)
    }

    fn effective_constraints<'a>(&self, constraints: &'a Constraints) -> Cow<'a, Constraints> {
        match self {
            OptimizationMethod::TaxAware(p)
                if constraints.current_holdings.is_empty() && !p.lots.is_empty() =>
            {
                Cow::Owned(tax_aware::with_lot_holdings(constraints, p))
            }
            _ => Cow::Borrowed(constraints),
        }
    }
}

/// Dispatch to the method's solver.
pub(crate) fn solve_outcome(
    method: &OptimizationMethod,
    problem: &Problem<'_>,
) -> EngineResult<MethodOutcome> {
    Ok(match method {
        OptimizationMethod::MaxSharpe => mean_variance::max_sharpe(problem),
        OptimizationMethod::MeanVariance(p) => {
            if !(p.risk_aversion > 0.0) || !p.risk_aversion.is_finite() {
                return Err(EngineError::config("risk_aversion", "Must be positive"));
            }
            mean_variance::mean_variance(problem, p.risk_aversion)
        }
        OptimizationMethod::MinVariance => mean_variance::min_variance(problem),
        OptimizationMethod::RiskParity(p) => risk_parity::solve(problem, p)?,
        OptimizationMethod::Hrp => hrp::solve(problem),
        OptimizationMethod::BlackLitterman(p) => black_litterman::solve(problem, p)?,
        OptimizationMethod::Cvar(p) => cvar::solve(problem, p)?,
        OptimizationMethod::Kelly(p) => kelly::solve(problem, p)?,
        OptimizationMethod::Robust(p) => robust::solve(problem, p)?,
        OptimizationMethod::MultiObjective(p) => multi_objective::solve(problem, p)?,
        OptimizationMethod::TaxAware(p) => tax_aware::solve(problem, p)?,
    })
}

impl PortfolioMetrics {
    pub fn compute(
        w: &[f64],
        stats: &MarketStatistics,
        set: &ConstraintSet,
        risk_free_rate: f64,
    ) -> Self {
        let sigma = stats.covariance.values();
        let sigma_w = mat_vec_multiply(sigma, w);
        let variance = vec_dot(w, &sigma_w).max(0.0);
        let volatility = variance.sqrt();
        let expected_return = vec_dot(w, &stats.expected_returns);
        let weighted_vol: f64 = w
            .iter()
            .zip(stats.volatilities.iter())
            .map(|(wi, v)| wi.abs() * v)
            .sum();
        let concentration = hhi(w);
        let contributions = w.iter().zip(sigma_w.iter()).map(|(wi, swi)| {
            if variance > 0.0 {
                wi * swi / variance
            } else {
                0.0
            }
        });
        let esg_score = if stats.esg_scores.iter().any(Option::is_some) {
            let scores: Vec<f64> = stats.esg_scores.iter().map(|s| s.unwrap_or(0.0)).collect();
            Some(vec_dot(w, &scores) / set.budget)
        } else {
            None
        };

        Self {
            expected_return,
            volatility,
            sharpe_ratio: compute_sharpe(expected_return, risk_free_rate, volatility),
            diversification_ratio: if volatility > 0.0 {
                weighted_vol / volatility
            } else {
                1.0
            },
            hhi: concentration,
            effective_assets: if concentration > 0.0 {
                1.0 / concentration
            } else {
                0.0
            },
            risk_contributions: stats.symbols.iter().cloned().zip(contributions).collect(),
            esg_score,
            turnover: set.has_holdings.then(|| set.turnover(w)),
        }
    }
}

/// Request-scoped optimiser. Holds no state between calls.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    params: SolverParams,
    statistics: StatisticsOptions,
    simulator: PathSimulator,
}

impl Optimizer {
    pub fn new(params: SolverParams) -> Self {
        Self {
            params,
            statistics: StatisticsOptions::default(),
            simulator: PathSimulator::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            params: SolverParams::from_config(config),
            statistics: StatisticsOptions {
                periods_per_year: config.periods_per_year,
            },
            simulator: PathSimulator::from_config(config),
        }
    }

    pub fn with_params(mut self, params: SolverParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_statistics(mut self, options: StatisticsOptions) -> Self {
        self.statistics = options;
        self
    }

    pub fn with_simulator(mut self, simulator: PathSimulator) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Build statistics from `assets` and optimise.
    pub fn optimize(
        &self,
        assets: &[AssetSeries],
        constraints: &Constraints,
        method: &OptimizationMethod,
    ) -> EngineResult<OptimizationResult> {
        let start = Instant::now();
        let stats = build_statistics(assets, &self.statistics)?;
        self.solve_timed(&stats, constraints, method, start)
    }

    /// Like [`Optimizer::optimize`], reusing statistics cached for `(universe, as_of)`.
    pub fn optimize_cached(
        &self,
        assets: &[AssetSeries],
        constraints: &Constraints,
        method: &OptimizationMethod,
        cache: &CovarianceCache,
        as_of: DateTime<Utc>,
    ) -> EngineResult<OptimizationResult> {
        let start = Instant::now();
        let cached = build_statistics_cached(assets, &self.statistics, cache, as_of)?;
        self.solve_timed(&cached.statistics, constraints, method, start)
    }

    pub fn optimize_statistics(
        &self,
        stats: &MarketStatistics,
        constraints: &Constraints,
        method: &OptimizationMethod,
    ) -> EngineResult<OptimizationResult> {
        self.solve_timed(stats, constraints, method, Instant::now())
    }

    fn solve_timed(
        &self,
        stats: &MarketStatistics,
        constraints: &Constraints,
        method: &OptimizationMethod,
        start: Instant,
    ) -> EngineResult<OptimizationResult> {
        self.params.validate()?;
        let mut tracker = SolveTracker::new(method.name());

        tracker.advance(SolveState::BuildingProblem)?;
        if stats.n_assets() == 0 {
            return Err(EngineError::data("assets", "Universe is empty"));
        }
        let constraints = method.effective_constraints(constraints);
        let set = constraints.resolve(stats)?;
        let problem = Problem {
            stats,
            set: &set,
            mu: &stats.expected_returns,
            sigma: stats.covariance.values(),
            params: &self.params,
            deadline: self.params.timeout().map(|t| start + t),
            simulator: &self.simulator,
        };

        tracker.advance(SolveState::Solving)?;
        let outcome = solve_outcome(method, &problem)?;
        tracker.finish(outcome.status)?;

        let report = set.check(&outcome.weights);
        let metrics = PortfolioMetrics::compute(&outcome.weights, stats, &set, self.params.risk_free_rate);
        let condition_number = Some(stats.covariance.condition_number()).filter(|c| c.is_finite());

        let mut warnings = stats.warnings.clone();
        warnings.extend(set.warnings.iter().cloned());
        warnings.extend(outcome.warnings);
        match outcome.status {
            SolveStatus::Converged => {}
            SolveStatus::TimedOut => {
                warn!(method = method.name(), "solve timed out; returning best feasible iterate");
                warnings.push("Solve did not converge; weights are the best iterate found".to_string());
            }
            SolveStatus::Infeasible => {
                warn!(method = method.name(), "method objective infeasible");
                warnings.push("Method objective is infeasible; weights are a feasible fallback".to_string());
            }
        }

        let elapsed = start.elapsed().as_micros() as u64;
        info!(
            method = method.name(),
            status = ?outcome.status,
            iterations = outcome.iterations,
            satisfied = report.is_satisfied(),
            elapsed_us = elapsed,
            "portfolio optimized"
        );

        Ok(OptimizationResult {
            weights: set.symbols.iter().cloned().zip(outcome.weights.iter().copied()).collect(),
            method: method.name().to_string(),
            metrics,
            method_metrics: outcome.method_metrics,
            constraints_satisfied: report.is_satisfied(),
            diagnostics: Diagnostics {
                iterations: outcome.iterations,
                condition_number,
                solve_time_us: elapsed,
                state_trace: tracker.into_trace(),
                reason: outcome.reason,
                first_violation: report.first_violation().cloned(),
            },
            violations: report.violations,
            status: outcome.status,
            warnings,
        })
    }
}

/// `optimize(asset_series, constraints, method, method_params)`.
pub fn optimize(
    assets: &[AssetSeries],
    constraints: &Constraints,
    method: &OptimizationMethod,
    params: &SolverParams,
) -> EngineResult<OptimizationResult> {
    Optimizer::new(params.clone()).optimize(assets, constraints, method)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeInput {
    pub assets: Vec<AssetSeries>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub method: OptimizationMethod,
    /// Overrides the engine's solver defaults.
    #[serde(default)]
    pub params: Option<SolverParams>,
    #[serde(default)]
    pub risk_free_rate: Option<f64>,
    /// Overrides the engine's annualisation.
    #[serde(default)]
    pub statistics: Option<StatisticsOptions>,
}

pub fn run_optimize(
    input: &OptimizeInput,
    engine: &EngineConfig,
) -> EngineResult<ComputationOutput<OptimizationResult>> {
    let start = Instant::now();
    engine.validate()?;
    let mut params = input
        .params
        .clone()
        .unwrap_or_else(|| SolverParams::from_config(engine));
    if let Some(rf) = input.risk_free_rate {
        params.risk_free_rate = rf;
    }
    let mut optimizer = Optimizer::from_config(engine).with_params(params.clone());
    if let Some(options) = &input.statistics {
        optimizer = optimizer.with_statistics(options.clone());
    }
    let result = optimizer.optimize(&input.assets, &input.constraints, &input.method)?;
    let warnings = result.warnings.clone();

    Ok(with_metadata(
        input.method.description(),
        &serde_json::json!({
            "method": input.method.name(),
            "n_assets": input.assets.len(),
            "risk_free_rate": params.risk_free_rate,
            "max_iterations": params.max_iterations,
            "tolerance": params.tolerance,
            "timeout_ms": params.timeout_ms,
            "leverage": input.constraints.leverage,
            "long_only": !input.constraints.allow_short,
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        result,
    ))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::statistics::{CovarianceMatrix, MarketStatistics};

    pub fn stats_from(mu: &[f64], vols: &[f64], corr: &[Vec<f64>]) -> MarketStatistics {
        let n = mu.len();
        let symbols: Vec<String> = (0..n).map(|i| format!("A{}", i)).collect();
        let covariance = CovarianceMatrix::from_correlation(symbols.clone(), vols, corr).unwrap();
        MarketStatistics {
            symbols,
            expected_returns: mu.to_vec(),
            volatilities: vols.to_vec(),
            covariance,
            sectors: vec![None; n],
            esg_scores: vec![None; n],
            market_caps: vec![None; n],
            scenario_returns: Vec::new(),
            periods_per_year: 252.0,
            warnings: Vec::new(),
        }
    }

    pub fn uncorrelated(mu: &[f64], vols: &[f64]) -> MarketStatistics {
        let n = mu.len();
        let corr: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        stats_from(mu, vols, &corr)
    }

    pub fn correlated() -> MarketStatistics {
        stats_from(
            &[0.09, 0.07, 0.05, 0.04],
            &[0.22, 0.18, 0.12, 0.08],
            &[
                vec![1.0, 0.6, 0.3, 0.1],
                vec![0.6, 1.0, 0.4, 0.2],
                vec![0.3, 0.4, 1.0, 0.3],
                vec![0.1, 0.2, 0.3, 1.0],
            ],
        )
    }

    /// Two correlated blocks plus a diversifier, with spread-out volatilities.
    pub fn five_asset() -> MarketStatistics {
        stats_from(
            &[0.10, 0.09, 0.06, 0.05, 0.03],
            &[0.30, 0.25, 0.15, 0.12, 0.05],
            &[
                vec![1.0, 0.8, 0.2, 0.1, 0.0],
                vec![0.8, 1.0, 0.25, 0.15, 0.05],
                vec![0.2, 0.25, 1.0, 0.7, 0.1],
                vec![0.1, 0.15, 0.7, 1.0, 0.1],
                vec![0.0, 0.05, 0.1, 0.1, 1.0],
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{correlated, five_asset};
    use super::*;
    use pretty_assertions::assert_eq;

    fn every_method() -> Vec<OptimizationMethod> {
        vec![
            OptimizationMethod::MaxSharpe,
            OptimizationMethod::MeanVariance(MeanVarianceParams::default()),
            OptimizationMethod::MinVariance,
            OptimizationMethod::RiskParity(RiskParityParams::default()),
            OptimizationMethod::Hrp,
            OptimizationMethod::BlackLitterman(BlackLittermanParams::default()),
            OptimizationMethod::Kelly(KellyParams::default()),
            OptimizationMethod::Robust(RobustParams::default()),
            OptimizationMethod::MultiObjective(MultiObjectiveParams::default()),
            OptimizationMethod::TaxAware(TaxAwareParams::default()),
        ]
    }

    #[test]
    fn test_every_method_is_fully_invested_and_long_only() {
        let stats = five_asset();
        for method in every_method() {
            let result = method
                .solve(&stats, &Constraints::default(), &SolverParams::default())
                .unwrap();
            let sum: f64 = result.weights.values().sum();
            assert!((sum - 1.0).abs() < 1e-5, "{}: {}", method.name(), sum);
            assert!(result.weights.values().all(|w| *w >= -1e-6), "{}", method.name());
            assert!(result.constraints_satisfied, "{}: {:?}", method.name(), result.violations);
        }
    }

    #[test]
    fn test_state_trace_reaches_terminal_state() {
        let result = OptimizationMethod::MinVariance
            .solve(&correlated(), &Constraints::default(), &SolverParams::default())
            .unwrap();
        assert_eq!(
            result.diagnostics.state_trace,
            vec![
                SolveState::Init,
                SolveState::BuildingProblem,
                SolveState::Solving,
                SolveState::Converged
            ]
        );
        assert!(result.diagnostics.condition_number.is_some());
    }

    #[test]
    fn test_leverage_budget_is_respected() {
        let constraints = Constraints {
            leverage: 1.5,
            ..Constraints::default()
        };
        let result = OptimizationMethod::MinVariance
            .solve(&correlated(), &constraints, &SolverParams::default())
            .unwrap();
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_sector_conflict_is_constraint_error() {
        let mut stats = correlated();
        stats.sectors = vec![
            Some("Tech".to_string()),
            Some("Tech".to_string()),
            Some("Energy".to_string()),
            Some("Energy".to_string()),
        ];
        let constraints = Constraints::default()
            .with_sector_limit("Tech", 0.7, 1.0)
            .with_sector_limit("Energy", 0.5, 1.0);
        let err = OptimizationMethod::MinVariance
            .solve(&stats, &constraints, &SolverParams::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Constraint { .. }), "{:?}", err);
    }

    #[test]
    fn test_iteration_budget_flags_timed_out() {
        let params = SolverParams {
            max_iterations: 1,
            tolerance: 1e-14,
            ..SolverParams::default()
        };
        let result = OptimizationMethod::MaxSharpe
            .solve(&five_asset(), &Constraints::default(), &params)
            .unwrap();
        assert_eq!(result.status, SolveStatus::TimedOut);
        assert_eq!(result.diagnostics.state_trace.last(), Some(&SolveState::TimedOut));
        assert!(result.constraints_satisfied);
        assert!(result.diagnostics.reason.is_some());
    }

    #[test]
    fn test_zero_timeout_returns_best_effort() {
        let params = SolverParams::default().with_timeout(Duration::from_millis(0));
        let result = OptimizationMethod::MinVariance
            .solve(&five_asset(), &Constraints::default(), &params)
            .unwrap();
        assert_eq!(result.status, SolveStatus::TimedOut);
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_turnover_limit_holds() {
        let holdings: PortfolioWeights = [("A0", 0.5), ("A1", 0.5)]
            .iter()
            .map(|(s, w)| (s.to_string(), *w))
            .collect();
        let constraints = Constraints::default()
            .with_holdings(holdings)
            .with_max_turnover(0.2);
        let result = OptimizationMethod::MinVariance
            .solve(&correlated(), &constraints, &SolverParams::default())
            .unwrap();
        assert!(result.constraints_satisfied, "{:?}", result.violations);
        assert!(result.metrics.turnover.unwrap() <= 0.2 + 1e-6);
    }

    #[test]
    fn test_metrics_are_consistent() {
        let result = OptimizationMethod::RiskParity(RiskParityParams::default())
            .solve(&correlated(), &Constraints::default(), &SolverParams::default())
            .unwrap();
        let total: f64 = result.metrics.risk_contributions.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(result.metrics.diversification_ratio >= 1.0);
        assert!(result.metrics.effective_assets > 1.0);
        assert!(result.metrics.turnover.is_none());
    }

    #[test]
    fn test_method_json_shape() {
        let method: OptimizationMethod =
            serde_json::from_str(r#"{"method": "risk_parity"}"#).unwrap();
        assert_eq!(method, OptimizationMethod::RiskParity(RiskParityParams::default()));
        let method: OptimizationMethod = serde_json::from_str(
            r#"{"method": "tax_aware", "base": {"method": "hrp"}, "short_term_rate": 0.4}"#,
        )
        .unwrap();
        match method {
            OptimizationMethod::TaxAware(p) => {
                assert_eq!(*p.base, OptimizationMethod::Hrp);
                assert_eq!(p.short_term_rate, 0.4);
            }
            other => panic!("unexpected {:?}", other),
        }
        let mv: OptimizationMethod =
            serde_json::from_str(r#"{"method": "min_variance"}"#).unwrap();
        assert_eq!(mv, OptimizationMethod::MinVariance);
    }

    #[test]
    fn test_bad_solver_params_rejected() {
        let params = SolverParams {
            tolerance: 0.0,
            ..SolverParams::default()
        };
        assert!(OptimizationMethod::MinVariance
            .solve(&correlated(), &Constraints::default(), &params)
            .is_err());
    }

    #[test]
    fn test_run_optimize_envelope() {
        let input: OptimizeInput = serde_json::from_value(serde_json::json!({
            "assets": [
                {"symbol": "A", "returns": [0.01, -0.02, 0.015, 0.004, -0.003, 0.012]},
                {"symbol": "B", "returns": [0.002, 0.001, -0.001, 0.003, 0.002, 0.0]},
                {"symbol": "C", "returns": [-0.01, 0.02, 0.005, -0.004, 0.01, 0.003]}
            ],
            "method": {"method": "min_variance"},
            "statistics": {"periods_per_year": 12.0}
        }))
        .unwrap();
        let output = run_optimize(&input, &EngineConfig::default()).unwrap();
        assert_eq!(output.methodology, "Minimum variance (projected gradient)");
        let sum: f64 = output.result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(output.result.weights["B"] > output.result.weights["A"]);
    }
}
