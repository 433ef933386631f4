//! CVaR minimisation as a linear program (Rockafellar-Uryasev).
//!
//! For scenarios `r_s` and confidence `alpha`:
//!
//! ```text
//! minimise  zeta + 1 / ((1 - alpha) S) * sum_s u_s
//! s.t.      u_s >= -r_s'w - zeta,  u_s >= 0
//! ```
//!
//! with every position, budget, sector, ESG and turnover limit as exact rows.
//! `zeta` is the only free variable.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MethodMetrics, MethodOutcome, Problem, SolveStatus};
use crate::constraints::linear::{append_constraint_rows, LpLayout};
use crate::error::EngineError;
use crate::lp::{LinearProgram, LpStatus, RowKind};
use crate::risk::{historical_var_cvar, portfolio_sample_returns};
use crate::simulation::SimulationConfig;
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where the loss scenarios come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ScenarioSource {
    /// The aligned per-period return history.
    Historical,
    /// Horizon returns drawn from the path simulator.
    Simulated {
        #[serde(default = "default_scenario_paths")]
        n_paths: usize,
        #[serde(default = "default_scenario_horizon")]
        horizon_years: f64,
        #[serde(default)]
        seed: Option<u64>,
    },
}

fn default_scenario_paths() -> usize {
    1_000
}

fn default_scenario_horizon() -> f64 {
    1.0 / 12.0
}

impl ScenarioSource {
    fn label(&self) -> &'static str {
        match self {
            ScenarioSource::Historical => "historical",
            ScenarioSource::Simulated { .. } => "simulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvarParams {
    pub confidence: f64,
    pub scenarios: ScenarioSource,
    /// Minimum annualised expected return, `w'mu >= min_return`.
    pub min_return: Option<f64>,
}

impl Default for CvarParams {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            scenarios: ScenarioSource::Historical,
            min_return: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub(crate) fn solve(problem: &Problem<'_>, params: &CvarParams) -> EngineResult<MethodOutcome> {
    if !(params.confidence > 0.0 && params.confidence < 1.0) {
        return Err(EngineError::config("confidence", "Must be in (0, 1)"));
    }
    if let Some(m) = params.min_return {
        if !m.is_finite() {
            return Err(EngineError::config("min_return", "Must be finite"));
        }
    }

    let scenarios = match load_scenarios(problem, &params.scenarios) {
        Ok(s) => s,
        Err(EngineError::Timeout { elapsed_ms, .. }) => {
            warn!(elapsed_ms, "scenario simulation timed out");
            return Ok(fallback(
                problem,
                SolveStatus::TimedOut,
                0,
                format!("Scenario simulation timed out after {} ms", elapsed_ms),
            ));
        }
        Err(e) => return Err(e),
    };

    let lp = build_program(problem, &scenarios, params);
    let solution = lp.solve(problem.params.max_iterations, problem.deadline)?;
    debug!(
        status = ?solution.status,
        iterations = solution.iterations,
        rows = lp.n_rows(),
        vars = lp.n_vars(),
        "cvar program solved"
    );

    let n = problem.set.n_assets();
    let mut outcome = match solution.status {
        LpStatus::Optimal => {
            let w: Vec<f64> = (0..n).map(|i| problem.set.lower[i] + solution.x[i]).collect();
            MethodOutcome {
                weights: problem.set.repair(&w),
                status: SolveStatus::Converged,
                iterations: solution.iterations,
                reason: None,
                method_metrics: None,
                warnings: Vec::new(),
            }
        }
        LpStatus::Infeasible => fallback(
            problem,
            SolveStatus::Infeasible,
            solution.iterations,
            match params.min_return {
                Some(m) => format!("No portfolio within the constraints reaches min_return {:.6}", m),
                None => "The CVaR program has no feasible point".to_string(),
            },
        ),
        LpStatus::IterationLimit | LpStatus::TimedOut => fallback(
            problem,
            SolveStatus::TimedOut,
            solution.iterations,
            format!("CVaR program stopped early ({:?})", solution.status),
        ),
        LpStatus::Unbounded => {
            return Err(EngineError::numerical(
                "cvar",
                "CVaR program reported an unbounded objective",
            ))
        }
        LpStatus::NumericalFailure => {
            return Err(EngineError::numerical(
                "cvar",
                "Interior-point solver lost accuracy on the CVaR program",
            ))
        }
    };

    let sample = portfolio_sample_returns(&scenarios, &outcome.weights);
    let (var, cvar) = historical_var_cvar(&sample, params.confidence);
    outcome.method_metrics = Some(MethodMetrics::Cvar {
        confidence: params.confidence,
        var,
        cvar,
        scenarios: scenarios.len(),
        source: params.scenarios.label().to_string(),
    });
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Core routines
// ---------------------------------------------------------------------------

fn load_scenarios(problem: &Problem<'_>, source: &ScenarioSource) -> EngineResult<Vec<Vec<f64>>> {
    match source {
        ScenarioSource::Historical => {
            if problem.stats.scenario_returns.is_empty() {
                return Err(EngineError::data(
                    "scenario_returns",
                    "Historical CVaR needs a return history",
                ));
            }
            Ok(problem.stats.scenario_returns.clone())
        }
        ScenarioSource::Simulated {
            n_paths,
            horizon_years,
            seed,
        } => {
            let config = SimulationConfig {
                n_paths: *n_paths,
                horizon_years: *horizon_years,
                seed: *seed,
                ..SimulationConfig::default()
            };
            problem.simulator.simulate_asset_returns(
                &config,
                &problem.stats.expected_returns,
                &problem.stats.covariance,
            )
        }
    }
}

fn build_program(problem: &Problem<'_>, scenarios: &[Vec<f64>], params: &CvarParams) -> LinearProgram {
    let set = problem.set;
    let n = set.n_assets();
    let s_count = scenarios.len();
    let zeta = n;
    let u = n + 1;
    let with_trades = set.turnover.is_some();
    let n_vars = u + s_count + if with_trades { n } else { 0 };

    let mut objective = vec![0.0; n_vars];
    objective[zeta] = 1.0;
    let tail = 1.0 / ((1.0 - params.confidence) * s_count as f64);
    for c in objective.iter_mut().skip(u).take(s_count) {
        *c = tail;
    }
    let mut lp = LinearProgram::minimize(objective);
    lp.free_variable(zeta);

    for (s, r) in scenarios.iter().enumerate() {
        // u_s + r_s'x + zeta >= -r_s'lower
        let mut terms: Vec<(usize, f64)> = Vec::with_capacity(n + 2);
        terms.push((u + s, 1.0));
        terms.push((zeta, 1.0));
        terms.extend(r.iter().enumerate().map(|(i, ri)| (i, *ri)));
        let base: f64 = r.iter().zip(set.lower.iter()).map(|(ri, li)| ri * li).sum();
        lp.add_sparse_row(&terms, RowKind::Ge, -base);
    }

    if let Some(target) = params.min_return {
        let mu = &problem.stats.expected_returns;
        let terms: Vec<(usize, f64)> = mu.iter().enumerate().map(|(i, m)| (i, *m)).collect();
        let base: f64 = mu.iter().zip(set.lower.iter()).map(|(m, l)| m * l).sum();
        lp.add_sparse_row(&terms, RowKind::Ge, target - base);
    }

    let layout = LpLayout {
        x: 0,
        trades: with_trades.then_some(u + s_count),
    };
    append_constraint_rows(set, &mut lp, layout, true, true);
    lp
}

/// Feasible stand-in when the program gives no usable optimum.
fn fallback(problem: &Problem<'_>, status: SolveStatus, iterations: usize, reason: String) -> MethodOutcome {
    let weights = match &problem.set.anchor {
        Some(anchor) => anchor.clone(),
        None => problem.set.repair(&problem.set.reference_weights()),
    };
    MethodOutcome {
        weights,
        status,
        iterations,
        reason: Some(reason),
        method_metrics: None,
        warnings: Vec::new(),
    }
}
