//! Projected gradient descent over a `ConstraintSet`.
//!
//! Every iterate is projected onto the position, budget and sector
//! constraints. ESG and turnover limits enter the objective as a quadratic
//! penalty and are enforced exactly by a final repair pass.

use std::time::Instant;
use tracing::debug;

use super::state::SolveStatus;
use super::SolverParams;
use crate::constraints::{turnover_between, ConstraintSet};
use crate::math::{max_abs_diff, vec_dot};

const INITIAL_STEP: f64 = 1.0;
const MAX_STEP: f64 = 1e6;
const MIN_STEP: f64 = 1e-14;
const STEP_GROWTH: f64 = 2.0;
const STEP_SHRINK: f64 = 0.5;

/// Outcome of a projected gradient run.
#[derive(Debug, Clone)]
pub struct Descent {
    pub weights: Vec<f64>,
    /// Objective (penalty included) at `weights` before the final repair.
    pub objective: f64,
    pub iterations: usize,
    pub status: SolveStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Incumbent {
    weights: Vec<f64>,
    value: f64,
    turnover: f64,
}

impl Incumbent {
    /// Strictly lower objective wins; within tolerance, lower turnover
    /// against the reference wins; otherwise the earlier iterate stays.
    fn improved_by(&self, value: f64, turnover: f64, tolerance: f64) -> bool {
        let tol = tolerance * (1.0 + self.value.abs());
        value < self.value - tol || ((value - self.value).abs() <= tol && turnover < self.turnover - 1e-12)
    }
}

/// Minimize `objective` over `set`, starting from the repaired `start`.
///
/// `objective` returns the value and gradient at a point. The best iterate
/// seen is returned even when the iteration budget or deadline runs out.
pub fn minimize<F>(
    set: &ConstraintSet,
    start: &[f64],
    params: &SolverParams,
    deadline: Option<Instant>,
    objective: F,
) -> Descent
where
    F: Fn(&[f64]) -> (f64, Vec<f64>),
{
    let eval = |w: &[f64]| -> (f64, Vec<f64>) {
        let (f, mut g) = objective(w);
        let (p, pg) = set.penalty(w);
        for (gi, pi) in g.iter_mut().zip(pg) {
            *gi += pi;
        }
        (f + p, g)
    };

    let reference = set.reference_weights();
    let mut w = set.repair(start);
    let (mut f, mut g) = eval(&w);
    let mut best = Incumbent {
        weights: w.clone(),
        value: f,
        turnover: turnover_between(&w, &reference),
    };
    let mut step = INITIAL_STEP;
    let x_tol = params.tolerance.sqrt();

    let finish = |best: Incumbent, iterations: usize, status: SolveStatus, reason: Option<String>| {
        debug!(iterations, ?status, objective = best.value, "projected gradient finished");
        Descent {
            weights: set.repair(&best.weights),
            objective: best.value,
            iterations,
            status,
            reason,
        }
    };

    for iteration in 1..=params.max_iterations {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return finish(
                best,
                iteration - 1,
                SolveStatus::TimedOut,
                Some("Solve deadline reached; returning best iterate".to_string()),
            );
        }

        let mut accepted = None;
        while step >= MIN_STEP {
            let trial: Vec<f64> = w.iter().zip(g.iter()).map(|(wi, gi)| wi - step * gi).collect();
            let candidate = set.project(&trial);
            let (f_new, g_new) = eval(&candidate);
            let d: Vec<f64> = candidate.iter().zip(w.iter()).map(|(a, b)| a - b).collect();
            let model = f + vec_dot(&g, &d) + vec_dot(&d, &d) / (2.0 * step);
            if f_new.is_finite() && f_new <= model + 1e-15 * (1.0 + f.abs()) {
                accepted = Some((candidate, f_new, g_new));
                break;
            }
            step *= STEP_SHRINK;
        }

        // No step decreases the local model: w is stationary on the feasible set.
        let Some((next, f_next, g_next)) = accepted else {
            return finish(best, iteration, SolveStatus::Converged, None);
        };

        let moved = max_abs_diff(&next, &w);
        let decrease = f - f_next;
        w = next;
        f = f_next;
        g = g_next;

        let turnover = turnover_between(&w, &reference);
        if best.improved_by(f, turnover, params.tolerance) {
            best = Incumbent {
                weights: w.clone(),
                value: f,
                turnover,
            };
        }

        if moved <= x_tol && decrease.abs() <= params.tolerance * (1.0 + f.abs()) {
            return finish(best, iteration, SolveStatus::Converged, None);
        }
        step = (step * STEP_GROWTH).min(MAX_STEP);
    }

    finish(
        best,
        params.max_iterations,
        SolveStatus::TimedOut,
        Some(format!(
            "Iteration budget of {} exhausted before convergence; returning best iterate",
            params.max_iterations
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::Constraints;
    use crate::math::{mat_vec_multiply, portfolio_variance};
    use crate::statistics::{build_statistics, StatisticsOptions};
    use crate::types::AssetSeries;

    fn set_for(constraints: &Constraints) -> ConstraintSet {
        let assets = vec![
            AssetSeries::new("A", vec![0.01, -0.02, 0.015, 0.003, 0.004]),
            AssetSeries::new("B", vec![0.002, 0.004, -0.001, 0.006, -0.003]),
            AssetSeries::new("C", vec![-0.01, 0.02, 0.0, 0.01, 0.005]),
        ];
        let stats = build_statistics(&assets, &StatisticsOptions::default()).unwrap();
        constraints.resolve(&stats).unwrap()
    }

    #[test]
    fn test_quadratic_reaches_known_minimum() {
        let set = set_for(&Constraints::default());
        let sigma = vec![
            vec![0.04, 0.0, 0.0],
            vec![0.0, 0.09, 0.0],
            vec![0.0, 0.0, 0.16],
        ];
        let out = minimize(&set, &[1.0, 0.0, 0.0], &SolverParams::default(), None, |w| {
            let g = mat_vec_multiply(&sigma, w).into_iter().map(|x| 2.0 * x).collect();
            (portfolio_variance(w, &sigma), g)
        });
        // Inverse-variance weights for a diagonal covariance.
        let inv: Vec<f64> = [25.0, 1.0 / 0.09, 1.0 / 0.16].to_vec();
        let total: f64 = inv.iter().sum();
        for (wi, vi) in out.weights.iter().zip(inv.iter()) {
            assert!((wi - vi / total).abs() < 1e-4, "{:?}", out.weights);
        }
        assert_eq!(out.status, SolveStatus::Converged);
    }

    #[test]
    fn test_iteration_budget_returns_best_feasible() {
        let set = set_for(&Constraints::default().with_bounds(0.0, 0.6));
        let params = SolverParams {
            max_iterations: 1,
            tolerance: 1e-15,
            ..SolverParams::default()
        };
        let out = minimize(&set, &[0.2, 0.3, 0.5], &params, None, |w| {
            (-w[0], vec![-1.0, 0.0, 0.0])
        });
        assert_eq!(out.status, SolveStatus::TimedOut);
        assert!(out.reason.is_some());
        assert!(set.check(&out.weights).is_satisfied());
    }

    #[test]
    fn test_flat_objective_prefers_low_turnover() {
        let set = set_for(&Constraints::default());
        let out = minimize(&set, &[0.8, 0.1, 0.1], &SolverParams::default(), None, |w| {
            (0.0, vec![0.0; w.len()])
        });
        // Flat everywhere: the start is kept, no drift toward anything else.
        assert!((out.weights[0] - 0.8).abs() < 1e-9);
        assert_eq!(out.status, SolveStatus::Converged);
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let set = set_for(&Constraints::default());
        let out = minimize(
            &set,
            &[0.5, 0.25, 0.25],
            &SolverParams::default(),
            Some(Instant::now()),
            |w| (w[0] * w[0], vec![2.0 * w[0], 0.0, 0.0]),
        );
        assert_eq!(out.status, SolveStatus::TimedOut);
        assert_eq!(out.iterations, 0);
        assert!((out.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
