//! Linear programs on the Clarabel interior-point solver.
//!
//! Programs are stated as `minimize c'x` subject to `a'x {<=, >=, =} b`.
//! Variables are non-negative unless marked free. Rows are handed to
//! Clarabel as `Ax + s = b` with equalities in a zero cone and everything
//! else, sign bounds included, in one non-negative cone.

use clarabel::algebra::*;
use clarabel::solver::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::EngineError;
use crate::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LpStatus {
    Optimal,
    Infeasible,
    Unbounded,
    IterationLimit,
    TimedOut,
    /// The solver stalled or lost accuracy before reaching a verdict.
    NumericalFailure,
}

#[derive(Debug, Clone)]
pub struct LpSolution {
    pub status: LpStatus,
    /// Primal values. Only guaranteed feasible when `status` is `Optimal`;
    /// on early stops this is the last interior iterate.
    pub x: Vec<f64>,
    pub objective: f64,
    pub iterations: usize,
}

impl LpSolution {
    pub fn is_optimal(&self) -> bool {
        self.status == LpStatus::Optimal
    }
}

#[derive(Debug, Clone)]
struct Row {
    /// Sparse `(variable, coefficient)` terms, one entry per variable.
    terms: Vec<(usize, f64)>,
    kind: RowKind,
    rhs: f64,
}

#[derive(Debug, Clone)]
pub struct LinearProgram {
    objective: Vec<f64>,
    free: Vec<bool>,
    rows: Vec<Row>,
}

impl LinearProgram {
    pub fn minimize(objective: Vec<f64>) -> Self {
        let n = objective.len();
        Self {
            objective,
            free: vec![false; n],
            rows: Vec::new(),
        }
    }

    pub fn n_vars(&self) -> usize {
        self.objective.len()
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Lift the `x_j >= 0` bound on variable `j`.
    pub fn free_variable(&mut self, j: usize) {
        self.free[j] = true;
    }

    pub fn add_row(&mut self, coeffs: Vec<f64>, kind: RowKind, rhs: f64) {
        debug_assert_eq!(coeffs.len(), self.n_vars());
        let terms: Vec<(usize, f64)> = coeffs.into_iter().enumerate().collect();
        self.add_sparse_row(&terms, kind, rhs);
    }

    /// Add a row from `(variable, coefficient)` pairs. Repeated variables are summed.
    pub fn add_sparse_row(&mut self, terms: &[(usize, f64)], kind: RowKind, rhs: f64) {
        let mut merged: Vec<(usize, f64)> = terms.to_vec();
        merged.sort_by_key(|&(j, _)| j);
        merged.dedup_by(|next, kept| {
            if next.0 == kept.0 {
                kept.1 += next.1;
                true
            } else {
                false
            }
        });
        merged.retain(|&(_, a)| a != 0.0);
        self.rows.push(Row {
            terms: merged,
            kind,
            rhs,
        });
    }

    /// Solve within `max_iterations` interior-point steps and before `deadline`.
    ///
    /// Solver verdicts come back as an `LpStatus`; only a program Clarabel
    /// refuses to set up is an error.
    pub fn solve(&self, max_iterations: usize, deadline: Option<Instant>) -> EngineResult<LpSolution> {
        let n = self.n_vars();
        let time_limit = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(LpSolution {
                        status: LpStatus::TimedOut,
                        x: vec![0.0; n],
                        objective: 0.0,
                        iterations: 0,
                    });
                }
                remaining.as_secs_f64()
            }
            None => f64::INFINITY,
        };

        // (row, col, value) triplets in cone order: equalities, then `<=` rows.
        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        let mut b: Vec<f64> = Vec::new();
        for row in self.rows.iter().filter(|r| r.kind == RowKind::Eq) {
            let r = b.len();
            triplets.extend(row.terms.iter().map(|&(j, a)| (r, j, a)));
            b.push(row.rhs);
        }
        let n_eq = b.len();
        for row in self.rows.iter().filter(|r| r.kind != RowKind::Eq) {
            let r = b.len();
            let sign = if row.kind == RowKind::Ge { -1.0 } else { 1.0 };
            triplets.extend(row.terms.iter().map(|&(j, a)| (r, j, sign * a)));
            b.push(sign * row.rhs);
        }
        for j in (0..n).filter(|&j| !self.free[j]) {
            let r = b.len();
            triplets.push((r, j, -1.0));
            b.push(0.0);
        }
        let m = b.len();

        let p = CscMatrix::new(n, n, vec![0; n + 1], Vec::new(), Vec::new());
        let a = csc_from_triplets(m, n, triplets);
        let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if m > n_eq {
            cones.push(NonnegativeConeT(m - n_eq));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(u32::try_from(max_iterations).unwrap_or(u32::MAX))
            .time_limit(time_limit)
            .verbose(false)
            .build()
            .map_err(|e| EngineError::numerical("linear program", format!("Invalid solver settings: {}", e)))?;

        let mut solver = DefaultSolver::new(&p, &self.objective, &a, &b, &cones, settings)
            .map_err(|e| EngineError::numerical("linear program", format!("Solver setup failed: {:?}", e)))?;
        solver.solve();

        let status = match solver.solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => LpStatus::Optimal,
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                LpStatus::Infeasible
            }
            SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => LpStatus::Unbounded,
            SolverStatus::MaxIterations => LpStatus::IterationLimit,
            SolverStatus::MaxTime => LpStatus::TimedOut,
            _ => LpStatus::NumericalFailure,
        };

        let x = solver.solution.x.clone();
        let objective = self.objective.iter().zip(x.iter()).map(|(c, v)| c * v).sum();
        Ok(LpSolution {
            status,
            x,
            objective,
            iterations: solver.solution.iterations as usize,
        })
    }
}

/// Column-compressed matrix from `(row, col, value)` triplets with unique positions.
fn csc_from_triplets(m: usize, n: usize, mut triplets: Vec<(usize, usize, f64)>) -> CscMatrix<f64> {
    triplets.sort_by(|x, y| (x.1, x.0).cmp(&(y.1, y.0)));
    let mut colptr = Vec::with_capacity(n + 1);
    let mut rowval = Vec::with_capacity(triplets.len());
    let mut nzval = Vec::with_capacity(triplets.len());
    colptr.push(0);
    let mut next = 0;
    for col in 0..n {
        while next < triplets.len() && triplets[next].1 == col {
            rowval.push(triplets[next].0);
            nzval.push(triplets[next].2);
            next += 1;
        }
        colptr.push(rowval.len());
    }
    CscMatrix::new(m, n, colptr, rowval, nzval)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_ITER: usize = 200;
    const TOL: f64 = 1e-6;

    #[test]
    fn test_textbook_maximization() {
        // max x + y  s.t. x + 2y <= 4, 3x + y <= 6
        let mut lp = LinearProgram::minimize(vec![-1.0, -1.0]);
        lp.add_row(vec![1.0, 2.0], RowKind::Le, 4.0);
        lp.add_row(vec![3.0, 1.0], RowKind::Le, 6.0);
        let sol = lp.solve(MAX_ITER, None).unwrap();
        assert!(sol.is_optimal());
        assert!((sol.x[0] - 1.6).abs() < TOL);
        assert!((sol.x[1] - 1.2).abs() < TOL);
        assert!((sol.objective + 2.8).abs() < TOL);
    }

    #[test]
    fn test_equality_and_lower_bound_rows() {
        // min x + y  s.t. x + y >= 2, x - y = 0
        let mut lp = LinearProgram::minimize(vec![1.0, 1.0]);
        lp.add_row(vec![1.0, 1.0], RowKind::Ge, 2.0);
        lp.add_row(vec![1.0, -1.0], RowKind::Eq, 0.0);
        let sol = lp.solve(MAX_ITER, None).unwrap();
        assert!(sol.is_optimal());
        assert!((sol.x[0] - 1.0).abs() < TOL);
        assert!((sol.x[1] - 1.0).abs() < TOL);
    }

    #[test]
    fn test_free_variable_goes_negative() {
        // min z  s.t. z >= -3, z free
        let mut lp = LinearProgram::minimize(vec![1.0]);
        lp.free_variable(0);
        lp.add_row(vec![1.0], RowKind::Ge, -3.0);
        let sol = lp.solve(MAX_ITER, None).unwrap();
        assert!(sol.is_optimal());
        assert!((sol.x[0] + 3.0).abs() < TOL);
    }

    #[test]
    fn test_repeated_terms_are_summed() {
        // min x  s.t. (0.5 + 0.5) x >= 2
        let mut lp = LinearProgram::minimize(vec![1.0]);
        lp.add_sparse_row(&[(0, 0.5), (0, 0.5)], RowKind::Ge, 2.0);
        let sol = lp.solve(MAX_ITER, None).unwrap();
        assert!((sol.x[0] - 2.0).abs() < TOL);
    }

    #[test]
    fn test_infeasible_program() {
        let mut lp = LinearProgram::minimize(vec![1.0]);
        lp.add_row(vec![1.0], RowKind::Le, 1.0);
        lp.add_row(vec![1.0], RowKind::Ge, 2.0);
        assert_eq!(lp.solve(MAX_ITER, None).unwrap().status, LpStatus::Infeasible);
    }

    #[test]
    fn test_unbounded_program() {
        let mut lp = LinearProgram::minimize(vec![-1.0]);
        lp.add_row(vec![1.0], RowKind::Ge, 1.0);
        assert_eq!(lp.solve(MAX_ITER, None).unwrap().status, LpStatus::Unbounded);
    }

    #[test]
    fn test_iteration_limit_reported() {
        // x0 + x1 = 1 with both legs at least 0.3
        let mut lp = LinearProgram::minimize(vec![1.0, 0.0]);
        lp.add_row(vec![1.0, 1.0], RowKind::Eq, 1.0);
        lp.add_row(vec![1.0, 0.0], RowKind::Ge, 0.3);
        lp.add_row(vec![0.0, 1.0], RowKind::Ge, 0.3);
        let sol = lp.solve(1, None).unwrap();
        assert_eq!(sol.status, LpStatus::IterationLimit);
        assert_eq!(sol.x.len(), 2);
    }

    #[test]
    fn test_expired_deadline_skips_the_solve() {
        let mut lp = LinearProgram::minimize(vec![1.0]);
        lp.add_row(vec![1.0], RowKind::Ge, 1.0);
        let sol = lp.solve(MAX_ITER, Some(Instant::now())).unwrap();
        assert_eq!(sol.status, LpStatus::TimedOut);
        assert_eq!(sol.iterations, 0);
    }
}
