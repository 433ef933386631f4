//! Linear-program encodings of a `ConstraintSet`.
//!
//! Weights enter programs shifted by their lower bounds, `w = lower + x`
//! with `x >= 0`, so short positions keep non-negative program variables.

use super::ConstraintSet;
use crate::error::EngineError;
use crate::lp::{LinearProgram, LpStatus, RowKind};
use crate::EngineResult;

const ANCHOR_MAX_ITERATIONS: usize = 200;

/// Where the shifted weights (and optional turnover slacks) live in a program.
#[derive(Debug, Clone, Copy)]
pub struct LpLayout {
    /// Offset of the `n` shifted weight variables.
    pub x: usize,
    /// Offset of the `n` absolute-trade variables, needed for turnover rows.
    pub trades: Option<usize>,
}

/// Append box, budget and sector rows, plus ESG and turnover rows when requested.
pub fn append_constraint_rows(
    set: &ConstraintSet,
    lp: &mut LinearProgram,
    layout: LpLayout,
    include_esg: bool,
    include_turnover: bool,
) {
    let n = set.n_assets();
    let lower_sum: f64 = set.lower.iter().sum();

    for i in 0..n {
        let width = set.upper[i] - set.lower[i];
        lp.add_sparse_row(&[(layout.x + i, 1.0)], RowKind::Le, width);
    }

    let all: Vec<(usize, f64)> = (0..n).map(|i| (layout.x + i, 1.0)).collect();
    lp.add_sparse_row(&all, RowKind::Eq, set.budget - lower_sum);

    for s in &set.sectors {
        let terms: Vec<(usize, f64)> = s.members.iter().map(|&i| (layout.x + i, 1.0)).collect();
        let base: f64 = s.members.iter().map(|&i| set.lower[i]).sum();
        lp.add_sparse_row(&terms, RowKind::Ge, s.min - base);
        lp.add_sparse_row(&terms, RowKind::Le, s.max - base);
    }

    if include_esg {
        if let Some(esg) = &set.esg {
            let terms: Vec<(usize, f64)> = (0..n).map(|i| (layout.x + i, esg.scores[i])).collect();
            let base: f64 = (0..n).map(|i| esg.scores[i] * set.lower[i]).sum();
            lp.add_sparse_row(&terms, RowKind::Ge, esg.min * set.budget - base);
        }
    }

    if include_turnover {
        if let (Some(t), Some(off)) = (&set.turnover, layout.trades) {
            for i in 0..n {
                let gap = set.lower[i] - set.holdings[i];
                // trade_i >= |lower_i + x_i - h_i|
                lp.add_sparse_row(&[(off + i, 1.0), (layout.x + i, -1.0)], RowKind::Ge, gap);
                lp.add_sparse_row(&[(off + i, 1.0), (layout.x + i, 1.0)], RowKind::Ge, -gap);
            }
            let terms: Vec<(usize, f64)> = (0..n).map(|i| (off + i, 0.5)).collect();
            lp.add_sparse_row(&terms, RowKind::Le, t.max - t.fixed);
        }
    }
}

fn anchor_program(set: &ConstraintSet, esg: bool, turnover: bool) -> LinearProgram {
    let n = set.n_assets();
    let with_trades = turnover && set.turnover.is_some();
    let n_vars = if with_trades { 2 * n } else { n };
    let mut objective = vec![0.0; n_vars];
    if with_trades {
        for c in objective.iter_mut().skip(n) {
            *c = 0.5;
        }
    } else if let Some(e) = set.esg.as_ref().filter(|_| esg) {
        for (c, s) in objective.iter_mut().zip(e.scores.iter()) {
            *c = -s / 100.0;
        }
    }
    let mut lp = LinearProgram::minimize(objective);
    let layout = LpLayout {
        x: 0,
        trades: with_trades.then_some(n),
    };
    append_constraint_rows(set, &mut lp, layout, esg, turnover);
    lp
}

/// A weight vector satisfying every constraint in `set`, used as the fixed
/// end of the repair line search. Fails with the name of the first
/// constraint that makes the set empty.
pub fn find_anchor(set: &ConstraintSet) -> EngineResult<Vec<f64>> {
    anchor_within(set, ANCHOR_MAX_ITERATIONS)
}

pub(crate) fn anchor_within(set: &ConstraintSet, max_iterations: usize) -> EngineResult<Vec<f64>> {
    let solution = anchor_program(set, true, true).solve(max_iterations, None)?;
    match solution.status {
        LpStatus::Optimal | LpStatus::IterationLimit => {
            let anchor: Vec<f64> = (0..set.n_assets())
                .map(|i| {
                    let width = set.upper[i] - set.lower[i];
                    set.lower[i] + solution.x[i].clamp(0.0, width.max(0.0))
                })
                .collect();
            // An unfinished interior-point iterate is only usable if it already fits.
            let report = set.check(&anchor);
            if report.is_satisfied() {
                Ok(anchor)
            } else {
                Err(EngineError::numerical(
                    "constraint feasibility",
                    format!(
                        "Feasibility program ended with {:?} at a point violating {}",
                        solution.status,
                        report
                            .first_violation()
                            .map(|v| v.constraint.as_str())
                            .unwrap_or("a constraint")
                    ),
                ))
            }
        }
        LpStatus::Infeasible => {
            let culprit = if set.esg.is_some() && is_infeasible(set, true, false, max_iterations)? {
                "min_esg_score"
            } else if set.turnover.is_some() && is_infeasible(set, false, true, max_iterations)? {
                "turnover"
            } else {
                "min_esg_score+turnover"
            };
            Err(EngineError::constraint(
                culprit,
                "No weight vector satisfies this limit together with the position, budget and sector constraints",
            ))
        }
        LpStatus::Unbounded | LpStatus::TimedOut | LpStatus::NumericalFailure => {
            Err(EngineError::numerical(
                "constraint feasibility",
                format!("Feasibility program ended with {:?}", solution.status),
            ))
        }
    }
}

fn is_infeasible(set: &ConstraintSet, esg: bool, turnover: bool, max_iterations: usize) -> EngineResult<bool> {
    let solution = anchor_program(set, esg, turnover).solve(max_iterations, None)?;
    Ok(solution.status == LpStatus::Infeasible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::Constraints;
    use crate::statistics::{build_statistics, StatisticsOptions};
    use crate::types::{AssetSeries, PortfolioWeights};

    fn stats() -> crate::statistics::MarketStatistics {
        let assets = vec![
            AssetSeries::new("A", vec![0.01, -0.02, 0.015, 0.003]).with_esg_score(90.0),
            AssetSeries::new("B", vec![0.002, 0.004, -0.001, 0.006]).with_esg_score(50.0),
            AssetSeries::new("C", vec![-0.01, 0.02, 0.0, 0.01]).with_esg_score(10.0),
        ];
        build_statistics(&assets, &StatisticsOptions::default()).unwrap()
    }

    #[test]
    fn test_anchor_meets_esg_floor() {
        let set = Constraints::default()
            .with_min_esg(70.0)
            .resolve(&stats())
            .unwrap();
        let anchor = set.anchor.clone().unwrap();
        assert!(set.check(&anchor).is_satisfied());
        assert!(set.esg_score(&anchor).unwrap() >= 70.0 - 1e-6);
    }

    #[test]
    fn test_esg_and_turnover_conflict() {
        let mut holdings = PortfolioWeights::new();
        holdings.insert("C".into(), 1.0);
        // Reaching ESG 80 from an all-C book needs far more than 10% turnover.
        let result = Constraints::default()
            .with_min_esg(80.0)
            .with_holdings(holdings)
            .with_max_turnover(0.1)
            .resolve(&stats());
        match result {
            Err(EngineError::Constraint { constraint, .. }) => {
                assert_eq!(constraint, "min_esg_score+turnover")
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_turnover_anchor_stays_near_holdings() {
        let mut holdings = PortfolioWeights::new();
        holdings.insert("A".into(), 0.2);
        holdings.insert("B".into(), 0.3);
        holdings.insert("C".into(), 0.5);
        let set = Constraints::default()
            .with_holdings(holdings)
            .with_max_turnover(0.05)
            .resolve(&stats())
            .unwrap();
        let anchor = set.anchor.clone().unwrap();
        assert!(set.turnover(&anchor) <= 0.05 + 1e-6);
    }

    #[test]
    fn test_capped_anchor_is_feasible_or_rejected() {
        let set = Constraints::default()
            .with_bounds(0.3, 1.0)
            .with_min_esg(50.0)
            .resolve(&stats())
            .unwrap();
        for max_iterations in [1, 2, 5] {
            match anchor_within(&set, max_iterations) {
                Ok(anchor) => assert!(
                    set.check(&anchor).is_satisfied(),
                    "{} iterations gave {:?}",
                    max_iterations,
                    anchor
                ),
                Err(e) => assert!(matches!(e, EngineError::Numerical { .. }), "{:?}", e),
            }
        }
        let anchor = find_anchor(&set).unwrap();
        assert!(set.check(&anchor).is_satisfied());
    }
}
