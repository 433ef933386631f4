pub mod linear;
pub mod projection;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

use crate::error::EngineError;
use crate::statistics::MarketStatistics;
use crate::types::{with_metadata, ComputationOutput, PortfolioWeights};
use crate::EngineResult;

const BOUND_TOLERANCE: f64 = 1e-6;
const BUDGET_TOLERANCE: f64 = 1e-5;
const ESG_TOLERANCE: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Inclusive `[min, max]` range on a weight or a sum of weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightRange {
    pub min: f64,
    pub max: f64,
}

impl WeightRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Caller-facing constraint set, keyed by symbol and sector name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Minimum weight per position. Negative values require `allow_short`.
    pub min_weight: f64,
    /// Maximum weight per position.
    pub max_weight: f64,
    /// Per-symbol overrides of `min_weight`/`max_weight`.
    pub asset_bounds: BTreeMap<String, WeightRange>,
    /// Total weight allowed per sector tag.
    pub sector_limits: BTreeMap<String, WeightRange>,
    /// Minimum weighted-average ESG score (0-100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_esg_score: Option<f64>,
    /// Maximum one-way turnover against `current_holdings`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turnover: Option<f64>,
    pub current_holdings: PortfolioWeights,
    /// Required sum of weights.
    pub leverage: f64,
    pub allow_short: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            min_weight: 0.0,
            max_weight: 1.0,
            asset_bounds: BTreeMap::new(),
            sector_limits: BTreeMap::new(),
            min_esg_score: None,
            max_turnover: None,
            current_holdings: BTreeMap::new(),
            leverage: 1.0,
            allow_short: false,
        }
    }
}

impl Constraints {
    pub fn long_only() -> Self {
        Self::default()
    }

    pub fn with_bounds(mut self, min_weight: f64, max_weight: f64) -> Self {
        self.min_weight = min_weight;
        self.max_weight = max_weight;
        self
    }

    pub fn with_sector_limit(mut self, sector: impl Into<String>, min: f64, max: f64) -> Self {
        self.sector_limits
            .insert(sector.into(), WeightRange::new(min, max));
        self
    }

    pub fn with_holdings(mut self, holdings: PortfolioWeights) -> Self {
        self.current_holdings = holdings;
        self
    }

    pub fn with_max_turnover(mut self, max_turnover: f64) -> Self {
        self.max_turnover = Some(max_turnover);
        self
    }

    pub fn with_min_esg(mut self, score: f64) -> Self {
        self.min_esg_score = Some(score);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorBound {
    pub name: String,
    pub members: Vec<usize>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsgBound {
    /// Scores aligned to the universe; missing scores count as 0.
    pub scores: Vec<f64>,
    pub min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnoverBound {
    pub max: f64,
    /// Turnover forced by holdings outside the universe (they are sold in full).
    pub fixed: f64,
}

/// Constraints resolved against one universe, index-aligned with its symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub symbols: Vec<String>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub budget: f64,
    pub long_only: bool,
    pub sectors: Vec<SectorBound>,
    pub esg: Option<EsgBound>,
    pub turnover: Option<TurnoverBound>,
    /// Current holdings aligned to the universe, 0 where absent.
    pub holdings: Vec<f64>,
    pub has_holdings: bool,
    /// A point satisfying every constraint, present when ESG or turnover limits apply.
    pub anchor: Option<Vec<f64>>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Which rule failed, e.g. `max_weight:AAPL`, `sector:Tech`, `turnover`.
    pub constraint: String,
    pub detail: String,
    /// Size of the breach in the constraint's own units.
    pub amount: f64,
}

/// Every violated rule, in the fixed order bounds, budget, sectors, ESG, turnover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintReport {
    pub violations: Vec<ConstraintViolation>,
}

impl ConstraintReport {
    pub fn is_satisfied(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn first_violation(&self) -> Option<&ConstraintViolation> {
        self.violations.first()
    }
}

/// CLI/serde input for a standalone constraint check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintCheckInput {
    pub assets: Vec<crate::types::AssetSeries>,
    #[serde(default)]
    pub constraints: Constraints,
    pub weights: PortfolioWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintCheckOutput {
    pub constraints_satisfied: bool,
    pub report: ConstraintReport,
    pub turnover: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esg_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Resolution and feasibility
// ---------------------------------------------------------------------------

impl Constraints {
    /// Resolve against a universe and prove the set is non-empty.
    ///
    /// Structural conflicts (bounds that cannot meet the budget, sector
    /// ranges that exclude each other, unattainable ESG or turnover limits)
    /// fail with `EngineError::Constraint` naming the first conflicting rule.
    pub fn resolve(&self, stats: &MarketStatistics) -> EngineResult<ConstraintSet> {
        self.validate_parameters()?;

        let n = stats.n_assets();
        let mut warnings = Vec::new();

        let mut lower = vec![self.min_weight; n];
        let mut upper = vec![self.max_weight; n];
        for (symbol, range) in &self.asset_bounds {
            match stats.index_of(symbol) {
                Some(i) => {
                    lower[i] = range.min;
                    upper[i] = range.max;
                }
                None => warnings.push(format!(
                    "Bounds given for '{}', which is not in the universe",
                    symbol
                )),
            }
        }
        for i in 0..n {
            if !self.allow_short && lower[i] < 0.0 {
                return Err(EngineError::config(
                    format!("asset_bounds.{}", stats.symbols[i]),
                    "Negative minimum weight requires allow_short",
                ));
            }
            if lower[i] > upper[i] {
                return Err(EngineError::constraint(
                    format!("position_bounds:{}", stats.symbols[i]),
                    format!("min {} exceeds max {}", lower[i], upper[i]),
                ));
            }
        }

        let budget = self.leverage;
        let lower_sum: f64 = lower.iter().sum();
        let upper_sum: f64 = upper.iter().sum();
        if lower_sum > budget + BUDGET_TOLERANCE {
            return Err(EngineError::constraint(
                "budget",
                format!(
                    "Minimum weights sum to {:.6}, above the required total {:.6}",
                    lower_sum, budget
                ),
            ));
        }
        if upper_sum < budget - BUDGET_TOLERANCE {
            return Err(EngineError::constraint(
                "budget",
                format!(
                    "Maximum weights sum to {:.6}, below the required total {:.6}",
                    upper_sum, budget
                ),
            ));
        }

        let sectors = self.resolve_sectors(stats, &lower, &upper, budget, &mut warnings)?;

        let esg = match self.min_esg_score {
            Some(min) => {
                if stats.esg_scores.iter().any(Option::is_none) {
                    warnings.push("Assets without an ESG score count as 0".to_string());
                }
                Some(EsgBound {
                    scores: stats.esg_scores.iter().map(|s| s.unwrap_or(0.0)).collect(),
                    min,
                })
            }
            None => None,
        };

        let mut holdings = vec![0.0; n];
        let mut outside = 0.0;
        for (symbol, h) in &self.current_holdings {
            match stats.index_of(symbol) {
                Some(i) => holdings[i] = *h,
                None => outside += h.abs(),
            }
        }
        let fixed = 0.5 * outside;
        let turnover = match self.max_turnover {
            Some(max) => {
                if fixed > max + BOUND_TOLERANCE {
                    return Err(EngineError::constraint(
                        "turnover",
                        format!(
                            "Selling holdings outside the universe alone costs {:.6} turnover, above the limit {:.6}",
                            fixed, max
                        ),
                    ));
                }
                Some(TurnoverBound { max, fixed })
            }
            None => None,
        };

        let mut set = ConstraintSet {
            symbols: stats.symbols.clone(),
            lower,
            upper,
            budget,
            long_only: !self.allow_short,
            sectors,
            esg,
            turnover,
            holdings,
            has_holdings: !self.current_holdings.is_empty(),
            anchor: None,
            warnings,
        };

        if set.esg.is_some() || set.turnover.is_some() {
            set.anchor = Some(linear::find_anchor(&set)?);
        }

        debug!(
            n_assets = n,
            sectors = set.sectors.len(),
            esg = set.esg.is_some(),
            turnover = set.turnover.is_some(),
            "resolved constraint set"
        );
        Ok(set)
    }

    fn validate_parameters(&self) -> EngineResult<()> {
        if !self.leverage.is_finite() || self.leverage <= 0.0 {
            return Err(EngineError::config("leverage", "Must be positive"));
        }
        if !self.min_weight.is_finite() || !self.max_weight.is_finite() {
            return Err(EngineError::config("min_weight/max_weight", "Must be finite"));
        }
        if !self.allow_short && self.min_weight < 0.0 {
            return Err(EngineError::config(
                "min_weight",
                "Negative minimum weight requires allow_short",
            ));
        }
        if self.min_weight > self.max_weight {
            return Err(EngineError::constraint(
                "position_bounds",
                format!(
                    "min_weight {} exceeds max_weight {}",
                    self.min_weight, self.max_weight
                ),
            ));
        }
        for (name, range) in &self.sector_limits {
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(EngineError::config(
                    format!("sector_limits.{}", name),
                    "Must be finite",
                ));
            }
            if range.min > range.max {
                return Err(EngineError::constraint(
                    format!("sector:{}", name),
                    format!("min {} exceeds max {}", range.min, range.max),
                ));
            }
        }
        if let Some(esg) = self.min_esg_score {
            if !(0.0..=100.0).contains(&esg) {
                return Err(EngineError::config("min_esg_score", "Must lie in [0, 100]"));
            }
        }
        if let Some(t) = self.max_turnover {
            if !t.is_finite() || t < 0.0 {
                return Err(EngineError::config("max_turnover", "Must be non-negative"));
            }
        }
        if self.current_holdings.values().any(|h| !h.is_finite()) {
            return Err(EngineError::data("current_holdings", "Weights must be finite"));
        }
        Ok(())
    }

    fn resolve_sectors(
        &self,
        stats: &MarketStatistics,
        lower: &[f64],
        upper: &[f64],
        budget: f64,
        warnings: &mut Vec<String>,
    ) -> EngineResult<Vec<SectorBound>> {
        let n = stats.n_assets();
        let mut sectors = Vec::new();
        let mut assigned = vec![false; n];

        for (name, range) in &self.sector_limits {
            let members: Vec<usize> = (0..n)
                .filter(|&i| stats.sectors[i].as_deref() == Some(name.as_str()))
                .collect();
            if members.is_empty() {
                if range.min > BOUND_TOLERANCE {
                    return Err(EngineError::constraint(
                        format!("sector:{}", name),
                        format!("Requires at least {} but no asset carries the tag", range.min),
                    ));
                }
                warnings.push(format!("Sector limit '{}' matches no asset", name));
                continue;
            }
            let lo: f64 = members.iter().map(|&i| lower[i]).sum();
            let hi: f64 = members.iter().map(|&i| upper[i]).sum();
            if lo > range.max + BOUND_TOLERANCE || hi < range.min - BOUND_TOLERANCE {
                return Err(EngineError::constraint(
                    format!("sector:{}", name),
                    format!(
                        "Position bounds allow [{:.6}, {:.6}] but the sector range is [{:.6}, {:.6}]",
                        lo, hi, range.min, range.max
                    ),
                ));
            }
            for &i in &members {
                assigned[i] = true;
            }
            sectors.push(SectorBound {
                name: name.clone(),
                members,
                min: range.min,
                max: range.max,
            });
        }

        // Sectors are disjoint, so box + budget + sectors is feasible exactly
        // when the budget lies between the summed attainable group ranges.
        let free_lo: f64 = (0..n).filter(|&i| !assigned[i]).map(|i| lower[i]).sum();
        let free_hi: f64 = (0..n).filter(|&i| !assigned[i]).map(|i| upper[i]).sum();
        let (mut min_total, mut max_total) = (free_lo, free_hi);
        for s in &sectors {
            let lo: f64 = s.members.iter().map(|&i| lower[i]).sum();
            let hi: f64 = s.members.iter().map(|&i| upper[i]).sum();
            min_total += lo.max(s.min);
            max_total += hi.min(s.max);
        }
        if min_total > budget + BUDGET_TOLERANCE || max_total < budget - BUDGET_TOLERANCE {
            return Err(EngineError::constraint(
                "sector_limits",
                format!(
                    "Sector ranges admit totals in [{:.6}, {:.6}], which excludes {:.6}",
                    min_total, max_total, budget
                ),
            ));
        }
        Ok(sectors)
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

impl ConstraintSet {
    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    /// One-way turnover `0.5 * sum |w - h|`, including holdings outside the universe.
    pub fn turnover(&self, w: &[f64]) -> f64 {
        let fixed = self.turnover.as_ref().map_or(0.0, |t| t.fixed);
        turnover_between(w, &self.holdings) + fixed
    }

    /// Weighted-average ESG score, if an ESG limit applies.
    pub fn esg_score(&self, w: &[f64]) -> Option<f64> {
        self.esg
            .as_ref()
            .map(|e| crate::math::vec_dot(w, &e.scores) / self.budget)
    }

    /// Reference point for turnover tie-breaks: holdings, or equal weights without them.
    pub fn reference_weights(&self) -> Vec<f64> {
        if self.has_holdings {
            self.holdings.clone()
        } else {
            crate::math::equal_weights(self.n_assets(), self.budget)
        }
    }

    pub fn check(&self, w: &[f64]) -> ConstraintReport {
        let mut violations = Vec::new();

        for (i, &wi) in w.iter().enumerate() {
            if wi < self.lower[i] - BOUND_TOLERANCE {
                violations.push(ConstraintViolation {
                    constraint: format!("min_weight:{}", self.symbols[i]),
                    detail: format!("weight {:.6} below minimum {:.6}", wi, self.lower[i]),
                    amount: self.lower[i] - wi,
                });
            }
            if wi > self.upper[i] + BOUND_TOLERANCE {
                violations.push(ConstraintViolation {
                    constraint: format!("max_weight:{}", self.symbols[i]),
                    detail: format!("weight {:.6} above maximum {:.6}", wi, self.upper[i]),
                    amount: wi - self.upper[i],
                });
            }
        }

        let total: f64 = w.iter().sum();
        if (total - self.budget).abs() > BUDGET_TOLERANCE {
            violations.push(ConstraintViolation {
                constraint: "budget".to_string(),
                detail: format!("weights sum to {:.8}, expected {:.8}", total, self.budget),
                amount: (total - self.budget).abs(),
            });
        }

        for s in &self.sectors {
            let sum: f64 = s.members.iter().map(|&i| w[i]).sum();
            if sum < s.min - BOUND_TOLERANCE || sum > s.max + BOUND_TOLERANCE {
                let amount = if sum < s.min { s.min - sum } else { sum - s.max };
                violations.push(ConstraintViolation {
                    constraint: format!("sector:{}", s.name),
                    detail: format!(
                        "sector weight {:.6} outside [{:.6}, {:.6}]",
                        sum, s.min, s.max
                    ),
                    amount,
                });
            }
        }

        if let (Some(esg), Some(score)) = (&self.esg, self.esg_score(w)) {
            if score < esg.min - ESG_TOLERANCE {
                violations.push(ConstraintViolation {
                    constraint: "min_esg_score".to_string(),
                    detail: format!("portfolio ESG {:.4} below minimum {:.4}", score, esg.min),
                    amount: esg.min - score,
                });
            }
        }

        if let Some(t) = &self.turnover {
            let turnover = self.turnover(w);
            if turnover > t.max + BOUND_TOLERANCE {
                violations.push(ConstraintViolation {
                    constraint: "turnover".to_string(),
                    detail: format!("turnover {:.6} above limit {:.6}", turnover, t.max),
                    amount: turnover - t.max,
                });
            }
        }

        ConstraintReport { violations }
    }

    /// Check a symbol-keyed weight map; symbols outside the universe are violations.
    pub fn check_map(&self, weights: &PortfolioWeights) -> ConstraintReport {
        let w: Vec<f64> = self
            .symbols
            .iter()
            .map(|s| weights.get(s).copied().unwrap_or(0.0))
            .collect();
        let mut report = self.check(&w);
        let mut unknown: Vec<ConstraintViolation> = weights
            .iter()
            .filter(|(s, v)| !self.symbols.contains(s) && v.abs() > BOUND_TOLERANCE)
            .map(|(s, v)| ConstraintViolation {
                constraint: format!("universe:{}", s),
                detail: format!("weight {:.6} on a symbol outside the universe", v),
                amount: v.abs(),
            })
            .collect();
        unknown.append(&mut report.violations);
        report.violations = unknown;
        report
    }
}

pub fn turnover_between(w: &[f64], holdings: &[f64]) -> f64 {
    0.5 * w
        .iter()
        .zip(holdings.iter())
        .map(|(a, b)| (a - b).abs())
        .sum::<f64>()
}

/// Resolve `constraints` for the universe in `input` and check `input.weights`.
pub fn run_check_constraints(
    input: &ConstraintCheckInput,
) -> EngineResult<ComputationOutput<ConstraintCheckOutput>> {
    let start = Instant::now();
    let stats = crate::statistics::build_statistics(
        &input.assets,
        &crate::statistics::StatisticsOptions::default(),
    )?;
    let set = input.constraints.resolve(&stats)?;
    let report = set.check_map(&input.weights);
    let w: Vec<f64> = set
        .symbols
        .iter()
        .map(|s| input.weights.get(s).copied().unwrap_or(0.0))
        .collect();

    let output = ConstraintCheckOutput {
        constraints_satisfied: report.is_satisfied(),
        turnover: set.turnover(&w),
        esg_score: set.esg_score(&w),
        report,
    };
    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Constraint validation",
        &serde_json::json!({
            "n_assets": set.n_assets(),
            "budget": set.budget,
            "sectors": set.sectors.len(),
        }),
        set.warnings,
        elapsed,
        output,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::{build_statistics, StatisticsOptions};
    use crate::types::AssetSeries;

    fn universe() -> MarketStatistics {
        let assets = vec![
            AssetSeries::new("A", vec![0.010, -0.004, 0.007, 0.012, -0.009, 0.003])
                .with_sector("Tech")
                .with_esg_score(80.0),
            AssetSeries::new("B", vec![0.004, 0.001, -0.003, 0.006, 0.002, -0.001])
                .with_sector("Tech")
                .with_esg_score(40.0),
            AssetSeries::new("C", vec![-0.002, 0.005, 0.001, -0.004, 0.003, 0.002])
                .with_sector("Energy")
                .with_esg_score(20.0),
        ];
        build_statistics(&assets, &StatisticsOptions::default()).unwrap()
    }

    #[test]
    fn test_default_constraints_resolve() {
        let set = Constraints::default().resolve(&universe()).unwrap();
        assert_eq!(set.lower, vec![0.0; 3]);
        assert_eq!(set.upper, vec![1.0; 3]);
        assert!(set.long_only);
        assert!(set.anchor.is_none());
    }

    #[test]
    fn test_sector_min_above_max_names_sector() {
        let c = Constraints::default().with_sector_limit("Tech", 0.6, 0.4);
        match c.resolve(&universe()) {
            Err(EngineError::Constraint { constraint, .. }) => assert_eq!(constraint, "sector:Tech"),
            other => panic!("expected constraint error, got {:?}", other),
        }
    }

    #[test]
    fn test_bounds_that_cannot_reach_budget() {
        let c = Constraints::default().with_bounds(0.0, 0.2);
        match c.resolve(&universe()) {
            Err(EngineError::Constraint { constraint, .. }) => assert_eq!(constraint, "budget"),
            other => panic!("expected budget conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_sector_ranges_conflict_with_budget() {
        let c = Constraints::default()
            .with_sector_limit("Tech", 0.0, 0.3)
            .with_sector_limit("Energy", 0.0, 0.3);
        assert!(matches!(
            c.resolve(&universe()),
            Err(EngineError::Constraint { .. })
        ));
    }

    #[test]
    fn test_unreachable_esg_is_infeasible() {
        let c = Constraints::default().with_min_esg(90.0);
        match c.resolve(&universe()) {
            Err(EngineError::Constraint { constraint, .. }) => {
                assert_eq!(constraint, "min_esg_score")
            }
            other => panic!("expected ESG conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_min_needs_short_flag() {
        let c = Constraints::default().with_bounds(-0.1, 1.0);
        assert!(matches!(c.resolve(&universe()), Err(EngineError::Config { .. })));
    }

    #[test]
    fn test_report_orders_violations() {
        let set = Constraints::default()
            .with_bounds(0.0, 0.5)
            .with_sector_limit("Tech", 0.0, 0.6)
            .resolve(&universe())
            .unwrap();
        let report = set.check(&[0.7, 0.2, 0.2]);
        assert!(!report.is_satisfied());
        let names: Vec<&str> = report
            .violations
            .iter()
            .map(|v| v.constraint.as_str())
            .collect();
        assert_eq!(names, vec!["max_weight:A", "budget", "sector:Tech"]);
        assert_eq!(report.first_violation().unwrap().constraint, "max_weight:A");
    }

    #[test]
    fn test_turnover_counts_holdings_outside_universe() {
        let mut holdings = PortfolioWeights::new();
        holdings.insert("A".into(), 0.5);
        holdings.insert("ZZZ".into(), 0.5);
        let set = Constraints::default()
            .with_holdings(holdings)
            .with_max_turnover(0.8)
            .resolve(&universe())
            .unwrap();
        let t = set.turnover(&[0.5, 0.5, 0.0]);
        assert!((t - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_check_map_flags_unknown_symbol() {
        let set = Constraints::default().resolve(&universe()).unwrap();
        let mut w = PortfolioWeights::new();
        w.insert("A".into(), 0.5);
        w.insert("B".into(), 0.3);
        w.insert("NOPE".into(), 0.2);
        let report = set.check_map(&w);
        assert_eq!(report.first_violation().unwrap().constraint, "universe:NOPE");
    }
}
