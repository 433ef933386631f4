//! Tax- and turnover-aware overlay on any base method.
//!
//! The base method gives a target. The overlay then minimises tracking
//! variance to that target plus a turnover penalty plus the estimated tax
//! on the sales needed to get there. Sales consume the cheapest lots first,
//! so each asset's tax is a convex piecewise-linear function of the amount
//! sold; it is smoothed with a softplus ramp for the gradient solver.

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{solve_outcome, MethodMetrics, MethodOutcome, OptimizationMethod, Problem};
use crate::constraints::{turnover_between, Constraints};
use crate::error::EngineError;
use crate::math::{mat_vec_multiply, vec_dot};
use crate::types::Money;
use crate::EngineResult;

/// Width of the softplus ramp, in weight units.
const SMOOTHING: f64 = 1e-4;
/// Holding period, in days, beyond which a gain is long-term.
const LONG_TERM_DAYS: i64 = 365;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A purchase lot of a current holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLot {
    pub symbol: String,
    /// Portfolio weight this lot represents at current prices.
    pub weight: f64,
    /// Cost basis over current value. Below 1 is a gain, above 1 a loss.
    pub cost_basis_ratio: f64,
    pub acquired: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxAwareParams {
    pub base: Box<OptimizationMethod>,
    pub lots: Vec<TaxLot>,
    pub short_term_rate: f64,
    pub long_term_rate: f64,
    /// Penalty per unit of one-way turnover.
    pub turnover_penalty: f64,
    /// Multiplier on the tax term.
    pub tax_weight: f64,
    /// Date for holding-period classification. Defaults to today (UTC).
    pub as_of: Option<NaiveDate>,
    pub portfolio_value: Money,
}

impl Default for TaxAwareParams {
    fn default() -> Self {
        Self {
            base: Box::new(OptimizationMethod::MinVariance),
            lots: Vec::new(),
            short_term_rate: 0.37,
            long_term_rate: 0.20,
            turnover_penalty: 0.0005,
            tax_weight: 1.0,
            as_of: None,
            portfolio_value: dec!(1_000_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxAwareMetrics {
    pub base_method: String,
    pub base_weights: BTreeMap<String, f64>,
    pub base_metrics: Option<Box<MethodMetrics>>,
    /// Tax on the required sales, as a fraction of portfolio value.
    pub estimated_tax: f64,
    pub short_term_tax: f64,
    pub long_term_tax: f64,
    /// Net gain realised by the sales, as a fraction of portfolio value.
    pub realized_gain: f64,
    /// Tax the base target alone would have triggered.
    pub base_estimated_tax: f64,
    pub estimated_tax_amount: Money,
    pub portfolio_value: Money,
    pub turnover: f64,
    /// `sqrt((w - target)' Sigma (w - target))`.
    pub tracking_error: f64,
}

/// Tax triggered by moving from holdings to a weight vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub short_term: f64,
    pub long_term: f64,
    pub realized_gain: f64,
}

impl TaxBreakdown {
    pub fn total(&self) -> f64 {
        self.short_term + self.long_term
    }
}

#[derive(Debug, Clone, Copy)]
struct LotSlice {
    size: f64,
    gain: f64,
    rate: f64,
    long_term: bool,
}

impl LotSlice {
    fn slope(&self) -> f64 {
        self.rate * self.gain
    }
}

/// Each asset's lots, cheapest to sell first.
#[derive(Debug, Clone)]
pub struct TaxSchedule {
    assets: Vec<Vec<LotSlice>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl TaxSchedule {
    pub fn new(symbols: &[String], params: &TaxAwareParams, as_of: NaiveDate) -> EngineResult<Self> {
        let mut assets: Vec<Vec<LotSlice>> = vec![Vec::new(); symbols.len()];
        for (k, lot) in params.lots.iter().enumerate() {
            let i = symbols.iter().position(|s| *s == lot.symbol).ok_or_else(|| {
                EngineError::data(
                    format!("lots[{}].symbol", k),
                    format!("'{}' is not in the universe", lot.symbol),
                )
            })?;
            if !lot.weight.is_finite() || lot.weight < 0.0 {
                return Err(EngineError::data(format!("lots[{}].weight", k), "Must be non-negative"));
            }
            if !lot.cost_basis_ratio.is_finite() || lot.cost_basis_ratio < 0.0 {
                return Err(EngineError::data(
                    format!("lots[{}].cost_basis_ratio", k),
                    "Must be non-negative",
                ));
            }
            let held_days = (as_of - lot.acquired).num_days();
            if held_days < 0 {
                return Err(EngineError::data(
                    format!("lots[{}].acquired", k),
                    "Acquired after the as-of date",
                ));
            }
            let long_term = held_days > LONG_TERM_DAYS;
            assets[i].push(LotSlice {
                size: lot.weight,
                gain: 1.0 - lot.cost_basis_ratio,
                rate: if long_term {
                    params.long_term_rate
                } else {
                    params.short_term_rate
                },
                long_term,
            });
        }
        for lots in &mut assets {
            lots.sort_by(|a, b| a.slope().total_cmp(&b.slope()));
        }
        Ok(Self { assets })
    }

    /// Exact tax on selling down from `holdings` to `w`.
    pub fn breakdown(&self, w: &[f64], holdings: &[f64]) -> TaxBreakdown {
        let mut out = TaxBreakdown::default();
        for (i, lots) in self.assets.iter().enumerate() {
            let mut remaining = (holdings[i] - w[i]).max(0.0);
            for lot in lots {
                if remaining <= 0.0 {
                    break;
                }
                let sold = remaining.min(lot.size);
                remaining -= sold;
                let tax = sold * lot.slope();
                out.realized_gain += sold * lot.gain;
                if lot.long_term {
                    out.long_term += tax;
                } else {
                    out.short_term += tax;
                }
            }
        }
        out
    }

    /// Softplus-smoothed tax and its gradient with respect to `w`.
    fn smoothed(&self, w: &[f64], holdings: &[f64]) -> (f64, Vec<f64>) {
        let mut value = 0.0;
        let mut grad = vec![0.0; w.len()];
        for (i, lots) in self.assets.iter().enumerate() {
            let sold = holdings[i] - w[i];
            let mut start = 0.0;
            for lot in lots {
                let end = start + lot.size;
                let slope = lot.slope();
                value += slope * (softplus(sold - start) - softplus(sold - end));
                // d/dw = -d/d(sold)
                grad[i] -= slope * (logistic(sold - start) - logistic(sold - end));
                start = end;
            }
        }
        (value, grad)
    }
}

/// Holdings implied by the lots, for requests that give lots but no holdings.
pub fn holdings_from_lots(lots: &[TaxLot]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for lot in lots {
        *out.entry(lot.symbol.clone()).or_insert(0.0) += lot.weight;
    }
    out
}

/// Constraints for the overlay: lots stand in for missing holdings.
pub(crate) fn with_lot_holdings(constraints: &Constraints, params: &TaxAwareParams) -> Constraints {
    let mut out = constraints.clone();
    if out.current_holdings.is_empty() && !params.lots.is_empty() {
        out.current_holdings = holdings_from_lots(&params.lots);
    }
    out
}

pub(crate) fn solve(problem: &Problem<'_>, params: &TaxAwareParams) -> EngineResult<MethodOutcome> {
    validate(params)?;
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let symbols = &problem.stats.symbols;
    let schedule = TaxSchedule::new(symbols, params, as_of)?;
    let holdings = &problem.set.holdings;

    let mut warnings = Vec::new();
    if !problem.set.has_holdings {
        warnings.push("No current holdings; tax and turnover terms measure from cash".to_string());
    }
    for (symbol, lot_weight) in holdings_from_lots(&params.lots) {
        if let Some(i) = problem.stats.index_of(&symbol) {
            if lot_weight > holdings[i] + 1e-9 {
                warnings.push(format!(
                    "Lots for '{}' total {:.6}, above the holding {:.6}",
                    symbol, lot_weight, holdings[i]
                ));
            }
        }
    }

    let base = solve_outcome(&params.base, problem)?;
    let target = base.weights.clone();
    debug!(base = params.base.name(), "tax-aware overlay tracking base target");

    let penalty = params.turnover_penalty;
    let tax_weight = params.tax_weight;
    let descent = problem.descend_from(holdings, |w| {
        let diff: Vec<f64> = w.iter().zip(target.iter()).map(|(a, b)| a - b).collect();
        let sigma_d = mat_vec_multiply(problem.sigma, &diff);
        let mut value = 0.5 * vec_dot(&diff, &sigma_d);
        let mut grad = sigma_d;

        for i in 0..w.len() {
            let d = w[i] - holdings[i];
            let r = (d * d + SMOOTHING * SMOOTHING).sqrt();
            value += penalty * 0.5 * r;
            grad[i] += penalty * 0.5 * d / r;
        }

        let (tax, tax_grad) = schedule.smoothed(w, holdings);
        value += tax_weight * tax;
        for (g, t) in grad.iter_mut().zip(tax_grad) {
            *g += tax_weight * t;
        }
        (value, grad)
    });

    let status = base.status.combine(descent.status);
    let reason = match (base.reason.clone(), descent.reason.clone()) {
        (Some(b), Some(d)) => Some(format!("{}; {}", b, d)),
        (b, d) => b.or(d),
    };
    let weights = descent.weights;

    let tax = schedule.breakdown(&weights, holdings);
    let base_tax = schedule.breakdown(&target, holdings);
    let tax_fraction = Decimal::from_f64(tax.total()).ok_or_else(|| {
        EngineError::numerical("tax estimate", "Tax estimate is not representable")
    })?;
    let amount = (tax_fraction * params.portfolio_value).round_dp(2);
    let diff: Vec<f64> = weights.iter().zip(target.iter()).map(|(a, b)| a - b).collect();
    let tracking_error = vec_dot(&diff, &mat_vec_multiply(problem.sigma, &diff)).max(0.0).sqrt();
    if tax.total() > 0.0 {
        debug!(estimated_tax = tax.total(), amount = %amount, "tax-aware overlay");
    }
    if status != super::SolveStatus::Converged {
        warn!(?status, "tax-aware overlay did not converge");
    }

    warnings.extend(base.warnings);
    let metrics = TaxAwareMetrics {
        base_method: params.base.name().to_string(),
        base_weights: symbols.iter().cloned().zip(target.iter().copied()).collect(),
        base_metrics: base.method_metrics.map(Box::new),
        estimated_tax: tax.total(),
        short_term_tax: tax.short_term,
        long_term_tax: tax.long_term,
        realized_gain: tax.realized_gain,
        base_estimated_tax: base_tax.total(),
        estimated_tax_amount: amount,
        portfolio_value: params.portfolio_value,
        turnover: turnover_between(&weights, holdings),
        tracking_error,
    };
    Ok(MethodOutcome {
        weights,
        status,
        iterations: base.iterations + descent.iterations,
        reason,
        method_metrics: Some(MethodMetrics::TaxAware(Box::new(metrics))),
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(params: &TaxAwareParams) -> EngineResult<()> {
    if matches!(*params.base, OptimizationMethod::TaxAware(_)) {
        return Err(EngineError::config("base", "Tax-aware overlays cannot be nested"));
    }
    for (field, rate) in [
        ("short_term_rate", params.short_term_rate),
        ("long_term_rate", params.long_term_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(EngineError::config(field, "Must be in [0, 1]"));
        }
    }
    for (field, v) in [
        ("turnover_penalty", params.turnover_penalty),
        ("tax_weight", params.tax_weight),
    ] {
        if !v.is_finite() || v < 0.0 {
            return Err(EngineError::config(field, "Must be non-negative"));
        }
    }
    if params.portfolio_value <= Decimal::ZERO {
        return Err(EngineError::config("portfolio_value", "Must be positive"));
    }
    Ok(())
}

#[inline]
fn softplus(x: f64) -> f64 {
    let z = x / SMOOTHING;
    if z > 0.0 {
        x + SMOOTHING * (-z).exp().ln_1p()
    } else {
        SMOOTHING * z.exp().ln_1p()
    }
}

#[inline]
fn logistic(x: f64) -> f64 {
    let z = x / SMOOTHING;
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::uncorrelated;
    use super::super::{OptimizationResult, SolveStatus, SolverParams};
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lots() -> Vec<TaxLot> {
        vec![
            TaxLot {
                symbol: "A0".to_string(),
                weight: 0.5,
                cost_basis_ratio: 0.4,
                acquired: date(2024, 3, 1),
            },
            TaxLot {
                symbol: "A0".to_string(),
                weight: 0.3,
                cost_basis_ratio: 0.9,
                acquired: date(2020, 1, 15),
            },
            TaxLot {
                symbol: "A1".to_string(),
                weight: 0.2,
                cost_basis_ratio: 1.2,
                acquired: date(2024, 6, 1),
            },
        ]
    }

    fn params(lots: Vec<TaxLot>) -> TaxAwareParams {
        TaxAwareParams {
            lots,
            as_of: Some(date(2024, 12, 31)),
            ..TaxAwareParams::default()
        }
    }

    fn solve(p: TaxAwareParams) -> OptimizationResult {
        let stats = uncorrelated(&[0.08, 0.08, 0.08], &[0.30, 0.15, 0.10]);
        OptimizationMethod::TaxAware(p)
            .solve(&stats, &Constraints::default(), &SolverParams::default())
            .unwrap()
    }

    fn tax_metrics(result: &OptimizationResult) -> &TaxAwareMetrics {
        match &result.method_metrics {
            Some(MethodMetrics::TaxAware(m)) => m,
            other => panic!("unexpected metrics {:?}", other),
        }
    }

    #[test]
    fn test_lots_are_sold_cheapest_first() {
        let symbols: Vec<String> = vec!["A0".into(), "A1".into(), "A2".into()];
        let p = params(lots());
        let schedule = TaxSchedule::new(&symbols, &p, date(2024, 12, 31)).unwrap();
        let holdings = [0.8, 0.2, 0.0];
        // Sell 0.3 of A0: the old lot (long-term, gain 0.1 at 20%) goes first.
        let out = schedule.breakdown(&[0.5, 0.2, 0.3], &holdings);
        assert!((out.long_term - 0.3 * 0.1 * 0.20).abs() < 1e-12);
        assert!(out.short_term.abs() < 1e-12);
        // Selling everything also realises the short-term gain of 0.6 at 37%.
        let all = schedule.breakdown(&[0.0, 0.2, 0.8], &holdings);
        assert!((all.short_term - 0.5 * 0.6 * 0.37).abs() < 1e-12);
    }

    #[test]
    fn test_losses_reduce_tax() {
        let symbols: Vec<String> = vec!["A0".into(), "A1".into(), "A2".into()];
        let schedule = TaxSchedule::new(&symbols, &params(lots()), date(2024, 12, 31)).unwrap();
        let out = schedule.breakdown(&[0.8, 0.0, 0.2], &[0.8, 0.2, 0.0]);
        assert!(out.total() < 0.0);
        assert!(out.realized_gain < 0.0);
    }

    #[test]
    fn test_smoothed_tax_tracks_exact_tax() {
        let symbols: Vec<String> = vec!["A0".into(), "A1".into(), "A2".into()];
        let schedule = TaxSchedule::new(&symbols, &params(lots()), date(2024, 12, 31)).unwrap();
        let holdings = [0.8, 0.2, 0.0];
        let w = [0.4, 0.2, 0.4];
        let (smooth, _) = schedule.smoothed(&w, &holdings);
        let exact = schedule.breakdown(&w, &holdings).total();
        assert!((smooth - exact).abs() < 1e-3);
    }

    #[test]
    fn test_free_trading_reaches_base_target() {
        let result = solve(TaxAwareParams {
            short_term_rate: 0.0,
            long_term_rate: 0.0,
            turnover_penalty: 0.0,
            ..params(lots())
        });
        let m = tax_metrics(&result);
        for (symbol, target) in &m.base_weights {
            assert!((result.weights[symbol] - target).abs() < 1e-3, "{:?}", result.weights);
        }
        assert_eq!(result.status, SolveStatus::Converged);
    }

    #[test]
    fn test_taxes_hold_back_sales() {
        let taxed = solve(params(lots()));
        let m = tax_metrics(&taxed);
        let holdings = [0.8, 0.2, 0.0];
        let base: Vec<f64> = m.base_weights.values().copied().collect();
        assert!(m.turnover < turnover_between(&base, &holdings));
        assert!(m.estimated_tax <= m.base_estimated_tax + 1e-9);
        let expected_amount = (Decimal::from_f64(m.estimated_tax).unwrap() * dec!(1_000_000)).round_dp(2);
        assert_eq!(m.estimated_tax_amount, expected_amount);
        // Lots stood in for the missing holdings.
        assert!(taxed.metrics.turnover.is_some());
    }

    #[test]
    fn test_nested_overlay_rejected() {
        let stats = uncorrelated(&[0.08, 0.08], &[0.3, 0.1]);
        let inner = OptimizationMethod::TaxAware(TaxAwareParams::default());
        let err = OptimizationMethod::TaxAware(TaxAwareParams {
            base: Box::new(inner),
            ..TaxAwareParams::default()
        })
        .solve(&stats, &Constraints::default(), &SolverParams::default())
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_lot_after_as_of_rejected() {
        let symbols: Vec<String> = vec!["A0".into()];
        let p = params(vec![TaxLot {
            symbol: "A0".to_string(),
            weight: 1.0,
            cost_basis_ratio: 0.5,
            acquired: date(2025, 6, 1),
        }]);
        assert!(TaxSchedule::new(&symbols, &p, date(2024, 12, 31)).is_err());
    }
}
