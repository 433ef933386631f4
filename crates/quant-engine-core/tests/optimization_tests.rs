#![cfg(feature = "optimization")]

use chrono::{TimeZone, Utc};
use quant_engine_core::constraints::{Constraints, WeightRange};
use quant_engine_core::optimization::{
    optimize, BlackLittermanParams, CvarParams, KellyParams, MeanVarianceParams,
    MultiObjectiveParams, OptimizationMethod, Optimizer, RiskParityParams, RobustParams,
    ScenarioSource, SolveState, SolveStatus, SolverParams, TaxAwareParams, TaxLot, View,
};
use quant_engine_core::statistics::{CovarianceCache, CovarianceMatrix, MarketStatistics};
use quant_engine_core::{AssetSeries, EngineError, PortfolioWeights};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEED: u64 = 42;
const PERIODS: usize = 120;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One-factor monthly return history: `beta * market + idiosyncratic`.
fn universe() -> Vec<AssetSeries> {
    let specs = [
        ("EQ_US", 0.010, 1.1, 0.030, "Equity", 45.0),
        ("EQ_EM", 0.012, 1.4, 0.050, "Equity", 30.0),
        ("CREDIT", 0.005, 0.5, 0.015, "Fixed Income", 60.0),
        ("GOVT", 0.003, 0.1, 0.010, "Fixed Income", 80.0),
        ("GOLD", 0.004, 0.0, 0.040, "Commodity", 55.0),
    ];
    let mut rng = StdRng::seed_from_u64(SEED);
    let market: Vec<f64> = (0..PERIODS).map(|_| uniform_shock(&mut rng, 0.04)).collect();
    specs
        .iter()
        .map(|(symbol, drift, beta, idio, sector, esg)| {
            let returns = market
                .iter()
                .map(|m| drift + beta * m + uniform_shock(&mut rng, *idio))
                .collect();
            AssetSeries::new(*symbol, returns)
                .with_sector(*sector)
                .with_esg_score(*esg)
        })
        .collect()
}

/// Zero-mean shock with standard deviation `scale`.
fn uniform_shock(rng: &mut StdRng, scale: f64) -> f64 {
    (rng.gen::<f64>() - 0.5) * 12f64.sqrt() * scale
}

fn monthly() -> SolverParams {
    SolverParams::default()
}

fn optimizer() -> Optimizer {
    Optimizer::new(monthly()).with_statistics(quant_engine_core::statistics::StatisticsOptions {
        periods_per_year: 12.0,
    })
}

fn all_methods() -> Vec<OptimizationMethod> {
    vec![
        OptimizationMethod::MaxSharpe,
        OptimizationMethod::MeanVariance(MeanVarianceParams::default()),
        OptimizationMethod::MinVariance,
        OptimizationMethod::RiskParity(RiskParityParams::default()),
        OptimizationMethod::Hrp,
        OptimizationMethod::BlackLitterman(BlackLittermanParams::default()),
        OptimizationMethod::Cvar(CvarParams::default()),
        OptimizationMethod::Kelly(KellyParams::default()),
        OptimizationMethod::Robust(RobustParams::default()),
        OptimizationMethod::MultiObjective(MultiObjectiveParams {
            esg_weight: 0.5,
            ..MultiObjectiveParams::default()
        }),
        OptimizationMethod::TaxAware(TaxAwareParams::default()),
    ]
}

fn two_asset_stats(vols: [f64; 2]) -> MarketStatistics {
    let symbols = vec!["LOW".to_string(), "HIGH".to_string()];
    let covariance = CovarianceMatrix::from_correlation(
        symbols.clone(),
        &vols,
        &[vec![1.0, 0.0], vec![0.0, 1.0]],
    )
    .unwrap();
    MarketStatistics {
        symbols,
        expected_returns: vec![0.07, 0.07],
        volatilities: vols.to_vec(),
        covariance,
        sectors: vec![None, None],
        esg_scores: vec![None, None],
        market_caps: vec![None, None],
        scenario_returns: Vec::new(),
        periods_per_year: 252.0,
        warnings: Vec::new(),
    }
}

fn weight_sum(weights: &PortfolioWeights) -> f64 {
    weights.values().sum()
}

// ---------------------------------------------------------------------------
// Common contract
// ---------------------------------------------------------------------------

#[test]
fn test_all_methods_fully_invested_long_only() {
    let assets = universe();
    for method in all_methods() {
        let result = optimizer()
            .optimize(&assets, &Constraints::long_only(), &method)
            .unwrap();
        assert!(
            (weight_sum(&result.weights) - 1.0).abs() < 1e-5,
            "{}: sum {}",
            result.method,
            weight_sum(&result.weights)
        );
        assert!(
            result.weights.values().all(|w| *w >= -1e-6),
            "{}: {:?}",
            result.method,
            result.weights
        );
        assert_eq!(result.weights.len(), assets.len());
        assert!(result.constraints_satisfied, "{}: {:?}", result.method, result.violations);
        assert!(result.metrics.volatility.is_finite() && result.metrics.sharpe_ratio.is_finite());
        assert_eq!(result.diagnostics.state_trace[0], SolveState::Init);
        assert!(result.diagnostics.state_trace.last().unwrap().is_terminal());
    }
}

#[test]
fn test_all_methods_honour_position_and_sector_limits() {
    let assets = universe();
    let constraints = Constraints::long_only()
        .with_bounds(0.02, 0.35)
        .with_sector_limit("Equity", 0.2, 0.5)
        .with_sector_limit("Fixed Income", 0.2, 0.6);
    for method in all_methods() {
        let result = optimizer().optimize(&assets, &constraints, &method).unwrap();
        assert!((weight_sum(&result.weights) - 1.0).abs() < 1e-5, "{}", result.method);
        if result.constraints_satisfied {
            for w in result.weights.values() {
                assert!(*w >= 0.02 - 1e-6 && *w <= 0.35 + 1e-6, "{}: {:?}", result.method, result.weights);
            }
            let equity = result.weights["EQ_US"] + result.weights["EQ_EM"];
            assert!((0.2 - 1e-6..=0.5 + 1e-6).contains(&equity), "{}: {}", result.method, equity);
        } else {
            assert!(result.diagnostics.first_violation.is_some(), "{}", result.method);
        }
    }
}

#[test]
fn test_turnover_limit_against_holdings() {
    let assets = universe();
    let holdings: PortfolioWeights = [("EQ_US", 0.6), ("GOVT", 0.4)]
        .iter()
        .map(|(s, w)| (s.to_string(), *w))
        .collect();
    let constraints = Constraints::long_only()
        .with_holdings(holdings)
        .with_max_turnover(0.15);
    for method in [
        OptimizationMethod::MinVariance,
        OptimizationMethod::MaxSharpe,
        OptimizationMethod::Cvar(CvarParams::default()),
    ] {
        let result = optimizer().optimize(&assets, &constraints, &method).unwrap();
        let turnover = result.metrics.turnover.unwrap();
        assert!(turnover <= 0.15 + 1e-6, "{}: {}", result.method, turnover);
        assert!(result.constraints_satisfied, "{}: {:?}", result.method, result.violations);
    }
}

#[test]
fn test_minimum_esg_score_holds() {
    let result = optimizer()
        .optimize(
            &universe(),
            &Constraints::long_only().with_min_esg(65.0),
            &OptimizationMethod::MaxSharpe,
        )
        .unwrap();
    assert!(result.constraints_satisfied, "{:?}", result.violations);
    assert!(result.metrics.esg_score.unwrap() >= 65.0 - 1e-6);
}

#[test]
fn test_leverage_sets_the_budget() {
    let constraints = Constraints {
        leverage: 1.3,
        allow_short: true,
        min_weight: -0.2,
        max_weight: 0.8,
        ..Constraints::default()
    };
    let result = optimizer()
        .optimize(&universe(), &constraints, &OptimizationMethod::MinVariance)
        .unwrap();
    assert!((weight_sum(&result.weights) - 1.3).abs() < 1e-5);
    assert!(result.weights.values().all(|w| *w >= -0.2 - 1e-6 && *w <= 0.8 + 1e-6));
}

#[test]
fn test_conflicting_sector_bounds_are_constraint_errors() {
    let mut constraints = Constraints::long_only();
    constraints
        .sector_limits
        .insert("Equity".to_string(), WeightRange::new(0.6, 0.4));
    let err = optimizer()
        .optimize(&universe(), &constraints, &OptimizationMethod::MinVariance)
        .unwrap_err();
    match err {
        EngineError::Constraint { constraint, .. } => assert!(constraint.contains("Equity")),
        other => panic!("expected constraint error, got {:?}", other),
    }
}

#[test]
fn test_short_history_is_data_error() {
    let assets = vec![
        AssetSeries::new("A", vec![0.01]),
        AssetSeries::new("B", vec![0.02, 0.01]),
    ];
    let err = optimize(&assets, &Constraints::default(), &OptimizationMethod::MinVariance, &monthly())
        .unwrap_err();
    assert!(matches!(err, EngineError::Data { .. }), "{:?}", err);
}

#[test]
fn test_exhausted_budget_returns_flagged_best_iterate() {
    let params = SolverParams {
        max_iterations: 2,
        tolerance: 1e-15,
        ..SolverParams::default()
    };
    let result = Optimizer::new(params)
        .optimize(&universe(), &Constraints::long_only(), &OptimizationMethod::MaxSharpe)
        .unwrap();
    assert_eq!(result.status, SolveStatus::TimedOut);
    assert_eq!(result.diagnostics.state_trace.last(), Some(&SolveState::TimedOut));
    assert!((weight_sum(&result.weights) - 1.0).abs() < 1e-5);
    assert!(!result.warnings.is_empty());
}

#[test]
fn test_infeasible_cvar_target_is_flagged_not_thrown() {
    let method = OptimizationMethod::Cvar(CvarParams {
        min_return: Some(5.0),
        ..CvarParams::default()
    });
    let result = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &method)
        .unwrap();
    assert_eq!(result.status, SolveStatus::Infeasible);
    assert!(result.diagnostics.reason.is_some());
    assert!((weight_sum(&result.weights) - 1.0).abs() < 1e-5);
}

// ---------------------------------------------------------------------------
// Method properties
// ---------------------------------------------------------------------------

#[test]
fn test_min_variance_prefers_low_volatility_asset() {
    let result = OptimizationMethod::MinVariance
        .solve(&two_asset_stats([0.15, 0.25]), &Constraints::long_only(), &SolverParams::default())
        .unwrap();
    assert!(result.weights["LOW"] > 0.7, "{:?}", result.weights);
    assert!((result.weights["LOW"] - 0.25 * 0.25 / (0.15 * 0.15 + 0.25 * 0.25)).abs() < 1e-4);
}

#[test]
fn test_hrp_diversifies_across_five_assets() {
    let result = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &OptimizationMethod::Hrp)
        .unwrap();
    let held = result.weights.values().filter(|w| **w > 0.01).count();
    assert!(held >= 3, "{:?}", result.weights);
}

#[test]
fn test_bullish_view_raises_weight_over_prior() {
    let mut assets = universe();
    for (asset, cap) in assets.iter_mut().zip([400.0, 150.0, 200.0, 300.0, 100.0]) {
        asset.market_cap = Some(cap);
    }
    let prior = optimizer()
        .optimize(
            &assets,
            &Constraints::long_only(),
            &OptimizationMethod::BlackLitterman(BlackLittermanParams::default()),
        )
        .unwrap();
    let bullish = optimizer()
        .optimize(
            &assets,
            &Constraints::long_only(),
            &OptimizationMethod::BlackLitterman(BlackLittermanParams {
                views: vec![View::Absolute {
                    symbol: "GOLD".to_string(),
                    expected_return: 0.25,
                    confidence: 0.9,
                }],
                ..BlackLittermanParams::default()
            }),
        )
        .unwrap();
    assert!(
        bullish.weights["GOLD"] > prior.weights["GOLD"],
        "prior {:?} bullish {:?}",
        prior.weights,
        bullish.weights
    );
}

#[test]
fn test_robust_worst_case_below_nominal() {
    let assets = universe();
    for epsilon in [0.25, 1.0, 2.0] {
        let result = optimizer()
            .optimize(
                &assets,
                &Constraints::long_only(),
                &OptimizationMethod::Robust(RobustParams {
                    epsilon,
                    ..RobustParams::default()
                }),
            )
            .unwrap();
        let json = serde_json::to_value(&result.method_metrics).unwrap();
        let nominal = json["nominal_return"].as_f64().unwrap();
        let worst = json["worst_case_return"].as_f64().unwrap();
        assert!(worst <= nominal, "eps {}: {} > {}", epsilon, worst, nominal);
    }
}

#[test]
fn test_cvar_with_simulated_scenarios() {
    let method = OptimizationMethod::Cvar(CvarParams {
        scenarios: ScenarioSource::Simulated {
            n_paths: 500,
            horizon_years: 1.0 / 12.0,
            seed: Some(SEED),
        },
        ..CvarParams::default()
    });
    let first = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &method)
        .unwrap();
    let second = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &method)
        .unwrap();
    assert_eq!(first.weights, second.weights);
    let json = serde_json::to_value(&first.method_metrics).unwrap();
    assert!(json["cvar"].as_f64().unwrap() >= json["var"].as_f64().unwrap() - 1e-12);
}

#[test]
fn test_tax_overlay_reduces_trading_from_lots() {
    let lots = vec![
        TaxLot {
            symbol: "EQ_US".to_string(),
            weight: 0.7,
            cost_basis_ratio: 0.4,
            acquired: chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        },
        TaxLot {
            symbol: "GOVT".to_string(),
            weight: 0.3,
            cost_basis_ratio: 1.0,
            acquired: chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        },
    ];
    let taxed = OptimizationMethod::TaxAware(TaxAwareParams {
        lots,
        as_of: chrono::NaiveDate::from_ymd_opt(2025, 1, 1),
        ..TaxAwareParams::default()
    });
    let base = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &OptimizationMethod::MinVariance)
        .unwrap();
    let result = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &taxed)
        .unwrap();
    assert!(result.constraints_satisfied);
    assert!(result.weights["EQ_US"] > base.weights["EQ_US"], "{:?}", result.weights);
    assert!(result.metrics.turnover.is_some());
}

#[test]
fn test_multi_objective_esg_tilt() {
    let assets = universe();
    let plain = optimizer()
        .optimize(
            &assets,
            &Constraints::long_only(),
            &OptimizationMethod::MultiObjective(MultiObjectiveParams::default()),
        )
        .unwrap();
    let green = optimizer()
        .optimize(
            &assets,
            &Constraints::long_only(),
            &OptimizationMethod::MultiObjective(MultiObjectiveParams {
                esg_weight: 2.0,
                ..MultiObjectiveParams::default()
            }),
        )
        .unwrap();
    assert!(green.metrics.esg_score.unwrap() > plain.metrics.esg_score.unwrap());
}

// ---------------------------------------------------------------------------
// Cache and serialization
// ---------------------------------------------------------------------------

#[test]
fn test_cached_statistics_give_identical_results() {
    let cache = CovarianceCache::new(4);
    let as_of = Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap();
    let assets = universe();
    let first = optimizer()
        .optimize_cached(&assets, &Constraints::long_only(), &OptimizationMethod::MinVariance, &cache, as_of)
        .unwrap();
    let second = optimizer()
        .optimize_cached(&assets, &Constraints::long_only(), &OptimizationMethod::MinVariance, &cache, as_of)
        .unwrap();
    assert_eq!(first.weights, second.weights);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_result_serializes_with_tagged_metrics() {
    let result = optimizer()
        .optimize(&universe(), &Constraints::long_only(), &OptimizationMethod::Hrp)
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["method"], "hrp");
    assert_eq!(json["status"], "converged");
    assert_eq!(json["method_metrics"]["kind"], "hrp");
    assert_eq!(json["method_metrics"]["order"].as_array().unwrap().len(), 5);
    assert!(json["diagnostics"]["solve_time_us"].is_u64());
}
