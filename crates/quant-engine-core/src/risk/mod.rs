pub mod metrics;

pub use metrics::{
    compute_risk_metrics, cornish_fisher_z, historical_var_cvar, max_drawdown,
    portfolio_sample_returns, run_risk_metrics, RiskMetrics, RiskMetricsInput, RiskSource,
};
