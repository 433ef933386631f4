use clap::Args;
use serde_json::Value;

use quant_engine_core::risk::{run_risk_metrics, RiskMetricsInput};
use quant_engine_core::EngineConfig;

/// Arguments for risk metrics over a return sample or weighted assets
#[derive(Args)]
pub struct RiskMetricsArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Comma-separated periodic returns (e.g. "0.01,-0.02,0.005")
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub returns: Option<Vec<f64>>,

    /// Confidence level for VaR/CVaR (defaults to the engine setting)
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Annual risk-free rate
    #[arg(long)]
    pub risk_free_rate: Option<f64>,

    /// Return observations per year
    #[arg(long)]
    pub periods_per_year: Option<f64>,
}

pub fn run_risk_metrics_command(
    args: RiskMetricsArgs,
    engine: &EngineConfig,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request: RiskMetricsInput = match args.returns {
        Some(returns) => RiskMetricsInput {
            returns,
            assets: Vec::new(),
            weights: Default::default(),
            periods_per_year: engine.periods_per_year,
            confidence: engine.default_confidence,
            risk_free_rate: 0.0,
        },
        None => super::read_request(&args.input, "risk-metrics")?,
    };
    if let Some(c) = args.confidence {
        request.confidence = c;
    }
    if let Some(rf) = args.risk_free_rate {
        request.risk_free_rate = rf;
    }
    if let Some(ppy) = args.periods_per_year {
        request.periods_per_year = ppy;
    }
    let result = run_risk_metrics(&request)?;
    Ok(serde_json::to_value(result)?)
}
