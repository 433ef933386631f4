use clap::Args;
use serde_json::Value;

use quant_engine_core::statistics::{run_build_statistics, StatisticsInput};

use super::read_request;

/// Arguments for building market statistics
#[derive(Args)]
pub struct StatisticsArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Return observations per year (overrides the input)
    #[arg(long)]
    pub periods_per_year: Option<f64>,
}

pub fn run_statistics(args: StatisticsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request: StatisticsInput = read_request(&args.input, "statistics")?;
    if let Some(ppy) = args.periods_per_year {
        request.options.periods_per_year = ppy;
    }
    let result = run_build_statistics(&request)?;
    Ok(serde_json::to_value(result)?)
}
