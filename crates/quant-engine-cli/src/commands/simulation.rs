use clap::Args;
use serde_json::Value;

use quant_engine_core::simulation::pricing::{run_price_option, OptionPricingInput};
use quant_engine_core::simulation::stress::{run_stress_test, StressTestInput};
use quant_engine_core::simulation::{run_simulate, SimulateInput};
use quant_engine_core::EngineConfig;

use super::read_request;

/// Arguments for portfolio path simulation
#[derive(Args)]
pub struct SimulateArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Random seed (overrides the input)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of paths (overrides the input)
    #[arg(long)]
    pub paths: Option<usize>,

    /// Number of raw paths to include in the output
    #[arg(long)]
    pub sample_paths: Option<usize>,
}

/// Arguments for Monte Carlo option pricing
#[derive(Args)]
pub struct PriceOptionArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Random seed (overrides the input)
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for stress testing a portfolio
#[derive(Args)]
pub struct StressTestArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,
}

pub fn run_simulate_command(
    args: SimulateArgs,
    engine: &EngineConfig,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request: SimulateInput = read_request(&args.input, "simulate")?;
    if let Some(seed) = args.seed {
        request.simulation.seed = Some(seed);
    }
    if let Some(paths) = args.paths {
        request.simulation.n_paths = paths;
    }
    if let Some(sample) = args.sample_paths {
        request.sample_paths = sample;
    }
    let result = run_simulate(&request, engine)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_price_option_command(
    args: PriceOptionArgs,
    engine: &EngineConfig,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request: OptionPricingInput = read_request(&args.input, "price-option")?;
    if let Some(seed) = args.seed {
        request.simulation.seed = Some(seed);
    }
    let result = run_price_option(&request, engine)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_stress_test_command(
    args: StressTestArgs,
    engine: &EngineConfig,
) -> Result<Value, Box<dyn std::error::Error>> {
    let request: StressTestInput = read_request(&args.input, "stress-test")?;
    let result = run_stress_test(&request, engine)?;
    Ok(serde_json::to_value(result)?)
}
