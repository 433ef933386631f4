use clap::{Args, ValueEnum};
use serde_json::Value;

use quant_engine_core::constraints::{run_check_constraints, ConstraintCheckInput};
use quant_engine_core::optimization::{
    run_optimize, BlackLittermanParams, CvarParams, KellyParams, MeanVarianceParams,
    MultiObjectiveParams, OptimizationMethod, OptimizeInput, RiskParityParams, RobustParams,
    SolverParams, TaxAwareParams,
};
use quant_engine_core::EngineConfig;

use super::read_request;

/// Method selector for the command line; parameters come from the input file.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MethodArg {
    MaxSharpe,
    MeanVariance,
    MinVariance,
    RiskParity,
    Hrp,
    BlackLitterman,
    Cvar,
    Kelly,
    Robust,
    MultiObjective,
    TaxAware,
}

impl MethodArg {
    fn with_defaults(self) -> OptimizationMethod {
        match self {
            MethodArg::MaxSharpe => OptimizationMethod::MaxSharpe,
            MethodArg::MeanVariance => OptimizationMethod::MeanVariance(MeanVarianceParams::default()),
            MethodArg::MinVariance => OptimizationMethod::MinVariance,
            MethodArg::RiskParity => OptimizationMethod::RiskParity(RiskParityParams::default()),
            MethodArg::Hrp => OptimizationMethod::Hrp,
            MethodArg::BlackLitterman => {
                OptimizationMethod::BlackLitterman(BlackLittermanParams::default())
            }
            MethodArg::Cvar => OptimizationMethod::Cvar(CvarParams::default()),
            MethodArg::Kelly => OptimizationMethod::Kelly(KellyParams::default()),
            MethodArg::Robust => OptimizationMethod::Robust(RobustParams::default()),
            MethodArg::MultiObjective => {
                OptimizationMethod::MultiObjective(MultiObjectiveParams::default())
            }
            MethodArg::TaxAware => OptimizationMethod::TaxAware(TaxAwareParams::default()),
        }
    }
}

/// Arguments for portfolio optimization
#[derive(Args)]
pub struct OptimizeArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Method to run with default parameters (overrides the input's method)
    #[arg(long, value_enum)]
    pub method: Option<MethodArg>,

    /// Annual risk-free rate
    #[arg(long)]
    pub risk_free_rate: Option<f64>,

    /// Wall-clock limit for the solve; on expiry the best iterate is returned
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Iteration budget for iterative methods
    #[arg(long)]
    pub max_iterations: Option<usize>,
}

/// Arguments for checking weights against constraints
#[derive(Args)]
pub struct CheckConstraintsArgs {
    /// Path to JSON/YAML input file
    #[arg(long)]
    pub input: Option<String>,
}

pub fn run_optimize_command(
    args: OptimizeArgs,
    engine: &EngineConfig,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request: OptimizeInput = read_request(&args.input, "optimize")?;
    if let Some(method) = args.method {
        request.method = method.with_defaults();
    }
    if let Some(rf) = args.risk_free_rate {
        request.risk_free_rate = Some(rf);
    }
    if args.timeout_ms.is_some() || args.max_iterations.is_some() {
        let mut params = request
            .params
            .take()
            .unwrap_or_else(|| SolverParams::from_config(engine));
        if let Some(ms) = args.timeout_ms {
            params.timeout_ms = Some(ms);
        }
        if let Some(n) = args.max_iterations {
            params.max_iterations = n;
        }
        request.params = Some(params);
    }
    let result = run_optimize(&request, engine)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_check_constraints_command(
    args: CheckConstraintsArgs,
) -> Result<Value, Box<dyn std::error::Error>> {
    let request: ConstraintCheckInput = read_request(&args.input, "check-constraints")?;
    let result = run_check_constraints(&request)?;
    Ok(serde_json::to_value(result)?)
}
